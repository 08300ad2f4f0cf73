/// Workout session orchestrator
///
/// A single tokio task owns the session. Commands, countdown and elapsed
/// ticks, jump events from the capture loop and heart-rate notifications are
/// all handled inside that task's select loop, so session state has exactly
/// one writer. Timers live in the task as `Option<Interval>`; clearing the
/// option inside a command handler cancels them before the command is
/// acknowledged.
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, Interval, MissedTickBehavior};

use crate::audio::{AudioCaptureLoop, JumpEvent};
use crate::bluetooth::SensorHandle;
use crate::database::WorkoutRepository;
use crate::utils::{format_datetime, format_elapsed, millis_to_datetime, now_millis};
use crate::workout::recorder::{RecorderMessage, SessionRecorder};
use crate::workout::summary::{compute_summary, WorkoutSummary};

pub const COUNTDOWN_SECONDS: u8 = 5;
pub const SAMPLE_EVERY_SECONDS: u64 = 5;
const CUE_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Countdown,
    Active,
    Paused,
    Stopped,
}

/// Timer settings; the defaults are a 5 s countdown, 1 Hz ticks and a sample
/// every 5 elapsed seconds
#[derive(Debug, Clone)]
pub struct SessionTiming {
    pub countdown_seconds: u8,
    pub tick: Duration,
    pub sample_every_ticks: u64,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            countdown_seconds: COUNTDOWN_SECONDS,
            tick: Duration::from_secs(1),
            sample_every_ticks: SAMPLE_EVERY_SECONDS,
        }
    }
}

/// Heart-rate feeds the session listens to
pub struct SessionInputs {
    /// Every decoded notification
    pub heart_rates: broadcast::Receiver<u16>,
    /// Latest value, used for periodic samples
    pub current_heart_rate: watch::Receiver<Option<u16>>,
}

impl SessionInputs {
    pub fn from_sensor(sensor: &SensorHandle) -> Self {
        Self {
            heart_rates: sensor.subscribe_heart_rate(),
            current_heart_rate: sensor.heart_rate(),
        }
    }
}

#[derive(Debug, Default)]
struct WorkoutSession {
    state: SessionState,
    start_time_millis: i64,
    elapsed_seconds: u64,
    heart_rate_readings: Vec<u16>,
    jump_count: u32,
    jump_active_time_ms: i64,
    countdown_remaining: u8,
}

enum Command {
    Start(oneshot::Sender<bool>),
    Pause(oneshot::Sender<bool>),
    Resume(oneshot::Sender<bool>),
    Stop(oneshot::Sender<Option<WorkoutSummary>>),
    SetThreshold(i32),
    SetCueInterval(u32),
    DismissSummary,
    Shutdown(oneshot::Sender<Option<WorkoutSummary>>),
}

struct Observers {
    state: watch::Sender<SessionState>,
    countdown: watch::Sender<Option<u8>>,
    elapsed: watch::Sender<u64>,
    jump_count: watch::Sender<u32>,
    jumps_per_minute: watch::Sender<f64>,
    summary: watch::Sender<Option<WorkoutSummary>>,
    cues: broadcast::Sender<u32>,
}

/// Client handle to a running orchestrator
pub struct WorkoutHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    countdown: watch::Receiver<Option<u8>>,
    elapsed: watch::Receiver<u64>,
    jump_count: watch::Receiver<u32>,
    jumps_per_minute: watch::Receiver<f64>,
    summary: watch::Receiver<Option<WorkoutSummary>>,
    cues: broadcast::Sender<u32>,
    task: JoinHandle<()>,
}

impl WorkoutHandle {
    /// Begin the countdown. `false` unless the session was idle.
    pub async fn start_workout(&self) -> bool {
        self.request(Command::Start).await.unwrap_or(false)
    }

    pub async fn pause_workout(&self) -> bool {
        self.request(Command::Pause).await.unwrap_or(false)
    }

    pub async fn resume_workout(&self) -> bool {
        self.request(Command::Resume).await.unwrap_or(false)
    }

    /// Stop the session; returns the summary if any time had elapsed
    pub async fn stop_workout(&self) -> Option<WorkoutSummary> {
        self.request(Command::Stop).await.flatten()
    }

    pub fn set_threshold(&self, threshold: i32) {
        let _ = self.commands.send(Command::SetThreshold(threshold));
    }

    /// Cue every `interval` jumps; 0 turns cues off
    pub fn set_cue_interval(&self, interval: u32) {
        let _ = self.commands.send(Command::SetCueInterval(interval));
    }

    /// Jump count at each cue
    pub fn subscribe_cues(&self) -> broadcast::Receiver<u32> {
        self.cues.subscribe()
    }

    pub fn dismiss_summary(&self) {
        let _ = self.commands.send(Command::DismissSummary);
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn countdown(&self) -> watch::Receiver<Option<u8>> {
        self.countdown.clone()
    }

    pub fn elapsed_seconds(&self) -> watch::Receiver<u64> {
        self.elapsed.clone()
    }

    pub fn jump_count(&self) -> watch::Receiver<u32> {
        self.jump_count.clone()
    }

    /// Jumps per minute of elapsed time, updated every tick
    pub fn jumps_per_minute(&self) -> watch::Receiver<f64> {
        self.jumps_per_minute.clone()
    }

    pub fn summary(&self) -> watch::Receiver<Option<WorkoutSummary>> {
        self.summary.clone()
    }

    /// Stop any running session, flush persistence and end the task
    pub async fn shutdown(self) -> Option<WorkoutSummary> {
        let summary = self.request(Command::Shutdown).await.flatten();
        if let Err(e) = self.task.await {
            error!("Workout task failed: {}", e);
        }
        summary
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(command(tx)).is_err() {
            warn!("Workout task is not running");
            return None;
        }
        rx.await.ok()
    }
}

pub struct WorkoutSessionOrchestrator {
    session: WorkoutSession,
    timing: SessionTiming,
    capture: AudioCaptureLoop,
    jumps: mpsc::UnboundedReceiver<JumpEvent>,
    heart_rates: broadcast::Receiver<u16>,
    heart_rates_open: bool,
    current_heart_rate: watch::Receiver<Option<u16>>,
    recorder: mpsc::UnboundedSender<RecorderMessage>,
    recorder_task: JoinHandle<()>,
    countdown_timer: Option<Interval>,
    elapsed_timer: Option<Interval>,
    cue_interval: u32,
    observers: Observers,
}

impl WorkoutSessionOrchestrator {
    /// Spawn the orchestrator on the current tokio runtime
    pub fn spawn(
        capture: (AudioCaptureLoop, mpsc::UnboundedReceiver<JumpEvent>),
        inputs: SessionInputs,
        repository: Arc<dyn WorkoutRepository>,
        timing: SessionTiming,
    ) -> WorkoutHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (countdown_tx, countdown_rx) = watch::channel(None);
        let (elapsed_tx, elapsed_rx) = watch::channel(0);
        let (jump_count_tx, jump_count_rx) = watch::channel(0);
        let (jpm_tx, jpm_rx) = watch::channel(0.0);
        let (summary_tx, summary_rx) = watch::channel(None);
        let (cues_tx, _) = broadcast::channel(CUE_CAPACITY);
        let (recorder, recorder_task) = SessionRecorder::spawn(repository);
        let (capture, jumps) = capture;

        let orchestrator = WorkoutSessionOrchestrator {
            session: WorkoutSession::default(),
            timing,
            capture,
            jumps,
            heart_rates: inputs.heart_rates,
            heart_rates_open: true,
            current_heart_rate: inputs.current_heart_rate,
            recorder,
            recorder_task,
            countdown_timer: None,
            elapsed_timer: None,
            cue_interval: 0,
            observers: Observers {
                state: state_tx,
                countdown: countdown_tx,
                elapsed: elapsed_tx,
                jump_count: jump_count_tx,
                jumps_per_minute: jpm_tx,
                summary: summary_tx,
                cues: cues_tx.clone(),
            },
        };
        let task = tokio::spawn(orchestrator.run(commands_rx));

        WorkoutHandle {
            commands: commands_tx,
            state: state_rx,
            countdown: countdown_rx,
            elapsed: elapsed_rx,
            jump_count: jump_count_rx,
            jumps_per_minute: jpm_rx,
            summary: summary_rx,
            cues: cues_tx,
            task,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle(command) {
                            break;
                        }
                    }
                    None => {
                        self.stop_workout();
                        break;
                    }
                },
                _ = next_tick(&mut self.countdown_timer) => self.on_countdown_tick(),
                _ = next_tick(&mut self.elapsed_timer) => self.on_elapsed_tick(),
                Some(event) = self.jumps.recv() => self.on_jump(event),
                result = self.heart_rates.recv(), if self.heart_rates_open => {
                    self.on_heart_rate(result)
                }
            }
        }

        self.capture.stop();
        // Closing the queue lets the recorder drain and exit.
        let WorkoutSessionOrchestrator {
            recorder,
            recorder_task,
            ..
        } = self;
        drop(recorder);
        if let Err(e) = recorder_task.await {
            error!("Session recorder failed: {}", e);
        }
        info!("Workout orchestrator stopped");
    }

    /// Returns `false` once the orchestrator should exit
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Start(reply) => {
                let _ = reply.send(self.start_workout());
            }
            Command::Pause(reply) => {
                let _ = reply.send(self.pause_workout());
            }
            Command::Resume(reply) => {
                let _ = reply.send(self.resume_workout());
            }
            Command::Stop(reply) => {
                let _ = reply.send(self.stop_workout());
            }
            Command::SetThreshold(threshold) => {
                info!("Jump threshold set to {}", threshold);
                self.capture.set_threshold(threshold);
            }
            Command::SetCueInterval(interval) => {
                info!("Jump cue interval set to {}", interval);
                self.cue_interval = interval;
            }
            Command::DismissSummary => {
                self.observers.summary.send_replace(None);
            }
            Command::Shutdown(reply) => {
                let _ = reply.send(self.stop_workout());
                return false;
            }
        }
        true
    }

    fn set_state(&mut self, state: SessionState) {
        debug!("Session state {:?} -> {:?}", self.session.state, state);
        self.session.state = state;
        self.observers.state.send_replace(state);
    }

    fn start_workout(&mut self) -> bool {
        if self.session.state != SessionState::Idle {
            warn!("Cannot start workout while {:?}", self.session.state);
            return false;
        }

        self.session = WorkoutSession::default();
        self.capture.reset_count();
        // Anything still queued belongs to the previous session.
        while self.jumps.try_recv().is_ok() {}
        self.observers.elapsed.send_replace(0);
        self.observers.jump_count.send_replace(0);
        self.observers.jumps_per_minute.send_replace(0.0);

        info!("Workout starting");
        self.set_state(SessionState::Countdown);
        self.session.countdown_remaining = self.timing.countdown_seconds;

        if self.session.countdown_remaining == 0 {
            self.begin_active();
        } else {
            self.observers
                .countdown
                .send_replace(Some(self.session.countdown_remaining));
            self.countdown_timer = Some(self.new_timer());
        }
        true
    }

    fn on_countdown_tick(&mut self) {
        if self.session.state != SessionState::Countdown {
            self.countdown_timer = None;
            return;
        }

        self.session.countdown_remaining = self.session.countdown_remaining.saturating_sub(1);
        if self.session.countdown_remaining > 0 {
            self.observers
                .countdown
                .send_replace(Some(self.session.countdown_remaining));
            return;
        }

        self.countdown_timer = None;
        self.begin_active();
    }

    fn begin_active(&mut self) {
        self.observers.countdown.send_replace(None);
        self.session.start_time_millis = now_millis();
        self.set_state(SessionState::Active);
        self.start_capture();
        self.elapsed_timer = Some(self.new_timer());
        info!(
            "Workout active, started at {}",
            format_datetime(&millis_to_datetime(self.session.start_time_millis))
        );
    }

    fn pause_workout(&mut self) -> bool {
        if self.session.state != SessionState::Active {
            return false;
        }
        self.elapsed_timer = None;
        self.capture.stop();
        self.drain_jumps();
        self.set_state(SessionState::Paused);
        info!(
            "Workout paused at {}",
            format_elapsed(self.session.elapsed_seconds)
        );
        true
    }

    fn resume_workout(&mut self) -> bool {
        if self.session.state != SessionState::Paused {
            return false;
        }
        self.set_state(SessionState::Active);
        self.start_capture();
        self.elapsed_timer = Some(self.new_timer());
        info!("Workout resumed");
        true
    }

    fn stop_workout(&mut self) -> Option<WorkoutSummary> {
        if !matches!(
            self.session.state,
            SessionState::Countdown | SessionState::Active | SessionState::Paused
        ) {
            return None;
        }

        self.countdown_timer = None;
        self.elapsed_timer = None;
        self.capture.stop();
        self.drain_jumps();
        self.observers.countdown.send_replace(None);
        self.set_state(SessionState::Stopped);

        let duration = self.session.elapsed_seconds;
        let summary = if duration > 0 {
            let summary = compute_summary(
                duration,
                &self.session.heart_rate_readings,
                self.session.jump_count,
                self.session.jump_active_time_ms,
            );
            info!(
                "Workout finished: {} elapsed, avg HR {:?}, jumps {:?}",
                format_elapsed(duration),
                summary.avg_heart_rate,
                summary.jump_count
            );
            self.record(RecorderMessage::Finish {
                session_start: self.session.start_time_millis,
                summary: summary.clone(),
            });
            self.observers.summary.send_replace(Some(summary.clone()));
            Some(summary)
        } else {
            info!("Workout stopped before any time elapsed, nothing saved");
            None
        };

        self.set_state(SessionState::Idle);
        summary
    }

    fn on_elapsed_tick(&mut self) {
        if self.session.state != SessionState::Active {
            self.elapsed_timer = None;
            return;
        }

        self.session.elapsed_seconds += 1;
        let elapsed = self.session.elapsed_seconds;
        self.observers.elapsed.send_replace(elapsed);
        self.observers
            .jumps_per_minute
            .send_replace(self.session.jump_count as f64 / (elapsed as f64 / 60.0));

        if self.timing.sample_every_ticks > 0 && elapsed % self.timing.sample_every_ticks == 0 {
            let heart_rate = *self.current_heart_rate.borrow();
            self.record(RecorderMessage::Sample {
                session_start: self.session.start_time_millis,
                elapsed_seconds: elapsed,
                timestamp_millis: now_millis(),
                heart_rate,
                jump_count: self.session.jump_count,
            });
        }
    }

    fn on_jump(&mut self, event: JumpEvent) {
        if self.session.state != SessionState::Active {
            debug!("Dropping jump at {} outside an active session", event.at_ms);
            return;
        }
        self.count_jump();
    }

    fn count_jump(&mut self) {
        self.session.jump_count += 1;
        self.session.jump_active_time_ms = self.capture.active_jump_time_ms();
        self.observers.jump_count.send_replace(self.session.jump_count);

        let count = self.session.jump_count;
        if self.cue_interval > 0 && count % self.cue_interval == 0 {
            debug!("Jump cue at {}", count);
            // No listeners is fine.
            let _ = self.observers.cues.send(count);
        }
    }

    /// Count jumps the capture loop queued before it was stopped
    fn drain_jumps(&mut self) {
        while self.jumps.try_recv().is_ok() {
            self.count_jump();
        }
        self.session.jump_active_time_ms = self.capture.active_jump_time_ms();
    }

    fn on_heart_rate(&mut self, result: Result<u16, RecvError>) {
        match result {
            Ok(bpm) => {
                if self.session.state == SessionState::Active {
                    self.session.heart_rate_readings.push(bpm);
                }
            }
            Err(RecvError::Lagged(missed)) => {
                warn!("Missed {} heart-rate readings", missed);
            }
            Err(RecvError::Closed) => {
                info!("Heart-rate feed closed");
                self.heart_rates_open = false;
            }
        }
    }

    fn start_capture(&mut self) {
        // Heart-rate tracking carries on without jump detection.
        if let Err(e) = self.capture.start() {
            warn!("Jump detection unavailable: {}", e);
        }
    }

    fn record(&self, message: RecorderMessage) {
        if self.recorder.send(message).is_err() {
            error!("Session recorder is gone, dropping write");
        }
    }

    fn new_timer(&self) -> Interval {
        let mut timer = interval_at(Instant::now() + self.timing.tick, self.timing.tick);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
