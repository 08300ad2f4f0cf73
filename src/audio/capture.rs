/// Background sampling loop that turns microphone windows into jump events
use log::{debug, error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::audio::analyzer::JumpSignalAnalyzer;
use crate::utils::now_millis;

/// Errors that can occur while opening or reading the capture device
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No input device available")]
    NoInputDevice,

    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to open capture stream: {0}")]
    Stream(String),

    #[error("Capture stream closed")]
    Closed,

    #[error("Capture thread error: {0}")]
    Thread(String),
}

/// Something that can open a capture stream, e.g. the default microphone
pub trait SampleSource: Send + Sync + 'static {
    /// Open and start a stream. Called on the capture thread, which owns the
    /// returned stream until it is dropped.
    fn open(&self) -> Result<Box<dyn SampleStream>, AudioError>;
}

/// An open capture stream. Dropping it releases the device.
pub trait SampleStream {
    /// Samples per analysis window
    fn window_size(&self) -> usize;

    /// Blocking read of up to `buf.len()` samples
    ///
    /// Must return within a short bounded time (0 samples on timeout) so the
    /// loop can observe a stop request.
    fn read(&mut self, buf: &mut [i16]) -> Result<usize, AudioError>;
}

/// One registered jump, timestamped with host time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpEvent {
    pub at_ms: i64,
}

/// Owns the capture thread and the analyzer it feeds
///
/// Detections are sent as `JumpEvent`s; the receiver side owns the count.
pub struct AudioCaptureLoop {
    source: Arc<dyn SampleSource>,
    analyzer: Arc<Mutex<JumpSignalAnalyzer>>,
    jumps: mpsc::UnboundedSender<JumpEvent>,
    running: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl AudioCaptureLoop {
    pub fn new(
        source: Arc<dyn SampleSource>,
        analyzer: JumpSignalAnalyzer,
    ) -> (Self, mpsc::UnboundedReceiver<JumpEvent>) {
        let (jumps, jumps_rx) = mpsc::unbounded_channel();
        let capture = Self {
            source,
            analyzer: Arc::new(Mutex::new(analyzer)),
            jumps,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        };
        (capture, jumps_rx)
    }

    /// `false` once the sampling thread has exited, even after a read error
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Open the capture stream and start the sampling thread
    ///
    /// Does nothing if already running. If the device cannot be opened the
    /// thread releases whatever it acquired and the loop stays stopped.
    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.is_running() {
            return Ok(());
        }
        // A thread that died on a read error is collected before reopening.
        self.stop();

        // Fresh flag per run so a previous loop can never see it flip back.
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        let worker = {
            let source = Arc::clone(&self.source);
            let analyzer = Arc::clone(&self.analyzer);
            let jumps = self.jumps.clone();
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("jump-capture".to_string())
                .spawn(move || sampling_loop(source, analyzer, jumps, running, ready_tx))
                .map_err(|e| AudioError::Thread(e.to_string()))?
        };

        match ready_rx.recv() {
            Ok(Ok(window)) => {
                self.running = running;
                self.worker = Some(worker);
                info!("Jump detection started ({} sample window)", window);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = worker.join();
                error!("Audio capture failed to initialize: {}", e);
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                error!("Audio capture thread exited during start");
                Err(AudioError::Thread(
                    "capture thread exited during start".to_string(),
                ))
            }
        }
    }

    /// Stop sampling and release the device
    ///
    /// Blocks until the capture thread has exited; no read happens afterwards.
    /// The analyzer's current streak ends here, so a gap spanning a stop is
    /// never counted as active jumping time.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Jump capture thread panicked");
            }
            lock(&self.analyzer).end_streak();
            info!("Jump detection stopped");
        }
    }

    /// Clear cooldown and active-time state before a new session
    pub fn reset_count(&self) {
        lock(&self.analyzer).reset();
    }

    pub fn set_threshold(&self, threshold: i32) {
        lock(&self.analyzer).set_threshold(threshold);
    }

    pub fn threshold(&self) -> i32 {
        lock(&self.analyzer).threshold()
    }

    pub fn active_jump_time_ms(&self) -> i64 {
        lock(&self.analyzer).active_jump_time_ms()
    }
}

impl Drop for AudioCaptureLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock(analyzer: &Mutex<JumpSignalAnalyzer>) -> MutexGuard<'_, JumpSignalAnalyzer> {
    analyzer.lock().unwrap_or_else(PoisonError::into_inner)
}

fn sampling_loop(
    source: Arc<dyn SampleSource>,
    analyzer: Arc<Mutex<JumpSignalAnalyzer>>,
    jumps: mpsc::UnboundedSender<JumpEvent>,
    running: Arc<AtomicBool>,
    ready: crossbeam_channel::Sender<Result<usize, AudioError>>,
) {
    let mut stream = match source.open() {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let mut window = vec![0i16; stream.window_size().max(1)];
    let _ = ready.send(Ok(window.len()));

    while running.load(Ordering::Acquire) {
        let read = match stream.read(&mut window) {
            Ok(read) => read,
            Err(e) => {
                error!("Audio read failed: {}", e);
                break;
            }
        };
        if read == 0 {
            continue;
        }

        let now = now_millis();
        let detected = lock(&analyzer).process(&window[..read], now);
        if detected && jumps.send(JumpEvent { at_ms: now }).is_err() {
            debug!("Jump receiver dropped, ending capture");
            break;
        }
    }

    drop(stream);
    debug!("Capture stream released");
}
