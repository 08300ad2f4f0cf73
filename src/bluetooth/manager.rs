/// Sensor connection manager: runs the connection state machine as a tokio task
///
/// Commands from the application and events from the transport are funnelled
/// into one task, so every transition is applied in order. Observers read
/// connection state, the latest heart rate and the scan list through `watch`
/// channels; each decoded heart-rate notification is also broadcast.
use log::{debug, error, info};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::bluetooth::machine::{Action, ConnectionMachine, ConnectionState, Input, LinkFailure};
use crate::bluetooth::transport::{EventSink, ScannedDevice, Transport, TransportEvent};

const BROADCAST_CAPACITY: usize = 64;

#[derive(Debug)]
enum Command {
    Step(Input),
    Shutdown,
}

/// Client handle to a running sensor connection manager
pub struct SensorHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    heart_rate: watch::Receiver<Option<u16>>,
    scanned: watch::Receiver<Vec<ScannedDevice>>,
    samples: broadcast::Sender<u16>,
    failures: broadcast::Sender<LinkFailure>,
    task: JoinHandle<()>,
}

impl SensorHandle {
    pub fn start_scan(&self) {
        self.send(Input::StartScan);
    }

    pub fn stop_scan(&self) {
        self.send(Input::StopScan);
    }

    pub fn connect_to_device(&self, device: ScannedDevice) {
        self.send(Input::Connect(device));
    }

    pub fn disconnect(&self) {
        self.send(Input::Disconnect);
    }

    /// Current connection state plus every later change
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Latest decoded heart rate, `None` while disconnected
    pub fn heart_rate(&self) -> watch::Receiver<Option<u16>> {
        self.heart_rate.clone()
    }

    pub fn scanned_devices(&self) -> watch::Receiver<Vec<ScannedDevice>> {
        self.scanned.clone()
    }

    /// Every decoded heart-rate notification, including repeated values
    pub fn subscribe_heart_rate(&self) -> broadcast::Receiver<u16> {
        self.samples.subscribe()
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<LinkFailure> {
        self.failures.subscribe()
    }

    /// Disconnect, release the transport and wait for the manager task to exit
    pub async fn shutdown(self) {
        self.send(Input::Disconnect);
        let _ = self.commands.send(Command::Shutdown);
        if let Err(e) = self.task.await {
            error!("Sensor manager task failed: {}", e);
        }
    }

    fn send(&self, input: Input) {
        if self.commands.send(Command::Step(input)).is_err() {
            debug!("Sensor manager already stopped");
        }
    }
}

pub struct SensorConnectionManager<T: Transport> {
    machine: ConnectionMachine,
    transport: T,
    events_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    state_tx: watch::Sender<ConnectionState>,
    heart_rate_tx: watch::Sender<Option<u16>>,
    scanned_tx: watch::Sender<Vec<ScannedDevice>>,
    samples_tx: broadcast::Sender<u16>,
    failures_tx: broadcast::Sender<LinkFailure>,
}

impl<T: Transport> SensorConnectionManager<T> {
    /// Spawn the manager on the current tokio runtime
    pub fn spawn(transport: T) -> SensorHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (heart_rate_tx, heart_rate_rx) = watch::channel(None);
        let (scanned_tx, scanned_rx) = watch::channel(Vec::new());
        let (samples_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (failures_tx, _) = broadcast::channel(BROADCAST_CAPACITY);

        let manager = SensorConnectionManager {
            machine: ConnectionMachine::new(),
            transport,
            events_tx,
            state_tx,
            heart_rate_tx,
            scanned_tx,
            samples_tx: samples_tx.clone(),
            failures_tx: failures_tx.clone(),
        };
        let task = tokio::spawn(manager.run(commands_rx, events_rx));

        SensorHandle {
            commands: commands_tx,
            state: state_rx,
            heart_rate: heart_rate_rx,
            scanned: scanned_rx,
            samples: samples_tx,
            failures: failures_tx,
            task,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
    ) {
        loop {
            // Commands first so a disconnect beats any event already queued.
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Step(input)) => self.apply(input),
                    Some(Command::Shutdown) | None => break,
                },
                Some((link, event)) = events.recv() => {
                    self.apply(Input::Transport { link, event });
                }
            }
        }

        self.transport.stop_discovery();
        self.transport.release();
        info!("Sensor connection manager stopped");
    }

    fn apply(&mut self, input: Input) {
        let actions = self.machine.step(input);
        for action in actions {
            self.perform(action);
        }
        self.publish();
    }

    fn perform(&mut self, action: Action) {
        match action {
            Action::StartDiscovery => self
                .transport
                .start_discovery(EventSink::new(0, self.events_tx.clone())),
            Action::StopDiscovery => self.transport.stop_discovery(),
            Action::Connect { device, link } => self
                .transport
                .connect(&device, EventSink::new(link, self.events_tx.clone())),
            Action::Subscribe { link } => self
                .transport
                .subscribe(EventSink::new(link, self.events_tx.clone())),
            Action::Release => self.transport.release(),
            Action::PublishHeartRate(bpm) => {
                // No subscribers is fine.
                let _ = self.samples_tx.send(bpm);
            }
            Action::Report(failure) => {
                let _ = self.failures_tx.send(failure);
            }
        }
    }

    fn publish(&self) {
        let state = self.machine.state();
        self.state_tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });

        let heart_rate = self.machine.heart_rate();
        self.heart_rate_tx.send_if_modified(|current| {
            let changed = *current != heart_rate;
            *current = heart_rate;
            changed
        });

        let scanned = self.machine.scanned_devices();
        self.scanned_tx.send_if_modified(|current| {
            if current.as_slice() == scanned {
                return false;
            }
            *current = scanned.to_vec();
            true
        });
    }
}
