/// Transport seam between the connection state machine and the BLE stack
use bluer::Address;
use log::debug;
use thiserror::Error;
use tokio::sync::mpsc;

/// A heart-rate peripheral found during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedDevice {
    pub name: String,
    /// Upper-case `AA:BB:CC:DD:EE:FF`; the device identity
    pub address: String,
    pub handle: Address,
}

impl ScannedDevice {
    pub fn new(name: impl Into<String>, handle: Address) -> Self {
        Self {
            name: name.into(),
            address: handle.to_string().to_uppercase(),
            handle,
        }
    }
}

/// Why service discovery or subscription did not produce a notification stream
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("Heart Rate service not found")]
    ServiceNotFound,

    #[error("Heart Rate Measurement characteristic not found")]
    CharacteristicNotFound,

    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
}

impl From<bluer::Error> for DiscoveryError {
    fn from(e: bluer::Error) -> Self {
        DiscoveryError::Bluetooth(e.to_string())
    }
}

/// Everything the BLE stack reports back asynchronously
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    DeviceDiscovered(ScannedDevice),
    ScanFailed(String),
    Connected,
    Disconnected,
    Subscribed,
    DiscoveryFailed(DiscoveryError),
    Notification(Vec<u8>),
}

/// Handle the transport uses to push events to the connection manager
///
/// Each connection attempt gets its own `link` id so events from a released
/// link can be told apart from the current one. Scan events use link 0.
#[derive(Debug, Clone)]
pub struct EventSink {
    link: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl EventSink {
    pub fn new(link: u64, tx: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { link, tx }
    }

    pub fn link(&self) -> u64 {
        self.link
    }

    pub fn emit(&self, event: TransportEvent) {
        if self.tx.send((self.link, event)).is_err() {
            debug!("Connection manager gone, dropping transport event");
        }
    }
}

/// Non-blocking BLE operations driven by the connection manager
///
/// Every method returns immediately; results arrive later through the
/// supplied `EventSink`.
pub trait Transport: Send + 'static {
    /// Begin discovering peripherals advertising the heart-rate service
    fn start_discovery(&mut self, events: EventSink);

    /// Cancel discovery. Must be safe to call when no discovery is running.
    fn stop_discovery(&mut self);

    /// Open a link to `device`, reporting `Connected` or `Disconnected`
    fn connect(&mut self, device: &ScannedDevice, events: EventSink);

    /// Resolve the heart-rate service and enable measurement notifications
    fn subscribe(&mut self, events: EventSink);

    /// Tear down the current link and every task attached to it
    fn release(&mut self);
}
