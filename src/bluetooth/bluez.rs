/// BlueZ-backed transport for heart-rate monitors
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Device, DeviceEvent, DeviceProperty};
use futures_util::{pin_mut, StreamExt};
use log::{debug, error, warn};
use std::collections::HashSet;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::bluetooth::heart_rate::{
    CLIENT_CHARACTERISTIC_CONFIG_UUID, HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID,
};
use crate::bluetooth::transport::{
    DiscoveryError, EventSink, ScannedDevice, Transport, TransportEvent,
};

const SERVICE_RESOLVE_ATTEMPTS: u32 = 20;
const SERVICE_RESOLVE_POLL_MS: u64 = 250;

pub struct BluerTransport {
    // Keeps the D-Bus connection alive for the adapter.
    _session: bluer::Session,
    adapter: Adapter,
    device: Option<Device>,
    scan_task: Option<JoinHandle<()>>,
    link_task: Option<JoinHandle<()>>,
    notify_task: Option<JoinHandle<()>>,
    /// Disconnect issued by the last release; a new link waits for it
    pending_disconnect: Option<JoinHandle<()>>,
}

impl BluerTransport {
    /// Open a BlueZ session on the default adapter and power it on
    pub async fn new() -> Result<Self, Box<dyn std::error::Error>> {
        // Initialize Bluetooth session
        let session = match bluer::Session::new().await {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to create Bluetooth session: {}", e);
                return Err(e.into());
            }
        };

        // Get the default Bluetooth adapter
        let adapter = match session.default_adapter().await {
            Ok(adapter) => adapter,
            Err(e) => {
                error!("Failed to get default Bluetooth adapter: {}", e);
                return Err(e.into());
            }
        };

        // Ensure Bluetooth adapter is powered on
        if let Err(e) = adapter.set_powered(true).await {
            error!("Failed to power on adapter: {}", e);
            return Err(e.into());
        }

        debug!("Using Bluetooth adapter {}", adapter.name());

        Ok(Self {
            _session: session,
            adapter,
            device: None,
            scan_task: None,
            link_task: None,
            notify_task: None,
            pending_disconnect: None,
        })
    }
}

impl Transport for BluerTransport {
    fn start_discovery(&mut self, events: EventSink) {
        self.stop_discovery();
        let adapter = self.adapter.clone();

        self.scan_task = Some(tokio::spawn(async move {
            // Only LE peripherals advertising the heart-rate service
            let filter = bluer::DiscoveryFilter {
                uuids: HashSet::from([HEART_RATE_SERVICE_UUID]),
                transport: bluer::DiscoveryTransport::Le,
                duplicate_data: false,
                ..Default::default()
            };

            // Apply the discovery filter (warn if it fails, but continue)
            if let Err(e) = adapter.set_discovery_filter(filter).await {
                warn!("Failed to set discovery filter: {}", e);
            }

            let stream = match adapter.discover_devices().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to start device discovery: {}", e);
                    events.emit(TransportEvent::ScanFailed(e.to_string()));
                    return;
                }
            };
            pin_mut!(stream);

            while let Some(event) = stream.next().await {
                let AdapterEvent::DeviceAdded(addr) = event else {
                    continue;
                };
                let device = match adapter.device(addr) {
                    Ok(device) => device,
                    Err(_) => continue,
                };
                match device.name().await {
                    Ok(Some(name)) => {
                        events.emit(TransportEvent::DeviceDiscovered(ScannedDevice::new(
                            name, addr,
                        )));
                    }
                    Ok(None) => debug!("Skipping unnamed device {}", addr),
                    Err(e) => debug!("Failed to read name of {}: {}", addr, e),
                }
            }
        }));
    }

    fn stop_discovery(&mut self) {
        // Dropping the discovery stream ends the BlueZ discovery session.
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
    }

    fn connect(&mut self, target: &ScannedDevice, events: EventSink) {
        self.release();

        let device = match self.adapter.device(target.handle) {
            Ok(device) => device,
            Err(e) => {
                warn!("Unknown device {}: {}", target.address, e);
                events.emit(TransportEvent::Disconnected);
                return;
            }
        };
        self.device = Some(device.clone());
        let pending_disconnect = self.pending_disconnect.take();

        self.link_task = Some(tokio::spawn(async move {
            // A disconnect still in flight would abort this connect.
            settle(pending_disconnect).await;

            // Subscribe before connecting so an early drop is not missed.
            let device_events = match device.events().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Failed to watch {}: {}", device.address(), e);
                    events.emit(TransportEvent::Disconnected);
                    return;
                }
            };

            if let Err(e) = device.connect().await {
                warn!("Connection to {} failed: {}", device.address(), e);
                events.emit(TransportEvent::Disconnected);
                return;
            }
            events.emit(TransportEvent::Connected);

            pin_mut!(device_events);
            while let Some(event) = device_events.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                    events.emit(TransportEvent::Disconnected);
                    return;
                }
            }
        }));
    }

    fn subscribe(&mut self, events: EventSink) {
        let Some(device) = self.device.clone() else {
            events.emit(TransportEvent::DiscoveryFailed(DiscoveryError::Bluetooth(
                "no device attached".to_string(),
            )));
            return;
        };
        if let Some(task) = self.notify_task.take() {
            task.abort();
        }

        self.notify_task = Some(tokio::spawn(async move {
            let characteristic = match find_measurement_characteristic(&device).await {
                Ok(characteristic) => characteristic,
                Err(e) => {
                    events.emit(TransportEvent::DiscoveryFailed(e));
                    return;
                }
            };

            // BlueZ writes the CCCD enable-notify value for us.
            let stream = match characteristic.notify().await {
                Ok(stream) => stream,
                Err(e) => {
                    events.emit(TransportEvent::DiscoveryFailed(e.into()));
                    return;
                }
            };
            events.emit(TransportEvent::Subscribed);

            pin_mut!(stream);
            while let Some(value) = stream.next().await {
                events.emit(TransportEvent::Notification(value));
            }
            debug!("Heart-rate notification stream ended");
        }));
    }

    fn release(&mut self) {
        for task in [self.link_task.take(), self.notify_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }

        if let Some(device) = self.device.take() {
            self.pending_disconnect = Some(tokio::spawn(async move {
                // The link may already be gone, e.g. on the reconnect path.
                if !device.is_connected().await.unwrap_or(false) {
                    return;
                }
                if let Err(e) = device.disconnect().await {
                    debug!("Disconnect of {} returned: {}", device.address(), e);
                }
            }));
        }
    }
}

/// Wait until the previous link's disconnect has finished
async fn settle(pending_disconnect: Option<JoinHandle<()>>) {
    if let Some(disconnect) = pending_disconnect {
        if let Err(e) = disconnect.await {
            debug!("Previous disconnect did not complete: {}", e);
        }
    }
}

/// Locate the Heart Rate Measurement characteristic on a connected device
async fn find_measurement_characteristic(
    device: &Device,
) -> Result<Characteristic, DiscoveryError> {
    wait_for_services(device).await?;

    for service in device.services().await? {
        if service.uuid().await? != HEART_RATE_SERVICE_UUID {
            continue;
        }
        for characteristic in service.characteristics().await? {
            if characteristic.uuid().await? == HEART_RATE_MEASUREMENT_UUID {
                if !has_notification_descriptor(&characteristic).await {
                    warn!("Heart Rate Measurement has no CCCD, notifications may not start");
                }
                return Ok(characteristic);
            }
        }
        return Err(DiscoveryError::CharacteristicNotFound);
    }

    Err(DiscoveryError::ServiceNotFound)
}

async fn wait_for_services(device: &Device) -> Result<(), DiscoveryError> {
    for _ in 0..SERVICE_RESOLVE_ATTEMPTS {
        if device.is_services_resolved().await? {
            return Ok(());
        }
        sleep(Duration::from_millis(SERVICE_RESOLVE_POLL_MS)).await;
    }
    // Try the lookup anyway; a missing service is reported by the caller.
    warn!("Services of {} not resolved in time", device.address());
    Ok(())
}

async fn has_notification_descriptor(characteristic: &Characteristic) -> bool {
    let Ok(descriptors) = characteristic.descriptors().await else {
        return false;
    };
    for descriptor in descriptors {
        if matches!(descriptor.uuid().await, Ok(uuid) if uuid == CLIENT_CHARACTERISTIC_CONFIG_UUID)
        {
            return true;
        }
    }
    false
}
