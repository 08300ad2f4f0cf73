use bluer::Address;
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, timeout, Duration};

use hrm_jump_tracker::bluetooth::{
    ConnectionState, DiscoveryError, EventSink, LinkFailure, ScannedDevice,
    SensorConnectionManager, SensorHandle, Transport, TransportEvent,
};

const WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
enum Call {
    StartDiscovery,
    StopDiscovery,
    Connect(String, u64),
    Subscribe(u64),
    Release,
}

/// Shared view into what the manager asked the transport to do
#[derive(Clone, Default)]
struct Remote {
    calls: Arc<Mutex<Vec<Call>>>,
    scan_sink: Arc<Mutex<Option<EventSink>>>,
    link_sink: Arc<Mutex<Option<EventSink>>>,
}

impl Remote {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn connects(&self) -> Vec<u64> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Connect(_, link) => Some(link),
                _ => None,
            })
            .collect()
    }

    fn scan_emit(&self, event: TransportEvent) {
        self.scan_sink.lock().unwrap().as_ref().unwrap().emit(event);
    }

    fn link_emit(&self, event: TransportEvent) {
        self.link_sink.lock().unwrap().as_ref().unwrap().emit(event);
    }

    async fn wait_for_call(&self, call: Call) {
        timeout(WAIT, async {
            while !self.calls().contains(&call) {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("transport never saw {:?}", call));
    }
}

struct ScriptedTransport(Remote);

impl Transport for ScriptedTransport {
    fn start_discovery(&mut self, events: EventSink) {
        *self.0.scan_sink.lock().unwrap() = Some(events);
        self.0.calls.lock().unwrap().push(Call::StartDiscovery);
    }

    fn stop_discovery(&mut self) {
        self.0.calls.lock().unwrap().push(Call::StopDiscovery);
    }

    fn connect(&mut self, device: &ScannedDevice, events: EventSink) {
        let link = events.link();
        *self.0.link_sink.lock().unwrap() = Some(events);
        self.0
            .calls
            .lock()
            .unwrap()
            .push(Call::Connect(device.address.clone(), link));
    }

    fn subscribe(&mut self, events: EventSink) {
        *self.0.link_sink.lock().unwrap() = Some(events.clone());
        self.0
            .calls
            .lock()
            .unwrap()
            .push(Call::Subscribe(events.link()));
    }

    fn release(&mut self) {
        self.0.calls.lock().unwrap().push(Call::Release);
    }
}

fn device(last: u8, name: &str) -> ScannedDevice {
    ScannedDevice::new(name, Address::new([0xC0, 0xFF, 0xEE, 0x00, 0x00, last]))
}

fn spawn() -> (SensorHandle, Remote) {
    let remote = Remote::default();
    let handle = SensorConnectionManager::spawn(ScriptedTransport(remote.clone()));
    (handle, remote)
}

async fn wait_for_state(handle: &SensorHandle, state: ConnectionState) {
    let mut rx = handle.connection_state();
    timeout(WAIT, rx.wait_for(|s| *s == state))
        .await
        .expect("timed out waiting for state")
        .expect("manager stopped");
}

/// Connect to `dev` and complete the GATT link, returning the link id
async fn connect(handle: &SensorHandle, remote: &Remote, dev: ScannedDevice) -> u64 {
    let before = remote.connects().len();
    handle.connect_to_device(dev);
    timeout(WAIT, async {
        while remote.connects().len() == before {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("no connect issued");
    let link = *remote.connects().last().unwrap();

    remote.link_emit(TransportEvent::Connected);
    wait_for_state(handle, ConnectionState::Connected).await;
    remote.wait_for_call(Call::Subscribe(link)).await;
    link
}

#[tokio::test]
async fn scan_lists_named_devices_once() {
    let (handle, remote) = spawn();
    handle.start_scan();
    wait_for_state(&handle, ConnectionState::Scanning).await;
    remote.wait_for_call(Call::StartDiscovery).await;

    remote.scan_emit(TransportEvent::DeviceDiscovered(device(1, "Polar H10")));
    remote.scan_emit(TransportEvent::DeviceDiscovered(device(1, "Polar H10")));
    remote.scan_emit(TransportEvent::DeviceDiscovered(device(2, "")));
    remote.scan_emit(TransportEvent::DeviceDiscovered(device(3, "Wahoo TICKR")));

    let mut scanned = handle.scanned_devices();
    let devices = timeout(WAIT, scanned.wait_for(|d| d.len() == 2))
        .await
        .unwrap()
        .unwrap()
        .clone();
    assert_eq!(devices[0].name, "Polar H10");
    assert_eq!(devices[1].name, "Wahoo TICKR");
    assert_eq!(devices[0].address, "C0:FF:EE:00:00:01");

    handle.stop_scan();
    wait_for_state(&handle, ConnectionState::Disconnected).await;
    handle.shutdown().await;
}

#[tokio::test]
async fn scan_failure_is_reported() {
    let (handle, remote) = spawn();
    let mut failures = handle.subscribe_failures();
    handle.start_scan();
    remote.wait_for_call(Call::StartDiscovery).await;

    remote.scan_emit(TransportEvent::ScanFailed("adapter off".to_string()));

    let failure = timeout(WAIT, failures.recv()).await.unwrap().unwrap();
    assert_eq!(failure, LinkFailure::ScanFailed("adapter off".to_string()));
    wait_for_state(&handle, ConnectionState::Disconnected).await;
    handle.shutdown().await;
}

#[tokio::test]
async fn notifications_are_decoded_and_broadcast() {
    let (handle, remote) = spawn();
    let mut samples = handle.subscribe_heart_rate();
    connect(&handle, &remote, device(1, "Polar H10")).await;

    remote.link_emit(TransportEvent::Subscribed);
    remote.link_emit(TransportEvent::Notification(vec![0x00, 72]));
    remote.link_emit(TransportEvent::Notification(vec![0x00, 72]));
    remote.link_emit(TransportEvent::Notification(vec![0x01, 0x40, 0x01]));

    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(timeout(WAIT, samples.recv()).await.unwrap().unwrap());
    }
    assert_eq!(received, vec![72, 72, 320]);

    let mut heart_rate = handle.heart_rate();
    timeout(WAIT, heart_rate.wait_for(|hr| *hr == Some(320)))
        .await
        .unwrap()
        .unwrap();
    handle.shutdown().await;
}

#[tokio::test]
async fn unexpected_disconnect_reconnects() {
    let (handle, remote) = spawn();
    let first = connect(&handle, &remote, device(1, "Polar H10")).await;
    remote.link_emit(TransportEvent::Notification(vec![0x00, 90]));
    let mut heart_rate = handle.heart_rate();
    timeout(WAIT, heart_rate.wait_for(|hr| hr.is_some()))
        .await
        .unwrap()
        .unwrap();

    remote.link_emit(TransportEvent::Disconnected);

    timeout(WAIT, heart_rate.wait_for(|hr| hr.is_none()))
        .await
        .unwrap()
        .unwrap();
    remote
        .wait_for_call(Call::Connect("C0:FF:EE:00:00:01".to_string(), first + 1))
        .await;
    wait_for_state(&handle, ConnectionState::Connecting).await;
    handle.shutdown().await;
}

#[tokio::test]
async fn user_disconnect_does_not_reconnect() {
    let (handle, remote) = spawn();
    let link = connect(&handle, &remote, device(1, "Polar H10")).await;

    handle.disconnect();
    wait_for_state(&handle, ConnectionState::Disconnected).await;
    remote.wait_for_call(Call::Release).await;

    // The released link reports its disconnect late.
    remote.link_emit(TransportEvent::Disconnected);
    sleep(Duration::from_millis(50)).await;

    assert_eq!(remote.connects(), vec![link]);
    assert_eq!(*handle.connection_state().borrow(), ConnectionState::Disconnected);
    handle.shutdown().await;
}

#[tokio::test]
async fn discovery_failure_is_reported_without_dropping_link() {
    let (handle, remote) = spawn();
    let mut failures = handle.subscribe_failures();
    connect(&handle, &remote, device(1, "Polar H10")).await;

    remote.link_emit(TransportEvent::DiscoveryFailed(DiscoveryError::ServiceNotFound));

    let failure = timeout(WAIT, failures.recv()).await.unwrap().unwrap();
    assert_eq!(failure, LinkFailure::Discovery(DiscoveryError::ServiceNotFound));
    assert_eq!(*handle.connection_state().borrow(), ConnectionState::Connected);
    handle.shutdown().await;
}

#[tokio::test]
async fn scan_is_ignored_while_connected() {
    let (handle, remote) = spawn();
    connect(&handle, &remote, device(1, "Polar H10")).await;

    handle.start_scan();
    sleep(Duration::from_millis(50)).await;

    assert!(!remote.calls().contains(&Call::StartDiscovery));
    assert_eq!(*handle.connection_state().borrow(), ConnectionState::Connected);
    handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_releases_transport() {
    let (handle, remote) = spawn();
    connect(&handle, &remote, device(1, "Polar H10")).await;

    handle.shutdown().await;

    let calls = remote.calls();
    assert_eq!(calls.last(), Some(&Call::Release));
}
