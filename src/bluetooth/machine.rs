/// Heart-rate monitor connection state machine
///
/// Pure transition logic: every input produces a new state plus a list of
/// actions for the caller to carry out against the transport. No I/O here.
use log::{debug, info, warn};
use thiserror::Error;

use crate::bluetooth::heart_rate::decode_heart_rate;
use crate::bluetooth::transport::{DiscoveryError, ScannedDevice, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Scanning,
    Connecting,
    Connected,
}

/// User commands and transport events, in the order they were observed
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    StartScan,
    StopScan,
    Connect(ScannedDevice),
    Disconnect,
    Transport { link: u64, event: TransportEvent },
}

/// Side effects requested by a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    StartDiscovery,
    StopDiscovery,
    Connect { device: ScannedDevice, link: u64 },
    Subscribe { link: u64 },
    Release,
    PublishHeartRate(u16),
    Report(LinkFailure),
}

/// Non-fatal failures surfaced to observers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkFailure {
    #[error("Scan failed: {0}")]
    ScanFailed(String),

    #[error("Service discovery failed: {0}")]
    Discovery(DiscoveryError),
}

#[derive(Debug, Default)]
pub struct ConnectionMachine {
    state: ConnectionState,
    auto_reconnect: bool,
    last_device: Option<ScannedDevice>,
    scanned: Vec<ScannedDevice>,
    heart_rate: Option<u16>,
    link: u64,
}

impl ConnectionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn heart_rate(&self) -> Option<u16> {
        self.heart_rate
    }

    pub fn scanned_devices(&self) -> &[ScannedDevice] {
        &self.scanned
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    pub fn last_device(&self) -> Option<&ScannedDevice> {
        self.last_device.as_ref()
    }

    /// Id of the link currently allowed to report connection events
    pub fn current_link(&self) -> u64 {
        self.link
    }

    pub fn step(&mut self, input: Input) -> Vec<Action> {
        match input {
            Input::StartScan => self.start_scan(),
            Input::StopScan => self.stop_scan(),
            Input::Connect(device) => self.connect(device),
            Input::Disconnect => self.disconnect(),
            Input::Transport { link, event } => self.on_transport(link, event),
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!("Connection state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    fn start_scan(&mut self) -> Vec<Action> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                warn!("Ignoring scan request while {:?}", self.state);
                Vec::new()
            }
            ConnectionState::Disconnected | ConnectionState::Scanning => {
                self.scanned.clear();
                self.set_state(ConnectionState::Scanning);
                info!("Started BLE scan for heart-rate devices");
                vec![Action::StopDiscovery, Action::StartDiscovery]
            }
        }
    }

    fn stop_scan(&mut self) -> Vec<Action> {
        if self.state == ConnectionState::Scanning {
            self.set_state(ConnectionState::Disconnected);
            info!("Stopped BLE scan");
        }
        vec![Action::StopDiscovery]
    }

    fn connect(&mut self, device: ScannedDevice) -> Vec<Action> {
        let mut actions = self.stop_scan();
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            actions.push(Action::Release);
        }
        self.scanned.clear();
        self.auto_reconnect = true;
        self.last_device = Some(device.clone());
        actions.push(self.open_link(device));
        actions
    }

    fn open_link(&mut self, device: ScannedDevice) -> Action {
        self.link += 1;
        self.set_state(ConnectionState::Connecting);
        info!("Connecting to {} ({})", device.name, device.address);
        Action::Connect {
            device,
            link: self.link,
        }
    }

    fn disconnect(&mut self) -> Vec<Action> {
        // Flag first: the disconnect event from this release must not reconnect.
        self.auto_reconnect = false;
        self.link += 1;
        self.last_device = None;
        self.heart_rate = None;
        self.set_state(ConnectionState::Disconnected);
        vec![Action::StopDiscovery, Action::Release]
    }

    fn on_transport(&mut self, link: u64, event: TransportEvent) -> Vec<Action> {
        match event {
            TransportEvent::DeviceDiscovered(device) => {
                self.on_discovered(device);
                Vec::new()
            }
            TransportEvent::ScanFailed(reason) => {
                if self.state != ConnectionState::Scanning {
                    debug!("Ignoring scan failure while {:?}: {}", self.state, reason);
                    return Vec::new();
                }
                warn!("BLE scan failed: {}", reason);
                self.set_state(ConnectionState::Disconnected);
                vec![Action::Report(LinkFailure::ScanFailed(reason))]
            }
            _ if link != self.link => {
                debug!("Ignoring {:?} from stale link {}", event, link);
                Vec::new()
            }
            TransportEvent::Connected => {
                if self.state != ConnectionState::Connecting {
                    return Vec::new();
                }
                info!("Connected to GATT server");
                self.set_state(ConnectionState::Connected);
                vec![Action::Subscribe { link }]
            }
            TransportEvent::Subscribed => {
                info!("Subscribed to heart-rate notifications");
                Vec::new()
            }
            TransportEvent::DiscoveryFailed(reason) => {
                warn!("Service discovery failed: {}", reason);
                vec![Action::Report(LinkFailure::Discovery(reason))]
            }
            TransportEvent::Notification(data) => {
                if self.state != ConnectionState::Connected {
                    return Vec::new();
                }
                let bpm = decode_heart_rate(&data);
                self.heart_rate = Some(bpm);
                vec![Action::PublishHeartRate(bpm)]
            }
            TransportEvent::Disconnected => self.on_disconnected(),
        }
    }

    fn on_discovered(&mut self, device: ScannedDevice) {
        if self.state != ConnectionState::Scanning || device.name.is_empty() {
            return;
        }
        if self.scanned.iter().any(|d| d.address == device.address) {
            return;
        }
        debug!("Found HR device: {} ({})", device.name, device.address);
        self.scanned.push(device);
    }

    fn on_disconnected(&mut self) -> Vec<Action> {
        info!("Disconnected from GATT server");
        self.heart_rate = None;
        self.set_state(ConnectionState::Disconnected);

        let mut actions = vec![Action::Release];
        if self.auto_reconnect {
            if let Some(device) = self.last_device.clone() {
                // No backoff and no retry cap: a dead peripheral reconnects forever.
                info!("Auto-reconnecting...");
                actions.push(self.open_link(device));
            }
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluer::Address;

    fn device(last: u8, name: &str) -> ScannedDevice {
        ScannedDevice::new(name, Address::new([0xC0, 0xFF, 0xEE, 0x00, 0x00, last]))
    }

    fn event(link: u64, event: TransportEvent) -> Input {
        Input::Transport { link, event }
    }

    fn connected_machine() -> (ConnectionMachine, u64) {
        let mut m = ConnectionMachine::new();
        m.step(Input::Connect(device(1, "Polar H10")));
        let link = m.current_link();
        m.step(event(link, TransportEvent::Connected));
        (m, link)
    }

    #[test]
    fn starts_disconnected() {
        let m = ConnectionMachine::new();
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(!m.auto_reconnect());
    }

    #[test]
    fn scan_then_stop_without_results() {
        let mut m = ConnectionMachine::new();
        let actions = m.step(Input::StartScan);
        assert!(actions.contains(&Action::StartDiscovery));
        assert_eq!(m.state(), ConnectionState::Scanning);

        let actions = m.step(Input::StopScan);
        assert_eq!(actions, vec![Action::StopDiscovery]);
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(m.scanned_devices().is_empty());
    }

    #[test]
    fn stop_scan_when_idle_keeps_state() {
        let mut m = ConnectionMachine::new();
        m.step(Input::StopScan);
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn scan_results_are_unique_named_and_ordered() {
        let mut m = ConnectionMachine::new();
        m.step(Input::StartScan);
        m.step(event(0, TransportEvent::DeviceDiscovered(device(2, "Wahoo TICKR"))));
        m.step(event(0, TransportEvent::DeviceDiscovered(device(1, "Polar H10"))));
        m.step(event(0, TransportEvent::DeviceDiscovered(device(2, "Wahoo TICKR"))));
        m.step(event(0, TransportEvent::DeviceDiscovered(device(3, ""))));

        let names: Vec<_> = m.scanned_devices().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["Wahoo TICKR", "Polar H10"]);
    }

    #[test]
    fn new_scan_clears_previous_results() {
        let mut m = ConnectionMachine::new();
        m.step(Input::StartScan);
        m.step(event(0, TransportEvent::DeviceDiscovered(device(1, "Polar H10"))));
        m.step(Input::StopScan);
        m.step(Input::StartScan);
        assert!(m.scanned_devices().is_empty());
    }

    #[test]
    fn discoveries_outside_a_scan_are_dropped() {
        let mut m = ConnectionMachine::new();
        m.step(event(0, TransportEvent::DeviceDiscovered(device(1, "Polar H10"))));
        assert!(m.scanned_devices().is_empty());
    }

    #[test]
    fn scan_failure_forces_disconnected() {
        let mut m = ConnectionMachine::new();
        m.step(Input::StartScan);
        let actions = m.step(event(0, TransportEvent::ScanFailed("busy".into())));
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert_eq!(
            actions,
            vec![Action::Report(LinkFailure::ScanFailed("busy".into()))]
        );
    }

    #[test]
    fn late_scan_failure_does_not_break_connect() {
        let mut m = ConnectionMachine::new();
        m.step(Input::StartScan);
        m.step(Input::Connect(device(1, "Polar H10")));
        let link = m.current_link();

        let actions = m.step(event(0, TransportEvent::ScanFailed("busy".into())));
        assert!(actions.is_empty());
        assert_eq!(m.state(), ConnectionState::Connecting);

        let actions = m.step(event(link, TransportEvent::Connected));
        assert_eq!(m.state(), ConnectionState::Connected);
        assert_eq!(actions, vec![Action::Subscribe { link }]);
    }

    #[test]
    fn connect_stops_scan_and_enables_auto_reconnect() {
        let mut m = ConnectionMachine::new();
        m.step(Input::StartScan);
        m.step(event(0, TransportEvent::DeviceDiscovered(device(1, "Polar H10"))));

        let actions = m.step(Input::Connect(device(1, "Polar H10")));
        assert_eq!(actions[0], Action::StopDiscovery);
        assert!(matches!(actions.last(), Some(Action::Connect { .. })));
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert!(m.auto_reconnect());
        assert!(m.scanned_devices().is_empty());
        assert_eq!(m.last_device().map(|d| d.name.as_str()), Some("Polar H10"));
    }

    #[test]
    fn connected_event_requests_subscription() {
        let mut m = ConnectionMachine::new();
        m.step(Input::Connect(device(1, "Polar H10")));
        let link = m.current_link();
        let actions = m.step(event(link, TransportEvent::Connected));
        assert_eq!(m.state(), ConnectionState::Connected);
        assert_eq!(actions, vec![Action::Subscribe { link }]);
    }

    #[test]
    fn discovery_failure_stays_connected() {
        let (mut m, link) = connected_machine();
        let actions = m.step(event(
            link,
            TransportEvent::DiscoveryFailed(DiscoveryError::ServiceNotFound),
        ));
        assert_eq!(m.state(), ConnectionState::Connected);
        assert_eq!(
            actions,
            vec![Action::Report(LinkFailure::Discovery(
                DiscoveryError::ServiceNotFound
            ))]
        );
    }

    #[test]
    fn notifications_are_decoded_and_published() {
        let (mut m, link) = connected_machine();
        let actions = m.step(event(link, TransportEvent::Notification(vec![0x00, 142])));
        assert_eq!(actions, vec![Action::PublishHeartRate(142)]);
        assert_eq!(m.heart_rate(), Some(142));
    }

    #[test]
    fn peer_disconnect_reconnects_to_last_device() {
        let (mut m, link) = connected_machine();
        m.step(event(link, TransportEvent::Notification(vec![0x00, 90])));

        let actions = m.step(event(link, TransportEvent::Disconnected));
        assert_eq!(actions[0], Action::Release);
        match &actions[1] {
            Action::Connect { device, link: next } => {
                assert_eq!(device.name, "Polar H10");
                assert_eq!(*next, link + 1);
            }
            other => panic!("expected reconnect, got {:?}", other),
        }
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert_eq!(m.heart_rate(), None);
    }

    #[test]
    fn explicit_disconnect_suppresses_reconnect() {
        let (mut m, link) = connected_machine();
        let actions = m.step(Input::Disconnect);
        assert!(actions.contains(&Action::Release));
        assert!(!m.auto_reconnect());
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(m.last_device().is_none());

        // The released link reports its disconnect afterwards.
        let actions = m.step(event(link, TransportEvent::Disconnected));
        assert!(actions.is_empty());
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn events_from_stale_links_are_ignored() {
        let (mut m, link) = connected_machine();
        m.step(event(link, TransportEvent::Disconnected));
        // reconnecting on link + 1; a late notification from the old link is dropped
        let actions = m.step(event(link, TransportEvent::Notification(vec![0x00, 80])));
        assert!(actions.is_empty());
        assert_eq!(m.heart_rate(), None);
    }

    #[test]
    fn scan_is_ignored_while_connected() {
        let (mut m, _) = connected_machine();
        assert!(m.step(Input::StartScan).is_empty());
        assert_eq!(m.state(), ConnectionState::Connected);
    }
}
