pub mod bluez;
pub mod heart_rate;
pub mod machine;
pub mod manager;
pub mod transport;

pub use bluez::BluerTransport;
pub use heart_rate::decode_heart_rate;
pub use machine::{ConnectionState, LinkFailure};
pub use manager::{SensorConnectionManager, SensorHandle};
pub use transport::{DiscoveryError, EventSink, ScannedDevice, Transport, TransportEvent};
