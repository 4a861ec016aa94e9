//! Common types for the adapter layer

use std::collections::HashMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One sensor reading broadcast in a scan response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisibleReading {
    /// Stream the reading belongs to
    pub stream: u16,
    /// Device-local timestamp of the reading
    pub timestamp: u32,
    /// Raw reading value
    pub value: u32,
}

/// Fully assembled TileBus discovery record
///
/// In active scanning this is complete only once both the advertisement and
/// its follow-up scan response have arrived; in passive scanning the
/// broadcast-only fields stay empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Printable BLE address, `XX:YY:ZZ:AA:BB:CC`
    pub connection_string: String,
    /// TileBus device UUID from the manufacturer payload
    pub uuid: u32,
    /// RSSI of the advertisement in dBm
    pub signal_strength: i8,
    /// GAP address type reported by the dongle
    pub address_type: u8,
    /// Someone is holding the device's user connection
    pub user_connected: bool,
    /// The device has data waiting to be drained
    pub pending_data: bool,
    /// The device reports a low battery
    pub low_voltage: bool,
    /// Battery voltage in volts (scan response only)
    pub voltage: Option<f32>,
    /// Device-local clock at broadcast time (scan response only)
    pub current_time: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub visible_readings: Vec<VisibleReading>,
    /// When the scan response was assembled
    pub last_seen: Option<SystemTime>,
}

/// Properties bitfield from a GATT characteristic declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CharacteristicProperties {
    pub broadcast: bool,
    pub read: bool,
    pub write_no_response: bool,
    pub write: bool,
    pub notify: bool,
    pub indicate: bool,
    pub write_authenticated: bool,
    pub extended: bool,
}

impl CharacteristicProperties {
    pub fn from_bits(bits: u8) -> Self {
        Self {
            broadcast: bits & 0x01 != 0,
            read: bits & 0x02 != 0,
            write_no_response: bits & 0x04 != 0,
            write: bits & 0x08 != 0,
            notify: bits & 0x10 != 0,
            indicate: bits & 0x20 != 0,
            write_authenticated: bits & 0x40 != 0,
            extended: bits & 0x80 != 0,
        }
    }
}

/// Cached Client Characteristic Configuration descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfiguration {
    /// Attribute handle of the descriptor
    pub handle: u16,
    /// Last value read from or written to it
    pub value: u16,
}

/// One characteristic discovered inside a service range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    /// Attribute handle of the characteristic value
    pub handle: u16,
    pub properties: CharacteristicProperties,
    /// Present only for characteristics that can notify or indicate
    pub client_configuration: Option<ClientConfiguration>,
}

/// One primary service and its characteristics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GattService {
    pub uuid: Uuid,
    pub start_handle: u16,
    pub end_handle: u16,
    pub characteristics: HashMap<Uuid, GattCharacteristic>,
}

/// GATT table of a connected device, keyed by service UUID
pub type ServiceMap = HashMap<Uuid, GattService>;

/// Lifecycle state of one dongle connection handle
///
/// Records are only created once the connect command has been accepted, so
/// there is no stored "connecting" state; a connection that fails its
/// disconnect command is parked as a zombie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Link is up, GATT table still being probed
    Preparing,
    /// Fully probed and usable
    Connected,
    /// A disconnect command is in flight
    Disconnecting,
    /// Disconnect was refused; the handle is unusable but still occupied
    Zombie,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_from_bits() {
        let props = CharacteristicProperties::from_bits(0x10 | 0x02);
        assert!(props.notify);
        assert!(props.read);
        assert!(!props.write);
        assert!(!props.indicate);
    }
}
