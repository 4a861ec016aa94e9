//! BGAPI protocol constants and framing utilities
//!
//! The BLED112 dongle speaks BGAPI over its serial link: 4-byte header,
//! then a payload whose length is packed into the first two header bytes.
//! The high bit of byte 0 distinguishes unsolicited events from command
//! replies; bytes 2 and 3 carry the command class and command number.

use uuid::Uuid;

use crate::error::TransportError;

/// BGAPI header size in bytes
pub const HEADER_LENGTH: usize = 4;

/// Header byte 0: set for events, clear for command replies
pub const EVENT_FLAG: u8 = 0x80;

/// Header byte 0: high bits of the payload length
pub const LENGTH_HIGH_MASK: u8 = 0b11;

/// Largest payload length the header can express
pub const MAX_PAYLOAD: usize = ((LENGTH_HIGH_MASK as usize) << 8) | 0xFF;

/// BGAPI command classes
pub mod class {
    pub const SYSTEM: u8 = 0;
    pub const CONNECTION: u8 = 3;
    pub const ATTCLIENT: u8 = 4;
    pub const GAP: u8 = 6;
}

/// System-class commands
pub mod system {
    /// Query the connection table; the reply carries the pool size and one
    /// status event follows per slot.
    pub const GET_CONNECTIONS: u8 = 6;
}

/// Connection-class commands and events
pub mod connection {
    pub const DISCONNECT: u8 = 0;

    pub const EVT_STATUS: u8 = 0;
    pub const EVT_DISCONNECTED: u8 = 4;

    /// Status event flags bit: the slot holds a live link
    pub const FLAG_CONNECTED: u8 = 1 << 0;
}

/// Attribute-client commands and events (GATT procedures)
pub mod attclient {
    pub const READ_BY_GROUP_TYPE: u8 = 1;
    pub const FIND_INFORMATION: u8 = 3;
    pub const READ_BY_HANDLE: u8 = 4;
    pub const ATTRIBUTE_WRITE: u8 = 5;

    pub const EVT_PROCEDURE_COMPLETED: u8 = 1;
    pub const EVT_GROUP_FOUND: u8 = 2;
    pub const EVT_FIND_INFORMATION_FOUND: u8 = 4;
    pub const EVT_ATTRIBUTE_VALUE: u8 = 5;
}

/// GAP commands, events, and link parameters
pub mod gap {
    pub const DISCOVER: u8 = 2;
    pub const CONNECT_DIRECT: u8 = 3;
    pub const END_PROCEDURE: u8 = 4;
    pub const SET_SCAN_PARAMETERS: u8 = 7;

    pub const EVT_SCAN_RESPONSE: u8 = 0;

    /// Generic discovery mode for `DISCOVER`
    pub const DISCOVER_GENERIC: u8 = 2;

    /// Scan interval/window in 625 us units
    pub const SCAN_INTERVAL: u16 = 0x834;
    pub const SCAN_WINDOW: u16 = 0x834;

    // Link parameters for CONNECT_DIRECT. Interval is in 1.25 ms units,
    // the supervision timeout in 10 ms units.
    pub const CONN_INTERVAL_MIN: u16 = 6;
    pub const CONN_INTERVAL_MAX: u16 = 100;
    pub const CONN_TIMEOUT: u16 = 100;
    pub const CONN_LATENCY: u16 = 0;
}

/// Well-known GATT attribute type UUIDs (16-bit form)
pub mod att {
    pub const PRIMARY_SERVICE: u16 = 0x2800;
    pub const CHARACTERISTIC_DECLARATION: u16 = 0x2803;
    pub const CLIENT_CONFIGURATION: u16 = 0x2902;
}

/// TileBus GATT identifiers
pub mod tilebus {
    use uuid::Uuid;

    /// Primary service advertised by every TileBus device
    pub const SERVICE: Uuid = Uuid::from_u128(0x0ff60f63_132c_e611_ba53_f73f00200000);

    pub const SEND_HEADER: Uuid = Uuid::from_u128(0xfb349b5f_8000_0080_0010_000000000320);
    pub const SEND_PAYLOAD: Uuid = Uuid::from_u128(0xfb349b5f_8000_0080_0010_000000000420);
    pub const RECEIVE_HEADER: Uuid = Uuid::from_u128(0xfb349b5f_8000_0080_0010_000000000120);
    pub const RECEIVE_PAYLOAD: Uuid = Uuid::from_u128(0xfb349b5f_8000_0080_0010_000000000220);
    pub const STREAMING: Uuid = Uuid::from_u128(0xfb349b5f_8000_0080_0010_000000000520);
    pub const HIGHSPEED: Uuid = Uuid::from_u128(0xfb349b5f_8000_0080_0010_000000000620);

    /// Arch Systems manufacturer id carried in advertisement payloads
    pub const ARCH_MANUFACTURER_ID: u16 = 0x03C0;
}

/// Command and event timing budgets
pub mod timing {
    /// Default reply budget for a wire command (ms)
    pub const COMMAND_REPLY_MS: u64 = 3000;
    /// Reply budget for the connect command itself (ms)
    pub const CONNECT_REPLY_MS: u64 = 600;
    /// Window to wait for the connection status event after connect (ms)
    pub const CONNECT_EVENT_MS: u64 = 4000;
    /// Window to wait for the disconnect event after disconnect (ms)
    pub const DISCONNECT_EVENT_MS: u64 = 3000;
    /// Collection window for primary service enumeration (ms)
    pub const SERVICE_DISCOVERY_MS: u64 = 500;
    /// Collection window for attribute information enumeration (ms)
    pub const FIND_INFORMATION_MS: u64 = 1000;
    /// Window to wait for an attribute value after a read (ms)
    pub const READ_ATTRIBUTE_MS: u64 = 5000;
    /// Window to wait for the ack after an attribute write (ms)
    pub const WRITE_ATTRIBUTE_MS: u64 = 1000;
    /// Collection window for connection status events at startup (ms)
    pub const SYSTEM_STATE_MS: u64 = 500;
    /// How often the worker re-checks its request queue when idle (ms)
    pub const REQUEST_POLL_MS: u64 = 10;
}

/// Serial link parameters for the BLED112
pub mod serial {
    pub const BAUD_RATE: u32 = 256_000;
    pub const READ_TIMEOUT_MS: u64 = 10;
}

/// One framed BGAPI message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BgapiPacket {
    pub is_event: bool,
    pub class: u8,
    pub command: u8,
    pub payload: Vec<u8>,
}

impl BgapiPacket {
    /// Build a host-to-dongle command packet
    pub fn command(class: u8, command: u8, payload: Vec<u8>) -> Self {
        Self {
            is_event: false,
            class,
            command,
            payload,
        }
    }

    /// Build an event packet (mostly useful for tests and mocks)
    pub fn event(class: u8, command: u8, payload: Vec<u8>) -> Self {
        Self {
            is_event: true,
            class,
            command,
            payload,
        }
    }

    /// Reassemble a packet from a decoded header and its payload bytes
    pub fn from_wire(header: &[u8; HEADER_LENGTH], payload: Vec<u8>) -> Self {
        Self {
            is_event: header[0] & EVENT_FLAG != 0,
            class: header[2],
            command: header[3],
            payload,
        }
    }

    /// Serialize to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LENGTH + self.payload.len());
        out.extend_from_slice(&encode_header(
            self.is_event,
            self.payload.len(),
            self.class,
            self.command,
        ));
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn matches(&self, class: u8, command: u8) -> bool {
        self.class == class && self.command == command
    }
}

/// Encode a 4-byte BGAPI header
pub fn encode_header(is_event: bool, payload_len: usize, class: u8, command: u8) -> [u8; HEADER_LENGTH] {
    let mut header = [0u8; HEADER_LENGTH];
    header[0] = ((payload_len >> 8) as u8) & LENGTH_HIGH_MASK;
    if is_event {
        header[0] |= EVENT_FLAG;
    }
    header[1] = payload_len as u8;
    header[2] = class;
    header[3] = command;
    header
}

/// Payload length carried in a BGAPI header
pub fn payload_length(header: &[u8; HEADER_LENGTH]) -> usize {
    (((header[0] & LENGTH_HIGH_MASK) as usize) << 8) | header[1] as usize
}

/// Expand a 16-bit attribute UUID into the Bluetooth base UUID
pub fn expand_uuid16(short: u16) -> Uuid {
    Uuid::from_fields(
        short as u32,
        0x0000,
        0x1000,
        &[0x80, 0x00, 0x00, 0x80, 0x5F, 0x9B, 0x34, 0xFB],
    )
}

/// Parse a `XX:YY:ZZ:AA:BB:CC` address into wire order (reversed)
pub fn parse_ble_address(address: &str) -> Result<[u8; 6], TransportError> {
    let hex: String = address.chars().filter(|c| *c != ':').collect();
    if hex.len() != 12 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(TransportError::InvalidArgument(format!(
            "Bad BLE address: {address}"
        )));
    }

    let mut wire = [0u8; 6];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let text = std::str::from_utf8(chunk).expect("ASCII hex digits");
        let byte = u8::from_str_radix(text, 16).map_err(|_| {
            TransportError::InvalidArgument(format!("Bad BLE address: {address}"))
        })?;
        // Printed order is MSB first; the wire wants LSB first.
        wire[5 - i] = byte;
    }
    Ok(wire)
}

/// Format a wire-order address as colon-separated upper-case hex
pub fn format_ble_address(wire: &[u8; 6]) -> String {
    wire.iter()
        .rev()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Guess the GAP address type from the address itself: static random
/// addresses have their two most significant bits set.
pub fn address_type_for(wire: &[u8; 6]) -> u8 {
    if wire[5] >> 6 == 0b11 {
        1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        // Every canonical header must survive decode → encode unchanged.
        for is_event in [false, true] {
            for len in [0usize, 1, 0xFF, 0x100, MAX_PAYLOAD] {
                let header = encode_header(is_event, len, 6, 3);
                assert_eq!(payload_length(&header), len);
                let packet = BgapiPacket::from_wire(&header, vec![0; len]);
                assert_eq!(packet.is_event, is_event);
                assert_eq!(&packet.encode()[..HEADER_LENGTH], &header);
            }
        }
    }

    #[test]
    fn test_event_bit_classification() {
        let reply = encode_header(false, 2, 3, 0);
        let event = encode_header(true, 2, 3, 0);
        assert_eq!(reply[0] & EVENT_FLAG, 0);
        assert_ne!(event[0] & EVENT_FLAG, 0);
        // Same class/command either way; only the flag differs.
        assert_eq!(reply[2..], event[2..]);
    }

    #[test]
    fn test_packet_encode() {
        let packet = BgapiPacket::command(6, 2, vec![2]);
        assert_eq!(packet.encode(), vec![0x00, 0x01, 0x06, 0x02, 0x02]);
    }

    #[test]
    fn test_address_round_trip() {
        let wire = parse_ble_address("AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(wire, [0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(format_ble_address(&wire), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_address_type() {
        // 0xAA = 0b10xxxxxx → public
        assert_eq!(address_type_for(&parse_ble_address("AA:00:00:00:00:01").unwrap()), 0);
        // 0xC0 = 0b11xxxxxx → static random
        assert_eq!(address_type_for(&parse_ble_address("C0:00:00:00:00:01").unwrap()), 1);
    }

    #[test]
    fn test_bad_address_rejected() {
        assert!(parse_ble_address("AA:BB:CC").is_err());
        assert!(parse_ble_address("AA:BB:CC:DD:EE:GG").is_err());
    }

    #[test]
    fn test_expand_uuid16() {
        assert_eq!(
            expand_uuid16(0x2800).to_string(),
            "00002800-0000-1000-8000-00805f9b34fb"
        );
    }
}
