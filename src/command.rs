//! Type-safe BGAPI command builders and reply/event parsers
//!
//! Each wire command knows its class, command number, payload layout, and
//! reply shape; the command processor only ever deals in typed values.
//! Event payload parsers for the events those commands produce live here
//! as well.

use std::time::Duration;

use uuid::Uuid;

use crate::protocol::{self, attclient, class, connection, gap, system, timing, BgapiPacket};
use crate::types::CharacteristicProperties;

// =============================================================================
// Core traits
// =============================================================================

/// A command that can be serialized into a BGAPI packet
pub trait BgapiCommand {
    /// Command class
    const CLASS: u8;
    /// Command number within the class
    const COMMAND: u8;

    /// Typed reply for this command
    type Reply: BgapiReply;

    /// Serialize the payload (excluding the header)
    fn payload(&self) -> Vec<u8>;

    /// Build the complete wire packet
    fn packet(&self) -> BgapiPacket {
        BgapiPacket::command(Self::CLASS, Self::COMMAND, self.payload())
    }

    /// How long to wait for the reply packet
    fn reply_timeout(&self) -> Duration {
        Duration::from_millis(timing::COMMAND_REPLY_MS)
    }
}

/// A reply that can be parsed from a BGAPI reply payload
pub trait BgapiReply: Sized {
    fn parse(payload: &[u8]) -> Result<Self, ParseError>;
}

/// Parse error for replies and events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    TooShort { expected: usize, got: usize },
    BadValue { field: &'static str },
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooShort { expected, got } => {
                write!(f, "payload too short: expected {expected} bytes, got {got}")
            }
            Self::BadValue { field } => write!(f, "bad value for {field}"),
        }
    }
}

impl std::error::Error for ParseError {}

fn require(payload: &[u8], len: usize) -> Result<(), ParseError> {
    if payload.len() < len {
        Err(ParseError::TooShort {
            expected: len,
            got: payload.len(),
        })
    } else {
        Ok(())
    }
}

fn u16_at(payload: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([payload[offset], payload[offset + 1]])
}

// =============================================================================
// Shared reply shapes
// =============================================================================

/// Reply carrying only a BGAPI result code
#[derive(Debug, Clone, Copy)]
pub struct ResultReply {
    pub result: u16,
}

impl ResultReply {
    pub fn ok(&self) -> bool {
        self.result == 0
    }
}

impl BgapiReply for ResultReply {
    fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        require(payload, 2)?;
        Ok(Self {
            result: u16_at(payload, 0),
        })
    }
}

/// Reply carrying a connection handle followed by a result code
#[derive(Debug, Clone, Copy)]
pub struct HandleResultReply {
    pub handle: u8,
    pub result: u16,
}

impl BgapiReply for HandleResultReply {
    fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        require(payload, 3)?;
        Ok(Self {
            handle: payload[0],
            result: u16_at(payload, 1),
        })
    }
}

// =============================================================================
// System
// =============================================================================

/// Query the connection pool; status events follow, one per slot
#[derive(Debug, Clone, Copy, Default)]
pub struct GetConnections;

#[derive(Debug, Clone, Copy)]
pub struct MaxConnectionsReply {
    pub max_connections: u8,
}

impl BgapiCommand for GetConnections {
    const CLASS: u8 = class::SYSTEM;
    const COMMAND: u8 = system::GET_CONNECTIONS;
    type Reply = MaxConnectionsReply;

    fn payload(&self) -> Vec<u8> {
        Vec::new()
    }
}

impl BgapiReply for MaxConnectionsReply {
    fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        require(payload, 1)?;
        Ok(Self {
            max_connections: payload[0],
        })
    }
}

// =============================================================================
// GAP
// =============================================================================

/// Configure scan interval/window and whether scan responses are requested
#[derive(Debug, Clone, Copy)]
pub struct SetScanParameters {
    pub active: bool,
}

impl BgapiCommand for SetScanParameters {
    const CLASS: u8 = class::GAP;
    const COMMAND: u8 = gap::SET_SCAN_PARAMETERS;
    type Reply = ResultReply;

    fn payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(5);
        payload.extend_from_slice(&gap::SCAN_INTERVAL.to_le_bytes());
        payload.extend_from_slice(&gap::SCAN_WINDOW.to_le_bytes());
        payload.push(self.active as u8);
        payload
    }
}

/// Start generic discovery
#[derive(Debug, Clone, Copy, Default)]
pub struct Discover;

impl BgapiCommand for Discover {
    const CLASS: u8 = class::GAP;
    const COMMAND: u8 = gap::DISCOVER;
    type Reply = ResultReply;

    fn payload(&self) -> Vec<u8> {
        vec![gap::DISCOVER_GENERIC]
    }
}

/// End the running GAP procedure (stop scanning, cancel a pending connect)
#[derive(Debug, Clone, Copy, Default)]
pub struct EndProcedure;

impl BgapiCommand for EndProcedure {
    const CLASS: u8 = class::GAP;
    const COMMAND: u8 = gap::END_PROCEDURE;
    type Reply = ResultReply;

    fn payload(&self) -> Vec<u8> {
        Vec::new()
    }
}

/// Dial a peripheral by address
#[derive(Debug, Clone, Copy)]
pub struct ConnectDirect {
    /// Wire-order (reversed) BLE address
    pub address: [u8; 6],
    pub address_type: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectReply {
    pub result: u16,
    /// Handle the dongle reserved for the pending link
    pub handle: u8,
}

impl BgapiCommand for ConnectDirect {
    const CLASS: u8 = class::GAP;
    const COMMAND: u8 = gap::CONNECT_DIRECT;
    type Reply = ConnectReply;

    fn payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(15);
        payload.extend_from_slice(&self.address);
        payload.push(self.address_type);
        payload.extend_from_slice(&gap::CONN_INTERVAL_MIN.to_le_bytes());
        payload.extend_from_slice(&gap::CONN_INTERVAL_MAX.to_le_bytes());
        payload.extend_from_slice(&gap::CONN_TIMEOUT.to_le_bytes());
        payload.extend_from_slice(&gap::CONN_LATENCY.to_le_bytes());
        payload
    }

    fn reply_timeout(&self) -> Duration {
        Duration::from_millis(timing::CONNECT_REPLY_MS)
    }
}

impl BgapiReply for ConnectReply {
    fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        require(payload, 3)?;
        Ok(Self {
            result: u16_at(payload, 0),
            handle: payload[2],
        })
    }
}

// =============================================================================
// Connection
// =============================================================================

/// Tear down a link by handle
#[derive(Debug, Clone, Copy)]
pub struct Disconnect {
    pub handle: u8,
}

impl BgapiCommand for Disconnect {
    const CLASS: u8 = class::CONNECTION;
    const COMMAND: u8 = connection::DISCONNECT;
    type Reply = HandleResultReply;

    fn payload(&self) -> Vec<u8> {
        vec![self.handle]
    }
}

// =============================================================================
// Attribute client (GATT)
// =============================================================================

/// Enumerate primary services over the whole handle range
#[derive(Debug, Clone, Copy)]
pub struct ReadByGroupType {
    pub handle: u8,
}

impl BgapiCommand for ReadByGroupType {
    const CLASS: u8 = class::ATTCLIENT;
    const COMMAND: u8 = attclient::READ_BY_GROUP_TYPE;
    type Reply = HandleResultReply;

    fn payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(8);
        payload.push(self.handle);
        payload.extend_from_slice(&1u16.to_le_bytes());
        payload.extend_from_slice(&0xFFFFu16.to_le_bytes());
        payload.push(2); // 16-bit group type UUID follows
        payload.extend_from_slice(&protocol::att::PRIMARY_SERVICE.to_le_bytes());
        payload
    }
}

/// Enumerate attribute handles and types within a range
#[derive(Debug, Clone, Copy)]
pub struct FindInformation {
    pub handle: u8,
    pub start: u16,
    pub end: u16,
}

impl BgapiCommand for FindInformation {
    const CLASS: u8 = class::ATTCLIENT;
    const COMMAND: u8 = attclient::FIND_INFORMATION;
    type Reply = HandleResultReply;

    fn payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(5);
        payload.push(self.handle);
        payload.extend_from_slice(&self.start.to_le_bytes());
        payload.extend_from_slice(&self.end.to_le_bytes());
        payload
    }
}

/// Read a single attribute value; the data arrives in a separate event
#[derive(Debug, Clone, Copy)]
pub struct ReadByHandle {
    pub handle: u8,
    pub attribute: u16,
}

impl BgapiCommand for ReadByHandle {
    const CLASS: u8 = class::ATTCLIENT;
    const COMMAND: u8 = attclient::READ_BY_HANDLE;
    type Reply = HandleResultReply;

    fn payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(3);
        payload.push(self.handle);
        payload.extend_from_slice(&self.attribute.to_le_bytes());
        payload
    }
}

/// Acknowledged attribute write (CCCD updates)
#[derive(Debug, Clone)]
pub struct WriteAttribute {
    pub handle: u8,
    pub attribute: u16,
    pub value: Vec<u8>,
}

impl BgapiCommand for WriteAttribute {
    const CLASS: u8 = class::ATTCLIENT;
    const COMMAND: u8 = attclient::ATTRIBUTE_WRITE;
    type Reply = HandleResultReply;

    fn payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(4 + self.value.len());
        payload.push(self.handle);
        payload.extend_from_slice(&self.attribute.to_le_bytes());
        payload.push(self.value.len() as u8);
        payload.extend_from_slice(&self.value);
        payload
    }
}

// =============================================================================
// Event payloads
// =============================================================================

/// Connection status event (class 3, event 0)
#[derive(Debug, Clone, Copy)]
pub struct ConnectionStatusEvent {
    pub handle: u8,
    pub flags: u8,
    pub address: [u8; 6],
    pub address_type: u8,
    pub conn_interval: u16,
    pub timeout: u16,
    pub latency: u16,
    pub bonding: u8,
}

impl ConnectionStatusEvent {
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        require(payload, 16)?;
        let mut address = [0u8; 6];
        address.copy_from_slice(&payload[2..8]);
        Ok(Self {
            handle: payload[0],
            flags: payload[1],
            address,
            address_type: payload[8],
            conn_interval: u16_at(payload, 9),
            timeout: u16_at(payload, 11),
            latency: u16_at(payload, 13),
            bonding: payload[15],
        })
    }

    pub fn connected(&self) -> bool {
        self.flags & connection::FLAG_CONNECTED != 0
    }
}

/// Disconnect event (class 3, event 4)
#[derive(Debug, Clone, Copy)]
pub struct DisconnectedEvent {
    pub handle: u8,
    pub reason: u16,
}

impl DisconnectedEvent {
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        require(payload, 3)?;
        Ok(Self {
            handle: payload[0],
            reason: u16_at(payload, 1),
        })
    }
}

/// Service group found event (class 4, event 2)
#[derive(Debug, Clone, Copy)]
pub struct GroupFoundEvent {
    pub handle: u8,
    pub start: u16,
    pub end: u16,
    pub uuid: Uuid,
}

impl GroupFoundEvent {
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        require(payload, 6)?;
        let uuid = parse_uuid_array(&payload[5..])?;
        Ok(Self {
            handle: payload[0],
            start: u16_at(payload, 1),
            end: u16_at(payload, 3),
            uuid,
        })
    }
}

/// Attribute information event (class 4, event 4)
#[derive(Debug, Clone, Copy)]
pub struct FindInformationFoundEvent {
    pub handle: u8,
    pub attribute: u16,
    pub uuid: Uuid,
}

impl FindInformationFoundEvent {
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        require(payload, 4)?;
        let uuid = parse_uuid_array(&payload[3..])?;
        Ok(Self {
            handle: payload[0],
            attribute: u16_at(payload, 1),
            uuid,
        })
    }
}

/// Attribute value event (class 4, event 5)
#[derive(Debug, Clone)]
pub struct AttributeValueEvent {
    pub handle: u8,
    pub attribute: u16,
    pub kind: u8,
    pub value: Vec<u8>,
}

impl AttributeValueEvent {
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        require(payload, 5)?;
        let len = payload[4] as usize;
        require(payload, 5 + len)?;
        Ok(Self {
            handle: payload[0],
            attribute: u16_at(payload, 1),
            kind: payload[3],
            value: payload[5..5 + len].to_vec(),
        })
    }
}

/// Procedure completed event (class 4, event 1)
#[derive(Debug, Clone, Copy)]
pub struct ProcedureCompletedEvent {
    pub handle: u8,
    pub result: u16,
    pub attribute: u16,
}

impl ProcedureCompletedEvent {
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        require(payload, 5)?;
        Ok(Self {
            handle: payload[0],
            result: u16_at(payload, 1),
            attribute: u16_at(payload, 3),
        })
    }
}

/// Parse a length-prefixed GATT UUID (2 or 16 bytes, little-endian)
fn parse_uuid_array(data: &[u8]) -> Result<Uuid, ParseError> {
    require(data, 1)?;
    let len = data[0] as usize;
    require(data, 1 + len)?;
    let bytes = &data[1..1 + len];
    match len {
        2 => Ok(protocol::expand_uuid16(u16::from_le_bytes([
            bytes[0], bytes[1],
        ]))),
        16 => {
            let mut le = [0u8; 16];
            le.copy_from_slice(bytes);
            Ok(Uuid::from_bytes_le(le))
        }
        _ => Err(ParseError::BadValue { field: "uuid" }),
    }
}

/// Decode a characteristic declaration attribute value:
/// `properties:u8, value_handle:u16, uuid (2 or 16 bytes)`
pub fn parse_characteristic_declaration(
    value: &[u8],
) -> Result<(CharacteristicProperties, u16, Uuid), ParseError> {
    let uuid = match value.len() {
        5 => protocol::expand_uuid16(u16::from_le_bytes([value[3], value[4]])),
        19 => {
            let mut le = [0u8; 16];
            le.copy_from_slice(&value[3..19]);
            Uuid::from_bytes_le(le)
        }
        _ => {
            return Err(ParseError::BadValue {
                field: "characteristic declaration",
            })
        }
    };
    let properties = CharacteristicProperties::from_bits(value[0]);
    let handle = u16_at(value, 1);
    Ok((properties, handle, uuid))
}
