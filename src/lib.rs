//! BLED112 dongle transport for TileBus IoT devices
//!
//! The BLED112 is a USB BLE dongle driven over a serial link with the
//! BGAPI binary protocol. This crate multiplexes scanning, multiple
//! simultaneous connections, GATT discovery, and disconnection over that
//! single link and exposes a callback-based adapter to higher layers:
//!
//! ```text
//! [serial port] → PacketStream → CommandProcessor → Bled112Adapter
//!                  (framing)      (one command       (lifecycle,
//!                                  in flight,         scan assembly,
//!                                  event routing)     callbacks)
//! ```
//!
//! A dedicated reader thread turns serial bytes into whole BGAPI packets;
//! a dedicated worker thread owns the dongle and executes one queued
//! operation at a time, forwarding unsolicited events (advertisements,
//! spontaneous disconnects) as they interleave with command traffic.

pub mod adapter;
pub mod command;
pub mod command_processor;
pub mod error;
pub mod protocol;
pub mod scan_parser;
pub mod stream;
pub mod types;

pub use adapter::{AdapterConfig, Bled112Adapter, ConnectCallback, DisconnectCallback};
pub use command_processor::{
    command_channel, CommandProcessor, CommandSender, EventSink, Operation, OperationOutput,
    OperationResult,
};
pub use error::TransportError;
pub use protocol::{tilebus, BgapiPacket};
pub use scan_parser::{parse_scan_event, ScanAssembler, ScanEvent};
pub use stream::{PacketStream, StreamItem};
pub use types::{
    CharacteristicProperties, ClientConfiguration, ConnectionState, DiscoveredDevice,
    GattCharacteristic, GattService, ServiceMap, VisibleReading,
};
