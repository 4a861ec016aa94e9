//! TileBus advertisement parsing and scan-response assembly
//!
//! The dongle reports every broadcast it hears as a scan event. TileBus
//! devices split their data across two packets: the advertisement names the
//! service and carries the device UUID and status flags, the scan response
//! (requested only in active scanning) adds voltage, clock, and a visible
//! reading. The assembler pairs the two by sender address and emits one
//! discovery record per completed pair.
//!
//! RF is noisy: anything malformed is logged and dropped, never an error.

use std::collections::HashMap;
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::protocol::{self, tilebus};
use crate::types::{DiscoveredDevice, VisibleReading};

/// Advertising packet types from the scan event
pub mod packet_type {
    /// Connectable advertisement
    pub const ADVERTISEMENT: u8 = 0;
    /// Scan response follow-up
    pub const SCAN_RESPONSE: u8 = 4;
    /// Non-connectable advertisement
    pub const NONCONN_ADVERTISEMENT: u8 = 6;
}

/// Stream id a scan response uses when no reading is visible
const NO_VISIBLE_READING: u16 = 0xFFFF;

/// Decoded scan event payload, framing stripped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEvent {
    pub rssi: i8,
    pub packet_type: u8,
    /// Sender address in wire order (reversed)
    pub sender: [u8; 6],
    pub address_type: u8,
    pub bond: u8,
    /// Advertising data with its length prefix stripped
    pub scan_data: Vec<u8>,
}

impl ScanEvent {
    /// Printable address of the sender
    pub fn address(&self) -> String {
        protocol::format_ble_address(&self.sender)
    }
}

/// Parse the raw scan event payload:
/// `rssi:i8, packet_type:u8, sender:6, address_type:u8, bond:u8, data`
pub fn parse_scan_event(payload: &[u8]) -> Option<ScanEvent> {
    if payload.len() < 10 {
        warn!("scan event too short: {} bytes", payload.len());
        return None;
    }

    let mut sender = [0u8; 6];
    sender.copy_from_slice(&payload[2..8]);

    // The advertising data is prefixed with its own length byte.
    let data = &payload[10..];
    let scan_data = if data.is_empty() {
        Vec::new()
    } else {
        data[1..].to_vec()
    };

    Some(ScanEvent {
        rssi: payload[0] as i8,
        packet_type: payload[1],
        sender,
        address_type: payload[8],
        bond: payload[9],
        scan_data,
    })
}

/// Pairs advertisements with their scan responses and builds discovery
/// records for TileBus devices
pub struct ScanAssembler {
    /// Scan responses are only requested in active scanning
    active_scan: bool,
    /// Advertisements seen but not yet completed by a scan response,
    /// keyed by printable address
    partials: HashMap<String, DiscoveredDevice>,
}

impl ScanAssembler {
    pub fn new(active_scan: bool) -> Self {
        Self {
            active_scan,
            partials: HashMap::new(),
        }
    }

    /// Feed one scan event; returns a record when a discovery completes
    pub fn handle(&mut self, event: &ScanEvent) -> Option<DiscoveredDevice> {
        match event.packet_type {
            packet_type::ADVERTISEMENT | packet_type::NONCONN_ADVERTISEMENT => {
                self.handle_advertisement(event)
            }
            packet_type::SCAN_RESPONSE => self.handle_scan_response(event),
            _ => None,
        }
    }

    fn handle_advertisement(&mut self, event: &ScanEvent) -> Option<DiscoveredDevice> {
        let scan_data = &event.scan_data;
        if scan_data.len() < 29 {
            debug!("ignoring short advertisement: {} bytes", scan_data.len());
            return None;
        }

        // Skip the three BLE flag bytes.
        let body = &scan_data[3..];

        // Expect a 17-byte AD structure holding an incomplete 128-bit UUID list.
        if body[0] != 17 || body[1] != 0x06 {
            debug!(
                "ignoring advertisement without UUID list: len={} type=0x{:02X}",
                body[0], body[1]
            );
            return None;
        }

        let mut uuid_le = [0u8; 16];
        uuid_le.copy_from_slice(&body[2..18]);
        let service = uuid::Uuid::from_bytes_le(uuid_le);
        if service != tilebus::SERVICE {
            return None;
        }

        let manu = &body[18..];
        if manu.len() < 10 {
            warn!("TileBus advertisement with truncated manufacturer data");
            return None;
        }

        // length:u8, datatype:u8, manu_id:u16, device_uuid:u32, flags:u16
        let device_uuid = u32::from_le_bytes([manu[4], manu[5], manu[6], manu[7]]);
        let flags = u16::from_le_bytes([manu[8], manu[9]]);

        let device = DiscoveredDevice {
            connection_string: event.address(),
            uuid: device_uuid,
            signal_strength: event.rssi,
            address_type: event.address_type,
            pending_data: flags & (1 << 0) != 0,
            low_voltage: flags & (1 << 1) != 0,
            user_connected: flags & (1 << 2) != 0,
            voltage: None,
            current_time: None,
            visible_readings: Vec::new(),
            last_seen: None,
        };

        if self.active_scan {
            // Hold the record until its scan response arrives.
            self.partials.insert(device.connection_string.clone(), device);
            None
        } else {
            Some(device)
        }
    }

    fn handle_scan_response(&mut self, event: &ScanEvent) -> Option<DiscoveredDevice> {
        let address = event.address();
        if !self.partials.contains_key(&address) {
            return None;
        }

        let scan_data = &event.scan_data;
        if scan_data.len() != 31 {
            warn!(
                "malformed scan response from {}: {} bytes",
                address,
                scan_data.len()
            );
            return None;
        }

        // length:u8, datatype:u8, manu_id:u16, voltage:u16, stream:u16,
        // reading:u32, reading_time:u32, current_time:u32, reserved[11]
        let voltage = u16::from_le_bytes([scan_data[4], scan_data[5]]);
        let stream = u16::from_le_bytes([scan_data[6], scan_data[7]]);
        let reading = u32::from_le_bytes([scan_data[8], scan_data[9], scan_data[10], scan_data[11]]);
        let reading_time =
            u32::from_le_bytes([scan_data[12], scan_data[13], scan_data[14], scan_data[15]]);
        let current_time =
            u32::from_le_bytes([scan_data[16], scan_data[17], scan_data[18], scan_data[19]]);

        let mut device = self.partials.remove(&address)?;
        device.voltage = Some(voltage as f32 / 256.0);
        device.current_time = Some(current_time);
        device.last_seen = Some(SystemTime::now());
        if stream != NO_VISIBLE_READING {
            device.visible_readings.push(VisibleReading {
                stream,
                timestamp: reading_time,
                value: reading,
            });
        }

        Some(device)
    }

    /// Number of advertisements still waiting for their scan response
    pub fn pending(&self) -> usize {
        self.partials.len()
    }
}
