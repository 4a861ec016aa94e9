//! Scripted in-memory dongle for end-to-end adapter tests
//!
//! `MockDongle` stands in for the serial port: the adapter's writes are
//! reframed into packets and handed to a responder closure, whose replies
//! and events are queued for the adapter's reader thread. The reader half
//! mimics a serial port with a 10 ms read timeout.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tilebus_bled112::protocol;
use tilebus_bled112::tilebus;
use tilebus_bled112::BgapiPacket;
use uuid::Uuid;

type Responder = Box<dyn FnMut(&BgapiPacket) -> Vec<BgapiPacket> + Send>;

#[derive(Default)]
struct MockState {
    incoming: VecDeque<u8>,
    written: Vec<BgapiPacket>,
    partial: Vec<u8>,
    responder: Option<Responder>,
    closed: bool,
}

struct Inner {
    state: Mutex<MockState>,
    available: Condvar,
}

#[derive(Clone)]
pub struct MockDongle {
    inner: Arc<Inner>,
}

impl MockDongle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(MockState::default()),
                available: Condvar::new(),
            }),
        }
    }

    pub fn set_responder(
        &self,
        responder: impl FnMut(&BgapiPacket) -> Vec<BgapiPacket> + Send + 'static,
    ) {
        self.inner.state.lock().unwrap().responder = Some(Box::new(responder));
    }

    /// Reader/writer halves for `Bled112Adapter::from_stream`
    pub fn halves(&self) -> (Box<dyn Read + Send>, Box<dyn Write + Send>) {
        (
            Box::new(MockReader {
                inner: Arc::clone(&self.inner),
            }),
            Box::new(MockWriter {
                inner: Arc::clone(&self.inner),
            }),
        )
    }

    /// Queue an unsolicited packet for the adapter to read
    pub fn inject(&self, packet: &BgapiPacket) {
        let mut state = self.inner.state.lock().unwrap();
        state.incoming.extend(packet.encode());
        self.inner.available.notify_all();
    }

    /// Everything the adapter has written, reframed
    pub fn written(&self) -> Vec<BgapiPacket> {
        self.inner.state.lock().unwrap().written.clone()
    }

    /// Simulate the serial link dying (EOF on the next read)
    pub fn kill(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.closed = true;
        self.inner.available.notify_all();
    }
}

struct MockReader {
    inner: Arc<Inner>,
}

impl Read for MockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.inner.state.lock().unwrap();
        if state.incoming.is_empty() {
            if state.closed {
                return Ok(0);
            }
            let (guard, _) = self
                .inner
                .available
                .wait_timeout(state, Duration::from_millis(10))
                .unwrap();
            state = guard;
            if state.incoming.is_empty() {
                if state.closed {
                    return Ok(0);
                }
                return Err(io::Error::new(io::ErrorKind::TimedOut, "mock read timeout"));
            }
        }
        let n = buf.len().min(state.incoming.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.incoming.pop_front().unwrap();
        }
        Ok(n)
    }
}

struct MockWriter {
    inner: Arc<Inner>,
}

impl Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut packets = Vec::new();
        {
            let mut state = self.inner.state.lock().unwrap();
            state.partial.extend_from_slice(buf);
            loop {
                if state.partial.len() < 4 {
                    break;
                }
                let mut header = [0u8; 4];
                header.copy_from_slice(&state.partial[..4]);
                let length = protocol::payload_length(&header);
                if state.partial.len() < 4 + length {
                    break;
                }
                let payload = state.partial[4..4 + length].to_vec();
                state.partial.drain(..4 + length);
                let packet = BgapiPacket::from_wire(&header, payload);
                state.written.push(packet.clone());
                packets.push(packet);
            }
        }

        // Run the responder outside the lock so it can inject freely.
        for packet in packets {
            let responder = self.inner.state.lock().unwrap().responder.take();
            if let Some(mut responder) = responder {
                let replies = responder(&packet);
                let mut state = self.inner.state.lock().unwrap();
                state.responder = Some(responder);
                for reply in replies {
                    state.incoming.extend(reply.encode());
                }
                self.inner.available.notify_all();
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// =============================================================================
// Packet builders
// =============================================================================

pub fn reply(class: u8, command: u8, payload: Vec<u8>) -> BgapiPacket {
    BgapiPacket::command(class, command, payload)
}

pub fn event(class: u8, command: u8, payload: Vec<u8>) -> BgapiPacket {
    BgapiPacket::event(class, command, payload)
}

pub fn connection_status(handle: u8, flags: u8) -> BgapiPacket {
    let mut payload = vec![handle, flags];
    payload.extend_from_slice(&[0u8; 6]); // address
    payload.push(0); // address type
    payload.extend_from_slice(&6u16.to_le_bytes()); // interval
    payload.extend_from_slice(&100u16.to_le_bytes()); // timeout
    payload.extend_from_slice(&0u16.to_le_bytes()); // latency
    payload.push(0xFF); // bonding
    event(3, 0, payload)
}

pub fn disconnected(handle: u8, reason: u16) -> BgapiPacket {
    let mut payload = vec![handle];
    payload.extend_from_slice(&reason.to_le_bytes());
    event(3, 4, payload)
}

pub fn group_found(handle: u8, start: u16, end: u16, uuid: Uuid) -> BgapiPacket {
    let mut payload = vec![handle];
    payload.extend_from_slice(&start.to_le_bytes());
    payload.extend_from_slice(&end.to_le_bytes());
    payload.push(16);
    payload.extend_from_slice(&uuid.to_bytes_le());
    event(4, 2, payload)
}

pub fn find_information_found(handle: u8, attribute: u16, uuid_le: &[u8]) -> BgapiPacket {
    let mut payload = vec![handle];
    payload.extend_from_slice(&attribute.to_le_bytes());
    payload.push(uuid_le.len() as u8);
    payload.extend_from_slice(uuid_le);
    event(4, 4, payload)
}

pub fn attribute_value(handle: u8, attribute: u16, value: &[u8]) -> BgapiPacket {
    let mut payload = vec![handle];
    payload.extend_from_slice(&attribute.to_le_bytes());
    payload.push(0); // read-by-handle
    payload.push(value.len() as u8);
    payload.extend_from_slice(value);
    event(4, 5, payload)
}

pub fn procedure_completed(handle: u8, result: u16, attribute: u16) -> BgapiPacket {
    let mut payload = vec![handle];
    payload.extend_from_slice(&result.to_le_bytes());
    payload.extend_from_slice(&attribute.to_le_bytes());
    event(4, 1, payload)
}

/// Wire-order address for `AA:BB:CC:DD:EE:FF`
pub const MAC_WIRE: [u8; 6] = [0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA];

pub fn advertisement(mac_wire: [u8; 6], device_uuid: u32, flags: u16) -> BgapiPacket {
    let mut adv = Vec::new();
    adv.extend_from_slice(&[0x02, 0x01, 0x06]); // BLE flags
    adv.push(17);
    adv.push(0x06); // incomplete 128-bit UUID list
    adv.extend_from_slice(&tilebus::SERVICE.to_bytes_le());
    adv.push(9);
    adv.push(0xFF); // manufacturer-specific
    adv.extend_from_slice(&tilebus::ARCH_MANUFACTURER_ID.to_le_bytes());
    adv.extend_from_slice(&device_uuid.to_le_bytes());
    adv.extend_from_slice(&flags.to_le_bytes());

    let mut payload = vec![0xC5, 0]; // rssi, connectable advertisement
    payload.extend_from_slice(&mac_wire);
    payload.push(0); // address type
    payload.push(0); // bond
    payload.push(adv.len() as u8);
    payload.extend_from_slice(&adv);
    event(6, 0, payload)
}

pub fn scan_response(
    mac_wire: [u8; 6],
    voltage: u16,
    stream: u16,
    reading: u32,
    reading_time: u32,
    current_time: u32,
) -> BgapiPacket {
    let mut data = Vec::new();
    data.push(30);
    data.push(0xFF);
    data.extend_from_slice(&tilebus::ARCH_MANUFACTURER_ID.to_le_bytes());
    data.extend_from_slice(&voltage.to_le_bytes());
    data.extend_from_slice(&stream.to_le_bytes());
    data.extend_from_slice(&reading.to_le_bytes());
    data.extend_from_slice(&reading_time.to_le_bytes());
    data.extend_from_slice(&current_time.to_le_bytes());
    data.extend_from_slice(&[0u8; 11]);
    assert_eq!(data.len(), 31);

    let mut payload = vec![0xC5, 4]; // rssi, scan response
    payload.extend_from_slice(&mac_wire);
    payload.push(0);
    payload.push(0);
    payload.push(data.len() as u8);
    payload.extend_from_slice(&data);
    event(6, 0, payload)
}

// =============================================================================
// Standard dongle behavior
// =============================================================================

/// Configurable emulation of the interesting parts of a BLED112 with one
/// TileBus peripheral in range
pub struct DongleBehavior {
    pub max_connections: u8,
    /// Handles reported live at startup
    pub active_handles: Vec<u8>,
    /// `(result, handle)` consumed per connect attempt
    pub connect_results: VecDeque<(u16, u8)>,
    /// Drop the link with this reason instead of answering the service probe
    pub drop_during_service_probe: Option<u16>,
    /// Acknowledge the service probe but never send its events, leaving the
    /// procedure to run out its collection window
    pub stall_service_probe: bool,
    /// Advertise the TileBus service in the GATT table
    pub include_tilebus: bool,
}

impl Default for DongleBehavior {
    fn default() -> Self {
        Self {
            max_connections: 3,
            active_handles: Vec::new(),
            connect_results: VecDeque::from([(0, 3)]),
            drop_during_service_probe: None,
            stall_service_probe: false,
            include_tilebus: true,
        }
    }
}

// GATT fixture: generic access at 1..=7, TileBus at 8..=16.
const GENERIC_ACCESS_START: u16 = 1;
const GENERIC_ACCESS_END: u16 = 7;
const TILEBUS_START: u16 = 8;
const TILEBUS_END: u16 = 16;

const ATT_NAME_DECL: u16 = 2;
const ATT_NAME_VALUE: u16 = 3;
const ATT_RECV_HEADER_DECL: u16 = 9;
const ATT_RECV_HEADER_VALUE: u16 = 10;
const ATT_RECV_HEADER_CCCD: u16 = 11;
const ATT_RECV_PAYLOAD_DECL: u16 = 12;
const ATT_RECV_PAYLOAD_VALUE: u16 = 13;
const ATT_RECV_PAYLOAD_CCCD: u16 = 14;

fn uuid16_le(short: u16) -> Vec<u8> {
    short.to_le_bytes().to_vec()
}

fn declaration16(props: u8, value_handle: u16, short: u16) -> Vec<u8> {
    let mut decl = vec![props];
    decl.extend_from_slice(&value_handle.to_le_bytes());
    decl.extend_from_slice(&short.to_le_bytes());
    decl
}

fn declaration128(props: u8, value_handle: u16, uuid: Uuid) -> Vec<u8> {
    let mut decl = vec![props];
    decl.extend_from_slice(&value_handle.to_le_bytes());
    decl.extend_from_slice(&uuid.to_bytes_le());
    decl
}

fn u16_at(payload: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([payload[offset], payload[offset + 1]])
}

/// Build a responder closure emulating `behavior`
pub fn standard_behavior(
    mut behavior: DongleBehavior,
) -> impl FnMut(&BgapiPacket) -> Vec<BgapiPacket> + Send + 'static {
    move |packet: &BgapiPacket| -> Vec<BgapiPacket> {
        match (packet.class, packet.command) {
            // System: connection pool query
            (0, 6) => {
                let mut out = vec![reply(0, 6, vec![behavior.max_connections])];
                for &handle in &behavior.active_handles {
                    out.push(connection_status(handle, 0x05));
                }
                out
            }

            // GAP: scan parameters / discover / end procedure
            (6, 7) => vec![reply(6, 7, vec![0, 0])],
            (6, 2) => vec![reply(6, 2, vec![0, 0])],
            (6, 4) => vec![reply(6, 4, vec![0, 0])],

            // GAP: connect
            (6, 3) => {
                let (result, handle) = behavior.connect_results.pop_front().unwrap_or((0x0181, 0));
                let mut payload = result.to_le_bytes().to_vec();
                payload.push(handle);
                let mut out = vec![reply(6, 3, payload)];
                if result == 0 {
                    out.push(connection_status(handle, 0x05));
                }
                out
            }

            // Connection: disconnect
            (3, 0) => {
                let handle = packet.payload[0];
                let mut payload = vec![handle];
                payload.extend_from_slice(&0u16.to_le_bytes());
                vec![reply(3, 0, payload), disconnected(handle, 0x0016)]
            }

            // Attclient: read by group type (service enumeration)
            (4, 1) => {
                let handle = packet.payload[0];
                let mut payload = vec![handle];
                payload.extend_from_slice(&0u16.to_le_bytes());
                // A stalled probe gets the reply only: no group events, no
                // terminator, so the procedure runs out its window.
                let mut out = vec![reply(4, 1, payload)];
                if let Some(reason) = behavior.drop_during_service_probe {
                    out.push(disconnected(handle, reason));
                    out.push(procedure_completed(handle, reason, 0));
                } else if !behavior.stall_service_probe {
                    out.push(group_found(
                        handle,
                        GENERIC_ACCESS_START,
                        GENERIC_ACCESS_END,
                        protocol::expand_uuid16(0x1800),
                    ));
                    if behavior.include_tilebus {
                        out.push(group_found(handle, TILEBUS_START, TILEBUS_END, tilebus::SERVICE));
                    }
                    out.push(procedure_completed(handle, 0, 0xFFFF));
                }
                out
            }

            // Attclient: find information
            (4, 3) => {
                let handle = packet.payload[0];
                let start = u16_at(&packet.payload, 1);
                let mut payload = vec![handle];
                payload.extend_from_slice(&0u16.to_le_bytes());
                let mut out = vec![reply(4, 3, payload)];
                if start == GENERIC_ACCESS_START {
                    out.push(find_information_found(handle, ATT_NAME_DECL, &uuid16_le(0x2803)));
                    out.push(find_information_found(handle, ATT_NAME_VALUE, &uuid16_le(0x2A00)));
                } else if start == TILEBUS_START {
                    out.push(find_information_found(
                        handle,
                        ATT_RECV_HEADER_DECL,
                        &uuid16_le(0x2803),
                    ));
                    out.push(find_information_found(
                        handle,
                        ATT_RECV_HEADER_VALUE,
                        &tilebus::RECEIVE_HEADER.to_bytes_le(),
                    ));
                    out.push(find_information_found(
                        handle,
                        ATT_RECV_HEADER_CCCD,
                        &uuid16_le(0x2902),
                    ));
                    out.push(find_information_found(
                        handle,
                        ATT_RECV_PAYLOAD_DECL,
                        &uuid16_le(0x2803),
                    ));
                    out.push(find_information_found(
                        handle,
                        ATT_RECV_PAYLOAD_VALUE,
                        &tilebus::RECEIVE_PAYLOAD.to_bytes_le(),
                    ));
                    out.push(find_information_found(
                        handle,
                        ATT_RECV_PAYLOAD_CCCD,
                        &uuid16_le(0x2902),
                    ));
                }
                out.push(procedure_completed(handle, 0, 0));
                out
            }

            // Attclient: read by handle
            (4, 4) => {
                let handle = packet.payload[0];
                let attribute = u16_at(&packet.payload, 1);
                let mut payload = vec![handle];
                payload.extend_from_slice(&0u16.to_le_bytes());
                let mut out = vec![reply(4, 4, payload)];
                let value = match attribute {
                    ATT_NAME_DECL => declaration16(0x02, ATT_NAME_VALUE, 0x2A00),
                    ATT_RECV_HEADER_DECL => {
                        declaration128(0x10, ATT_RECV_HEADER_VALUE, tilebus::RECEIVE_HEADER)
                    }
                    ATT_RECV_PAYLOAD_DECL => {
                        declaration128(0x10, ATT_RECV_PAYLOAD_VALUE, tilebus::RECEIVE_PAYLOAD)
                    }
                    ATT_RECV_HEADER_CCCD | ATT_RECV_PAYLOAD_CCCD => vec![0, 0],
                    _ => vec![0],
                };
                out.push(attribute_value(handle, attribute, &value));
                out
            }

            // Attclient: attribute write (CCCD)
            (4, 5) => {
                let handle = packet.payload[0];
                let attribute = u16_at(&packet.payload, 1);
                let mut payload = vec![handle];
                payload.extend_from_slice(&0u16.to_le_bytes());
                vec![
                    reply(4, 5, payload),
                    procedure_completed(handle, 0, attribute),
                ]
            }

            _ => Vec::new(),
        }
    }
}
