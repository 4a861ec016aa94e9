//! Single-threaded dongle worker
//!
//! The BLED112 accepts exactly one outstanding command, so a dedicated
//! worker thread owns the dongle: every submission, synchronous or
//! asynchronous, lands on one FIFO queue and is executed to completion
//! before the next starts. Unsolicited events that arrive while a command
//! is waiting for its reply are forwarded to the event sink immediately,
//! which is how spontaneous disconnects interleave with long GATT
//! procedures.
//!
//! Classification is by the header's event bit, never by class/command: a
//! non-event packet always belongs to the command currently in flight, and
//! a reply with nothing in flight is a protocol error that gets logged and
//! dropped.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::command::{
    BgapiCommand, BgapiReply, ConnectDirect, ConnectionStatusEvent, Disconnect, Discover,
    EndProcedure, FindInformation, FindInformationFoundEvent, GetConnections, GroupFoundEvent,
    ProcedureCompletedEvent, ReadByGroupType, ReadByHandle, SetScanParameters, WriteAttribute,
    AttributeValueEvent, parse_characteristic_declaration,
};
use crate::error::TransportError;
use crate::protocol::{self, attclient, class, connection, tilebus, timing, BgapiPacket};
use crate::stream::{PacketStream, StreamItem};
use crate::types::{ClientConfiguration, GattCharacteristic, GattService, ServiceMap};

/// One queued unit of work for the worker
///
/// Operations are deliberately coarser than wire commands: a single
/// operation may span several commands and event collections (GATT
/// discovery most of all), but the dongle still only ever sees one command
/// at a time.
#[derive(Debug)]
pub enum Operation {
    /// Learn the connection pool size and which handles are already live
    QuerySystemState,
    StartScan { active: bool },
    StopScan,
    /// Dial a device by its printable address
    Connect { address: String },
    Disconnect { handle: u8 },
    /// Enumerate primary services
    ProbeServices { handle: u8 },
    /// Fill a service table with characteristics and CCCDs
    ProbeCharacteristics { handle: u8, services: ServiceMap },
    /// Turn on notifications for the TileBus RPC characteristics
    EnableRpcs { handle: u8, services: ServiceMap },
}

/// Typed result of a completed operation
#[derive(Debug)]
pub enum OperationOutput {
    SystemState {
        max_connections: u8,
        active_handles: Vec<u8>,
    },
    ConnectionOpened { handle: u8 },
    ConnectionClosed { handle: u8 },
    ServiceTable(ServiceMap),
    Done,
}

pub type OperationResult = Result<OperationOutput, TransportError>;

/// Completion hook invoked on the worker thread when an operation finishes
pub type Completion = Box<dyn FnOnce(OperationResult) + Send>;

/// Receiver half for unsolicited traffic
pub trait EventSink: Send {
    /// Called for every unsolicited event packet, on the worker thread
    fn handle_event(&mut self, event: &BgapiPacket);
    /// Called once when the serial transport dies
    fn transport_closed(&mut self);
}

enum Request {
    Execute { op: Operation, done: Completion },
    Shutdown,
}

/// Cloneable submission handle to the worker queue
#[derive(Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<Request>,
}

impl CommandSender {
    /// Queue an operation; the completion fires exactly once, with
    /// `TransportLost` if the worker is already gone.
    pub fn submit(&self, op: Operation, done: Completion) {
        if let Err(mpsc::SendError(request)) = self.tx.send(Request::Execute { op, done }) {
            if let Request::Execute { done, .. } = request {
                done(Err(TransportError::TransportLost));
            }
        }
    }

    /// Queue an operation and block until it completes
    pub fn execute(&self, op: Operation) -> OperationResult {
        let (tx, rx) = oneshot::channel();
        self.submit(
            op,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        futures::executor::block_on(rx).unwrap_or(Err(TransportError::TransportLost))
    }
}

/// Receiver half of the request queue, consumed by `CommandProcessor::start`
pub struct RequestReceiver {
    rx: Receiver<Request>,
    tx: mpsc::Sender<Request>,
}

/// Create the request queue shared by the facade and the worker
pub fn command_channel() -> (CommandSender, RequestReceiver) {
    let (tx, rx) = mpsc::channel();
    (
        CommandSender { tx: tx.clone() },
        RequestReceiver { rx, tx },
    )
}

/// Owns the dongle worker thread
pub struct CommandProcessor {
    shutdown: mpsc::Sender<Request>,
    worker: Option<JoinHandle<()>>,
}

impl CommandProcessor {
    /// Spawn the worker thread over a framed stream
    pub fn start(
        stream: Arc<PacketStream>,
        packets: Receiver<StreamItem>,
        requests: RequestReceiver,
        sink: Box<dyn EventSink>,
    ) -> Self {
        let worker = Worker {
            stream,
            packets,
            requests: requests.rx,
            sink,
            transport_lost: false,
        };
        let handle = thread::Builder::new()
            .name("bled112-worker".into())
            .spawn(move || worker.run())
            .expect("failed to spawn command worker thread");

        Self {
            shutdown: requests.tx,
            worker: Some(handle),
        }
    }

    /// Ask the worker to exit after draining its queue, then join it.
    /// Idempotent.
    pub fn stop(&mut self) {
        let _ = self.shutdown.send(Request::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

struct Worker {
    stream: Arc<PacketStream>,
    packets: Receiver<StreamItem>,
    requests: Receiver<Request>,
    sink: Box<dyn EventSink>,
    transport_lost: bool,
}

impl Worker {
    fn run(mut self) {
        debug!("command worker started");

        loop {
            self.drain_events();
            if self.transport_lost {
                break;
            }

            match self
                .requests
                .recv_timeout(Duration::from_millis(timing::REQUEST_POLL_MS))
            {
                Ok(Request::Execute { op, done }) => {
                    let result = self.execute(op);
                    done(result);
                }
                Ok(Request::Shutdown) => break,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if self.transport_lost {
            info!("serial transport lost, shutting down command worker");
            self.sink.transport_closed();
        }

        // Fail whatever is still queued so no completion is ever dropped
        // silently.
        while let Ok(request) = self.requests.try_recv() {
            if let Request::Execute { done, .. } = request {
                done(Err(TransportError::TransportLost));
            }
        }

        debug!("command worker exiting");
    }

    /// Dispatch everything already sitting in the packet queue
    fn drain_events(&mut self) {
        while let Ok(item) = self.packets.try_recv() {
            match item {
                StreamItem::Packet(packet) if packet.is_event => self.sink.handle_event(&packet),
                StreamItem::Packet(packet) => warn!(
                    "dropping reply with no command in flight: class={} command={}",
                    packet.class, packet.command
                ),
                StreamItem::Closed => {
                    self.transport_lost = true;
                    return;
                }
            }
        }
    }

    fn execute(&mut self, op: Operation) -> OperationResult {
        if self.transport_lost {
            return Err(TransportError::TransportLost);
        }

        match op {
            Operation::QuerySystemState => self.query_system_state(),
            Operation::StartScan { active } => self.start_scan(active),
            Operation::StopScan => self.stop_scan(),
            Operation::Connect { address } => self.connect(&address),
            Operation::Disconnect { handle } => self.disconnect(handle),
            Operation::ProbeServices { handle } => self.probe_services(handle),
            Operation::ProbeCharacteristics { handle, services } => {
                self.probe_characteristics(handle, services)
            }
            Operation::EnableRpcs { handle, services } => self.enable_rpcs(handle, services),
        }
    }

    // ------------------------------------------------------------------
    // Wire primitives
    // ------------------------------------------------------------------

    /// Send one command and return its decoded reply, forwarding any events
    /// that arrive in between
    fn send_command<C: BgapiCommand>(&mut self, command: &C) -> Result<C::Reply, TransportError> {
        let packet = command.packet();
        if let Err(e) = self.stream.write_packet(&packet) {
            warn!("serial write failed: {}", e);
            self.transport_lost = true;
            return Err(TransportError::TransportLost);
        }

        let reply = self.receive_reply(command.reply_timeout())?;
        if !reply.matches(C::CLASS, C::COMMAND) {
            // The dongle serializes strictly, so this reply still answers the
            // in-flight command even if the echo looks wrong.
            warn!(
                "reply echo mismatch: sent ({}, {}), got ({}, {})",
                C::CLASS,
                C::COMMAND,
                reply.class,
                reply.command
            );
        }
        C::Reply::parse(&reply.payload)
            .map_err(|e| TransportError::ProtocolViolation(e.to_string()))
    }

    /// Wait for the next reply packet, routing events to the sink
    fn receive_reply(&mut self, timeout: Duration) -> Result<BgapiPacket, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout);
            }
            match self.packets.recv_timeout(remaining) {
                Ok(StreamItem::Packet(packet)) if packet.is_event => {
                    self.sink.handle_event(&packet)
                }
                Ok(StreamItem::Packet(packet)) => return Ok(packet),
                Ok(StreamItem::Closed) | Err(RecvTimeoutError::Disconnected) => {
                    self.transport_lost = true;
                    return Err(TransportError::TransportLost);
                }
                Err(RecvTimeoutError::Timeout) => return Err(TransportError::Timeout),
            }
        }
    }

    /// Collect events matching `collect` until `end` matches or the window
    /// elapses. Everything else is forwarded to the sink; the end event is
    /// returned separately and never forwarded.
    fn wait_events(
        &mut self,
        window: Duration,
        mut collect: impl FnMut(&BgapiPacket) -> bool,
        mut end: impl FnMut(&BgapiPacket) -> bool,
    ) -> Result<(Vec<BgapiPacket>, Option<BgapiPacket>), TransportError> {
        let deadline = Instant::now() + window;
        let mut collected = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok((collected, None));
            }
            match self.packets.recv_timeout(remaining) {
                Ok(StreamItem::Packet(packet)) if packet.is_event => {
                    if end(&packet) {
                        return Ok((collected, Some(packet)));
                    }
                    if collect(&packet) {
                        collected.push(packet);
                    } else {
                        self.sink.handle_event(&packet);
                    }
                }
                Ok(StreamItem::Packet(packet)) => warn!(
                    "dropping unexpected reply during event wait: class={} command={}",
                    packet.class, packet.command
                ),
                Ok(StreamItem::Closed) | Err(RecvTimeoutError::Disconnected) => {
                    self.transport_lost = true;
                    return Err(TransportError::TransportLost);
                }
                Err(RecvTimeoutError::Timeout) => return Ok((collected, None)),
            }
        }
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    fn query_system_state(&mut self) -> OperationResult {
        let reply = self.send_command(&GetConnections)?;

        // One status event follows per connection slot; collect them for a
        // fixed window since there is no terminator.
        let (events, _) = self.wait_events(
            Duration::from_millis(timing::SYSTEM_STATE_MS),
            |p| p.matches(class::CONNECTION, connection::EVT_STATUS),
            |_| false,
        )?;

        let mut active_handles = Vec::new();
        for event in &events {
            match ConnectionStatusEvent::parse(&event.payload) {
                Ok(status) if status.connected() => active_handles.push(status.handle),
                Ok(_) => {}
                Err(e) => warn!("bad connection status event: {}", e),
            }
        }

        Ok(OperationOutput::SystemState {
            max_connections: reply.max_connections,
            active_handles,
        })
    }

    fn start_scan(&mut self, active: bool) -> OperationResult {
        let params = self.send_command(&SetScanParameters { active })?;
        if !params.ok() {
            return Err(TransportError::DeviceRejected(format!(
                "set scan parameters failed, result=0x{:04X}",
                params.result
            )));
        }

        let reply = self.send_command(&Discover)?;
        if !reply.ok() {
            return Err(TransportError::DeviceRejected(format!(
                "start discovery failed, result=0x{:04X}",
                reply.result
            )));
        }
        Ok(OperationOutput::Done)
    }

    fn stop_scan(&mut self) -> OperationResult {
        let reply = self.send_command(&EndProcedure)?;
        if !reply.ok() {
            // Scanning was already stopped, e.g. by a connect attempt.
            debug!(
                "stop scan returned 0x{:04X}, treating as already stopped",
                reply.result
            );
        }
        Ok(OperationOutput::Done)
    }

    fn connect(&mut self, address: &str) -> OperationResult {
        let wire = protocol::parse_ble_address(address)?;
        let command = ConnectDirect {
            address: wire,
            address_type: protocol::address_type_for(&wire),
        };
        let reply = self.send_command(&command)?;
        if reply.result != 0 {
            return Err(TransportError::DeviceRejected(format!(
                "connect to {} rejected, result=0x{:04X}",
                address, reply.result
            )));
        }

        // The reply only reserves a handle; the link exists once the status
        // event shows up.
        let pending = reply.handle;
        let (_, status) = self.wait_events(
            Duration::from_millis(timing::CONNECT_EVENT_MS),
            |_| false,
            |p| {
                p.matches(class::CONNECTION, connection::EVT_STATUS)
                    && p.payload.first() == Some(&pending)
            },
        )?;

        match status {
            Some(_) => {
                debug!("connected to {} on handle {}", address, pending);
                Ok(OperationOutput::ConnectionOpened { handle: pending })
            }
            None => {
                // Cancel the pending dial so the dongle is free again.
                let _ = self.send_command(&EndProcedure);
                Err(TransportError::Timeout)
            }
        }
    }

    fn disconnect(&mut self, handle: u8) -> OperationResult {
        let reply = self.send_command(&Disconnect { handle })?;
        if reply.result != 0 {
            return Err(TransportError::DeviceRejected(format!(
                "disconnect of handle {} rejected, result=0x{:04X}",
                handle, reply.result
            )));
        }

        // Consume the matching disconnect event here so it is not mistaken
        // for a spontaneous drop.
        let (_, event) = self.wait_events(
            Duration::from_millis(timing::DISCONNECT_EVENT_MS),
            |_| false,
            |p| {
                p.matches(class::CONNECTION, connection::EVT_DISCONNECTED)
                    && p.payload.first() == Some(&handle)
            },
        )?;

        if event.is_none() {
            return Err(TransportError::Timeout);
        }
        Ok(OperationOutput::ConnectionClosed { handle })
    }

    fn probe_services(&mut self, handle: u8) -> OperationResult {
        let reply = self.send_command(&ReadByGroupType { handle })?;
        if reply.result != 0 {
            return Err(TransportError::DeviceRejected(format!(
                "service enumeration rejected, result=0x{:04X}",
                reply.result
            )));
        }

        let (events, end) = self.wait_events(
            Duration::from_millis(timing::SERVICE_DISCOVERY_MS),
            |p| {
                p.matches(class::ATTCLIENT, attclient::EVT_GROUP_FOUND)
                    && p.payload.first() == Some(&handle)
            },
            |p| {
                p.matches(class::ATTCLIENT, attclient::EVT_PROCEDURE_COMPLETED)
                    && p.payload.first() == Some(&handle)
            },
        )?;

        let end = end.ok_or(TransportError::Timeout)?;
        let completed = ProcedureCompletedEvent::parse(&end.payload)
            .map_err(|e| TransportError::ProtocolViolation(e.to_string()))?;
        if completed.result != 0 {
            warn!(
                "error enumerating GATT table, protocol error code=0x{:04X}",
                completed.result
            );
            return Err(TransportError::DeviceRejected(format!(
                "service enumeration failed, result=0x{:04X}",
                completed.result
            )));
        }

        let mut services = ServiceMap::new();
        for event in &events {
            match GroupFoundEvent::parse(&event.payload) {
                Ok(group) => {
                    services.insert(
                        group.uuid,
                        GattService {
                            uuid: group.uuid,
                            start_handle: group.start,
                            end_handle: group.end,
                            characteristics: Default::default(),
                        },
                    );
                }
                Err(e) => warn!("bad group found event: {}", e),
            }
        }

        Ok(OperationOutput::ServiceTable(services))
    }

    fn probe_characteristics(&mut self, handle: u8, mut services: ServiceMap) -> OperationResult {
        let declaration_uuid = protocol::expand_uuid16(protocol::att::CHARACTERISTIC_DECLARATION);
        let client_config_uuid = protocol::expand_uuid16(protocol::att::CLIENT_CONFIGURATION);

        let mut ranges: Vec<(uuid::Uuid, u16, u16)> = services
            .values()
            .map(|s| (s.uuid, s.start_handle, s.end_handle))
            .collect();
        ranges.sort_by_key(|&(_, start, _)| start);

        for (service_uuid, start, end) in ranges {
            let attributes = self.enumerate_handles(handle, start, end)?;
            let Some(service) = services.get_mut(&service_uuid) else {
                continue;
            };

            let mut last_char: Option<uuid::Uuid> = None;
            for (attribute, att_uuid) in attributes {
                if att_uuid == declaration_uuid {
                    let value = self.read_handle(handle, attribute)?;
                    let (properties, value_handle, char_uuid) =
                        parse_characteristic_declaration(&value)
                            .map_err(|e| TransportError::ProtocolViolation(e.to_string()))?;
                    service.characteristics.insert(
                        char_uuid,
                        GattCharacteristic {
                            uuid: char_uuid,
                            handle: value_handle,
                            properties,
                            client_configuration: None,
                        },
                    );
                    last_char = Some(char_uuid);
                } else if att_uuid == client_config_uuid {
                    let Some(char_uuid) = last_char else { continue };
                    let Some(characteristic) = service.characteristics.get_mut(&char_uuid) else {
                        continue;
                    };
                    if !(characteristic.properties.notify || characteristic.properties.indicate) {
                        continue;
                    }
                    let value = self.read_handle(handle, attribute)?;
                    if value.len() < 2 {
                        warn!("short CCCD value for attribute {}", attribute);
                        continue;
                    }
                    characteristic.client_configuration = Some(ClientConfiguration {
                        handle: attribute,
                        value: u16::from_le_bytes([value[0], value[1]]),
                    });
                }
            }
        }

        Ok(OperationOutput::ServiceTable(services))
    }

    /// Enumerate attribute handles and their type UUIDs within a range
    fn enumerate_handles(
        &mut self,
        handle: u8,
        start: u16,
        end: u16,
    ) -> Result<Vec<(u16, uuid::Uuid)>, TransportError> {
        let reply = self.send_command(&FindInformation { handle, start, end })?;
        if reply.result != 0 {
            return Err(TransportError::DeviceRejected(format!(
                "attribute enumeration rejected, result=0x{:04X}",
                reply.result
            )));
        }

        let (events, terminator) = self.wait_events(
            Duration::from_millis(timing::FIND_INFORMATION_MS),
            |p| {
                p.matches(class::ATTCLIENT, attclient::EVT_FIND_INFORMATION_FOUND)
                    && p.payload.first() == Some(&handle)
            },
            |p| {
                p.matches(class::ATTCLIENT, attclient::EVT_PROCEDURE_COMPLETED)
                    && p.payload.first() == Some(&handle)
            },
        )?;
        if terminator.is_none() {
            return Err(TransportError::Timeout);
        }

        let mut attributes = Vec::with_capacity(events.len());
        for event in &events {
            match FindInformationFoundEvent::parse(&event.payload) {
                Ok(info) => attributes.push((info.attribute, info.uuid)),
                Err(e) => warn!("bad attribute information event: {}", e),
            }
        }
        attributes.sort_by_key(|&(attribute, _)| attribute);
        Ok(attributes)
    }

    /// Read one attribute value; the data arrives as a separate event
    fn read_handle(&mut self, handle: u8, attribute: u16) -> Result<Vec<u8>, TransportError> {
        let reply = self.send_command(&ReadByHandle { handle, attribute })?;
        if reply.result != 0 {
            warn!(
                "error reading attribute {}, result=0x{:04X}",
                attribute, reply.result
            );
            return Err(TransportError::DeviceRejected(format!(
                "read of attribute {} rejected",
                attribute
            )));
        }

        let (_, event) = self.wait_events(
            Duration::from_millis(timing::READ_ATTRIBUTE_MS),
            |_| false,
            |p| {
                if p.matches(class::ATTCLIENT, attclient::EVT_ATTRIBUTE_VALUE) {
                    AttributeValueEvent::parse(&p.payload)
                        .map(|e| e.handle == handle && e.attribute == attribute)
                        .unwrap_or(false)
                } else if p.matches(class::ATTCLIENT, attclient::EVT_PROCEDURE_COMPLETED) {
                    ProcedureCompletedEvent::parse(&p.payload)
                        .map(|e| e.handle == handle && e.attribute == attribute)
                        .unwrap_or(false)
                } else {
                    false
                }
            },
        )?;

        match event {
            Some(packet) if packet.matches(class::ATTCLIENT, attclient::EVT_ATTRIBUTE_VALUE) => {
                let value = AttributeValueEvent::parse(&packet.payload)
                    .map_err(|e| TransportError::ProtocolViolation(e.to_string()))?;
                Ok(value.value)
            }
            Some(_) => Err(TransportError::DeviceRejected(format!(
                "read of attribute {} failed",
                attribute
            ))),
            None => Err(TransportError::Timeout),
        }
    }

    fn enable_rpcs(&mut self, handle: u8, mut services: ServiceMap) -> OperationResult {
        let service = services.get_mut(&tilebus::SERVICE).ok_or_else(|| {
            TransportError::DeviceRejected("TileBus service not present".into())
        })?;

        for char_uuid in [tilebus::RECEIVE_HEADER, tilebus::RECEIVE_PAYLOAD] {
            let characteristic = service.characteristics.get_mut(&char_uuid).ok_or_else(|| {
                TransportError::DeviceRejected(format!(
                    "TileBus characteristic {char_uuid} not present"
                ))
            })?;
            self.set_notification(handle, characteristic, true)?;
        }

        Ok(OperationOutput::Done)
    }

    /// Flip the notification bit in a characteristic's CCCD
    fn set_notification(
        &mut self,
        handle: u8,
        characteristic: &mut GattCharacteristic,
        enabled: bool,
    ) -> Result<(), TransportError> {
        if !(characteristic.properties.notify || characteristic.properties.indicate) {
            return Err(TransportError::DeviceRejected(format!(
                "characteristic {} cannot notify",
                characteristic.uuid
            )));
        }
        let config = characteristic.client_configuration.as_mut().ok_or_else(|| {
            TransportError::DeviceRejected(format!(
                "characteristic {} has no client configuration",
                characteristic.uuid
            ))
        })?;

        let currently_enabled = config.value & 0x0001 != 0;
        if currently_enabled == enabled {
            return Ok(());
        }
        if enabled {
            config.value |= 0x0001;
        } else {
            config.value &= !0x0001;
        }

        let attribute = config.handle;
        let value = config.value.to_le_bytes().to_vec();
        self.write_attribute(handle, attribute, value)
    }

    /// Acknowledged attribute write
    fn write_attribute(
        &mut self,
        handle: u8,
        attribute: u16,
        value: Vec<u8>,
    ) -> Result<(), TransportError> {
        let reply = self.send_command(&WriteAttribute {
            handle,
            attribute,
            value,
        })?;
        if reply.result != 0 {
            return Err(TransportError::DeviceRejected(format!(
                "write of attribute {} rejected, result=0x{:04X}",
                attribute, reply.result
            )));
        }

        let (_, ack) = self.wait_events(
            Duration::from_millis(timing::WRITE_ATTRIBUTE_MS),
            |_| false,
            |p| {
                p.matches(class::ATTCLIENT, attclient::EVT_PROCEDURE_COMPLETED)
                    && ProcedureCompletedEvent::parse(&p.payload)
                        .map(|e| e.handle == handle && e.attribute == attribute)
                        .unwrap_or(false)
            },
        )?;

        let ack = ack.ok_or(TransportError::Timeout)?;
        let completed = ProcedureCompletedEvent::parse(&ack.payload)
            .map_err(|e| TransportError::ProtocolViolation(e.to_string()))?;
        if completed.result != 0 {
            return Err(TransportError::DeviceRejected(format!(
                "write of attribute {} failed, result=0x{:04X}",
                attribute, completed.result
            )));
        }
        Ok(())
    }
}
