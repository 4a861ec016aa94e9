//! BLED112 adapter facade
//!
//! Public surface used by the device-session layer: scanning control,
//! callback-based connect/disconnect, GATT probing, and the per-handle
//! connection lifecycle. All lifecycle callbacks run on the dongle worker
//! thread, so callbacks for a given handle never race each other; the
//! shared maps below exist only so outside callers can take advisory
//! snapshots.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::command::DisconnectedEvent;
use crate::command_processor::{
    command_channel, CommandProcessor, CommandSender, EventSink, Operation, OperationOutput,
    OperationResult,
};
use crate::error::TransportError;
use crate::protocol::{class, connection, gap, serial, tilebus, BgapiPacket};
use crate::scan_parser::{parse_scan_event, ScanAssembler};
use crate::stream::PacketStream;
use crate::types::{ConnectionState, DiscoveredDevice, ServiceMap};

/// Discovery records are valid this long after their scan response
const EXPIRATION_SECONDS: u64 = 60;

/// Callback for `connect` and `enable_rpcs`: `(conn_id, success, reason)`
pub type ConnectCallback = Box<dyn FnOnce(u32, bool, Option<String>) + Send>;

/// Callback for `disconnect`: `(conn_id, handle, success, reason)`
pub type DisconnectCallback = Box<dyn FnOnce(u32, u8, bool, String) + Send>;

type ScanListener = Arc<dyn Fn(usize, &DiscoveredDevice, u64) + Send + Sync>;
type DisconnectListener = Arc<dyn Fn(u32, u8, bool, &str) + Send + Sync>;

/// Adapter construction options
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Passive scanning skips the scan-response round trip; discovery
    /// records then carry only the advertisement fields.
    pub passive: bool,
    /// Identifier handed to scan callbacks, for callers that run several
    /// adapters side by side
    pub adapter_id: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            passive: true,
            adapter_id: 0,
        }
    }
}

/// Per-handle connection bookkeeping
struct ConnectionRecord {
    handle: u8,
    connection_id: u32,
    state: ConnectionState,
    services: ServiceMap,
    /// Pending user callback; taken exactly once
    connect_callback: Option<ConnectCallback>,
    /// Invoked if the link drops while still preparing; cleared on the
    /// transition to connected
    disconnect_handler: Option<DisconnectCallback>,
    failure_reason: Option<String>,
    connect_start: Instant,
    services_done: Option<Instant>,
    chars_done: Option<Instant>,
}

/// State shared between the facade, the worker-side event dispatch, and the
/// operation completions
struct AdapterShared {
    connections: Mutex<HashMap<u8, ConnectionRecord>>,
    connecting_count: Mutex<usize>,
    max_connections: AtomicUsize,
    scanning: AtomicBool,
    adapter_id: AtomicUsize,
    scan_listeners: Mutex<Vec<ScanListener>>,
    disconnect_listeners: Mutex<Vec<DisconnectListener>>,
    commands: CommandSender,
}

impl AdapterShared {
    fn new(commands: CommandSender, adapter_id: usize) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            connecting_count: Mutex::new(0),
            max_connections: AtomicUsize::new(0),
            scanning: AtomicBool::new(false),
            adapter_id: AtomicUsize::new(adapter_id),
            scan_listeners: Mutex::new(Vec::new()),
            disconnect_listeners: Mutex::new(Vec::new()),
            commands,
        }
    }

    fn find_handle(&self, conn_id: u32) -> Option<u8> {
        self.connections
            .lock()
            .iter()
            .find(|(_, record)| record.connection_id == conn_id)
            .map(|(handle, _)| *handle)
    }

    fn emit_scan(&self, device: &DiscoveredDevice) {
        let listeners: Vec<ScanListener> = self.scan_listeners.lock().clone();
        let adapter_id = self.adapter_id.load(Ordering::Relaxed);
        for listener in listeners {
            listener(adapter_id, device, EXPIRATION_SECONDS);
        }
    }

    fn emit_disconnect(&self, conn_id: u32, handle: u8, clean: bool, reason: &str) {
        let listeners: Vec<DisconnectListener> = self.disconnect_listeners.lock().clone();
        for listener in listeners {
            listener(conn_id, handle, clean, reason);
        }
    }

    /// Terminal failure path for a pending connect. Removing the record is
    /// the exactly-once gate: whoever removes it delivers the callback.
    fn connection_failed(&self, conn_id: u32, handle: u8) {
        let record = self.connections.lock().remove(&handle);
        let Some(mut record) = record else { return };

        {
            let mut count = self.connecting_count.lock();
            *count = count.saturating_sub(1);
        }

        let reason = record
            .failure_reason
            .take()
            .unwrap_or_else(|| "No reason given".to_string());
        info!("connection attempt failed, conn_id={}, reason={}", conn_id, reason);
        if let Some(callback) = record.connect_callback.take() {
            callback(conn_id, false, Some(reason));
        }
    }

    // ------------------------------------------------------------------
    // Worker-side event handling
    // ------------------------------------------------------------------

    fn handle_remote_disconnect(&self, handle: u8, reason: u16) {
        enum Action {
            FailPending(DisconnectCallback, u32),
            Dropped(u32, bool),
        }

        let action = {
            let mut connections = self.connections.lock();
            let Some(record) = connections.get_mut(&handle) else {
                warn!("disconnect event for handle not in table: {}", handle);
                return;
            };
            warn!(
                "disconnect event, handle={}, reason=0x{:X}, state={:?}",
                handle, reason, record.state
            );

            match record.state {
                ConnectionState::Preparing => {
                    if record.failure_reason.is_none() {
                        record.failure_reason = Some(
                            TransportError::EarlyDisconnect(format!("reason=0x{reason:X}"))
                                .to_string(),
                        );
                    }
                    match record.disconnect_handler.take() {
                        Some(handler) => Action::FailPending(handler, record.connection_id),
                        None => {
                            // Preparing records always carry a handler.
                            error!(
                                "preparing connection without a disconnect handler, handle={}",
                                handle
                            );
                            let conn_id = record.connection_id;
                            connections.remove(&handle);
                            Action::Dropped(conn_id, false)
                        }
                    }
                }
                state => {
                    let conn_id = record.connection_id;
                    connections.remove(&handle);
                    Action::Dropped(conn_id, state == ConnectionState::Connected)
                }
            }
        };

        match action {
            Action::FailPending(handler, conn_id) => {
                handler(conn_id, handle, true, "Disconnected".to_string());
                // The handler removes the record; make sure it is gone.
                self.connections.lock().remove(&handle);
            }
            Action::Dropped(conn_id, was_connected) => {
                if was_connected {
                    self.emit_disconnect(
                        conn_id,
                        handle,
                        true,
                        &format!("Disconnected, reason=0x{:X}", reason),
                    );
                }
            }
        }
    }

    fn handle_transport_closed(&self) {
        warn!("serial transport lost, failing all connections");
        self.scanning.store(false, Ordering::SeqCst);

        let records: Vec<ConnectionRecord> = self
            .connections
            .lock()
            .drain()
            .map(|(_, record)| record)
            .collect();

        for mut record in records {
            if record.state == ConnectionState::Preparing {
                let mut count = self.connecting_count.lock();
                *count = count.saturating_sub(1);
            }
            if let Some(callback) = record.connect_callback.take() {
                callback(record.connection_id, false, Some("Transport lost".to_string()));
            } else if record.state == ConnectionState::Connected {
                self.emit_disconnect(record.connection_id, record.handle, false, "Transport lost");
            }
        }
    }
}

// ------------------------------------------------------------------
// Connect chain completions (run on the worker thread)
// ------------------------------------------------------------------

fn connection_finished(
    shared: &Arc<AdapterShared>,
    conn_id: u32,
    result: OperationResult,
    callback: ConnectCallback,
) {
    let handle = match result {
        Ok(OperationOutput::ConnectionOpened { handle }) => handle,
        other => {
            let reason = match other {
                Err(TransportError::Timeout) => {
                    format!("Timeout opening connection id {conn_id}")
                }
                Err(e) => e.to_string(),
                Ok(_) => "Unexpected connect result".to_string(),
            };
            {
                let mut count = shared.connecting_count.lock();
                *count = count.saturating_sub(1);
            }
            callback(conn_id, false, Some(reason));
            return;
        }
    };

    let weak = Arc::downgrade(shared);
    let handler: DisconnectCallback = Box::new(move |conn_id, handle, _clean, _reason| {
        if let Some(shared) = weak.upgrade() {
            shared.connection_failed(conn_id, handle);
        }
    });

    shared.connections.lock().insert(
        handle,
        ConnectionRecord {
            handle,
            connection_id: conn_id,
            state: ConnectionState::Preparing,
            services: ServiceMap::new(),
            connect_callback: Some(callback),
            disconnect_handler: Some(handler),
            failure_reason: None,
            connect_start: Instant::now(),
            services_done: None,
            chars_done: None,
        },
    );

    let next = Arc::clone(shared);
    shared.commands.submit(
        Operation::ProbeServices { handle },
        Box::new(move |result| probe_services_finished(&next, conn_id, handle, result)),
    );
}

/// A probe completion may only drive the connect chain while the record is
/// still preparing: a spontaneous drop removes the record, a user
/// disconnect flips it to `Disconnecting`, and in both cases the connect
/// callback has already been delivered elsewhere.
fn still_preparing(shared: &AdapterShared, conn_id: u32, handle: u8, probe: &str) -> bool {
    let connections = shared.connections.lock();
    match connections.get(&handle) {
        None => {
            info!(
                "connection disconnected before {} probe finished, conn_id={}",
                probe, conn_id
            );
            false
        }
        Some(record) if record.state != ConnectionState::Preparing => {
            info!(
                "connection in state {:?} before {} probe finished, conn_id={}",
                record.state, probe, conn_id
            );
            false
        }
        Some(_) => true,
    }
}

fn probe_services_finished(
    shared: &Arc<AdapterShared>,
    conn_id: u32,
    handle: u8,
    result: OperationResult,
) {
    if !still_preparing(shared, conn_id, handle, "service") {
        return;
    }

    let services = match result {
        Ok(OperationOutput::ServiceTable(services)) => services,
        _ => {
            fail_preparing(shared, handle, conn_id, "Could not probe GATT services");
            return;
        }
    };

    {
        let mut connections = shared.connections.lock();
        match connections.get_mut(&handle) {
            Some(record) if record.state == ConnectionState::Preparing => {
                record.services_done = Some(Instant::now());
            }
            _ => return,
        }
    }

    let next = Arc::clone(shared);
    shared.commands.submit(
        Operation::ProbeCharacteristics { handle, services },
        Box::new(move |result| probe_characteristics_finished(&next, conn_id, handle, result)),
    );
}

fn probe_characteristics_finished(
    shared: &Arc<AdapterShared>,
    conn_id: u32,
    handle: u8,
    result: OperationResult,
) {
    if !still_preparing(shared, conn_id, handle, "characteristic") {
        return;
    }

    let services = match result {
        Ok(OperationOutput::ServiceTable(services)) => services,
        _ => {
            fail_preparing(shared, handle, conn_id, "Could not probe GATT characteristics");
            return;
        }
    };

    if !services.contains_key(&tilebus::SERVICE) {
        fail_preparing(
            shared,
            handle,
            conn_id,
            "TileBus service not present in GATT services",
        );
        return;
    }

    let callback = {
        let mut connections = shared.connections.lock();
        let Some(record) = connections.get_mut(&handle) else {
            return;
        };
        if record.state != ConnectionState::Preparing {
            return;
        }
        record.services = services;
        record.chars_done = Some(Instant::now());
        record.state = ConnectionState::Connected;
        record.disconnect_handler = None;

        if let (Some(services_done), Some(chars_done)) = (record.services_done, record.chars_done)
        {
            let service_time = services_done - record.connect_start;
            let char_time = chars_done - services_done;
            info!(
                "total time to connect to device: {:.3}s ({:.3}s enumerating services, {:.3}s enumerating characteristics)",
                (service_time + char_time).as_secs_f64(),
                service_time.as_secs_f64(),
                char_time.as_secs_f64()
            );
        }

        record.connect_callback.take()
    };

    {
        let mut count = shared.connecting_count.lock();
        *count = count.saturating_sub(1);
    }

    if let Some(callback) = callback {
        callback(conn_id, true, None);
    }
}

/// Record the failure reason and tear the half-open link down; the
/// disconnect completion delivers the user callback.
fn fail_preparing(shared: &Arc<AdapterShared>, handle: u8, conn_id: u32, reason: &str) {
    {
        let mut connections = shared.connections.lock();
        if let Some(record) = connections.get_mut(&handle) {
            record.failure_reason = Some(reason.to_string());
        }
    }

    let next = Arc::clone(shared);
    shared.commands.submit(
        Operation::Disconnect { handle },
        Box::new(move |result| {
            if let Err(e) = result {
                warn!("teardown disconnect of handle {} failed: {}", handle, e);
            }
            next.connection_failed(conn_id, handle);
        }),
    );
}

/// Routes unsolicited dongle events to the scan assembler and the
/// connection table. Runs on the worker thread.
struct EventDispatcher {
    shared: Arc<AdapterShared>,
    assembler: ScanAssembler,
}

impl EventSink for EventDispatcher {
    fn handle_event(&mut self, event: &BgapiPacket) {
        if event.matches(class::GAP, gap::EVT_SCAN_RESPONSE) {
            if let Some(scan_event) = parse_scan_event(&event.payload) {
                if let Some(device) = self.assembler.handle(&scan_event) {
                    self.shared.emit_scan(&device);
                }
            }
        } else if event.matches(class::CONNECTION, connection::EVT_DISCONNECTED) {
            match DisconnectedEvent::parse(&event.payload) {
                Ok(ev) => self.shared.handle_remote_disconnect(ev.handle, ev.reason),
                Err(e) => warn!("bad disconnect event: {}", e),
            }
        } else {
            warn!(
                "unhandled BLE event: class={} command={}",
                event.class, event.command
            );
        }
    }

    fn transport_closed(&mut self) {
        self.shared.handle_transport_closed();
    }
}

/// Callback-based BLED112 wrapper supporting multiple simultaneous
/// connections over one dongle
pub struct Bled112Adapter {
    shared: Arc<AdapterShared>,
    stream: Arc<PacketStream>,
    processor: CommandProcessor,
    active_scan: bool,
    stopped: bool,
}

impl Bled112Adapter {
    /// Open the dongle on a serial port and bring the adapter up: clear
    /// residual connections, learn the pool size, start scanning.
    pub fn open(port: &str, config: AdapterConfig) -> Result<Self, TransportError> {
        let serial_port = serialport::new(port, serial::BAUD_RATE)
            .flow_control(serialport::FlowControl::Hardware)
            .timeout(Duration::from_millis(serial::READ_TIMEOUT_MS))
            .open()?;
        let writer = serial_port.try_clone()?;
        Self::from_stream(Box::new(serial_port), Box::new(writer), config)
    }

    /// Build the adapter over an arbitrary byte stream (mock dongles, pipes)
    pub fn from_stream(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        config: AdapterConfig,
    ) -> Result<Self, TransportError> {
        let (stream, packets) = PacketStream::new(reader, writer);
        let stream = Arc::new(stream);

        let (commands, requests) = command_channel();
        let shared = Arc::new(AdapterShared::new(commands, config.adapter_id));
        let sink = EventDispatcher {
            shared: Arc::clone(&shared),
            assembler: ScanAssembler::new(!config.passive),
        };
        let processor =
            CommandProcessor::start(Arc::clone(&stream), packets, requests, Box::new(sink));

        let mut adapter = Self {
            shared,
            stream,
            processor,
            active_scan: !config.passive,
            stopped: false,
        };

        if let Err(e) = adapter.initialize() {
            adapter.stop();
            return Err(e);
        }
        Ok(adapter)
    }

    /// Query the dongle state and tear down anything left over from a
    /// previous run, then start scanning
    fn initialize(&self) -> Result<(), TransportError> {
        let output = self.shared.commands.execute(Operation::QuerySystemState)?;
        let OperationOutput::SystemState {
            max_connections,
            active_handles,
        } = output
        else {
            return Err(TransportError::ProtocolViolation(
                "unexpected system state result".into(),
            ));
        };

        self.shared
            .max_connections
            .store(max_connections as usize, Ordering::SeqCst);

        for handle in active_handles {
            info!("disconnecting residual connection, handle={}", handle);
            if let Err(e) = self
                .shared
                .commands
                .execute(Operation::Disconnect { handle })
            {
                warn!("could not disconnect residual handle {}: {}", handle, e);
            }
        }

        info!("BLED112 adapter supports {} connections", max_connections);
        self.start_scan(self.active_scan)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Callback registration
    // ------------------------------------------------------------------

    /// Register a listener for completed discoveries:
    /// `(adapter_id, device, ttl_seconds)`
    pub fn add_scan_callback(
        &self,
        callback: impl Fn(usize, &DiscoveredDevice, u64) + Send + Sync + 'static,
    ) {
        self.shared.scan_listeners.lock().push(Arc::new(callback));
    }

    /// Register a listener for spontaneous disconnects of established
    /// connections: `(conn_id, handle, clean, reason)`
    pub fn add_disconnect_callback(
        &self,
        callback: impl Fn(u32, u8, bool, &str) + Send + Sync + 'static,
    ) {
        self.shared
            .disconnect_listeners
            .lock()
            .push(Arc::new(callback));
    }

    // ------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------

    pub fn start_scan(&self, active: bool) -> Result<(), TransportError> {
        self.shared
            .commands
            .execute(Operation::StartScan { active })?;
        self.shared.scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn stop_scan(&self) -> Result<(), TransportError> {
        self.shared.commands.execute(Operation::StopScan)?;
        self.shared.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn scanning(&self) -> bool {
        self.shared.scanning.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Whether there is room for one more connection. Advisory: the dongle
    /// itself is the final gate.
    pub fn can_connect(&self) -> bool {
        self.shared.connections.lock().len() < self.shared.max_connections.load(Ordering::SeqCst)
    }

    pub fn max_connections(&self) -> usize {
        self.shared.max_connections.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().len()
    }

    /// Advisory snapshot of the live connections as `(conn_id, handle)`
    pub fn active_connections(&self) -> Vec<(u32, u8)> {
        self.shared
            .connections
            .lock()
            .values()
            .map(|record| (record.connection_id, record.handle))
            .collect()
    }

    /// Advisory snapshot of one connection's state
    pub fn connection_state(&self, conn_id: u32) -> Option<ConnectionState> {
        self.shared
            .connections
            .lock()
            .values()
            .find(|record| record.connection_id == conn_id)
            .map(|record| record.state)
    }

    /// Connect to a device by its `XX:YY:ZZ:AA:BB:CC` address. The callback
    /// fires exactly once, on success or failure, after the GATT table has
    /// been probed and validated.
    pub fn connect(
        &self,
        connection_string: &str,
        conn_id: u32,
        callback: impl FnOnce(u32, bool, Option<String>) + Send + 'static,
    ) {
        // The dongle cannot scan and dial at the same time.
        if self.scanning() {
            if let Err(e) = self.stop_scan() {
                warn!("could not stop scanning before connect: {}", e);
            }
        }

        {
            let mut count = self.shared.connecting_count.lock();
            *count += 1;
        }

        let shared = Arc::clone(&self.shared);
        let address = connection_string.to_string();
        self.shared.commands.submit(
            Operation::Connect { address },
            Box::new(move |result| {
                connection_finished(&shared, conn_id, result, Box::new(callback));
            }),
        );
    }

    /// Disconnect a previously connected device. The callback fires exactly
    /// once; an unknown `conn_id` fails synchronously. Disconnecting a
    /// connection that is still being prepared fails the pending connect
    /// first, through the same handler a remote drop would use.
    pub fn disconnect(
        &self,
        conn_id: u32,
        callback: impl FnOnce(u32, u8, bool, String) + Send + 'static,
    ) {
        let Some(handle) = self.shared.find_handle(conn_id) else {
            callback(conn_id, 0, false, "Invalid connection_id".to_string());
            return;
        };

        let pending = {
            let mut connections = self.shared.connections.lock();
            match connections.get_mut(&handle) {
                Some(record) if record.state == ConnectionState::Preparing => {
                    if record.failure_reason.is_none() {
                        record.failure_reason =
                            Some("Connection closed before setup completed".to_string());
                    }
                    record.state = ConnectionState::Disconnecting;
                    record.disconnect_handler.take()
                }
                Some(record) => {
                    record.state = ConnectionState::Disconnecting;
                    None
                }
                None => None,
            }
        };
        if let Some(handler) = pending {
            handler(conn_id, handle, true, "Disconnected".to_string());
        }

        let shared = Arc::clone(&self.shared);
        self.shared.commands.submit(
            Operation::Disconnect { handle },
            Box::new(move |result| {
                disconnect_finished(&shared, conn_id, handle, result, Box::new(callback));
            }),
        );
    }

    /// Blocking form of `disconnect`
    pub fn disconnect_sync(&self, conn_id: u32) {
        let (tx, rx) = oneshot::channel();
        self.disconnect(conn_id, move |_, _, _, _| {
            let _ = tx.send(());
        });
        let _ = futures::executor::block_on(rx);
    }

    // ------------------------------------------------------------------
    // GATT access for advanced callers
    // ------------------------------------------------------------------

    /// Enumerate primary services on an already connected handle
    pub fn probe_services(
        &self,
        handle: u8,
        conn_id: u32,
        callback: impl FnOnce(Result<ServiceMap, TransportError>) + Send + 'static,
    ) {
        debug!("probing GATT services, conn_id={}", conn_id);
        self.shared.commands.submit(
            Operation::ProbeServices { handle },
            Box::new(move |result| {
                callback(result.map(|output| match output {
                    OperationOutput::ServiceTable(services) => services,
                    _ => ServiceMap::new(),
                }));
            }),
        );
    }

    /// Fill a service table with characteristics; completion feeds the
    /// normal connect chain
    pub fn probe_characteristics(&self, conn_id: u32, handle: u8, services: ServiceMap) {
        let shared = Arc::clone(&self.shared);
        self.shared.commands.submit(
            Operation::ProbeCharacteristics { handle, services },
            Box::new(move |result| {
                probe_characteristics_finished(&shared, conn_id, handle, result);
            }),
        );
    }

    /// Enable notifications on the TileBus RPC characteristics
    pub fn enable_rpcs(
        &self,
        conn_id: u32,
        callback: impl FnOnce(u32, bool, Option<String>) + Send + 'static,
    ) {
        let target = {
            let connections = self.shared.connections.lock();
            connections
                .values()
                .find(|record| record.connection_id == conn_id)
                .map(|record| (record.handle, record.services.clone()))
        };
        let Some((handle, services)) = target else {
            callback(conn_id, false, Some("Invalid connection_id".to_string()));
            return;
        };

        self.shared.commands.submit(
            Operation::EnableRpcs { handle, services },
            Box::new(move |result| match result {
                Ok(_) => callback(conn_id, true, None),
                Err(e) => callback(conn_id, false, Some(e.to_string())),
            }),
        );
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Housekeeping hook, call about once a second: restarts scanning when
    /// the dongle has gone fully idle
    pub fn periodic_tick(&self) {
        if !self.scanning()
            && self.shared.connections.lock().is_empty()
            && *self.shared.connecting_count.lock() == 0
        {
            info!("restarting scan for devices");
            if let Err(e) = self.start_scan(self.active_scan) {
                warn!("could not restart scanning: {}", e);
            }
        }
    }

    /// Stop scanning, disconnect every active handle, and shut down the
    /// worker and the serial stream. Idempotent; also runs on drop.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        if self.scanning() {
            if let Err(e) = self.stop_scan() {
                warn!("stop scan during shutdown failed: {}", e);
            }
        }

        // Iterate a snapshot: the map shrinks as disconnects complete.
        let conn_ids: Vec<u32> = self
            .shared
            .connections
            .lock()
            .values()
            .map(|record| record.connection_id)
            .collect();
        for conn_id in conn_ids {
            self.disconnect_sync(conn_id);
        }

        self.processor.stop();
        self.stream.stop();
    }

    /// Identifier handed to scan callbacks
    pub fn id(&self) -> usize {
        self.shared.adapter_id.load(Ordering::Relaxed)
    }

    pub fn set_id(&self, adapter_id: usize) {
        self.shared.adapter_id.store(adapter_id, Ordering::Relaxed);
    }
}

impl Drop for Bled112Adapter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn disconnect_finished(
    shared: &Arc<AdapterShared>,
    conn_id: u32,
    handle: u8,
    result: OperationResult,
    callback: DisconnectCallback,
) {
    match result {
        Ok(_) => {
            shared.connections.lock().remove(&handle);
            callback(conn_id, handle, true, "No reason given".to_string());
        }
        Err(TransportError::DeviceRejected(reason)) => {
            error!(
                "could not disconnect cleanly from device handle={}: {}",
                handle, reason
            );
            if let Some(record) = shared.connections.lock().get_mut(&handle) {
                record.state = ConnectionState::Zombie;
            }
            callback(
                conn_id,
                handle,
                false,
                "Could not initiate disconnection process from device".to_string(),
            );
        }
        Err(_) => {
            shared.connections.lock().remove(&handle);
            callback(conn_id, handle, false, "No reason given".to_string());
        }
    }
}
