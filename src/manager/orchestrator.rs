// Transport Manager
//
// Owns the adapters, the device registry, the connection table and the
// listener registry. Each adapter reports through its own event channel,
// drained by one pump task, so events from one adapter are handled strictly
// in order while different adapters proceed concurrently.
//
// Lock order: devices -> adapters -> table. No lock is held while listeners
// run, which lets callbacks call back into the manager.

use super::config::TransportManagerConfig;
use super::handles::HandleAllocator;
use super::listeners::{
    DataEvent, DataListener, DeviceEvent, DeviceListener, ListenerRegistry,
};
use super::table::{ConnectionRecord, ConnectionTable, SendMatch};
use crate::transport::{
    AdapterEvent, AdapterEventSink, AdapterId, AdapterToken, ConnectFailure, ConnectionHandle,
    ConnectionState, Device, DeviceInfo, DeviceKey, DeviceState, SendStatus, SequenceNumber,
    TransportAdapter, TransportError, TransportKind,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

// ============================================================================
// STATISTICS
// ============================================================================

/// Counters kept by the transport manager
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub connect_failures: u64,
    /// Sends completed with `Success`
    pub frames_sent: u64,
    /// Sends completed with `Failure`
    pub send_failures: u64,
    pub bytes_queued: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    /// Completions that arrived after their connection closed
    pub stale_completions: u64,
    /// Adapter events that contradicted the manager's state
    pub anomalies: u64,
    pub listener_failures: u64,
}

// ============================================================================
// INTERNAL STATE
// ============================================================================

struct AdapterSlot {
    adapter: Arc<dyn TransportAdapter>,
    kind: TransportKind,
}

struct DeviceEntry {
    device: Device,
    adapter: AdapterId,
    /// Adapter lost the device while connections were still open
    lost_pending: bool,
}

type ConnectWaiter = oneshot::Sender<Result<ConnectionHandle, TransportError>>;

#[derive(Default)]
struct Waiters {
    connects: HashMap<DeviceKey, Vec<ConnectWaiter>>,
    disconnects: HashMap<ConnectionHandle, Vec<oneshot::Sender<()>>>,
    /// Connect attempts given up after a timeout. The flag records whether
    /// the adapter cancelled the attempt, in which case only its
    /// `ConnectionFailed` is still owed.
    abandoned: HashMap<DeviceKey, bool>,
}

type DeviceList = (TransportKind, Vec<Device>);

struct Inner {
    config: TransportManagerConfig,
    adapters: RwLock<Vec<AdapterSlot>>,
    devices: RwLock<BTreeMap<DeviceKey, DeviceEntry>>,
    table: ConnectionTable,
    handles: Mutex<HandleAllocator>,
    listeners: ListenerRegistry,
    waiters: Mutex<Waiters>,
    stats: Mutex<ManagerStats>,
}

// ============================================================================
// TRANSPORT MANAGER
// ============================================================================

/// Uniform front over every transport adapter.
///
/// Cloning is cheap; clones share the same state.
#[derive(Clone)]
pub struct TransportManager {
    inner: Arc<Inner>,
}

impl TransportManager {
    pub fn new(config: TransportManagerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                adapters: RwLock::new(Vec::new()),
                devices: RwLock::new(BTreeMap::new()),
                table: ConnectionTable::new(),
                handles: Mutex::new(HandleAllocator::new()),
                listeners: ListenerRegistry::new(),
                waiters: Mutex::new(Waiters::default()),
                stats: Mutex::new(ManagerStats::default()),
            }),
        }
    }

    /// Build a manager and every adapter the configuration names.
    ///
    /// Adapters without a backend are skipped with a warning; other
    /// configuration errors abort. Must run inside a tokio runtime.
    pub fn from_config(config: TransportManagerConfig) -> Result<Self, TransportError> {
        config.validate()?;
        let manager = Self::new(config.clone());

        for adapter_config in &config.adapters {
            match adapter_config.build() {
                Ok(adapter) => {
                    manager.add_adapter(adapter);
                }
                Err(TransportError::AdapterUnavailable(reason)) => {
                    warn!(kind = %adapter_config.kind(), %reason, "adapter skipped");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(manager)
    }

    pub fn config(&self) -> &TransportManagerConfig {
        &self.inner.config
    }

    /// Attach an adapter and start draining its events. Must run inside a tokio runtime.
    pub fn add_adapter(&self, adapter: Arc<dyn TransportAdapter>) -> AdapterId {
        let kind = adapter.kind();
        let (sink, events) = AdapterEventSink::channel();

        let id = {
            let mut adapters = self.inner.adapters.write();
            let id = AdapterId::from_index(adapters.len());
            adapters.push(AdapterSlot {
                adapter: Arc::clone(&adapter),
                kind,
            });
            id
        };

        adapter.attach(sink);
        tokio::spawn(pump(Arc::downgrade(&self.inner), id, events));

        info!(adapter = id.index(), %kind, "adapter added");
        id
    }

    pub fn adapter_count(&self) -> usize {
        self.inner.adapters.read().len()
    }

    /// Start discovery on every adapter; returns how many started.
    ///
    /// An unavailable adapter is logged and skipped; the call only fails
    /// when no adapter could start.
    pub async fn start(&self) -> Result<usize, TransportError> {
        let adapters = self.inner.adapter_list();
        let mut started = 0;
        let mut last_error =
            TransportError::AdapterUnavailable("no adapters configured".to_string());

        for (id, adapter, kind) in adapters {
            match adapter.start_discovery().await {
                Ok(()) => {
                    info!(adapter = id.index(), %kind, "discovery started");
                    started += 1;
                }
                Err(e) => {
                    warn!(adapter = id.index(), %kind, error = %e, "adapter failed to start");
                    last_error = e;
                }
            }
        }

        if started == 0 {
            return Err(last_error);
        }
        Ok(started)
    }

    /// Stop discovery, close every open connection and shut the adapters down
    pub async fn stop(&self) {
        let adapters = self.inner.adapter_list();

        for (_, adapter, _) in &adapters {
            adapter.stop_discovery().await;
        }

        for record in self.inner.table.snapshot() {
            if record.state().is_open() {
                if let Err(e) = self.disconnect(record.handle()) {
                    debug!(handle = %record.handle(), error = %e, "disconnect during stop failed");
                }
            }
        }

        for (id, adapter, kind) in &adapters {
            adapter.shutdown().await;
            info!(adapter = id.index(), %kind, "adapter shut down");
        }
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    pub fn add_data_listener(&self, listener: Arc<dyn DataListener>) {
        self.inner.listeners.register_data_listener(listener);
    }

    pub fn remove_data_listener<T: ?Sized>(&self, listener: &Arc<T>) -> bool {
        self.inner.listeners.remove_data_listener(listener)
    }

    pub fn add_device_listener(&self, listener: Arc<dyn DeviceListener>) {
        self.inner.listeners.register_device_listener(listener);
    }

    pub fn remove_device_listener<T: ?Sized>(&self, listener: &Arc<T>) -> bool {
        self.inner.listeners.remove_device_listener(listener)
    }

    // ------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------

    /// Every known device of one transport family, ordered by key
    pub fn list_devices(&self, kind: TransportKind) -> Vec<Device> {
        Inner::list_of(&self.inner.devices.read(), kind)
    }

    pub fn device(&self, device_key: &DeviceKey) -> Option<Device> {
        self.inner
            .devices
            .read()
            .get(device_key)
            .map(|entry| entry.device.clone())
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Ask the owning adapter to connect; the outcome arrives through device listeners
    pub fn connect(&self, device_key: &DeviceKey) -> Result<(), TransportError> {
        let adapter = {
            let mut devices = self.inner.devices.write();
            let entry = devices
                .get_mut(device_key)
                .ok_or_else(|| TransportError::DeviceNotFound(device_key.clone()))?;

            if entry.lost_pending {
                return Err(TransportError::DeviceUnreachable);
            }
            if entry.device.state() == DeviceState::Connecting {
                return Err(TransportError::AlreadyConnecting(device_key.clone()));
            }

            let adapter = self.inner.adapter(entry.adapter)?;
            entry.device.set_state(DeviceState::Connecting);

            // An attempt the adapter could not cancel may still report; from
            // here on its outcome counts for this request.
            let mut waiters = self.inner.waiters.lock();
            if waiters.abandoned.get(device_key) == Some(&false) {
                waiters.abandoned.remove(device_key);
            }
            adapter
        };

        debug!(device = %device_key, "connect requested");
        adapter.connect(device_key);
        Ok(())
    }

    /// Connect and wait for the outcome.
    ///
    /// Joins an attempt already in progress. On timeout the adapter is told to
    /// abandon the attempt, the attempt is failed with `Timeout` for every
    /// listener and waiter, and the device returns to its settled state. A
    /// connection the adapter still reports for that attempt is closed.
    pub async fn connect_and_wait(
        &self,
        device_key: &DeviceKey,
        timeout: Duration,
    ) -> Result<ConnectionHandle, TransportError> {
        let (tx, mut rx) = oneshot::channel();
        self.inner
            .waiters
            .lock()
            .connects
            .entry(device_key.clone())
            .or_default()
            .push(tx);

        match self.connect(device_key) {
            Ok(()) | Err(TransportError::AlreadyConnecting(_)) => {}
            Err(e) => {
                drop(rx);
                self.inner.prune_connect_waiters(device_key);
                return Err(e);
            }
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TransportError::NotRunning),
            Err(_) => {
                warn!(device = %device_key, ?timeout, "connect timed out, abandoning attempt");
                if self.inner.expire_connect(device_key) {
                    return Err(TransportError::Timeout);
                }
                // The attempt resolved while the timer fired.
                let outcome = rx.try_recv().unwrap_or(Err(TransportError::Timeout));
                drop(rx);
                self.inner.prune_connect_waiters(device_key);
                outcome
            }
        }
    }

    /// Ask the owning adapter to close a connection; `on_connection_closed` follows
    pub fn disconnect(&self, handle: ConnectionHandle) -> Result<(), TransportError> {
        match self.inner.table.update_state(handle, ConnectionState::Closing) {
            Ok(_) => {}
            // Repeated request while the adapter is still tearing down.
            Err(TransportError::InvalidTransition {
                from: ConnectionState::Closing,
                ..
            }) => {}
            Err(TransportError::InvalidTransition { .. }) => {
                return Err(TransportError::ConnectionNotOpen(handle))
            }
            Err(e) => return Err(e),
        }

        let record = self.inner.table.find(handle)?;
        let adapter = self.inner.adapter(record.adapter())?;

        info!(%handle, device = %record.device_key(), "disconnect requested");
        adapter.disconnect(record.token());
        Ok(())
    }

    /// Disconnect and wait until the adapter confirms the close.
    ///
    /// On timeout the connection is closed on the manager's side anyway: its
    /// handle is released, `on_connection_closed` fires and `Timeout` is
    /// returned. A confirmation arriving later is ignored.
    pub async fn disconnect_and_wait(
        &self,
        handle: ConnectionHandle,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .waiters
            .lock()
            .disconnects
            .entry(handle)
            .or_default()
            .push(tx);

        if let Err(e) = self.disconnect(handle) {
            drop(rx);
            self.inner.prune_disconnect_waiters(handle);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::NotRunning),
            Err(_) => {
                warn!(%handle, ?timeout, "disconnect not confirmed in time, closing locally");
                match self.inner.close_connection(handle, "disconnect timed out") {
                    Ok(()) => Err(TransportError::Timeout),
                    // The adapter confirmed while the timer fired.
                    Err(_) => Ok(()),
                }
            }
        }
    }

    /// Queue a frame on an open connection, returning its sequence number.
    ///
    /// Completion is reported to data listeners as `on_send_completed`.
    pub fn send(
        &self,
        handle: ConnectionHandle,
        payload: impl Into<Vec<u8>>,
    ) -> Result<SequenceNumber, TransportError> {
        let payload = payload.into();
        let size = payload.len();
        let max = self.inner.config.max_frame_size;
        if size > max {
            return Err(TransportError::PayloadTooLarge { size, max });
        }

        let owner = self
            .inner
            .table
            .find(handle)
            .map_err(|_| TransportError::ConnectionNotOpen(handle))?
            .adapter();
        let adapter = self.inner.adapter(owner)?;

        // Sequence assignment and hand-off happen under the table lock so the
        // adapter sees sends in sequence order.
        let sequence = self.inner.table.with_open(handle, |record| {
            let sequence = record.begin_send();
            adapter.send(record.token(), sequence, payload);
            sequence
        })?;

        self.inner.stats.lock().bytes_queued += size as u64;
        debug!(%handle, sequence, size, "frame queued");
        Ok(sequence)
    }

    pub fn connection(&self, handle: ConnectionHandle) -> Result<ConnectionRecord, TransportError> {
        self.inner.table.find(handle)
    }

    pub fn connection_state(
        &self,
        handle: ConnectionHandle,
    ) -> Result<ConnectionState, TransportError> {
        self.inner.table.find(handle).map(|record| record.state())
    }

    /// Every tracked connection, ordered by handle
    pub fn connections(&self) -> Vec<ConnectionRecord> {
        self.inner.table.snapshot()
    }

    pub fn stats(&self) -> ManagerStats {
        let mut stats = self.inner.stats.lock().clone();
        stats.listener_failures = self.inner.listeners.failure_count();
        stats
    }
}

/// Drains one adapter's events until the adapter or the manager goes away
async fn pump(
    inner: Weak<Inner>,
    adapter: AdapterId,
    mut events: mpsc::UnboundedReceiver<AdapterEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.ingest(adapter, event);
    }
    debug!(adapter = adapter.index(), "adapter event pump finished");
}

// ============================================================================
// EVENT HANDLING
// ============================================================================

impl Inner {
    fn adapter(&self, id: AdapterId) -> Result<Arc<dyn TransportAdapter>, TransportError> {
        self.adapters
            .read()
            .get(id.index())
            .map(|slot| Arc::clone(&slot.adapter))
            .ok_or_else(|| {
                TransportError::AdapterUnavailable(format!("unknown adapter {}", id.index()))
            })
    }

    fn adapter_list(&self) -> Vec<(AdapterId, Arc<dyn TransportAdapter>, TransportKind)> {
        self.adapters
            .read()
            .iter()
            .enumerate()
            .map(|(i, slot)| (AdapterId::from_index(i), Arc::clone(&slot.adapter), slot.kind))
            .collect()
    }

    fn kind_of(&self, id: AdapterId) -> Option<TransportKind> {
        self.adapters.read().get(id.index()).map(|slot| slot.kind)
    }

    fn list_of(devices: &BTreeMap<DeviceKey, DeviceEntry>, kind: TransportKind) -> Vec<Device> {
        devices
            .values()
            .filter(|entry| entry.device.kind() == kind)
            .map(|entry| entry.device.clone())
            .collect()
    }

    fn anomaly(&self) {
        self.stats.lock().anomalies += 1;
    }

    fn ingest(&self, adapter: AdapterId, event: AdapterEvent) {
        match event {
            AdapterEvent::DeviceDiscovered(info) | AdapterEvent::DeviceUpdated(info) => {
                self.on_device_seen(adapter, info)
            }
            AdapterEvent::DeviceLost { device_key } => self.on_device_lost(adapter, &device_key),
            AdapterEvent::ConnectionEstablished { device_key, token } => {
                self.on_connection_established(adapter, device_key, token)
            }
            AdapterEvent::ConnectionFailed { device_key, reason } => {
                self.on_connection_failed(&device_key, reason)
            }
            AdapterEvent::ConnectionClosed { token, reason } => {
                self.on_connection_closed(adapter, token, &reason)
            }
            AdapterEvent::FrameReceived { token, payload } => {
                self.on_frame_received(adapter, token, payload)
            }
            AdapterEvent::SendCompleted {
                token,
                sequence,
                status,
            } => self.on_send_completed(adapter, token, sequence, status),
        }
    }

    fn on_device_seen(&self, adapter: AdapterId, info: DeviceInfo) {
        let Some(kind) = self.kind_of(adapter) else {
            return;
        };

        let devices = {
            let mut devices = self.devices.write();
            match devices.get_mut(&info.key) {
                Some(entry) if entry.adapter != adapter => {
                    warn!(device = %info.key, "device reported by a second adapter, ignored");
                    self.anomaly();
                    return;
                }
                Some(entry) => {
                    entry.lost_pending = false;
                    entry.device.refresh(info);
                }
                None => {
                    debug!(device = %info.key, %kind, name = %info.name, "device discovered");
                    devices.insert(
                        info.key.clone(),
                        DeviceEntry {
                            device: Device::new(info, kind),
                            adapter,
                            lost_pending: false,
                        },
                    );
                }
            }
            Self::list_of(&devices, kind)
        };

        self.listeners
            .broadcast_device(&DeviceEvent::DeviceListChanged { kind, devices });
    }

    fn on_device_lost(&self, adapter: AdapterId, device_key: &DeviceKey) {
        let (kind, devices) = {
            let mut devices = self.devices.write();
            let Some(entry) = devices.get_mut(device_key) else {
                debug!(device = %device_key, "unknown device lost");
                return;
            };
            if entry.adapter != adapter {
                return;
            }

            let busy = !self.table.handles_for_device(device_key).is_empty()
                || entry.device.state() == DeviceState::Connecting;
            if busy {
                debug!(device = %device_key, "device lost while in use, removal deferred");
                entry.lost_pending = true;
                return;
            }

            let kind = entry.device.kind();
            devices.remove(device_key);
            (kind, Self::list_of(&devices, kind))
        };

        info!(device = %device_key, "device lost");
        self.listeners
            .broadcast_device(&DeviceEvent::DeviceListChanged { kind, devices });
    }

    fn on_connection_established(
        &self,
        adapter: AdapterId,
        device_key: DeviceKey,
        token: AdapterToken,
    ) {
        let late = {
            let mut waiters = self.waiters.lock();
            let late = waiters.abandoned.get(&device_key) == Some(&false);
            if late {
                waiters.abandoned.remove(&device_key);
            }
            late
        };
        if late {
            debug!(device = %device_key, %token, "connection for abandoned attempt, closing");
            if let Ok(a) = self.adapter(adapter) {
                a.disconnect(token);
            }
            return;
        }

        let owned = self
            .devices
            .read()
            .get(&device_key)
            .is_some_and(|entry| entry.adapter == adapter);
        let kind = match self.kind_of(adapter) {
            Some(kind) if owned => kind,
            _ => {
                warn!(device = %device_key, %token, "connection for unknown device, closing");
                self.anomaly();
                if let Ok(a) = self.adapter(adapter) {
                    a.disconnect(token);
                }
                return;
            }
        };

        let handle = match self.handles.lock().allocate() {
            Ok(handle) => handle,
            Err(e) => {
                error!(device = %device_key, error = %e, "no connection handle available");
                if let Ok(a) = self.adapter(adapter) {
                    a.disconnect(token);
                }
                self.settle_device(&device_key, false);
                self.resolve_connect_waiters(&device_key, Err(e));
                return;
            }
        };

        let record = ConnectionRecord::new(handle, adapter, token, device_key.clone(), kind);
        let opened = self
            .table
            .insert(record)
            .and_then(|_| self.table.update_state(handle, ConnectionState::Open));
        if let Err(e) = opened {
            error!(%handle, error = %e, "connection table rejected new connection");
            self.anomaly();
            self.table.remove(handle).ok();
            self.handles.lock().release(handle).ok();
            if let Ok(a) = self.adapter(adapter) {
                a.disconnect(token);
            }
            return;
        }

        let device = {
            let mut devices = self.devices.write();
            match devices.get_mut(&device_key) {
                Some(entry) => {
                    entry.device.set_state(DeviceState::Connected);
                    entry.device.clone()
                }
                None => {
                    let info = DeviceInfo::new(device_key.clone(), device_key.to_string());
                    Device::new(info, kind)
                }
            }
        };

        self.stats.lock().connections_opened += 1;
        info!(%handle, device = %device_key, %kind, "connection open");

        self.listeners
            .broadcast_device(&DeviceEvent::ConnectionEstablished { device, handle });
        self.resolve_connect_waiters(&device_key, Ok(handle));
    }

    fn on_connection_failed(&self, device_key: &DeviceKey, reason: ConnectFailure) {
        if self.waiters.lock().abandoned.remove(device_key).is_some() {
            debug!(device = %device_key, %reason, "outcome of abandoned attempt discarded");
            return;
        }

        let settled = self.settle_device(device_key, false);
        self.fail_connect(device_key, reason, settled);
    }

    /// Fail a connect attempt that outlived its caller's timeout.
    ///
    /// Returns false when the attempt had already resolved.
    fn expire_connect(&self, device_key: &DeviceKey) -> bool {
        let adapter = match self.devices.read().get(device_key) {
            Some(entry) if entry.device.state() == DeviceState::Connecting => {
                self.adapter(entry.adapter).ok()
            }
            _ => return false,
        };
        let cancelled = adapter.is_some_and(|a| a.abandon_connect(device_key));

        let settled = {
            let mut devices = self.devices.write();
            let connecting = devices
                .get(device_key)
                .is_some_and(|entry| entry.device.state() == DeviceState::Connecting);
            if !connecting {
                return false;
            }
            self.waiters
                .lock()
                .abandoned
                .insert(device_key.clone(), cancelled);
            self.settle_locked(&mut devices, device_key, false)
        };

        self.fail_connect(device_key, ConnectFailure::Timeout, settled);
        true
    }

    fn fail_connect(
        &self,
        device_key: &DeviceKey,
        reason: ConnectFailure,
        settled: Option<(Device, Option<DeviceList>)>,
    ) {
        self.stats.lock().connect_failures += 1;

        match settled {
            Some((device, removed)) => {
                info!(device = %device_key, %reason, "connection failed");
                self.listeners
                    .broadcast_device(&DeviceEvent::ConnectionFailed { device, reason });
                if let Some((kind, devices)) = removed {
                    self.listeners
                        .broadcast_device(&DeviceEvent::DeviceListChanged { kind, devices });
                }
            }
            None => debug!(device = %device_key, %reason, "connection failed for unknown device"),
        }

        self.resolve_connect_waiters(device_key, Err(reason.into()));
    }

    fn on_connection_closed(&self, adapter: AdapterId, token: AdapterToken, reason: &str) {
        let Some(handle) = self.table.handle_for(adapter, token) else {
            debug!(%token, reason, "close reported for unknown connection");
            return;
        };

        if let Err(e) = self.close_connection(handle, reason) {
            error!(%handle, error = %e, "connection vanished while closing");
            self.anomaly();
        }
    }

    /// Retire a connection: drop its record, release its handle and notify listeners
    fn close_connection(
        &self,
        handle: ConnectionHandle,
        reason: &str,
    ) -> Result<(), TransportError> {
        let previous = self.table.update_state(handle, ConnectionState::Closing);
        if let Ok(ConnectionState::Open) = previous {
            debug!(%handle, reason, "connection closed by adapter");
        }

        let mut record = self.table.remove(handle)?;
        if let Err(e) = record.transition(ConnectionState::Closed) {
            error!(%handle, error = %e, "connection closed from unexpected state");
            self.anomaly();
        }
        if let Err(e) = self.handles.lock().release(handle) {
            error!(%handle, error = %e, "handle allocator out of step with connection table");
            self.anomaly();
        }
        if !record.in_flight().is_empty() {
            debug!(%handle, in_flight = record.in_flight().len(), "closed with sends in flight");
        }

        self.stats.lock().connections_closed += 1;
        info!(%handle, device = %record.device_key(), reason, "connection closed");

        let (device, removed) = self
            .settle_device(record.device_key(), true)
            .unwrap_or_else(|| {
                let key = record.device_key();
                let info = DeviceInfo::new(key.clone(), key.to_string());
                let mut device = Device::new(info, record.kind());
                device.set_state(DeviceState::Lost);
                (device, None)
            });

        self.listeners
            .broadcast_device(&DeviceEvent::ConnectionClosed { device, handle });
        if let Some((kind, devices)) = removed {
            self.listeners
                .broadcast_device(&DeviceEvent::DeviceListChanged { kind, devices });
        }
        self.resolve_disconnect_waiters(handle);
        Ok(())
    }

    fn on_frame_received(&self, adapter: AdapterId, token: AdapterToken, payload: Vec<u8>) {
        let Some(handle) = self.table.handle_for(adapter, token) else {
            warn!(%token, size = payload.len(), "frame for unknown connection dropped");
            self.anomaly();
            return;
        };

        {
            let mut stats = self.stats.lock();
            stats.frames_received += 1;
            stats.bytes_received += payload.len() as u64;
        }
        debug!(
            %handle,
            size = payload.len(),
            head = %hex::encode(&payload[..payload.len().min(16)]),
            "frame received"
        );

        self.listeners
            .broadcast_data(&DataEvent::FrameReceived { handle, payload });
    }

    fn on_send_completed(
        &self,
        adapter: AdapterId,
        token: AdapterToken,
        sequence: SequenceNumber,
        status: SendStatus,
    ) {
        match self.table.complete_send(adapter, token, sequence) {
            SendMatch::Matched(handle) => {
                {
                    let mut stats = self.stats.lock();
                    match status {
                        SendStatus::Success => stats.frames_sent += 1,
                        SendStatus::Failure => stats.send_failures += 1,
                    }
                }
                debug!(%handle, sequence, ?status, "send completed");
                self.listeners.broadcast_data(&DataEvent::SendCompleted {
                    handle,
                    sequence,
                    status,
                });
            }
            SendMatch::UnknownSequence(handle) => {
                warn!(%handle, sequence, "completion for a sequence that is not in flight");
                self.anomaly();
            }
            SendMatch::UnknownConnection => {
                debug!(%token, sequence, "completion for closed connection discarded");
                self.stats.lock().stale_completions += 1;
            }
        }
    }

    /// Recompute a device's state after a connection outcome.
    ///
    /// A device whose loss was deferred is removed once nothing is open or
    /// pending on it; the updated device list is returned in that case.
    fn settle_device(
        &self,
        device_key: &DeviceKey,
        keep_connecting: bool,
    ) -> Option<(Device, Option<DeviceList>)> {
        let mut devices = self.devices.write();
        self.settle_locked(&mut devices, device_key, keep_connecting)
    }

    fn settle_locked(
        &self,
        devices: &mut BTreeMap<DeviceKey, DeviceEntry>,
        device_key: &DeviceKey,
        keep_connecting: bool,
    ) -> Option<(Device, Option<DeviceList>)> {
        let open = !self.table.handles_for_device(device_key).is_empty();

        let entry = devices.get_mut(device_key)?;
        let connecting = keep_connecting && entry.device.state() == DeviceState::Connecting;
        if !entry.lost_pending || open || connecting {
            if !connecting {
                let state = if open {
                    DeviceState::Connected
                } else {
                    DeviceState::Discovered
                };
                entry.device.set_state(state);
            }
            return Some((entry.device.clone(), None));
        }

        let kind = entry.device.kind();
        let mut entry = devices.remove(device_key)?;
        entry.device.set_state(DeviceState::Lost);
        info!(device = %device_key, "device lost");
        Some((entry.device, Some((kind, Self::list_of(devices, kind)))))
    }

    fn resolve_connect_waiters(
        &self,
        device_key: &DeviceKey,
        outcome: Result<ConnectionHandle, TransportError>,
    ) {
        let waiters = self.waiters.lock().connects.remove(device_key);
        for tx in waiters.into_iter().flatten() {
            let _ = tx.send(outcome.clone());
        }
    }

    fn resolve_disconnect_waiters(&self, handle: ConnectionHandle) {
        let waiters = self.waiters.lock().disconnects.remove(&handle);
        for tx in waiters.into_iter().flatten() {
            let _ = tx.send(());
        }
    }

    fn prune_connect_waiters(&self, device_key: &DeviceKey) {
        let mut waiters = self.waiters.lock();
        if let Some(pending) = waiters.connects.get_mut(device_key) {
            pending.retain(|tx| !tx.is_closed());
            if pending.is_empty() {
                waiters.connects.remove(device_key);
            }
        }
    }

    fn prune_disconnect_waiters(&self, handle: ConnectionHandle) {
        let mut waiters = self.waiters.lock();
        if let Some(pending) = waiters.disconnects.get_mut(&handle) {
            pending.retain(|tx| !tx.is_closed());
            if pending.is_empty() {
                waiters.disconnects.remove(&handle);
            }
        }
    }
}
