// Listener Registry
//
// Multi-subscriber fan-out for device and data events. Every broadcast works
// on a snapshot of the listener list taken when it starts, so listeners may
// register or remove listeners (themselves included) from inside a callback;
// such changes apply from the next broadcast on.

use crate::transport::{
    ConnectFailure, ConnectionHandle, Device, SendStatus, SequenceNumber, TransportKind,
};
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

// ============================================================================
// LISTENER CAPABILITIES
// ============================================================================

/// Error a listener returns to flag a failed callback
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("listener failed: {0}")]
pub struct ListenerError(String);

impl ListenerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type ListenerResult = Result<(), ListenerError>;

/// Receiver of device-level events. Every callback defaults to a no-op.
pub trait DeviceListener: Send + Sync {
    fn on_device_list_changed(
        &self,
        _kind: TransportKind,
        _devices: &[Device],
    ) -> ListenerResult {
        Ok(())
    }

    fn on_connection_established(
        &self,
        _device: &Device,
        _handle: ConnectionHandle,
    ) -> ListenerResult {
        Ok(())
    }

    fn on_connection_failed(&self, _device: &Device, _reason: ConnectFailure) -> ListenerResult {
        Ok(())
    }

    fn on_connection_closed(&self, _device: &Device, _handle: ConnectionHandle) -> ListenerResult {
        Ok(())
    }
}

/// Receiver of frame-level events. Every callback defaults to a no-op.
pub trait DataListener: Send + Sync {
    fn on_frame_received(&self, _handle: ConnectionHandle, _payload: &[u8]) -> ListenerResult {
        Ok(())
    }

    fn on_send_completed(
        &self,
        _handle: ConnectionHandle,
        _sequence: SequenceNumber,
        _status: SendStatus,
    ) -> ListenerResult {
        Ok(())
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Event fanned out to device listeners
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    DeviceListChanged {
        kind: TransportKind,
        devices: Vec<Device>,
    },
    ConnectionEstablished {
        device: Device,
        handle: ConnectionHandle,
    },
    ConnectionFailed {
        device: Device,
        reason: ConnectFailure,
    },
    ConnectionClosed {
        device: Device,
        handle: ConnectionHandle,
    },
}

impl DeviceEvent {
    fn deliver(&self, listener: &dyn DeviceListener) -> ListenerResult {
        match self {
            Self::DeviceListChanged { kind, devices } => {
                listener.on_device_list_changed(*kind, devices)
            }
            Self::ConnectionEstablished { device, handle } => {
                listener.on_connection_established(device, *handle)
            }
            Self::ConnectionFailed { device, reason } => {
                listener.on_connection_failed(device, *reason)
            }
            Self::ConnectionClosed { device, handle } => {
                listener.on_connection_closed(device, *handle)
            }
        }
    }
}

/// Event fanned out to data listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataEvent {
    FrameReceived {
        handle: ConnectionHandle,
        payload: Vec<u8>,
    },
    SendCompleted {
        handle: ConnectionHandle,
        sequence: SequenceNumber,
        status: SendStatus,
    },
}

impl DataEvent {
    fn deliver(&self, listener: &dyn DataListener) -> ListenerResult {
        match self {
            Self::FrameReceived { handle, payload } => listener.on_frame_received(*handle, payload),
            Self::SendCompleted {
                handle,
                sequence,
                status,
            } => listener.on_send_completed(*handle, *sequence, *status),
        }
    }
}

// ============================================================================
// LISTENER SET
// ============================================================================

/// Outcome of one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Callbacks that returned normally
    pub delivered: usize,
    /// Callbacks that returned an error or panicked
    pub failed: usize,
}

/// Ordered list of listeners, compared by identity
struct ListenerSet<L: ?Sized> {
    entries: RwLock<Vec<Arc<L>>>,
}

impl<L: ?Sized> ListenerSet<L> {
    fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    fn register(&self, listener: Arc<L>) {
        self.entries.write().push(listener);
    }

    /// Drop every registration of `listener`; returns how many were dropped
    fn remove<T: ?Sized>(&self, listener: &Arc<T>) -> usize {
        let target = Arc::as_ptr(listener) as *const ();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|l| Arc::as_ptr(l) as *const () != target);
        before - entries.len()
    }

    fn snapshot(&self) -> Vec<Arc<L>> {
        self.entries.read().clone()
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn broadcast(
        &self,
        event_name: &str,
        deliver: impl Fn(&L) -> ListenerResult,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for (position, listener) in self.snapshot().iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| deliver(&**listener))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    warn!(event = event_name, position, error = %e, "listener callback failed");
                    report.failed += 1;
                }
                Err(_) => {
                    warn!(event = event_name, position, "listener callback panicked");
                    report.failed += 1;
                }
            }
        }

        report
    }
}

// ============================================================================
// LISTENER REGISTRY
// ============================================================================

/// Registry of device and data listeners
pub struct ListenerRegistry {
    data: ListenerSet<dyn DataListener>,
    device: ListenerSet<dyn DeviceListener>,
    failures: AtomicU64,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            data: ListenerSet::new(),
            device: ListenerSet::new(),
            failures: AtomicU64::new(0),
        }
    }

    /// Register a data listener; registering twice means two deliveries per event
    pub fn register_data_listener(&self, listener: Arc<dyn DataListener>) {
        self.data.register(listener);
    }

    /// Remove every registration of `listener`; a no-op if it was never registered
    pub fn remove_data_listener<T: ?Sized>(&self, listener: &Arc<T>) -> bool {
        self.data.remove(listener) > 0
    }

    /// Register a device listener; registering twice means two deliveries per event
    pub fn register_device_listener(&self, listener: Arc<dyn DeviceListener>) {
        self.device.register(listener);
    }

    /// Remove every registration of `listener`; a no-op if it was never registered
    pub fn remove_device_listener<T: ?Sized>(&self, listener: &Arc<T>) -> bool {
        self.device.remove(listener) > 0
    }

    pub fn broadcast_data(&self, event: &DataEvent) -> BroadcastReport {
        let name = match event {
            DataEvent::FrameReceived { .. } => "frame_received",
            DataEvent::SendCompleted { .. } => "send_completed",
        };
        let report = self.data.broadcast(name, |l| event.deliver(l));
        self.failures.fetch_add(report.failed as u64, Ordering::Relaxed);
        report
    }

    pub fn broadcast_device(&self, event: &DeviceEvent) -> BroadcastReport {
        let name = match event {
            DeviceEvent::DeviceListChanged { .. } => "device_list_changed",
            DeviceEvent::ConnectionEstablished { .. } => "connection_established",
            DeviceEvent::ConnectionFailed { .. } => "connection_failed",
            DeviceEvent::ConnectionClosed { .. } => "connection_closed",
        };
        let report = self.device.broadcast(name, |l| event.deliver(l));
        self.failures.fetch_add(report.failed as u64, Ordering::Relaxed);
        report
    }

    pub fn data_listener_count(&self) -> usize {
        self.data.len()
    }

    pub fn device_listener_count(&self) -> usize {
        self.device.len()
    }

    /// Listener callbacks that failed since the registry was created
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}
