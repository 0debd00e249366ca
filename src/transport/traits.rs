// Transport Traits and Core Types
// Defines the adapter contract and the value types shared by every transport family

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// TRANSPORT CONFIG
// ============================================================================

/// Base configuration shared by all adapter types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Maximum number of simultaneous connections
    pub max_connections: u32,
    /// Connection establishment timeout in seconds
    pub connection_timeout_secs: u32,
    /// Largest payload accepted in a single frame
    pub max_frame_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_connections: 16,
            connection_timeout_secs: 10,
            max_frame_size: 128 * 1024,
        }
    }
}

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_connection_timeout(mut self, secs: u32) -> Self {
        self.connection_timeout_secs = secs;
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.max_connections == 0 {
            return Err(TransportError::InvalidConfig("max_connections cannot be 0".to_string()));
        }
        if self.connection_timeout_secs == 0 {
            return Err(TransportError::InvalidConfig(
                "connection_timeout_secs cannot be 0".to_string(),
            ));
        }
        if self.max_frame_size == 0 {
            return Err(TransportError::InvalidConfig("max_frame_size cannot be 0".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// TRANSPORT KIND
// ============================================================================

/// Transport family an adapter drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransportKind {
    Bluetooth,
    Usb,
    Tcp,
    Emulator,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bluetooth => "bluetooth",
            Self::Usb => "usb",
            Self::Tcp => "tcp",
            Self::Emulator => "emulator",
        };
        f.write_str(name)
    }
}

// ============================================================================
// DEVICE KEY
// ============================================================================

/// Transport-specific unique identity of a discoverable device
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey(String);

impl DeviceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key for a Bluetooth device; MAC addresses compare case-insensitively
    pub fn bluetooth(mac_address: &str) -> Self {
        Self(format!("bt://{}", mac_address.to_uppercase()))
    }

    /// Key for a USB device attached at `bus`/`port`
    pub fn usb(bus: u8, port: u8) -> Self {
        Self(format!("usb://{}-{}", bus, port))
    }

    /// Key for a TCP peer
    pub fn tcp(addr: SocketAddr) -> Self {
        Self(format!("tcp://{}", addr))
    }

    /// Key for an emulated device
    pub fn emulator(name: &str) -> Self {
        Self(format!("emu://{}", name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Socket address encoded in a `tcp://` key
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.0.strip_prefix("tcp://")?.parse().ok()
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

// ============================================================================
// DEVICE
// ============================================================================

/// Connectivity state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceState {
    #[default]
    Discovered,
    Connecting,
    Connected,
    Lost,
}

/// What an adapter reports about a device it can see
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub key: DeviceKey,
    pub name: String,
}

impl DeviceInfo {
    pub fn new(key: DeviceKey, name: impl Into<String>) -> Self {
        Self {
            key,
            name: name.into(),
        }
    }
}

/// A device as tracked by the transport manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    key: DeviceKey,
    name: String,
    kind: TransportKind,
    state: DeviceState,
    last_seen: DateTime<Utc>,
}

impl Device {
    pub fn new(info: DeviceInfo, kind: TransportKind) -> Self {
        Self {
            key: info.key,
            name: info.name,
            kind,
            state: DeviceState::Discovered,
            last_seen: Utc::now(),
        }
    }

    pub fn key(&self) -> &DeviceKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn set_state(&mut self, state: DeviceState) {
        self.state = state;
    }

    /// When the owning adapter last reported this device
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    /// Refresh from a new adapter report, keeping the connectivity state
    pub fn refresh(&mut self, info: DeviceInfo) {
        self.name = info.name;
        self.last_seen = Utc::now();
    }
}

// ============================================================================
// HANDLES, TOKENS AND SEQUENCES
// ============================================================================

/// Process-unique identifier of an open connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionHandle(u32);

impl ConnectionHandle {
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Adapter-local connection identifier, meaningful only to the adapter that issued it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdapterToken(u64);

impl AdapterToken {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for AdapterToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tok:{}", self.0)
    }
}

/// Index of an adapter inside the transport manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdapterId(usize);

impl AdapterId {
    pub fn from_index(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

/// Per-connection frame sequence number, starting at 1
pub type SequenceNumber = u32;

/// Outcome of a single send request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendStatus {
    Success,
    Failure,
}

/// Why a connection attempt did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectFailure {
    DeviceUnreachable,
    Timeout,
    Rejected,
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::DeviceUnreachable => "device unreachable",
            Self::Timeout => "timeout",
            Self::Rejected => "rejected",
        };
        f.write_str(reason)
    }
}

impl From<ConnectFailure> for TransportError {
    fn from(reason: ConnectFailure) -> Self {
        match reason {
            ConnectFailure::DeviceUnreachable => Self::DeviceUnreachable,
            ConnectFailure::Timeout => Self::Timeout,
            ConnectFailure::Rejected => Self::Rejected,
        }
    }
}

// ============================================================================
// CONNECTION STATE
// ============================================================================

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Establishing,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Check if transition to another state is valid
    pub fn can_transition_to(&self, target: ConnectionState) -> bool {
        matches!(
            (self, target),
            (Self::Establishing, Self::Open)
                | (Self::Establishing, Self::Closed)
                | (Self::Open, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

// ============================================================================
// ADAPTER EVENTS
// ============================================================================

/// Notification from an adapter to the transport manager
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    DeviceDiscovered(DeviceInfo),

    DeviceUpdated(DeviceInfo),

    DeviceLost { device_key: DeviceKey },

    ConnectionEstablished {
        device_key: DeviceKey,
        token: AdapterToken,
    },

    ConnectionFailed {
        device_key: DeviceKey,
        reason: ConnectFailure,
    },

    /// Emitted exactly once per established connection, and for every
    /// `disconnect` of a token the adapter no longer knows
    ConnectionClosed {
        token: AdapterToken,
        reason: String,
    },

    FrameReceived {
        token: AdapterToken,
        payload: Vec<u8>,
    },

    SendCompleted {
        token: AdapterToken,
        sequence: SequenceNumber,
        status: SendStatus,
    },
}

/// Single ingestion point an adapter uses to report events.
///
/// Events from one sink are consumed in emission order by one worker, so an
/// adapter never observes the manager handling two of its events at once.
#[derive(Debug, Clone)]
pub struct AdapterEventSink {
    tx: mpsc::UnboundedSender<AdapterEvent>,
}

impl AdapterEventSink {
    pub fn new(tx: mpsc::UnboundedSender<AdapterEvent>) -> Self {
        Self { tx }
    }

    /// Paired sink and receiver
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AdapterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report an event; returns false once the manager has gone away
    pub fn emit(&self, event: AdapterEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ============================================================================
// TRANSPORT ERRORS
// ============================================================================

/// Errors surfaced by adapters and the transport manager
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("Device unreachable")]
    DeviceUnreachable,

    #[error("Connection timeout")]
    Timeout,

    #[error("Connection rejected")]
    Rejected,

    #[error("Connection handle {0} not found")]
    HandleNotFound(ConnectionHandle),

    #[error("Connection handle {0} is not allocated")]
    HandleNotAllocated(ConnectionHandle),

    #[error("Connection handle {0} is already in use")]
    HandleInUse(ConnectionHandle),

    #[error("No connection handles left")]
    HandlesExhausted,

    #[error("Connection {0} is not open")]
    ConnectionNotOpen(ConnectionHandle),

    #[error("Unknown device: {0}")]
    DeviceNotFound(DeviceKey),

    #[error("Connection to {0} already in progress")]
    AlreadyConnecting(DeviceKey),

    #[error("Payload of {size} bytes exceeds frame limit of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Transport manager not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(String),
}

impl TransportError {
    /// Check if this is a connect-time error
    pub fn is_connect_error(&self) -> bool {
        matches!(self, Self::DeviceUnreachable | Self::Timeout | Self::Rejected)
    }

    /// Check if the caller may simply retry the operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DeviceUnreachable | Self::Timeout | Self::Rejected | Self::Io(_)
        )
    }

    /// Check if this signals a violated handle/table invariant
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::HandleNotFound(_)
                | Self::HandleNotAllocated(_)
                | Self::HandleInUse(_)
                | Self::InvalidTransition { .. }
        )
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

// ============================================================================
// TRANSPORT ADAPTER TRAIT
// ============================================================================

/// Capability contract implemented once per transport family.
///
/// `connect`, `disconnect` and `send` only hand work off and return; their
/// outcome is always reported later through the attached [`AdapterEventSink`].
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Transport family this adapter reports its devices under
    fn kind(&self) -> TransportKind;

    /// Install the sink all events must go through
    fn attach(&self, sink: AdapterEventSink);

    /// Begin scanning; idempotent while already scanning
    async fn start_discovery(&self) -> Result<(), TransportError>;

    /// Halt scanning; no-op when not scanning
    async fn stop_discovery(&self);

    /// Start opening a connection; reports `ConnectionEstablished` or `ConnectionFailed`.
    ///
    /// A repeated call while an attempt to the same device is pending joins
    /// that attempt, so the pair still gets exactly one outcome.
    fn connect(&self, device_key: &DeviceKey);

    /// Give up on a pending `connect`.
    ///
    /// Returns true when a pending attempt was cancelled; its `ConnectionFailed`
    /// with `Timeout` has then already been reported. Returns false when there
    /// was nothing to cancel or the adapter cannot cancel, in which case a late
    /// `ConnectionEstablished` may still follow.
    fn abandon_connect(&self, device_key: &DeviceKey) -> bool {
        let _ = device_key;
        false
    }

    /// Start tearing a connection down; always reports `ConnectionClosed`
    fn disconnect(&self, token: AdapterToken);

    /// Queue a payload; reports `SendCompleted` exactly once for this call
    fn send(&self, token: AdapterToken, sequence: SequenceNumber, payload: Vec<u8>);

    /// Release every resource; open connections report `ConnectionClosed`
    async fn shutdown(&self) {
        self.stop_discovery().await;
    }
}
