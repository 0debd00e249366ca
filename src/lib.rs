// applink-transport
// Transport manager for in-vehicle phone and accessory links

pub mod manager;
pub mod transport;

pub use manager::{
    AdapterConfig, DataListener, DeviceListener, ListenerError, ListenerResult, ManagerStats,
    TransportManager, TransportManagerConfig,
};
pub use transport::{
    ConnectFailure, ConnectionHandle, ConnectionState, Device, DeviceKey, DeviceState, SendStatus,
    SequenceNumber, TransportAdapter, TransportError, TransportKind,
};
