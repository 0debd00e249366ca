// Transport module - THE WIRE (abstract)
// Adapter contract plus the TCP and emulator adapters

mod emulator;
mod tcp;
mod traits;

pub use traits::{
    // Core trait
    TransportAdapter,
    // Configuration
    TransportConfig,
    // Identity types
    AdapterId, AdapterToken, ConnectionHandle, DeviceKey, SequenceNumber, TransportKind,
    // Device and connection types
    ConnectionState, Device, DeviceInfo, DeviceState,
    // Events and errors
    AdapterEvent, AdapterEventSink, ConnectFailure, SendStatus, TransportError,
};

pub use tcp::{TcpAdapter, TcpAdapterConfig};

pub use emulator::{ConnectBehavior, EmulatorAdapter, EmulatorCall, EmulatorConfig};
