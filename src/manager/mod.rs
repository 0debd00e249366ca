// Manager module - THE SWITCHBOARD
// Handle allocation, connection bookkeeping, listener fan-out and the
// transport manager that ties them to the adapters

mod config;
mod handles;
mod listeners;
mod orchestrator;
mod table;

pub use config::{AdapterConfig, TransportManagerConfig};

pub use handles::HandleAllocator;

pub use table::{ConnectionRecord, ConnectionTable, SendMatch};

pub use listeners::{
    BroadcastReport, DataEvent, DataListener, DeviceEvent, DeviceListener, ListenerError,
    ListenerRegistry, ListenerResult,
};

pub use orchestrator::{ManagerStats, TransportManager};
