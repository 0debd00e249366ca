// Manager Configuration
// Which adapters to run and the limits the manager enforces on top of them

use crate::transport::{
    EmulatorAdapter, EmulatorConfig, TcpAdapter, TcpAdapterConfig, TransportAdapter,
    TransportConfig, TransportError, TransportKind,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// ADAPTER CONFIG
// ============================================================================

/// One adapter to run, selected by transport family
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AdapterConfig {
    Emulator(EmulatorConfig),
    Tcp(TcpAdapterConfig),
    Bluetooth(TransportConfig),
    Usb(TransportConfig),
}

impl AdapterConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Emulator(config) => config.presents_as,
            Self::Tcp(_) => TransportKind::Tcp,
            Self::Bluetooth(_) => TransportKind::Bluetooth,
            Self::Usb(_) => TransportKind::Usb,
        }
    }

    /// Construct the adapter for this entry
    pub fn build(&self) -> Result<Arc<dyn TransportAdapter>, TransportError> {
        match self {
            Self::Emulator(config) => {
                config.base.validate()?;
                Ok(Arc::new(EmulatorAdapter::new(config.clone())))
            }
            Self::Tcp(config) => {
                config.validate()?;
                Ok(Arc::new(TcpAdapter::new(config.clone())))
            }
            Self::Bluetooth(_) | Self::Usb(_) => Err(TransportError::AdapterUnavailable(format!(
                "no {} backend in this build",
                self.kind()
            ))),
        }
    }
}

// ============================================================================
// TRANSPORT MANAGER CONFIG
// ============================================================================

/// Configuration for the transport manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportManagerConfig {
    /// Adapters created by `TransportManager::from_config`
    pub adapters: Vec<AdapterConfig>,
    /// Timeout for blocking connect/disconnect helpers
    pub connect_timeout_ms: u64,
    /// Largest payload `send` accepts
    pub max_frame_size: usize,
}

impl Default for TransportManagerConfig {
    fn default() -> Self {
        Self {
            adapters: Vec::new(),
            connect_timeout_ms: 10_000,
            max_frame_size: TransportConfig::default().max_frame_size,
        }
    }
}

impl TransportManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adapter(mut self, adapter: AdapterConfig) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn with_connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.connect_timeout_ms == 0 {
            return Err(TransportError::InvalidConfig("connect_timeout_ms cannot be 0".to_string()));
        }
        if self.max_frame_size == 0 {
            return Err(TransportError::InvalidConfig("max_frame_size cannot be 0".to_string()));
        }
        if u32::try_from(self.max_frame_size).is_err() {
            return Err(TransportError::InvalidConfig(
                "max_frame_size must fit a 32-bit length".to_string(),
            ));
        }
        Ok(())
    }
}
