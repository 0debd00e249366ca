// Emulator Transport Implementation
// In-memory adapter that behaves like a real transport and is driven programmatically

use crate::transport::{
    AdapterEvent, AdapterEventSink, AdapterToken, ConnectFailure, DeviceInfo, DeviceKey,
    SendStatus, SequenceNumber, TransportAdapter, TransportConfig, TransportError, TransportKind,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::debug;

// ============================================================================
// EMULATOR CONFIG
// ============================================================================

/// How the emulator answers `connect`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectBehavior {
    /// Establish immediately
    Accept,
    /// Fail immediately with the given reason
    Fail(ConnectFailure),
    /// Leave the attempt pending until resolved by hand
    Hold,
}

/// Configuration for the emulator adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatorConfig {
    /// Base transport configuration
    pub base: TransportConfig,
    /// Transport kind the emulator reports its devices under
    pub presents_as: TransportKind,
    /// Report send completion as soon as a frame is queued
    pub auto_complete_sends: bool,
    /// Initial answer to `connect`
    pub connect_behavior: ConnectBehavior,
    /// Devices visible once discovery starts
    pub devices: Vec<DeviceInfo>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            base: TransportConfig::default(),
            presents_as: TransportKind::Emulator,
            auto_complete_sends: true,
            connect_behavior: ConnectBehavior::Accept,
            devices: Vec::new(),
        }
    }
}

impl EmulatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_config(mut self, base: TransportConfig) -> Self {
        self.base = base;
        self
    }

    pub fn presenting_as(mut self, kind: TransportKind) -> Self {
        self.presents_as = kind;
        self
    }

    pub fn with_auto_complete_sends(mut self, enabled: bool) -> Self {
        self.auto_complete_sends = enabled;
        self
    }

    pub fn with_connect_behavior(mut self, behavior: ConnectBehavior) -> Self {
        self.connect_behavior = behavior;
        self
    }

    pub fn with_device(mut self, device: DeviceInfo) -> Self {
        self.devices.push(device);
        self
    }
}

// ============================================================================
// RECORDED CALLS
// ============================================================================

/// A call the manager made into the emulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmulatorCall {
    StartDiscovery,
    StopDiscovery,
    Connect(DeviceKey),
    AbandonConnect(DeviceKey),
    Disconnect(AdapterToken),
    Send {
        token: AdapterToken,
        sequence: SequenceNumber,
        payload: Vec<u8>,
    },
    Shutdown,
}

// ============================================================================
// EMULATOR ADAPTER
// ============================================================================

struct EmulatorState {
    available: bool,
    discovering: bool,
    auto_complete_sends: bool,
    connect_behavior: ConnectBehavior,
    devices: BTreeMap<DeviceKey, DeviceInfo>,
    pending_connects: HashSet<DeviceKey>,
    connections: HashMap<AdapterToken, DeviceKey>,
    unacked_sends: VecDeque<(AdapterToken, SequenceNumber)>,
    calls: Vec<EmulatorCall>,
    next_token: u64,
}

/// Adapter backed by an in-memory model of devices and links
pub struct EmulatorAdapter {
    config: EmulatorConfig,
    sink: Mutex<Option<AdapterEventSink>>,
    state: Mutex<EmulatorState>,
}

impl EmulatorAdapter {
    pub fn new(config: EmulatorConfig) -> Self {
        let devices = config
            .devices
            .iter()
            .map(|d| (d.key.clone(), d.clone()))
            .collect();

        let state = EmulatorState {
            available: true,
            discovering: false,
            auto_complete_sends: config.auto_complete_sends,
            connect_behavior: config.connect_behavior,
            devices,
            pending_connects: HashSet::new(),
            connections: HashMap::new(),
            unacked_sends: VecDeque::new(),
            calls: Vec::new(),
            next_token: 1,
        };

        Self {
            config,
            sink: Mutex::new(None),
            state: Mutex::new(state),
        }
    }

    fn emit(&self, event: AdapterEvent) {
        match self.sink.lock().as_ref() {
            Some(sink) => {
                sink.emit(event);
            }
            None => debug!(?event, "emulator not attached, dropping event"),
        }
    }

    fn establish(&self, state: &mut EmulatorState, device_key: DeviceKey) -> AdapterToken {
        let token = AdapterToken::from_raw(state.next_token);
        state.next_token += 1;
        state.connections.insert(token, device_key.clone());
        self.emit(AdapterEvent::ConnectionEstablished { device_key, token });
        token
    }

    // ------------------------------------------------------------------
    // Control surface
    // ------------------------------------------------------------------

    /// Make the underlying "hardware" (un)available to `start_discovery`
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    pub fn set_connect_behavior(&self, behavior: ConnectBehavior) {
        self.state.lock().connect_behavior = behavior;
    }

    pub fn set_auto_complete_sends(&self, enabled: bool) {
        self.state.lock().auto_complete_sends = enabled;
    }

    pub fn is_discovering(&self) -> bool {
        self.state.lock().discovering
    }

    /// Add a device, reporting it right away while discovering
    pub fn add_device(&self, device: DeviceInfo) {
        let mut state = self.state.lock();
        let known = state.devices.insert(device.key.clone(), device.clone()).is_some();
        if state.discovering {
            if known {
                self.emit(AdapterEvent::DeviceUpdated(device));
            } else {
                self.emit(AdapterEvent::DeviceDiscovered(device));
            }
        }
    }

    /// Take a device out of range
    pub fn remove_device(&self, device_key: &DeviceKey) {
        let mut state = self.state.lock();
        if state.devices.remove(device_key).is_some() && state.discovering {
            self.emit(AdapterEvent::DeviceLost {
                device_key: device_key.clone(),
            });
        }
    }

    /// Resolve a held connect attempt successfully
    pub fn complete_connect(&self, device_key: &DeviceKey) -> Option<AdapterToken> {
        let mut state = self.state.lock();
        if !state.pending_connects.remove(device_key) {
            return None;
        }
        Some(self.establish(&mut state, device_key.clone()))
    }

    /// Resolve a held connect attempt with a failure
    pub fn fail_connect(&self, device_key: &DeviceKey, reason: ConnectFailure) -> bool {
        let mut state = self.state.lock();
        if !state.pending_connects.remove(device_key) {
            return false;
        }
        self.emit(AdapterEvent::ConnectionFailed {
            device_key: device_key.clone(),
            reason,
        });
        true
    }

    /// Open a connection the device initiated itself
    pub fn accept_incoming(&self, device_key: &DeviceKey) -> AdapterToken {
        let mut state = self.state.lock();
        self.establish(&mut state, device_key.clone())
    }

    /// Deliver an inbound frame on a connection
    pub fn deliver_frame(&self, token: AdapterToken, payload: &[u8]) {
        self.emit(AdapterEvent::FrameReceived {
            token,
            payload: payload.to_vec(),
        });
    }

    /// Simulate the link dropping underneath an open connection
    pub fn drop_link(&self, token: AdapterToken) -> bool {
        let mut state = self.state.lock();
        if state.connections.remove(&token).is_none() {
            return false;
        }
        self.emit(AdapterEvent::ConnectionClosed {
            token,
            reason: "link lost".to_string(),
        });
        true
    }

    /// Complete the oldest queued send; returns its sequence number
    pub fn complete_next_send(&self, status: SendStatus) -> Option<SequenceNumber> {
        let (token, sequence) = self.state.lock().unacked_sends.pop_front()?;
        self.emit(AdapterEvent::SendCompleted {
            token,
            sequence,
            status,
        });
        Some(sequence)
    }

    /// Complete every queued send in order
    pub fn complete_all_sends(&self, status: SendStatus) -> usize {
        let mut completed = 0;
        while self.complete_next_send(status).is_some() {
            completed += 1;
        }
        completed
    }

    pub fn pending_sends(&self) -> usize {
        self.state.lock().unacked_sends.len()
    }

    /// Tokens of the connections currently open
    pub fn open_tokens(&self) -> Vec<AdapterToken> {
        let mut tokens: Vec<_> = self.state.lock().connections.keys().copied().collect();
        tokens.sort_by_key(|t| t.as_u64());
        tokens
    }

    /// Token of the most recent open connection to `device_key`
    pub fn token_for(&self, device_key: &DeviceKey) -> Option<AdapterToken> {
        self.state
            .lock()
            .connections
            .iter()
            .filter(|(_, key)| *key == device_key)
            .map(|(token, _)| *token)
            .max_by_key(|t| t.as_u64())
    }

    /// Every call received so far
    pub fn calls(&self) -> Vec<EmulatorCall> {
        self.state.lock().calls.clone()
    }

    /// Number of `send` calls received so far
    pub fn send_calls(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, EmulatorCall::Send { .. }))
            .count()
    }
}

#[async_trait]
impl TransportAdapter for EmulatorAdapter {
    fn kind(&self) -> TransportKind {
        self.config.presents_as
    }

    fn attach(&self, sink: AdapterEventSink) {
        *self.sink.lock() = Some(sink);
    }

    async fn start_discovery(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.calls.push(EmulatorCall::StartDiscovery);

        if !state.available {
            return Err(TransportError::AdapterUnavailable(
                "emulated interface is down".to_string(),
            ));
        }
        if state.discovering {
            return Ok(());
        }

        state.discovering = true;
        for device in state.devices.values() {
            self.emit(AdapterEvent::DeviceDiscovered(device.clone()));
        }
        Ok(())
    }

    async fn stop_discovery(&self) {
        let mut state = self.state.lock();
        state.calls.push(EmulatorCall::StopDiscovery);
        state.discovering = false;
    }

    fn connect(&self, device_key: &DeviceKey) {
        let mut state = self.state.lock();
        state.calls.push(EmulatorCall::Connect(device_key.clone()));

        if !state.devices.contains_key(device_key) {
            self.emit(AdapterEvent::ConnectionFailed {
                device_key: device_key.clone(),
                reason: ConnectFailure::DeviceUnreachable,
            });
            return;
        }

        if state.connections.len() >= self.config.base.max_connections as usize {
            self.emit(AdapterEvent::ConnectionFailed {
                device_key: device_key.clone(),
                reason: ConnectFailure::Rejected,
            });
            return;
        }

        match state.connect_behavior {
            ConnectBehavior::Accept => {
                self.establish(&mut state, device_key.clone());
            }
            ConnectBehavior::Fail(reason) => {
                self.emit(AdapterEvent::ConnectionFailed {
                    device_key: device_key.clone(),
                    reason,
                });
            }
            ConnectBehavior::Hold => {
                state.pending_connects.insert(device_key.clone());
            }
        }
    }

    fn abandon_connect(&self, device_key: &DeviceKey) -> bool {
        let mut state = self.state.lock();
        state.calls.push(EmulatorCall::AbandonConnect(device_key.clone()));
        if !state.pending_connects.remove(device_key) {
            return false;
        }
        self.emit(AdapterEvent::ConnectionFailed {
            device_key: device_key.clone(),
            reason: ConnectFailure::Timeout,
        });
        true
    }

    fn disconnect(&self, token: AdapterToken) {
        let mut state = self.state.lock();
        state.calls.push(EmulatorCall::Disconnect(token));
        let reason = if state.connections.remove(&token).is_some() {
            "closed by request"
        } else {
            "already closed"
        };
        self.emit(AdapterEvent::ConnectionClosed {
            token,
            reason: reason.to_string(),
        });
    }

    fn send(&self, token: AdapterToken, sequence: SequenceNumber, payload: Vec<u8>) {
        let mut state = self.state.lock();
        state.calls.push(EmulatorCall::Send {
            token,
            sequence,
            payload,
        });

        if !state.connections.contains_key(&token) {
            self.emit(AdapterEvent::SendCompleted {
                token,
                sequence,
                status: SendStatus::Failure,
            });
        } else if state.auto_complete_sends {
            self.emit(AdapterEvent::SendCompleted {
                token,
                sequence,
                status: SendStatus::Success,
            });
        } else {
            state.unacked_sends.push_back((token, sequence));
        }
    }

    async fn shutdown(&self) {
        let mut state = self.state.lock();
        state.calls.push(EmulatorCall::Shutdown);
        state.discovering = false;

        for device_key in state.pending_connects.drain().collect::<Vec<_>>() {
            self.emit(AdapterEvent::ConnectionFailed {
                device_key,
                reason: ConnectFailure::DeviceUnreachable,
            });
        }

        let mut tokens: Vec<_> = state.connections.drain().map(|(t, _)| t).collect();
        tokens.sort_by_key(|t| t.as_u64());
        for token in tokens {
            self.emit(AdapterEvent::ConnectionClosed {
                token,
                reason: "adapter shut down".to_string(),
            });
        }
    }
}
