// TCP Transport Implementation
// Wi-Fi/TCP adapter: phones connect to our listener, configured peers are dialed on request

use crate::transport::{
    AdapterEvent, AdapterEventSink, AdapterToken, ConnectFailure, DeviceInfo, DeviceKey,
    SendStatus, SequenceNumber, TransportAdapter, TransportConfig, TransportError, TransportKind,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

// ============================================================================
// TCP ADAPTER CONFIG
// ============================================================================

/// Configuration for the TCP adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpAdapterConfig {
    /// Base transport configuration
    pub base: TransportConfig,
    /// Address to listen on
    pub bind_address: String,
    /// Port to listen on (0 for random)
    pub bind_port: u16,
    /// Enable TCP_NODELAY
    pub nodelay: bool,
    /// Remote hosts reported as devices and dialed on `connect`
    pub static_peers: Vec<SocketAddr>,
    /// Dial attempts before a connect is reported as failed
    pub connect_attempts: u32,
    /// Base delay between dial attempts, doubled on each retry
    pub retry_delay_ms: u64,
}

impl Default for TcpAdapterConfig {
    fn default() -> Self {
        Self {
            base: TransportConfig::default(),
            bind_address: "0.0.0.0".to_string(),
            bind_port: 12345,
            nodelay: true,
            static_peers: Vec::new(),
            connect_attempts: 3,
            retry_delay_ms: 250,
        }
    }
}

impl TcpAdapterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_config(mut self, base: TransportConfig) -> Self {
        self.base = base;
        self
    }

    pub fn with_bind_address(mut self, addr: &str) -> Self {
        self.bind_address = addr.to_string();
        self
    }

    pub fn with_bind_port(mut self, port: u16) -> Self {
        self.bind_port = port;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_static_peer(mut self, addr: SocketAddr) -> Self {
        self.static_peers.push(addr);
        self
    }

    pub fn with_connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts;
        self
    }

    pub fn with_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.retry_delay_ms = delay_ms;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), TransportError> {
        self.base.validate()?;
        if self.connect_attempts == 0 {
            return Err(TransportError::InvalidConfig("connect_attempts cannot be 0".to_string()));
        }
        if u32::try_from(self.base.max_frame_size).is_err() {
            return Err(TransportError::InvalidConfig(
                "max_frame_size must fit the 32-bit length prefix".to_string(),
            ));
        }
        Ok(())
    }

    /// Backoff before retry number `attempt` (1-based), with up to 50% jitter
    fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.retry_delay_ms.saturating_mul(1 << (attempt - 1).min(6));
        let jitter = if base > 1 {
            rand::thread_rng().gen_range(0..=base / 2)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }
}

// ============================================================================
// INTERNAL CONNECTION STATE
// ============================================================================

struct TcpLink {
    device_key: DeviceKey,
    /// Opened by the peer; the device disappears with the link
    inbound: bool,
    writer: mpsc::UnboundedSender<(SequenceNumber, Vec<u8>)>,
    reader: JoinHandle<()>,
}

#[derive(Default)]
struct TcpState {
    listener: Option<JoinHandle<()>>,
    local_address: Option<SocketAddr>,
    dialing: HashMap<DeviceKey, JoinHandle<()>>,
    links: HashMap<AdapterToken, TcpLink>,
}

struct TcpShared {
    config: TcpAdapterConfig,
    sink: Mutex<Option<AdapterEventSink>>,
    state: Mutex<TcpState>,
    next_token: AtomicU64,
}

impl TcpShared {
    fn emit(&self, event: AdapterEvent) {
        if let Some(sink) = self.sink.lock().as_ref() {
            sink.emit(event);
        }
    }

    /// Register a connected stream and start its reader and writer tasks
    fn open_link(
        self: &Arc<Self>,
        device_key: DeviceKey,
        stream: TcpStream,
        inbound: bool,
    ) -> AdapterToken {
        stream.set_nodelay(self.config.nodelay).ok();

        let token = AdapterToken::from_raw(self.next_token.fetch_add(1, Ordering::Relaxed));
        let (reader, writer) = stream.into_split();
        let (write_tx, write_rx) = mpsc::unbounded_channel();

        // Established goes out before the tasks exist, and the link is in the
        // table before the reader can try to close it.
        let mut state = self.state.lock();
        self.emit(AdapterEvent::ConnectionEstablished {
            device_key: device_key.clone(),
            token,
        });
        let reader = tokio::spawn(read_frames(Arc::clone(self), token, reader));
        tokio::spawn(write_frames(Arc::clone(self), token, writer, write_rx));
        state.links.insert(
            token,
            TcpLink {
                device_key,
                inbound,
                writer: write_tx,
                reader,
            },
        );
        token
    }

    /// Tear a link down; only the first caller for a token reports the close
    fn close_link(&self, token: AdapterToken, reason: &str) -> bool {
        let link = self.state.lock().links.remove(&token);
        match link {
            Some(link) => {
                link.reader.abort();
                debug!(%token, device = %link.device_key, reason, "tcp link closed");
                self.emit(AdapterEvent::ConnectionClosed {
                    token,
                    reason: reason.to_string(),
                });
                if link.inbound {
                    self.emit(AdapterEvent::DeviceLost {
                        device_key: link.device_key,
                    });
                }
                true
            }
            None => false,
        }
    }

    fn at_capacity(&self) -> bool {
        let state = self.state.lock();
        state.links.len() + state.dialing.len() >= self.config.base.max_connections as usize
    }
}

// ============================================================================
// FRAME I/O TASKS
// ============================================================================

async fn read_frames(shared: Arc<TcpShared>, token: AdapterToken, mut reader: OwnedReadHalf) {
    let max = shared.config.base.max_frame_size;
    let reason = loop {
        let len = match reader.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break "peer closed".to_string(),
            Err(e) => break e.to_string(),
        };
        if len > max {
            warn!(%token, len, max, "inbound frame exceeds limit");
            break format!("frame of {} bytes exceeds limit", len);
        }

        let mut payload = vec![0u8; len];
        if let Err(e) = reader.read_exact(&mut payload).await {
            break e.to_string();
        }
        shared.emit(AdapterEvent::FrameReceived { token, payload });
    };

    shared.close_link(token, &reason);
}

async fn write_frames(
    shared: Arc<TcpShared>,
    token: AdapterToken,
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<(SequenceNumber, Vec<u8>)>,
) {
    let max = shared.config.base.max_frame_size;
    let mut broken = false;
    while let Some((sequence, payload)) = queue.recv().await {
        // Rejected here rather than in `send` so completions keep queue order.
        let status = if broken {
            SendStatus::Failure
        } else if payload.len() > max {
            warn!(%token, sequence, len = payload.len(), max, "outbound frame exceeds limit");
            SendStatus::Failure
        } else {
            match write_frame(&mut writer, &payload).await {
                Ok(()) => SendStatus::Success,
                Err(e) => {
                    warn!(%token, error = %e, "tcp write failed");
                    broken = true;
                    shared.close_link(token, "write failed");
                    SendStatus::Failure
                }
            }
        };
        shared.emit(AdapterEvent::SendCompleted {
            token,
            sequence,
            status,
        });
    }
    writer.shutdown().await.ok();
}

async fn write_frame(writer: &mut OwnedWriteHalf, payload: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| std::io::Error::new(ErrorKind::InvalidInput, "frame exceeds u32 length"))?;
    writer.write_u32(len).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Dial with exponential backoff; transient failures never leave the adapter
async fn dial(config: &TcpAdapterConfig, addr: SocketAddr) -> Result<TcpStream, ConnectFailure> {
    let connect_timeout = Duration::from_secs(config.base.connection_timeout_secs as u64);
    let mut failure = ConnectFailure::DeviceUnreachable;

    for attempt in 1..=config.connect_attempts {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => {
                failure = match e.kind() {
                    ErrorKind::ConnectionRefused => ConnectFailure::Rejected,
                    _ => ConnectFailure::DeviceUnreachable,
                };
                debug!(%addr, attempt, error = %e, "tcp dial failed");
            }
            Err(_) => {
                failure = ConnectFailure::Timeout;
                debug!(%addr, attempt, "tcp dial timed out");
            }
        }

        if attempt < config.connect_attempts {
            tokio::time::sleep(config.retry_delay(attempt)).await;
        }
    }

    Err(failure)
}

// ============================================================================
// TCP ADAPTER
// ============================================================================

/// TCP adapter implementation
pub struct TcpAdapter {
    shared: Arc<TcpShared>,
}

impl TcpAdapter {
    pub fn new(config: TcpAdapterConfig) -> Self {
        Self {
            shared: Arc::new(TcpShared {
                config,
                sink: Mutex::new(None),
                state: Mutex::new(TcpState::default()),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    /// Address the listener is bound to, once discovery has started
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.shared.state.lock().local_address
    }

    pub fn is_discovering(&self) -> bool {
        self.shared.state.lock().listener.is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.state.lock().links.len()
    }

    fn spawn_accept_loop(&self, listener: TcpListener) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "tcp accept failed");
                        continue;
                    }
                };

                if shared.at_capacity() {
                    warn!(%addr, "tcp connection refused, adapter at capacity");
                    continue;
                }

                let device_key = DeviceKey::tcp(addr);
                shared.emit(AdapterEvent::DeviceDiscovered(DeviceInfo::new(
                    device_key.clone(),
                    addr.ip().to_string(),
                )));
                shared.open_link(device_key, stream, true);
            }
        })
    }
}

#[async_trait]
impl TransportAdapter for TcpAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn attach(&self, sink: AdapterEventSink) {
        *self.shared.sink.lock() = Some(sink);
    }

    async fn start_discovery(&self) -> Result<(), TransportError> {
        if self.is_discovering() {
            return Ok(());
        }
        self.shared.config.validate()?;

        let bind_addr = format!(
            "{}:{}",
            self.shared.config.bind_address, self.shared.config.bind_port
        );
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| TransportError::AdapterUnavailable(format!("{}: {}", bind_addr, e)))?;
        let local_address = listener.local_addr()?;

        let handle = self.spawn_accept_loop(listener);
        {
            let mut state = self.shared.state.lock();
            if state.listener.is_some() {
                // Lost a race with a concurrent start.
                handle.abort();
                return Ok(());
            }
            state.listener = Some(handle);
            state.local_address = Some(local_address);
        }
        info!(%local_address, "tcp adapter listening");

        for peer in &self.shared.config.static_peers {
            self.shared.emit(AdapterEvent::DeviceDiscovered(DeviceInfo::new(
                DeviceKey::tcp(*peer),
                peer.to_string(),
            )));
        }
        Ok(())
    }

    async fn stop_discovery(&self) {
        let mut state = self.shared.state.lock();
        if let Some(handle) = state.listener.take() {
            handle.abort();
            state.local_address = None;
        }
    }

    fn connect(&self, device_key: &DeviceKey) {
        let Some(addr) = device_key.socket_addr() else {
            self.shared.emit(AdapterEvent::ConnectionFailed {
                device_key: device_key.clone(),
                reason: ConnectFailure::DeviceUnreachable,
            });
            return;
        };

        if self.shared.at_capacity() {
            self.shared.emit(AdapterEvent::ConnectionFailed {
                device_key: device_key.clone(),
                reason: ConnectFailure::Rejected,
            });
            return;
        }

        let shared = Arc::clone(&self.shared);
        let key = device_key.clone();

        // The lock is held across spawn + insert so the task cannot finish
        // before its entry exists.
        let mut state = self.shared.state.lock();
        if state.dialing.contains_key(device_key) {
            debug!(device = %device_key, "dial already pending, joining it");
            return;
        }
        let task = tokio::spawn(async move {
            let outcome = dial(&shared.config, addr).await;
            if shared.state.lock().dialing.remove(&key).is_none() {
                return;
            }
            match outcome {
                Ok(stream) => {
                    shared.open_link(key, stream, false);
                }
                Err(reason) => shared.emit(AdapterEvent::ConnectionFailed {
                    device_key: key,
                    reason,
                }),
            }
        });
        state.dialing.insert(device_key.clone(), task);
    }

    fn abandon_connect(&self, device_key: &DeviceKey) -> bool {
        let Some(task) = self.shared.state.lock().dialing.remove(device_key) else {
            return false;
        };
        task.abort();
        self.shared.emit(AdapterEvent::ConnectionFailed {
            device_key: device_key.clone(),
            reason: ConnectFailure::Timeout,
        });
        true
    }

    fn disconnect(&self, token: AdapterToken) {
        if !self.shared.close_link(token, "closed by request") {
            self.shared.emit(AdapterEvent::ConnectionClosed {
                token,
                reason: "already closed".to_string(),
            });
        }
    }

    fn send(&self, token: AdapterToken, sequence: SequenceNumber, payload: Vec<u8>) {
        let queued = match self.shared.state.lock().links.get(&token) {
            Some(link) => link.writer.send((sequence, payload)).is_ok(),
            None => false,
        };
        if !queued {
            self.shared.emit(AdapterEvent::SendCompleted {
                token,
                sequence,
                status: SendStatus::Failure,
            });
        }
    }

    async fn shutdown(&self) {
        self.stop_discovery().await;

        let (dials, tokens): (Vec<_>, Vec<_>) = {
            let mut state = self.shared.state.lock();
            (
                state.dialing.drain().collect(),
                state.links.keys().copied().collect(),
            )
        };

        for (device_key, task) in dials {
            task.abort();
            self.shared.emit(AdapterEvent::ConnectionFailed {
                device_key,
                reason: ConnectFailure::DeviceUnreachable,
            });
        }
        for token in tokens {
            self.shared.close_link(token, "adapter shut down");
        }
    }
}
