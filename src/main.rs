// tmd - transport manager daemon
// Runs the transport manager over TCP and emulated devices and logs link activity

use applink_transport::manager::{AdapterConfig, TransportManagerConfig};
use applink_transport::transport::{
    ConnectFailure, ConnectionHandle, Device, DeviceInfo, DeviceKey, DeviceState, EmulatorConfig,
    SendStatus, SequenceNumber, TcpAdapterConfig, TransportKind,
};
use applink_transport::{
    DataListener, DeviceListener, ListenerResult, TransportError, TransportManager,
};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tmd")]
#[command(about = "Transport manager daemon", long_about = None)]
#[command(version)]
struct Args {
    /// Run the TCP adapter
    #[arg(long)]
    tcp: bool,

    /// Address the TCP adapter listens on
    #[arg(long, default_value = "0.0.0.0")]
    listen: String,

    /// Port the TCP adapter listens on
    #[arg(short, long, default_value_t = 12345)]
    port: u16,

    /// TCP peer to advertise as a discovered device (repeatable)
    #[arg(long = "peer")]
    peers: Vec<SocketAddr>,

    /// Name of an emulated device to expose (repeatable)
    #[arg(long = "emulator")]
    emulated: Vec<String>,

    /// Send every received frame back on the same connection
    #[arg(long)]
    echo: bool,

    /// Connect to every device as soon as it is discovered
    #[arg(long)]
    auto_connect: bool,

    /// Timeout for each auto-connect attempt
    #[arg(long, default_value_t = 10_000)]
    connect_timeout_ms: u64,

    /// Tracing filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_filter: String,
}

// ============================================================================
// LISTENERS
// ============================================================================

/// Logs device-level activity
struct ActivityLog;

impl DeviceListener for ActivityLog {
    fn on_device_list_changed(&self, kind: TransportKind, devices: &[Device]) -> ListenerResult {
        info!(%kind, count = devices.len(), "device list changed");
        Ok(())
    }

    fn on_connection_established(
        &self,
        device: &Device,
        handle: ConnectionHandle,
    ) -> ListenerResult {
        info!(%handle, device = %device.key(), name = device.name(), "connected");
        Ok(())
    }

    fn on_connection_failed(&self, device: &Device, reason: ConnectFailure) -> ListenerResult {
        warn!(device = %device.key(), %reason, "connect failed");
        Ok(())
    }

    fn on_connection_closed(&self, device: &Device, handle: ConnectionHandle) -> ListenerResult {
        info!(%handle, device = %device.key(), "disconnected");
        Ok(())
    }
}

/// Forwards newly discovered devices to the main loop
struct AutoConnect {
    tx: mpsc::UnboundedSender<DeviceKey>,
}

impl DeviceListener for AutoConnect {
    fn on_device_list_changed(&self, _kind: TransportKind, devices: &[Device]) -> ListenerResult {
        for device in devices.iter().filter(|d| d.state() == DeviceState::Discovered) {
            let _ = self.tx.send(device.key().clone());
        }
        Ok(())
    }
}

/// Forwards received frames to the main loop and logs send outcomes
struct Echo {
    tx: mpsc::UnboundedSender<(ConnectionHandle, Vec<u8>)>,
}

impl DataListener for Echo {
    fn on_frame_received(&self, handle: ConnectionHandle, payload: &[u8]) -> ListenerResult {
        let _ = self.tx.send((handle, payload.to_vec()));
        Ok(())
    }

    fn on_send_completed(
        &self,
        handle: ConnectionHandle,
        sequence: SequenceNumber,
        status: SendStatus,
    ) -> ListenerResult {
        if status == SendStatus::Failure {
            warn!(%handle, sequence, "echo not delivered");
        }
        Ok(())
    }
}

// ============================================================================
// MAIN
// ============================================================================

fn build_config(args: &Args) -> TransportManagerConfig {
    let mut config =
        TransportManagerConfig::new().with_connect_timeout_ms(args.connect_timeout_ms);

    if args.tcp {
        let tcp = args.peers.iter().fold(
            TcpAdapterConfig::new()
                .with_bind_address(&args.listen)
                .with_bind_port(args.port),
            |cfg, peer| cfg.with_static_peer(*peer),
        );
        config = config.with_adapter(AdapterConfig::Tcp(tcp));
    }

    if !args.emulated.is_empty() {
        let emulator = args.emulated.iter().fold(EmulatorConfig::new(), |cfg, name| {
            cfg.with_device(DeviceInfo::new(DeviceKey::emulator(name), name.clone()))
        });
        config = config.with_adapter(AdapterConfig::Emulator(emulator));
    }

    config
}

#[tokio::main]
async fn main() -> Result<(), TransportError> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_filter)),
        )
        .init();

    let config = build_config(&args);
    if config.adapters.is_empty() {
        return Err(TransportError::InvalidConfig(
            "nothing to run: pass --tcp or --emulator".to_string(),
        ));
    }

    let manager = TransportManager::from_config(config)?;
    manager.add_device_listener(Arc::new(ActivityLog));

    let (discovered_tx, mut discovered) = mpsc::unbounded_channel();
    if args.auto_connect {
        manager.add_device_listener(Arc::new(AutoConnect { tx: discovered_tx }));
    }

    let (frames_tx, mut frames) = mpsc::unbounded_channel();
    if args.echo {
        manager.add_data_listener(Arc::new(Echo { tx: frames_tx }));
    }

    let started = manager.start().await?;
    info!(adapters = started, "transport manager running");

    let timeout = manager.config().connect_timeout();
    loop {
        tokio::select! {
            Some(device_key) = discovered.recv() => {
                let manager = manager.clone();
                tokio::spawn(async move {
                    match manager.connect_and_wait(&device_key, timeout).await {
                        Ok(_) | Err(TransportError::AlreadyConnecting(_)) => {}
                        Err(e) => warn!(device = %device_key, error = %e, "auto-connect failed"),
                    }
                });
            }
            Some((handle, payload)) = frames.recv() => {
                if let Err(e) = manager.send(handle, payload) {
                    warn!(%handle, error = %e, "echo dropped");
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "signal handler failed");
                }
                break;
            }
        }
    }

    info!("shutting down");
    manager.stop().await;
    info!(stats = ?manager.stats(), "stopped");
    Ok(())
}
