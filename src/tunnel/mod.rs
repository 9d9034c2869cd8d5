// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Node-local tunnels carrying hypervisor migration traffic.
//!
//! A migration moves bytes between the hypervisor on the source node and the
//! hypervisor on the target node. Neither hypervisor talks TCP to the other
//! directly; instead each side of a migration gets a tunnel:
//!
//! - **Source**: one unix socket per channel under the launcher's work directory.
//!   The hypervisor connects to it, the tunnel dials the target's published
//!   `address:port` and relays.
//! - **Target**: one TCP listener per channel on an ephemeral port. An accepted
//!   connection is relayed to the matching local unix socket (the hypervisor
//!   control socket or a migration channel socket).
//!
//! Tunnels are keyed by the VMI UID and live until the controller that started
//! them stops them. After [`TunnelManager::initiate_graceful_shutdown`] no new
//! key may be started, while open tunnels keep relaying.
//!
//! # Example
//!
//! ```rust,no_run
//! use handoff::tunnel::{TunnelConfig, TunnelManager};
//! use std::collections::BTreeMap;
//! use std::path::PathBuf;
//!
//! # async fn example() -> Result<(), handoff::migration_errors::TunnelError> {
//! let manager = TunnelManager::new(TunnelConfig::plain("0.0.0.0"));
//! let sockets = BTreeMap::from([(
//!     "0".to_string(),
//!     PathBuf::from("/var/run/libvirt/virtqemud-sock"),
//! )]);
//! manager.start_target_listener("5f0c...", &sockets)?;
//! let ports = manager.get_target_listener_ports("5f0c...");
//! # Ok(())
//! # }
//! ```

pub mod relay;
pub mod tls;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::HandlerConfig;
use crate::constants::{CONTROL_CHANNEL, MIGRATION_PROXY_DIR, TUNNEL_HANDSHAKE_TIMEOUT_SECS};
use crate::metrics;
use crate::migration_errors::TunnelError;
use relay::{relay, RelayEnd};
pub use tls::TunnelTls;

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Which end of a migration a tunnel serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelRole {
    Source,
    Target,
}

impl TunnelRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Target => "target",
        }
    }
}

/// Settings fixed for the lifetime of a [`TunnelManager`].
#[derive(Clone, Debug)]
pub struct TunnelConfig {
    /// Local address target listeners bind to.
    pub listen_address: String,
    /// Mutual TLS for the TCP leg, `None` for plain TCP.
    pub tls: Option<TunnelTls>,
    /// Limit for setting up a relayed connection (dial, TLS handshake, local socket).
    pub handshake_timeout: Duration,
}

impl TunnelConfig {
    /// Plain TCP tunnels.
    #[must_use]
    pub fn plain(listen_address: impl Into<String>) -> Self {
        Self {
            listen_address: listen_address.into(),
            tls: None,
            handshake_timeout: Duration::from_secs(TUNNEL_HANDSHAKE_TIMEOUT_SECS),
        }
    }

    /// Tunnel settings from the daemon configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Tls`] if TLS is enabled but a certificate path is
    /// missing or the PEM material cannot be loaded.
    pub fn from_handler_config(config: &HandlerConfig) -> Result<Self, TunnelError> {
        if !config.tls_enabled() {
            warn!("Migration TLS is disabled, migration traffic is relayed in plain text");
            return Ok(Self::plain(config.tunnel_listen_address.clone()));
        }

        let (Some(cert), Some(key), Some(ca)) = (
            config.tls_cert.as_deref(),
            config.tls_key.as_deref(),
            config.tls_ca.as_deref(),
        ) else {
            return Err(TunnelError::Tls(
                "migration TLS requires a certificate, a key and a CA bundle".to_string(),
            ));
        };

        Ok(Self {
            tls: Some(TunnelTls::from_pem_files(
                cert,
                key,
                ca,
                &config.tls_server_name,
            )?),
            ..Self::plain(config.tunnel_listen_address.clone())
        })
    }
}

/// Socket the source hypervisor connects to for one channel.
///
/// The control channel uses `<key>-source.sock`, every other channel
/// `<key>-<channel>-source.sock`, both under `work_dir/migrationproxy`.
#[must_use]
pub fn source_socket_path(work_dir: &Path, key: &str, channel: &str) -> PathBuf {
    let file = if channel == CONTROL_CHANNEL {
        format!("{key}-source.sock")
    } else {
        format!("{key}-{channel}-source.sock")
    };
    work_dir.join(MIGRATION_PROXY_DIR).join(file)
}

/// `host:port`, bracketing IPv6 literals.
fn join_host_port(host: &str, port: i32) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Unlink a migration socket file; a missing file is fine.
fn remove_socket_file(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "Removed migration socket");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

struct SourceTunnels {
    target_address: String,
    ports: BTreeMap<String, i32>,
    work_dir: PathBuf,
    sockets: Vec<PathBuf>,
    cancel: CancellationToken,
}

impl Drop for SourceTunnels {
    fn drop(&mut self) {
        self.cancel.cancel();
        // Unix listeners leave their socket file behind
        for path in &self.sockets {
            if let Err(e) = remove_socket_file(path) {
                warn!(path = %path.display(), error = %e, "Failed to remove migration socket");
            }
        }
    }
}

struct TargetTunnels {
    sockets: BTreeMap<String, PathBuf>,
    ports: BTreeMap<String, i32>,
    cancel: CancellationToken,
}

impl Drop for TargetTunnels {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Default)]
struct Registry {
    source: HashMap<String, SourceTunnels>,
    target: HashMap<String, TargetTunnels>,
    shutting_down: bool,
}

impl Registry {
    fn listener_count(&self) -> usize {
        self.source.values().map(|t| t.ports.len()).sum::<usize>()
            + self.target.values().map(|t| t.ports.len()).sum::<usize>()
    }
}

/// Registry of all migration tunnels on this node.
///
/// Start operations must be called from within a Tokio runtime: listeners are
/// registered with the runtime and served by spawned tasks.
pub struct TunnelManager {
    listen_address: String,
    tls: Option<Arc<TunnelTls>>,
    handshake_timeout: Duration,
    registry: Mutex<Registry>,
}

impl TunnelManager {
    #[must_use]
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            listen_address: config.listen_address,
            tls: config.tls.map(Arc::new),
            handshake_timeout: config.handshake_timeout,
            registry: Mutex::new(Registry::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open one unix socket per channel that relays to `target_address:port`.
    ///
    /// Starting a key again with the same parameters does nothing; with different
    /// parameters the previous tunnels are stopped first.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::ShuttingDown`] after graceful shutdown began, or
    /// [`TunnelError::Bind`] if a socket cannot be created.
    pub fn start_source_listener(
        &self,
        key: &str,
        target_address: &str,
        ports: &BTreeMap<String, i32>,
        work_dir: &Path,
    ) -> Result<(), TunnelError> {
        let mut registry = self.lock();
        if registry.shutting_down {
            return Err(TunnelError::ShuttingDown);
        }

        if let Some(existing) = registry.source.get(key) {
            if existing.target_address == target_address
                && existing.ports == *ports
                && existing.work_dir == work_dir
            {
                debug!(key, "Source migration tunnels already running");
                return Ok(());
            }
            info!(key, "Replacing source migration tunnels with new parameters");
            registry.source.remove(key);
        }

        let proxy_dir = work_dir.join(MIGRATION_PROXY_DIR);
        std::fs::create_dir_all(&proxy_dir).map_err(|source| TunnelError::Bind {
            endpoint: proxy_dir.display().to_string(),
            source,
        })?;

        let mut listeners = Vec::with_capacity(ports.len());
        for (channel, port) in ports {
            let path = source_socket_path(work_dir, key, channel);
            let bind_error = |source| TunnelError::Bind {
                endpoint: path.display().to_string(),
                source,
            };
            remove_socket_file(&path).map_err(bind_error)?;
            let listener = UnixListener::bind(&path).map_err(bind_error)?;
            listeners.push((channel.clone(), path, join_host_port(target_address, *port), listener));
        }

        let cancel = CancellationToken::new();
        let sockets = listeners.iter().map(|(_, path, _, _)| path.clone()).collect();
        for (channel, path, remote, listener) in listeners {
            info!(
                key,
                channel = %channel,
                socket = %path.display(),
                remote = %remote,
                "Source migration tunnel listening"
            );
            tokio::spawn(serve_source_channel(
                listener,
                remote,
                self.tls.clone(),
                self.handshake_timeout,
                cancel.clone(),
                key.to_string(),
                channel,
            ));
        }

        registry.source.insert(
            key.to_string(),
            SourceTunnels {
                target_address: target_address.to_string(),
                ports: ports.clone(),
                work_dir: work_dir.to_path_buf(),
                sockets,
                cancel,
            },
        );
        metrics::set_open_tunnel_listeners(registry.listener_count());
        Ok(())
    }

    /// Open one TCP listener per channel that relays to the channel's unix socket.
    ///
    /// Ports are allocated by the kernel; read them back with
    /// [`get_target_listener_ports`](Self::get_target_listener_ports).
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::ShuttingDown`] after graceful shutdown began, or
    /// [`TunnelError::Bind`] if a listener cannot be bound.
    pub fn start_target_listener(
        &self,
        key: &str,
        sockets: &BTreeMap<String, PathBuf>,
    ) -> Result<(), TunnelError> {
        let mut registry = self.lock();
        if registry.shutting_down {
            return Err(TunnelError::ShuttingDown);
        }

        if let Some(existing) = registry.target.get(key) {
            if existing.sockets == *sockets {
                debug!(key, "Target migration tunnels already running");
                return Ok(());
            }
            info!(key, "Replacing target migration tunnels with new sockets");
            registry.target.remove(key);
        }

        let mut listeners = Vec::with_capacity(sockets.len());
        let mut ports = BTreeMap::new();
        for (channel, socket) in sockets {
            let endpoint = format!("{}:0", self.listen_address);
            let bind_error = |source| TunnelError::Bind {
                endpoint: endpoint.clone(),
                source,
            };
            let std_listener =
                std::net::TcpListener::bind((self.listen_address.as_str(), 0)).map_err(bind_error)?;
            std_listener.set_nonblocking(true).map_err(bind_error)?;
            let port = std_listener.local_addr().map_err(bind_error)?.port();
            let listener = TcpListener::from_std(std_listener).map_err(bind_error)?;

            ports.insert(channel.clone(), i32::from(port));
            listeners.push((channel.clone(), socket.clone(), port, listener));
        }

        let cancel = CancellationToken::new();
        for (channel, socket, port, listener) in listeners {
            info!(
                key,
                channel = %channel,
                port,
                socket = %socket.display(),
                "Target migration tunnel listening"
            );
            tokio::spawn(serve_target_channel(
                listener,
                socket,
                self.tls.clone(),
                self.handshake_timeout,
                cancel.clone(),
                key.to_string(),
                channel,
            ));
        }

        registry.target.insert(
            key.to_string(),
            TargetTunnels {
                sockets: sockets.clone(),
                ports,
                cancel,
            },
        );
        metrics::set_open_tunnel_listeners(registry.listener_count());
        Ok(())
    }

    /// Ports of the live target listeners of `key`, by channel.
    ///
    /// Empty when no target tunnel runs for the key.
    #[must_use]
    pub fn get_target_listener_ports(&self, key: &str) -> BTreeMap<String, i32> {
        self.lock()
            .target
            .get(key)
            .map(|t| t.ports.clone())
            .unwrap_or_default()
    }

    /// Close the source tunnels of `key` and every connection they relay, and
    /// remove their socket files.
    pub fn stop_source_listener(&self, key: &str) {
        let mut registry = self.lock();
        if registry.source.remove(key).is_some() {
            info!(key, "Stopped source migration tunnels");
            metrics::set_open_tunnel_listeners(registry.listener_count());
        }
    }

    /// Close the target listeners of `key` and every connection they relay.
    pub fn stop_target_listener(&self, key: &str) {
        let mut registry = self.lock();
        if registry.target.remove(key).is_some() {
            info!(key, "Stopped target migration tunnels");
            metrics::set_open_tunnel_listeners(registry.listener_count());
        }
    }

    /// Refuse new keys from now on; open tunnels are left alone.
    pub fn initiate_graceful_shutdown(&self) {
        let mut registry = self.lock();
        if !registry.shutting_down {
            info!(
                open_listeners = registry.listener_count(),
                "Migration tunnels entering graceful shutdown"
            );
        }
        registry.shutting_down = true;
    }

    /// Number of open listeners across all keys and both roles.
    #[must_use]
    pub fn open_listener_count(&self) -> usize {
        self.lock().listener_count()
    }

    /// Wait until every listener is closed, checking every `poll_interval`.
    ///
    /// Returns `false` if listeners were still open after `timeout`.
    pub async fn drain(&self, timeout: Duration, poll_interval: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let open = self.open_listener_count();
            if open == 0 {
                info!("All migration tunnels closed");
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                warn!(open_listeners = open, "Migration tunnels still open after drain timeout");
                return false;
            }
            info!(open_listeners = open, "Waiting for migration tunnels to close");
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }
}

async fn serve_source_channel(
    listener: UnixListener,
    remote: String,
    tls: Option<Arc<TunnelTls>>,
    handshake_timeout: Duration,
    cancel: CancellationToken,
    key: String,
    channel: String,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let remote = remote.clone();
                    let tls = tls.clone();
                    let cancel = cancel.clone();
                    let key = key.clone();
                    let channel = channel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = forward_to_target(stream, &remote, tls.as_deref(), handshake_timeout, &cancel).await {
                            warn!(key = %key, channel = %channel, remote = %remote, error = %e, "Source migration connection failed");
                        }
                    });
                }
                Err(e) => {
                    error!(key = %key, channel = %channel, error = %e, "Failed to accept source migration connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
    debug!(key = %key, channel = %channel, "Source migration tunnel closed");
}

/// Run the setup of a relayed connection, bounded by `limit` and by `cancel`.
///
/// `Ok(None)` means the tunnel was stopped before the setup finished.
async fn connection_setup<T>(
    setup: impl Future<Output = io::Result<T>>,
    limit: Duration,
    cancel: &CancellationToken,
) -> io::Result<Option<T>> {
    tokio::select! {
        () = cancel.cancelled() => Ok(None),
        finished = tokio::time::timeout(limit, setup) => match finished {
            Ok(result) => result.map(Some),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connection setup did not finish within {limit:?}"),
            )),
        },
    }
}

async fn forward_to_target(
    local: UnixStream,
    remote: &str,
    tls: Option<&TunnelTls>,
    handshake_timeout: Duration,
    cancel: &CancellationToken,
) -> io::Result<()> {
    let dial = async {
        let tcp = TcpStream::connect(remote).await?;
        tcp.set_nodelay(true)?;
        Ok::<_, io::Error>(tcp)
    };
    let Some(tcp) = connection_setup(dial, handshake_timeout, cancel).await? else {
        return Ok(());
    };

    let (stats, end) = match tls {
        Some(tls) => {
            let handshake = tls.connector().connect(tls.server_name(), tcp);
            let Some(stream) = connection_setup(handshake, handshake_timeout, cancel).await? else {
                return Ok(());
            };
            relay(local, stream, TunnelRole::Source, cancel).await
        }
        None => relay(local, tcp, TunnelRole::Source, cancel).await,
    };

    debug!(remote, outbound = stats.outbound, inbound = stats.inbound, end = ?end, "Source migration connection finished");
    match end {
        RelayEnd::Failed(e) => Err(e),
        RelayEnd::Closed | RelayEnd::Cancelled => Ok(()),
    }
}

async fn serve_target_channel(
    listener: TcpListener,
    socket: PathBuf,
    tls: Option<Arc<TunnelTls>>,
    handshake_timeout: Duration,
    cancel: CancellationToken,
    key: String,
    channel: String,
) {
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            // One connection at a time; the next transfer attempt is accepted once
            // this one ends
            Ok((tcp, peer)) => {
                debug!(key = %key, channel = %channel, peer = %peer, "Accepted target migration connection");
                if let Err(e) = forward_to_socket(tcp, &socket, tls.as_deref(), handshake_timeout, &cancel).await {
                    warn!(key = %key, channel = %channel, peer = %peer, error = %e, "Target migration connection failed");
                }
            }
            Err(e) => {
                error!(key = %key, channel = %channel, error = %e, "Failed to accept target migration connection");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
    debug!(key = %key, channel = %channel, "Target migration tunnel closed");
}

async fn forward_to_socket(
    tcp: TcpStream,
    socket: &Path,
    tls: Option<&TunnelTls>,
    handshake_timeout: Duration,
    cancel: &CancellationToken,
) -> io::Result<()> {
    tcp.set_nodelay(true)?;

    let (stats, end) = match tls {
        Some(tls) => {
            let setup = async {
                let remote = tls.acceptor().accept(tcp).await?;
                let local = UnixStream::connect(socket).await?;
                Ok::<_, io::Error>((local, remote))
            };
            let Some((local, remote)) = connection_setup(setup, handshake_timeout, cancel).await? else {
                return Ok(());
            };
            relay(local, remote, TunnelRole::Target, cancel).await
        }
        None => {
            let connect = UnixStream::connect(socket);
            let Some(local) = connection_setup(connect, handshake_timeout, cancel).await? else {
                return Ok(());
            };
            relay(local, tcp, TunnelRole::Target, cancel).await
        }
    };

    debug!(socket = %socket.display(), outbound = stats.outbound, inbound = stats.inbound, end = ?end, "Target migration connection finished");
    match end {
        RelayEnd::Failed(e) => Err(e),
        RelayEnd::Closed | RelayEnd::Cancelled => Ok(()),
    }
}
