//! Reverse-announce discovery of hubs on the local network.
//!
//! Hubs do not answer a broadcast directly.  Instead the engine:
//!
//! 1. Broadcasts an announce datagram every interval:
//!    `_logitech-reverse-bonjour._tcp.local.\n<listen-port>`.
//! 2. Accepts the TCP connection each hub opens back to `<listen-port>` and
//!    reads its self-report until EOF.
//! 3. Feeds the decoded report to the [`HubRegistry`], which decides whether
//!    the hub just came Online.
//! 4. Sweeps the registry every interval and reports hubs that went quiet
//!    for `expiry_factor × interval` as Offline.
//!
//! Every task is cancelled through one [`CancellationToken`] and instrumented
//! with the span passed to [`DiscoveryEngine::start`].

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use harmony_core::{decode_report, DeviceDigest};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

use crate::application::registry::HubRegistry;
use crate::infrastructure::storage::config::DiscoveryConfig;

/// Service name hubs listen for.
pub const ANNOUNCE_PREFIX: &str = "_logitech-reverse-bonjour._tcp.local.\n";

/// Error type for discovery operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// A socket could not be bound at start.
    #[error("failed to bind discovery socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    /// The announce datagram could not be sent.
    #[error("failed to broadcast announce to {addr}: {source}")]
    Broadcast {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    /// A hub sent a self-report that could not be used.
    #[error("undecodable self-report from {peer}: {reason}")]
    Decode { peer: SocketAddr, reason: String },
}

/// Output of the engine.
#[derive(Debug)]
pub enum DiscoveryEvent {
    /// A hub came Online or went Offline; see [`DeviceDigest::state`].
    Hub(DeviceDigest),
    /// A broadcast failed.  The engine keeps running.
    Failed(DiscoveryError),
}

/// Builds the announce datagram for a collection port.
pub fn announce_payload(port: u16) -> String {
    format!("{ANNOUNCE_PREFIX}{port}")
}

/// Running discovery engine.  Dropping it cancels all tasks.
pub struct DiscoveryEngine {
    listen_addr: SocketAddr,
    cancel: CancellationToken,
    snapshots: mpsc::Sender<oneshot::Sender<Vec<DeviceDigest>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl DiscoveryEngine {
    /// Binds both sockets and starts broadcasting.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Bind`] if the TCP listener or the UDP socket
    /// cannot be acquired.
    pub async fn start(
        config: DiscoveryConfig,
        span: Span,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DiscoveryEvent>), DiscoveryError> {
        let tcp_addr = config.listen_addr();
        let listener = TcpListener::bind(tcp_addr)
            .await
            .map_err(|source| DiscoveryError::Bind {
                addr: tcp_addr,
                source,
            })?;
        let listen_addr = listener
            .local_addr()
            .map_err(|source| DiscoveryError::Bind {
                addr: tcp_addr,
                source,
            })?;

        let udp_addr = SocketAddr::new(config.bind_address, 0);
        let socket = UdpSocket::bind(udp_addr)
            .await
            .and_then(|socket| socket.set_broadcast(true).map(|()| socket))
            .map_err(|source| DiscoveryError::Bind {
                addr: udp_addr,
                source,
            })?;

        let cancel = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (report_tx, report_rx) = mpsc::channel(64);
        let (snapshot_tx, snapshot_rx) = mpsc::channel(4);

        let payload = announce_payload(listen_addr.port());
        let tasks = vec![
            tokio::spawn(
                broadcast_loop(
                    socket,
                    config.broadcast_target(),
                    payload,
                    config.interval(),
                    event_tx.clone(),
                    cancel.clone(),
                )
                .instrument(span.clone()),
            ),
            tokio::spawn(
                accept_loop(listener, config.clone(), report_tx, cancel.clone(), span.clone())
                    .instrument(span.clone()),
            ),
            tokio::spawn(
                registry_loop(
                    report_rx,
                    snapshot_rx,
                    event_tx,
                    config.interval(),
                    config.expiry_threshold(),
                    cancel.clone(),
                )
                .instrument(span.clone()),
            ),
        ];

        span.in_scope(|| {
            info!(
                listen = %listen_addr,
                target = %config.broadcast_target(),
                "discovery started"
            )
        });

        Ok((
            Self {
                listen_addr,
                cancel,
                snapshots: snapshot_tx,
                tasks,
            },
            event_rx,
        ))
    }

    /// Starts an engine and bundles it with its event receiver.
    ///
    /// # Errors
    ///
    /// See [`DiscoveryEngine::start`].
    pub async fn observe(
        config: DiscoveryConfig,
        span: Span,
    ) -> Result<DiscoveryStream, DiscoveryError> {
        let (engine, events) = Self::start(config, span).await?;
        Ok(DiscoveryStream { engine, events })
    }

    /// Actual TCP collection address.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Copies of every registry entry, Online and Offline.
    ///
    /// Empty once the engine is stopped.
    pub async fn snapshot(&self) -> Vec<DeviceDigest> {
        let (tx, rx) = oneshot::channel();
        if self.snapshots.send(tx).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Stops all tasks and releases both sockets.  Safe to call repeatedly.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "discovery task ended abnormally");
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for DiscoveryEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A [`DiscoveryEngine`] that owns its event receiver.
pub struct DiscoveryStream {
    engine: DiscoveryEngine,
    events: mpsc::UnboundedReceiver<DiscoveryEvent>,
}

impl DiscoveryStream {
    /// Next event, or `None` once the engine has stopped.
    pub async fn recv(&mut self) -> Option<DiscoveryEvent> {
        self.events.recv().await
    }

    pub fn engine(&self) -> &DiscoveryEngine {
        &self.engine
    }

    pub async fn stop(&mut self) {
        self.engine.stop().await;
    }

    pub fn into_parts(self) -> (DiscoveryEngine, mpsc::UnboundedReceiver<DiscoveryEvent>) {
        (self.engine, self.events)
    }
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

async fn broadcast_loop(
    socket: UdpSocket,
    target: SocketAddr,
    payload: String,
    period: Duration,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        debug!(%target, "announcing");
        if let Err(source) = socket.send_to(payload.as_bytes(), target).await {
            warn!(%target, error = %source, "announce failed");
            let failure = DiscoveryError::Broadcast {
                addr: target,
                source,
            };
            if events.send(DiscoveryEvent::Failed(failure)).is_err() {
                break;
            }
        }
    }

    debug!("broadcast loop stopped");
}

async fn accept_loop(
    listener: TcpListener,
    config: DiscoveryConfig,
    reports: mpsc::Sender<DeviceDigest>,
    cancel: CancellationToken,
    span: Span,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, "hub connected");
                tokio::spawn(
                    collect_report(
                        stream,
                        peer,
                        config.max_report_bytes,
                        config.expiry_threshold(),
                        reports.clone(),
                        cancel.clone(),
                    )
                    .instrument(span.clone()),
                );
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }

    debug!("accept loop stopped");
}

/// Reads one self-report to EOF and hands the digest to the registry task.
async fn collect_report(
    mut stream: TcpStream,
    peer: SocketAddr,
    max_bytes: usize,
    deadline: Duration,
    reports: mpsc::Sender<DeviceDigest>,
    cancel: CancellationToken,
) {
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        outcome = tokio::time::timeout(deadline, read_report(&mut stream, peer, max_bytes)) => outcome,
    };

    let fields = match outcome {
        Ok(Ok(fields)) => fields,
        Ok(Err(e)) => {
            warn!(error = %e, "dropping self-report");
            return;
        }
        Err(_) => {
            warn!(%peer, "self-report not completed in {deadline:?}; dropping");
            return;
        }
    };

    let digest = DeviceDigest::from_report(fields, peer.ip(), Instant::now());
    debug!(%peer, key = %digest.key(), name = %digest.friendly_name, "self-report received");
    let _ = reports.send(digest).await;
}

async fn read_report(
    stream: &mut TcpStream,
    peer: SocketAddr,
    max_bytes: usize,
) -> Result<harmony_core::WireMap, DiscoveryError> {
    let mut buf = Vec::new();
    let limit = u64::try_from(max_bytes).unwrap_or(u64::MAX).saturating_add(1);
    stream
        .take(limit)
        .read_to_end(&mut buf)
        .await
        .map_err(|e| DiscoveryError::Decode {
            peer,
            reason: format!("read failed: {e}"),
        })?;

    if buf.len() > max_bytes {
        return Err(DiscoveryError::Decode {
            peer,
            reason: format!("report exceeds {max_bytes} bytes"),
        });
    }

    let text = String::from_utf8_lossy(&buf);
    decode_report(&text).map_err(|e| DiscoveryError::Decode {
        peer,
        reason: e.to_string(),
    })
}

async fn registry_loop(
    mut reports: mpsc::Receiver<DeviceDigest>,
    mut snapshots: mpsc::Receiver<oneshot::Sender<Vec<DeviceDigest>>>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    period: Duration,
    threshold: Duration,
    cancel: CancellationToken,
) {
    let mut registry = HubRegistry::new();
    let mut sweep = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let changed = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(digest) = reports.recv() => registry.observe(digest).into_iter().collect(),
            Some(reply) = snapshots.recv() => {
                let _ = reply.send(registry.all());
                Vec::new()
            }
            _ = sweep.tick() => registry.expire(Instant::now(), threshold),
        };

        for digest in changed {
            info!(
                key = %digest.key(),
                address = %digest.address,
                name = %digest.friendly_name,
                state = %digest.state,
                "hub state changed"
            );
            if events.send(DiscoveryEvent::Hub(digest)).is_err() {
                debug!("discovery receiver dropped");
                return;
            }
        }
    }

    debug!(hubs = registry.len(), "registry task stopped");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
