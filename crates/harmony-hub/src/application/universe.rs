//! Universe: one session per discovered hub, merged into a single event stream.
//!
//! The router reads [`DiscoveryEvent`]s and hands each digest to a supervisor
//! task owned by the hub's address.  A supervisor follows the latest digest
//! for its address only:
//!
//! ```text
//! Online ──► close previous session ──► connect ──► forward events
//! Online again while connecting ──► abandon the attempt, start over
//! Offline ──► close session, stay idle until the hub reappears
//! ```
//!
//! Every forwarded [`HubEvent`] is stamped with the digest's friendly name.
//! The discovery callback sees every digest, including ones skipped or
//! superseded before a connect finished; those carry no session.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use harmony_core::{DeviceDigest, HubEvent, HubState};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

use crate::infrastructure::network::discovery::{DiscoveryEngine, DiscoveryError, DiscoveryEvent};
use crate::infrastructure::network::session::{HubSession, SessionError, SessionOptions};
use crate::infrastructure::network::transport::HubAuthenticator;
use crate::infrastructure::storage::config::HarmonyConfig;

/// Invoked once per discovery event; the session is present only after a
/// successful connect.
pub type DiscoveryCallback = Arc<dyn Fn(&DeviceDigest, Option<&HubSession>) + Send + Sync>;

#[derive(Clone)]
pub struct UniverseOptions {
    pub session: SessionOptions,
    pub on_discovery: Option<DiscoveryCallback>,
    pub span: Span,
}

impl Default for UniverseOptions {
    fn default() -> Self {
        Self {
            session: SessionOptions::default(),
            on_discovery: None,
            span: Span::none(),
        }
    }
}

impl UniverseOptions {
    /// Session options from `config`, instrumented with `span`.
    pub fn from_config(config: &HarmonyConfig, span: Span) -> Self {
        Self {
            session: SessionOptions::from_config(&config.session, span.clone()),
            on_discovery: None,
            span,
        }
    }

    pub fn on_discovery(
        mut self,
        callback: impl Fn(&DeviceDigest, Option<&HubSession>) + Send + Sync + 'static,
    ) -> Self {
        self.on_discovery = Some(Arc::new(callback));
        self
    }
}

/// Running orchestrator.  Dropping it cancels every supervisor.
pub struct Universe {
    cancel: CancellationToken,
    router: Option<JoinHandle<()>>,
    engine: Option<DiscoveryEngine>,
}

impl Universe {
    /// Follows any stream of discovery events.
    pub fn spawn(
        discoveries: mpsc::UnboundedReceiver<DiscoveryEvent>,
        authenticator: Arc<dyn HubAuthenticator>,
        options: UniverseOptions,
    ) -> (Self, mpsc::UnboundedReceiver<HubEvent>) {
        let cancel = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let span = options.span.clone();

        let router = tokio::spawn(
            route(discoveries, authenticator, options, event_tx, cancel.clone()).instrument(span),
        );

        (
            Self {
                cancel,
                router: Some(router),
                engine: None,
            },
            event_rx,
        )
    }

    /// Starts a [`DiscoveryEngine`] and follows it.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Bind`] if discovery cannot start.
    pub async fn start(
        config: &HarmonyConfig,
        authenticator: Arc<dyn HubAuthenticator>,
        options: UniverseOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<HubEvent>), DiscoveryError> {
        let (engine, discoveries) =
            DiscoveryEngine::start(config.discovery.clone(), options.span.clone()).await?;
        let (mut universe, events) = Self::spawn(discoveries, authenticator, options);
        universe.engine = Some(engine);
        Ok((universe, events))
    }

    pub fn engine(&self) -> Option<&DiscoveryEngine> {
        self.engine.as_ref()
    }

    /// Closes every session, then stops discovery.  Safe to call repeatedly.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        if let Some(router) = self.router.take() {
            if let Err(e) = router.await {
                warn!(error = %e, "universe router ended abnormally");
            }
        }
        if let Some(engine) = self.engine.as_mut() {
            engine.stop().await;
        }
    }
}

impl Drop for Universe {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Router ────────────────────────────────────────────────────────────────────

struct Supervisor {
    digests: mpsc::UnboundedSender<DeviceDigest>,
    handle: JoinHandle<()>,
}

async fn route(
    mut discoveries: mpsc::UnboundedReceiver<DiscoveryEvent>,
    authenticator: Arc<dyn HubAuthenticator>,
    options: UniverseOptions,
    events: mpsc::UnboundedSender<HubEvent>,
    cancel: CancellationToken,
) {
    let mut supervisors: HashMap<IpAddr, Supervisor> = HashMap::new();

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = discoveries.recv() => event,
        };

        match event {
            Some(DiscoveryEvent::Hub(digest)) => {
                let address = digest.address;
                let supervisor = supervisors.entry(address).or_insert_with(|| {
                    debug!(%address, "supervising new hub address");
                    let (tx, rx) = mpsc::unbounded_channel();
                    let handle = tokio::spawn(
                        supervise(
                            address,
                            rx,
                            Arc::clone(&authenticator),
                            options.clone(),
                            events.clone(),
                            cancel.child_token(),
                        )
                        .instrument(options.span.clone()),
                    );
                    Supervisor { digests: tx, handle }
                });
                if supervisor.digests.send(digest).is_err() {
                    warn!(%address, "supervisor gone; dropping digest");
                }
            }
            Some(DiscoveryEvent::Failed(e)) => warn!(error = %e, "discovery failure"),
            None => {
                debug!("discovery stream ended");
                break;
            }
        }
    }

    cancel.cancel();
    for (address, supervisor) in supervisors {
        drop(supervisor.digests);
        if let Err(e) = supervisor.handle.await {
            warn!(%address, error = %e, "supervisor ended abnormally");
        }
    }
    debug!("universe router stopped");
}

// ── Supervisor ────────────────────────────────────────────────────────────────

/// Session currently serving an address, with the task stamping its events.
struct ActiveSession {
    session: HubSession,
    forwarder: JoinHandle<()>,
}

impl ActiveSession {
    async fn start(
        session: HubSession,
        friendly_name: String,
        events: mpsc::UnboundedSender<HubEvent>,
    ) -> Self {
        let mut source = session.observe_events().await;
        let forwarder = tokio::spawn(async move {
            let Some(source) = source.as_mut() else {
                return;
            };
            while let Some(mut event) = source.recv().await {
                event.friendly_name = Some(friendly_name.clone());
                if events.send(event).is_err() {
                    break;
                }
            }
        });
        Self { session, forwarder }
    }

    async fn shutdown(self) {
        self.session.close().await;
        let _ = self.forwarder.await;
    }
}

enum Step {
    Cancelled,
    Superseded(Option<DeviceDigest>),
    Connected(Result<HubSession, SessionError>),
}

async fn supervise(
    address: IpAddr,
    mut digests: mpsc::UnboundedReceiver<DeviceDigest>,
    authenticator: Arc<dyn HubAuthenticator>,
    options: UniverseOptions,
    events: mpsc::UnboundedSender<HubEvent>,
    cancel: CancellationToken,
) {
    let mut active: Option<ActiveSession> = None;
    let mut next: Option<DeviceDigest> = None;

    loop {
        let digest = match next.take() {
            Some(digest) => digest,
            None => tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                digest = digests.recv() => match digest {
                    Some(digest) => digest,
                    None => break,
                },
            },
        };
        let digest = latest(&mut digests, digest, |skipped| notify(&options, &skipped, None));

        if let Some(previous) = active.take() {
            debug!(%address, "closing previous session");
            previous.shutdown().await;
        }

        if digest.state == HubState::Offline {
            info!(%address, name = %digest.friendly_name, "hub offline");
            notify(&options, &digest, None);
            continue;
        }

        info!(%address, name = %digest.friendly_name, "hub online; connecting");
        let step = tokio::select! {
            biased;
            _ = cancel.cancelled() => Step::Cancelled,
            newer = digests.recv() => Step::Superseded(newer),
            result = HubSession::connect(address, authenticator.as_ref(), options.session.clone()) => {
                Step::Connected(result)
            }
        };

        match step {
            Step::Cancelled | Step::Superseded(None) => break,
            Step::Superseded(Some(newer)) => {
                debug!(%address, "connect superseded by newer digest");
                notify(&options, &digest, None);
                next = Some(newer);
            }
            Step::Connected(Ok(session)) => {
                notify(&options, &digest, Some(&session));
                let name = digest.friendly_name.clone();
                active = Some(ActiveSession::start(session, name, events.clone()).await);
            }
            Step::Connected(Err(e)) => {
                // A reconnect backoff policy would schedule a retry here.
                warn!(%address, error = %e, "connect failed");
                notify(&options, &digest, None);
            }
        }
    }

    if let Some(previous) = active.take() {
        previous.shutdown().await;
    }
    debug!(%address, "supervisor stopped");
}

/// Returns the newest queued digest, handing every older one to `skipped`
/// in arrival order.
fn latest(
    digests: &mut mpsc::UnboundedReceiver<DeviceDigest>,
    mut digest: DeviceDigest,
    mut skipped: impl FnMut(DeviceDigest),
) -> DeviceDigest {
    while let Ok(newer) = digests.try_recv() {
        skipped(std::mem::replace(&mut digest, newer));
    }
    digest
}

fn notify(options: &UniverseOptions, digest: &DeviceDigest, session: Option<&HubSession>) {
    if let Some(callback) = &options.on_discovery {
        callback(digest, session);
    }
}
