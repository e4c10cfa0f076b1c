//! HubSession: one live, multiplexed command/event session with a hub.
//!
//! A session sits on top of a [`HubLink`] and runs three background tasks:
//!
//! - **receive loop** – routes each inbound response to the request waiting
//!   for its correlation id, and turns `connect.stateDigest?notify` events
//!   into [`HubEvent`]s.
//! - **warm-up** – fetches the hub configuration and the current activity,
//!   then moves the session from `Connecting` to `Ready`.
//! - **keepalive** – re-fetches the current activity every interval.  A
//!   failure marks the session `Unhealthy` without closing it.
//!
//! ```text
//!                 request(id=7) ──► outbound ──► hub
//! caller ◄── oneshot(7) ◄── pending[7] ◄── receive loop ◄── inbound ◄── hub
//! ```
//!
//! Tasks hold only a weak reference to the session state, so dropping every
//! [`HubSession`] handle cancels them.  [`HubSession::close`] does the same
//! explicitly and waits for them to finish.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use harmony_core::protocol::codec::fields;
use harmony_core::protocol::stanza::{command, STATE_DIGEST_NOTIFY};
use harmony_core::protocol::CorrelationIds;
use harmony_core::{
    Activity, ActivityStatus, ActivityTable, HubConfig, HubEvent, ResponseBody, Stanza,
    StateDigest, WireMap,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

use super::transport::{HubAuthenticator, HubLink, TransportError};
use crate::infrastructure::storage::config::SessionConfig;

/// Error type for session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Pairing or login failed.
    #[error("could not connect to hub {addr}: {source}")]
    Connection {
        addr: IpAddr,
        #[source]
        source: TransportError,
    },
    /// The link ended or the session was closed before the operation finished.
    #[error("connection closed")]
    ConnectionClosed,
    /// The hub answered, but not with what the command needs.
    #[error("unexpected reply to {command}: {reason}")]
    Request { command: String, reason: String },
    #[error("{command} timed out after {after:?}")]
    Timeout { command: String, after: Duration },
    /// `activity` is `None` when no current activity is known yet.
    #[error("{key} not known in {}", activity_scope(.activity))]
    NotFound {
        key: String,
        activity: Option<String>,
    },
    /// The press went out but the release did not; the hub may repeat the key.
    #[error("release of {key} failed after press: {source}")]
    PartialPress {
        key: String,
        #[source]
        source: Box<SessionError>,
    },
    #[error("failed to decode hub reply: {0}")]
    Decode(String),
}

fn activity_scope(activity: &Option<String>) -> String {
    match activity {
        Some(label) => format!("activity {label}"),
        None => "an unknown current activity".to_string(),
    }
}

/// Lifecycle of a session as seen on [`HubSession::watch_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Ready,
    Unhealthy,
    Closed,
}

/// Tunables for a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// `None` disables the keepalive task.
    pub keepalive: Option<Duration>,
    /// Applied to every [`HubSession::request`]; `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    pub span: Span,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default(), Span::none())
    }
}

impl SessionOptions {
    pub fn from_config(config: &SessionConfig, span: Span) -> Self {
        Self {
            keepalive: config.keepalive(),
            request_timeout: config.request_timeout(),
            span,
        }
    }
}

type Reply = Result<ResponseBody, SessionError>;

#[derive(Default)]
struct PendingTable {
    closed: bool,
    waiters: HashMap<String, oneshot::Sender<Reply>>,
}

#[derive(Default)]
struct ActivityCache {
    table: ActivityTable,
    current_id: Option<String>,
    current: Option<Arc<Activity>>,
}

impl ActivityCache {
    fn set_current(&mut self, id: &str) -> Option<Arc<Activity>> {
        self.current_id = Some(id.to_string());
        self.current = self.table.resolve(id);
        self.current.clone()
    }
}

struct Inner {
    address: IpAddr,
    friendly_name: String,
    outbound: Mutex<Option<mpsc::Sender<Stanza>>>,
    pending: Mutex<PendingTable>,
    cache: RwLock<ActivityCache>,
    events: Mutex<Option<mpsc::UnboundedReceiver<HubEvent>>>,
    state: watch::Sender<SessionState>,
    ids: CorrelationIds,
    request_timeout: Option<Duration>,
    cancel: CancellationToken,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    span: Span,
}

impl Inner {
    /// Rejects every pending request, releases the link and marks the
    /// session Closed.  Idempotent.
    async fn teardown(&self) {
        self.cancel.cancel();
        {
            let mut pending = self.pending.lock().await;
            pending.closed = true;
            for (_, waiter) in pending.waiters.drain() {
                let _ = waiter.send(Err(SessionError::ConnectionClosed));
            }
        }
        self.outbound.lock().await.take();
        self.state.send_replace(SessionState::Closed);
    }

    async fn forget(&self, id: &str) {
        self.pending.lock().await.waiters.remove(id);
    }

    /// Registers a waiter for `command` and puts the request on the link.
    async fn dispatch(
        &self,
        command: &str,
        body: &WireMap,
    ) -> Result<(String, oneshot::Receiver<Reply>), SessionError> {
        let id = self.ids.next();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(SessionError::ConnectionClosed);
            }
            pending.waiters.insert(id.clone(), tx);
        }

        debug!(parent: &self.span, %command, %id, "request");
        if let Err(e) = self.deliver(Stanza::request(id.as_str(), command, body)).await {
            self.forget(&id).await;
            return Err(e);
        }
        Ok((id, rx))
    }

    async fn deliver(&self, stanza: Stanza) -> Result<(), SessionError> {
        let outbound = self
            .outbound
            .lock()
            .await
            .clone()
            .ok_or(SessionError::ConnectionClosed)?;
        outbound
            .send(stanza)
            .await
            .map_err(|_| SessionError::ConnectionClosed)
    }

    /// Refreshes the activity table from a `config` reply.
    async fn apply_config(&self, reply: ResponseBody) -> Result<HubConfig, SessionError> {
        let ResponseBody::Json(json) = reply else {
            return Err(SessionError::Request {
                command: command::CONFIG.to_string(),
                reason: "expected a JSON document".to_string(),
            });
        };
        let config: HubConfig =
            serde_json::from_value(json).map_err(|e| SessionError::Decode(e.to_string()))?;

        let mut cache = self.cache.write().await;
        cache.table = ActivityTable::from_config(&config);
        if let Some(id) = cache.current_id.clone() {
            cache.set_current(&id);
        }
        debug!(
            parent: &self.span,
            activities = config.activity.len(),
            devices = config.device.len(),
            "config retrieved"
        );
        Ok(config)
    }

    /// Caches the activity named by a `getCurrentActivity` reply.
    async fn apply_current(
        &self,
        reply: ResponseBody,
    ) -> Result<Option<Arc<Activity>>, SessionError> {
        let id = reply.field("result").ok_or_else(|| SessionError::Request {
            command: command::GET_CURRENT_ACTIVITY.to_string(),
            reason: "reply has no result".to_string(),
        })?;
        Ok(self.cache.write().await.set_current(&id))
    }

    fn mark(&self, next: SessionState) {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Closed || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Cheaply cloneable handle to a live hub session.
#[derive(Clone)]
pub struct HubSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for HubSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubSession")
            .field("address", &self.inner.address)
            .field("friendly_name", &self.inner.friendly_name)
            .field("state", &self.state())
            .finish()
    }
}

impl HubSession {
    /// Pairs with and logs into the hub at `address`, then starts the session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Connection`] if pairing or login fails.
    pub async fn connect(
        address: IpAddr,
        authenticator: &dyn HubAuthenticator,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        let connection_error = |source| SessionError::Connection {
            addr: address,
            source,
        };

        debug!(parent: &options.span, %address, "pairing");
        let paired = authenticator.pair(address).await.map_err(connection_error)?;
        let friendly_name = paired.friendly_name.clone();
        debug!(parent: &options.span, %address, identity = %paired.identity, "logging in");
        let link = authenticator
            .login(address, paired)
            .await
            .map_err(connection_error)?;

        Ok(Self::from_link(address, friendly_name, link, options))
    }

    /// Starts a session over an already authenticated link.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_link(
        address: IpAddr,
        friendly_name: String,
        link: HubLink,
        options: SessionOptions,
    ) -> Self {
        let HubLink { outbound, inbound } = link;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SessionState::Connecting);

        let inner = Arc::new(Inner {
            address,
            friendly_name,
            outbound: Mutex::new(Some(outbound)),
            pending: Mutex::new(PendingTable::default()),
            cache: RwLock::new(ActivityCache::default()),
            events: Mutex::new(Some(event_rx)),
            state,
            ids: CorrelationIds::new(),
            request_timeout: options.request_timeout,
            cancel: CancellationToken::new(),
            tasks: StdMutex::new(Vec::new()),
            span: options.span.clone(),
        });

        let weak = Arc::downgrade(&inner);
        let span = options.span;
        let mut tasks = vec![
            tokio::spawn(
                receive_loop(weak.clone(), inbound, event_tx, inner.cancel.clone())
                    .instrument(span.clone()),
            ),
            tokio::spawn(warm_up(weak.clone(), inner.cancel.clone()).instrument(span.clone())),
        ];
        if let Some(period) = options.keepalive {
            tasks.push(tokio::spawn(
                keepalive(weak, period, inner.cancel.clone()).instrument(span.clone()),
            ));
        }
        inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);

        info!(parent: &span, %address, name = %inner.friendly_name, "session started");
        Self { inner }
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    /// Sends `command` and waits for the hub's reply.
    ///
    /// The session's `request_timeout`, if any, applies.
    ///
    /// # Errors
    ///
    /// [`SessionError::ConnectionClosed`] if the session closes first,
    /// [`SessionError::Timeout`] if the configured timeout elapses.
    pub async fn request(&self, command: &str, body: &WireMap) -> Result<ResponseBody, SessionError> {
        self.request_within(command, body, self.inner.request_timeout)
            .await
    }

    /// Like [`request`](Self::request) with an explicit timeout.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn request_timeout(
        &self,
        command: &str,
        body: &WireMap,
        timeout: Duration,
    ) -> Result<ResponseBody, SessionError> {
        self.request_within(command, body, Some(timeout)).await
    }

    async fn request_within(
        &self,
        command: &str,
        body: &WireMap,
        limit: Option<Duration>,
    ) -> Result<ResponseBody, SessionError> {
        let (id, rx) = self.inner.dispatch(command, body).await?;
        await_reply(&Arc::downgrade(&self.inner), command, &id, rx, limit).await
    }

    /// Sends `command` without waiting for a reply.
    ///
    /// # Errors
    ///
    /// [`SessionError::ConnectionClosed`] if the link is gone.
    pub async fn send(&self, command: &str, body: &WireMap) -> Result<(), SessionError> {
        let id = self.inner.ids.next();
        debug!(parent: &self.inner.span, %command, %id, "send");
        self.inner.deliver(Stanza::request(id, command, body)).await
    }

    // ── Hub commands ──────────────────────────────────────────────────────────

    /// Fetches the hub configuration and refreshes the activity table.
    ///
    /// # Errors
    ///
    /// [`SessionError::Decode`] if the reply is not a configuration document,
    /// plus any [`request`](Self::request) error.
    pub async fn config(&self) -> Result<HubConfig, SessionError> {
        let reply = self.request(command::CONFIG, &WireMap::new()).await?;
        self.inner.apply_config(reply).await
    }

    /// Asks the hub which activity is running and caches the answer.
    ///
    /// Returns `None` if the id is not in the cached configuration.
    ///
    /// # Errors
    ///
    /// [`SessionError::Request`] if the reply has no `result`.
    pub async fn current_activity(&self) -> Result<Option<Arc<Activity>>, SessionError> {
        self.current_activity_within(self.inner.request_timeout)
            .await
    }

    async fn current_activity_within(
        &self,
        limit: Option<Duration>,
    ) -> Result<Option<Arc<Activity>>, SessionError> {
        let reply = self
            .request_within(command::GET_CURRENT_ACTIVITY, &WireMap::new(), limit)
            .await?;
        self.inner.apply_current(reply).await
    }

    /// Starts an activity given its id or label.  Unknown labels are sent
    /// as-is, since the hub may know activities the cache does not.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn start_activity(&self, id_or_label: &str) -> Result<ResponseBody, SessionError> {
        let activity_id = match self.resolve_activity(id_or_label).await {
            Some(activity) => activity.id.clone(),
            None => id_or_label.to_string(),
        };
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let body = fields([
            ("activityId", activity_id.into()),
            ("timestamp", timestamp.to_string().into()),
        ]);
        self.request(command::START_ACTIVITY, &body).await
    }

    /// Presses and releases a button of the current activity.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotFound`] if the current activity is unknown or has
    ///   no function `key`.
    /// - [`SessionError::PartialPress`] if the release could not be sent.
    pub async fn press_key(&self, key: &str, hold: Duration) -> Result<(), SessionError> {
        let activity = self.current().await.ok_or_else(|| SessionError::NotFound {
            key: key.to_string(),
            activity: None,
        })?;
        let function = activity
            .find_function(key)
            .ok_or_else(|| SessionError::NotFound {
                key: key.to_string(),
                activity: Some(activity.label.clone()),
            })?;
        let action = function.action.as_str();

        let press = fields([
            ("status", "press".into()),
            ("timestamp", 0u64.into()),
            ("verb", "render".into()),
            ("action", action.into()),
        ]);
        self.send(command::HOLD_ACTION, &press).await?;

        tokio::time::sleep(hold).await;

        let held_ms = u64::try_from(hold.as_millis()).unwrap_or(u64::MAX);
        let release = fields([
            ("status", "release".into()),
            ("timestamp", held_ms.into()),
            ("action", action.into()),
        ]);
        self.send(command::HOLD_ACTION, &release)
            .await
            .map_err(|source| SessionError::PartialPress {
                key: key.to_string(),
                source: Box::new(source),
            })
    }

    // ── Cached state ──────────────────────────────────────────────────────────

    pub async fn resolve_activity(&self, id_or_label: &str) -> Option<Arc<Activity>> {
        self.inner.cache.read().await.table.resolve(id_or_label)
    }

    pub async fn label_for(&self, activity_id: &str) -> Option<String> {
        self.inner.cache.read().await.table.label_for(activity_id)
    }

    /// Last known current activity, without asking the hub.
    pub async fn current(&self) -> Option<Arc<Activity>> {
        self.inner.cache.read().await.current.clone()
    }

    pub fn address(&self) -> IpAddr {
        self.inner.address
    }

    pub fn friendly_name(&self) -> &str {
        &self.inner.friendly_name
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Takes the event stream.  Only the first caller receives it.
    pub async fn observe_events(&self) -> Option<mpsc::UnboundedReceiver<HubEvent>> {
        self.inner.events.lock().await.take()
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Waits until warm-up has completed.
    ///
    /// # Errors
    ///
    /// [`SessionError::ConnectionClosed`] if the session closes first.
    pub async fn ready(&self) -> Result<(), SessionError> {
        let mut state = self.inner.state.subscribe();
        let reached = state
            .wait_for(|s| matches!(s, SessionState::Ready | SessionState::Closed))
            .await
            .map_err(|_| SessionError::ConnectionClosed)?;
        match *reached {
            SessionState::Ready => Ok(()),
            _ => Err(SessionError::ConnectionClosed),
        }
    }

    /// Stops all tasks, rejects pending requests and releases the link.
    /// Safe to call repeatedly and from several handles.
    pub async fn close(&self) {
        self.inner.teardown().await;
        let tasks: Vec<_> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(parent: &self.inner.span, error = %e, "session task ended abnormally");
            }
        }
        debug!(parent: &self.inner.span, address = %self.inner.address, "session closed");
    }
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

async fn receive_loop(
    weak: Weak<Inner>,
    mut inbound: mpsc::Receiver<Stanza>,
    events: mpsc::UnboundedSender<HubEvent>,
    cancel: CancellationToken,
) {
    loop {
        let stanza = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            stanza = inbound.recv() => stanza,
        };
        let Some(inner) = weak.upgrade() else {
            return;
        };

        match stanza {
            Some(Stanza::Response { id, body }) => {
                let waiter = inner.pending.lock().await.waiters.remove(&id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(Ok(ResponseBody::parse(&body)));
                    }
                    None => debug!(%id, "dropping response with unknown id"),
                }
            }
            Some(Stanza::Event { kind, body }) if kind == STATE_DIGEST_NOTIFY => {
                if let Some(event) = state_event(&inner, &body).await {
                    let _ = events.send(event);
                }
            }
            Some(Stanza::Event { kind, .. }) => debug!(%kind, "ignoring event"),
            Some(Stanza::Request { id, .. }) => debug!(%id, "ignoring inbound request"),
            None => {
                info!(address = %inner.address, "hub link closed");
                inner.teardown().await;
                return;
            }
        }
    }
}

/// Builds a [`HubEvent`] from a state digest body and tracks the running
/// activity.
async fn state_event(inner: &Inner, body: &str) -> Option<HubEvent> {
    let digest: StateDigest = match serde_json::from_str(body) {
        Ok(digest) => digest,
        Err(e) => {
            warn!(error = %e, "undecodable state digest");
            return None;
        }
    };

    let mut cache = inner.cache.write().await;
    if digest.activity_status == ActivityStatus::Running {
        cache.set_current(&digest.activity_id);
    }
    let mut event = HubEvent::from_digest(&digest, &cache.table);
    event.friendly_name = Some(inner.friendly_name.clone());
    debug!(
        activity = %event.activity_id,
        status = ?event.activity_status,
        "state digest"
    );
    Some(event)
}

/// Waits for the reply to request `id`.  On timeout the waiter is forgotten
/// if the session is still alive.
async fn await_reply(
    weak: &Weak<Inner>,
    command: &str,
    id: &str,
    rx: oneshot::Receiver<Reply>,
    limit: Option<Duration>,
) -> Reply {
    let reply = match limit {
        Some(after) => match tokio::time::timeout(after, rx).await {
            Ok(reply) => reply,
            Err(_) => {
                if let Some(inner) = weak.upgrade() {
                    inner.forget(id).await;
                }
                return Err(SessionError::Timeout {
                    command: command.to_string(),
                    after,
                });
            }
        },
        None => rx.await,
    };
    reply.map_err(|_| SessionError::ConnectionClosed)?
}

/// Sends an empty-bodied `command` on behalf of a background task.  The
/// session is held only while sending, so dropping every handle while the
/// reply is outstanding closes it.
async fn detached_request(weak: &Weak<Inner>, command: &str) -> Reply {
    let inner = weak.upgrade().ok_or(SessionError::ConnectionClosed)?;
    let limit = inner.request_timeout;
    let (id, rx) = inner.dispatch(command, &WireMap::new()).await?;
    drop(inner);
    await_reply(weak, command, &id, rx, limit).await
}

async fn warm_up_steps(weak: &Weak<Inner>) -> Result<Option<Arc<Activity>>, SessionError> {
    let reply = detached_request(weak, command::CONFIG).await?;
    let inner = weak.upgrade().ok_or(SessionError::ConnectionClosed)?;
    inner.apply_config(reply).await?;
    drop(inner);

    let reply = detached_request(weak, command::GET_CURRENT_ACTIVITY).await?;
    let inner = weak.upgrade().ok_or(SessionError::ConnectionClosed)?;
    inner.apply_current(reply).await
}

async fn warm_up(weak: Weak<Inner>, cancel: CancellationToken) {
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        outcome = warm_up_steps(&weak) => outcome,
    };
    let Some(inner) = weak.upgrade() else {
        return;
    };

    match outcome {
        Ok(current) => {
            info!(
                address = %inner.address,
                current = current.as_ref().map(|a| a.label.as_str()).unwrap_or("-"),
                "session ready"
            );
            inner.mark(SessionState::Ready);
        }
        Err(SessionError::ConnectionClosed) => {}
        Err(e) => {
            warn!(address = %inner.address, error = %e, "warm-up failed");
            inner.mark(SessionState::Unhealthy);
        }
    }
}

async fn keepalive(weak: Weak<Inner>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let session = HubSession { inner };

        match session.current_activity_within(Some(period)).await {
            Ok(_) => {
                debug!("keepalive ok");
                if session.state() == SessionState::Unhealthy {
                    info!(address = %session.inner.address, "hub responsive again");
                    session.inner.mark(SessionState::Ready);
                }
            }
            Err(SessionError::ConnectionClosed) => return,
            Err(e) => {
                warn!(address = %session.inner.address, error = %e, "keepalive failed");
                session.inner.mark(SessionState::Unhealthy);
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
