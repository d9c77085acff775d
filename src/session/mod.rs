//! Session protocol client.
//!
//! One [`SessionClient`] owns one logical session (server-assigned id plus
//! the dispatch sequence) and at most one physical connection at a time.
//! Every physical connection gets a fresh *generation*; background tasks
//! carry the generation they were started for and stand down as soon as it
//! is no longer current, so a discarded connection can never act on its
//! replacement.
//!
//! The client never retries on its own. Callers observe failures through
//! returned [`SessionError`]s and [`SessionEvent::Disconnected`], and pick
//! `connect` or `resume` from [`CloseReason::recovery`].

pub mod close_code;
pub mod error;
pub mod sequence;
pub mod throttle;


pub use close_code::{CloseReason, Recovery};
pub use error::{Result, SessionError};
pub use sequence::SequenceTracker;
pub use throttle::Throttle;

use crate::config::SessionConfig;
use crate::envelope::{self, Envelope, ErrorPayload, IdentifyPayload, ReadyPayload, ResumePayload};
use crate::transport::{Transport, TransportEvent, TransportFactory};
use crate::types::events::{DisconnectInfo, Dispatch, EventBus, SessionEvent};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Which service a session talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    /// Per-community connection; dispatches are sequenced and resumable.
    Server,
    /// Account-wide connection; dispatches carry no usable sequence.
    Central,
}

impl ConnectionKind {
    pub fn is_sequenced(&self) -> bool {
        matches!(self, Self::Server)
    }
}

/// What `identify` sends: the token plus optional last-known context.
#[derive(Debug, Clone, Default)]
pub struct Credential {
    pub token: String,
    pub context: serde_json::Map<String, Value>,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            context: serde_json::Map::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

pub(crate) enum HandshakeMode {
    Identify(IdentifyPayload),
    Resume(ResumePayload),
}

pub(crate) enum HandshakeOutcome {
    Ready {
        payload: ReadyPayload,
        seq: Option<u64>,
    },
    /// Dispatches that raced ahead of `resumed` are replayed in order
    /// once the reader starts.
    Resumed { buffered: Vec<Envelope> },
}

pub(crate) struct Connection {
    pub(crate) generation: u64,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) established: bool,
    pub(crate) closed_tx: watch::Sender<Option<CloseReason>>,
    pub(crate) tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub(crate) session_id: Option<String>,
    pub(crate) sequence: SequenceTracker,
    pub(crate) heartbeat_interval: Option<Duration>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SessionClient {
    pub(crate) kind: ConnectionKind,
    pub(crate) config: SessionConfig,
    pub(crate) transport_factory: Arc<dyn TransportFactory>,
    pub(crate) connection: Mutex<Option<Connection>>,
    pub(crate) state: Mutex<SessionState>,
    pub(crate) heartbeat_ack_pending: AtomicBool,
    pub(crate) generation: AtomicU64,
    pub(crate) is_connecting: AtomicBool,
    pub(crate) event_bus: EventBus,
    pub(crate) throttle: Throttle,
}

impl SessionClient {
    pub fn new(
        kind: ConnectionKind,
        config: SessionConfig,
        transport_factory: Arc<dyn TransportFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            event_bus: EventBus::new(config.event_channel_capacity),
            throttle: Throttle::new(config.throttle_window),
            config,
            transport_factory,
            connection: Mutex::new(None),
            state: Mutex::new(SessionState::default()),
            heartbeat_ack_pending: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            is_connecting: AtomicBool::new(false),
        })
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    /// Independent stream of session events. Each subscriber sees every event.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_bus.subscribe()
    }

    pub fn session_id(&self) -> Option<String> {
        lock(&self.state).session_id.clone()
    }

    pub fn last_seq(&self) -> u64 {
        lock(&self.state).sequence.last_seq()
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        lock(&self.state).heartbeat_interval
    }

    pub fn heartbeat_ack_pending(&self) -> bool {
        self.heartbeat_ack_pending.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.connection)
            .as_ref()
            .is_some_and(|conn| conn.established)
    }

    /// Forgets the session identity so the next attempt must be a fresh connect.
    pub fn clear_session(&self) {
        let mut state = lock(&self.state);
        state.session_id = None;
        state.sequence = SequenceTracker::default();
    }

    /// Opens a fresh session: `hello` → `identify` → `ready`.
    pub async fn connect(
        self: &Arc<Self>,
        url: &str,
        credential: &Credential,
    ) -> Result<Arc<ReadyPayload>> {
        if self.is_connecting.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyConnecting);
        }
        let _guard = scopeguard::guard((), |_| {
            self.is_connecting.store(false, Ordering::SeqCst);
        });

        info!(target: "Session", "Connecting {:?} session to {url}", self.kind);
        let mode = HandshakeMode::Identify(IdentifyPayload {
            token: credential.token.clone(),
            context: credential.context.clone(),
        });
        let (generation, outcome, rx) = self.establish(url, mode).await?;

        let HandshakeOutcome::Ready { payload, seq } = outcome else {
            return Err(SessionError::UnexpectedEvent(envelope::RESUMED.to_string()));
        };
        {
            let mut state = lock(&self.state);
            state.session_id = Some(payload.session_id.clone());
            state.sequence = SequenceTracker::new(seq.unwrap_or(0));
        }
        let payload = Arc::new(payload);
        info!(target: "Session", "Session {} ready", payload.session_id);

        self.event_bus.dispatch(SessionEvent::Ready(payload.clone()));
        self.start_reader(generation, rx, Vec::new());
        Ok(payload)
    }

    /// Re-attaches to the current session: `hello` → `resume` → `resumed`.
    ///
    /// A refusal surfaces as [`SessionError::ResumeFailed`]; the caller must
    /// follow up with `connect`. Refusals that prove the session is gone
    /// (expired, invalid sequence, bad credential) also discard it.
    pub async fn resume(
        self: &Arc<Self>,
        url: &str,
        credential: &Credential,
        last_seq: u64,
    ) -> Result<()> {
        if self.is_connecting.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyConnecting);
        }
        let _guard = scopeguard::guard((), |_| {
            self.is_connecting.store(false, Ordering::SeqCst);
        });

        let session_id = self.session_id().ok_or(SessionError::NoSession)?;
        info!(target: "Session", "Resuming session {session_id} from seq {last_seq}");

        let mode = HandshakeMode::Resume(ResumePayload {
            session_id: session_id.clone(),
            last_seq,
            token: credential.token.clone(),
        });
        let (generation, outcome, rx) = match self.establish(url, mode).await {
            Ok(established) => established,
            Err(SessionError::Rejected(reason)) => {
                warn!(target: "Session", "Resume of {session_id} refused: {reason}");
                if reason.invalidates_session() {
                    self.clear_session();
                }
                return Err(SessionError::ResumeFailed(reason));
            }
            Err(e) => return Err(e),
        };

        let HandshakeOutcome::Resumed { buffered } = outcome else {
            return Err(SessionError::UnexpectedEvent(envelope::READY.to_string()));
        };
        lock(&self.state).sequence = SequenceTracker::new(last_seq);
        info!(target: "Session", "Session {session_id} resumed");

        self.event_bus.dispatch(SessionEvent::Resumed {
            session_id,
            last_seq,
        });
        self.start_reader(generation, rx, buffered);
        Ok(())
    }

    /// Fire-and-forget send of an application event.
    pub async fn send(&self, event: &str, data: Value) -> Result<()> {
        let transport = self
            .established_transport()
            .ok_or(SessionError::NotConnected)?;
        let text = Envelope::new(event, data).encode()?;
        debug!(target: "Session", "--> {event}");
        transport.send_text(&text).await?;
        Ok(())
    }

    /// Sends at most once per `throttle_window` for `key`. Best effort:
    /// returns whether a frame actually went out.
    pub async fn send_throttled(&self, key: &str, event: &str, data: Value) -> bool {
        if !self.is_connected() || !self.throttle.try_acquire(key) {
            return false;
        }
        match self.send(event, data).await {
            Ok(()) => true,
            Err(e) => {
                debug!(target: "Session", "Throttled send of {event} dropped: {e}");
                false
            }
        }
    }

    /// Fires one heartbeat immediately, e.g. when the app returns to the
    /// foreground after its timers were throttled. The periodic timer is not reset.
    pub async fn notify_foreground(&self) {
        let Some(transport) = self.established_transport() else {
            return;
        };
        debug!(target: "Session/Heartbeat", "Foregrounded, sending out-of-band heartbeat");
        self.heartbeat_ack_pending.store(true, Ordering::SeqCst);
        self.send_heartbeat(transport.as_ref()).await;
    }

    /// Tears down the current connection. Background tasks are stopped before
    /// this returns, and no further events are emitted for the old connection.
    /// The session identity is kept; see [`Self::clear_session`].
    pub async fn disconnect(&self) {
        info!(target: "Session", "Disconnecting {:?} session intentionally.", self.kind);
        self.teardown().await;
    }

    async fn teardown(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let detached = lock(&self.connection).take();
        self.heartbeat_ack_pending.store(false, Ordering::SeqCst);
        self.throttle.clear();
        if let Some(mut conn) = detached {
            conn.abort_tasks();
            drop(conn.closed_tx);
            conn.transport
                .close(close_code::NORMAL_CLOSURE, "client disconnect")
                .await;
        }
    }

    async fn establish(
        self: &Arc<Self>,
        url: &str,
        mode: HandshakeMode,
    ) -> Result<(u64, HandshakeOutcome, mpsc::Receiver<TransportEvent>)> {
        // Any previous connection is discarded, never reused.
        self.teardown().await;
        let generation = self.generation.load(Ordering::SeqCst);

        let timeout = self.config.connect_timeout;
        let attempt = tokio::time::timeout(timeout, self.handshake(url, generation, mode)).await;
        match attempt {
            Ok(Ok((outcome, rx))) => {
                if !self.mark_established(generation) {
                    return Err(SessionError::NotConnected);
                }
                Ok((generation, outcome, rx))
            }
            Ok(Err(e)) => {
                debug!(target: "Session", "Handshake failed: {e}");
                self.abandon(generation).await;
                Err(e)
            }
            Err(_) => {
                warn!(target: "Session", "Handshake timed out after {timeout:?}");
                self.abandon(generation).await;
                Err(SessionError::ConnectTimeout(timeout))
            }
        }
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    pub(crate) fn install(&self, conn: Connection) -> bool {
        if !self.is_current(conn.generation) {
            return false;
        }
        *lock(&self.connection) = Some(conn);
        true
    }

    pub(crate) fn attach_task(&self, generation: u64, task: JoinHandle<()>) {
        let mut guard = lock(&self.connection);
        match guard.as_mut() {
            Some(conn) if conn.generation == generation => conn.tasks.push(task),
            _ => task.abort(),
        }
    }

    fn mark_established(&self, generation: u64) -> bool {
        let mut guard = lock(&self.connection);
        match guard.as_mut() {
            Some(conn) if conn.generation == generation => {
                conn.established = true;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn established_transport(&self) -> Option<Arc<dyn Transport>> {
        lock(&self.connection)
            .as_ref()
            .filter(|conn| conn.established)
            .map(|conn| conn.transport.clone())
    }

    pub(crate) fn transport_for(&self, generation: u64) -> Option<Arc<dyn Transport>> {
        lock(&self.connection)
            .as_ref()
            .filter(|conn| conn.generation == generation)
            .map(|conn| conn.transport.clone())
    }

    fn detach(&self, generation: u64) -> Option<Connection> {
        let mut guard = lock(&self.connection);
        if guard.as_ref().map(|conn| conn.generation) != Some(generation) {
            return None;
        }
        guard.take()
    }

    async fn abandon(&self, generation: u64) {
        if let Some(mut conn) = self.detach(generation) {
            conn.abort_tasks();
            conn.transport
                .close(close_code::NORMAL_CLOSURE, "handshake abandoned")
                .await;
        }
    }

    /// Drops the connection of `generation` for `reason`: stops its tasks,
    /// closes the transport with the matching code and, if the connection had
    /// been established, tells subscribers.
    pub(crate) fn fail_connection(&self, generation: u64, reason: CloseReason, message: &str) {
        let Some(mut conn) = self.detach(generation) else {
            return;
        };
        if reason.invalidates_session() {
            self.clear_session();
        }
        self.heartbeat_ack_pending.store(false, Ordering::SeqCst);
        conn.closed_tx.send_replace(Some(reason));

        if conn.established {
            info!(target: "Session", "Connection lost: {reason} {message}");
            self.event_bus
                .dispatch(SessionEvent::Disconnected(Arc::new(DisconnectInfo {
                    code: reason.code(),
                    reason,
                    message: message.to_string(),
                })));
        }

        let transport = conn.transport.clone();
        let code = reason.code().unwrap_or(close_code::NORMAL_CLOSURE);
        let message = message.to_string();
        tokio::spawn(async move { transport.close(code, &message).await });
        // Last: this may cancel the calling task at its next await point.
        conn.abort_tasks();
    }

    fn start_reader(
        self: &Arc<Self>,
        generation: u64,
        rx: mpsc::Receiver<TransportEvent>,
        buffered: Vec<Envelope>,
    ) {
        let task = tokio::spawn(self.clone().read_loop(generation, rx, buffered));
        self.attach_task(generation, task);
    }

    async fn read_loop(
        self: Arc<Self>,
        generation: u64,
        mut rx: mpsc::Receiver<TransportEvent>,
        buffered: Vec<Envelope>,
    ) {
        for env in buffered {
            if let Err((reason, message)) = self.apply_envelope(generation, env).await {
                self.fail_connection(generation, reason, &message);
                return;
            }
        }

        loop {
            let event = rx.recv().await;
            if !self.is_current(generation) {
                return;
            }
            match event {
                Some(TransportEvent::TextReceived(text)) => {
                    let env = match Envelope::decode(&text) {
                        Ok(env) => env,
                        Err(e) => {
                            error!(target: "Session", "Dropping undecodable frame: {e}");
                            continue;
                        }
                    };
                    if let Err((reason, message)) = self.apply_envelope(generation, env).await {
                        self.fail_connection(generation, reason, &message);
                        return;
                    }
                }
                Some(TransportEvent::Connected) => {}
                Some(TransportEvent::Closed { code, reason }) => {
                    self.fail_connection(generation, CloseReason::from_code(code), &reason);
                    return;
                }
                None => {
                    self.fail_connection(generation, CloseReason::Abnormal(None), "transport gone");
                    return;
                }
            }
        }
    }

    /// Applies one received envelope on an established connection.
    async fn apply_envelope(
        &self,
        generation: u64,
        env: Envelope,
    ) -> std::result::Result<(), (CloseReason, String)> {
        if self.handle_keepalive_frame(generation, &env).await {
            return Ok(());
        }

        if env.event == envelope::ERROR {
            let payload: ErrorPayload = env.payload().map_err(|e| {
                (CloseReason::Abnormal(None), format!("bad error payload: {e}"))
            })?;
            let reason = CloseReason::from_code(Some(payload.code));
            error!(target: "Session", "Server error {}: {}", payload.code, payload.message);
            return Err((reason, payload.message));
        }

        if env.is_system() {
            debug!(target: "Session", "Ignoring {} on established connection", env.event);
            return Ok(());
        }

        let seq = if self.kind.is_sequenced() {
            let advanced = lock(&self.state).sequence.advance(env.seq);
            match advanced {
                Ok(seq) => Some(seq),
                Err(e) => {
                    error!(target: "Session", "{e}; replay integrity lost");
                    return Err((CloseReason::InvalidSequence, e.to_string()));
                }
            }
        } else {
            None
        };

        debug!(target: "Session", "<-- {} (seq {:?})", env.event, seq);
        self.event_bus.dispatch(SessionEvent::Dispatch(Arc::new(Dispatch {
            event: env.event,
            data: env.data,
            seq,
        })));
        Ok(())
    }
}
