use crate::envelope::{self, Envelope, ErrorPayload, HelloPayload, ReadyPayload};
use crate::session::{
    CloseReason, Connection, HandshakeMode, HandshakeOutcome, Result, SessionClient, SessionError,
    lock,
};
use crate::transport::{Transport, TransportEvent};
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

impl SessionClient {
    /// Opens a transport and runs the handshake for `mode`. The caller bounds
    /// the whole exchange with the connect timeout.
    pub(crate) async fn handshake(
        self: &Arc<Self>,
        url: &str,
        generation: u64,
        mode: HandshakeMode,
    ) -> Result<(HandshakeOutcome, mpsc::Receiver<TransportEvent>)> {
        let (transport, mut rx) = self.transport_factory.create_transport(url).await?;
        let (closed_tx, mut closed_rx) = watch::channel(None);

        let installed = self.install(Connection {
            generation,
            transport: transport.clone(),
            established: false,
            closed_tx,
            tasks: Vec::new(),
        });
        if !installed {
            transport.close(crate::session::close_code::NORMAL_CLOSURE, "superseded").await;
            return Err(SessionError::NotConnected);
        }

        let hello = self.wait_for_hello(&mut rx, &mut closed_rx).await?;
        if hello.heartbeat_interval == 0 {
            return Err(SessionError::UnexpectedEvent(
                "hello with zero heartbeat interval".to_string(),
            ));
        }
        let interval = Duration::from_millis(hello.heartbeat_interval);
        debug!(target: "Session", "<-- hello (heartbeat every {interval:?})");

        lock(&self.state).heartbeat_interval = Some(interval);
        self.heartbeat_ack_pending.store(false, Ordering::SeqCst);
        let heartbeat = tokio::spawn(self.clone().heartbeat_loop(
            generation,
            interval,
            transport.clone(),
        ));
        self.attach_task(generation, heartbeat);

        let opening = match &mode {
            HandshakeMode::Identify(payload) => Envelope::from_payload(envelope::IDENTIFY, payload)?,
            HandshakeMode::Resume(payload) => Envelope::from_payload(envelope::RESUME, payload)?,
        };
        debug!(target: "Session", "--> {}", opening.event);
        transport.send_text(&opening.encode()?).await?;

        let outcome = self
            .wait_for_session(generation, &mode, &mut rx, &mut closed_rx)
            .await?;
        Ok((outcome, rx))
    }

    async fn wait_for_hello(
        &self,
        rx: &mut mpsc::Receiver<TransportEvent>,
        closed_rx: &mut watch::Receiver<Option<CloseReason>>,
    ) -> Result<HelloPayload> {
        loop {
            let env = next_envelope(rx, closed_rx).await?;
            match env.event.as_str() {
                envelope::HELLO => return Ok(env.payload()?),
                envelope::ERROR => return Err(rejection(&env)),
                other => debug!(target: "Session", "Ignoring {other} before hello"),
            }
        }
    }

    async fn wait_for_session(
        &self,
        generation: u64,
        mode: &HandshakeMode,
        rx: &mut mpsc::Receiver<TransportEvent>,
        closed_rx: &mut watch::Receiver<Option<CloseReason>>,
    ) -> Result<HandshakeOutcome> {
        let mut buffered = Vec::new();
        loop {
            let env = next_envelope(rx, closed_rx).await?;
            if self.handle_keepalive_frame(generation, &env).await {
                continue;
            }
            match (env.event.as_str(), mode) {
                (envelope::READY, HandshakeMode::Identify(_)) => {
                    let payload: ReadyPayload = env.payload()?;
                    info!(target: "Session", "<-- ready (session {})", payload.session_id);
                    return Ok(HandshakeOutcome::Ready {
                        payload,
                        seq: env.seq,
                    });
                }
                (envelope::RESUMED, HandshakeMode::Resume(_)) => {
                    info!(target: "Session", "<-- resumed ({} early dispatches)", buffered.len());
                    return Ok(HandshakeOutcome::Resumed { buffered });
                }
                (envelope::ERROR, _) => return Err(rejection(&env)),
                (_, HandshakeMode::Resume(_)) if !env.is_system() => buffered.push(env),
                (other, _) => {
                    warn!(target: "Session", "Unexpected {other} during handshake");
                    return Err(SessionError::UnexpectedEvent(other.to_string()));
                }
            }
        }
    }

    /// Heartbeat bookkeeping shared by the handshake and the reader.
    /// Returns true if `env` was a heartbeat frame.
    pub(crate) async fn handle_keepalive_frame(&self, generation: u64, env: &Envelope) -> bool {
        match env.event.as_str() {
            envelope::HEARTBEAT_ACK => {
                self.heartbeat_ack_pending.store(false, Ordering::SeqCst);
                true
            }
            envelope::HEARTBEAT => {
                debug!(target: "Session/Heartbeat", "Server requested a heartbeat");
                if let Some(transport) = self.transport_for(generation) {
                    self.heartbeat_ack_pending.store(true, Ordering::SeqCst);
                    self.send_heartbeat(transport.as_ref()).await;
                }
                true
            }
            _ => false,
        }
    }

    pub(crate) async fn send_heartbeat(&self, transport: &dyn Transport) {
        let frame = Envelope::new(envelope::HEARTBEAT, serde_json::json!({}));
        match frame.encode() {
            Ok(text) => {
                if let Err(e) = transport.send_text(&text).await {
                    debug!(target: "Session/Heartbeat", "Heartbeat send failed: {e}");
                }
            }
            Err(e) => debug!(target: "Session/Heartbeat", "Heartbeat encode failed: {e}"),
        }
    }
}

async fn next_envelope(
    rx: &mut mpsc::Receiver<TransportEvent>,
    closed_rx: &mut watch::Receiver<Option<CloseReason>>,
) -> Result<Envelope> {
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(TransportEvent::TextReceived(text)) => return Ok(Envelope::decode(&text)?),
                Some(TransportEvent::Connected) => continue,
                Some(TransportEvent::Closed { code, reason }) => {
                    debug!(target: "Session", "Closed during handshake ({code:?}): {reason}");
                    return Err(SessionError::Rejected(CloseReason::from_code(code)));
                }
                None => return Err(SessionError::Rejected(CloseReason::Abnormal(None))),
            },
            _ = closed_rx.changed() => {
                let reason = *closed_rx.borrow();
                return Err(match reason {
                    Some(CloseReason::HeartbeatTimeout) => SessionError::HeartbeatTimeout,
                    Some(reason) => SessionError::Rejected(reason),
                    None => SessionError::NotConnected,
                });
            }
        }
    }
}

fn rejection(env: &Envelope) -> SessionError {
    match env.payload::<ErrorPayload>() {
        Ok(payload) => {
            warn!(target: "Session", "Handshake rejected ({}): {}", payload.code, payload.message);
            SessionError::Rejected(CloseReason::from_code(Some(payload.code)))
        }
        Err(e) => SessionError::Protocol(e),
    }
}
