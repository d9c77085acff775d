//! Call manager: owns the single call, drives the media engine and speaks
//! `call.*` signaling.

use super::error::CallError;
use super::media::{MediaEngine, MediaResources, RemoteProducer, TransportDirection, TransportParams};
use super::signaling::{self, CallSignal, IncomingCall};
use super::state::{CallInfo, CallState, CallTransition};
use crate::session::SessionClient;
use crate::types::call::{CallId, EndReason, MediaKind, MediaState, Peer};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};

/// Configuration for the call manager.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallManagerConfig {
    /// Open the microphone as soon as the send transport exists.
    pub auto_acquire_audio: bool,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            auto_acquire_audio: true,
        }
    }
}

/// Where outbound `call.*` events go. Implemented by [`SessionClient`].
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn send_signal(&self, event: &str, data: Value) -> Result<(), CallError>;
}

#[async_trait]
impl SignalSink for SessionClient {
    async fn send_signal(&self, event: &str, data: Value) -> Result<(), CallError> {
        Ok(self.send(event, data).await?)
    }
}

#[derive(Debug, Clone)]
pub enum CallEvent {
    /// The call changed state, flags or peer media.
    Updated(CallInfo),
    /// The call slot is empty again.
    Idle,
    SelfMediaChanged(MediaState),
}

/// One engine step taken by a media toggle, kept so it can be undone.
#[derive(Debug)]
enum AppliedStep {
    ProducerPaused(String),
    ProducerResumed(String),
    ConsumerPaused(String),
    ConsumerResumed(String),
    Produced(MediaKind),
}

struct Call {
    info: CallInfo,
    media: MediaResources,
}

#[derive(Default)]
struct Inner {
    call: Option<Call>,
    self_media: MediaState,
}

/// Manages the one client-wide call.
pub struct CallManager {
    config: CallManagerConfig,
    sink: Arc<dyn SignalSink>,
    engine: Arc<dyn MediaEngine>,
    inner: Mutex<Inner>,
    events: broadcast::Sender<CallEvent>,
}

impl CallManager {
    pub fn new(
        config: CallManagerConfig,
        sink: Arc<dyn SignalSink>,
        engine: Arc<dyn MediaEngine>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            config,
            sink,
            engine,
            inner: Mutex::new(Inner::default()),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub async fn current_call(&self) -> Option<CallInfo> {
        self.inner.lock().await.call.as_ref().map(|c| c.info.clone())
    }

    pub async fn state(&self) -> CallState {
        self.inner
            .lock()
            .await
            .call
            .as_ref()
            .map_or(CallState::Idle, |c| c.info.state)
    }

    pub async fn self_media(&self) -> MediaState {
        self.inner.lock().await.self_media
    }

    /// True while the current call holds any engine resource.
    pub async fn holds_media(&self) -> bool {
        self.inner
            .lock()
            .await
            .call
            .as_ref()
            .is_some_and(|c| !c.media.is_empty())
    }

    /// Places an outgoing call.
    pub async fn start_call(
        &self,
        peer: Peer,
        media_types: Vec<MediaKind>,
    ) -> Result<CallId, CallError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if let Some(current) = inner.call.as_ref().filter(|c| !c.info.state.accepts_new_call()) {
            return Err(CallError::Busy(current.info.call_id.clone()));
        }

        let info = CallInfo::new_outgoing(CallId::generate(), peer, media_types);
        self.sink
            .send_signal(
                signaling::START,
                json!({
                    "call_id": info.call_id,
                    "peer_id": info.peer.user_id,
                    "media_types": info.media_types,
                }),
            )
            .await?;

        info!(target: "Calls", "Calling {} (call {})", info.peer.user_id, info.call_id);
        let call_id = info.call_id.clone();
        self.install(inner, info).await;
        Ok(call_id)
    }

    pub async fn answer(&self) -> Result<(), CallError> {
        let mut guard = self.inner.lock().await;
        let call = guard.call.as_mut().ok_or(CallError::NoCall)?;
        if call.info.answered_elsewhere {
            return Err(CallError::InvalidState("call was answered on another device"));
        }
        if !matches!(call.info.state, CallState::IncomingRinging { .. }) {
            return Err(CallError::InvalidState("only a ringing incoming call can be answered"));
        }

        self.sink
            .send_signal(signaling::ANSWER, json!({ "call_id": call.info.call_id }))
            .await?;
        call.info.apply_transition(CallTransition::Answer)?;
        info!(target: "Calls", "Answered call {}", call.info.call_id);
        self.emit_updated(&call.info);
        Ok(())
    }

    pub async fn reject(&self) -> Result<(), CallError> {
        let mut guard = self.inner.lock().await;
        let call = guard.call.as_mut().ok_or(CallError::NoCall)?;
        if !matches!(call.info.state, CallState::IncomingRinging { .. }) {
            return Err(CallError::InvalidState("only a ringing incoming call can be rejected"));
        }

        self.sink
            .send_signal(signaling::REJECT, json!({ "call_id": call.info.call_id }))
            .await?;
        self.finish(call, EndReason::Rejected).await
    }

    /// Hangs up a ringing, connecting or active call.
    pub async fn end_call(&self) -> Result<(), CallError> {
        let mut guard = self.inner.lock().await;
        let call = guard.call.as_mut().ok_or(CallError::NoCall)?;
        if !call.info.state.is_live() {
            return Err(CallError::InvalidState("call is not in progress"));
        }

        self.sink
            .send_signal(signaling::END, json!({ "call_id": call.info.call_id }))
            .await?;
        self.finish(call, EndReason::Normal).await
    }

    /// Moves a call answered on another of our devices to this one.
    ///
    /// Allowed only while the call is live, flagged answered-elsewhere, and
    /// this device holds no media for it.
    pub async fn transfer(&self) -> Result<(), CallError> {
        let mut guard = self.inner.lock().await;
        let call = guard.call.as_mut().ok_or(CallError::NoCall)?;
        if !call.info.answered_elsewhere || !call.info.state.is_live() {
            return Err(CallError::InvalidState(
                "only a live call answered on another device can be transferred",
            ));
        }
        if !call.media.is_empty() {
            return Err(CallError::InvalidState("call media is still held locally"));
        }

        self.sink
            .send_signal(signaling::TRANSFER, json!({ "call_id": call.info.call_id }))
            .await?;
        call.info.apply_transition(CallTransition::TransferIn)?;
        call.info.answered_elsewhere = false;
        info!(target: "Calls", "Transferred call {} to this device", call.info.call_id);
        self.emit_updated(&call.info);
        Ok(())
    }

    /// Dismisses an ended call, leaving the slot empty.
    pub async fn acknowledge_ended(&self) -> Result<(), CallError> {
        let mut guard = self.inner.lock().await;
        let call = guard.call.as_mut().ok_or(CallError::NoCall)?;
        call.info.apply_transition(CallTransition::Acknowledge)?;
        call.media.release_all(self.engine.as_ref()).await;
        guard.call = None;
        let _ = self.events.send(CallEvent::Idle);
        Ok(())
    }

    /// Drops the call and all of its media without signaling. Idempotent.
    pub async fn cleanup(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(mut call) = guard.call.take() {
            debug!(target: "Calls", "Cleaning up call {}", call.info.call_id);
            call.media.release_all(self.engine.as_ref()).await;
            let _ = self.events.send(CallEvent::Idle);
        }
    }

    /// Flips mute. Deafen is never changed by this. Returns the new mute state.
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        let mut guard = self.inner.lock().await;
        let mut next = guard.self_media;
        next.muted = !next.muted;
        self.apply_self_media(&mut guard, next).await?;
        Ok(next.muted)
    }

    /// Deafening also mutes; undeafening leaves mute as it is.
    pub async fn set_deafened(&self, deafened: bool) -> Result<(), CallError> {
        let mut guard = self.inner.lock().await;
        let mut next = guard.self_media;
        next.deafened = deafened;
        if deafened {
            next.muted = true;
        }
        self.apply_self_media(&mut guard, next).await
    }

    pub async fn set_video(&self, video: bool) -> Result<(), CallError> {
        let mut guard = self.inner.lock().await;
        let mut next = guard.self_media;
        next.video = video;
        self.apply_self_media(&mut guard, next).await
    }

    pub async fn set_screen_share(&self, screen_share: bool) -> Result<(), CallError> {
        let mut guard = self.inner.lock().await;
        let mut next = guard.self_media;
        next.screen_share = screen_share;
        self.apply_self_media(&mut guard, next).await
    }

    /// Applies one inbound call event.
    pub async fn handle_signal(&self, signal: CallSignal) -> Result<(), CallError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        if let CallSignal::Incoming(incoming) = signal {
            return self.on_incoming(inner, incoming).await;
        }

        let Some(call) = inner
            .call
            .as_mut()
            .filter(|c| &c.info.call_id == signal.call_id())
        else {
            debug!(target: "Calls", "Ignoring {signal:?} for a call we do not hold");
            return Ok(());
        };
        if call.info.state.is_ended() {
            debug!(target: "Calls", "Ignoring {signal:?} for ended call");
            return Ok(());
        }

        match signal {
            CallSignal::Incoming(_) => Ok(()),
            CallSignal::Accepted(_) => {
                if matches!(call.info.state, CallState::OutgoingRinging { .. }) {
                    call.info.apply_transition(CallTransition::RemoteAccepted)?;
                    info!(target: "Calls", "Call {} accepted by peer", call.info.call_id);
                    self.emit_updated(&call.info);
                }
                Ok(())
            }
            CallSignal::AnsweredElsewhere(_) => {
                info!(target: "Calls", "Call {} answered on another device", call.info.call_id);
                call.info.answered_elsewhere = true;
                call.media.release_all(self.engine.as_ref()).await;
                self.emit_updated(&call.info);
                Ok(())
            }
            CallSignal::Ended { reason, .. } => self.finish(call, reason).await,
            CallSignal::Transferred(_) => self.finish(call, EndReason::Transferred).await,
            CallSignal::PeerMedia { state, .. } => {
                call.info.peer_media = state;
                self.emit_updated(&call.info);
                Ok(())
            }
            CallSignal::ProducerClosed { producer_id, .. } => {
                if let Some(consumer_id) = call.media.consumers.remove(&producer_id) {
                    self.engine.close_consumer(&consumer_id).await?;
                }
                Ok(())
            }
            media_signal => {
                if call.info.answered_elsewhere {
                    debug!(target: "Calls", "Call answered elsewhere, not acquiring media");
                    return Ok(());
                }
                let self_media = inner.self_media;
                self.on_media_signal(call, self_media, media_signal).await
            }
        }
    }

    async fn on_incoming(&self, inner: &mut Inner, incoming: IncomingCall) -> Result<(), CallError> {
        if let Some(current) = inner.call.as_ref().filter(|c| !c.info.state.accepts_new_call()) {
            warn!(
                target: "Calls",
                "Ignoring incoming call {} while call {} is {}",
                incoming.call_id,
                current.info.call_id,
                current.info.state.name()
            );
            return Ok(());
        }
        info!(target: "Calls", "Incoming call {} from {}", incoming.call_id, incoming.peer.user_id);
        let info = CallInfo::new_incoming(incoming.call_id, incoming.peer, incoming.media_types);
        self.install(inner, info).await;
        Ok(())
    }

    async fn on_media_signal(
        &self,
        call: &mut Call,
        self_media: MediaState,
        signal: CallSignal,
    ) -> Result<(), CallError> {
        let engine = self.engine.as_ref();
        match signal {
            CallSignal::RouterCapabilities {
                rtp_capabilities, ..
            } => {
                let device = engine.load_device(&rtp_capabilities).await?;
                call.media.device = Some(device);
                debug!(target: "Calls", "Media device loaded for call {}", call.info.call_id);
            }
            CallSignal::TransportCreated { transport, .. } => {
                self.open_transport(call, self_media, transport).await?;
            }
            CallSignal::NewProducer { producer, .. } => {
                self.consume(call, self_media, producer).await?;
            }
            other => debug!(target: "Calls", "Unhandled media signal {other:?}"),
        }
        Ok(())
    }

    async fn open_transport(
        &self,
        call: &mut Call,
        self_media: MediaState,
        transport: TransportParams,
    ) -> Result<(), CallError> {
        if call.media.device.is_none() {
            return Err(super::media::MediaError::DeviceNotLoaded.into());
        }
        if let Some(existing) = call.media.transport(transport.direction) {
            warn!(
                target: "Calls",
                "Ignoring second {:?} transport {} (have {existing})",
                transport.direction,
                transport.id
            );
            return Ok(());
        }

        let dtls_parameters = self.engine.create_transport(&transport).await?;
        call.media
            .set_transport(transport.direction, transport.id.clone());
        self.sink
            .send_signal(
                signaling::TRANSPORT_CONNECT,
                json!({
                    "call_id": call.info.call_id,
                    "transport_id": transport.id,
                    "dtls_parameters": dtls_parameters,
                }),
            )
            .await?;

        if transport.direction == TransportDirection::Send {
            let mut wanted = Vec::new();
            if self.config.auto_acquire_audio {
                wanted.push(MediaKind::Audio);
            }
            if self_media.video {
                wanted.push(MediaKind::Video);
            }
            if self_media.screen_share {
                wanted.push(MediaKind::Screen);
            }
            for kind in wanted {
                let paused = kind == MediaKind::Audio && self_media.muted;
                self.produce(call, kind, paused).await?;
            }
        }
        Ok(())
    }

    async fn produce(&self, call: &mut Call, kind: MediaKind, paused: bool) -> Result<(), CallError> {
        if call.media.producers.contains_key(&kind) {
            return Ok(());
        }
        let transport_id = call
            .media
            .send_transport
            .clone()
            .ok_or(super::media::MediaError::NoTransport(TransportDirection::Send))?;
        let producer_id = self.engine.produce(&transport_id, kind, paused).await?;
        debug!(target: "Calls", "Producing {kind} as {producer_id}");
        call.media.producers.insert(kind, producer_id);
        self.media_ready(call)
    }

    async fn consume(
        &self,
        call: &mut Call,
        self_media: MediaState,
        producer: RemoteProducer,
    ) -> Result<(), CallError> {
        if call.media.consumers.contains_key(&producer.producer_id) {
            return Ok(());
        }
        let transport_id = call
            .media
            .recv_transport
            .clone()
            .ok_or(super::media::MediaError::NoTransport(TransportDirection::Recv))?;
        let consumer_id = self.engine.consume(&transport_id, &producer).await?;
        call.media
            .consumers
            .insert(producer.producer_id.clone(), consumer_id.clone());
        if !self_media.deafened {
            self.engine.resume_consumer(&consumer_id).await?;
        }
        debug!(
            target: "Calls",
            "Consuming {} {} as {consumer_id}",
            producer.kind,
            producer.producer_id
        );
        self.media_ready(call)
    }

    fn media_ready(&self, call: &mut Call) -> Result<(), CallError> {
        if matches!(call.info.state, CallState::Connecting { .. }) {
            call.info.apply_transition(CallTransition::MediaReady)?;
            info!(target: "Calls", "Call {} is active", call.info.call_id);
            self.emit_updated(&call.info);
        }
        Ok(())
    }

    /// Makes live media match `next`, then commits it. If the engine refuses
    /// a step, the steps already taken are undone and nothing is committed.
    async fn apply_self_media(&self, inner: &mut Inner, next: MediaState) -> Result<(), CallError> {
        let prev = inner.self_media;
        let live = inner
            .call
            .as_mut()
            .filter(|c| c.info.state.is_live() && !c.info.answered_elsewhere);
        if let Some(call) = live {
            let mut applied = Vec::new();
            if let Err(e) = self.drive_media(call, prev, next, &mut applied).await {
                self.roll_back(call, applied).await;
                return Err(e);
            }

            let announce = json!({
                "call_id": call.info.call_id,
                "muted": next.muted,
                "deafened": next.deafened,
                "video": next.video,
                "screen_share": next.screen_share,
            });
            if let Err(e) = self.sink.send_signal(signaling::MEDIA_STATE, announce).await {
                warn!(target: "Calls", "Failed to announce media state: {e}");
            }
        }

        inner.self_media = next;
        let _ = self.events.send(CallEvent::SelfMediaChanged(next));
        Ok(())
    }

    /// Runs the engine steps for `prev -> next`, recording each one that
    /// succeeded in `applied`.
    async fn drive_media(
        &self,
        call: &mut Call,
        prev: MediaState,
        next: MediaState,
        applied: &mut Vec<AppliedStep>,
    ) -> Result<(), CallError> {
        let engine = self.engine.as_ref();
        if prev.muted != next.muted
            && let Some(producer_id) = call.media.producers.get(&MediaKind::Audio)
        {
            if next.muted {
                engine.pause_producer(producer_id).await?;
                applied.push(AppliedStep::ProducerPaused(producer_id.clone()));
            } else {
                engine.resume_producer(producer_id).await?;
                applied.push(AppliedStep::ProducerResumed(producer_id.clone()));
            }
        }
        if prev.deafened != next.deafened {
            for consumer_id in call.media.consumers.values() {
                if next.deafened {
                    engine.pause_consumer(consumer_id).await?;
                    applied.push(AppliedStep::ConsumerPaused(consumer_id.clone()));
                } else {
                    engine.resume_consumer(consumer_id).await?;
                    applied.push(AppliedStep::ConsumerResumed(consumer_id.clone()));
                }
            }
        }

        let wanted = [
            (MediaKind::Video, next.video),
            (MediaKind::Screen, next.screen_share),
        ];
        for (kind, on) in wanted {
            if on && call.media.send_transport.is_some() && !call.media.producers.contains_key(&kind) {
                self.produce(call, kind, false).await?;
                applied.push(AppliedStep::Produced(kind));
            }
        }
        // A closed producer cannot be reopened as-is, so closing comes last.
        for (kind, on) in wanted {
            if !on && let Some(producer_id) = call.media.producers.remove(&kind) {
                if let Err(e) = engine.close_producer(&producer_id).await {
                    call.media.producers.insert(kind, producer_id);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Undoes `applied` in reverse order. Best effort: failures are logged.
    async fn roll_back(&self, call: &mut Call, applied: Vec<AppliedStep>) {
        let engine = self.engine.as_ref();
        for step in applied.into_iter().rev() {
            let undone = match &step {
                AppliedStep::ProducerPaused(id) => engine.resume_producer(id).await,
                AppliedStep::ProducerResumed(id) => engine.pause_producer(id).await,
                AppliedStep::ConsumerPaused(id) => engine.resume_consumer(id).await,
                AppliedStep::ConsumerResumed(id) => engine.pause_consumer(id).await,
                AppliedStep::Produced(kind) => match call.media.producers.remove(kind) {
                    Some(id) => engine.close_producer(&id).await,
                    None => Ok(()),
                },
            };
            if let Err(e) = undone {
                warn!(target: "Calls", "Failed to roll back {step:?}: {e}");
            }
        }
    }

    /// Releases media, then moves to `ended`.
    async fn finish(&self, call: &mut Call, reason: EndReason) -> Result<(), CallError> {
        call.media.release_all(self.engine.as_ref()).await;
        call.info.apply_transition(CallTransition::End { reason })?;
        info!(target: "Calls", "Call {} ended: {reason}", call.info.call_id);
        self.emit_updated(&call.info);
        Ok(())
    }

    /// Replaces an idle or ended slot with a new call.
    async fn install(&self, inner: &mut Inner, info: CallInfo) {
        if let Some(mut previous) = inner.call.take() {
            previous.media.release_all(self.engine.as_ref()).await;
        }
        inner.self_media.video = info.has_video();
        inner.self_media.screen_share = false;
        self.emit_updated(&info);
        inner.call = Some(Call {
            info,
            media: MediaResources::default(),
        });
    }

    fn emit_updated(&self, info: &CallInfo) {
        let _ = self.events.send(CallEvent::Updated(info.clone()));
    }
}
