//! Boundary to the external SFU media engine, and the per-call media
//! resources opened through it.
//!
//! The engine owns codecs, ICE/DTLS and RTP. The call layer only decides
//! *when* transports, producers and consumers exist, using ids handed out by
//! `call.*` events, and guarantees they are all closed before its call is
//! dropped.

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

use crate::types::call::MediaKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportDirection {
    Send,
    Recv,
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("device not loaded")]
    DeviceNotLoaded,

    #[error("no {0:?} transport")]
    NoTransport(TransportDirection),

    #[error("media engine: {0}")]
    Engine(#[from] anyhow::Error),
}

/// Server-side transport description from `call.transport_created`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportParams {
    pub id: String,
    pub direction: TransportDirection,
    /// ICE/DTLS parameters, passed through to the engine untouched.
    #[serde(default)]
    pub params: Value,
}

/// A remote producer to consume, from `call.new_producer`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteProducer {
    pub producer_id: String,
    pub kind: MediaKind,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub rtp_parameters: Value,
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Loads the device against the router's RTP capabilities and returns the
    /// device's own capabilities.
    async fn load_device(&self, router_capabilities: &Value) -> Result<Value, MediaError>;

    /// Creates the local end of a server transport. Returns the DTLS
    /// parameters to send back with `call.transport_connect`.
    async fn create_transport(&self, transport: &TransportParams) -> Result<Value, MediaError>;

    /// Starts sending `kind` on the send transport; returns the producer id.
    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        paused: bool,
    ) -> Result<String, MediaError>;

    async fn pause_producer(&self, producer_id: &str) -> Result<(), MediaError>;

    async fn resume_producer(&self, producer_id: &str) -> Result<(), MediaError>;

    async fn close_producer(&self, producer_id: &str) -> Result<(), MediaError>;

    /// Starts receiving a remote producer; returns the consumer id.
    async fn consume(
        &self,
        transport_id: &str,
        producer: &RemoteProducer,
    ) -> Result<String, MediaError>;

    async fn pause_consumer(&self, consumer_id: &str) -> Result<(), MediaError>;

    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), MediaError>;

    async fn close_consumer(&self, consumer_id: &str) -> Result<(), MediaError>;

    async fn close_transport(&self, transport_id: &str) -> Result<(), MediaError>;
}

/// Media opened for one call. At most one transport per direction, one
/// producer per local kind, one consumer per remote producer.
#[derive(Debug, Default)]
pub struct MediaResources {
    pub device: Option<Value>,
    pub send_transport: Option<String>,
    pub recv_transport: Option<String>,
    pub producers: HashMap<MediaKind, String>,
    /// Remote producer id to local consumer id.
    pub consumers: HashMap<String, String>,
}

impl MediaResources {
    pub fn is_empty(&self) -> bool {
        self.device.is_none()
            && self.send_transport.is_none()
            && self.recv_transport.is_none()
            && self.producers.is_empty()
            && self.consumers.is_empty()
    }

    pub fn transport(&self, direction: TransportDirection) -> Option<&str> {
        match direction {
            TransportDirection::Send => self.send_transport.as_deref(),
            TransportDirection::Recv => self.recv_transport.as_deref(),
        }
    }

    pub(crate) fn set_transport(&mut self, direction: TransportDirection, id: String) {
        match direction {
            TransportDirection::Send => self.send_transport = Some(id),
            TransportDirection::Recv => self.recv_transport = Some(id),
        }
    }

    /// Closes everything, consumers first and transports last. Engine errors
    /// are logged and never stop the teardown. Calling it again is a no-op.
    pub async fn release_all(&mut self, engine: &dyn MediaEngine) {
        if self.is_empty() {
            return;
        }
        debug!(
            target: "Calls",
            "Releasing media: {} producers, {} consumers",
            self.producers.len(),
            self.consumers.len()
        );
        for (_, consumer_id) in self.consumers.drain() {
            if let Err(e) = engine.close_consumer(&consumer_id).await {
                warn!(target: "Calls", "Failed to close consumer {consumer_id}: {e}");
            }
        }
        for (kind, producer_id) in self.producers.drain() {
            if let Err(e) = engine.close_producer(&producer_id).await {
                warn!(target: "Calls", "Failed to close {kind} producer {producer_id}: {e}");
            }
        }
        for transport_id in [self.send_transport.take(), self.recv_transport.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = engine.close_transport(&transport_id).await {
                warn!(target: "Calls", "Failed to close transport {transport_id}: {e}");
            }
        }
        self.device = None;
    }
}

#[cfg(test)]
pub(crate) mod recording {
    //! Engine double that records every call and can be told to fail.

    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    pub struct RecordingEngine {
        pub ops: Mutex<Vec<String>>,
        pub fail_produce: AtomicBool,
        pub fail_pause_consumer: AtomicBool,
        next_id: AtomicU32,
    }

    impl RecordingEngine {
        pub fn ops(&self) -> Vec<String> {
            self.ops.lock().unwrap().clone()
        }

        fn record(&self, op: String) {
            self.ops.lock().unwrap().push(op);
        }

        fn next_id(&self, prefix: &str) -> String {
            format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    #[async_trait]
    impl MediaEngine for RecordingEngine {
        async fn load_device(&self, _caps: &Value) -> Result<Value, MediaError> {
            self.record("load_device".into());
            Ok(serde_json::json!({"codecs": ["opus"]}))
        }

        async fn create_transport(&self, t: &TransportParams) -> Result<Value, MediaError> {
            self.record(format!("create_transport {}", t.id));
            Ok(serde_json::json!({"role": "client"}))
        }

        async fn produce(
            &self,
            transport_id: &str,
            kind: MediaKind,
            paused: bool,
        ) -> Result<String, MediaError> {
            if self.fail_produce.load(Ordering::SeqCst) {
                return Err(MediaError::Engine(anyhow::anyhow!("no capture device")));
            }
            let id = self.next_id(kind.as_str());
            self.record(format!("produce {kind} on {transport_id} paused={paused} -> {id}"));
            Ok(id)
        }

        async fn pause_producer(&self, id: &str) -> Result<(), MediaError> {
            self.record(format!("pause_producer {id}"));
            Ok(())
        }

        async fn resume_producer(&self, id: &str) -> Result<(), MediaError> {
            self.record(format!("resume_producer {id}"));
            Ok(())
        }

        async fn close_producer(&self, id: &str) -> Result<(), MediaError> {
            self.record(format!("close_producer {id}"));
            Ok(())
        }

        async fn consume(
            &self,
            transport_id: &str,
            producer: &RemoteProducer,
        ) -> Result<String, MediaError> {
            let id = self.next_id("consumer");
            self.record(format!(
                "consume {} on {transport_id} -> {id}",
                producer.producer_id
            ));
            Ok(id)
        }

        async fn pause_consumer(&self, id: &str) -> Result<(), MediaError> {
            if self.fail_pause_consumer.load(Ordering::SeqCst) {
                return Err(MediaError::Engine(anyhow::anyhow!("consumer {id} is gone")));
            }
            self.record(format!("pause_consumer {id}"));
            Ok(())
        }

        async fn resume_consumer(&self, id: &str) -> Result<(), MediaError> {
            self.record(format!("resume_consumer {id}"));
            Ok(())
        }

        async fn close_consumer(&self, id: &str) -> Result<(), MediaError> {
            self.record(format!("close_consumer {id}"));
            Ok(())
        }

        async fn close_transport(&self, id: &str) -> Result<(), MediaError> {
            self.record(format!("close_transport {id}"));
            Ok(())
        }
    }
}
