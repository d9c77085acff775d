use crate::envelope::ReadyPayload;
use crate::session::CloseReason;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// An application event delivered over a session connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub event: String,
    pub data: Value,
    /// Present on sequenced connections only.
    pub seq: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisconnectInfo {
    pub code: Option<u16>,
    pub reason: CloseReason,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Fresh session established; carries the initial-state snapshot.
    Ready(Arc<ReadyPayload>),
    /// A prior session was resumed; missed dispatches follow.
    Resumed { session_id: String, last_seq: u64 },
    Dispatch(Arc<Dispatch>),
    /// The connection went away without the caller asking for it.
    Disconnected(Arc<DisconnectInfo>),
}

/// Fan-out of session events to any number of independent subscribers.
///
/// Subscribers that fall behind by more than the channel capacity observe
/// `RecvError::Lagged` and are expected to resynchronise.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity.max(1)).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Sends `event` to all current subscribers. Having none is not an error.
    pub fn dispatch(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_sees_each_event() {
        let bus = EventBus::default();
        let mut router = bus.subscribe();
        let mut calls = bus.subscribe();

        bus.dispatch(SessionEvent::Dispatch(Arc::new(Dispatch {
            event: "call.incoming".into(),
            data: Value::Null,
            seq: None,
        })));

        for rx in [&mut router, &mut calls] {
            match rx.recv().await.unwrap() {
                SessionEvent::Dispatch(d) => assert_eq!(d.event, "call.incoming"),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_dispatch_without_subscribers_is_ok() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        bus.dispatch(SessionEvent::Resumed {
            session_id: "s".into(),
            last_seq: 0,
        });
    }
}
