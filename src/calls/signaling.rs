//! `call.*` events exchanged over the central connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::CallError;
use super::media::{RemoteProducer, TransportParams};
use crate::types::call::{CallId, EndReason, MediaKind, MediaState, Peer};

pub const CALL_PREFIX: &str = "call.";

// Inbound.
pub const INCOMING: &str = "call.incoming";
pub const ACCEPTED: &str = "call.accepted";
pub const ANSWERED_ELSEWHERE: &str = "call.answered_elsewhere";
pub const ENDED: &str = "call.ended";
pub const ROUTER_CAPABILITIES: &str = "call.router_capabilities";
pub const TRANSPORT_CREATED: &str = "call.transport_created";
pub const NEW_PRODUCER: &str = "call.new_producer";
pub const PRODUCER_CLOSED: &str = "call.producer_closed";
pub const PEER_MEDIA: &str = "call.peer_media";
pub const TRANSFERRED: &str = "call.transferred";

// Outbound.
pub const START: &str = "call.start";
pub const ANSWER: &str = "call.answer";
pub const REJECT: &str = "call.reject";
pub const END: &str = "call.end";
pub const TRANSFER: &str = "call.transfer";
pub const MEDIA_STATE: &str = "call.media_state";
pub const TRANSPORT_CONNECT: &str = "call.transport_connect";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingCall {
    pub call_id: CallId,
    pub peer: Peer,
    #[serde(default = "audio_only")]
    pub media_types: Vec<MediaKind>,
}

fn audio_only() -> Vec<MediaKind> {
    vec![MediaKind::Audio]
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct CallRef {
    call_id: CallId,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct Ended {
    call_id: CallId,
    #[serde(default = "normal")]
    reason: EndReason,
}

fn normal() -> EndReason {
    EndReason::Normal
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct RouterCapabilities {
    call_id: CallId,
    rtp_capabilities: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct WithCall<T> {
    call_id: CallId,
    #[serde(flatten)]
    body: T,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct ProducerClosed {
    call_id: CallId,
    producer_id: String,
}

/// A decoded inbound call event.
#[derive(Debug, Clone, PartialEq)]
pub enum CallSignal {
    Incoming(IncomingCall),
    Accepted(CallId),
    AnsweredElsewhere(CallId),
    Ended { call_id: CallId, reason: EndReason },
    RouterCapabilities { call_id: CallId, rtp_capabilities: Value },
    TransportCreated { call_id: CallId, transport: TransportParams },
    NewProducer { call_id: CallId, producer: RemoteProducer },
    ProducerClosed { call_id: CallId, producer_id: String },
    PeerMedia { call_id: CallId, state: MediaState },
    Transferred(CallId),
}

impl CallSignal {
    /// Decodes a dispatch. `Ok(None)` for events this layer does not handle.
    pub fn parse(event: &str, data: &Value) -> Result<Option<Self>, CallError> {
        fn decode<T: for<'de> Deserialize<'de>>(event: &str, data: &Value) -> Result<T, CallError> {
            serde_json::from_value(data.clone()).map_err(|source| CallError::Parse {
                event: event.to_string(),
                source,
            })
        }

        let signal = match event {
            INCOMING => Self::Incoming(decode(event, data)?),
            ACCEPTED => Self::Accepted(decode::<CallRef>(event, data)?.call_id),
            ANSWERED_ELSEWHERE => Self::AnsweredElsewhere(decode::<CallRef>(event, data)?.call_id),
            ENDED => {
                let Ended { call_id, reason } = decode(event, data)?;
                Self::Ended { call_id, reason }
            }
            ROUTER_CAPABILITIES => {
                let RouterCapabilities {
                    call_id,
                    rtp_capabilities,
                } = decode(event, data)?;
                Self::RouterCapabilities {
                    call_id,
                    rtp_capabilities,
                }
            }
            TRANSPORT_CREATED => {
                let WithCall { call_id, body } = decode(event, data)?;
                Self::TransportCreated {
                    call_id,
                    transport: body,
                }
            }
            NEW_PRODUCER => {
                let WithCall { call_id, body } = decode(event, data)?;
                Self::NewProducer {
                    call_id,
                    producer: body,
                }
            }
            PRODUCER_CLOSED => {
                let ProducerClosed {
                    call_id,
                    producer_id,
                } = decode(event, data)?;
                Self::ProducerClosed {
                    call_id,
                    producer_id,
                }
            }
            PEER_MEDIA => {
                let WithCall { call_id, body } = decode(event, data)?;
                Self::PeerMedia {
                    call_id,
                    state: body,
                }
            }
            TRANSFERRED => Self::Transferred(decode::<CallRef>(event, data)?.call_id),
            _ => return Ok(None),
        };
        Ok(Some(signal))
    }

    pub fn call_id(&self) -> &CallId {
        match self {
            Self::Incoming(incoming) => &incoming.call_id,
            Self::Accepted(call_id)
            | Self::AnsweredElsewhere(call_id)
            | Self::Transferred(call_id) => call_id,
            Self::Ended { call_id, .. }
            | Self::RouterCapabilities { call_id, .. }
            | Self::TransportCreated { call_id, .. }
            | Self::NewProducer { call_id, .. }
            | Self::ProducerClosed { call_id, .. }
            | Self::PeerMedia { call_id, .. } => call_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::media::TransportDirection;
    use serde_json::json;

    #[test]
    fn test_parse_incoming_defaults_to_audio() {
        let signal = CallSignal::parse(
            INCOMING,
            &json!({"call_id": "c1", "peer": {"user_id": "u1", "display_name": "Ada"}}),
        )
        .unwrap()
        .unwrap();
        let CallSignal::Incoming(incoming) = signal else {
            panic!("expected incoming");
        };
        assert_eq!(incoming.peer.display_name.as_deref(), Some("Ada"));
        assert_eq!(incoming.media_types, vec![MediaKind::Audio]);
    }

    #[test]
    fn test_parse_flattened_bodies() {
        let signal = CallSignal::parse(
            TRANSPORT_CREATED,
            &json!({"call_id": "c1", "id": "t9", "direction": "send", "params": {}}),
        )
        .unwrap()
        .unwrap();
        match signal {
            CallSignal::TransportCreated { call_id, transport } => {
                assert_eq!(call_id.as_str(), "c1");
                assert_eq!(transport.id, "t9");
                assert_eq!(transport.direction, TransportDirection::Send);
            }
            other => panic!("unexpected {other:?}"),
        }

        let signal = CallSignal::parse(
            PEER_MEDIA,
            &json!({"call_id": "c1", "muted": true, "video": true}),
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            signal,
            CallSignal::PeerMedia {
                call_id: CallId::new("c1"),
                state: MediaState {
                    muted: true,
                    video: true,
                    ..Default::default()
                },
            }
        );
    }

    #[test]
    fn test_ended_reason() {
        let signal = CallSignal::parse(ENDED, &json!({"call_id": "c1", "reason": "busy"}))
            .unwrap()
            .unwrap();
        assert!(matches!(
            signal,
            CallSignal::Ended {
                reason: EndReason::Busy,
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_and_malformed() {
        assert_eq!(CallSignal::parse("call.ringtone", &json!({})).unwrap(), None);
        let err = CallSignal::parse(ACCEPTED, &json!({"id": 3})).unwrap_err();
        assert!(err.to_string().contains(ACCEPTED));
    }
}
