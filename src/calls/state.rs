//! Call state machine.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::call::{CallId, EndReason, MediaKind, MediaState, Peer};

/// Lifecycle of the single client-wide call.
#[derive(Debug, Clone, Copy, Serialize, Default, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CallState {
    #[default]
    Idle,
    /// We placed the call; the peer's devices are ringing.
    OutgoingRinging { since: DateTime<Utc> },
    /// Ringing locally.
    IncomingRinging { received_at: DateTime<Utc> },
    /// Accepted, waiting for the first media to flow.
    Connecting { accepted_at: DateTime<Utc> },
    Active { started_at: DateTime<Utc> },
    Ended {
        reason: EndReason,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl CallState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_ringing(&self) -> bool {
        matches!(
            self,
            Self::OutgoingRinging { .. } | Self::IncomingRinging { .. }
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    /// Ringing, connecting or active.
    pub fn is_live(&self) -> bool {
        !self.is_idle() && !self.is_ended()
    }

    /// Only an idle or ended slot may take a new incoming/outgoing call.
    pub fn accepts_new_call(&self) -> bool {
        self.is_idle() || self.is_ended()
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::OutgoingRinging { .. } => "outgoing_ringing",
            Self::IncomingRinging { .. } => "incoming_ringing",
            Self::Connecting { .. } => "connecting",
            Self::Active { .. } => "active",
            Self::Ended { .. } => "ended",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CallTransition {
    Incoming,
    Outgoing,
    /// We answered an incoming call.
    Answer,
    /// The peer answered our outgoing call.
    RemoteAccepted,
    /// We took over a call answered on another of our devices.
    TransferIn,
    MediaReady,
    End { reason: EndReason },
    Acknowledge,
}

/// Everything known about the current call.
#[derive(Debug, Clone, Serialize)]
pub struct CallInfo {
    pub call_id: CallId,
    pub peer: Peer,
    pub media_types: Vec<MediaKind>,
    pub is_initiator: bool,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
    /// Another of our devices answered; this one stays silent unless it
    /// transfers the call to itself.
    pub answered_elsewhere: bool,
    pub peer_media: MediaState,
}

impl CallInfo {
    fn new(call_id: CallId, peer: Peer, media_types: Vec<MediaKind>, is_initiator: bool) -> Self {
        Self {
            call_id,
            peer,
            media_types,
            is_initiator,
            state: CallState::Idle,
            created_at: Utc::now(),
            started_at: None,
            end_reason: None,
            answered_elsewhere: false,
            peer_media: MediaState::default(),
        }
    }

    pub fn new_outgoing(call_id: CallId, peer: Peer, media_types: Vec<MediaKind>) -> Self {
        let mut info = Self::new(call_id, peer, media_types, true);
        info.state = CallState::OutgoingRinging { since: Utc::now() };
        info
    }

    pub fn new_incoming(call_id: CallId, peer: Peer, media_types: Vec<MediaKind>) -> Self {
        let mut info = Self::new(call_id, peer, media_types, false);
        info.state = CallState::IncomingRinging {
            received_at: Utc::now(),
        };
        info
    }

    pub fn has_video(&self) -> bool {
        self.media_types.contains(&MediaKind::Video)
    }

    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        let now = Utc::now();
        let new_state = match (&self.state, transition) {
            (CallState::Idle, CallTransition::Incoming) => {
                CallState::IncomingRinging { received_at: now }
            }
            (CallState::Idle, CallTransition::Outgoing) => CallState::OutgoingRinging { since: now },
            (CallState::IncomingRinging { .. }, CallTransition::Answer)
            | (CallState::OutgoingRinging { .. }, CallTransition::RemoteAccepted) => {
                CallState::Connecting { accepted_at: now }
            }
            (
                CallState::IncomingRinging { .. }
                | CallState::Connecting { .. }
                | CallState::Active { .. },
                CallTransition::TransferIn,
            ) if self.answered_elsewhere => CallState::Connecting { accepted_at: now },
            (CallState::Connecting { .. }, CallTransition::MediaReady) => {
                self.started_at = Some(now);
                CallState::Active { started_at: now }
            }
            (current, CallTransition::End { reason }) if current.is_live() => {
                let duration_secs = match current {
                    CallState::Active { started_at } => {
                        Some(now.signed_duration_since(*started_at).num_seconds())
                    }
                    _ => None,
                };
                self.end_reason = Some(reason);
                CallState::Ended {
                    reason,
                    ended_at: now,
                    duration_secs,
                }
            }
            (CallState::Ended { .. }, CallTransition::Acknowledge) => CallState::Idle,
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: current.name().to_string(),
                    attempted: format!("{transition:?}"),
                });
            }
        };
        self.state = new_state;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;

    fn outgoing() -> CallInfo {
        CallInfo::new_outgoing(
            CallId::new("AC90CFD09DF712D981142B172706F9F2"),
            Peer::new("u-bob"),
            vec![MediaKind::Audio],
        )
    }

    fn incoming() -> CallInfo {
        CallInfo::new_incoming(
            CallId::new("BC5BD1EDE9BBE601F408EF3795479E93"),
            Peer::new("u-alice"),
            vec![MediaKind::Audio, MediaKind::Video],
        )
    }

    /// Flow: OutgoingRinging → Connecting → Active → Ended → Idle
    #[test]
    fn test_outgoing_call_flow() {
        let mut call = outgoing();
        assert!(call.state.is_ringing());
        assert!(call.is_initiator);

        call.apply_transition(CallTransition::RemoteAccepted).unwrap();
        assert!(matches!(call.state, CallState::Connecting { .. }));
        assert_eq!(call.started_at, None);

        call.apply_transition(CallTransition::MediaReady).unwrap();
        assert!(call.state.is_active());
        assert!(call.started_at.is_some());

        call.apply_transition(CallTransition::End {
            reason: EndReason::Normal,
        })
        .unwrap();
        assert_eq!(call.end_reason, Some(EndReason::Normal));
        if let CallState::Ended { duration_secs, .. } = call.state {
            assert!(duration_secs.is_some());
        } else {
            panic!("expected ended");
        }

        call.apply_transition(CallTransition::Acknowledge).unwrap();
        assert!(call.state.is_idle());
    }

    #[test]
    fn test_incoming_call_flow() {
        let mut call = incoming();
        assert!(matches!(call.state, CallState::IncomingRinging { .. }));
        assert!(call.has_video());

        call.apply_transition(CallTransition::Answer).unwrap();
        call.apply_transition(CallTransition::MediaReady).unwrap();
        assert!(call.state.is_active());
    }

    #[test]
    fn test_every_live_state_can_end() {
        for reason in [
            EndReason::Rejected,
            EndReason::Timeout,
            EndReason::Busy,
            EndReason::Unavailable,
            EndReason::Disconnected,
        ] {
            let mut ringing = incoming();
            ringing.apply_transition(CallTransition::End { reason }).unwrap();
            assert_eq!(ringing.end_reason, Some(reason));

            let mut connecting = outgoing();
            connecting.apply_transition(CallTransition::RemoteAccepted).unwrap();
            connecting.apply_transition(CallTransition::End { reason }).unwrap();
            if let CallState::Ended { duration_secs, .. } = connecting.state {
                assert_eq!(duration_secs, None);
            }
        }
    }

    #[test]
    fn test_answer_only_from_incoming_ringing() {
        let mut call = outgoing();
        assert!(call.apply_transition(CallTransition::Answer).is_err());
        assert!(call.state.is_ringing(), "failed transition keeps state");

        let mut call = incoming();
        assert!(call.apply_transition(CallTransition::RemoteAccepted).is_err());
        assert!(call.apply_transition(CallTransition::MediaReady).is_err());
    }

    #[test]
    fn test_ended_call_only_acknowledges() {
        let mut call = incoming();
        call.apply_transition(CallTransition::End {
            reason: EndReason::Rejected,
        })
        .unwrap();

        assert!(call.apply_transition(CallTransition::Answer).is_err());
        assert!(
            call.apply_transition(CallTransition::End {
                reason: EndReason::Normal
            })
            .is_err()
        );
        assert_eq!(call.end_reason, Some(EndReason::Rejected));
        assert!(call.state.accepts_new_call());
    }

    #[test]
    fn test_transfer_requires_answered_elsewhere() {
        let mut call = incoming();
        assert!(call.apply_transition(CallTransition::TransferIn).is_err());

        call.answered_elsewhere = true;
        call.apply_transition(CallTransition::TransferIn).unwrap();
        assert!(matches!(call.state, CallState::Connecting { .. }));
    }

    #[test]
    fn test_live_states_refuse_new_calls() {
        let mut call = outgoing();
        assert!(!call.state.accepts_new_call());
        call.apply_transition(CallTransition::RemoteAccepted).unwrap();
        assert!(!call.state.accepts_new_call());
        assert!(CallState::Idle.accepts_new_call());
    }

    #[test]
    fn test_invalid_transition_message() {
        let mut call = outgoing();
        let err = call
            .apply_transition(CallTransition::Acknowledge)
            .unwrap_err();
        assert_eq!(err.current_state, "outgoing_ringing");
        assert!(err.to_string().contains("Acknowledge"));
    }
}
