use super::close_code::CloseReason;
use crate::envelope::EnvelopeError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("timed out after {0:?} waiting for the session to become ready")]
    ConnectTimeout(Duration),
    #[error("handshake rejected: {0}")]
    Rejected(CloseReason),
    #[error("heartbeat was not acknowledged")]
    HeartbeatTimeout,
    #[error("resume failed: {0}")]
    ResumeFailed(CloseReason),
    #[error("no session to resume")]
    NoSession,
    #[error("sequence gap: expected {expected}, got {got:?}")]
    InvalidSequence { expected: u64, got: Option<u64> },
    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] EnvelopeError),
    #[error("unexpected event during handshake: {0}")]
    UnexpectedEvent(String),
    #[error("session is not connected")]
    NotConnected,
    #[error("a connect or resume is already in progress")]
    AlreadyConnecting,
}

impl SessionError {
    /// The close reason behind this error, when it maps to one.
    pub fn close_reason(&self) -> Option<CloseReason> {
        match self {
            Self::Rejected(reason) | Self::ResumeFailed(reason) => Some(*reason),
            Self::HeartbeatTimeout => Some(CloseReason::HeartbeatTimeout),
            Self::InvalidSequence { .. } => Some(CloseReason::InvalidSequence),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
