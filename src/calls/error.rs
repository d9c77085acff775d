//! Call-related error types.

use thiserror::Error;

use super::media::MediaError;
use crate::session::SessionError;
use crate::types::call::CallId;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("no call in progress")]
    NoCall,

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error("busy: call {0} already in progress")]
    Busy(CallId),

    #[error("{0}")]
    InvalidState(&'static str),

    #[error("invalid payload for {event}: {source}")]
    Parse {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("signaling failed: {0}")]
    Signal(#[from] SessionError),
}
