//! Close codes the session protocol distinguishes.
//!
//! The same numeric table is used for websocket close frames and for the
//! `code` field of `system.error`.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

pub const NORMAL_CLOSURE: u16 = 1000;
pub const NOT_AUTHENTICATED: u16 = 4001;
pub const AUTHENTICATION_FAILED: u16 = 4002;
pub const SESSION_EXPIRED: u16 = 4003;
pub const SERVER_SHUTTING_DOWN: u16 = 4004;
pub const INVALID_SEQUENCE: u16 = 4005;
/// Generated locally when the client force-closes a connection whose
/// heartbeat went unacknowledged.
pub const HEARTBEAT_TIMEOUT: u16 = 4006;

const SHUTDOWN_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CloseReason {
    NotAuthenticated,
    AuthenticationFailed,
    SessionExpired,
    ServerShuttingDown,
    InvalidSequence,
    HeartbeatTimeout,
    /// Clean close with no protocol meaning (1000).
    Normal,
    /// Transport dropped without a close code, or with one we do not know.
    Abnormal(Option<u16>),
}

/// What a caller should do after a connection closed for a given reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Session identity is still valid; try `resume` first.
    Resume,
    /// Session identity is gone; issue a fresh `connect`.
    Reconnect,
    /// Fresh `connect`, but only after waiting at least this long.
    ReconnectAfterBackoff(Duration),
    /// The credential itself is bad; retrying with it is pointless.
    Reauthenticate,
}

impl CloseReason {
    pub fn from_code(code: Option<u16>) -> Self {
        match code {
            Some(NORMAL_CLOSURE) => Self::Normal,
            Some(NOT_AUTHENTICATED) => Self::NotAuthenticated,
            Some(AUTHENTICATION_FAILED) => Self::AuthenticationFailed,
            Some(SESSION_EXPIRED) => Self::SessionExpired,
            Some(SERVER_SHUTTING_DOWN) => Self::ServerShuttingDown,
            Some(INVALID_SEQUENCE) => Self::InvalidSequence,
            Some(HEARTBEAT_TIMEOUT) => Self::HeartbeatTimeout,
            other => Self::Abnormal(other),
        }
    }

    pub fn code(&self) -> Option<u16> {
        match self {
            Self::NotAuthenticated => Some(NOT_AUTHENTICATED),
            Self::AuthenticationFailed => Some(AUTHENTICATION_FAILED),
            Self::SessionExpired => Some(SESSION_EXPIRED),
            Self::ServerShuttingDown => Some(SERVER_SHUTTING_DOWN),
            Self::InvalidSequence => Some(INVALID_SEQUENCE),
            Self::HeartbeatTimeout => Some(HEARTBEAT_TIMEOUT),
            Self::Normal => Some(NORMAL_CLOSURE),
            Self::Abnormal(code) => *code,
        }
    }

    /// Whether the session identity must be discarded after this close.
    pub fn invalidates_session(&self) -> bool {
        matches!(
            self,
            Self::SessionExpired
                | Self::InvalidSequence
                | Self::NotAuthenticated
                | Self::AuthenticationFailed
        )
    }

    pub fn recovery(&self) -> Recovery {
        match self {
            Self::NotAuthenticated | Self::AuthenticationFailed => Recovery::Reauthenticate,
            Self::SessionExpired | Self::InvalidSequence => Recovery::Reconnect,
            Self::ServerShuttingDown => Recovery::ReconnectAfterBackoff(SHUTDOWN_BACKOFF),
            Self::HeartbeatTimeout | Self::Normal | Self::Abnormal(_) => Recovery::Resume,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAuthenticated => write!(f, "not authenticated"),
            Self::AuthenticationFailed => write!(f, "authentication failed"),
            Self::SessionExpired => write!(f, "session expired"),
            Self::ServerShuttingDown => write!(f, "server shutting down"),
            Self::InvalidSequence => write!(f, "invalid sequence"),
            Self::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            Self::Normal => write!(f, "normal closure"),
            Self::Abnormal(Some(code)) => write!(f, "abnormal closure ({code})"),
            Self::Abnormal(None) => write!(f, "abnormal closure"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes_round_trip() {
        for code in [
            NOT_AUTHENTICATED,
            AUTHENTICATION_FAILED,
            SESSION_EXPIRED,
            SERVER_SHUTTING_DOWN,
            INVALID_SEQUENCE,
            HEARTBEAT_TIMEOUT,
            NORMAL_CLOSURE,
        ] {
            assert_eq!(CloseReason::from_code(Some(code)).code(), Some(code));
        }
    }

    #[test]
    fn test_unknown_code_is_abnormal() {
        assert_eq!(
            CloseReason::from_code(Some(1006)),
            CloseReason::Abnormal(Some(1006))
        );
        assert_eq!(CloseReason::from_code(None), CloseReason::Abnormal(None));
    }

    #[test]
    fn test_expired_session_never_resumes() {
        assert_eq!(CloseReason::SessionExpired.recovery(), Recovery::Reconnect);
        assert!(CloseReason::SessionExpired.invalidates_session());
    }

    #[test]
    fn test_invalid_sequence_forces_fresh_connect() {
        assert_eq!(CloseReason::InvalidSequence.recovery(), Recovery::Reconnect);
        assert!(CloseReason::InvalidSequence.invalidates_session());
    }

    #[test]
    fn test_shutdown_backs_off() {
        assert!(matches!(
            CloseReason::ServerShuttingDown.recovery(),
            Recovery::ReconnectAfterBackoff(d) if d >= Duration::from_secs(10)
        ));
    }

    #[test]
    fn test_heartbeat_timeout_keeps_session() {
        assert_eq!(CloseReason::HeartbeatTimeout.recovery(), Recovery::Resume);
        assert!(!CloseReason::HeartbeatTimeout.invalidates_session());
    }

    #[test]
    fn test_bad_credentials_require_reauth() {
        assert_eq!(
            CloseReason::AuthenticationFailed.recovery(),
            Recovery::Reauthenticate
        );
        assert_eq!(
            CloseReason::NotAuthenticated.recovery(),
            Recovery::Reauthenticate
        );
    }
}
