pub mod calls;
pub mod config;
pub mod envelope;
pub mod session;
pub mod transport;
pub mod types;
pub mod voice;

// `impl SessionClient` blocks split out of session/
mod handshake;
mod keepalive;

pub use config::{ClientConfig, SessionConfig, SpeakerConfig};
pub use session::{
    CloseReason, ConnectionKind, Credential, Recovery, SessionClient, SessionError,
};
pub use types::events::{DisconnectInfo, Dispatch, EventBus, SessionEvent};
