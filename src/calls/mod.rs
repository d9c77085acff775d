//! Call signaling over the central connection.
//!
//! - [`CallState`] & [`CallInfo`]: lifecycle of the single client-wide call
//! - [`CallSignal`]: decoded inbound `call.*` events
//! - [`CallManager`]: applies signals and user intents, owns media resources
//! - [`MediaEngine`]: boundary to the external SFU client
//! - [`CallHandler`]: feeds session dispatches into the manager

mod error;
mod handler;
mod manager;
pub mod media;
pub mod signaling;
mod state;

pub use error::CallError;
pub use handler::CallHandler;
pub use manager::{CallEvent, CallManager, CallManagerConfig, SignalSink};
pub use media::{MediaEngine, MediaError, MediaResources, RemoteProducer, TransportDirection, TransportParams};
pub use signaling::CallSignal;
pub use state::{CallInfo, CallState, CallTransition, InvalidTransition};
