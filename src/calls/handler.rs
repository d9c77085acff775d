//! Routes `call.*` dispatches from the central session into the call manager.

use super::manager::CallManager;
use super::signaling::{CALL_PREFIX, CallSignal};
use crate::types::events::{Dispatch, SessionEvent};
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

pub struct CallHandler {
    manager: Arc<CallManager>,
}

impl CallHandler {
    pub fn new(manager: Arc<CallManager>) -> Self {
        Self { manager }
    }

    /// Handles one dispatch. Returns false if it was not a call event.
    pub async fn handle(&self, dispatch: &Dispatch) -> bool {
        if !dispatch.event.starts_with(CALL_PREFIX) {
            return false;
        }

        let signal = match CallSignal::parse(&dispatch.event, &dispatch.data) {
            Ok(Some(signal)) => signal,
            Ok(None) => {
                debug!(target: "Calls", "Unhandled call event {}", dispatch.event);
                return true;
            }
            Err(e) => {
                warn!(target: "Calls", "Failed to parse {}: {e}", dispatch.event);
                return true;
            }
        };

        debug!(
            target: "Calls",
            "Received {} (call_id: {})",
            dispatch.event,
            signal.call_id()
        );
        if let Err(e) = self.manager.handle_signal(signal).await {
            warn!(target: "Calls", "Failed to apply {}: {e}", dispatch.event);
        }
        true
    }

    /// Consumes session events until the session's bus closes.
    pub fn spawn(self, mut events: broadcast::Receiver<SessionEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Dispatch(dispatch)) => {
                        self.handle(&dispatch).await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!(target: "Calls", "Call handler lagged, {missed} session events dropped");
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        })
    }
}
