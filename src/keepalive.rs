use crate::session::{CloseReason, SessionClient};
use crate::transport::Transport;
use log::{debug, trace, warn};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

impl SessionClient {
    /// Heartbeat loop for one connection generation. Spawned on `hello`.
    ///
    /// The first heartbeat goes out immediately. On every later tick the
    /// previous heartbeat must have been acknowledged, otherwise the
    /// connection is force-closed with the heartbeat-timeout code.
    pub(crate) async fn heartbeat_loop(
        self: Arc<Self>,
        generation: u64,
        interval: Duration,
        transport: Arc<dyn Transport>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if !self.is_current(generation) {
                debug!(target: "Session/Heartbeat", "Generation {generation} retired, exiting heartbeat loop.");
                return;
            }

            if self.heartbeat_ack_pending.swap(true, Ordering::SeqCst) {
                warn!(
                    target: "Session/Heartbeat",
                    "No heartbeat ack within {interval:?}, closing connection."
                );
                self.fail_connection(
                    generation,
                    CloseReason::HeartbeatTimeout,
                    "heartbeat ack not received",
                );
                return;
            }

            trace!(target: "Session/Heartbeat", "--> heartbeat");
            self.send_heartbeat(transport.as_ref()).await;
        }
    }
}
