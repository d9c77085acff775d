pub use parley_tokio_transport::{
    TokioWebSocketTransportFactory, Transport, TransportEvent, TransportFactory,
};

#[cfg(test)]
pub mod mock {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    /// A frame the client wrote to a mock connection.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Outbound {
        Text(String),
        Close(u16, String),
    }

    impl Outbound {
        /// Decodes a text frame into an envelope; panics on close frames.
        pub fn envelope(&self) -> crate::envelope::Envelope {
            match self {
                Outbound::Text(text) => crate::envelope::Envelope::decode(text).unwrap(),
                Outbound::Close(code, _) => panic!("expected text frame, got close({code})"),
            }
        }
    }

    pub struct MockTransport {
        outbound: mpsc::UnboundedSender<Outbound>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send_text(&self, text: &str) -> Result<(), anyhow::Error> {
            self.outbound
                .send(Outbound::Text(text.to_string()))
                .map_err(|_| anyhow::anyhow!("mock peer gone"))
        }

        async fn close(&self, code: u16, reason: &str) {
            let _ = self.outbound.send(Outbound::Close(code, reason.to_string()));
        }
    }

    /// Server side of one scripted connection.
    pub struct MockServer {
        pub to_client: mpsc::Sender<TransportEvent>,
        pub from_client: mpsc::UnboundedReceiver<Outbound>,
    }

    impl MockServer {
        pub async fn push(&self, event: &str, data: serde_json::Value, seq: Option<u64>) {
            let mut env = crate::envelope::Envelope::new(event, data);
            env.seq = seq;
            self.to_client
                .send(TransportEvent::TextReceived(env.encode().unwrap()))
                .await
                .unwrap();
        }

        pub async fn close(&self, code: Option<u16>) {
            let _ = self
                .to_client
                .send(TransportEvent::Closed {
                    code,
                    reason: String::new(),
                })
                .await;
        }

        pub async fn next(&mut self) -> Outbound {
            self.from_client.recv().await.expect("client hung up")
        }

        /// Next text frame, skipping heartbeats.
        pub async fn next_non_heartbeat(&mut self) -> crate::envelope::Envelope {
            loop {
                let frame = self.next().await;
                if let Outbound::Text(_) = frame {
                    let env = frame.envelope();
                    if env.event != crate::envelope::HEARTBEAT {
                        return env;
                    }
                }
            }
        }
    }

    type Pending = (Arc<MockTransport>, mpsc::Receiver<TransportEvent>);

    /// Hands out pre-registered connections in order; fails when none remain.
    #[derive(Default)]
    pub struct MockTransportFactory {
        pending: Mutex<VecDeque<Pending>>,
        urls: Mutex<Vec<String>>,
    }

    impl MockTransportFactory {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_connection(&self) -> MockServer {
            let (to_client, rx) = mpsc::channel(64);
            let (outbound, from_client) = mpsc::unbounded_channel();
            self.pending
                .lock()
                .unwrap()
                .push_back((Arc::new(MockTransport { outbound }), rx));
            MockServer {
                to_client,
                from_client,
            }
        }

        pub fn dialed_urls(&self) -> Vec<String> {
            self.urls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TransportFactory for MockTransportFactory {
        async fn create_transport(
            &self,
            url: &str,
        ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
            self.urls.lock().unwrap().push(url.to_string());
            let (transport, rx) = self
                .pending
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("connection refused"))?;
            Ok((transport as Arc<dyn Transport>, rx))
        }
    }
}
