//! Reply transmission.
use std::sync::Arc;

use log::{debug, warn};

use crate::errors::SendError;
use crate::logutil::escape_log;
use crate::meshtastic::TextTransport;
use crate::metrics;

/// Broadcasts replies over whatever transport is currently attached.
#[derive(Clone)]
pub struct OutboundSender {
    transport: Arc<dyn TextTransport>,
}

impl OutboundSender {
    pub fn new(transport: Arc<dyn TextTransport>) -> Self {
        Self { transport }
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Send once to all nodes. No retry.
    pub async fn broadcast(&self, text: &str) -> Result<(), SendError> {
        if !self.transport.is_connected() {
            warn!("Cannot send message: not connected to Meshtastic device");
            metrics::inc_send_failures();
            return Err(SendError::NotConnected);
        }
        match self.transport.send_text(text).await {
            Ok(()) => {
                metrics::inc_replies_sent();
                debug!("Broadcast {} chars: '{}'", text.chars().count(), escape_log(text));
                Ok(())
            }
            Err(e) => {
                metrics::inc_send_failures();
                warn!("Broadcast failed: {}", e);
                Err(SendError::TransmitFailure(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransportError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct Loopback {
        up: AtomicBool,
        fail: bool,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TextTransport for Loopback {
        fn is_connected(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }
        async fn send_text(&self, text: &str) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::Write("radio busy".into()));
            }
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn loopback(up: bool, fail: bool) -> Arc<Loopback> {
        Arc::new(Loopback {
            up: AtomicBool::new(up),
            fail,
            sent: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn sends_to_broadcast_destination() {
        let t = loopback(true, false);
        let sender = OutboundSender::new(t.clone());
        sender.broadcast("hi all").await.unwrap();
        let sent = t.sent.lock().unwrap();
        assert_eq!(sent.as_slice(), &["hi all".to_string()]);
    }

    #[tokio::test]
    async fn disconnected_transport_sends_nothing() {
        let t = loopback(false, false);
        let sender = OutboundSender::new(t.clone());
        assert_eq!(sender.broadcast("x").await, Err(SendError::NotConnected));
        assert!(t.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transport_failure_is_reported() {
        let sender = OutboundSender::new(loopback(true, true));
        assert!(matches!(
            sender.broadcast("x").await,
            Err(SendError::TransmitFailure(reason)) if reason.contains("radio busy")
        ));
    }
}
