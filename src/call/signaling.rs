//! In-memory signaling channel
//!
//! Each endpoint holds one end of a [`SignalingLink`] pair. Messages travel as
//! JSON text, the same shape they would have on a real signaling socket, so
//! the negotiation code never relies on both endpoints living in one process.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::{error::NegotiationError, model::description::SessionDescription};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SignalMessage {
    Description { description: SessionDescription },
    /// `None` marks the end of candidate gathering.
    Candidate { candidate: Option<String> },
}

#[derive(Debug)]
pub struct SignalingLink {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

/// Two connected links: whatever one sends, the other receives.
pub fn loopback_pair() -> (SignalingLink, SignalingLink) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();

    (
        SignalingLink { tx: a_tx, rx: a_rx },
        SignalingLink { tx: b_tx, rx: b_rx },
    )
}

impl SignalingLink {
    pub fn send(&self, message: &SignalMessage) -> Result<(), NegotiationError> {
        let json = serde_json::to_string(message)?;
        self.tx.send(json).map_err(|_| NegotiationError::ChannelClosed)
    }

    /// Next message from the peer. `None` once the peer has gone away.
    /// Malformed messages are logged and skipped.
    pub async fn recv(&mut self) -> Option<SignalMessage> {
        loop {
            let json = self.rx.recv().await?;
            match serde_json::from_str(&json) {
                Ok(message) => return Some(message),
                Err(e) => warn!("Dropping malformed signaling message: {}", e),
            }
        }
    }

    /// Stops receiving. Messages the peer sends afterwards are rejected.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_cross_to_the_other_end() {
        let (a, mut b) = loopback_pair();

        let offer = SignalMessage::Description {
            description: SessionDescription::offer("v=0\r\n"),
        };
        a.send(&offer).unwrap();
        a.send(&SignalMessage::Candidate { candidate: None }).unwrap();

        assert_eq!(b.recv().await, Some(offer));
        assert_eq!(b.recv().await, Some(SignalMessage::Candidate { candidate: None }));
    }

    #[tokio::test]
    async fn send_fails_once_peer_is_closed() {
        let (a, mut b) = loopback_pair();
        b.close();

        assert!(matches!(
            a.send(&SignalMessage::Candidate { candidate: None }),
            Err(NegotiationError::ChannelClosed)
        ));
    }

    #[test]
    fn wire_format_is_tagged_json() {
        let msg = SignalMessage::Description {
            description: SessionDescription::answer("v=0"),
        };
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["type"], "description");
        assert_eq!(json["description"]["type"], "answer");
        assert_eq!(json["description"]["sdp"], "v=0");
    }
}
