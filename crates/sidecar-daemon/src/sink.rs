//! Outbound channel to one connected client.

use tokio::sync::mpsc;

use sidecar_core::protocol::OutboundRecord;

/// Sending half of a connection's outbound record stream.
///
/// Unbounded so that forwarding never waits on the socket, and so that
/// terminal records can be sent from `Drop`.
#[derive(Debug, Clone)]
pub struct ClientSink {
    tx: mpsc::UnboundedSender<OutboundRecord>,
}

impl ClientSink {
    /// Create a sink and the receiver the connection writer drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, record: OutboundRecord) -> Result<(), SinkError> {
        self.tx.send(record).map_err(|_| SinkError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Errors from sending to a client.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Client connection closed")]
    Closed,
}
