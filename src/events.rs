use std::net::SocketAddr;
use std::time::Duration;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::warn;
use crate::wire_header::ConnectionId;

/// Connection lifecycle transitions and payloads surfaced to the application
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TransportEvent {
    /// A connection was established: either an inbound Connect was accepted, or the peer
    ///  acknowledged a local connect
    Connected { addr: SocketAddr, id: ConnectionId },
    /// the peer acknowledged a local disconnect
    Disconnected { addr: SocketAddr, id: ConnectionId },
    HeartbeatRtt { id: ConnectionId, rtt: Duration },
    PacketReceived { id: ConnectionId, hook_id: u8, payload: Bytes },
    /// A reliable application payload was not acknowledged within the resend timeout. The
    ///  connection stays open.
    PacketExpired { id: ConnectionId, hook_id: u8, payload: Bytes },
    /// a local connect was not acknowledged in time, the connection was discarded
    ConnectionTimedOut { addr: SocketAddr, id: ConnectionId },
}

impl TransportEvent {
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            TransportEvent::Connected { id, .. } => *id,
            TransportEvent::Disconnected { id, .. } => *id,
            TransportEvent::HeartbeatRtt { id, .. } => *id,
            TransportEvent::PacketReceived { id, .. } => *id,
            TransportEvent::PacketExpired { id, .. } => *id,
            TransportEvent::ConnectionTimedOut { id, .. } => *id,
        }
    }
}

/// The application's side of the transport. Events triggered by an inbound datagram are
///  dispatched from the worker task that processed it, so events of a single connection arrive
///  in order; expiry and timeout events are dispatched from the timer task.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventDispatcher: Send + Sync + 'static {
    async fn on_event(&self, event: TransportEvent);
}

/// Forwards events into a bounded queue, applying back pressure to the transport if the
///  application does not keep up
pub struct QueueEventDispatcher {
    sender: mpsc::Sender<TransportEvent>,
}

impl QueueEventDispatcher {
    pub fn new(capacity: usize) -> (QueueEventDispatcher, mpsc::Receiver<TransportEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (QueueEventDispatcher { sender }, receiver)
    }
}

#[async_trait]
impl EventDispatcher for QueueEventDispatcher {
    async fn on_event(&self, event: TransportEvent) {
        if let Err(e) = self.sender.send(event).await {
            warn!("event receiver was dropped, discarding {:?}", e.0);
        }
    }
}
