use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};
use crate::session::OutgoingDatagram;

/// This is an abstraction for sending a datagram on a UDP socket, introduced to facilitate
///  mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]);
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) {
        trace!("UDP socket: sending {} bytes to {:?}", datagram.len(), to);

        if let Err(e) = self.send_to(datagram, to).await {
            error!("error sending UDP datagram to {:?}: {}", to, e);
        }
    }
}

/// Drains a socket's outbound queue until all senders are dropped
pub async fn send_loop(socket: Arc<dyn SendSocket>, mut outbound: mpsc::Receiver<OutgoingDatagram>) {
    debug!("starting send loop");
    while let Some(datagram) = outbound.recv().await {
        socket.send_datagram(datagram.to, &datagram.datagram).await;
    }
    debug!("send loop finished");
}
