use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::time::Instant;
use crate::config::TransportConfig;
use crate::session::{OutgoingDatagram, SessionOutput, TransportSession};

/// convenience method for unit test code: a localhost address with a given port
pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}

/// A session together with the address it is reachable at, for exchanging datagrams between
///  sessions in memory
pub struct Peer {
    pub addr: SocketAddr,
    pub session: TransportSession,
}

impl Peer {
    pub fn new(addr: SocketAddr, config: TransportConfig) -> Peer {
        Peer {
            addr,
            session: TransportSession::new(Arc::new(config)),
        }
    }

    pub fn receive(&self, from: SocketAddr, datagram: &OutgoingDatagram, now: Instant) -> SessionOutput {
        self.session.handle_datagram(from, &datagram.datagram, now)
    }
}

/// delivers all datagrams of `output` to `to`, returning everything that produced
pub fn pump(output: &SessionOutput, to: &Peer, from: SocketAddr, now: Instant) -> SessionOutput {
    let mut result = SessionOutput::default();
    for datagram in &output.datagrams {
        let o = to.receive(from, datagram, now);
        result.datagrams.extend(o.datagrams);
        result.events.extend(o.events);
    }
    result
}
