use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use crate::channel::{ChannelSet, DeliveryChannel};
use crate::config::TransportConfig;
use crate::retransmission::{RetransmissionQueue, ScanResult};
use crate::wire_header::{ChannelKind, ConnectionId, PacketType};

/// The state of a connection to one peer: a channel of every kind per direction, the datagrams
///  awaiting acknowledgement, the peer's addresses and heartbeat bookkeeping.
///
/// Connections initiated locally are 'kept alive': they are never evicted for inactivity, and
///  they send heartbeats instead of waiting for them. Their datagrams are flagged as coming from
///  the client side.
pub struct Connection {
    pub connection_id: ConnectionId,
    pub keep_alive: bool,
    /// every address the peer was seen sending from, in order of appearance
    pub remote_endpoints: Vec<SocketAddr>,
    /// time of the most recent inbound datagram of any kind
    pub last_heartbeat: Instant,
    /// sequence id of the most recent heartbeat sent, until its ack yields an RTT
    pub last_heartbeat_seq: Option<u16>,
    pub last_heartbeat_sent_at: Option<Instant>,
    pub last_heartbeat_ack_at: Option<Instant>,
    pub incoming: ChannelSet,
    pub outgoing: ChannelSet,
    pub resend_queue: RetransmissionQueue,
    pub is_connected: bool,
    /// set while a locally initiated connect is waiting for its ack
    pub connect_started_at: Option<Instant>,
    /// sequence id of the Connect on the Reliable channel, until it is acknowledged
    pub connect_seq: Option<u16>,
    /// sequence id of a pending Disconnect on the Reliable channel
    pub disconnect_seq: Option<u16>,
}

impl Connection {
    pub fn new(connection_id: ConnectionId, keep_alive: bool, now: Instant, remote_addr: SocketAddr, config: &TransportConfig) -> Connection {
        Connection {
            connection_id,
            keep_alive,
            remote_endpoints: vec![remote_addr],
            last_heartbeat: now,
            last_heartbeat_seq: None,
            last_heartbeat_sent_at: None,
            last_heartbeat_ack_at: None,
            incoming: ChannelSet::new(config),
            outgoing: ChannelSet::new(config),
            resend_queue: RetransmissionQueue::new(),
            is_connected: false,
            connect_started_at: None,
            connect_seq: None,
            disconnect_seq: None,
        }
    }

    /// Registers inbound activity from `addr`
    pub fn touch(&mut self, now: Instant, addr: SocketAddr) {
        if now > self.last_heartbeat {
            self.last_heartbeat = now;
        }
        if !self.remote_endpoints.contains(&addr) {
            debug!("connection {}: new remote endpoint {}", self.connection_id, addr);
            self.remote_endpoints.push(addr);
        }
    }

    pub fn primary_endpoint(&self) -> Option<SocketAddr> {
        self.remote_endpoints.first().copied()
    }

    pub fn is_locally_initiated(&self) -> bool {
        self.keep_alive
    }

    /// the direction flag for datagrams sent on this connection
    pub fn direction(&self) -> PacketType {
        if self.is_locally_initiated() {
            PacketType::FROM_CLIENT
        }
        else {
            PacketType::FROM_SERVER
        }
    }

    pub fn is_inactive(&self, now: Instant, inactivity_timeout: Duration) -> bool {
        !self.keep_alive && now.saturating_duration_since(self.last_heartbeat) > inactivity_timeout
    }

    /// The round trip time of the most recent acknowledged heartbeat
    pub fn rtt(&self) -> Option<Duration> {
        match (self.last_heartbeat_sent_at, self.last_heartbeat_ack_at) {
            (Some(sent), Some(acked)) if acked >= sent => Some(acked - sent),
            _ => None,
        }
    }

    /// Allocates the next outgoing sequence id on a channel
    pub fn next_outgoing(&mut self, kind: ChannelKind) -> (u16, u32) {
        self.outgoing.get_mut(kind).handle_output()
    }

    pub fn scan_resends(&mut self, now: Instant, resend_timeout: Duration) -> ScanResult {
        let outgoing = &self.outgoing;
        self.resend_queue.scan(now, resend_timeout, |kind, seq| outgoing.get(kind).is_delivered(seq))
    }
}
