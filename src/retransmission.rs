use std::net::SocketAddr;
use std::time::Duration;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::trace;
use crate::wire_header::{ChannelKind, ConnectionId, PacketKind, WireHeader};

/// A reliable datagram that was sent but not acknowledged yet. It holds the complete encoded
///  datagram so that re-sends are byte-identical, sequence id included.
#[derive(Debug, Clone)]
pub struct PendingPacket {
    pub sequence_id: u16,
    pub channel_kind: ChannelKind,
    pub connection_id: ConnectionId,
    pub hook_id: u8,
    pub packet_kind: PacketKind,
    pub datagram: Bytes,
    pub destination: SocketAddr,
    pub created_at: Instant,
}

impl PendingPacket {
    pub fn payload(&self) -> Bytes {
        self.datagram.slice(WireHeader::SERIALIZED_LEN..)
    }

    pub fn is_user_defined(&self) -> bool {
        self.packet_kind == PacketKind::UserDefined
    }
}

#[derive(Debug, Default)]
pub struct ScanResult {
    pub resend: Vec<(SocketAddr, Bytes)>,
    pub expired: Vec<PendingPacket>,
}

/// Reliable datagrams of a single connection awaiting acknowledgement
#[derive(Default)]
pub struct RetransmissionQueue {
    pending: Vec<PendingPacket>,
}

impl RetransmissionQueue {
    pub fn new() -> RetransmissionQueue {
        Default::default()
    }

    pub fn push(&mut self, packet: PendingPacket) {
        self.pending.push(packet);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Examines every pending packet exactly once. Acknowledged packets are dropped, packets older
    ///  than `resend_timeout` are dropped and returned as expired, all others are returned for
    ///  re-sending. A packet is never reported for more than one of these.
    ///
    /// ReliableOrdered packets never expire: the receiver delivers nothing past a missing id, so
    ///  giving up on one would stall the channel for good. They are re-sent until acknowledged
    ///  or until the connection goes away.
    pub fn scan(&mut self, now: Instant, resend_timeout: Duration, is_delivered: impl Fn(ChannelKind, u16) -> bool) -> ScanResult {
        let mut result = ScanResult::default();

        self.pending.retain(|p| {
            if is_delivered(p.channel_kind, p.sequence_id) {
                trace!("{:?} #{} to {} was acknowledged", p.channel_kind, p.sequence_id, p.connection_id);
                return false;
            }
            if p.channel_kind != ChannelKind::ReliableOrdered && now.saturating_duration_since(p.created_at) > resend_timeout {
                trace!("{:?} #{} to {} expired", p.channel_kind, p.sequence_id, p.connection_id);
                result.expired.push(p.clone());
                return false;
            }
            result.resend.push((p.destination, p.datagram.clone()));
            true
        });

        result
    }
}
