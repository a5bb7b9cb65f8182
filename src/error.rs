use crate::wire_header::ConnectionId;

/// Errors surfaced to callers of the transport. Conditions that are expected in steady state
///  (duplicate or stale datagrams, out-of-order arrivals) are not errors and never show up here.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("malformed header: {len} bytes, at least 25 required")]
    MalformedHeader { len: usize },
    #[error("unknown channel kind {0}")]
    UnknownChannelKind(u8),
    #[error("invalid packet type {0:#010b}")]
    InvalidPacketType(u8),
    #[error("hook id {0} is not valid for this kind of packet")]
    InvalidHookId(u8),
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("datagram of {size} bytes exceeds the MTU of {mtu} bytes")]
    OversizeDatagram { size: usize, mtu: usize },
    #[error("connection {0} has no remote endpoint")]
    NoEndpoint(ConnectionId),
    #[error("transport is shut down")]
    ShutDown,
}
