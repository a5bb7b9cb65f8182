//! A connection-oriented transport on top of plain UDP sockets, built for real-time client /
//!  server messaging (typically game networking). Each connection multiplexes four delivery
//!  policies ('channels') over a single socket pair:
//!
//! * **Raw**: fire and forget, every datagram that arrives is delivered
//! * **Sequenced**: latest wins - duplicates and anything older than the newest received
//!    datagram are dropped (e.g. position updates)
//! * **Reliable**: acknowledged and re-sent until acknowledged or expired, delivered in arrival
//!    order, exactly once
//! * **ReliableOrdered**: like Reliable, but delivered strictly in send order. Datagrams that
//!    arrive ahead of a gap are neither delivered nor acknowledged, so the sender's resend logic
//!    fills the gap and the rest follows in order
//!
//! On top of that there is a small connection lifecycle: an explicit Connect handshake,
//!  heartbeats with RTT measurement, explicit Disconnect, and eviction of connections that
//!  have been silent for too long.
//!
//! There is no congestion control, encryption or NAT traversal, and no fragmentation:
//!  datagrams exceeding the configured MTU are rejected rather than split.
//!
//! ## Header
//!
//! Every datagram starts with a fixed 25 byte header, all numbers in network byte order (BE):
//! ```ascii
//!  0: hook id (u8) - application routing key, or the kind of protocol packet:
//!      0 Connect, 1 Disconnect, 2 Heartbeat, 3 Ping, 4 Pong, 5 P2P; application hook ids
//!      start at 8
//!  1: channel kind (u8): 0 Raw, 1 Sequenced, 2 Reliable, 3 ReliableOrdered
//!  2: packet type (u8 flags):
//!     * bit 0: sent by the connecting side ('client')
//!     * bit 1: protocol packet (kind determined by the hook id)
//!     * bit 2: acknowledgement
//!     * bit 3: sent by the accepting side ('server')
//!  3: connection id (u128) - opaque, generated by the connecting side, UUID compatible
//! 19: sequence id (u16) - per channel and direction, wrapping
//! 21: ack bitmask (u32) - bit n acknowledges sequence id (sequence id - 1 - n)
//! 25: payload (remaining bytes)
//! ```
//!
//! Acknowledgements are header-only datagrams carrying the acknowledged sequence id and a
//!  bitmask of the 32 ids preceding it, so a single ack can make up for up to 32 lost ones.
//!
//! ## Structure
//!
//! [`session::TransportSession`] is the protocol state machine; it is synchronous and gets the
//!  current time passed in, returning datagrams to send and events to surface.
//!  [`end_point::EndPoint`] owns the sockets and runs it: a receive loop and a send loop per
//!  socket, a pool of workers processing inbound datagrams (connections are pinned to workers),
//!  and timers for retransmission, heartbeats and eviction.

pub mod config;
pub mod error;
pub mod wire_header;
pub mod sequence_window;
pub mod channel;
pub mod retransmission;
pub mod connection;
pub mod connection_pool;
pub mod events;
pub mod session;
pub mod socket;
pub mod end_point;

#[cfg(test)]
mod test_util;
