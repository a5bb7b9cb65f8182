use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, trace_span, warn};
use crate::channel::{DeliveryChannel, InputOutcome};
use crate::config::TransportConfig;
use crate::connection::Connection;
use crate::connection_pool::{lock_connection, ConnectionPool};
use crate::error::TransportError;
use crate::events::TransportEvent;
use crate::retransmission::{PendingPacket, ScanResult};
use crate::wire_header::{ChannelKind, ConnectionId, PacketKind, ProtocolHookId, WireHeader};

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OutgoingDatagram {
    pub to: SocketAddr,
    pub datagram: Bytes,
}

/// What processing an inbound datagram or a timer tick produced: datagrams to send and events
///  to dispatch to the application
#[derive(Debug, Default)]
pub struct SessionOutput {
    pub datagrams: Vec<OutgoingDatagram>,
    pub events: Vec<TransportEvent>,
}

impl SessionOutput {
    fn add_scan_result(&mut self, connection_id: ConnectionId, scan: ScanResult) {
        for (to, datagram) in scan.resend {
            self.datagrams.push(OutgoingDatagram { to, datagram });
        }
        for expired in scan.expired {
            if expired.is_user_defined() {
                debug!("reliable packet #{} on {:?} to {} expired", expired.sequence_id, expired.channel_kind, connection_id);
                self.events.push(TransportEvent::PacketExpired {
                    id: connection_id,
                    hook_id: expired.hook_id,
                    payload: expired.payload(),
                });
            }
            else {
                debug!("{:?} to {} expired", expired.packet_kind, connection_id);
            }
        }
    }
}

fn encode(header: &WireHeader, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(WireHeader::SERIALIZED_LEN + payload.len());
    header.ser(&mut buf);
    buf.put_slice(payload);
    buf.freeze()
}

/// The protocol state machine. It owns the connection pool and turns inbound datagrams, sends
///  and timer ticks into outbound datagrams and application events.
///
/// The session does no I/O and reads no clock: the caller passes in the current time. All
///  methods take `&self` and may be called concurrently; per-connection state is serialized by
///  the connection's lock.
pub struct TransportSession {
    config: Arc<TransportConfig>,
    pool: ConnectionPool,
}

impl TransportSession {
    pub fn new(config: Arc<TransportConfig>) -> TransportSession {
        TransportSession {
            pool: ConnectionPool::new(config.clone()),
            config,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    fn check_mtu(&self, payload_len: usize) -> Result<(), TransportError> {
        if payload_len > self.config.max_payload_len() {
            let size = WireHeader::SERIALIZED_LEN + payload_len;
            error!("datagram of {} bytes exceeds the MTU of {} bytes - not sending", size, self.config.mtu);
            return Err(TransportError::OversizeDatagram { size, mtu: self.config.mtu });
        }
        Ok(())
    }

    /// stamps, encodes and optionally registers a protocol datagram for retransmission, returning
    ///  the sequence id it was stamped with
    fn protocol_datagram(conn: &mut Connection, hook: ProtocolHookId, kind: ChannelKind, payload: &[u8], to: SocketAddr, now: Instant, resend: bool) -> (u16, OutgoingDatagram) {
        let (seq, acks) = conn.next_outgoing(kind);
        let header = WireHeader::new_protocol(hook, kind, conn.direction(), conn.connection_id, seq, acks);
        trace!("sending {:?} to {}", header, to);
        let datagram = encode(&header, payload);

        if resend {
            conn.resend_queue.push(PendingPacket {
                sequence_id: seq,
                channel_kind: kind,
                connection_id: conn.connection_id,
                hook_id: header.hook_id,
                packet_kind: PacketKind::Protocol(hook),
                datagram: datagram.clone(),
                destination: to,
                created_at: now,
            });
        }
        (seq, OutgoingDatagram { to, datagram })
    }

    /// Runs a connection's resend scan. Returns `true` if the connection should be removed: a
    ///  Disconnect that expired without an ack means the peer is gone or dropped the connection
    ///  already.
    fn scan_connection(&self, conn: &mut Connection, now: Instant, output: &mut SessionOutput) -> bool {
        let scan = conn.scan_resends(now, self.config.resend_timeout);
        let disconnect_expired = scan.expired.iter()
            .find(|p| p.packet_kind == PacketKind::Protocol(ProtocolHookId::Disconnect))
            .map(|p| p.destination);
        output.add_scan_result(conn.connection_id, scan);

        if let Some(addr) = disconnect_expired {
            info!("disconnect of {} was not acknowledged - closing the connection", conn.connection_id);
            conn.is_connected = false;
            conn.disconnect_seq = None;
            output.events.push(TransportEvent::Disconnected { addr, id: conn.connection_id });
            return true;
        }
        false
    }

    /// Lifecycle transitions waiting for a protocol datagram on the Reliable channel to be
    ///  acknowledged. The ack may come on its own or as a bit in a later ack's bitmask, so this
    ///  runs after every ack. Returns `true` if the connection should be removed.
    fn on_acknowledged(conn: &mut Connection, from: SocketAddr, now: Instant, output: &mut SessionOutput) -> bool {
        let reliable = conn.outgoing.get(ChannelKind::Reliable);
        let is_acked = |seq: Option<u16>| seq.map_or(false, |seq| reliable.is_delivered(seq));
        let connect_acked = is_acked(conn.connect_seq);
        let heartbeat_acked = is_acked(conn.last_heartbeat_seq);
        let disconnect_acked = is_acked(conn.disconnect_seq);

        if connect_acked {
            conn.connect_seq = None;
            conn.connect_started_at = None;
            if !conn.is_connected {
                info!("connection {} to {} established", conn.connection_id, from);
                conn.is_connected = true;
                output.events.push(TransportEvent::Connected { addr: from, id: conn.connection_id });
            }
        }
        if heartbeat_acked {
            conn.last_heartbeat_seq = None;
            conn.last_heartbeat_ack_at = Some(now);
            if let Some(rtt) = conn.rtt() {
                trace!("heartbeat RTT for {}: {:?}", conn.connection_id, rtt);
                output.events.push(TransportEvent::HeartbeatRtt { id: conn.connection_id, rtt });
            }
        }
        if disconnect_acked {
            info!("connection {} to {} closed", conn.connection_id, from);
            conn.disconnect_seq = None;
            conn.is_connected = false;
            output.events.push(TransportEvent::Disconnected { addr: from, id: conn.connection_id });
            return true;
        }
        false
    }

    /// the header-only acknowledgement of an inbound datagram, sent back to where it came from
    fn ack_datagram(conn: &Connection, header: &WireHeader, to: SocketAddr) -> OutgoingDatagram {
        let ack_bitmask = conn.incoming.get(header.channel_kind).ack_bitmask_for(header.sequence_id);
        let ack_header = header.ack(conn.direction(), ack_bitmask);
        trace!("acknowledging with {:?}", ack_header);
        OutgoingDatagram {
            to,
            datagram: encode(&ack_header, &[]),
        }
    }

    /// Processes an inbound datagram. Malformed datagrams and datagrams for unknown connections
    ///  are logged and dropped.
    pub fn handle_datagram(&self, from: SocketAddr, datagram: &[u8], now: Instant) -> SessionOutput {
        let span = trace_span!("datagram", %from);
        let _entered = span.enter();

        let mut output = SessionOutput::default();

        let mut buf = datagram;
        let header = match WireHeader::deser(&mut buf) {
            Ok(header) => header,
            Err(e) => {
                warn!("dropping datagram from {}: {}", from, e);
                return output;
            }
        };
        let payload = buf;

        let packet_kind = match header.packet_kind() {
            Ok(kind) => kind,
            Err(e) => {
                warn!("dropping datagram from {}: {}", from, e);
                return output;
            }
        };
        trace!("received {:?} with {} payload bytes", header, payload.len());

        let is_connect = packet_kind == PacketKind::Protocol(ProtocolHookId::Connect) && !header.is_ack();
        let connection = if is_connect {
            if !self.config.allow_incoming_connections {
                warn!("incoming connections are disabled - ignoring connect for {} from {}", header.connection_id, from);
                return output;
            }
            self.pool.get_or_create(header.connection_id, false, now, from).0
        }
        else {
            match self.pool.get(&header.connection_id) {
                Some(connection) => connection,
                None => {
                    debug!("dropping datagram from {} for unknown connection {}", from, header.connection_id);
                    return output;
                }
            }
        };

        let remove = {
            let mut conn = lock_connection(&connection);
            conn.touch(now, from);
            self.dispatch(&mut conn, &header, packet_kind, payload, from, now, &mut output)
        };
        if remove {
            self.pool.remove(&header.connection_id);
        }

        output
    }

    /// returns `true` if the connection should be removed
    fn dispatch(&self, conn: &mut Connection, header: &WireHeader, packet_kind: PacketKind, payload: &[u8], from: SocketAddr, now: Instant, output: &mut SessionOutput) -> bool {
        let connection_id = header.connection_id;

        if header.is_ack() {
            let newly_acked = conn.outgoing.get_mut(header.channel_kind).handle_ack(header.sequence_id, header.ack_bitmask);
            trace!("ack for {:?} #{} on {:?}: {}", packet_kind, header.sequence_id, header.channel_kind, newly_acked);
            return Self::on_acknowledged(conn, from, now, output);
        }

        match packet_kind {
            PacketKind::Protocol(ProtocolHookId::Connect) => {
                let outcome = conn.incoming.get_mut(header.channel_kind).handle_input_outcome(header.sequence_id);
                if outcome == InputOutcome::Deliver {
                    info!("accepted connection {} from {}", connection_id, from);
                    conn.is_connected = true;
                    output.events.push(TransportEvent::Connected { addr: from, id: connection_id });
                }
                if outcome != InputOutcome::Deferred {
                    output.datagrams.push(Self::ack_datagram(conn, header, from));
                }
            }
            PacketKind::Protocol(ProtocolHookId::Heartbeat) => {
                let outcome = conn.incoming.get_mut(header.channel_kind).handle_input_outcome(header.sequence_id);
                if outcome != InputOutcome::Deferred {
                    output.datagrams.push(Self::ack_datagram(conn, header, from));
                }
                return self.scan_connection(conn, now, output);
            }
            PacketKind::Protocol(ProtocolHookId::Disconnect) => {
                let outcome = conn.incoming.get_mut(header.channel_kind).handle_input_outcome(header.sequence_id);
                if outcome != InputOutcome::Deferred {
                    output.datagrams.push(Self::ack_datagram(conn, header, from));
                }
                if outcome == InputOutcome::Deliver {
                    info!("peer closed connection {}", connection_id);
                    conn.is_connected = false;
                    return true;
                }
            }
            PacketKind::Protocol(ProtocolHookId::Ping) => {
                if self.check_mtu(payload.len()).is_ok() {
                    output.datagrams.push(Self::protocol_datagram(conn, ProtocolHookId::Pong, ChannelKind::Raw, payload, from, now, false).1);
                }
            }
            PacketKind::Protocol(ProtocolHookId::Pong) => {
                trace!("pong from {} with {} bytes", from, payload.len());
            }
            PacketKind::Protocol(ProtocolHookId::P2P) => {
                debug!("peer-to-peer packets are not supported - dropping");
            }
            PacketKind::UserDefined => {
                let channel = conn.incoming.get_mut(header.channel_kind);
                let outcome = channel.handle_input_outcome(header.sequence_id);
                trace!("#{} on {:?}: {:?}", header.sequence_id, header.channel_kind, outcome);

                if outcome == InputOutcome::Deliver {
                    output.events.push(TransportEvent::PacketReceived {
                        id: connection_id,
                        hook_id: header.hook_id,
                        payload: Bytes::copy_from_slice(payload),
                    });
                }
                if header.channel_kind.is_reliable() && outcome != InputOutcome::Deferred {
                    output.datagrams.push(Self::ack_datagram(conn, header, from));
                }
            }
        }
        false
    }

    /// Sends an application payload on a connection's channel. The datagram goes to
    ///  `destination` if given, to the connection's primary endpoint otherwise. Reliable
    ///  datagrams are registered for retransmission.
    pub fn send(&self, connection_id: ConnectionId, kind: ChannelKind, hook_id: u8, payload: &[u8], destination: Option<SocketAddr>, now: Instant) -> Result<OutgoingDatagram, TransportError> {
        if hook_id < ProtocolHookId::MIN_USER_HOOK_ID {
            return Err(TransportError::InvalidHookId(hook_id));
        }
        self.check_mtu(payload.len())?;

        let connection = self.pool.get(&connection_id)
            .ok_or(TransportError::UnknownConnection(connection_id))?;
        let mut conn = lock_connection(&connection);
        let to = destination
            .or(conn.primary_endpoint())
            .ok_or(TransportError::NoEndpoint(connection_id))?;

        let (seq, acks) = conn.next_outgoing(kind);
        let header = WireHeader::new_user(hook_id, kind, conn.direction(), connection_id, seq, acks);
        trace!("sending {:?} with {} payload bytes to {}", header, payload.len(), to);
        let datagram = encode(&header, payload);

        if kind.is_reliable() {
            conn.resend_queue.push(PendingPacket {
                sequence_id: seq,
                channel_kind: kind,
                connection_id,
                hook_id,
                packet_kind: PacketKind::UserDefined,
                datagram: datagram.clone(),
                destination: to,
                created_at: now,
            });
        }
        Ok(OutgoingDatagram { to, datagram })
    }

    /// Sends the same payload to several connections, e.g. the members of a group. Failures for
    ///  individual recipients are logged and counted, the returned datagrams are those that
    ///  could be stamped.
    pub fn send_to_many(&self, connection_ids: &[ConnectionId], kind: ChannelKind, hook_id: u8, payload: &[u8], now: Instant) -> (Vec<OutgoingDatagram>, usize) {
        let mut datagrams = Vec::with_capacity(connection_ids.len());
        let mut num_failed = 0;
        for &connection_id in connection_ids {
            match self.send(connection_id, kind, hook_id, payload, None, now) {
                Ok(datagram) => datagrams.push(datagram),
                Err(e) => {
                    warn!("broadcast to {} failed: {}", connection_id, e);
                    num_failed += 1;
                }
            }
        }
        (datagrams, num_failed)
    }

    /// Starts a connection to a remote end point, returning the new connection's id and the
    ///  Connect datagram
    pub fn connect(&self, remote_addr: SocketAddr, now: Instant) -> (ConnectionId, OutgoingDatagram) {
        let connection_id = ConnectionId::new_random();
        info!("connecting to {} as {}", remote_addr, connection_id);

        let (connection, _) = self.pool.get_or_create(connection_id, true, now, remote_addr);
        let mut conn = lock_connection(&connection);
        conn.connect_started_at = Some(now);
        let (seq, datagram) = Self::protocol_datagram(&mut conn, ProtocolHookId::Connect, ChannelKind::Reliable, &[], remote_addr, now, true);
        conn.connect_seq = Some(seq);
        (connection_id, datagram)
    }

    /// Asks the peer to close a connection. The connection is removed when the peer acknowledges,
    ///  or when the Disconnect expires unacknowledged.
    pub fn disconnect(&self, connection_id: ConnectionId, now: Instant) -> Result<OutgoingDatagram, TransportError> {
        let connection = self.pool.get(&connection_id)
            .ok_or(TransportError::UnknownConnection(connection_id))?;
        let mut conn = lock_connection(&connection);
        let to = conn.primary_endpoint()
            .ok_or(TransportError::NoEndpoint(connection_id))?;

        debug!("disconnecting {}", connection_id);
        let (seq, datagram) = Self::protocol_datagram(&mut conn, ProtocolHookId::Disconnect, ChannelKind::Reliable, &[], to, now, true);
        conn.disconnect_seq = Some(seq);
        Ok(datagram)
    }

    /// Sends a heartbeat on a connection and runs its resend scan
    pub fn heartbeat(&self, connection_id: ConnectionId, now: Instant) -> Result<SessionOutput, TransportError> {
        let connection = self.pool.get(&connection_id)
            .ok_or(TransportError::UnknownConnection(connection_id))?;

        let mut output = SessionOutput::default();
        let remove = {
            let mut conn = lock_connection(&connection);
            let to = conn.primary_endpoint()
                .ok_or(TransportError::NoEndpoint(connection_id))?;

            let (seq, datagram) = Self::protocol_datagram(&mut conn, ProtocolHookId::Heartbeat, ChannelKind::Reliable, &[], to, now, false);
            conn.last_heartbeat_seq = Some(seq);
            conn.last_heartbeat_sent_at = Some(now);
            output.datagrams.push(datagram);

            self.scan_connection(&mut conn, now, &mut output)
        };
        if remove {
            self.pool.remove(&connection_id);
        }
        Ok(output)
    }

    /// Heartbeats for all established connections that were initiated locally
    pub fn heartbeat_all(&self, now: Instant) -> SessionOutput {
        let mut output = SessionOutput::default();
        for (connection_id, connection) in self.pool.snapshot().iter() {
            let eligible = {
                let conn = lock_connection(connection);
                conn.is_connected && conn.is_locally_initiated()
            };
            if !eligible {
                continue;
            }
            match self.heartbeat(*connection_id, now) {
                Ok(o) => {
                    output.datagrams.extend(o.datagrams);
                    output.events.extend(o.events);
                }
                Err(e) => debug!("no heartbeat for {}: {}", connection_id, e),
            }
        }
        output
    }

    /// Runs the resend scan for all connections, and gives up on connect attempts that were not
    ///  acknowledged within the connection timeout
    pub fn tick(&self, now: Instant) -> SessionOutput {
        let mut output = SessionOutput::default();
        let mut timed_out = Vec::new();
        let mut closed = Vec::new();

        for (connection_id, connection) in self.pool.snapshot().iter() {
            let mut conn = lock_connection(connection);

            if let Some(started_at) = conn.connect_started_at {
                if now.saturating_duration_since(started_at) > self.config.connection_timeout {
                    timed_out.push((*connection_id, conn.primary_endpoint()));
                    continue;
                }
            }

            if self.scan_connection(&mut conn, now, &mut output) {
                closed.push(*connection_id);
            }
        }

        for connection_id in closed {
            self.pool.remove(&connection_id);
        }

        for (connection_id, addr) in timed_out {
            warn!("connect attempt {} timed out", connection_id);
            if self.pool.remove(&connection_id).is_some() {
                if let Some(addr) = addr {
                    output.events.push(TransportEvent::ConnectionTimedOut { addr, id: connection_id });
                }
            }
        }
        output
    }

    /// Evicts inactive connections, returning their ids
    pub fn sweep(&self, now: Instant) -> Vec<ConnectionId> {
        self.pool.sweep(now, self.config.inactivity_timeout)
            .into_iter()
            .map(|(connection_id, addrs)| {
                info!("evicted inactive connection {} ({:?})", connection_id, addrs);
                connection_id
            })
            .collect()
    }

    pub fn is_connected(&self, connection_id: &ConnectionId) -> bool {
        self.pool.get(connection_id)
            .map(|connection| lock_connection(&connection).is_connected)
            .unwrap_or(false)
    }

    pub fn rtt(&self, connection_id: &ConnectionId) -> Option<Duration> {
        self.pool.get(connection_id)
            .and_then(|connection| lock_connection(&connection).rtt())
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.pool.ids()
    }

    /// Drops all connections, returning how many there were
    pub fn clear(&self) -> usize {
        self.pool.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use crate::test_util::{addr, pump, Peer};
    use crate::wire_header::PacketType;

    fn connected_pair(now: Instant) -> (Peer, Peer, ConnectionId) {
        let client = Peer::new(addr(1000), TransportConfig::default_ipv4());
        let server = Peer::new(addr(2000), TransportConfig::default_ipv4());

        let (id, connect) = client.session.connect(server.addr, now);
        let server_output = server.receive(client.addr, &connect, now);
        let client_output = pump(&server_output, &client, server.addr, now);
        assert!(client_output.events.contains(&TransportEvent::Connected { addr: server.addr, id }));
        (client, server, id)
    }

    #[test]
    fn test_connect_handshake() {
        let now = Instant::now();
        let client = Peer::new(addr(1000), TransportConfig::default_ipv4());
        let server = Peer::new(addr(2000), TransportConfig::default_ipv4());

        let (id, connect) = client.session.connect(server.addr, now);
        assert_eq!(connect.to, server.addr);
        assert!(!client.session.is_connected(&id));

        let server_output = server.receive(client.addr, &connect, now);
        assert_eq!(server_output.events, vec![TransportEvent::Connected { addr: client.addr, id }]);
        assert_eq!(server_output.datagrams.len(), 1);
        assert!(server.session.is_connected(&id));

        let mut ack = server_output.datagrams[0].datagram.as_ref();
        let ack_header = WireHeader::deser(&mut ack).unwrap();
        assert_eq!(ack_header.packet_type, PacketType::PROTOCOL | PacketType::ACK | PacketType::FROM_SERVER);
        assert_eq!(ack_header.hook_id, u8::from(ProtocolHookId::Connect));

        let client_output = pump(&server_output, &client, server.addr, now);
        assert_eq!(client_output.events, vec![TransportEvent::Connected { addr: server.addr, id }]);
        assert!(client.session.is_connected(&id));

        // the connect is acknowledged, so it is neither re-sent nor reported as expired
        let tick = client.session.tick(now + Duration::from_secs(10));
        assert!(tick.datagrams.is_empty());
        assert!(tick.events.is_empty());
    }

    #[test]
    fn test_connect_incoming_disabled() {
        let now = Instant::now();
        let client = Peer::new(addr(1000), TransportConfig::default_ipv4());
        let mut config = TransportConfig::default_ipv4();
        config.allow_incoming_connections = false;
        let server = Peer::new(addr(2000), config);

        let (id, connect) = client.session.connect(server.addr, now);
        let output = server.receive(client.addr, &connect, now);

        assert!(output.datagrams.is_empty());
        assert!(output.events.is_empty());
        assert!(server.session.connection_ids().is_empty());
        assert!(!server.session.is_connected(&id));
    }

    #[test]
    fn test_connect_duplicate_is_acked_once_delivered() {
        let now = Instant::now();
        let client = Peer::new(addr(1000), TransportConfig::default_ipv4());
        let server = Peer::new(addr(2000), TransportConfig::default_ipv4());

        let (_, connect) = client.session.connect(server.addr, now);
        let first = server.receive(client.addr, &connect, now);
        let second = server.receive(client.addr, &connect, now);

        assert_eq!(first.events.len(), 1);
        assert!(second.events.is_empty());
        assert_eq!(second.datagrams.len(), 1);
    }

    #[test]
    fn test_connect_timeout() {
        let now = Instant::now();
        let client = Peer::new(addr(1000), TransportConfig::default_ipv4());
        let (id, _) = client.session.connect(addr(2000), now);

        let output = client.session.tick(now + Duration::from_secs(1));
        assert_eq!(output.datagrams.len(), 1, "connect is re-sent");
        assert!(output.events.is_empty());

        let output = client.session.tick(now + Duration::from_secs(6));
        assert_eq!(output.events, vec![TransportEvent::ConnectionTimedOut { addr: addr(2000), id }]);
        assert!(client.session.connection_ids().is_empty());

        let output = client.session.tick(now + Duration::from_secs(7));
        assert!(output.events.is_empty());
        assert!(output.datagrams.is_empty());
    }

    #[test]
    fn test_unknown_connection_dropped() {
        let now = Instant::now();
        let (client, _, id) = connected_pair(now);
        let other = Peer::new(addr(3000), TransportConfig::default_ipv4());

        let datagram = client.session.send(id, ChannelKind::Reliable, 8, b"hi", Some(other.addr), now).unwrap();
        let output = other.receive(client.addr, &datagram, now);
        assert!(output.datagrams.is_empty());
        assert!(output.events.is_empty());
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::short(vec![0; 24])]
    #[case::unknown_channel_kind({ let mut d = vec![0; 25]; d[1] = 7; d })]
    #[case::unknown_packet_type({ let mut d = vec![0; 25]; d[2] = 0x80; d })]
    #[case::reserved_user_hook({ let mut d = vec![0; 25]; d[2] = 1; d })]
    fn test_malformed_dropped(#[case] datagram: Vec<u8>) {
        let server = Peer::new(addr(2000), TransportConfig::default_ipv4());
        let output = server.session.handle_datagram(addr(1000), &datagram, Instant::now());
        assert!(output.datagrams.is_empty());
        assert!(output.events.is_empty());
        assert!(server.session.connection_ids().is_empty());
    }

    #[test]
    fn test_reliable_delivered_once_and_acked() {
        let now = Instant::now();
        let (client, server, id) = connected_pair(now);

        let datagram = client.session.send(id, ChannelKind::Reliable, 9, b"payload", None, now).unwrap();
        assert_eq!(datagram.to, server.addr);

        let mut num_received = 0;
        for _ in 0..3 {
            let output = server.receive(client.addr, &datagram, now);
            num_received += output.events.iter()
                .filter(|e| matches!(e, TransportEvent::PacketReceived { hook_id: 9, payload, .. } if payload.as_ref() == b"payload"))
                .count();
            assert_eq!(output.datagrams.len(), 1, "every copy is acked");
            pump(&output, &client, server.addr, now);
        }
        assert_eq!(num_received, 1);

        let tick = client.session.tick(now + Duration::from_secs(10));
        assert!(tick.datagrams.is_empty());
        assert!(tick.events.is_empty());
    }

    #[test]
    fn test_reliable_resent_until_acked() {
        let now = Instant::now();
        let (client, server, id) = connected_pair(now);

        let datagram = client.session.send(id, ChannelKind::Reliable, 9, b"x", None, now).unwrap();

        let tick = client.session.tick(now + Duration::from_secs(1));
        assert_eq!(tick.datagrams, vec![datagram.clone()]);

        let output = server.receive(client.addr, &tick.datagrams[0], now);
        pump(&output, &client, server.addr, now);

        let tick = client.session.tick(now + Duration::from_secs(2));
        assert!(tick.datagrams.is_empty());
    }

    #[test]
    fn test_reliable_expires() {
        let now = Instant::now();
        let (client, _, id) = connected_pair(now);

        client.session.send(id, ChannelKind::Reliable, 9, b"lost", None, now).unwrap();

        let output = client.session.tick(now + Duration::from_secs(6));
        assert!(output.datagrams.is_empty());
        assert_eq!(output.events, vec![TransportEvent::PacketExpired { id, hook_id: 9, payload: Bytes::from_static(b"lost") }]);

        let output = client.session.tick(now + Duration::from_secs(7));
        assert!(output.datagrams.is_empty());
        assert!(output.events.is_empty());
        assert!(client.session.is_connected(&id));
    }

    #[rstest]
    #[case::raw(ChannelKind::Raw, false)]
    #[case::sequenced(ChannelKind::Sequenced, false)]
    #[case::reliable(ChannelKind::Reliable, true)]
    #[case::reliable_ordered(ChannelKind::ReliableOrdered, true)]
    fn test_only_reliable_is_acked(#[case] kind: ChannelKind, #[case] acked: bool) {
        let now = Instant::now();
        let (client, server, id) = connected_pair(now);

        let datagram = client.session.send(id, kind, 9, b"x", None, now).unwrap();
        let output = server.receive(client.addr, &datagram, now);
        assert_eq!(output.events.len(), 1);
        assert_eq!(output.datagrams.len(), if acked { 1 } else { 0 });

        let tick = client.session.tick(now + Duration::from_secs(1));
        assert_eq!(tick.datagrams.len(), if acked { 1 } else { 0 }, "unacked reliable datagrams are re-sent");
    }

    #[test]
    fn test_reliable_ordered_restores_order() {
        let now = Instant::now();
        let (client, server, id) = connected_pair(now);

        let datagrams = (0..3u8)
            .map(|i| client.session.send(id, ChannelKind::ReliableOrdered, 9, &[i], None, now).unwrap())
            .collect::<Vec<_>>();

        let mut received = Vec::new();
        for d in [&datagrams[2], &datagrams[0], &datagrams[1]] {
            let output = server.receive(client.addr, d, now);
            received.extend(payloads(&output));
            pump(&output, &client, server.addr, now);
        }
        assert_eq!(received, vec![0, 1]);

        let tick = client.session.tick(now + Duration::from_millis(100));
        assert_eq!(tick.datagrams, vec![datagrams[2].clone()]);
        let output = server.receive(client.addr, &tick.datagrams[0], now);
        received.extend(payloads(&output));
        assert_eq!(received, vec![0, 1, 2]);
    }

    #[test]
    fn test_reliable_delivers_in_arrival_order() {
        let now = Instant::now();
        let (client, server, id) = connected_pair(now);

        let datagrams = (0..3u8)
            .map(|i| client.session.send(id, ChannelKind::Reliable, 9, &[i], None, now).unwrap())
            .collect::<Vec<_>>();

        let mut received = Vec::new();
        for d in [&datagrams[2], &datagrams[0], &datagrams[1]] {
            received.extend(payloads(&server.receive(client.addr, d, now)));
        }
        assert_eq!(received, vec![2, 0, 1]);
    }

    fn payloads(output: &SessionOutput) -> Vec<u8> {
        output.events.iter()
            .filter_map(|e| match e {
                TransportEvent::PacketReceived { payload, .. } => Some(payload[0]),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_send_errors() {
        let now = Instant::now();
        let (client, _, id) = connected_pair(now);

        assert_eq!(
            client.session.send(id, ChannelKind::Raw, 3, b"", None, now),
            Err(TransportError::InvalidHookId(3)),
        );
        assert_eq!(
            client.session.send(id, ChannelKind::Raw, 8, &[0; 1448], None, now),
            Err(TransportError::OversizeDatagram { size: 1473, mtu: 1472 }),
        );
        assert!(client.session.send(id, ChannelKind::Raw, 8, &[0; 1447], None, now).is_ok());

        let unknown = ConnectionId::from_raw(12345);
        assert_eq!(
            client.session.send(unknown, ChannelKind::Raw, 8, b"", None, now),
            Err(TransportError::UnknownConnection(unknown)),
        );
    }

    #[test]
    fn test_send_to_many() {
        let now = Instant::now();
        let (client, _, id) = connected_pair(now);

        let (datagrams, num_failed) = client.session.send_to_many(&[id, ConnectionId::from_raw(1)], ChannelKind::Sequenced, 8, b"all", now);
        assert_eq!(datagrams.len(), 1);
        assert_eq!(num_failed, 1);
    }

    #[test]
    fn test_heartbeat_rtt() {
        let now = Instant::now();
        let (client, server, id) = connected_pair(now);

        let output = client.session.heartbeat(id, now).unwrap();
        assert_eq!(output.datagrams.len(), 1);

        let later = now + Duration::from_millis(30);
        let server_output = server.receive(client.addr, &output.datagrams[0], later);
        assert_eq!(server_output.datagrams.len(), 1);
        assert!(server_output.events.is_empty());

        let client_output = pump(&server_output, &client, server.addr, later);
        assert_eq!(client_output.events, vec![TransportEvent::HeartbeatRtt { id, rtt: Duration::from_millis(30) }]);
        assert_eq!(client.session.rtt(&id), Some(Duration::from_millis(30)));
    }

    #[test]
    fn test_heartbeat_all_skips_accepted_connections() {
        let now = Instant::now();
        let (client, server, _) = connected_pair(now);

        assert_eq!(client.session.heartbeat_all(now).datagrams.len(), 1);
        assert!(server.session.heartbeat_all(now).datagrams.is_empty());
    }

    #[test]
    fn test_heartbeat_keeps_connection_alive() {
        let now = Instant::now();
        let (client, server, id) = connected_pair(now);

        let later = now + Duration::from_secs(25);
        let heartbeat = client.session.heartbeat(id, later).unwrap();
        server.receive(client.addr, &heartbeat.datagrams[0], later);

        assert!(server.session.sweep(now + Duration::from_secs(40)).is_empty());
        assert_eq!(server.session.sweep(now + Duration::from_secs(60)), vec![id]);
    }

    #[test]
    fn test_sweep_evicts_inactive() {
        let now = Instant::now();
        let (client, server, id) = connected_pair(now);

        assert!(server.session.sweep(now + Duration::from_secs(30)).is_empty());
        assert_eq!(server.session.sweep(now + Duration::from_secs(31)), vec![id]);
        assert_eq!(
            server.session.send(id, ChannelKind::Reliable, 8, b"", None, now),
            Err(TransportError::UnknownConnection(id)),
        );

        // the client's own connection is kept alive
        assert!(client.session.sweep(now + Duration::from_secs(100)).is_empty());
    }

    #[test]
    fn test_disconnect() {
        let now = Instant::now();
        let (client, server, id) = connected_pair(now);

        let disconnect = client.session.disconnect(id, now).unwrap();
        let server_output = server.receive(client.addr, &disconnect, now);
        assert!(server_output.events.is_empty());
        assert_eq!(server_output.datagrams.len(), 1);
        assert!(server.session.connection_ids().is_empty());

        let client_output = pump(&server_output, &client, server.addr, now);
        assert_eq!(client_output.events, vec![TransportEvent::Disconnected { addr: server.addr, id }]);
        assert!(client.session.connection_ids().is_empty());
        assert!(!client.session.is_connected(&id));
    }

    #[test]
    fn test_ping_pong() {
        let now = Instant::now();
        let (client, server, id) = connected_pair(now);

        let ping = {
            let connection = client.session.pool().get(&id).unwrap();
            let mut conn = lock_connection(&connection);
            TransportSession::protocol_datagram(&mut conn, ProtocolHookId::Ping, ChannelKind::Raw, b"echo", server.addr, now, false).1
        };
        let output = server.receive(client.addr, &ping, now);
        assert_eq!(output.datagrams.len(), 1);
        assert!(output.events.is_empty());

        let mut pong = output.datagrams[0].datagram.as_ref();
        let header = WireHeader::deser(&mut pong).unwrap();
        assert_eq!(header.packet_kind(), Ok(PacketKind::Protocol(ProtocolHookId::Pong)));
        assert_eq!(header.channel_kind, ChannelKind::Raw);
        assert_eq!(pong, b"echo");

        let client_output = pump(&output, &client, server.addr, now);
        assert!(client_output.datagrams.is_empty());
        assert!(client_output.events.is_empty());
    }

    #[test]
    fn test_multi_homed_peer() {
        let now = Instant::now();
        let (client, server, id) = connected_pair(now);

        let datagram = client.session.send(id, ChannelKind::Reliable, 8, b"x", None, now).unwrap();
        let output = server.receive(addr(1001), &datagram, now);
        assert_eq!(output.datagrams[0].to, addr(1001), "acks go back to the sender");

        let connection = server.session.pool().get(&id).unwrap();
        assert_eq!(lock_connection(&connection).remote_endpoints, vec![client.addr, addr(1001)]);

        let reply = server.session.send(id, ChannelKind::Raw, 8, b"y", None, now).unwrap();
        assert_eq!(reply.to, client.addr);
    }

    #[test]
    fn test_connect_completed_by_later_ack() {
        let now = Instant::now();
        let client = Peer::new(addr(1000), TransportConfig::default_ipv4());
        let server = Peer::new(addr(2000), TransportConfig::default_ipv4());

        let (id, connect) = client.session.connect(server.addr, now);
        let user = client.session.send(id, ChannelKind::Reliable, 8, b"early", None, now).unwrap();

        // the connect's own ack gets lost
        let _ = server.receive(client.addr, &connect, now);
        let server_output = server.receive(client.addr, &user, now);
        assert_eq!(server_output.datagrams.len(), 1);

        let client_output = pump(&server_output, &client, server.addr, now);
        assert_eq!(client_output.events, vec![TransportEvent::Connected { addr: server.addr, id }]);
        assert!(client.session.is_connected(&id));

        let tick = client.session.tick(now + Duration::from_millis(200));
        assert!(tick.datagrams.is_empty());

        let tick = client.session.tick(now + Duration::from_secs(6));
        assert!(tick.events.is_empty());
        assert_eq!(client.session.connection_ids(), vec![id]);
    }

    #[test]
    fn test_disconnect_closes_when_ack_lost() {
        let now = Instant::now();
        let (client, server, id) = connected_pair(now);

        let disconnect = client.session.disconnect(id, now).unwrap();
        let _ = server.receive(client.addr, &disconnect, now);
        assert!(server.session.connection_ids().is_empty());

        let tick = client.session.tick(now + Duration::from_secs(1));
        assert_eq!(tick.datagrams, vec![disconnect]);
        let output = server.receive(client.addr, &tick.datagrams[0], now + Duration::from_secs(1));
        assert!(output.datagrams.is_empty());

        let tick = client.session.tick(now + Duration::from_secs(6));
        assert_eq!(tick.events, vec![TransportEvent::Disconnected { addr: server.addr, id }]);
        assert!(client.session.connection_ids().is_empty());
        assert!(!client.session.is_connected(&id));
        assert!(client.session.heartbeat_all(now + Duration::from_secs(600)).datagrams.is_empty());
    }

    #[test]
    fn test_reliable_ordered_recovers_after_loss() {
        let now = Instant::now();
        let (client, server, id) = connected_pair(now);

        let datagrams = (0..5u8)
            .map(|i| client.session.send(id, ChannelKind::ReliableOrdered, 9, &[i], None, now).unwrap())
            .collect::<Vec<_>>();

        // #0 is lost, everything after it waits
        for d in &datagrams[1..] {
            let output = server.receive(client.addr, d, now);
            assert!(payloads(&output).is_empty());
            assert!(output.datagrams.is_empty());
        }

        let later = now + Duration::from_secs(6);
        let tick = client.session.tick(later);
        assert!(tick.events.is_empty(), "ordered datagrams do not expire");
        assert_eq!(tick.datagrams, datagrams);

        let mut received = Vec::new();
        for d in &tick.datagrams {
            received.extend(payloads(&server.receive(client.addr, d, later)));
        }
        assert_eq!(received, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_heartbeat_rtt_from_later_ack() {
        let now = Instant::now();
        let (client, server, id) = connected_pair(now);

        let heartbeat = client.session.heartbeat(id, now).unwrap();
        let user = client.session.send(id, ChannelKind::Reliable, 8, b"x", None, now).unwrap();

        let later = now + Duration::from_millis(30);
        // the heartbeat's own ack gets lost
        let _ = server.receive(client.addr, &heartbeat.datagrams[0], later);
        let server_output = server.receive(client.addr, &user, later);

        let client_output = pump(&server_output, &client, server.addr, later);
        assert_eq!(client_output.events, vec![TransportEvent::HeartbeatRtt { id, rtt: Duration::from_millis(30) }]);

        // a repeated ack does not report the same heartbeat again
        let client_output = pump(&server_output, &client, server.addr, later + Duration::from_millis(10));
        assert!(client_output.events.is_empty());
    }

    #[test]
    fn test_clear() {
        let now = Instant::now();
        let (client, _, _) = connected_pair(now);
        assert_eq!(client.session.clear(), 1);
        assert!(client.session.connection_ids().is_empty());
    }
}
