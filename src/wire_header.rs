use std::fmt::{Debug, Display, Formatter};
use bitflags::bitflags;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use uuid::Uuid;
use crate::error::TransportError;

/// Opaque 128 bit connection id, generated by the connecting side. The wire representation is
///  the big-endian u128, which is the byte order of a UUID.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId(u128);

impl ConnectionId {
    pub fn new_random() -> ConnectionId {
        ConnectionId(Uuid::new_v4().as_u128())
    }

    pub fn from_raw(value: u128) -> ConnectionId {
        ConnectionId(value)
    }

    pub fn to_raw(&self) -> u128 {
        self.0
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Uuid::from_u128(self.0))
    }
}
impl Debug for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum ChannelKind {
    Raw = 0,
    Sequenced = 1,
    Reliable = 2,
    ReliableOrdered = 3,
}
impl ChannelKind {
    pub const ALL: [ChannelKind; 4] = [ChannelKind::Raw, ChannelKind::Sequenced, ChannelKind::Reliable, ChannelKind::ReliableOrdered];

    pub fn is_reliable(&self) -> bool {
        matches!(self, ChannelKind::Reliable | ChannelKind::ReliableOrdered)
    }

    pub fn index(&self) -> usize {
        u8::from(*self) as usize
    }
}

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
    pub struct PacketType: u8 {
        const FROM_CLIENT = 0b0000_0001;
        const PROTOCOL    = 0b0000_0010;
        const ACK         = 0b0000_0100;
        const FROM_SERVER = 0b0000_1000;
    }
}

/// Hook ids reserved for protocol packets. Application hook ids start at
///  [ProtocolHookId::MIN_USER_HOOK_ID].
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum ProtocolHookId {
    Connect = 0,
    Disconnect = 1,
    Heartbeat = 2,
    Ping = 3,
    Pong = 4,
    P2P = 5,
}
impl ProtocolHookId {
    pub const MIN_USER_HOOK_ID: u8 = 8;
}

/// The semantic kind of a datagram, derived from its packet type flags and hook id
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PacketKind {
    Protocol(ProtocolHookId),
    UserDefined,
}

#[derive(Clone, Eq, PartialEq)]
pub struct WireHeader {
    pub hook_id: u8,
    pub channel_kind: ChannelKind,
    pub packet_type: PacketType,
    pub connection_id: ConnectionId,
    pub sequence_id: u16,
    pub ack_bitmask: u32,
}

impl Debug for WireHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "HDR{{{}:{:?}#{}/{:032b} hook {} {:?}}}", self.connection_id, self.channel_kind, self.sequence_id, self.ack_bitmask, self.hook_id, self.packet_type)
    }
}

impl WireHeader {
    pub const SERIALIZED_LEN: usize = size_of::<u8>()  // hook id
        + size_of::<u8>()    // channel kind
        + size_of::<u8>()    // packet type
        + size_of::<u128>()  // connection id
        + size_of::<u16>()   // sequence id
        + size_of::<u32>();  // ack bitmask

    const CONNECTION_ID_OFFSET: usize = 3;

    pub fn new_protocol(hook: ProtocolHookId, channel_kind: ChannelKind, direction: PacketType, connection_id: ConnectionId, sequence_id: u16, ack_bitmask: u32) -> WireHeader {
        WireHeader {
            hook_id: hook.into(),
            channel_kind,
            packet_type: direction | PacketType::PROTOCOL,
            connection_id,
            sequence_id,
            ack_bitmask,
        }
    }

    pub fn new_user(hook_id: u8, channel_kind: ChannelKind, direction: PacketType, connection_id: ConnectionId, sequence_id: u16, ack_bitmask: u32) -> WireHeader {
        WireHeader {
            hook_id,
            channel_kind,
            packet_type: direction,
            connection_id,
            sequence_id,
            ack_bitmask,
        }
    }

    pub fn is_ack(&self) -> bool {
        self.packet_type.contains(PacketType::ACK)
    }

    pub fn packet_kind(&self) -> Result<PacketKind, TransportError> {
        if self.packet_type.contains(PacketType::PROTOCOL) {
            ProtocolHookId::try_from(self.hook_id)
                .map(PacketKind::Protocol)
                .map_err(|_| TransportError::InvalidHookId(self.hook_id))
        }
        else if self.hook_id >= ProtocolHookId::MIN_USER_HOOK_ID {
            Ok(PacketKind::UserDefined)
        }
        else {
            Err(TransportError::InvalidHookId(self.hook_id))
        }
    }

    /// The header of the acknowledgement for a datagram with this header
    pub fn ack(&self, direction: PacketType, ack_bitmask: u32) -> WireHeader {
        let kind_flags = self.packet_type & PacketType::PROTOCOL;
        WireHeader {
            hook_id: self.hook_id,
            channel_kind: self.channel_kind,
            packet_type: kind_flags | PacketType::ACK | direction,
            connection_id: self.connection_id,
            sequence_id: self.sequence_id,
            ack_bitmask,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.hook_id);
        buf.put_u8(self.channel_kind.into());
        buf.put_u8(self.packet_type.bits());
        buf.put_u128(self.connection_id.to_raw());
        buf.put_u16(self.sequence_id);
        buf.put_u32(self.ack_bitmask);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<WireHeader, TransportError> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            return Err(TransportError::MalformedHeader { len: buf.remaining() });
        }

        let hook_id = buf.get_u8();
        let raw_channel_kind = buf.get_u8();
        let channel_kind = ChannelKind::try_from(raw_channel_kind)
            .map_err(|_| TransportError::UnknownChannelKind(raw_channel_kind))?;
        let raw_packet_type = buf.get_u8();
        let packet_type = PacketType::from_bits(raw_packet_type)
            .ok_or(TransportError::InvalidPacketType(raw_packet_type))?;
        let connection_id = ConnectionId::from_raw(buf.get_u128());
        let sequence_id = buf.get_u16();
        let ack_bitmask = buf.get_u32();

        Ok(WireHeader {
            hook_id,
            channel_kind,
            packet_type,
            connection_id,
            sequence_id,
            ack_bitmask,
        })
    }

    /// Reads the connection id from a raw datagram without decoding the rest of the header, for
    ///  routing datagrams to workers
    pub fn peek_connection_id(datagram: &[u8]) -> Option<ConnectionId> {
        let mut raw = datagram.get(Self::CONNECTION_ID_OFFSET..Self::CONNECTION_ID_OFFSET + size_of::<u128>())?;
        Some(ConnectionId::from_raw(raw.get_u128()))
    }
}
