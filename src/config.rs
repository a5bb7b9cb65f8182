use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;
use crate::wire_header::{ChannelKind, WireHeader};

pub struct TransportConfig {
    /// Local addresses to bind. Each address gets its own socket with a dedicated receive loop
    ///  and send loop; replies leave through the socket the request arrived on.
    pub bind_addrs: Vec<SocketAddr>,

    /// This is the maximum size of a datagram *including* the 25 byte header. The transport
    ///  does not fragment, and it does not attempt to discover the path MTU, so this must be
    ///  supported by every route between peers.
    ///
    /// With full Ethernet frames and no optional IP headers, the UDP payload is
    ///  `1500 - 20 - 8 = 1472` bytes for IPV4. Sends exceeding this limit are rejected.
    pub mtu: usize,

    /// size of the buffer each receive loop reads datagrams into - must be at least `mtu`
    pub receive_buffer_size: usize,

    /// Receive loops wait for incoming datagrams at most this long before checking for shutdown
    pub poll_frequency: Duration,

    /// A reliable datagram that is not acknowledged within this time is given up on, and the
    ///  application is notified
    pub resend_timeout: Duration,
    /// interval of the periodic scan that re-sends unacknowledged reliable datagrams
    pub resend_interval: Duration,
    pub heartbeat_interval: Duration,

    /// A connect attempt that is not acknowledged within this time is abandoned
    pub connection_timeout: Duration,
    /// Connections that were not kept alive explicitly are evicted after being silent for
    ///  this long
    pub inactivity_timeout: Duration,
    /// interval between eviction sweeps - should be shorter than `inactivity_timeout` for
    ///  prompt eviction
    pub sweep_interval: Duration,

    pub sequenced_window_size: u16,
    pub reliable_window_size: u16,
    pub reliable_ordered_window_size: u16,

    pub allow_incoming_connections: bool,

    /// number of worker tasks processing inbound datagrams
    pub workers: usize,
    pub inbound_queue_size: usize,
    pub outbound_queue_size: usize,
}

impl TransportConfig {
    pub const MIN_WINDOW_SIZE: u16 = 32;
    pub const MAX_WINDOW_SIZE: u16 = 0x8000;
    pub const MAX_UDP_PAYLOAD: usize = 65507;

    /// IPV4 with end-to-end full Ethernet frames and without optional headers, bound to an
    ///  ephemeral port on localhost
    pub fn default_ipv4() -> TransportConfig {
        TransportConfig {
            bind_addrs: vec![SocketAddr::from(([127, 0, 0, 1], 0))],
            mtu: 1472,
            receive_buffer_size: 2048,
            poll_frequency: Duration::from_millis(15),
            resend_timeout: Duration::from_secs(5),
            resend_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(1),
            connection_timeout: Duration::from_secs(5),
            inactivity_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            sequenced_window_size: 32,
            reliable_window_size: 1024,
            reliable_ordered_window_size: 256,
            allow_incoming_connections: true,
            workers: 4,
            inbound_queue_size: 1024,
            outbound_queue_size: 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_addrs.is_empty() {
            bail!("at least one bind address is required");
        }
        if self.mtu <= WireHeader::SERIALIZED_LEN || self.mtu > Self::MAX_UDP_PAYLOAD {
            bail!("MTU must be between {} and {}, was {}", WireHeader::SERIALIZED_LEN + 1, Self::MAX_UDP_PAYLOAD, self.mtu);
        }
        if self.receive_buffer_size < self.mtu {
            bail!("receive buffer size {} is smaller than the MTU {}", self.receive_buffer_size, self.mtu);
        }
        for (name, size) in [
            ("sequenced", self.sequenced_window_size),
            ("reliable", self.reliable_window_size),
            ("reliable ordered", self.reliable_ordered_window_size),
        ] {
            if !(Self::MIN_WINDOW_SIZE..=Self::MAX_WINDOW_SIZE).contains(&size) {
                bail!("{} window size must be between {} and {}, was {}", name, Self::MIN_WINDOW_SIZE, Self::MAX_WINDOW_SIZE, size);
            }
            if !size.is_power_of_two() {
                bail!("{} window size must be a power of two, was {}", name, size);
            }
        }
        for (name, duration) in [
            ("poll frequency", self.poll_frequency),
            ("resend timeout", self.resend_timeout),
            ("resend interval", self.resend_interval),
            ("heartbeat interval", self.heartbeat_interval),
            ("connection timeout", self.connection_timeout),
            ("inactivity timeout", self.inactivity_timeout),
            ("sweep interval", self.sweep_interval),
        ] {
            if duration.is_zero() {
                bail!("{} must not be zero", name);
            }
        }
        if self.sweep_interval > self.inactivity_timeout {
            bail!("sweep interval {:?} is longer than the inactivity timeout {:?}", self.sweep_interval, self.inactivity_timeout);
        }
        if self.workers == 0 {
            bail!("at least one worker is required");
        }
        if self.inbound_queue_size == 0 || self.outbound_queue_size == 0 {
            bail!("queue sizes must not be zero");
        }
        Ok(())
    }

    /// The sequence window size for a channel kind. Raw channels do not track sequence ids, they
    ///  get the minimum size for uniformity.
    pub fn window_size(&self, kind: ChannelKind) -> u16 {
        match kind {
            ChannelKind::Raw => Self::MIN_WINDOW_SIZE,
            ChannelKind::Sequenced => self.sequenced_window_size,
            ChannelKind::Reliable => self.reliable_window_size,
            ChannelKind::ReliableOrdered => self.reliable_ordered_window_size,
        }
    }

    /// maximum application payload that fits into a single datagram
    pub fn max_payload_len(&self) -> usize {
        self.mtu.saturating_sub(WireHeader::SERIALIZED_LEN)
    }
}
