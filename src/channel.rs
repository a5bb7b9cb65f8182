use tracing::trace;
use crate::config::TransportConfig;
use crate::sequence_window::{is_newer, sequence_distance, Observation, SequenceWindow};
use crate::wire_header::ChannelKind;

/// What a channel decided about an incoming datagram
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InputOutcome {
    /// new, pass the payload to the application
    Deliver,
    /// seen before - the peer probably missed our ack
    Duplicate,
    /// too old to be tracked, or superseded by newer data
    Stale,
    /// arrived ahead of a gap in an ordered channel - neither recorded nor acknowledged, so the
    ///  sender re-sends it once the gap is closed
    Deferred,
}

/// A channel is the per-connection, per-direction state of one delivery policy. A connection
///  has one instance per [ChannelKind] for each direction: the incoming instance tracks what
///  was received from the peer, the outgoing instance allocates sequence ids and tracks what the
///  peer acknowledged.
pub trait DeliveryChannel {
    fn kind(&self) -> ChannelKind;

    fn handle_input_outcome(&mut self, sequence_id: u16) -> InputOutcome;

    /// Registers an incoming datagram, returning whether it should be delivered. The ack bitmask
    ///  of incoming data datagrams is informational and does not change channel state.
    fn handle_input(&mut self, sequence_id: u16, _ack_bitmask: u32) -> bool {
        self.handle_input_outcome(sequence_id) == InputOutcome::Deliver
    }

    /// Allocates the next local sequence id, returning it along with the bitmask of acks
    ///  received for the ids before it
    fn handle_output(&mut self) -> (u16, u32);

    /// Registers an acknowledgement from the peer, returning `true` iff `sequence_id` itself was
    ///  not acknowledged before
    fn handle_ack(&mut self, sequence_id: u16, ack_bitmask: u32) -> bool;

    fn is_delivered(&self, sequence_id: u16) -> bool;

    /// The bitmask to send back when acknowledging `sequence_id`
    fn ack_bitmask_for(&self, sequence_id: u16) -> u32;

    fn is_reliable(&self) -> bool {
        self.kind().is_reliable()
    }
}

/// Fire and forget: everything is delivered, nothing is acknowledged
pub struct RawChannel {
    next_local_seq: u16,
}
impl RawChannel {
    pub fn new() -> RawChannel {
        RawChannel { next_local_seq: 0 }
    }
}
impl DeliveryChannel for RawChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Raw
    }

    fn handle_input_outcome(&mut self, _sequence_id: u16) -> InputOutcome {
        InputOutcome::Deliver
    }

    fn handle_output(&mut self) -> (u16, u32) {
        let seq = self.next_local_seq;
        self.next_local_seq = seq.wrapping_add(1);
        (seq, 0)
    }

    fn handle_ack(&mut self, _sequence_id: u16, _ack_bitmask: u32) -> bool {
        false
    }

    fn is_delivered(&self, _sequence_id: u16) -> bool {
        false
    }

    fn ack_bitmask_for(&self, _sequence_id: u16) -> u32 {
        0
    }
}

/// Latest wins: a datagram is delivered only if it is newer than everything received before on
///  this channel
pub struct SequencedChannel {
    next_local_seq: u16,
    window: SequenceWindow,
}
impl SequencedChannel {
    pub fn new(window_size: u16) -> SequencedChannel {
        SequencedChannel {
            next_local_seq: 0,
            window: SequenceWindow::new(window_size),
        }
    }
}
impl DeliveryChannel for SequencedChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Sequenced
    }

    fn handle_input_outcome(&mut self, sequence_id: u16) -> InputOutcome {
        let is_latest = match self.window.remote_highest_seen() {
            None => true,
            Some(highest) => is_newer(sequence_id, highest),
        };

        if is_latest {
            self.window.observe(sequence_id);
            InputOutcome::Deliver
        }
        else if self.window.contains(sequence_id) {
            InputOutcome::Duplicate
        }
        else {
            InputOutcome::Stale
        }
    }

    fn handle_output(&mut self) -> (u16, u32) {
        let seq = self.next_local_seq;
        self.next_local_seq = seq.wrapping_add(1);
        (seq, 0)
    }

    fn handle_ack(&mut self, _sequence_id: u16, _ack_bitmask: u32) -> bool {
        false
    }

    fn is_delivered(&self, _sequence_id: u16) -> bool {
        false
    }

    fn ack_bitmask_for(&self, _sequence_id: u16) -> u32 {
        0
    }
}

/// Exactly once, in arrival order
pub struct ReliableChannel {
    next_local_seq: u16,
    window: SequenceWindow,
}
impl ReliableChannel {
    pub fn new(window_size: u16) -> ReliableChannel {
        ReliableChannel {
            next_local_seq: 0,
            window: SequenceWindow::new(window_size),
        }
    }
}
impl DeliveryChannel for ReliableChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Reliable
    }

    fn handle_input_outcome(&mut self, sequence_id: u16) -> InputOutcome {
        match self.window.observe(sequence_id) {
            Observation::Accepted => InputOutcome::Deliver,
            Observation::Duplicate => InputOutcome::Duplicate,
            Observation::Stale => InputOutcome::Stale,
        }
    }

    fn handle_output(&mut self) -> (u16, u32) {
        let seq = self.next_local_seq;
        self.next_local_seq = seq.wrapping_add(1);
        (seq, self.window.ack_bitmask())
    }

    fn handle_ack(&mut self, sequence_id: u16, ack_bitmask: u32) -> bool {
        self.window.observe_ack(sequence_id, ack_bitmask)
    }

    fn is_delivered(&self, sequence_id: u16) -> bool {
        self.window.contains(sequence_id)
    }

    fn ack_bitmask_for(&self, sequence_id: u16) -> u32 {
        self.window.ack_bitmask_for(sequence_id)
    }
}

/// Exactly once, in send order. There is no reorder buffer: a datagram arriving ahead of a gap
///  is dropped without an ack, and the sender's retransmission delivers it after the gap.
pub struct ReliableOrderedChannel {
    next_local_seq: u16,
    next_expected: u16,
    window: SequenceWindow,
}
impl ReliableOrderedChannel {
    pub fn new(window_size: u16) -> ReliableOrderedChannel {
        ReliableOrderedChannel {
            next_local_seq: 0,
            next_expected: 0,
            window: SequenceWindow::new(window_size),
        }
    }
}
impl DeliveryChannel for ReliableOrderedChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::ReliableOrdered
    }

    fn handle_input_outcome(&mut self, sequence_id: u16) -> InputOutcome {
        let distance = sequence_distance(sequence_id, self.next_expected);
        if distance == 0 {
            self.window.observe(sequence_id);
            self.next_expected = self.next_expected.wrapping_add(1);
            InputOutcome::Deliver
        }
        else if distance > 0 {
            trace!("sequence id {} arrived ahead of {} - deferring", sequence_id, self.next_expected);
            InputOutcome::Deferred
        }
        else if self.window.contains(sequence_id) {
            InputOutcome::Duplicate
        }
        else {
            InputOutcome::Stale
        }
    }

    fn handle_output(&mut self) -> (u16, u32) {
        let seq = self.next_local_seq;
        self.next_local_seq = seq.wrapping_add(1);
        (seq, self.window.ack_bitmask())
    }

    fn handle_ack(&mut self, sequence_id: u16, ack_bitmask: u32) -> bool {
        self.window.observe_ack(sequence_id, ack_bitmask)
    }

    fn is_delivered(&self, sequence_id: u16) -> bool {
        self.window.contains(sequence_id)
    }

    fn ack_bitmask_for(&self, sequence_id: u16) -> u32 {
        self.window.ack_bitmask_for(sequence_id)
    }
}

pub enum Channel {
    Raw(RawChannel),
    Sequenced(SequencedChannel),
    Reliable(ReliableChannel),
    ReliableOrdered(ReliableOrderedChannel),
}

macro_rules! delegate {
    ($self:ident, $ch:ident => $e:expr) => {
        match $self {
            Channel::Raw($ch) => $e,
            Channel::Sequenced($ch) => $e,
            Channel::Reliable($ch) => $e,
            Channel::ReliableOrdered($ch) => $e,
        }
    };
}

impl Channel {
    pub fn new(kind: ChannelKind, config: &TransportConfig) -> Channel {
        let window_size = config.window_size(kind);
        match kind {
            ChannelKind::Raw => Channel::Raw(RawChannel::new()),
            ChannelKind::Sequenced => Channel::Sequenced(SequencedChannel::new(window_size)),
            ChannelKind::Reliable => Channel::Reliable(ReliableChannel::new(window_size)),
            ChannelKind::ReliableOrdered => Channel::ReliableOrdered(ReliableOrderedChannel::new(window_size)),
        }
    }
}

impl DeliveryChannel for Channel {
    fn kind(&self) -> ChannelKind {
        delegate!(self, c => c.kind())
    }

    fn handle_input_outcome(&mut self, sequence_id: u16) -> InputOutcome {
        delegate!(self, c => c.handle_input_outcome(sequence_id))
    }

    fn handle_output(&mut self) -> (u16, u32) {
        delegate!(self, c => c.handle_output())
    }

    fn handle_ack(&mut self, sequence_id: u16, ack_bitmask: u32) -> bool {
        delegate!(self, c => c.handle_ack(sequence_id, ack_bitmask))
    }

    fn is_delivered(&self, sequence_id: u16) -> bool {
        delegate!(self, c => c.is_delivered(sequence_id))
    }

    fn ack_bitmask_for(&self, sequence_id: u16) -> u32 {
        delegate!(self, c => c.ack_bitmask_for(sequence_id))
    }
}

/// One channel per [ChannelKind], indexed by the kind
pub struct ChannelSet {
    channels: [Channel; 4],
}
impl ChannelSet {
    pub fn new(config: &TransportConfig) -> ChannelSet {
        ChannelSet {
            channels: ChannelKind::ALL.map(|kind| Channel::new(kind, config)),
        }
    }

    pub fn get(&self, kind: ChannelKind) -> &Channel {
        &self.channels[kind.index()]
    }

    pub fn get_mut(&mut self, kind: ChannelKind) -> &mut Channel {
        &mut self.channels[kind.index()]
    }
}
