use bit_set::BitSet;
use tracing::trace;

/// The signed distance from `base` to `seq` in the wrapping u16 sequence space: positive if
///  `seq` is newer than `base`, negative if it is older. Ids that are exactly half the sequence
///  space apart are considered older.
pub fn sequence_distance(seq: u16, base: u16) -> i32 {
    seq.wrapping_sub(base) as i16 as i32
}

pub fn is_newer(seq: u16, base: u16) -> bool {
    sequence_distance(seq, base) > 0
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Observation {
    Accepted,
    Duplicate,
    Stale,
}

/// Tracks which sequence ids were seen in a window of `window_size` ids ending at the highest
///  id seen so far. The bitmap is circular, slot `seq % window_size`, so sliding the window
///  forward only clears the slots that newly enter it.
///
/// A sequence id is 'new' iff it is less than `window_size` behind the highest id seen (with
///  wrap-around semantics) and was not seen before. Ids that lag by `window_size` or more are
///  stale, since their slot is shared with a newer id.
///
/// The window size must be a power of two so that slots stay consistent when sequence ids wrap
///  around from 65535 to 0.
pub struct SequenceWindow {
    window_size: u16,
    remote_highest_seen: Option<u16>,
    seen: BitSet,
}

impl SequenceWindow {
    pub const ACK_BITMASK_LEN: u16 = 32;

    pub fn new(window_size: u16) -> SequenceWindow {
        assert!(window_size >= Self::ACK_BITMASK_LEN && window_size <= 0x8000, "window size {} is out of range", window_size);
        assert!(window_size.is_power_of_two(), "window size {} is not a power of two", window_size);

        SequenceWindow {
            window_size,
            remote_highest_seen: None,
            seen: BitSet::with_capacity(window_size as usize),
        }
    }

    pub fn window_size(&self) -> u16 {
        self.window_size
    }

    pub fn remote_highest_seen(&self) -> Option<u16> {
        self.remote_highest_seen
    }

    fn slot(&self, seq: u16) -> usize {
        (seq % self.window_size) as usize
    }

    /// Classifies a sequence id without registering it
    pub fn classify(&self, seq: u16) -> Observation {
        let Some(highest) = self.remote_highest_seen else {
            return Observation::Accepted;
        };

        let distance = sequence_distance(seq, highest);
        if distance > 0 {
            return Observation::Accepted;
        }
        if -distance >= self.window_size as i32 {
            return Observation::Stale;
        }
        if self.seen.contains(self.slot(seq)) {
            Observation::Duplicate
        }
        else {
            Observation::Accepted
        }
    }

    /// Classifies a sequence id and registers it if it is new, sliding the window forward if
    ///  it is newer than everything seen before
    pub fn observe(&mut self, seq: u16) -> Observation {
        let result = self.classify(seq);
        if result != Observation::Accepted {
            return result;
        }

        match self.remote_highest_seen {
            None => {
                self.remote_highest_seen = Some(seq);
            }
            Some(highest) => {
                let distance = sequence_distance(seq, highest);
                if distance >= self.window_size as i32 {
                    trace!("sequence id {} skips the entire window after {} - resetting", seq, highest);
                    self.seen.clear();
                }
                else {
                    for step in 1..=distance.max(0) {
                        let entering = highest.wrapping_add(step as u16);
                        let slot = self.slot(entering);
                        self.seen.remove(slot);
                    }
                }
                if distance > 0 {
                    self.remote_highest_seen = Some(seq);
                }
            }
        }

        let slot = self.slot(seq);
        self.seen.insert(slot);
        Observation::Accepted
    }

    /// true iff `seq` is inside the window and was registered
    pub fn contains(&self, seq: u16) -> bool {
        let Some(highest) = self.remote_highest_seen else {
            return false;
        };

        let distance = sequence_distance(seq, highest);
        distance <= 0
            && -distance < self.window_size as i32
            && self.seen.contains(self.slot(seq))
    }

    /// The bitmask for the 32 ids immediately below the highest id seen: bit n is set iff id
    ///  `highest - 1 - n` was seen
    pub fn ack_bitmask(&self) -> u32 {
        self.remote_highest_seen
            .map(|highest| self.ack_bitmask_for(highest))
            .unwrap_or(0)
    }

    /// The bitmask for the 32 ids immediately below `seq`
    pub fn ack_bitmask_for(&self, seq: u16) -> u32 {
        let mut result = 0;
        for n in 0..Self::ACK_BITMASK_LEN {
            if self.contains(seq.wrapping_sub(1 + n)) {
                result |= 1 << n;
            }
        }
        result
    }

    /// Registers a peer's acknowledgement of `seq` together with the ids acknowledged in the
    ///  bitmask, returning whether `seq` itself was newly acknowledged
    pub fn observe_ack(&mut self, seq: u16, ack_bitmask: u32) -> bool {
        let newly_acked = self.observe(seq) == Observation::Accepted;
        for n in 0..Self::ACK_BITMASK_LEN {
            if ack_bitmask & (1 << n) != 0 {
                let _ = self.observe(seq.wrapping_sub(1 + n));
            }
        }
        newly_acked
    }
}
