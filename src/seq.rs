use std::fmt::{Debug, Display, Formatter};

/// A per-writer 16-bit sequence number. One `write()` call produces one
///  sequence; the counter wraps, so ordering is decided with half-window
///  arithmetic rather than plain comparison.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct SequenceId(u16);

impl SequenceId {
    pub const ZERO: SequenceId = SequenceId(0);

    pub fn from_raw(value: u16) -> SequenceId {
        SequenceId(value)
    }

    pub fn to_raw(self) -> u16 {
        self.0
    }

    pub fn next(self) -> SequenceId {
        SequenceId(self.0.wrapping_add(1))
    }

    /// true iff `self` comes after `other` on the wrapping sequence circle,
    ///  i.e. `self` is in the half-window following `other`
    pub fn is_after(self, other: SequenceId) -> bool {
        self != other && self.0.wrapping_sub(other.0) < 0x8000
    }
}

impl Display for SequenceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl Debug for SequenceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The combined 'write sequence id' carried by DATA fragments: the writer's
///  connection id in the high 16 bits, the sequence number in the low 16.
pub fn pack_write_seq(writer_id: u16, sequence_id: SequenceId) -> u32 {
    ((writer_id as u32) << 16) | sequence_id.to_raw() as u32
}

pub fn unpack_write_seq(write_seq_id: u32) -> (u16, SequenceId) {
    (
        (write_seq_id >> 16) as u16,
        SequenceId::from_raw(write_seq_id as u16),
    )
}
