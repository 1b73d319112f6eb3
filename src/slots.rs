//! Per-writer inbound reassembly buffers.
//!
//! Each peer on the group has a ring of [N_SLOTS] slots on every receiver. A
//!  slot holds one sequence (one `write()` worth of fragments) while it is
//!  being reassembled, then stays readable until the local consumer has
//!  drained it. The slot life cycle is:
//!
//! ```ascii
//!  free (ack_sent, all_read)
//!    -> filling (!ack_sent, all_read)        first fragment of a new sequence
//!    -> readable (ack_sent, !all_read)       complete, ACK sent, reader woken
//!    -> free                                 reader consumed the last byte
//! ```
//!
//! At most one slot per peer is filling at any time; if a new sequence arrives
//!  while no slot is free, the fragment is dropped silently and recovered via
//!  the writer's ACK request.

use crate::datagram::FragmentRange;
use crate::seq::SequenceId;
use tracing::trace;

pub const N_SLOTS: usize = 4;

struct InSlot {
    sequence_id: SequenceId,
    /// false until the slot has held its first sequence - a virgin slot's
    ///  `sequence_id` is meaningless and must never match a lookup
    used: bool,
    data: Vec<u8>,
    got: Vec<bool>,
    read_pos: usize,
    ack_sent: bool,
    all_read: bool,
}

impl InSlot {
    fn new(ack_frequency: u16) -> InSlot {
        InSlot {
            sequence_id: SequenceId::ZERO,
            used: false,
            data: Vec::new(),
            got: vec![false; ack_frequency as usize],
            read_pos: 0,
            ack_sent: true,
            all_read: true,
        }
    }

    fn begin_sequence(&mut self, sequence_id: SequenceId) {
        self.sequence_id = sequence_id;
        self.used = true;
        self.data.clear();
        self.got.fill(false);
        self.read_pos = 0;
        self.ack_sent = false;
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum FragmentOutcome {
    /// fragment copied; if a gap precedes it, the contiguous missing run to
    ///  NACK early
    Stored { early_nack: Option<FragmentRange> },
    /// duplicate or stale fragment - dropped
    Ignored,
    /// no free slot - dropped silently, the ACK request will recover it
    NoSlot,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AckRequestOutcome {
    /// this receiver has no trace of the sequence - request everything again
    Behind,
    /// the sequence was already acknowledged - re-send the ACK
    AlreadyAcked,
    /// fragments are missing - NACK these ranges
    Missing(Vec<FragmentRange>),
    /// the sequence is complete: the slot was published to the reader and the
    ///  ring rotated - send the ACK and wake the reader
    Completed,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// connection closed - end of stream
    Closed,
    /// no readable slot yet - wait for the wake event
    NotReady,
    /// bytes copied out; `slot_drained` means the slot was released and
    ///  `next_ready` that the following slot is already readable
    Read {
        n: usize,
        slot_drained: bool,
        next_ready: bool,
    },
}

/// The reassembly ring for one peer. Callers are expected to wrap it in a
///  mutex; all operations are synchronous state transitions.
pub struct SlotRing {
    slots: Vec<InSlot>,
    payload_size: usize,
    recv_index: usize,
    read_index: usize,
    recv_active: Option<usize>,
    closed: bool,
}

impl SlotRing {
    pub fn new(ack_frequency: u16, payload_size: usize) -> SlotRing {
        SlotRing {
            slots: (0..N_SLOTS).map(|_| InSlot::new(ack_frequency)).collect(),
            payload_size,
            recv_index: 0,
            read_index: 0,
            recv_active: None,
            closed: false,
        }
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn find_by_sequence(&self, sequence_id: SequenceId) -> Option<usize> {
        self.slots.iter().position(|s| s.used && s.sequence_id == sequence_id)
    }

    /// The slot to fill for an incoming fragment: the currently filling slot
    ///  if there is one, otherwise a slot already tracking this sequence,
    ///  otherwise the next free slot in the ring.
    fn acquire_recv_slot(&mut self, sequence_id: SequenceId) -> Option<usize> {
        if let Some(index) = self.recv_active {
            return Some(index);
        }

        let index = match self.find_by_sequence(sequence_id) {
            Some(index) => index,
            None if self.slots[self.recv_index].all_read => self.recv_index,
            None => return None,
        };
        self.recv_active = Some(index);
        Some(index)
    }

    /// Handles one DATA fragment for this peer.
    pub fn on_fragment(
        &mut self,
        sequence_id: SequenceId,
        index: u16,
        payload: &[u8],
        last_sequence_acked: Option<SequenceId>,
    ) -> FragmentOutcome {
        let Some(slot_index) = self.acquire_recv_slot(sequence_id) else {
            trace!("no free receive slot for sequence {} - dropping", sequence_id);
            return FragmentOutcome::NoSlot;
        };
        let slot = &mut self.slots[slot_index];

        if index as usize >= slot.got.len() {
            trace!("fragment index {} beyond the ack window - dropping", index);
            return FragmentOutcome::Ignored;
        }

        if slot.ack_sent {
            // the slot is not filling yet: this is the first fragment of a new
            //  sequence, unless it is a retransmit of something already
            //  acknowledged. Sequence ids wrap, so 'already acknowledged' is a
            //  half-window comparison against the most recent ack, not an
            //  equality test.
            let stale = match last_sequence_acked {
                Some(last) => !sequence_id.is_after(last),
                None => false,
            };
            if stale {
                self.recv_active = None;
                return FragmentOutcome::Ignored;
            }
            trace!("first fragment of sequence {}", sequence_id);
            slot.begin_sequence(sequence_id);
        }
        else if sequence_id != slot.sequence_id {
            // a fragment for a different sequence while this one is filling
            //  can only be a stale retransmit
            return FragmentOutcome::Ignored;
        }

        if slot.got[index as usize] {
            return FragmentOutcome::Ignored;
        }

        let pos = index as usize * self.payload_size;
        if slot.data.len() < pos + payload.len() {
            slot.data.resize(pos + payload.len(), 0);
        }
        slot.data[pos..pos + payload.len()].copy_from_slice(payload);
        slot.got[index as usize] = true;

        // if the preceding fragment is missing, NACK the whole contiguous run
        //  right away instead of waiting for the ACK request
        let early_nack = if index > 0 && !slot.got[index as usize - 1] {
            let end = index - 1;
            let mut start = end;
            while start > 0 && !slot.got[start as usize - 1] {
                start -= 1;
            }
            Some(FragmentRange::new(start, end))
        }
        else {
            None
        };

        FragmentOutcome::Stored { early_nack }
    }

    /// Handles the writer's ACK request for `sequence_id`.
    pub fn on_ack_request(
        &mut self,
        sequence_id: SequenceId,
        last_fragment: u16,
        max_ranges: usize,
    ) -> AckRequestOutcome {
        let Some(slot_index) = self.find_by_sequence(sequence_id) else {
            return AckRequestOutcome::Behind;
        };

        if self.slots[slot_index].ack_sent {
            return AckRequestOutcome::AlreadyAcked;
        }

        let missing = self.missing_ranges(slot_index, last_fragment, max_ranges);
        if !missing.is_empty() {
            return AckRequestOutcome::Missing(missing);
        }

        // complete: publish to the reader and rotate to the next free slot
        let slot = &mut self.slots[slot_index];
        slot.ack_sent = true;
        slot.all_read = false;

        self.recv_active = None;
        self.recv_index = (self.recv_index + 1) % N_SLOTS;
        if self.slots[self.recv_index].all_read {
            self.recv_active = Some(self.recv_index);
        }

        AckRequestOutcome::Completed
    }

    fn missing_ranges(
        &self,
        slot_index: usize,
        last_fragment: u16,
        max_ranges: usize,
    ) -> Vec<FragmentRange> {
        let got = &self.slots[slot_index].got;
        let last_fragment = (last_fragment as usize).min(got.len() - 1) as u16;
        let mut ranges = Vec::new();

        let mut i = 0usize;
        while i <= last_fragment as usize && ranges.len() < max_ranges {
            if got[i] {
                i += 1;
                continue;
            }
            let start = i as u16;
            while i <= last_fragment as usize && !got[i] {
                i += 1;
            }
            ranges.push(FragmentRange::new(start, i as u16 - 1));
        }
        ranges
    }

    /// Copies readable bytes into `buf`. Returns [ReadOutcome::NotReady] while
    ///  the current read slot has not been published yet.
    pub fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        if self.closed {
            return ReadOutcome::Closed;
        }

        let read_index = self.read_index;
        let slot = &mut self.slots[read_index];
        if !slot.ack_sent || slot.all_read {
            return ReadOutcome::NotReady;
        }

        let n = buf.len().min(slot.data.len() - slot.read_pos);
        buf[..n].copy_from_slice(&slot.data[slot.read_pos..slot.read_pos + n]);
        slot.read_pos += n;

        let slot_drained = slot.read_pos == slot.data.len();
        let mut next_ready = false;
        if slot_drained {
            slot.got.fill(false);
            slot.data.clear();
            slot.all_read = true;

            self.read_index = (read_index + 1) % N_SLOTS;
            let next = &self.slots[self.read_index];
            next_ready = next.ack_sent && !next.all_read;

            // the freed slot may unblock a peer whose sequence was waiting
            if self.recv_active.is_none() && self.slots[self.recv_index].all_read {
                self.recv_active = Some(self.recv_index);
            }
        }

        ReadOutcome::Read { n, slot_drained, next_ready }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const PAYLOAD: usize = 8;

    fn seq(raw: u16) -> SequenceId {
        SequenceId::from_raw(raw)
    }

    fn fill_sequence(ring: &mut SlotRing, sequence: u16, fragments: &[&[u8]]) {
        for (i, payload) in fragments.iter().enumerate() {
            let outcome = ring.on_fragment(seq(sequence), i as u16, payload, None);
            assert!(matches!(outcome, FragmentOutcome::Stored { .. }), "{:?}", outcome);
        }
        assert_eq!(
            ring.on_ack_request(seq(sequence), fragments.len() as u16 - 1, 16),
            AckRequestOutcome::Completed
        );
    }

    #[test]
    fn test_single_fragment_roundtrip() {
        let mut ring = SlotRing::new(4, PAYLOAD);
        fill_sequence(&mut ring, 1, &[b"hello"]);

        let mut buf = [0u8; 16];
        match ring.read(&mut buf) {
            ReadOutcome::Read { n, slot_drained, next_ready } => {
                assert_eq!(&buf[..n], b"hello");
                assert!(slot_drained);
                assert!(!next_ready);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_multi_fragment_reassembly() {
        let mut ring = SlotRing::new(4, PAYLOAD);
        fill_sequence(&mut ring, 1, &[b"aaaaaaaa", b"bbbbbbbb", b"cc"]);

        let mut buf = [0u8; 32];
        match ring.read(&mut buf) {
            ReadOutcome::Read { n, .. } => assert_eq!(&buf[..n], b"aaaaaaaabbbbbbbbcc"),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_partial_reads_drain_slot() {
        let mut ring = SlotRing::new(4, PAYLOAD);
        fill_sequence(&mut ring, 1, &[b"abcdefgh"]);

        let mut buf = [0u8; 5];
        assert_eq!(
            ring.read(&mut buf),
            ReadOutcome::Read { n: 5, slot_drained: false, next_ready: false }
        );
        assert_eq!(&buf, b"abcde");

        match ring.read(&mut buf) {
            ReadOutcome::Read { n: 3, slot_drained: true, .. } => assert_eq!(&buf[..3], b"fgh"),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_fragment_ignored() {
        let mut ring = SlotRing::new(4, PAYLOAD);
        assert!(matches!(
            ring.on_fragment(seq(1), 0, b"x", None),
            FragmentOutcome::Stored { .. }
        ));
        assert_eq!(ring.on_fragment(seq(1), 0, b"x", None), FragmentOutcome::Ignored);
    }

    #[test]
    fn test_acked_retransmit_ignored() {
        let mut ring = SlotRing::new(4, PAYLOAD);
        fill_sequence(&mut ring, 1, &[b"x"]);

        // a retransmit for a slower receiver must not restart the slot
        assert_eq!(ring.on_fragment(seq(1), 0, b"x", Some(seq(1))), FragmentOutcome::Ignored);
    }

    #[test]
    fn test_sequence_zero_on_fresh_ring() {
        // a virgin slot's sequence_id of 0 must not shadow a real sequence 0
        let mut ring = SlotRing::new(4, PAYLOAD);
        assert!(matches!(
            ring.on_fragment(seq(0), 0, b"x", None),
            FragmentOutcome::Stored { .. }
        ));
        assert_eq!(ring.on_ack_request(seq(0), 0, 16), AckRequestOutcome::Completed);
    }

    #[test]
    fn test_wrap_to_sequence_zero() {
        let mut ring = SlotRing::new(4, PAYLOAD);
        // 0xffff completes, then the counter wraps around
        for (s, last) in [(0xffffu16, None), (0u16, Some(seq(0xffff)))] {
            let outcome = ring.on_fragment(seq(s), 0, b"x", last);
            assert!(matches!(outcome, FragmentOutcome::Stored { .. }), "{:?}", outcome);
            assert_eq!(ring.on_ack_request(seq(s), 0, 16), AckRequestOutcome::Completed);
        }
    }

    #[test]
    fn test_early_nack_run() {
        let mut ring = SlotRing::new(8, PAYLOAD);
        assert_eq!(
            ring.on_fragment(seq(1), 0, b"a", None),
            FragmentOutcome::Stored { early_nack: None }
        );
        // fragments 1 and 2 lost; 3 arrives -> NACK 1..=2
        assert_eq!(
            ring.on_fragment(seq(1), 3, b"d", None),
            FragmentOutcome::Stored { early_nack: Some(FragmentRange::new(1, 2)) }
        );
        // fragment 5: only 4 missing now
        assert_eq!(
            ring.on_fragment(seq(1), 5, b"f", None),
            FragmentOutcome::Stored { early_nack: Some(FragmentRange::new(4, 4)) }
        );
    }

    #[test]
    fn test_ack_request_missing_ranges() {
        let mut ring = SlotRing::new(8, PAYLOAD);
        // S3: fragments 1 and 3 of 5 dropped
        for i in [0u16, 2, 4] {
            ring.on_fragment(seq(1), i, b"x", None);
        }
        assert_eq!(
            ring.on_ack_request(seq(1), 4, 16),
            AckRequestOutcome::Missing(vec![FragmentRange::new(1, 1), FragmentRange::new(3, 3)])
        );
    }

    #[test]
    fn test_ack_request_range_cap() {
        let mut ring = SlotRing::new(8, PAYLOAD);
        for i in [0u16, 2, 4, 6] {
            ring.on_fragment(seq(1), i, b"x", None);
        }
        assert_eq!(
            ring.on_ack_request(seq(1), 7, 2),
            AckRequestOutcome::Missing(vec![FragmentRange::new(1, 1), FragmentRange::new(3, 3)])
        );
    }

    #[test]
    fn test_ack_request_unknown_sequence() {
        let mut ring = SlotRing::new(4, PAYLOAD);
        assert_eq!(ring.on_ack_request(seq(9), 3, 16), AckRequestOutcome::Behind);
    }

    #[test]
    fn test_ack_request_repeat_ack() {
        let mut ring = SlotRing::new(4, PAYLOAD);
        fill_sequence(&mut ring, 1, &[b"x"]);
        assert_eq!(ring.on_ack_request(seq(1), 0, 16), AckRequestOutcome::AlreadyAcked);
    }

    #[test]
    fn test_ring_exhaustion_drops() {
        let mut ring = SlotRing::new(4, PAYLOAD);
        // fill all four slots without the reader draining anything
        for s in 1..=4u16 {
            fill_sequence(&mut ring, s, &[b"x"]);
        }

        // slot 5 has nowhere to go
        assert_eq!(ring.on_fragment(seq(5), 0, b"x", None), FragmentOutcome::NoSlot);

        // the reader drains one sequence - now the slot is reusable
        let mut buf = [0u8; 8];
        assert!(matches!(ring.read(&mut buf), ReadOutcome::Read { slot_drained: true, .. }));
        assert!(matches!(
            ring.on_fragment(seq(5), 0, b"x", None),
            FragmentOutcome::Stored { .. }
        ));
    }

    #[test]
    fn test_sequences_read_in_order() {
        let mut ring = SlotRing::new(4, PAYLOAD);
        fill_sequence(&mut ring, 1, &[b"first"]);
        fill_sequence(&mut ring, 2, &[b"second"]);

        let mut buf = [0u8; 16];
        match ring.read(&mut buf) {
            ReadOutcome::Read { n, next_ready, .. } => {
                assert_eq!(&buf[..n], b"first");
                assert!(next_ready);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        match ring.read(&mut buf) {
            ReadOutcome::Read { n, next_ready, .. } => {
                assert_eq!(&buf[..n], b"second");
                assert!(!next_ready);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[rstest]
    #[case::empty_buffer(true)]
    #[case::after_data(false)]
    fn test_closed_returns_end_of_stream(#[case] fresh: bool) {
        let mut ring = SlotRing::new(4, PAYLOAD);
        if !fresh {
            fill_sequence(&mut ring, 1, &[b"x"]);
        }
        ring.close();

        let mut buf = [0u8; 8];
        assert_eq!(ring.read(&mut buf), ReadOutcome::Closed);
    }

    #[test]
    fn test_not_ready_before_ack() {
        let mut ring = SlotRing::new(4, PAYLOAD);
        ring.on_fragment(seq(1), 0, b"x", None);

        let mut buf = [0u8; 8];
        assert_eq!(ring.read(&mut buf), ReadOutcome::NotReady);
    }
}
