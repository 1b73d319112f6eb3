//! Reassembly of a slave commit's command packets into one readable stream.

use bytes::{Buf, Bytes};
use std::collections::BTreeMap;
use tracing::{trace, warn};

/// The packets of one slave commit, keyed by their sequence number within the
///  commit. Packets may arrive in any order; the stream is ready once the
///  packet flagged `last` and everything before it are present.
///
/// Reading implements [bytes::Buf] across the packet boundaries; consumed
///  packets are released as reading progresses.
pub struct InputStream {
    commit_id: u64,
    packets: BTreeMap<u32, Bytes>,
    last_sequence: Option<u32>,
    remaining: usize,
}

impl InputStream {
    pub fn new(commit_id: u64) -> InputStream {
        InputStream {
            commit_id,
            packets: BTreeMap::new(),
            last_sequence: None,
            remaining: 0,
        }
    }

    pub fn commit_id(&self) -> u64 {
        self.commit_id
    }

    pub fn add_packet(&mut self, sequence: u32, last: bool, data: Bytes) {
        if let Some(last_sequence) = self.last_sequence {
            if sequence > last_sequence {
                warn!(
                    "commit {}: packet {} beyond the final packet {} - dropping",
                    self.commit_id, sequence, last_sequence
                );
                return;
            }
        }
        if self.packets.contains_key(&sequence) {
            trace!("commit {}: duplicate packet {} - dropping", self.commit_id, sequence);
            return;
        }

        if last {
            self.last_sequence = Some(sequence);
        }
        self.remaining += data.len();
        self.packets.insert(sequence, data);
    }

    /// true once all packets up to and including the `last` one are present
    pub fn is_ready(&self) -> bool {
        let Some(last_sequence) = self.last_sequence else {
            return false;
        };
        self.packets.len() as u64 == last_sequence as u64 + 1
            && self.packets.keys().next() == Some(&0)
            && self.packets.keys().next_back() == Some(&last_sequence)
    }

    pub fn n_remaining_buffers(&self) -> usize {
        self.packets.len()
    }

    /// convenience read for consumers that do not use [Buf] directly
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.remaining);
        self.copy_to_slice(&mut buf[..n]);
        n
    }
}

impl Buf for InputStream {
    fn remaining(&self) -> usize {
        self.remaining
    }

    fn chunk(&self) -> &[u8] {
        self.packets.values().next().map(|b| b.as_ref()).unwrap_or(&[])
    }

    fn advance(&mut self, mut cnt: usize) {
        assert!(cnt <= self.remaining, "advancing past the end of the stream");
        self.remaining -= cnt;

        while cnt > 0 {
            let (&sequence, front) = self.packets.iter_mut().next()
                .expect("remaining bytes imply a remaining packet");

            if cnt < front.len() {
                front.advance(cnt);
                return;
            }

            cnt -= front.len();
            self.packets.remove(&sequence);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(content: &'static [u8]) -> Bytes {
        Bytes::from_static(content)
    }

    #[test]
    fn test_in_order_assembly() {
        let mut stream = InputStream::new(7);
        stream.add_packet(0, false, packet(b"abc"));
        assert!(!stream.is_ready());
        stream.add_packet(1, true, packet(b"def"));
        assert!(stream.is_ready());
        assert_eq!(stream.remaining(), 6);
    }

    #[test]
    fn test_out_of_order_assembly() {
        // packets arrive 2, 1, 3 (0-based: 1, 0, 2)
        let mut stream = InputStream::new(7);
        stream.add_packet(1, false, packet(b"bb"));
        assert!(!stream.is_ready());
        stream.add_packet(0, false, packet(b"aa"));
        assert!(!stream.is_ready());
        stream.add_packet(2, true, packet(b"cc"));
        assert!(stream.is_ready());

        let mut buf = [0u8; 6];
        assert_eq!(stream.read(&mut buf), 6);
        assert_eq!(&buf, b"aabbcc");
        assert_eq!(stream.remaining(), 0);
        assert_eq!(stream.n_remaining_buffers(), 0);
    }

    #[test]
    fn test_last_without_predecessors_is_not_ready() {
        let mut stream = InputStream::new(7);
        stream.add_packet(2, true, packet(b"cc"));
        assert!(!stream.is_ready());
    }

    #[test]
    fn test_duplicate_packet_dropped() {
        let mut stream = InputStream::new(7);
        stream.add_packet(0, true, packet(b"abc"));
        stream.add_packet(0, true, packet(b"xyz"));
        assert_eq!(stream.remaining(), 3);

        let mut buf = [0u8; 3];
        stream.read(&mut buf);
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn test_packet_beyond_last_dropped() {
        let mut stream = InputStream::new(7);
        stream.add_packet(0, true, packet(b"abc"));
        stream.add_packet(5, false, packet(b"zzz"));
        assert!(stream.is_ready());
        assert_eq!(stream.remaining(), 3);
    }

    #[test]
    fn test_buf_across_packet_boundaries() {
        let mut stream = InputStream::new(7);
        stream.add_packet(0, false, packet(b"hel"));
        stream.add_packet(1, false, packet(b"lo "));
        stream.add_packet(2, true, packet(b"world"));

        assert_eq!(stream.chunk(), b"hel");
        stream.advance(4);
        assert_eq!(stream.chunk(), b"o ");
        assert_eq!(stream.remaining(), 7);

        let mut rest = vec![0u8; 7];
        stream.copy_to_slice(&mut rest);
        assert_eq!(&rest, b"o world");
        assert_eq!(stream.n_remaining_buffers(), 0);
    }

    #[test]
    fn test_single_packet_commit() {
        let mut stream = InputStream::new(1);
        stream.add_packet(0, true, packet(b"x"));
        assert!(stream.is_ready());
        assert_eq!(stream.get_u8(), b'x');
        assert_eq!(stream.remaining(), 0);
    }
}
