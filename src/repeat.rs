//! Retransmission requests flowing from the I/O loop to a blocked writer.

use crate::datagram::FragmentRange;

/// One item on the writer's repeat queue. The I/O loop is the producer, the
///  task blocked in `write()` is the consumer.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RepeatRequest {
    /// re-send the fragments in the range
    Nack(FragmentRange),
    /// re-send the ACK request (ack timeout elapsed)
    AckReq,
    /// all subscribers have acknowledged - or the connection failed; the
    ///  writer distinguishes the two by connection state
    Done,
}

/// Merge overlapping and adjacent ranges into a minimal set. The union of the
///  result equals the union of the input.
pub fn merge_ranges(mut ranges: Vec<FragmentRange>) -> Vec<FragmentRange> {
    ranges.sort_by_key(|r| r.start);

    let mut merged: Vec<FragmentRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(prev) if range.start <= prev.end.saturating_add(1) => {
                prev.end = prev.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn r(start: u16, end: u16) -> FragmentRange {
        FragmentRange::new(start, end)
    }

    #[rstest]
    #[case::empty(vec![], vec![])]
    #[case::single(vec![r(2, 5)], vec![r(2, 5)])]
    #[case::disjoint(vec![r(1, 1), r(3, 3)], vec![r(1, 1), r(3, 3)])]
    #[case::adjacent(vec![r(1, 2), r(3, 4)], vec![r(1, 4)])]
    #[case::overlapping(vec![r(1, 5), r(3, 8)], vec![r(1, 8)])]
    #[case::contained(vec![r(1, 9), r(3, 4)], vec![r(1, 9)])]
    #[case::unsorted(vec![r(7, 9), r(0, 2), r(3, 3)], vec![r(0, 3), r(7, 9)])]
    #[case::duplicate(vec![r(4, 4), r(4, 4)], vec![r(4, 4)])]
    #[case::chain(vec![r(0, 0), r(1, 1), r(2, 2), r(5, 5)], vec![r(0, 2), r(5, 5)])]
    #[case::max_boundary(vec![r(0xfffe, 0xffff), r(0xffff, 0xffff)], vec![r(0xfffe, 0xffff)])]
    fn test_merge_ranges(#[case] input: Vec<FragmentRange>, #[case] expected: Vec<FragmentRange>) {
        assert_eq!(merge_ranges(input), expected);
    }

    /// the union of merged ranges must equal the union of the inputs for
    ///  arbitrary inputs
    #[rstest]
    #[case(vec![r(0, 3), r(2, 2), r(5, 9), r(10, 10), r(4, 4)])]
    #[case(vec![r(100, 200), r(50, 150), r(199, 300)])]
    fn test_merge_preserves_union(#[case] input: Vec<FragmentRange>) {
        let merged = merge_ranges(input.clone());

        let covers = |set: &[FragmentRange], i: u16| set.iter().any(|r| r.start <= i && i <= r.end);
        for i in 0..=512 {
            assert_eq!(covers(&input, i), covers(&merged, i), "diverges at index {}", i);
        }

        // merged ranges are disjoint and non-adjacent
        for pair in merged.windows(2) {
            assert!(pair[0].end + 1 < pair[1].start);
        }
    }
}
