//! The wire codec. Every datagram starts with a `u16` type tag, all integers
//!  are little-endian, and all layouts are fixed:
//!
//! ```ascii
//! DATA:    type:u16, write_seq_id:u32, data_id_len:u32, payload[..]
//!           write_seq_id = writer id << 16 | sequence number
//!           data_id_len  = fragment index << 16 | payload length
//! ACK:     type:u16, reader_id:u16, writer_id:u16, sequence_id:u16
//! NACK:    type:u16, reader_id:u16, writer_id:u16, sequence_id:u16,
//!           count:u8, pad:u8, ranges[count]:u32
//!           range = start << 16 | end, both fragment indices, both inclusive
//! ACKREQ:  type:u16, writer_id:u16, last_fragment:u16, sequence_id:u16
//! NODE:    type:u16, connection_id:u16     (HELLO / CONFIRM / DENY / EXIT)
//! COUNT:   type:u16, connection_id:u16, n_children:u32
//! ```
//!
//! Every control datagram fits into a single MTU; the number of NACK ranges is
//!  capped accordingly (see [max_nack_ranges]).

use crate::seq::{pack_write_seq, unpack_write_seq, SequenceId};
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes};
use std::fmt::{Debug, Formatter};

const TYPE_DATA: u16 = 1;
const TYPE_ACK: u16 = 2;
const TYPE_NACK: u16 = 3;
const TYPE_ACKREQ: u16 = 4;
const TYPE_ID_HELLO: u16 = 5;
const TYPE_ID_CONFIRM: u16 = 6;
const TYPE_ID_DENY: u16 = 7;
const TYPE_ID_EXIT: u16 = 8;
const TYPE_COUNT_NODE: u16 = 9;

/// serialized length of a DATA datagram before the payload
pub const DATA_HEADER_LEN: usize = 10;
/// serialized length of a NACK datagram before the ranges
pub const NACK_HEADER_LEN: usize = 10;

/// The maximum number of ranges in a NACK so that it still fits into one MTU.
pub fn max_nack_ranges(mtu: usize) -> usize {
    (mtu - NACK_HEADER_LEN) / size_of::<u32>()
}

/// An inclusive range of fragment indices referenced by a NACK.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct FragmentRange {
    pub start: u16,
    pub end: u16,
}
impl FragmentRange {
    pub fn new(start: u16, end: u16) -> FragmentRange {
        assert!(start <= end);
        FragmentRange { start, end }
    }

    pub fn num_fragments(&self) -> u64 {
        (self.end - self.start) as u64 + 1
    }
}
impl Debug for FragmentRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum NodeCommand {
    Hello,
    Confirm,
    Deny,
    Exit,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Datagram {
    Data {
        writer_id: u16,
        sequence_id: SequenceId,
        fragment_index: u16,
        payload: Bytes,
    },
    Ack {
        reader_id: u16,
        writer_id: u16,
        sequence_id: SequenceId,
    },
    Nack {
        reader_id: u16,
        writer_id: u16,
        sequence_id: SequenceId,
        ranges: Vec<FragmentRange>,
    },
    AckReq {
        writer_id: u16,
        last_fragment: u16,
        sequence_id: SequenceId,
    },
    Node {
        command: NodeCommand,
        connection_id: u16,
    },
    Count {
        connection_id: u16,
        n_children: u32,
    },
}

impl Datagram {
    /// Build a NACK, refusing range sets whose serialization would not fit
    ///  into a single datagram of `mtu` bytes.
    pub fn nack(
        reader_id: u16,
        writer_id: u16,
        sequence_id: SequenceId,
        ranges: Vec<FragmentRange>,
        mtu: usize,
    ) -> anyhow::Result<Datagram> {
        if ranges.is_empty() {
            bail!("NACK without ranges");
        }
        if ranges.len() > u8::MAX as usize {
            bail!("{} NACK ranges exceed the count field", ranges.len());
        }
        if ranges.len() > max_nack_ranges(mtu) {
            bail!(
                "{} NACK ranges exceed the {} that fit into the MTU of {}",
                ranges.len(),
                max_nack_ranges(mtu),
                mtu
            );
        }
        Ok(Datagram::Nack {
            reader_id,
            writer_id,
            sequence_id,
            ranges,
        })
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            Datagram::Data {
                writer_id,
                sequence_id,
                fragment_index,
                payload,
            } => {
                buf.put_u16_le(TYPE_DATA);
                buf.put_u32_le(pack_write_seq(*writer_id, *sequence_id));
                buf.put_u32_le(((*fragment_index as u32) << 16) | payload.len() as u32);
                buf.put_slice(payload);
            }
            Datagram::Ack {
                reader_id,
                writer_id,
                sequence_id,
            } => {
                buf.put_u16_le(TYPE_ACK);
                buf.put_u16_le(*reader_id);
                buf.put_u16_le(*writer_id);
                buf.put_u16_le(sequence_id.to_raw());
            }
            Datagram::Nack {
                reader_id,
                writer_id,
                sequence_id,
                ranges,
            } => {
                buf.put_u16_le(TYPE_NACK);
                buf.put_u16_le(*reader_id);
                buf.put_u16_le(*writer_id);
                buf.put_u16_le(sequence_id.to_raw());
                buf.put_u8(ranges.len() as u8);
                buf.put_u8(0);
                for range in ranges {
                    buf.put_u32_le(((range.start as u32) << 16) | range.end as u32);
                }
            }
            Datagram::AckReq {
                writer_id,
                last_fragment,
                sequence_id,
            } => {
                buf.put_u16_le(TYPE_ACKREQ);
                buf.put_u16_le(*writer_id);
                buf.put_u16_le(*last_fragment);
                buf.put_u16_le(sequence_id.to_raw());
            }
            Datagram::Node {
                command,
                connection_id,
            } => {
                let tag = match command {
                    NodeCommand::Hello => TYPE_ID_HELLO,
                    NodeCommand::Confirm => TYPE_ID_CONFIRM,
                    NodeCommand::Deny => TYPE_ID_DENY,
                    NodeCommand::Exit => TYPE_ID_EXIT,
                };
                buf.put_u16_le(tag);
                buf.put_u16_le(*connection_id);
            }
            Datagram::Count {
                connection_id,
                n_children,
            } => {
                buf.put_u16_le(TYPE_COUNT_NODE);
                buf.put_u16_le(*connection_id);
                buf.put_u32_le(*n_children);
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Datagram> {
        let tag = buf.try_get_u16_le()?;
        match tag {
            TYPE_DATA => {
                let (writer_id, sequence_id) = unpack_write_seq(buf.try_get_u32_le()?);
                let data_id_len = buf.try_get_u32_le()?;
                let fragment_index = (data_id_len >> 16) as u16;
                let length = (data_id_len & 0xffff) as usize;
                if buf.remaining() < length {
                    bail!(
                        "DATA datagram declares {} payload bytes but carries only {}",
                        length,
                        buf.remaining()
                    );
                }
                Ok(Datagram::Data {
                    writer_id,
                    sequence_id,
                    fragment_index,
                    payload: buf.copy_to_bytes(length),
                })
            }
            TYPE_ACK => Ok(Datagram::Ack {
                reader_id: buf.try_get_u16_le()?,
                writer_id: buf.try_get_u16_le()?,
                sequence_id: SequenceId::from_raw(buf.try_get_u16_le()?),
            }),
            TYPE_NACK => {
                let reader_id = buf.try_get_u16_le()?;
                let writer_id = buf.try_get_u16_le()?;
                let sequence_id = SequenceId::from_raw(buf.try_get_u16_le()?);
                let count = buf.try_get_u8()?;
                let _pad = buf.try_get_u8()?;
                let mut ranges = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let packed = buf.try_get_u32_le()?;
                    let start = (packed >> 16) as u16;
                    let end = (packed & 0xffff) as u16;
                    if start > end {
                        bail!("NACK range {}..{} is inverted", start, end);
                    }
                    ranges.push(FragmentRange { start, end });
                }
                Ok(Datagram::Nack {
                    reader_id,
                    writer_id,
                    sequence_id,
                    ranges,
                })
            }
            TYPE_ACKREQ => Ok(Datagram::AckReq {
                writer_id: buf.try_get_u16_le()?,
                last_fragment: buf.try_get_u16_le()?,
                sequence_id: SequenceId::from_raw(buf.try_get_u16_le()?),
            }),
            TYPE_ID_HELLO | TYPE_ID_CONFIRM | TYPE_ID_DENY | TYPE_ID_EXIT => {
                let command = match tag {
                    TYPE_ID_HELLO => NodeCommand::Hello,
                    TYPE_ID_CONFIRM => NodeCommand::Confirm,
                    TYPE_ID_DENY => NodeCommand::Deny,
                    _ => NodeCommand::Exit,
                };
                Ok(Datagram::Node {
                    command,
                    connection_id: buf.try_get_u16_le()?,
                })
            }
            TYPE_COUNT_NODE => Ok(Datagram::Count {
                connection_id: buf.try_get_u16_le()?,
                n_children: buf.try_get_u32_le()?,
            }),
            _ => bail!("unknown datagram type tag {}", tag),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::data_empty(Datagram::Data { writer_id: 3, sequence_id: SequenceId::from_raw(7), fragment_index: 0, payload: Bytes::new() })]
    #[case::data_payload(Datagram::Data { writer_id: 0xffff, sequence_id: SequenceId::from_raw(0xffff), fragment_index: 9, payload: Bytes::from_static(b"hello") })]
    #[case::ack(Datagram::Ack { reader_id: 1, writer_id: 2, sequence_id: SequenceId::from_raw(3) })]
    #[case::nack_one(Datagram::Nack { reader_id: 1, writer_id: 2, sequence_id: SequenceId::from_raw(3), ranges: vec![FragmentRange::new(2, 2)] })]
    #[case::nack_many(Datagram::Nack { reader_id: 1, writer_id: 2, sequence_id: SequenceId::from_raw(3), ranges: vec![FragmentRange::new(1, 1), FragmentRange::new(3, 7)] })]
    #[case::ackreq(Datagram::AckReq { writer_id: 4, last_fragment: 3, sequence_id: SequenceId::from_raw(9) })]
    #[case::hello(Datagram::Node { command: NodeCommand::Hello, connection_id: 42 })]
    #[case::confirm(Datagram::Node { command: NodeCommand::Confirm, connection_id: 42 })]
    #[case::deny(Datagram::Node { command: NodeCommand::Deny, connection_id: 42 })]
    #[case::exit(Datagram::Node { command: NodeCommand::Exit, connection_id: 42 })]
    #[case::count(Datagram::Count { connection_id: 8, n_children: 3 })]
    fn test_roundtrip(#[case] datagram: Datagram) {
        let mut buf = BytesMut::new();
        datagram.ser(&mut buf);
        let mut b: &[u8] = &buf;
        let deser = Datagram::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(datagram, deser);
    }

    #[test]
    fn test_data_layout() {
        let datagram = Datagram::Data {
            writer_id: 0x0102,
            sequence_id: SequenceId::from_raw(0x0304),
            fragment_index: 0x0506,
            payload: Bytes::from_static(&[0xaa, 0xbb]),
        };
        let mut buf = BytesMut::new();
        datagram.ser(&mut buf);
        assert_eq!(
            buf.as_ref(),
            &[1, 0, 0x04, 0x03, 0x02, 0x01, 0x02, 0x00, 0x06, 0x05, 0xaa, 0xbb]
        );
        assert_eq!(buf.len(), DATA_HEADER_LEN + 2);
    }

    #[test]
    fn test_nack_layout() {
        let datagram = Datagram::Nack {
            reader_id: 1,
            writer_id: 2,
            sequence_id: SequenceId::from_raw(3),
            ranges: vec![FragmentRange::new(0x0a, 0x0b)],
        };
        let mut buf = BytesMut::new();
        datagram.ser(&mut buf);
        assert_eq!(
            buf.as_ref(),
            &[3, 0, 1, 0, 2, 0, 3, 0, 1, 0, 0x0b, 0x00, 0x0a, 0x00]
        );
        assert_eq!(buf.len(), NACK_HEADER_LEN + 4);
    }

    #[rstest]
    #[case::typical(1470, 365)]
    #[case::tiny(64, 13)]
    fn test_max_nack_ranges(#[case] mtu: usize, #[case] expected: usize) {
        assert_eq!(max_nack_ranges(mtu), expected);
    }

    #[test]
    fn test_nack_refuses_over_mtu() {
        let ranges = (0..14).map(|i| FragmentRange::new(2 * i, 2 * i)).collect();
        assert!(Datagram::nack(1, 2, SequenceId::ZERO, ranges, 64).is_err());

        let ranges = (0..13).map(|i| FragmentRange::new(2 * i, 2 * i)).collect();
        assert!(Datagram::nack(1, 2, SequenceId::ZERO, ranges, 64).is_ok());
    }

    #[test]
    fn test_nack_refuses_empty() {
        assert!(Datagram::nack(1, 2, SequenceId::ZERO, vec![], 1470).is_err());
    }

    #[rstest]
    #[case::truncated_header(vec![1, 0, 0, 0])]
    #[case::data_short_payload(vec![1, 0, 0, 0, 0, 0, 5, 0, 0, 0, 0xaa])]
    #[case::unknown_tag(vec![99, 0, 1, 2])]
    #[case::inverted_nack_range(vec![3, 0, 1, 0, 2, 0, 3, 0, 1, 0, 0x01, 0x00, 0x02, 0x00])]
    fn test_deser_rejects(#[case] bytes: Vec<u8>) {
        let mut b: &[u8] = &bytes;
        assert!(Datagram::deser(&mut b).is_err());
    }
}
