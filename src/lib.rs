//! A reliable sequenced multicast transport ("RSM") layered over unreliable UDP
//!  multicast, plus the master-side change manager that uses it to propagate
//!  versioned object state from one master to many slave subscribers.
//!
//! ## Design goals
//!
//! * Multiple writers share a single multicast group; each writer sequences its
//!   own stream independently. There is no ordering across writers.
//! * The default is to assume delivery unless a negative ack is sent: receivers
//!   detect gaps and request selective retransmission (NAK), the writer answers
//!   an explicit ACK request at the end of each write.
//! * A write blocks until every known peer on the group has acknowledged the
//!   sequence, or until the retry budget is exhausted - this transport trades
//!   writer latency for the guarantee that a successful `write` was fully
//!   delivered everywhere.
//! * Designed for a single broadcast domain (LAN / data center): peers discover
//!   each other on the group itself, with random 16-bit ids and a deny-and-retry
//!   collision protocol. There is no NAT traversal and no encryption.
//! * The send rate adapts to the observed retransmission rate
//!   (additive/multiplicative, in percent of the current rate).
//! * A writer consumes its own multicast: self-delivery runs through the same
//!   reassembly slots as remote data, so local readers and remote readers see
//!   the identical state machine.
//!
//! ## Wire format
//!
//! All datagrams start with a `u16` type tag; all integers are little-endian.
//! Layouts are documented per type in [datagram]. Every control datagram fits
//! into a single MTU; DATA carries at most `mtu - header` payload bytes.
//!
//! ## Layering
//!
//! The change manager ([cm]) sits above the transport at the master node:
//! slave commits arrive as sequences of command packets, are reassembled into
//! per-commit input streams, queued in completion order, and applied to the
//! owning object on `sync`.

pub mod cm;
pub mod config;
pub mod connection;
pub mod datagram;
pub mod pacing;
pub mod peer;
pub mod repeat;
pub mod seq;
pub mod slots;
pub mod socket;
pub mod stats;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
