use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

/// Instrumentation counters for one connection. Updated from the I/O loop and
///  the writing task with relaxed ordering - these are diagnostics, not
///  protocol state.
#[derive(Default)]
pub struct ConnectionStats {
    pub bytes_written: AtomicU64,
    pub bytes_read: AtomicU64,
    pub datagrams_sent: AtomicU64,
    pub datagrams_repeated: AtomicU64,
    pub ack_requests_sent: AtomicU64,
    pub acks_read: AtomicU64,
    pub acks_accepted: AtomicU64,
    pub nacks_sent: AtomicU64,
    pub nacks_read: AtomicU64,
    pub write_timeouts: AtomicU64,
}

impl ConnectionStats {
    pub fn count(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }
}

impl Debug for ConnectionStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        write!(
            f,
            "wrote {}B in {} dgrams ({} repeated), read {}B, {} ack reqs, {}/{} acks accepted, {} nacks out, {} nacks in, {} timeouts",
            get(&self.bytes_written),
            get(&self.datagrams_sent),
            get(&self.datagrams_repeated),
            get(&self.bytes_read),
            get(&self.ack_requests_sent),
            get(&self.acks_accepted),
            get(&self.acks_read),
            get(&self.nacks_sent),
            get(&self.nacks_read),
            get(&self.write_timeouts),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_summary() {
        let stats = ConnectionStats::default();
        ConnectionStats::count(&stats.bytes_written, 500);
        ConnectionStats::count(&stats.datagrams_sent, 4);
        ConnectionStats::count(&stats.acks_read, 2);
        ConnectionStats::count(&stats.acks_accepted, 2);

        let summary = format!("{:?}", stats);
        assert_eq!(
            summary,
            "wrote 500B in 4 dgrams (0 repeated), read 0B, 0 ack reqs, 2/2 acks accepted, 0 nacks out, 0 nacks in, 0 timeouts"
        );
    }
}
