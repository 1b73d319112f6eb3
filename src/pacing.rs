//! Outbound pacing and error-driven send rate adaptation.
//!
//! The pacer is a token bucket: every outgoing datagram pays its size in
//!  bytes, and a sender that has overdrawn the bucket sleeps until the bucket
//!  catches up. The bucket's fill rate is the connection's send rate, which is
//!  adjusted after every retransmission round based on the observed error
//!  percentage.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Never adapt below this rate, so a burst of errors cannot stall the
///  connection entirely.
const MIN_SEND_RATE: f64 = 16.0 * 1024.0;

/// Token headroom: how many bytes may be sent back-to-back without pacing.
const BURST_BYTES: f64 = 64.0 * 1024.0;

/// Computes the send-rate adjustment from a retransmission round's error count.
pub struct RateAdapter {
    base_rate: f32,
    upscale: f32,
    downscale: f32,
    max: f32,
}

impl RateAdapter {
    pub fn new(base_rate: f32, upscale: f32, downscale: f32, max: f32) -> RateAdapter {
        RateAdapter { base_rate, upscale, downscale, max }
    }

    /// Returns the rate change in percent, positive meaning 'speed up'.
    ///  The magnitude is capped at the configured maximum.
    pub fn delta_percent(&self, errors: u64, n_fragments: u64) -> f32 {
        if n_fragments == 0 {
            return 0.0;
        }

        let error_rate = (errors as f32 / n_fragments as f32) * 100.0 - self.base_rate;
        if error_rate < 0.0 {
            (-error_rate * self.upscale).min(self.max)
        }
        else {
            -(error_rate / self.downscale).min(self.max)
        }
    }
}

struct PacerState {
    /// bytes per second
    rate: f64,
    /// may go negative: a sender that overdraws sleeps off the debt
    tokens: f64,
    last_refill: Instant,
}

impl PacerState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(BURST_BYTES);
    }
}

/// Paces outgoing datagrams against the current send rate.
pub struct SendPacer {
    state: Mutex<PacerState>,
}

impl SendPacer {
    pub fn new(rate: u64) -> SendPacer {
        SendPacer {
            state: Mutex::new(PacerState {
                rate: (rate as f64).max(MIN_SEND_RATE),
                tokens: BURST_BYTES,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Blocks until the bucket allows another `bytes` to go out.
    pub async fn wait_writable(&self, bytes: usize) {
        let sleep_for = {
            let mut state = self.state.lock().unwrap();
            state.refill(Instant::now());
            state.tokens -= bytes as f64;
            if state.tokens < 0.0 {
                Duration::from_secs_f64(-state.tokens / state.rate)
            }
            else {
                Duration::ZERO
            }
        };

        if !sleep_for.is_zero() {
            trace!("send pacer: sleeping {:?}", sleep_for);
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// Adjusts the send rate by the given percentage (positive = faster),
    ///  bounded below so the connection never stalls completely.
    pub fn adapt_send_rate(&self, delta_percent: f32) {
        if delta_percent == 0.0 {
            return;
        }

        let mut state = self.state.lock().unwrap();
        state.rate = (state.rate * (1.0 + delta_percent as f64 / 100.0)).max(MIN_SEND_RATE);
        debug!("adapted send rate by {:.1}% to {} B/s", delta_percent, state.rate as u64);
    }

    pub fn send_rate(&self) -> u64 {
        self.state.lock().unwrap().rate as u64
    }
}
