use crate::datagram::{max_nack_ranges, DATA_HEADER_LEN};
use anyhow::bail;
use std::time::Duration;

/// Tuning knobs for an RSM connection. All values are read once when the
///  connection starts listening and cached in an [EffectiveRsmConfig] - they
///  are not re-read while the connection is live.
pub struct RsmConfig {
    /// The UDP payload size this protocol assumes, including RSM headers.
    ///
    /// The protocol enforces non-fragmentation at the IP level, so this must
    ///  be supported end-to-end on the broadcast domain. With full Ethernet
    ///  frames and no optional IP headers this is `1500 - 20 - 8 = 1472` for
    ///  IPV4; the default leaves a little slack. Choosing it too big causes
    ///  silent drops, choosing it too small wastes bandwidth.
    pub mtu: usize,

    /// Number of DATA fragments per acknowledgement window. Together with the
    ///  MTU this determines the maximum size of a single `write()`:
    ///  `(mtu - header) * ack_frequency` bytes.
    pub ack_frequency: u16,

    /// Interval after which a writer waiting for acknowledgements re-sends its
    ///  ACK request.
    pub ack_timeout: Duration,

    /// Number of consecutive ack timeouts after which a write is considered
    ///  failed and the connection is torn down.
    pub max_timeouts: u32,

    /// How long the writer waits after the first NACK of a round before
    ///  draining the queue, so that NACKs from several receivers coalesce into
    ///  one retransmission pass.
    pub nack_delay: Duration,

    /// Initial send rate in bytes per second.
    pub bandwidth: u64,

    /// Error percentage that is tolerated without slowing down.
    pub error_base_rate: f32,
    /// Scale factor for speeding up when the error rate is below the base rate.
    pub error_upscale: f32,
    /// Damping divisor for slowing down when the error rate is above the base rate.
    pub error_downscale: f32,
    /// Upper bound for a single rate adjustment, in percent.
    pub error_max: f32,
}

impl Default for RsmConfig {
    fn default() -> RsmConfig {
        RsmConfig {
            mtu: 1470,
            ack_frequency: 64,
            ack_timeout: Duration::from_millis(20),
            max_timeouts: 40,
            nack_delay: Duration::from_millis(1),
            bandwidth: 100 * 1024 * 1024,
            error_base_rate: 2.0,
            error_upscale: 5.0,
            error_downscale: 2.0,
            error_max: 25.0,
        }
    }
}

impl RsmConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu < 100 {
            bail!("MTU of {} is too small", self.mtu);
        }
        if self.ack_frequency == 0 {
            bail!("ack frequency must be at least 1");
        }
        if self.max_timeouts == 0 {
            bail!("timeout budget must be at least 1");
        }
        if self.error_max <= 0.0 || self.error_downscale <= 0.0 {
            bail!("rate adaptation constants must be positive");
        }
        Ok(())
    }

    pub fn effective(&self) -> EffectiveRsmConfig {
        let payload_size = self.mtu - DATA_HEADER_LEN;
        EffectiveRsmConfig {
            mtu: self.mtu,
            ack_frequency: self.ack_frequency,
            payload_size,
            buffer_size: payload_size * self.ack_frequency as usize,
            // the wire format counts ranges in a u8
            max_nack_ranges: max_nack_ranges(self.mtu).min(u8::MAX as usize),
            ack_timeout: self.ack_timeout,
            max_timeouts: self.max_timeouts,
            nack_delay: self.nack_delay,
            bandwidth: self.bandwidth,
            error_base_rate: self.error_base_rate,
            error_upscale: self.error_upscale,
            error_downscale: self.error_downscale,
            error_max: self.error_max,
        }
    }
}

/// The validated, derived configuration a connection actually works with.
#[derive(Clone)]
pub struct EffectiveRsmConfig {
    pub mtu: usize,
    pub ack_frequency: u16,
    /// payload bytes per DATA fragment: `mtu - DATA_HEADER_LEN`
    pub payload_size: usize,
    /// maximum bytes per `write()`: `payload_size * ack_frequency`
    pub buffer_size: usize,
    /// maximum NACK ranges fitting into one datagram
    pub max_nack_ranges: usize,
    pub ack_timeout: Duration,
    pub max_timeouts: u32,
    pub nack_delay: Duration,
    pub bandwidth: u64,
    pub error_base_rate: f32,
    pub error_upscale: f32,
    pub error_downscale: f32,
    pub error_max: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(RsmConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects() {
        assert!(RsmConfig { mtu: 50, ..RsmConfig::default() }.validate().is_err());
        assert!(RsmConfig { ack_frequency: 0, ..RsmConfig::default() }.validate().is_err());
        assert!(RsmConfig { max_timeouts: 0, ..RsmConfig::default() }.validate().is_err());
        assert!(RsmConfig { error_max: 0.0, ..RsmConfig::default() }.validate().is_err());
    }

    #[test]
    fn test_effective_derivation() {
        let config = RsmConfig { mtu: 64, ack_frequency: 4, ..RsmConfig::default() };
        let effective = config.effective();
        assert_eq!(effective.payload_size, 54);
        assert_eq!(effective.buffer_size, 216);
        assert_eq!(effective.max_nack_ranges, 13);
    }
}
