use std::time::Duration;

/// Transfer-timeout policy shared by every put/get, grounded in the
/// `original_source/taskvine/src/manager/vine_manager_put.c` /
/// `vine_manager_get.c` deadline computation: `max(floor, length / rate)`,
/// where `rate` is the observed rate divided by an outlier factor so a
/// single slow transfer doesn't immediately trip the deadline.
#[derive(Debug, Clone, Copy)]
pub struct TransferTimingPolicy {
    pub min_transfer_timeout: Duration,
    pub foreman_transfer_timeout: Duration,
    pub default_transfer_rate_bytes_per_sec: f64,
    pub transfer_outlier_factor: f64,
}

impl Default for TransferTimingPolicy {
    fn default() -> Self {
        Self {
            min_transfer_timeout: Duration::from_secs(10),
            foreman_transfer_timeout: Duration::from_secs(60),
            default_transfer_rate_bytes_per_sec: 1_000_000.0,
            transfer_outlier_factor: 10.0,
        }
    }
}

impl TransferTimingPolicy {
    pub fn deadline(&self, length_bytes: u64, observed_rate_bps: Option<f64>, is_forwarding: bool) -> Duration {
        let floor = if is_forwarding {
            self.foreman_transfer_timeout
        } else {
            self.min_transfer_timeout
        };
        let rate = observed_rate_bps
            .filter(|r| *r > 0.0)
            .unwrap_or(self.default_transfer_rate_bytes_per_sec)
            / self.transfer_outlier_factor.max(1.0);
        let by_rate = Duration::from_secs_f64((length_bytes as f64 / rate.max(1.0)).max(0.0));
        floor.max(by_rate)
    }
}

/// Tracks a rolling observed rate for bandwidth-based deadlines and
/// optional bandwidth shaping (delaying after a transfer so an
/// administrator-set cap is not exceeded).
#[derive(Debug, Clone, Copy, Default)]
pub struct RateSample {
    pub bytes: u64,
    pub elapsed: Duration,
}

impl RateSample {
    pub fn bytes_per_sec(&self) -> Option<f64> {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            None
        } else {
            Some(self.bytes as f64 / secs)
        }
    }
}

/// If `cap_bytes_per_sec` is set, returns how long the caller should sleep
/// after moving `bytes` in `elapsed` to stay under the cap.
pub fn shaping_delay(bytes: u64, elapsed: Duration, cap_bytes_per_sec: Option<f64>) -> Duration {
    let Some(cap) = cap_bytes_per_sec.filter(|c| *c > 0.0) else {
        return Duration::ZERO;
    };
    let wanted = Duration::from_secs_f64(bytes as f64 / cap);
    wanted.saturating_sub(elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_respects_floor_for_small_transfers() {
        let policy = TransferTimingPolicy::default();
        let d = policy.deadline(1, Some(1_000_000.0), false);
        assert_eq!(d, policy.min_transfer_timeout);
    }

    #[test]
    fn deadline_scales_with_length_for_large_transfers() {
        let policy = TransferTimingPolicy::default();
        let d = policy.deadline(1_000_000_000, Some(1_000_000.0), false);
        assert!(d > policy.min_transfer_timeout);
    }

    #[test]
    fn forwarding_worker_gets_larger_floor() {
        let policy = TransferTimingPolicy::default();
        let d = policy.deadline(1, Some(1_000_000.0), true);
        assert_eq!(d, policy.foreman_transfer_timeout);
    }

    #[test]
    fn shaping_delay_is_zero_without_cap() {
        assert_eq!(shaping_delay(1_000_000, Duration::from_millis(1), None), Duration::ZERO);
    }
}
