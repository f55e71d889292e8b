use std::time::Duration;
use tokio::time::Instant;
use tracing::info;
use crate::host::Host;

/// Informational traffic counters of a circuit
#[derive(Debug, Clone)]
pub struct CircuitStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
    pub packets_lost: u64,
    pub packets_resent: u64,
    /// reliable packets that timed out or were aborted
    pub packets_failed: u64,
    /// resends since the last call to [CircuitStats::dump_resend_count_and_reset]
    pub current_resend_count: u64,

    period_start: Instant,
    bytes_in_this_period: u64,
    bytes_out_this_period: u64,
    pub bytes_in_last_period: u64,
    pub bytes_out_last_period: u64,
    pub last_period_length: Option<Duration>,
    pub peak_bps_in: f64,
    pub peak_bps_out: f64,
}

impl CircuitStats {
    pub fn new(now: Instant) -> CircuitStats {
        CircuitStats {
            bytes_in: 0,
            bytes_out: 0,
            packets_in: 0,
            packets_out: 0,
            packets_lost: 0,
            packets_resent: 0,
            packets_failed: 0,
            current_resend_count: 0,
            period_start: now,
            bytes_in_this_period: 0,
            bytes_out_this_period: 0,
            bytes_in_last_period: 0,
            bytes_out_last_period: 0,
            last_period_length: None,
            peak_bps_in: 0.0,
            peak_bps_out: 0.0,
        }
    }

    pub fn add_bytes_in(&mut self, bytes: usize) {
        self.bytes_in += bytes as u64;
        self.bytes_in_this_period += bytes as u64;
    }

    pub fn add_bytes_out(&mut self, bytes: usize) {
        self.bytes_out += bytes as u64;
        self.bytes_out_this_period += bytes as u64;
    }

    pub fn add_resent(&mut self, num_resent: u32) {
        self.packets_resent += num_resent as u64;
        self.current_resend_count += num_resent as u64;
    }

    /// Closes the current accounting period if it is longer than `period`, updating peak bit rates
    pub fn check_period_time(&mut self, period: Duration, now: Instant) {
        let period_length = now.saturating_duration_since(self.period_start);
        if period_length <= period {
            return;
        }

        let secs = period_length.as_secs_f64();
        self.peak_bps_in = self.peak_bps_in.max(self.bytes_in_this_period as f64 * 8.0 / secs);
        self.peak_bps_out = self.peak_bps_out.max(self.bytes_out_this_period as f64 * 8.0 / secs);

        self.bytes_in_last_period = std::mem::take(&mut self.bytes_in_this_period);
        self.bytes_out_last_period = std::mem::take(&mut self.bytes_out_this_period);
        self.last_period_length = Some(period_length);
        self.period_start = now;
    }

    pub fn dump_resend_count_and_reset(&mut self, host: &Host) {
        if self.current_resend_count > 0 {
            info!("circuit {:?} resent {} packets", host, self.current_resend_count);
            self.current_resend_count = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_host_from_number;

    #[test]
    fn test_period() {
        let start = Instant::now();
        let mut stats = CircuitStats::new(start);

        stats.add_bytes_in(1000);
        stats.add_bytes_out(500);
        stats.check_period_time(Duration::from_secs(5), start + Duration::from_secs(5));
        assert_eq!(stats.last_period_length, None);

        stats.check_period_time(Duration::from_secs(5), start + Duration::from_secs(8));
        assert_eq!(stats.last_period_length, Some(Duration::from_secs(8)));
        assert_eq!(stats.bytes_in_last_period, 1000);
        assert_eq!(stats.bytes_out_last_period, 500);
        assert_eq!(stats.peak_bps_in, 1000.0);
        assert_eq!(stats.peak_bps_out, 500.0);

        // a quieter period does not reduce the peak
        stats.add_bytes_in(100);
        stats.check_period_time(Duration::from_secs(5), start + Duration::from_secs(16));
        assert_eq!(stats.bytes_in_last_period, 100);
        assert_eq!(stats.bytes_out_last_period, 0);
        assert_eq!(stats.peak_bps_in, 1000.0);

        assert_eq!(stats.bytes_in, 1100);
        assert_eq!(stats.bytes_out, 500);
    }

    #[test]
    fn test_resend_count() {
        let mut stats = CircuitStats::new(Instant::now());
        stats.add_resent(3);
        stats.add_resent(2);
        assert_eq!(stats.current_resend_count, 5);

        stats.dump_resend_count_and_reset(&test_host_from_number(1));
        assert_eq!(stats.current_resend_count, 0);
        assert_eq!(stats.packets_resent, 5);
    }
}
