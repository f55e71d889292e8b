use std::time::Duration;
use tokio::time::Instant;

/// Bandwidth budget consulted by a circuit before it resends packets.
#[cfg_attr(test, mockall::automock)]
pub trait BandwidthThrottle: Send {
    /// Checks if sending `bits` now would exceed the budget, without consuming anything
    fn check_overflow(&mut self, bits: f32, now: Instant) -> bool;

    /// Consumes `bits` from the budget, returning `true` if the budget was exceeded. The bits are
    ///  consumed either way since the data was already sent.
    fn throttle_overflow(&mut self, bits: f32, now: Instant) -> bool;
}

/// Token bucket: bits accumulate at a fixed rate, capped at a burst allowance of `lookahead`
///  worth of bits. Consuming more than is available drives the bucket negative, and it takes
///  some time to recover.
#[derive(Debug)]
pub struct ResendThrottle {
    bits_per_second: f32,
    lookahead: Duration,
    available: f32,
    last_send_time: Instant,
}

impl ResendThrottle {
    pub fn new(bits_per_second: f32, lookahead: Duration, now: Instant) -> ResendThrottle {
        ResendThrottle {
            bits_per_second,
            lookahead,
            available: 0.0,
            last_send_time: now,
        }
    }

    fn lookahead_amount(&self) -> f32 {
        self.bits_per_second * self.lookahead.as_secs_f32()
    }

    pub fn available(&self, now: Instant) -> f32 {
        let elapsed = now.saturating_duration_since(self.last_send_time).as_secs_f32();
        self.available + self.bits_per_second * elapsed
    }

    /// Changes the rate, keeping bits accumulated at the old rate up to now
    pub fn set_rate(&mut self, bits_per_second: f32, now: Instant) {
        self.available = self.available(now);
        self.last_send_time = now;
        self.bits_per_second = bits_per_second;
    }

    pub fn rate(&self) -> f32 {
        self.bits_per_second
    }
}

impl BandwidthThrottle for ResendThrottle {
    fn check_overflow(&mut self, bits: f32, now: Instant) -> bool {
        let available = self.available(now);
        // a completely open channel allows a send of any size, so low rates can still send big packets
        !(available >= self.lookahead_amount() || available > bits)
    }

    fn throttle_overflow(&mut self, bits: f32, now: Instant) -> bool {
        self.available = self.available(now);
        self.last_send_time = now;

        let lookahead_amount = self.lookahead_amount();
        let overflow = if self.available >= lookahead_amount {
            self.available = lookahead_amount;
            false
        }
        else {
            self.available <= bits
        };

        self.available -= bits;
        overflow
    }
}
