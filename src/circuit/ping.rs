use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::config::CircuitConfig;

/// Round trip time measurement and the 'blocked' state of a circuit, both driven by pings.
///
/// Ping ids are a wrapping u8. A ping response carries the id of the ping it answers, so the
///  difference to the id of the last ping sent is the number of pings still in transit.
pub struct PingState {
    heartbeat_interval: Duration,
    alpha: f64,
    averaged_min: Duration,
    averaged_max: Duration,
    start_block: u32,
    release_block: u32,

    last_ping_id: u8,
    /// when the last ping was sent
    ping_time: Instant,
    last_ping_received_time: Instant,
    pings_in_transit: u32,
    blocked: bool,

    ping_delay: Duration,
    ping_delay_averaged: Duration,
}

impl PingState {
    pub fn new(config: &CircuitConfig, now: Instant) -> PingState {
        PingState {
            heartbeat_interval: config.heartbeat_interval,
            alpha: config.averaged_ping_alpha,
            averaged_min: config.averaged_ping_min,
            averaged_max: config.averaged_ping_max,
            start_block: config.ping_start_block,
            release_block: config.ping_release_block,
            last_ping_id: 0,
            ping_time: now,
            last_ping_received_time: now,
            pings_in_transit: 0,
            blocked: false,
            ping_delay: config.initial_ping,
            ping_delay_averaged: config.initial_ping,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn pings_in_transit(&self) -> u32 {
        self.pings_in_transit
    }

    pub fn last_ping_id(&self) -> u8 {
        self.last_ping_id
    }

    pub fn last_ping_received_time(&self) -> Instant {
        self.last_ping_received_time
    }

    /// the most recent raw round trip time
    pub fn ping_delay(&self) -> Duration {
        self.ping_delay
    }

    /// the exponential average of round trip times, without taking pings in transit into account
    pub fn ping_delay_averaged_raw(&self) -> Duration {
        self.ping_delay_averaged
    }

    pub fn next_ping_id(&mut self) -> u8 {
        self.last_ping_id = self.last_ping_id.wrapping_add(1);
        self.last_ping_id
    }

    /// Forgets about pings in transit, e.g. when the circuit comes back to life
    pub fn reset(&mut self, now: Instant) {
        self.last_ping_received_time = now;
        self.pings_in_transit = 0;
        self.blocked = false;
    }

    /// To be called when a ping is sent
    pub fn ping_timer_start(&mut self, now: Instant) {
        self.ping_time = now;
        self.pings_in_transit += 1;

        if !self.blocked && self.pings_in_transit > self.start_block {
            debug!("{} pings in transit - blocking", self.pings_in_transit);
            self.blocked = true;
        }
    }

    /// To be called when a ping response arrives
    pub fn ping_timer_stop(&mut self, ping_id: u8, now: Instant) {
        self.last_ping_received_time = now;

        // each ping still in transit stands for one heartbeat interval of round trip time
        let delta_ping = self.last_ping_id.wrapping_sub(ping_id) as u32;
        let raw = self.heartbeat_interval * delta_ping + now.saturating_duration_since(self.ping_time);
        self.set_ping_delay(raw);

        self.pings_in_transit = delta_ping;
        if self.blocked && self.pings_in_transit <= self.release_block {
            debug!("{} pings in transit - unblocking", self.pings_in_transit);
            self.blocked = false;
        }
    }

    fn set_ping_delay(&mut self, raw: Duration) {
        self.ping_delay = raw;

        let averaged = self.ping_delay_averaged.as_secs_f64() * (1.0 - self.alpha)
            + raw.as_secs_f64() * self.alpha;
        self.ping_delay_averaged = Duration::from_secs_f64(averaged)
            .clamp(self.averaged_min, self.averaged_max);
        trace!("ping delay {:?}, averaged {:?}", self.ping_delay, self.ping_delay_averaged);
    }

    /// An estimate of the round trip time of pings that are still in transit, zero if there are
    ///  none. This keeps retry timeouts growing while a circuit stops answering pings.
    pub fn ping_in_transit_time(&self, now: Instant) -> Duration {
        if self.pings_in_transit == 0 {
            return Duration::ZERO;
        }
        (self.heartbeat_interval * self.pings_in_transit)
            .saturating_sub(Duration::from_secs(1))
            + now.saturating_duration_since(self.ping_time)
    }

    /// The effective round trip time for timeout calculations
    pub fn ping_delay_averaged(&self, now: Instant) -> Duration {
        self.ping_in_transit_time(now)
            .max(self.ping_delay_averaged)
            .min(self.averaged_max)
    }
}
