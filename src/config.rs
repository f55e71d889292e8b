use std::time::Duration;
use anyhow::bail;
use crate::packet_header::PacketHeader;
use crate::packet_id::SequenceRing;

#[derive(Clone, Debug)]
pub struct CircuitConfig {
    /// Packet ids are counted modulo `2^sequence_bits`. Both ends of a circuit must agree on this.
    pub sequence_bits: u8,

    /// Nominal time between pings on a circuit. Each circuit's actual interval is randomized by
    ///  +/- 10% to avoid all circuits pinging in lockstep.
    pub heartbeat_interval: Duration,
    /// A circuit that did not receive a ping response for this long is considered dead
    pub heartbeat_timeout: Duration,

    pub default_reliable_retries: u8,
    /// lower bound for ping based retry timeouts
    pub min_reliable_timeout: Duration,
    /// ping based retry timeout as a multiple of the averaged round trip time
    pub reliable_timeout_factor: f64,

    /// A gap in the incoming sequence is declared lost after this multiple of the averaged round
    ///  trip time, capped at `max_lost_timeout`
    pub lost_timeout_factor: f64,
    pub max_lost_timeout: Duration,

    /// round trip time assumed for a new circuit before the first ping response
    pub initial_ping: Duration,
    /// weight of a new sample in the exponential average of round trip times
    pub averaged_ping_alpha: f64,
    pub averaged_ping_min: Duration,
    pub averaged_ping_max: Duration,

    /// A circuit is blocked when more than this number of pings is outstanding...
    pub ping_start_block: u32,
    /// ... and it is unblocked when the number drops to this value
    pub ping_release_block: u32,

    /// Duplicate suppression entries numerically above the highest seen id are only relevant
    ///  immediately after the sequence wrapped. They are dropped after this timeout.
    pub duplicate_suppression_timeout: Duration,

    pub large_gap_warning: u32,
    /// maximum number of missing ids recorded for a single incoming packet
    pub max_gap_fill: u32,

    /// `PacketAck` messages are chunked to this number of ids. It must fit into a u8.
    pub max_acks_per_message: usize,
    pub max_ack_collect_time: Duration,
    /// Queued acks are appended to outgoing packets as long as the packet stays within this size
    pub max_packet_len: usize,

    /// Resend backlog (in bytes) above which a circuit logs warnings when the resend throttle
    ///  overflows...
    pub unacked_bytes_warning: usize,
    /// ... and above which it stops retrying past-due packets and moves them to their final retry
    pub unacked_bytes_hard_cap: usize,

    pub stats_period: Duration,

    pub resend_bits_per_second: f32,
    pub throttle_lookahead: Duration,

    /// If set, packets from hosts without a circuit are dropped instead of creating a circuit,
    ///  and dead circuits are not revived by incoming traffic
    pub protected: bool,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        CircuitConfig {
            sequence_bits: 24,
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(100),
            default_reliable_retries: 3,
            min_reliable_timeout: Duration::from_secs(1),
            reliable_timeout_factor: 5.0,
            lost_timeout_factor: 16.0,
            max_lost_timeout: Duration::from_secs(5),
            initial_ping: Duration::from_millis(1000),
            averaged_ping_alpha: 0.2,
            averaged_ping_min: Duration::from_millis(100),
            averaged_ping_max: Duration::from_millis(2000),
            ping_start_block: 3,
            ping_release_block: 2,
            duplicate_suppression_timeout: Duration::from_secs(60),
            large_gap_warning: 16,
            max_gap_fill: 128,
            max_acks_per_message: 250,
            max_ack_collect_time: Duration::from_secs(2),
            max_packet_len: 1200,
            unacked_bytes_warning: 256_000,
            unacked_bytes_hard_cap: 512_000,
            stats_period: Duration::from_secs(5),
            resend_bits_per_second: 100_000.0,
            throttle_lookahead: Duration::from_secs(1),
            protected: false,
        }
    }
}

impl CircuitConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(2..=31).contains(&self.sequence_bits) {
            bail!("sequence bits must be between 2 and 31, was {}", self.sequence_bits);
        }
        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat interval must be positive");
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            bail!("heartbeat timeout must be bigger than the heartbeat interval");
        }
        if !(self.averaged_ping_alpha > 0.0 && self.averaged_ping_alpha <= 1.0) {
            bail!("averaged ping alpha must be in (0, 1], was {}", self.averaged_ping_alpha);
        }
        if self.averaged_ping_min > self.averaged_ping_max {
            bail!("averaged ping min {:?} is bigger than max {:?}", self.averaged_ping_min, self.averaged_ping_max);
        }
        if self.ping_release_block >= self.ping_start_block {
            bail!("ping release block threshold must be lower than the start block threshold");
        }
        if self.max_acks_per_message == 0 || self.max_acks_per_message > u8::MAX as usize {
            bail!("max acks per message must be between 1 and 255, was {}", self.max_acks_per_message);
        }
        if self.max_packet_len < PacketHeader::SERIALIZED_LEN + 5 {
            bail!("max packet length {} leaves no room for an appended ack", self.max_packet_len);
        }
        if self.unacked_bytes_warning > self.unacked_bytes_hard_cap {
            bail!("unacked bytes warning threshold is above the hard cap");
        }

        Ok(())
    }

    pub fn sequence_ring(&self) -> SequenceRing {
        SequenceRing::new(self.sequence_bits)
    }

    /// retry timeout for a given averaged round trip time
    pub fn reliable_timeout(&self, averaged_ping: Duration) -> Duration {
        self.min_reliable_timeout
            .max(averaged_ping.mul_f64(self.reliable_timeout_factor))
    }

    /// timeout after which a gap in the incoming sequence is declared lost
    pub fn lost_timeout(&self, averaged_ping: Duration) -> Duration {
        self.max_lost_timeout
            .min(averaged_ping.mul_f64(self.lost_timeout_factor))
    }
}
