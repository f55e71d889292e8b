//! Per-host protocol state: sequence tracking in both directions, reliable delivery, pings and
//!  acks.

pub mod acks;
pub mod incoming;
pub mod ping;
pub mod reliable;
pub mod stats;

use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use crate::circuit::acks::AckCollector;
use crate::circuit::incoming::IncomingTracker;
use crate::circuit::ping::PingState;
use crate::circuit::reliable::{DeliveryOutcome, ReliablePacket, ReliableQueue, ResendSweep, RetryTimeout};
use crate::circuit::stats::CircuitStats;
use crate::config::CircuitConfig;
use crate::control_messages::ControlMessage;
use crate::host::Host;
use crate::packet_header::{PacketFlags, PacketHeader};
use crate::packet_id::{PacketId, SequenceRing};
use crate::raw_transport::RawTransport;
use crate::throttle::BandwidthThrottle;
use crate::util::random::{jittered_interval, RngRandom};

/// Called when a circuit stopped answering pings. The callback can revive the circuit by calling
///  [Circuit::set_alive], otherwise the circuit is removed.
pub type TimeoutCallback = Box<dyn FnMut(&mut Circuit) + Send>;

/// A snapshot of a circuit's identity and liveness
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CircuitInfo {
    pub host: Host,
    pub alive: bool,
    pub age: Duration,
}

pub struct Circuit {
    host: Host,
    config: Arc<CircuitConfig>,
    ring: SequenceRing,
    /// id of the last packet sent
    out_id: PacketId,

    incoming: IncomingTracker,
    reliable: ReliableQueue,
    ping: PingState,
    acks: AckCollector,
    stats: CircuitStats,
    throttle: Box<dyn BandwidthThrottle>,

    alive: bool,
    allow_timeout: bool,
    timeout_callback: Option<TimeoutCallback>,
    next_ping_send_time: Instant,
    created_at: Instant,
}

impl Circuit {
    pub fn new(host: Host, initial_in_id: PacketId, config: Arc<CircuitConfig>, throttle: Box<dyn BandwidthThrottle>, now: Instant) -> Circuit {
        Circuit {
            host,
            ring: config.sequence_ring(),
            out_id: PacketId::ZERO,
            incoming: IncomingTracker::new(host, &config, initial_in_id),
            reliable: ReliableQueue::new(host),
            ping: PingState::new(&config, now),
            acks: AckCollector::default(),
            stats: CircuitStats::new(now),
            throttle,
            alive: true,
            allow_timeout: true,
            timeout_callback: None,
            next_ping_send_time: now + jittered_interval::<RngRandom>(config.heartbeat_interval),
            created_at: now,
            config,
        }
    }

    pub fn host(&self) -> Host {
        self.host
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn is_timeout_allowed(&self) -> bool {
        self.allow_timeout
    }

    pub fn is_blocked(&self) -> bool {
        self.ping.is_blocked()
    }

    pub fn stats(&self) -> &CircuitStats {
        &self.stats
    }

    pub fn incoming(&self) -> &IncomingTracker {
        &self.incoming
    }

    pub fn reliable(&self) -> &ReliableQueue {
        &self.reliable
    }

    pub fn ping(&self) -> &PingState {
        &self.ping
    }

    pub fn next_ping_send_time(&self) -> Instant {
        self.next_ping_send_time
    }

    pub(crate) fn set_next_ping_send_time(&mut self, next_ping_send_time: Instant) {
        self.next_ping_send_time = next_ping_send_time;
    }

    pub fn set_timeout_callback(&mut self, callback: TimeoutCallback) {
        self.timeout_callback = Some(callback);
    }

    /// Changing the liveness resets the sequence counters in both directions. Marking a circuit
    ///  as alive (again) also restarts its ping timeout.
    pub fn set_alive(&mut self, alive: bool, now: Instant) {
        if self.alive != alive {
            info!("circuit {:?} is now {}", self.host, if alive { "alive" } else { "dead" });
            self.out_id = PacketId::ZERO;
            self.incoming.restart();
            self.alive = alive;
        }
        if alive {
            self.ping.reset(now);
        }
    }

    /// While timeouts are not allowed, a circuit is never considered dead for not answering pings.
    ///  Allowing timeouts revives the circuit.
    pub fn set_allow_timeout(&mut self, allow: bool, now: Instant) {
        self.allow_timeout = allow;
        if allow {
            self.set_alive(true, now);
        }
    }

    /// id of the last packet sent
    pub fn packet_out_id(&self) -> PacketId {
        self.out_id
    }

    pub fn next_packet_out_id(&mut self) -> PacketId {
        self.stats.packets_out += 1;
        self.out_id = self.ring.next(self.out_id);
        self.out_id
    }

    /// The timeout for ping based retries at this point in time
    pub fn reliable_timeout(&self, now: Instant) -> Duration {
        self.config.reliable_timeout(self.ping.ping_delay_averaged(now))
    }

    /// The number of queued acks that fit into a packet of `len` bytes
    fn num_appendable_acks(&self, len: usize) -> usize {
        let room = self.config.max_packet_len.saturating_sub(len + size_of::<u8>());
        (room / size_of::<u32>())
            .min(self.config.max_acks_per_message)
            .min(self.acks.len())
    }

    /// Sends a packet, returning its id and the packet as it was stamped. Queued acks are appended
    ///  to the sent copy only, so a resend of the returned packet does not repeat them.
    fn send_packet(&mut self, flags: PacketFlags, payload: &[u8], append_acks: bool, transport: &dyn RawTransport) -> (PacketId, Vec<u8>) {
        let id = self.next_packet_out_id();
        let buf = PacketHeader::stamp(flags, id, payload);

        let num_acks = if append_acks { self.num_appendable_acks(buf.len()) } else { 0 };
        if num_acks == 0 {
            trace!("sending packet #{} to {:?}: {} bytes", id, self.host, buf.len());
            transport.send(&self.host, &buf);
            self.stats.add_bytes_out(buf.len());
        }
        else {
            let acks = self.acks.take_up_to(num_acks);
            let mut with_acks = buf.clone();
            PacketHeader::append_acks(&mut with_acks, &acks);
            trace!("sending packet #{} to {:?}: {} bytes including {} appended acks", id, self.host, with_acks.len(), acks.len());
            transport.send(&self.host, &with_acks);
            self.stats.add_bytes_out(with_acks.len());
        }
        (id, buf)
    }

    pub fn send_unreliable(&mut self, payload: &[u8], transport: &dyn RawTransport) -> PacketId {
        self.send_packet(PacketFlags::empty(), payload, true, transport).0
    }

    /// Control messages are marked as such in the packet header. Acks are appended to all of them
    ///  except `PacketAck` messages, which carry acks anyway.
    pub fn send_control(&mut self, message: &ControlMessage, transport: &dyn RawTransport) -> PacketId {
        trace!("sending {:?} to {:?}", message, self.host);
        let append_acks = !matches!(message, ControlMessage::PacketAck { .. });
        self.send_packet(PacketFlags::CONTROL, &message.to_bytes(), append_acks, transport).0
    }

    /// Sends a packet and keeps it for resending until it is acked or its retries are used up.
    ///  The returned receiver is notified exactly once.
    pub(crate) fn send_reliable(
        &mut self,
        payload: &[u8],
        retries: u8,
        timeout: RetryTimeout,
        report_timeout_on_ack: bool,
        now: Instant,
        transport: &dyn RawTransport,
    ) -> (PacketId, oneshot::Receiver<DeliveryOutcome>) {
        let (id, buf) = self.send_packet(PacketFlags::RELIABLE, payload, true, transport);

        let (completion, receiver) = oneshot::channel();
        let ping_based_timeout = self.reliable_timeout(now);
        let packet = ReliablePacket::new(buf, retries, timeout, report_timeout_on_ack, Some(completion), ping_based_timeout, now);
        self.reliable.add(id, packet);
        (id, receiver)
    }

    pub fn has_unacked(&self) -> bool {
        !self.reliable.is_empty()
    }

    /// Returns `false` if the packet is not (or no longer) waiting for an ack
    pub(crate) fn ack_reliable_packet(&mut self, id: PacketId) -> bool {
        self.reliable.ack(id)
    }

    pub(crate) fn resend_unacked(&mut self, now: Instant, transport: &dyn RawTransport) -> ResendSweep {
        let ping_based_timeout = self.reliable_timeout(now);
        let result = self.reliable.resend_unacked(
            now,
            &self.config,
            ping_based_timeout,
            self.stats.packets_out,
            self.throttle.as_mut(),
            transport,
        );
        self.stats.add_resent(result.resent);
        self.stats.packets_failed += result.failed as u64;
        result
    }

    /// The oldest id the peer should still keep duplicate suppression data for. If nothing is
    ///  waiting for an ack, this is the last id sent.
    pub fn oldest_unacked(&self) -> PacketId {
        self.reliable.oldest_unacked(self.out_id)
            .unwrap_or(self.out_id)
    }

    /// Aborts all packets waiting for an ack, notifying them that the circuit is gone
    pub(crate) fn abort_unacked(&mut self) -> usize {
        let num_aborted = self.reliable.abort_all();
        self.stats.packets_failed += num_aborted as u64;
        num_aborted
    }

    /// Registers an incoming packet, returning the gap to the previously expected packet id
    pub fn record_incoming(&mut self, id: PacketId, is_resend: bool, len: usize, now: Instant) -> u32 {
        self.stats.packets_in += 1;
        self.stats.add_bytes_in(len);
        self.incoming.record_incoming(id, is_resend, now)
    }

    pub fn is_duplicate_resend(&self, id: PacketId) -> bool {
        self.incoming.is_duplicate_resend(id)
    }

    pub fn remember_reliable(&mut self, id: PacketId, now: Instant) {
        self.incoming.remember_reliable(id, now);
    }

    pub fn clear_duplicate_window(&mut self, oldest_id: PacketId, now: Instant) {
        self.incoming.clear_duplicate_window(oldest_id, now);
    }

    /// Queues an ack for a received reliable packet. Returns `true` if this is the first queued ack.
    pub(crate) fn collect_ack(&mut self, id: PacketId, now: Instant) -> bool {
        self.acks.collect(id, now)
    }

    pub fn num_pending_acks(&self) -> usize {
        self.acks.len()
    }

    pub fn acks_due(&self, collect_time: Duration, now: Instant) -> bool {
        self.acks.is_due(collect_time, now)
    }

    /// Sends all queued acks, returning the number of ack messages
    pub(crate) fn send_acks(&mut self, transport: &dyn RawTransport) -> usize {
        let messages = self.acks.take_messages(self.config.max_acks_per_message);
        for message in &messages {
            self.send_control(message, transport);
        }
        messages.len()
    }

    /// Handles a ping from the peer: forget duplicate suppression data for everything the peer no
    ///  longer waits for, and send the response
    pub fn on_start_ping_check(&mut self, ping_id: u8, oldest_unacked: PacketId, now: Instant, transport: &dyn RawTransport) {
        self.clear_duplicate_window(oldest_unacked, now);
        self.send_control(&ControlMessage::CompletePingCheck { ping_id }, transport);
    }

    pub fn ping_response_received(&mut self, ping_id: u8, now: Instant) {
        self.ping.ping_timer_stop(ping_id, now);
    }

    /// Returns `false` if the circuit timed out and should be removed
    fn check_circuit_timeout(&mut self, now: Instant) -> bool {
        let since_last_ping = now.saturating_duration_since(self.ping.last_ping_received_time());
        if since_last_ping <= self.config.heartbeat_timeout {
            return true;
        }
        if !self.allow_timeout {
            debug!("circuit {:?}: last ping {:?} ago, but timeouts are not allowed", self.host, since_last_ping);
            return true;
        }

        info!("considering circuit {:?}: last ping {:?} ago", self.host, since_last_ping);
        self.set_alive(false, now);

        match self.timeout_callback.take() {
            Some(mut callback) => {
                info!("calling timeout callback for {:?}", self.host);
                callback(self);
                if self.timeout_callback.is_none() {
                    self.timeout_callback = Some(callback);
                }
                if !self.alive {
                    warn!("circuit {:?} still dead after timeout callback, dropping", self.host);
                }
            }
            None => {
                if !self.alive {
                    info!("circuit {:?} is dead, dropping", self.host);
                }
            }
        }
        self.alive
    }

    /// The periodic liveness check: detects a dead peer, sends the next ping, and declares
    ///  overdue gaps in the incoming sequence as lost. Returns `false` if the circuit is dead and
    ///  should be removed.
    pub fn update_watchdog(&mut self, now: Instant, transport: &dyn RawTransport) -> bool {
        if !self.check_circuit_timeout(now) {
            return false;
        }

        let oldest_unacked = self.oldest_unacked();
        trace!("circuit {:?}: {} unacked packets, oldest #{}", self.host, self.reliable.unacked_count(), oldest_unacked);

        self.ping.ping_timer_start(now);
        let ping_id = self.ping.next_ping_id();
        self.send_control(&ControlMessage::StartPingCheck { ping_id, oldest_unacked }, transport);

        let lost_timeout = self.config.lost_timeout(self.ping.ping_delay_averaged(now));
        let num_lost = self.incoming.sweep_lost(lost_timeout, now);
        self.stats.packets_lost += num_lost as u64;

        true
    }

    pub fn check_period_time(&mut self, now: Instant) {
        self.stats.check_period_time(self.config.stats_period, now);
    }

    pub fn dump_resend_count_and_reset(&mut self) {
        self.stats.dump_resend_count_and_reset(&self.host);
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub fn info(&self, now: Instant) -> CircuitInfo {
        CircuitInfo {
            host: self.host,
            alive: self.alive,
            age: self.age(now),
        }
    }
}

fn kbps(bytes: u64, duration: Duration) -> u64 {
    if duration.is_zero() {
        return 0;
    }
    (bytes as f64 * 8.0 / duration.as_secs_f64() / 1024.0) as u64
}

impl Display for Circuit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let age = self.age(Instant::now());

        writeln!(f, "Circuit {} {} {}",
                 self.host,
                 if self.alive { "Alive" } else { "Not Alive" },
                 if self.allow_timeout { "Timeout Allowed" } else { "Timeout Not Allowed" },
        )?;
        writeln!(f, " Packets Lost: {} Measured Ping: {:?} Averaged Ping: {:?}",
                 self.stats.packets_lost,
                 self.ping.ping_delay(),
                 self.ping.ping_delay_averaged_raw(),
        )?;
        writeln!(f, "Global In/Out {} sec KBytes: {}/{} Kbps: {}/{} Packets: {}/{}",
                 age.as_secs(),
                 self.stats.bytes_in / 1024,
                 self.stats.bytes_out / 1024,
                 kbps(self.stats.bytes_in, age),
                 kbps(self.stats.bytes_out, age),
                 self.stats.packets_in,
                 self.stats.packets_out,
        )?;

        let last_period = self.stats.last_period_length.unwrap_or_default();
        writeln!(f, "Recent In/Out   {} sec KBytes: {}/{} Kbps: {}/{} Peak kbps: {}/{}",
                 last_period.as_secs(),
                 self.stats.bytes_in_last_period / 1024,
                 self.stats.bytes_out_last_period / 1024,
                 kbps(self.stats.bytes_in_last_period, last_period),
                 kbps(self.stats.bytes_out_last_period, last_period),
                 (self.stats.peak_bps_in / 1024.0) as u64,
                 (self.stats.peak_bps_out / 1024.0) as u64,
        )
    }
}
