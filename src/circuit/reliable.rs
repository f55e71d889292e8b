use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::ops::Bound::{Excluded, Unbounded};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::config::CircuitConfig;
use crate::host::Host;
use crate::packet_header::PacketHeader;
use crate::packet_id::PacketId;
use crate::raw_transport::RawTransport;
use crate::throttle::BandwidthThrottle;

/// The result of sending a reliable packet, reported exactly once per packet
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DeliveryOutcome {
    Acked,
    TimedOut,
    /// the circuit was removed while the packet was still waiting for an ack
    CircuitGone,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RetryTimeout {
    /// derived from the circuit's averaged round trip time whenever a packet is (re)sent
    PingBased,
    Fixed(Duration),
}
impl RetryTimeout {
    fn resolve(self, ping_based: Duration) -> Duration {
        match self {
            RetryTimeout::PingBased => ping_based,
            RetryTimeout::Fixed(timeout) => timeout,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RetryState {
    /// waiting for an ack, will be resent when it expires
    Queued,
    /// all retries are used up, the packet times out when it expires
    FinalRetry,
}

pub struct ReliablePacket {
    buf: Vec<u8>,
    retries: u8,
    state: RetryState,
    expiration: Instant,
    timeout: RetryTimeout,
    report_timeout_on_ack: bool,
    completion: Option<oneshot::Sender<DeliveryOutcome>>,
}
impl Debug for ReliablePacket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RELIABLE{{{}b:{:?}:{}r}}", self.buf.len(), self.state, self.retries)
    }
}

impl ReliablePacket {
    /// `buf` is the complete packet including the header, sent for the first time at `now`.
    ///  `report_timeout_on_ack` makes the packet report [DeliveryOutcome::TimedOut] even when it
    ///  is acked, which is useful for exercising an application's timeout handling.
    pub fn new(
        buf: Vec<u8>,
        retries: u8,
        timeout: RetryTimeout,
        report_timeout_on_ack: bool,
        completion: Option<oneshot::Sender<DeliveryOutcome>>,
        ping_based_timeout: Duration,
        now: Instant,
    ) -> ReliablePacket {
        ReliablePacket {
            buf,
            retries,
            state: if retries == 0 { RetryState::FinalRetry } else { RetryState::Queued },
            expiration: now + timeout.resolve(ping_based_timeout),
            timeout,
            report_timeout_on_ack,
            completion,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn retries(&self) -> u8 {
        self.retries
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    pub fn expiration(&self) -> Instant {
        self.expiration
    }

    fn complete(mut self, outcome: DeliveryOutcome) {
        if let Some(completion) = self.completion.take() {
            // the receiver may have lost interest, which is fine
            let _ = completion.send(outcome);
        }
    }
}

/// Counts of what a resend sweep did
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct ResendSweep {
    pub resent: u32,
    pub failed: u32,
}

/// All reliable packets a circuit sent that were not acknowledged yet, ordered by packet id.
///
/// Every packet leaves the queue through exactly one of ack, timeout, or the queue being dropped,
///  and its completion is notified with the corresponding [DeliveryOutcome].
pub struct ReliableQueue {
    host: Host,
    packets: BTreeMap<PacketId, ReliablePacket>,
    unacked_bytes: usize,
}

impl ReliableQueue {
    pub fn new(host: Host) -> ReliableQueue {
        ReliableQueue {
            host,
            packets: Default::default(),
            unacked_bytes: 0,
        }
    }

    pub fn unacked_count(&self) -> usize {
        self.packets.len()
    }

    pub fn unacked_bytes(&self) -> usize {
        self.unacked_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn get(&self, id: PacketId) -> Option<&ReliablePacket> {
        self.packets.get(&id)
    }

    /// Registers a packet that was just sent for the first time
    pub fn add(&mut self, id: PacketId, packet: ReliablePacket) {
        trace!("{:?}: registering reliable packet #{}: {:?}", self.host, id, packet);

        self.unacked_bytes += packet.len();
        if let Some(prev) = self.packets.insert(id, packet) {
            // the id ring wrapped with a packet still waiting for an ack - that packet can not be acked any more
            warn!("{:?}: reliable packet #{} was still unacked when its id was reused", self.host, id);
            self.unacked_bytes -= prev.len();
            prev.complete(DeliveryOutcome::TimedOut);
        }
    }

    /// Returns `false` if there is no packet for the id, e.g. for a duplicate ack
    pub fn ack(&mut self, id: PacketId) -> bool {
        match self.packets.remove(&id) {
            Some(packet) => {
                trace!("{:?}: reliable packet #{} acked", self.host, id);
                self.unacked_bytes -= packet.len();
                let outcome = if packet.report_timeout_on_ack {
                    DeliveryOutcome::TimedOut
                }
                else {
                    DeliveryOutcome::Acked
                };
                packet.complete(outcome);
                true
            }
            None => {
                trace!("{:?}: ack for unknown packet #{}", self.host, id);
                false
            }
        }
    }

    /// The oldest packet id that is still waiting for an ack, taking into account that ids may
    ///  have wrapped: ids numerically above the last sent id were sent before the wrap.
    pub fn oldest_unacked(&self, last_out_id: PacketId) -> Option<PacketId> {
        self.packets.range((Excluded(last_out_id), Unbounded))
            .map(|(&id, _)| id)
            .next()
            .or_else(|| self.packets.keys().next().copied())
    }

    /// Resends expired packets, moves packets that used up their retries to their final retry,
    ///  and times out packets whose final retry expired.
    ///
    /// Resending stops when the throttle overflows. If the backlog of unacked data exceeds the
    ///  configured hard cap at that point, expired packets skip their remaining retries.
    pub fn resend_unacked(
        &mut self,
        now: Instant,
        config: &CircuitConfig,
        ping_based_timeout: Duration,
        packets_out: u64,
        throttle: &mut dyn BandwidthThrottle,
        transport: &dyn RawTransport,
    ) -> ResendSweep {
        let mut result = ResendSweep::default();
        let mut have_overflow = false;

        for (id, packet) in self.packets.iter_mut() {
            if packet.state != RetryState::Queued {
                continue;
            }

            if !have_overflow {
                have_overflow = throttle.check_overflow(0.0, now);
            }

            if have_overflow {
                if self.unacked_bytes > config.unacked_bytes_hard_cap {
                    if now > packet.expiration {
                        debug!("{:?}: resend backlog overflow - no more retries for #{}", self.host, id);
                        packet.retries = 0;
                        packet.state = RetryState::FinalRetry;
                    }
                    continue;
                }

                if self.unacked_bytes > config.unacked_bytes_warning && packets_out % 1024 == 0 {
                    warn!("{:?} has {} bytes of reliable messages waiting", self.host, self.unacked_bytes);
                }
                break;
            }

            if now > packet.expiration {
                packet.retries -= 1;
                result.resent += 1;
                debug!("{:?}: resending reliable packet #{} ({} retries left)", self.host, id, packet.retries);

                PacketHeader::mark_resent(&mut packet.buf);
                transport.send(&self.host, &packet.buf);
                throttle.throttle_overflow(packet.len() as f32 * 8.0, now);

                packet.expiration = now + packet.timeout.resolve(ping_based_timeout);
                if packet.retries == 0 {
                    packet.state = RetryState::FinalRetry;
                }
            }
        }

        let expired = self.packets.iter()
            .filter(|(_, p)| p.state == RetryState::FinalRetry && now > p.expiration)
            .map(|(&id, _)| id)
            .collect::<Vec<_>>();
        for id in expired {
            if let Some(packet) = self.packets.remove(&id) {
                debug!("{:?}: reliable packet #{} exceeded its retry limit", self.host, id);
                self.unacked_bytes -= packet.len();
                result.failed += 1;
                packet.complete(DeliveryOutcome::TimedOut);
            }
        }

        result
    }

    /// Notifies all remaining packets that the circuit is gone, returning their number
    pub fn abort_all(&mut self) -> usize {
        let packets = std::mem::take(&mut self.packets);
        self.unacked_bytes = 0;

        if !packets.is_empty() {
            debug!("{:?}: aborting reliable packets {:?}", self.host, packets.keys().collect::<Vec<_>>());
        }
        let num_aborted = packets.len();
        for packet in packets.into_values() {
            packet.complete(DeliveryOutcome::CircuitGone);
        }
        num_aborted
    }
}

impl Drop for ReliableQueue {
    fn drop(&mut self) {
        self.abort_all();
    }
}
