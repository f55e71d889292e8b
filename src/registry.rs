use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, trace};
use crate::circuit::reliable::{DeliveryOutcome, RetryTimeout};
use crate::circuit::{Circuit, CircuitInfo, TimeoutCallback};
use crate::config::CircuitConfig;
use crate::host::Host;
use crate::packet_id::PacketId;
use crate::raw_transport::RawTransport;
use crate::throttle::{BandwidthThrottle, ResendThrottle};
use crate::util::random::{jittered_interval, RngRandom};

/// Creates the resend throttle for a new circuit
pub type ThrottleFactory = Box<dyn Fn(&CircuitConfig, Instant) -> Box<dyn BandwidthThrottle> + Send + Sync>;

/// Owns all circuits, indexed by host.
///
/// Besides the primary map, the registry maintains secondary indices so that periodic maintenance
///  only touches circuits that need it: circuits with unacked reliable packets, circuits with
///  queued acks, and all circuits ordered by the time their next ping is due. All indices are
///  updated together with the primary map, so operations that affect them go through the
///  registry rather than through a [Circuit] directly.
pub struct CircuitRegistry {
    config: Arc<CircuitConfig>,
    throttle_factory: ThrottleFactory,

    circuits: FxHashMap<Host, Circuit>,
    unacked: BTreeSet<Host>,
    pending_acks: BTreeSet<Host>,
    ping_due: BTreeSet<(Instant, Host)>,

    /// traffic tends to go to the same host repeatedly, so the last lookup is remembered
    last_found: Option<Host>,
}

impl CircuitRegistry {
    pub fn new(config: Arc<CircuitConfig>) -> CircuitRegistry {
        Self::with_throttle_factory(config, Box::new(|config, now| {
            Box::new(ResendThrottle::new(config.resend_bits_per_second, config.throttle_lookahead, now))
        }))
    }

    pub fn with_throttle_factory(config: Arc<CircuitConfig>, throttle_factory: ThrottleFactory) -> CircuitRegistry {
        CircuitRegistry {
            config,
            throttle_factory,
            circuits: Default::default(),
            unacked: Default::default(),
            pending_acks: Default::default(),
            ping_due: Default::default(),
            last_found: None,
        }
    }

    pub fn config(&self) -> &Arc<CircuitConfig> {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.circuits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.circuits.is_empty()
    }

    pub fn contains(&self, host: &Host) -> bool {
        self.circuits.contains_key(host)
    }

    pub fn circuits(&self) -> impl Iterator<Item = &Circuit> {
        self.circuits.values()
    }

    /// Creates a circuit for a host. There must not be a circuit for the host already.
    pub fn add_circuit(&mut self, host: Host, initial_in_id: PacketId, now: Instant) -> &mut Circuit {
        assert!(!self.circuits.contains_key(&host), "there is already a circuit for {:?}", host);
        info!("adding circuit for {:?}", host);

        let throttle = (self.throttle_factory)(&self.config, now);
        let circuit = Circuit::new(host, initial_in_id, self.config.clone(), throttle, now);
        self.ping_due.insert((circuit.next_ping_send_time(), host));
        self.last_found = Some(host);

        self.circuits.entry(host)
            .or_insert(circuit)
    }

    /// Removes a circuit and all references to it, notifying all of its unacked reliable packets
    ///  that the circuit is gone. Returns `false` if there was no circuit for the host.
    pub fn remove_circuit(&mut self, host: &Host) -> bool {
        self.last_found = None;

        let Some(mut circuit) = self.circuits.remove(host) else {
            return false;
        };
        info!("removing circuit for {:?}", host);

        self.ping_due.remove(&(circuit.next_ping_send_time(), *host));
        self.unacked.remove(host);
        self.pending_acks.remove(host);

        let num_aborted = circuit.abort_unacked();
        if num_aborted > 0 {
            debug!("aborted {} unacked reliable packets for {:?}", num_aborted, host);
        }
        true
    }

    pub fn find_circuit(&mut self, host: &Host) -> Option<&mut Circuit> {
        if self.last_found.as_ref() != Some(host) {
            if !self.circuits.contains_key(host) {
                return None;
            }
            self.last_found = Some(*host);
        }
        self.circuits.get_mut(host)
    }

    pub fn get(&self, host: &Host) -> Option<&Circuit> {
        self.circuits.get(host)
    }

    pub fn is_circuit_alive(&self, host: &Host) -> bool {
        self.get(host)
            .map(|c| c.is_alive())
            .unwrap_or(false)
    }

    pub fn set_timeout_callback(&mut self, host: &Host, callback: TimeoutCallback) -> bool {
        match self.find_circuit(host) {
            Some(circuit) => {
                circuit.set_timeout_callback(callback);
                true
            }
            None => false,
        }
    }

    /// Sends a reliable packet on an existing circuit, see [Circuit::send_reliable]
    #[allow(clippy::too_many_arguments)]
    pub fn send_reliable(
        &mut self,
        host: &Host,
        payload: &[u8],
        retries: u8,
        timeout: RetryTimeout,
        report_timeout_on_ack: bool,
        now: Instant,
        transport: &dyn RawTransport,
    ) -> Option<oneshot::Receiver<DeliveryOutcome>> {
        let circuit = self.find_circuit(host)?;
        let (_, receiver) = circuit.send_reliable(payload, retries, timeout, report_timeout_on_ack, now, transport);
        self.unacked.insert(*host);
        Some(receiver)
    }

    /// Acknowledges reliable packets sent to a host, returning the number of packets that were
    ///  actually waiting for an ack
    pub fn ack_reliable_packets(&mut self, host: &Host, ids: &[PacketId]) -> usize {
        let Some(circuit) = self.find_circuit(host) else {
            debug!("acks from {:?} without a circuit", host);
            return 0;
        };

        let num_acked = ids.iter()
            .filter(|&&id| circuit.ack_reliable_packet(id))
            .count();
        if !circuit.has_unacked() {
            self.unacked.remove(host);
        }
        num_acked
    }

    /// Queues an ack for a received reliable packet
    pub fn collect_ack(&mut self, host: &Host, id: PacketId, now: Instant) {
        if let Some(circuit) = self.find_circuit(host) {
            if circuit.collect_ack(id, now) {
                self.pending_acks.insert(*host);
            }
        }
    }

    /// Resends unacked packets on all circuits that have any, returning the total number and size
    ///  of packets still waiting for an ack
    pub fn resend_unacked(&mut self, now: Instant, transport: &dyn RawTransport) -> (usize, usize) {
        let mut unacked_count = 0;
        let mut unacked_bytes = 0;
        let mut drained = Vec::new();

        for host in &self.unacked {
            let Some(circuit) = self.circuits.get_mut(host) else {
                continue;
            };
            circuit.resend_unacked(now, transport);
            unacked_count += circuit.reliable().unacked_count();
            unacked_bytes += circuit.reliable().unacked_bytes();
            if !circuit.has_unacked() {
                drained.push(*host);
            }
        }

        for host in drained {
            self.unacked.remove(&host);
        }
        (unacked_count, unacked_bytes)
    }

    fn reschedule_ping(&mut self, host: Host, next_ping_send_time: Instant) {
        if let Some(circuit) = self.circuits.get_mut(&host) {
            self.ping_due.remove(&(circuit.next_ping_send_time(), host));
            circuit.set_next_ping_send_time(next_ping_send_time);
            self.ping_due.insert((next_ping_send_time, host));
        }
    }

    /// Runs the watchdog on all circuits whose next ping is due, processing each circuit at most
    ///  once. Circuits that timed out are removed, and their hosts are returned.
    pub fn update_watchdog(&mut self, now: Instant, transport: &dyn RawTransport) -> Vec<Host> {
        let mut removed = Vec::new();

        for _ in 0..self.ping_due.len() {
            let Some(&(due, host)) = self.ping_due.first() else {
                break;
            };
            let Some(circuit) = self.circuits.get_mut(&host) else {
                // can not happen since the indices are maintained with the primary map
                self.ping_due.pop_first();
                continue;
            };

            if !circuit.is_alive() {
                // dead circuits are not pinged, they wait to be revived or removed
                let next = now + self.config.heartbeat_interval;
                self.reschedule_ping(host, next);
                continue;
            }

            if now < due {
                // the index is sorted, so no other circuit is due either
                break;
            }

            trace!("watchdog for {:?}", host);
            if circuit.update_watchdog(now, transport) {
                circuit.check_period_time(now);
                // a timeout callback may have sent reliable packets on the revived circuit
                if circuit.has_unacked() {
                    self.unacked.insert(host);
                }
                if circuit.num_pending_acks() > 0 {
                    self.pending_acks.insert(host);
                }
                let next = now + jittered_interval::<RngRandom>(self.config.heartbeat_interval);
                self.reschedule_ping(host, next);
            }
            else {
                self.remove_circuit(&host);
                removed.push(host);
            }
        }

        removed
    }

    /// Sends queued acks for all circuits whose oldest queued ack is older than `collect_time`
    ///  (clamped to the configured maximum).
    pub fn send_acks(&mut self, collect_time: Duration, now: Instant, transport: &dyn RawTransport) {
        let collect_time = collect_time.min(self.config.max_ack_collect_time);

        let mut flushed = Vec::new();
        for host in &self.pending_acks {
            let Some(circuit) = self.circuits.get_mut(host) else {
                flushed.push(*host);
                continue;
            };
            if circuit.acks_due(collect_time, now) {
                let num_messages = circuit.send_acks(transport);
                trace!("sent {} ack messages to {:?}", num_messages, host);
                flushed.push(*host);
            }
        }

        for host in flushed {
            self.pending_acks.remove(&host);
        }
    }

    pub fn dump_resends(&mut self) {
        for circuit in self.circuits.values_mut() {
            circuit.dump_resend_count_and_reset();
        }
    }

    pub fn info(&self, now: Instant) -> Vec<CircuitInfo> {
        let mut result = self.circuits.values()
            .map(|c| c.info(now))
            .collect::<Vec<_>>();
        result.sort_by_key(|i| i.host);
        result
    }
}

impl Display for CircuitRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Circuit Info:")?;

        let mut hosts = self.circuits.keys().collect::<Vec<_>>();
        hosts.sort();
        for host in hosts {
            if let Some(circuit) = self.circuits.get(host) {
                writeln!(f, "{}", circuit)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_messages::ControlMessage;
    use crate::test_util::{test_host_from_number, ManualThrottle, TrackingRawTransport};
    use rstest::rstest;
    use std::sync::Mutex;
    use tokio::sync::oneshot::error::TryRecvError;

    fn registry() -> CircuitRegistry {
        CircuitRegistry::with_throttle_factory(
            Arc::new(CircuitConfig::default()),
            Box::new(|_, _| Box::new(ManualThrottle::default())),
        )
    }

    fn assert_indices_consistent(registry: &CircuitRegistry) {
        for host in &registry.unacked {
            assert!(registry.circuits.contains_key(host));
        }
        for host in &registry.pending_acks {
            assert!(registry.circuits.contains_key(host));
        }
        assert_eq!(registry.ping_due.len(), registry.circuits.len());
        for (due, host) in &registry.ping_due {
            assert_eq!(registry.circuits.get(host).unwrap().next_ping_send_time(), *due);
        }
    }

    #[test]
    fn test_add_find_remove() {
        let now = Instant::now();
        let mut registry = registry();
        let host1 = test_host_from_number(1);
        let host2 = test_host_from_number(2);

        registry.add_circuit(host1, PacketId::ZERO, now);
        registry.add_circuit(host2, PacketId::ZERO, now);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.last_found, Some(host2));
        assert_indices_consistent(&registry);

        assert_eq!(registry.find_circuit(&host1).unwrap().host(), host1);
        assert_eq!(registry.last_found, Some(host1));
        assert!(registry.find_circuit(&test_host_from_number(3)).is_none());
        assert_eq!(registry.last_found, Some(host1));

        assert!(registry.remove_circuit(&host1));
        assert_eq!(registry.last_found, None);
        assert!(registry.find_circuit(&host1).is_none());
        assert!(!registry.remove_circuit(&host1));
        assert_eq!(registry.len(), 1);
        assert_indices_consistent(&registry);
    }

    #[test]
    #[should_panic]
    fn test_add_duplicate() {
        let now = Instant::now();
        let mut registry = registry();
        registry.add_circuit(test_host_from_number(1), PacketId::ZERO, now);
        registry.add_circuit(test_host_from_number(1), PacketId::ZERO, now);
    }

    #[test]
    fn test_remove_notifies_unacked_packets() {
        let now = Instant::now();
        let transport = TrackingRawTransport::new();
        let mut registry = registry();
        let host = test_host_from_number(1);
        registry.add_circuit(host, PacketId::ZERO, now);

        let mut receivers = (0..5)
            .map(|i| registry.send_reliable(&host, b"abc", i, RetryTimeout::PingBased, false, now, &transport).unwrap())
            .collect::<Vec<_>>();
        registry.collect_ack(&host, PacketId::from_raw(3), now);
        assert!(registry.unacked.contains(&host));
        assert!(registry.pending_acks.contains(&host));

        assert!(registry.remove_circuit(&host));
        for r in receivers.iter_mut() {
            assert_eq!(r.try_recv(), Ok(DeliveryOutcome::CircuitGone));
        }
        assert!(registry.unacked.is_empty());
        assert!(registry.pending_acks.is_empty());
        assert!(registry.ping_due.is_empty());
    }

    #[test]
    fn test_ack_reliable_packets() {
        let now = Instant::now();
        let transport = TrackingRawTransport::new();
        let mut registry = registry();
        let host = test_host_from_number(1);
        registry.add_circuit(host, PacketId::ZERO, now);

        let mut r1 = registry.send_reliable(&host, b"a", 3, RetryTimeout::PingBased, false, now, &transport).unwrap();
        let mut r2 = registry.send_reliable(&host, b"b", 3, RetryTimeout::PingBased, false, now, &transport).unwrap();

        assert_eq!(registry.ack_reliable_packets(&host, &[PacketId::from_raw(1), PacketId::from_raw(7)]), 1);
        assert_eq!(r1.try_recv(), Ok(DeliveryOutcome::Acked));
        assert_eq!(r2.try_recv(), Err(TryRecvError::Empty));
        assert!(registry.unacked.contains(&host));

        assert_eq!(registry.ack_reliable_packets(&host, &[PacketId::from_raw(2), PacketId::from_raw(2)]), 1);
        assert_eq!(r2.try_recv(), Ok(DeliveryOutcome::Acked));
        assert!(!registry.unacked.contains(&host));

        assert_eq!(registry.ack_reliable_packets(&test_host_from_number(9), &[PacketId::from_raw(1)]), 0);
    }

    #[test]
    fn test_resend_unacked() {
        let now = Instant::now();
        let transport = TrackingRawTransport::new();
        let mut registry = registry();
        let host1 = test_host_from_number(1);
        let host2 = test_host_from_number(2);
        let host3 = test_host_from_number(3);
        for host in [host1, host2, host3] {
            registry.add_circuit(host, PacketId::ZERO, now);
        }

        registry.send_reliable(&host1, b"a", 3, RetryTimeout::PingBased, false, now, &transport);
        registry.send_reliable(&host1, b"bb", 3, RetryTimeout::PingBased, false, now, &transport);
        registry.send_reliable(&host2, b"ccc", 0, RetryTimeout::Fixed(Duration::from_millis(100)), false, now, &transport);
        transport.sent_packets();

        // #2 times out, host 1's packets are resent
        assert_eq!(registry.resend_unacked(now + Duration::from_secs(6), &transport), (2, 15));
        let sent = transport.sent_packets();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(to, _)| *to == host1));

        assert!(registry.unacked.contains(&host1));
        assert!(!registry.unacked.contains(&host2));
        assert!(!registry.unacked.contains(&host3));
    }

    #[test]
    fn test_update_watchdog() {
        let now = Instant::now();
        let transport = TrackingRawTransport::new();
        let mut registry = registry();
        let host1 = test_host_from_number(1);
        let host2 = test_host_from_number(2);
        registry.add_circuit(host1, PacketId::ZERO, now);
        registry.add_circuit(host2, PacketId::ZERO, now + Duration::from_secs(10));

        // nothing is due before 90% of the heartbeat interval
        assert!(registry.update_watchdog(now + Duration::from_millis(4499), &transport).is_empty());
        assert!(transport.sent_packets().is_empty());

        // only host 1 is due
        assert!(registry.update_watchdog(now + Duration::from_millis(5500), &transport).is_empty());
        let sent = transport.sent_control_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, host1);
        assert!(matches!(sent[0].2, ControlMessage::StartPingCheck { ping_id: 1, .. }));

        let next_due = registry.get(&host1).unwrap().next_ping_send_time();
        assert!(next_due >= now + Duration::from_millis(5500 + 4500));
        assert!(next_due <= now + Duration::from_millis(5500 + 5500));
        assert_indices_consistent(&registry);

        // both are due, each is processed once
        registry.update_watchdog(now + Duration::from_secs(20), &transport);
        let mut hosts = transport.sent_control_messages().into_iter()
            .map(|(to, _, _)| to)
            .collect::<Vec<_>>();
        hosts.sort();
        assert_eq!(hosts, vec![host1, host2]);
        assert_indices_consistent(&registry);
    }

    #[test]
    fn test_update_watchdog_removes_dead_circuits() {
        let now = Instant::now();
        let transport = TrackingRawTransport::new();
        let mut registry = registry();
        let host1 = test_host_from_number(1);
        let host2 = test_host_from_number(2);
        registry.add_circuit(host1, PacketId::ZERO, now);
        registry.add_circuit(host2, PacketId::ZERO, now);
        let mut receiver = registry.send_reliable(&host1, b"a", 3, RetryTimeout::PingBased, false, now, &transport).unwrap();

        // host 2 keeps answering pings
        let later = now + Duration::from_secs(101);
        registry.find_circuit(&host2).unwrap().ping_response_received(0, later);

        assert_eq!(registry.update_watchdog(later, &transport), vec![host1]);
        assert!(!registry.contains(&host1));
        assert!(registry.contains(&host2));
        assert_eq!(receiver.try_recv(), Ok(DeliveryOutcome::CircuitGone));
        assert_indices_consistent(&registry);
    }

    #[test]
    fn test_reliable_packet_sent_by_timeout_callback_is_resent() {
        let now = Instant::now();
        let transport = Arc::new(TrackingRawTransport::new());
        let mut registry = registry();
        let host = test_host_from_number(1);
        registry.add_circuit(host, PacketId::ZERO, now);

        let later = now + Duration::from_secs(101);
        let receiver = Arc::new(Mutex::new(None));
        let receiver2 = receiver.clone();
        let transport2 = transport.clone();
        registry.set_timeout_callback(&host, Box::new(move |c: &mut Circuit| {
            c.set_alive(true, later);
            let (_, r) = c.send_reliable(b"hello", 1, RetryTimeout::Fixed(Duration::from_millis(100)), false, later, &*transport2);
            *receiver2.lock().unwrap() = Some(r);
        }));

        assert!(registry.update_watchdog(later, &*transport).is_empty());
        assert!(registry.unacked.contains(&host));
        assert_indices_consistent(&registry);
        transport.sent_packets();

        let mut receiver = receiver.lock().unwrap().take().unwrap();
        assert_eq!(registry.resend_unacked(later + Duration::from_millis(101), &*transport), (1, 11));
        assert_eq!(transport.sent_packets().len(), 1);

        assert_eq!(registry.resend_unacked(later + Duration::from_millis(202), &*transport), (0, 0));
        assert_eq!(receiver.try_recv(), Ok(DeliveryOutcome::TimedOut));
        assert!(!registry.unacked.contains(&host));
    }

    #[test]
    fn test_update_watchdog_skips_dead_circuits() {
        let now = Instant::now();
        let transport = TrackingRawTransport::new();
        let mut registry = registry();
        let host = test_host_from_number(1);
        registry.add_circuit(host, PacketId::ZERO, now)
            .set_alive(false, now);

        let later = now + Duration::from_secs(200);
        assert!(registry.update_watchdog(later, &transport).is_empty());
        assert!(transport.sent_packets().is_empty());
        assert!(registry.contains(&host));
        assert_eq!(registry.get(&host).unwrap().next_ping_send_time(), later + Duration::from_secs(5));
        assert_indices_consistent(&registry);
    }

    #[rstest]
    #[case::young(Duration::from_millis(100), Duration::from_millis(500), false)]
    #[case::old(Duration::from_millis(600), Duration::from_millis(500), true)]
    #[case::clamped(Duration::from_millis(2100), Duration::from_secs(10), true)]
    #[case::not_old_enough_for_clamped(Duration::from_millis(1900), Duration::from_secs(10), false)]
    fn test_send_acks(#[case] age: Duration, #[case] collect_time: Duration, #[case] expected_sent: bool) {
        let now = Instant::now();
        let transport = TrackingRawTransport::new();
        let mut registry = registry();
        let host = test_host_from_number(1);
        registry.add_circuit(host, PacketId::ZERO, now);

        registry.collect_ack(&host, PacketId::from_raw(5), now);
        registry.collect_ack(&host, PacketId::from_raw(6), now);
        registry.send_acks(collect_time, now + age, &transport);

        let sent = transport.sent_control_messages();
        if expected_sent {
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].2, ControlMessage::PacketAck { ids: vec![PacketId::from_raw(5), PacketId::from_raw(6)] });
            assert!(!registry.pending_acks.contains(&host));
        }
        else {
            assert!(sent.is_empty());
            assert!(registry.pending_acks.contains(&host));
        }
    }

    #[test]
    fn test_send_acks_chunked() {
        let now = Instant::now();
        let transport = TrackingRawTransport::new();
        let mut registry = registry();
        let host = test_host_from_number(1);
        registry.add_circuit(host, PacketId::ZERO, now);

        for i in 0..600 {
            registry.collect_ack(&host, PacketId::from_raw(i), now);
        }
        registry.send_acks(Duration::ZERO, now + Duration::from_millis(1), &transport);

        let sizes = transport.sent_control_messages().into_iter()
            .map(|(_, _, msg)| match msg {
                ControlMessage::PacketAck { ids } => ids.len(),
                _ => 0,
            })
            .collect::<Vec<_>>();
        assert_eq!(sizes, vec![250, 250, 100]);
    }

    #[test]
    fn test_info_and_display() {
        let now = Instant::now();
        let mut registry = registry();
        registry.add_circuit(test_host_from_number(2), PacketId::ZERO, now);
        registry.add_circuit(test_host_from_number(1), PacketId::ZERO, now);

        let info = registry.info(now + Duration::from_secs(1));
        assert_eq!(info.iter().map(|i| i.host).collect::<Vec<_>>(), vec![test_host_from_number(1), test_host_from_number(2)]);
        assert!(info.iter().all(|i| i.alive && i.age == Duration::from_secs(1)));

        let report = registry.to_string();
        assert!(report.starts_with("Circuit Info:\nCircuit 127.0.0.1:1 "), "{}", report);
    }
}
