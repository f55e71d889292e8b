use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::config::CircuitConfig;
use crate::host::Host;
use crate::packet_id::{PacketId, SequenceRing};

/// Bookkeeping for the incoming direction of a circuit: the next expected packet id, holes in the
///  sequence that may still be filled by late packets, and the window of recently received
///  reliable packet ids used for duplicate suppression.
pub struct IncomingTracker {
    host: Host,
    ring: SequenceRing,
    large_gap_warning: u32,
    max_gap_fill: u32,
    duplicate_suppression_timeout: Duration,

    received_any: bool,
    /// the id that is expected next
    in_id: PacketId,
    highest_seen: PacketId,
    last_packet_gap: u32,
    last_packet_in_time: Option<Instant>,

    potential_lost: BTreeMap<PacketId, Instant>,
    recently_received: BTreeMap<PacketId, Instant>,
}

impl IncomingTracker {
    pub fn new(host: Host, config: &CircuitConfig, initial_in_id: PacketId) -> IncomingTracker {
        let ring = config.sequence_ring();
        let initial_in_id = ring.wrap(initial_in_id.to_raw());
        IncomingTracker {
            host,
            ring,
            large_gap_warning: config.large_gap_warning,
            max_gap_fill: config.max_gap_fill,
            duplicate_suppression_timeout: config.duplicate_suppression_timeout,
            received_any: false,
            in_id: initial_in_id,
            highest_seen: initial_in_id,
            last_packet_gap: 0,
            last_packet_in_time: None,
            potential_lost: Default::default(),
            recently_received: Default::default(),
        }
    }

    pub fn in_id(&self) -> PacketId {
        self.in_id
    }

    pub fn highest_seen(&self) -> PacketId {
        self.highest_seen
    }

    pub fn last_packet_gap(&self) -> u32 {
        self.last_packet_gap
    }

    pub fn last_packet_in_time(&self) -> Option<Instant> {
        self.last_packet_in_time
    }

    pub fn potential_lost(&self) -> impl Iterator<Item = PacketId> + '_ {
        self.potential_lost.keys().copied()
    }

    pub fn num_potential_lost(&self) -> usize {
        self.potential_lost.len()
    }

    pub fn num_recently_received(&self) -> usize {
        self.recently_received.len()
    }

    /// Sets the next expected id, forgetting all duplicate suppression data
    pub fn set_in_id(&mut self, id: PacketId) {
        self.in_id = self.ring.wrap(id.to_raw());
        self.recently_received.clear();
    }

    /// Starts over as if nothing was received yet: the next packet establishes the sequence
    pub fn restart(&mut self) {
        self.received_any = false;
        self.set_in_id(PacketId::ZERO);
    }

    /// Records the arrival of packet `id`, returning the number of packets that are missing
    ///  between the previously expected id and this one.
    pub fn record_incoming(&mut self, id: PacketId, is_resend: bool, now: Instant) -> u32 {
        let id = self.ring.wrap(id.to_raw());

        // a packet more than half the ring 'ahead' is an old packet from before a wrap, and a
        //  packet that is numerically smaller but less than half the ring ahead means we wrapped
        if !self.received_any || self.ring.is_ahead(self.highest_seen, id) {
            self.highest_seen = id;
        }
        self.last_packet_in_time = Some(now);

        if !self.received_any {
            trace!("{:?}: first packet on circuit is #{}", self.host, id);
            self.received_any = true;
            self.set_in_id(self.ring.next(id));
            self.last_packet_gap = 0;
            return 0;
        }

        let gap = if id == self.in_id {
            self.in_id = self.ring.next(id);
            0
        }
        else if self.potential_lost.remove(&id).is_some() {
            debug!("{:?}: recovered potentially lost packet #{}", self.host, id);
            0
        }
        else if !self.ring.is_ahead(self.in_id, id) {
            // this also covers packets that arrive out of order before anything was marked as
            //  potentially lost, e.g. at the start of a circuit
            trace!("{:?}: ignoring stale packet #{} (expecting #{})", self.host, id, self.in_id);
            0
        }
        else {
            let gap = self.ring.forward_distance(self.in_id, id);
            if !is_resend {
                self.register_gap(id, gap, now);
                self.in_id = self.ring.next(id);
            }
            gap
        };

        self.last_packet_gap = gap;
        gap
    }

    fn register_gap(&mut self, id: PacketId, gap: u32, now: Instant) {
        debug!("{:?}: packet out of order - got packet #{}, expecting #{}", self.host, id, self.in_id);

        let num_filled = if gap > self.max_gap_fill {
            warn!("{:?}: packet loss gap filler running amok - gap of {} packets, recording only the last {}", self.host, gap, self.max_gap_fill);
            self.max_gap_fill
        }
        else {
            if gap > self.large_gap_warning {
                warn!("{:?}: sustaining large amounts of packet loss - gap of {} packets", self.host, gap);
            }
            gap
        };

        let mut missing = self.ring.add(id, self.ring.modulus() - num_filled);
        while missing != id {
            debug!("{:?}: adding potentially lost packet #{}", self.host, missing);
            self.potential_lost.insert(missing, now);
            missing = self.ring.next(missing);
        }
    }

    /// Declares entries in the potentially lost set as lost if they are older than `timeout`,
    ///  returning the number of packets declared lost
    pub fn sweep_lost(&mut self, timeout: Duration, now: Instant) -> u32 {
        let mut num_lost = 0;
        let host = self.host;
        self.potential_lost.retain(|id, &mut t| {
            if now.saturating_duration_since(t) > timeout {
                debug!("{:?}: lost packet #{}", host, id);
                num_lost += 1;
                false
            }
            else {
                true
            }
        });
        num_lost
    }

    pub fn is_duplicate_resend(&self, id: PacketId) -> bool {
        self.recently_received.contains_key(&id)
    }

    /// Remembers the id of a received reliable packet for duplicate suppression
    pub fn remember_reliable(&mut self, id: PacketId, now: Instant) {
        self.recently_received.insert(id, now);
    }

    /// Purges duplicate suppression data for everything below `oldest_id`, which is the oldest
    ///  id the peer still waits for an ack for.
    ///
    /// Ids are compared numerically here: entries numerically above the highest seen id can only
    ///  be left over from before a wrap, and they are timed out instead.
    pub fn clear_duplicate_window(&mut self, oldest_id: PacketId, now: Instant) {
        let size_before = self.recently_received.len();

        if oldest_id < self.highest_seen {
            self.recently_received = self.recently_received.split_off(&oldest_id);
        }

        let highest_seen = self.highest_seen;
        let host = self.host;
        let timeout = self.duplicate_suppression_timeout;
        self.recently_received.retain(|&id, &mut t| {
            if id <= highest_seen {
                return true;
            }
            if id.to_raw() - highest_seen.to_raw() < 100 {
                warn!("{:?}: probably incorrectly timing out non-wrapped packet #{}", host, id);
            }
            if now.saturating_duration_since(t) > timeout {
                debug!("{:?}: clearing #{} from recently received packets", host, id);
                false
            }
            else {
                true
            }
        });

        debug!("{:?}: cleared duplicate window before #{} - size {} -> {}", self.host, oldest_id, size_before, self.recently_received.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_host_from_number;
    use rstest::rstest;
    use std::sync::{Arc, Mutex};
    use tracing::Level;
    use tracing_subscriber::layer::SubscriberExt;

    fn tracker(sequence_bits: u8) -> IncomingTracker {
        let config = CircuitConfig {
            sequence_bits,
            ..CircuitConfig::default()
        };
        IncomingTracker::new(test_host_from_number(1), &config, PacketId::ZERO)
    }

    fn id(raw: u32) -> PacketId {
        PacketId::from_raw(raw)
    }

    fn lost(tracker: &IncomingTracker) -> Vec<u32> {
        tracker.potential_lost().map(|id| id.to_raw()).collect()
    }

    /// records the level of every event
    #[derive(Clone, Default)]
    struct LevelRecorder(Arc<Mutex<Vec<Level>>>);
    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for LevelRecorder {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
            self.0.lock().unwrap().push(*event.metadata().level());
        }
    }

    #[rstest]
    #[case::ordinary_gap(4, vec![])]
    #[case::large_gap(30, vec![Level::WARN])]
    #[case::running_amok(1000, vec![Level::WARN])]
    fn test_gap_log_level(#[case] raw: u32, #[case] expected: Vec<Level>) {
        let recorder = LevelRecorder::default();
        let subscriber = tracing_subscriber::registry().with(recorder.clone());

        tracing::subscriber::with_default(subscriber, || {
            let mut tracker = tracker(24);
            let now = Instant::now();
            tracker.record_incoming(id(1), false, now);
            assert!(tracker.record_incoming(id(raw), false, now) > 0);
        });

        // ordinary out of order packets do not show up at info level
        let levels = recorder.0.lock().unwrap().iter()
            .copied()
            .filter(|level| *level <= Level::INFO)
            .collect::<Vec<_>>();
        assert_eq!(levels, expected);
    }

    #[rstest]
    #[case::from_zero(24, vec![0, 1, 2, 3, 4, 5])]
    #[case::from_middle(24, vec![1000, 1001, 1002])]
    #[case::wrap_16(4, vec![14, 15, 0, 1])]
    #[case::wrap_24(24, vec![0xff_fffe, 0xff_ffff, 0, 1, 2])]
    #[case::long_wrap(4, (0..40).map(|i| i % 16).collect())]
    fn test_in_order(#[case] bits: u8, #[case] ids: Vec<u32>) {
        let mut tracker = tracker(bits);
        let now = Instant::now();

        for &raw in &ids {
            assert_eq!(tracker.record_incoming(id(raw), false, now), 0);
            assert_eq!(tracker.num_potential_lost(), 0);
        }
        let last = *ids.last().unwrap();
        assert_eq!(tracker.in_id(), tracker.ring.next(id(last)));
        assert_eq!(tracker.highest_seen(), id(last));
    }

    #[test]
    fn test_single_reorder() {
        let mut tracker = tracker(24);
        let now = Instant::now();

        assert_eq!(tracker.record_incoming(id(10), false, now), 0);
        assert_eq!(tracker.record_incoming(id(12), false, now), 1);
        assert_eq!(lost(&tracker), vec![11]);
        assert_eq!(tracker.in_id(), id(13));

        assert_eq!(tracker.record_incoming(id(11), false, now), 0);
        assert!(lost(&tracker).is_empty());
        assert_eq!(tracker.in_id(), id(13));
        assert_eq!(tracker.highest_seen(), id(12));

        assert_eq!(tracker.record_incoming(id(13), false, now), 0);
    }

    #[test]
    fn test_reorder_across_wrap() {
        let mut tracker = tracker(4);
        let now = Instant::now();

        tracker.record_incoming(id(14), false, now);
        assert_eq!(tracker.record_incoming(id(1), false, now), 2);
        assert_eq!(lost(&tracker), vec![0, 15]);

        tracker.record_incoming(id(15), false, now);
        tracker.record_incoming(id(0), false, now);
        assert!(lost(&tracker).is_empty());
        assert_eq!(tracker.in_id(), id(2));
        assert_eq!(tracker.highest_seen(), id(1));
    }

    #[rstest]
    #[case::small(5, vec![6, 7, 8, 9, 10])]
    #[case::above_warning(20, (6..26).collect())]
    #[case::capped(200, (78..206).collect())]
    fn test_gap_fill(#[case] gap: u32, #[case] expected_lost: Vec<u32>) {
        let mut tracker = tracker(24);
        let now = Instant::now();

        tracker.record_incoming(id(5), false, now);
        assert_eq!(tracker.record_incoming(id(6 + gap), false, now), gap);
        assert_eq!(lost(&tracker), expected_lost);
        assert_eq!(tracker.last_packet_gap(), gap);
    }

    #[test]
    fn test_resend_ahead_does_not_register_gap() {
        let mut tracker = tracker(24);
        let now = Instant::now();

        tracker.record_incoming(id(5), false, now);
        assert_eq!(tracker.record_incoming(id(9), true, now), 3);
        assert!(lost(&tracker).is_empty());
        assert_eq!(tracker.in_id(), id(6));
        assert_eq!(tracker.highest_seen(), id(9));
    }

    #[test]
    fn test_stale_packet_ignored() {
        let mut tracker = tracker(24);
        let now = Instant::now();

        tracker.record_incoming(id(5), false, now);
        assert_eq!(tracker.record_incoming(id(4), false, now), 0);
        assert_eq!(tracker.record_incoming(id(3), true, now), 0);
        assert!(lost(&tracker).is_empty());
        assert_eq!(tracker.in_id(), id(6));
        assert_eq!(tracker.highest_seen(), id(5));
    }

    #[test]
    fn test_old_packet_after_wrap_does_not_move_highest() {
        let mut tracker = tracker(4);
        let now = Instant::now();

        tracker.record_incoming(id(1), false, now);
        tracker.record_incoming(id(2), false, now);
        tracker.record_incoming(id(10), true, now);
        assert_eq!(tracker.highest_seen(), id(2));
    }

    #[test]
    fn test_sweep_lost() {
        let mut tracker = tracker(24);
        let start = Instant::now();

        tracker.record_incoming(id(1), false, start);
        tracker.record_incoming(id(3), false, start);
        tracker.record_incoming(id(6), false, start + Duration::from_millis(500));
        assert_eq!(lost(&tracker), vec![2, 4, 5]);

        assert_eq!(tracker.sweep_lost(Duration::from_secs(1), start + Duration::from_millis(1000)), 0);
        assert_eq!(tracker.sweep_lost(Duration::from_secs(1), start + Duration::from_millis(1001)), 1);
        assert_eq!(lost(&tracker), vec![4, 5]);
        assert_eq!(tracker.sweep_lost(Duration::from_secs(1), start + Duration::from_secs(2)), 2);
        assert!(lost(&tracker).is_empty());
    }

    #[test]
    fn test_duplicate_window() {
        let mut tracker = tracker(24);
        let now = Instant::now();

        for raw in 1..=10 {
            tracker.record_incoming(id(raw), false, now);
            tracker.remember_reliable(id(raw), now);
        }
        assert!(tracker.is_duplicate_resend(id(3)));
        assert!(tracker.is_duplicate_resend(id(10)));
        assert!(!tracker.is_duplicate_resend(id(11)));

        tracker.clear_duplicate_window(id(5), now);
        assert!(!tracker.is_duplicate_resend(id(3)));
        assert!(!tracker.is_duplicate_resend(id(4)));
        assert!(tracker.is_duplicate_resend(id(5)));
        assert_eq!(tracker.num_recently_received(), 6);
    }

    #[test]
    fn test_duplicate_window_after_wrap() {
        let mut tracker = tracker(24);
        let start = Instant::now();

        for raw in [0xff_fffe, 0xff_ffff, 0, 1] {
            tracker.record_incoming(id(raw), false, start);
            tracker.remember_reliable(id(raw), start);
        }
        assert_eq!(tracker.highest_seen(), id(1));

        // the peer's oldest unacked packet is from before the wrap: nothing is trimmed numerically
        tracker.clear_duplicate_window(id(0xff_ffff), start + Duration::from_secs(1));
        assert_eq!(tracker.num_recently_received(), 4);

        // entries from before the wrap age out
        tracker.clear_duplicate_window(id(0), start + Duration::from_secs(61));
        assert_eq!(tracker.num_recently_received(), 2);
        assert!(tracker.is_duplicate_resend(id(0)));
        assert!(tracker.is_duplicate_resend(id(1)));
    }

    #[test]
    fn test_first_packet_resets_duplicate_window() {
        let mut tracker = tracker(24);
        let now = Instant::now();

        tracker.remember_reliable(id(3), now);
        tracker.record_incoming(id(100), false, now);
        assert_eq!(tracker.num_recently_received(), 0);
        assert_eq!(tracker.in_id(), id(101));
    }

    #[test]
    fn test_restart() {
        let mut tracker = tracker(24);
        let now = Instant::now();

        tracker.record_incoming(id(1), false, now);
        tracker.record_incoming(id(2), false, now);
        tracker.remember_reliable(id(2), now);

        tracker.restart();
        assert_eq!(tracker.in_id(), id(0));
        assert_eq!(tracker.num_recently_received(), 0);

        // the peer restarted its sequence somewhere else
        assert_eq!(tracker.record_incoming(id(40), false, now), 0);
        assert_eq!(tracker.in_id(), id(41));
        assert_eq!(tracker.num_potential_lost(), 0);
    }
}
