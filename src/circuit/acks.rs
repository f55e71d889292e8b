use std::time::Duration;
use tokio::time::Instant;
use crate::control_messages::ControlMessage;
use crate::packet_id::PacketId;

/// Acks for received reliable packets, collected for a while so they can be sent in batches
#[derive(Default, Debug)]
pub struct AckCollector {
    acks: Vec<PacketId>,
    first_queued: Option<Instant>,
}

impl AckCollector {
    /// Returns `true` if this is the first queued ack, i.e. the collector just became non-empty
    pub fn collect(&mut self, id: PacketId, now: Instant) -> bool {
        let was_empty = self.acks.is_empty();
        self.acks.push(id);
        if self.first_queued.is_none() {
            self.first_queued = Some(now);
        }
        was_empty
    }

    pub fn len(&self) -> usize {
        self.acks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acks.is_empty()
    }

    /// Acks are due when the oldest one was collected more than `collect_time` ago. An empty
    ///  collector is always due, flushing it just means forgetting about it.
    pub fn is_due(&self, collect_time: Duration, now: Instant) -> bool {
        match self.first_queued {
            Some(first_queued) if !self.acks.is_empty() => now.saturating_duration_since(first_queued) > collect_time,
            _ => true,
        }
    }

    /// Takes the oldest `max` collected acks for appending them to an outgoing packet
    pub fn take_up_to(&mut self, max: usize) -> Vec<PacketId> {
        let num = max.min(self.acks.len());
        let taken = self.acks.drain(..num).collect::<Vec<_>>();
        if self.acks.is_empty() {
            self.first_queued = None;
        }
        taken
    }

    /// Takes all collected acks, chunked into messages of at most `max_per_message` ids
    pub fn take_messages(&mut self, max_per_message: usize) -> Vec<ControlMessage> {
        let acks = std::mem::take(&mut self.acks);
        self.first_queued = None;

        acks.chunks(max_per_message.max(1))
            .map(|chunk| ControlMessage::PacketAck { ids: chunk.to_vec() })
            .collect()
    }
}
