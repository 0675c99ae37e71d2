use std::collections::VecDeque;

use fleet_protocol::EventEnvelope;

/// Bounded per-instance event buffer.
///
/// Sequence numbers are strictly increasing and gapless from 1 for the
/// lifetime of the instance; pruning the oldest entries never rewinds them.
/// `total_appended` counts every event ever buffered, pruned or not.
#[derive(Debug)]
pub struct EventHistory {
    events: VecDeque<EventEnvelope>,
    capacity: usize,
    next_sequence: u64,
    total_appended: u64,
}

impl EventHistory {
    pub fn new(capacity: usize) -> Self {
        // a zero-capacity ring would never satisfy the overflow check
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            next_sequence: 1,
            total_appended: 0,
        }
    }

    /// Stamps the envelope with the next sequence number and buffers it,
    /// dropping the oldest entry on overflow. Returns the stamped envelope.
    pub fn append(&mut self, mut envelope: EventEnvelope) -> EventEnvelope {
        envelope.sequence = Some(self.next_sequence);
        self.next_sequence += 1;
        self.total_appended += 1;

        while self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(envelope.clone());
        envelope
    }

    pub fn total_appended(&self) -> u64 {
        self.total_appended
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Buffered events with sequence strictly greater than `last`, in
    /// ascending sequence order.
    pub fn since_sequence(&self, last: u64) -> Vec<EventEnvelope> {
        self.events
            .iter()
            .filter(|envelope| envelope.sequence.is_some_and(|sequence| sequence > last))
            .cloned()
            .collect()
    }

    /// Buffered events with timestamp strictly greater than `last`, in
    /// buffer (ascending sequence) order.
    pub fn since_timestamp(&self, last: i64) -> Vec<EventEnvelope> {
        self.events
            .iter()
            .filter(|envelope| envelope.timestamp > last)
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<EventEnvelope> {
        self.events.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventEnvelope> {
        self.events.iter()
    }
}
