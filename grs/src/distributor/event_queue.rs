use std::collections::VecDeque;
use std::sync::Arc;

use crate::types::NodeEvent;

pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 10_000;

/// Result of a range scan over one partition queue.
pub enum EventRange {
    /// Entries with a resource version strictly greater than the requested
    /// one, in admission order.
    Events(Vec<Arc<NodeEvent>>),
    /// The requested resource version predates the oldest retained entry:
    /// events were evicted, the caller must emit a BOOKMARK and force the
    /// watcher to re-list.
    ResyncRequired,
}

/// Fixed-capacity ordered log of the events admitted to one partition,
/// indexed by resource version. On overflow the oldest entries are dropped
/// and the start watermark advances so stale readers detect the gap.
///
/// Invariants: resource versions are strictly increasing within the buffer,
/// and `start_rv <= last_rv` whenever the buffer is non-empty. `start_rv`
/// is the highest resource version ever evicted (zero before any eviction).
pub struct EventQueue {
    entries: VecDeque<(u64, Arc<NodeEvent>)>,
    capacity: usize,
    start_rv: u64,
    last_rv: u64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "event queue capacity must be positive");
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            start_rv: 0,
            last_rv: 0,
        }
    }

    /// Admit an event. Returns false (and drops the event) when its resource
    /// version is not past the current watermark, which makes re-ingestion of
    /// duplicates harmless.
    pub fn append(&mut self, rv: u64, event: Arc<NodeEvent>) -> bool {
        if rv <= self.last_rv {
            return false;
        }
        if self.entries.len() == self.capacity {
            if let Some((evicted_rv, _)) = self.entries.pop_front() {
                self.start_rv = evicted_rv;
            }
        }
        self.entries.push_back((rv, event));
        self.last_rv = rv;
        true
    }

    /// Snapshot the entries with resource version strictly greater than `rv`.
    /// Callers hold the partition lock only long enough to materialize the
    /// snapshot.
    pub fn range_from(&self, rv: u64) -> EventRange {
        if rv < self.start_rv {
            return EventRange::ResyncRequired;
        }
        let begin = self.entries.partition_point(|(entry_rv, _)| *entry_rv <= rv);
        EventRange::Events(
            self.entries
                .iter()
                .skip(begin)
                .map(|(_, event)| event.clone())
                .collect(),
        )
    }

    pub fn latest_rv(&self) -> u64 {
        self.last_rv
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventType, LogicalNode, NodeEvent};

    fn event(rv: u64) -> Arc<NodeEvent> {
        Arc::new(NodeEvent::new(
            EventType::Modified,
            LogicalNode {
                id: format!("node-{rv}"),
                resource_version: rv.to_string(),
                ..Default::default()
            },
        ))
    }

    fn rvs(range: EventRange) -> Vec<u64> {
        match range {
            EventRange::Events(events) => {
                events.iter().map(|e| e.resource_version()).collect()
            }
            EventRange::ResyncRequired => panic!("unexpected resync"),
        }
    }

    #[test]
    fn append_discards_stale_rvs() {
        let mut queue = EventQueue::new(8);
        assert!(queue.append(5, event(5)));
        assert!(!queue.append(5, event(5)));
        assert!(!queue.append(3, event(3)));
        assert!(queue.append(6, event(6)));
        assert_eq!(queue.latest_rv(), 6);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn range_from_yields_strictly_newer_entries() {
        let mut queue = EventQueue::new(8);
        for rv in [2, 4, 6, 8] {
            queue.append(rv, event(rv));
        }
        assert_eq!(rvs(queue.range_from(0)), vec![2, 4, 6, 8]);
        assert_eq!(rvs(queue.range_from(4)), vec![6, 8]);
        // Cursors between retained versions resume at the next entry.
        assert_eq!(rvs(queue.range_from(5)), vec![6, 8]);
        assert!(rvs(queue.range_from(8)).is_empty());
    }

    #[test]
    fn overflow_advances_start_and_forces_resync() {
        let mut queue = EventQueue::new(3);
        for rv in 1..=5 {
            queue.append(rv, event(rv));
        }
        // 1 and 2 were evicted.
        assert_eq!(rvs(queue.range_from(2)), vec![3, 4, 5]);
        assert!(matches!(queue.range_from(1), EventRange::ResyncRequired));
        assert!(matches!(queue.range_from(0), EventRange::ResyncRequired));
    }
}
