//! Bounded in-memory log of scaling events.

use std::collections::VecDeque;

use zerogrid_core::ScalingEvent;

/// Default number of events retained.
pub const DEFAULT_EVENT_CAPACITY: usize = 1000;

/// Ring buffer of the most recent scaling events.
#[derive(Debug)]
pub struct ScalingEventLog {
    events: VecDeque<ScalingEvent>,
    capacity: usize,
    /// Events ever recorded, including evicted ones.
    total_recorded: u64,
}

impl ScalingEventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(DEFAULT_EVENT_CAPACITY)),
            capacity: capacity.max(1),
            total_recorded: 0,
        }
    }

    pub fn push(&mut self, event: ScalingEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
        self.total_recorded += 1;
    }

    /// The last `limit` events (all when `None`), oldest first.
    pub fn recent(&self, limit: Option<usize>) -> Vec<ScalingEvent> {
        let skip = limit.map_or(0, |n| self.events.len().saturating_sub(n));
        self.events.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn total_recorded(&self) -> u64 {
        self.total_recorded
    }
}

impl Default for ScalingEventLog {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerogrid_core::ScalingAction;

    fn event(n: u32) -> ScalingEvent {
        ScalingEvent::new(ScalingAction::ScaleUp, "api", n, n + 1, "test")
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let mut log = ScalingEventLog::new(3);
        for n in 0..5 {
            log.push(event(n));
        }

        assert_eq!(log.len(), 3);
        assert_eq!(log.total_recorded(), 5);
        let from: Vec<u32> = log.recent(None).iter().map(|e| e.from_count).collect();
        assert_eq!(from, vec![2, 3, 4]);
    }

    #[test]
    fn recent_limits_to_newest() {
        let mut log = ScalingEventLog::default();
        for n in 0..10 {
            log.push(event(n));
        }

        let last_two: Vec<u32> = log.recent(Some(2)).iter().map(|e| e.from_count).collect();
        assert_eq!(last_two, vec![8, 9]);
        assert_eq!(log.recent(Some(50)).len(), 10);
    }

    #[test]
    fn default_capacity_is_one_thousand() {
        let mut log = ScalingEventLog::default();
        for n in 0..1005 {
            log.push(event(n));
        }
        assert_eq!(log.len(), DEFAULT_EVENT_CAPACITY);
    }
}
