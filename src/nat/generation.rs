//! Generation tags and deferred release for peer connections
//!
//! Every connection attempt gets a fresh [`Generation`]. Closing swaps the
//! active generation to zero, so callbacks still in flight from the old
//! connection see a mismatch and do nothing. The old connection itself is
//! parked in a [`DrainQueue`] until its own state callback reports it
//! closed and a grace period has passed.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Identifier of one connection attempt. Zero is never issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(u64);

impl Generation {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Issues generations and tracks which one is active
#[derive(Debug, Default)]
pub struct GenerationGate {
    issued: AtomicU64,
    active: AtomicU64,
}

impl GenerationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next generation and make it active
    pub fn advance(&self) -> Generation {
        let generation = self.issued.fetch_add(1, Ordering::AcqRel) + 1;
        self.active.store(generation, Ordering::Release);
        Generation(generation)
    }

    /// Deactivate whatever generation is active, returning it
    pub fn invalidate(&self) -> Option<Generation> {
        match self.active.swap(0, Ordering::AcqRel) {
            0 => None,
            generation => Some(Generation(generation)),
        }
    }

    /// Deactivate `generation` only if it is still the active one
    pub fn invalidate_if(&self, generation: Generation) -> bool {
        self.active
            .compare_exchange(generation.0, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_active(&self, generation: Generation) -> bool {
        self.active.load(Ordering::Acquire) == generation.0
    }

    pub fn active(&self) -> Option<Generation> {
        match self.active.load(Ordering::Acquire) {
            0 => None,
            generation => Some(Generation(generation)),
        }
    }
}

struct DrainEntry<S> {
    generation: Generation,
    resource: S,
    parked_at: Instant,
    closed_at: Option<Instant>,
}

/// Bounded holding area for superseded connections
pub struct DrainQueue<S> {
    entries: VecDeque<DrainEntry<S>>,
    // Close reports for generations not parked yet
    closed_early: VecDeque<(Generation, Instant)>,
    grace: Duration,
    capacity: usize,
}

impl<S> DrainQueue<S> {
    pub fn new(grace: Duration, capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            closed_early: VecDeque::new(),
            grace,
            capacity: capacity.max(1),
        }
    }

    pub fn reconfigure(&mut self, grace: Duration, capacity: usize) {
        self.grace = grace;
        self.capacity = capacity.max(1);
    }

    /// Park a resource. Returns the oldest entry if the queue overflowed.
    pub fn park(&mut self, generation: Generation, resource: S, now: Instant) -> Option<S> {
        let closed_at = self
            .closed_early
            .iter()
            .position(|(g, _)| *g == generation)
            .and_then(|index| self.closed_early.remove(index))
            .map(|(_, at)| at);
        self.entries.push_back(DrainEntry {
            generation,
            resource,
            parked_at: now,
            closed_at,
        });

        if self.entries.len() <= self.capacity {
            return None;
        }

        // Prefer evicting something already confirmed closed
        let index = self
            .entries
            .iter()
            .position(|e| e.closed_at.is_some())
            .unwrap_or(0);
        let evicted = self.entries.remove(index)?;
        tracing::warn!(
            generation = %evicted.generation,
            closed = evicted.closed_at.is_some(),
            "Drain queue full, releasing connection early"
        );
        Some(evicted.resource)
    }

    /// Record that the connection of `generation` reported closed.
    ///
    /// Returns whether a parked entry matched. A report for a generation not
    /// parked yet is remembered and applied when it is.
    pub fn mark_closed(&mut self, generation: Generation, now: Instant) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.generation == generation) {
            entry.closed_at.get_or_insert(now);
            return true;
        }

        if !self.closed_early.iter().any(|(g, _)| *g == generation) {
            self.closed_early.push_back((generation, now));
            if self.closed_early.len() > self.capacity {
                self.closed_early.pop_front();
            }
        }
        false
    }

    /// Remove entries closed at least one grace period ago
    pub fn reclaim(&mut self, now: Instant) -> Vec<S> {
        let grace = self.grace;
        let mut released = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());

        for entry in self.entries.drain(..) {
            let expired = entry
                .closed_at
                .map(|closed| now.saturating_duration_since(closed) >= grace)
                .unwrap_or(false);
            if expired {
                released.push(entry.resource);
            } else {
                kept.push_back(entry);
            }
        }

        self.entries = kept;
        released
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, generation: Generation) -> bool {
        self.entries.iter().any(|e| e.generation == generation)
    }

    /// Time since the oldest entry was parked
    pub fn oldest_age(&self, now: Instant) -> Option<Duration> {
        self.entries
            .front()
            .map(|e| now.saturating_duration_since(e.parked_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_lifecycle() {
        let gate = GenerationGate::new();
        assert_eq!(gate.active(), None);

        let first = gate.advance();
        assert!(gate.is_active(first));

        let second = gate.advance();
        assert!(!gate.is_active(first));
        assert!(gate.is_active(second));
        assert!(second > first);

        assert_eq!(gate.invalidate(), Some(second));
        assert!(!gate.is_active(second));
        assert_eq!(gate.invalidate(), None);
    }

    #[test]
    fn test_invalidate_if_only_matches_active() {
        let gate = GenerationGate::new();
        let first = gate.advance();
        let second = gate.advance();

        assert!(!gate.invalidate_if(first));
        assert!(gate.is_active(second));
        assert!(gate.invalidate_if(second));
        assert_eq!(gate.active(), None);
    }

    #[test]
    fn test_drain_requires_close_and_grace() {
        let gate = GenerationGate::new();
        let generation = gate.advance();
        let mut queue = DrainQueue::new(Duration::from_secs(2), 4);
        let t0 = Instant::now();

        queue.park(generation, "pc", t0);

        // Not closed yet: kept however long it waits
        assert!(queue.reclaim(t0 + Duration::from_secs(10)).is_empty());

        assert!(queue.mark_closed(generation, t0 + Duration::from_secs(10)));
        assert!(queue.reclaim(t0 + Duration::from_secs(11)).is_empty());
        assert_eq!(queue.reclaim(t0 + Duration::from_secs(12)), vec!["pc"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_close_before_park_counts() {
        let gate = GenerationGate::new();
        let generation = gate.advance();
        let mut queue = DrainQueue::new(Duration::from_secs(2), 4);
        let t0 = Instant::now();

        assert!(!queue.mark_closed(generation, t0));
        queue.park(generation, "pc", t0 + Duration::from_secs(1));
        assert_eq!(queue.oldest_age(t0 + Duration::from_secs(2)), Some(Duration::from_secs(1)));

        // Grace runs from the close report, not from parking
        assert_eq!(queue.reclaim(t0 + Duration::from_secs(2)), vec!["pc"]);
        assert_eq!(queue.oldest_age(t0 + Duration::from_secs(2)), None);
    }

    #[test]
    fn test_early_close_reports_bounded() {
        let gate = GenerationGate::new();
        let mut queue = DrainQueue::new(Duration::ZERO, 2);
        let t0 = Instant::now();

        let a = gate.advance();
        let b = gate.advance();
        let c = gate.advance();
        for generation in [a, b, c] {
            queue.mark_closed(generation, t0);
        }

        // The oldest report was forgotten
        queue.park(a, 'a', t0);
        queue.park(c, 'c', t0);
        assert_eq!(queue.reclaim(t0), vec!['c']);
        assert!(queue.contains(a));
    }

    #[test]
    fn test_drain_bounded() {
        let gate = GenerationGate::new();
        let mut queue = DrainQueue::new(Duration::from_secs(2), 2);
        let t0 = Instant::now();

        let a = gate.advance();
        let b = gate.advance();
        let c = gate.advance();
        assert!(queue.park(a, 'a', t0).is_none());
        assert!(queue.park(b, 'b', t0).is_none());
        queue.mark_closed(b, t0);

        // The closed entry goes first
        assert_eq!(queue.park(c, 'c', t0), Some('b'));
        assert!(queue.contains(a));
        assert!(queue.contains(c));
        assert_eq!(queue.len(), 2);
    }
}
