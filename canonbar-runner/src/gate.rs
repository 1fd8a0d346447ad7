//! Per-source in-flight budget.

use canonbar_core::domain::SourceId;
use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard};

#[derive(Debug, Default, Clone, Copy)]
struct Slot {
    in_flight: usize,
    peak: usize,
}

/// Bounds concurrent fetches per source. `acquire` blocks until a permit is
/// free; the permit is returned when the guard drops.
#[derive(Debug)]
pub struct SourceGate {
    limit: usize,
    slots: Mutex<HashMap<SourceId, Slot>>,
    freed: Condvar,
}

pub struct Permit<'a> {
    gate: &'a SourceGate,
    source: SourceId,
}

impl SourceGate {
    /// Gate allowing `limit` concurrent permits per source (at least one).
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            slots: Mutex::new(HashMap::new()),
            freed: Condvar::new(),
        }
    }

    /// Permits available per source.
    pub fn limit(&self) -> usize {
        self.limit
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<SourceId, Slot>> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Block until `source` has a free permit.
    pub fn acquire(&self, source: &SourceId) -> Permit<'_> {
        let mut slots = self.slots();
        while slots.get(source).map_or(0, |s| s.in_flight) >= self.limit {
            slots = self.freed.wait(slots).unwrap_or_else(|p| p.into_inner());
        }
        let slot = slots.entry(source.clone()).or_default();
        slot.in_flight += 1;
        slot.peak = slot.peak.max(slot.in_flight);
        Permit {
            gate: self,
            source: source.clone(),
        }
    }

    /// Permits currently held for `source`.
    pub fn in_flight(&self, source: &SourceId) -> usize {
        self.slots().get(source).map_or(0, |s| s.in_flight)
    }

    /// Highest number of permits held at once for `source`.
    pub fn peak(&self, source: &SourceId) -> usize {
        self.slots().get(source).map_or(0, |s| s.peak)
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut slots = self.gate.slots();
        if let Some(slot) = slots.get_mut(&self.source) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }
        drop(slots);
        self.gate.freed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn permits_are_released_on_drop() {
        let gate = SourceGate::new(2);
        let s = SourceId::from("a");
        let p1 = gate.acquire(&s);
        let _p2 = gate.acquire(&s);
        assert_eq!(gate.in_flight(&s), 2);
        drop(p1);
        assert_eq!(gate.in_flight(&s), 1);
        assert_eq!(gate.peak(&s), 2);
        // other sources have their own budget
        let _q = gate.acquire(&SourceId::from("b"));
        assert_eq!(gate.in_flight(&SourceId::from("b")), 1);
    }

    #[test]
    fn limit_holds_across_threads() {
        let gate = Arc::new(SourceGate::new(2));
        let current = Arc::new(AtomicUsize::new(0));
        let worst = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (gate, current, worst) = (gate.clone(), current.clone(), worst.clone());
                std::thread::spawn(move || {
                    let _permit = gate.acquire(&SourceId::from("a"));
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    worst.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(5));
                    current.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(worst.load(Ordering::SeqCst) <= 2);
        assert!(gate.peak(&SourceId::from("a")) <= 2);
        assert_eq!(gate.in_flight(&SourceId::from("a")), 0);
    }
}
