//! State of one backfill run, shared by its workers.
//!
//! Nothing here is process-wide: each run builds its own context, and the
//! ledger is borrowed from the caller for the duration of the run.

use crate::gate::SourceGate;
use crate::ledger::TaskLedger;
use crate::report::WriteFailure;
use crate::task::BackfillTask;
use canonbar_core::config::PipelineConfig;
use canonbar_core::domain::{DayKey, TaskKey};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Cooperative cancellation flag. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What the run observed for one task beyond its ledger state.
#[derive(Debug, Clone, Default)]
pub(crate) struct Progress {
    pub dispatched: bool,
    pub backoff_ms: Vec<u64>,
}

/// Collected results once the workers are done.
#[derive(Debug, Default)]
pub(crate) struct RunResults {
    pub progress: HashMap<TaskKey, Progress>,
    pub reconciled: BTreeSet<DayKey>,
    pub unreconciled: BTreeSet<DayKey>,
    pub write_failures: Vec<WriteFailure>,
    pub discrepancies: usize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

fn into_inner<T>(m: Mutex<T>) -> T {
    m.into_inner().unwrap_or_else(|p| p.into_inner())
}

pub struct RunContext<'a> {
    pub run_id: String,
    pub config: &'a PipelineConfig,
    cancel: CancelHandle,
    ledger: Mutex<&'a mut TaskLedger>,
    gate: SourceGate,
    /// Unfinished tasks per key; reconciliation fires when a count hits zero.
    pending: Mutex<BTreeMap<DayKey, usize>>,
    progress: Mutex<HashMap<TaskKey, Progress>>,
    reconciled: Mutex<BTreeSet<DayKey>>,
    write_failures: Mutex<Vec<WriteFailure>>,
    discrepancies: AtomicUsize,
}

impl<'a> RunContext<'a> {
    pub fn new(
        run_id: impl Into<String>,
        config: &'a PipelineConfig,
        ledger: &'a mut TaskLedger,
        cancel: CancelHandle,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            config,
            cancel,
            ledger: Mutex::new(ledger),
            gate: SourceGate::new(config.concurrency.per_source_limit),
            pending: Mutex::new(BTreeMap::new()),
            progress: Mutex::new(HashMap::new()),
            reconciled: Mutex::new(BTreeSet::new()),
            write_failures: Mutex::new(Vec::new()),
            discrepancies: AtomicUsize::new(0),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn gate(&self) -> &SourceGate {
        &self.gate
    }

    /// Run `f` on the ledger entry for `key` under the ledger lock.
    pub fn with_task<R>(&self, key: &TaskKey, f: impl FnOnce(&mut BackfillTask) -> R) -> R {
        let mut ledger = lock(&self.ledger);
        f(ledger.entry(key.clone()))
    }

    /// Register `tasks` more unfinished tasks for `key`.
    pub fn expect_tasks(&self, key: DayKey, tasks: usize) {
        if tasks > 0 {
            *lock(&self.pending).entry(key).or_insert(0) += tasks;
        }
    }

    /// Count one task of `key` as terminal. True exactly once per key: when
    /// its last task finishes.
    pub fn complete_task(&self, key: &DayKey) -> bool {
        let mut pending = lock(&self.pending);
        match pending.get_mut(key) {
            Some(n) if *n > 1 => {
                *n -= 1;
                false
            }
            Some(_) => {
                pending.remove(key);
                true
            }
            None => false,
        }
    }

    pub(crate) fn mark_dispatched(&self, key: &TaskKey) {
        lock(&self.progress).entry(key.clone()).or_default().dispatched = true;
    }

    pub(crate) fn record_backoff(&self, key: &TaskKey, delay: Duration) {
        lock(&self.progress)
            .entry(key.clone())
            .or_default()
            .backoff_ms
            .push(delay.as_millis() as u64);
    }

    pub(crate) fn record_reconciled(&self, key: DayKey) {
        lock(&self.reconciled).insert(key);
    }

    pub(crate) fn record_write_failure(&self, key: DayKey, error: String) {
        lock(&self.write_failures).push(WriteFailure { key, error });
    }

    pub(crate) fn add_discrepancies(&self, n: usize) {
        self.discrepancies.fetch_add(n, Ordering::SeqCst);
    }

    pub(crate) fn into_results(self) -> RunResults {
        let pending = into_inner(self.pending);
        let mut write_failures = into_inner(self.write_failures);
        write_failures.sort_by(|a, b| a.key.cmp(&b.key));
        RunResults {
            progress: into_inner(self.progress),
            reconciled: into_inner(self.reconciled),
            unreconciled: pending.into_keys().collect(),
            write_failures,
            discrepancies: self.discrepancies.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn completion_fires_once_per_key() {
        let config = PipelineConfig::default();
        let mut ledger = TaskLedger::new();
        let ctx = RunContext::new("run", &config, &mut ledger, CancelHandle::new());
        let key = DayKey::new("btc".into(), NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());

        ctx.expect_tasks(key.clone(), 3);
        assert!(!ctx.complete_task(&key));
        assert!(!ctx.complete_task(&key));
        assert!(ctx.complete_task(&key));
        assert!(!ctx.complete_task(&key));
        assert!(ctx.into_results().unreconciled.is_empty());
    }

    #[test]
    fn unfinished_keys_are_reported() {
        let config = PipelineConfig::default();
        let mut ledger = TaskLedger::new();
        let ctx = RunContext::new("run", &config, &mut ledger, CancelHandle::new());
        let key = DayKey::new("btc".into(), NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        ctx.expect_tasks(key.clone(), 2);
        ctx.complete_task(&key);
        let results = ctx.into_results();
        assert_eq!(results.unreconciled.into_iter().collect::<Vec<_>>(), vec![key]);
    }

    #[test]
    fn cancel_handle_is_shared() {
        let handle = CancelHandle::new();
        let clone = handle.clone();
        clone.cancel();
        assert!(handle.is_cancelled());
    }
}
