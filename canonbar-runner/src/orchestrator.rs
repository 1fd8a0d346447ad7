//! Backfill orchestrator.
//!
//! A request `(assets, day range)` expands into one task per
//! `(asset, day, source)`. Tasks run on a private worker pool; each task
//! fetches its day from its source, stores the raw record and retries
//! transient failures with exponential backoff. When the last task of an
//! `(asset, day)` reaches a terminal state, that key is reconciled and the
//! canonical record written, once.
//!
//! Re-running a request skips `Done` tasks (unless forced) and acknowledged
//! failures, so it never duplicates raw or canonical records.

use crate::context::{CancelHandle, RunContext};
use crate::error::BackfillError;
use crate::ledger::TaskLedger;
use crate::report::{RunReport, TaskOutcome};
use crate::task::{TaskStatus, Transition};
use canonbar_core::adapter::SourceAdapter;
use canonbar_core::config::PipelineConfig;
use canonbar_core::domain::{Asset, AssetId, DayKey, DayRange, RawRecord, SourceId, TaskKey};
use canonbar_core::error::{FetchError, StoreError};
use canonbar_core::reconcile::Reconciler;
use canonbar_core::review::{MemoryReviewQueue, ReviewSink};
use canonbar_core::store::{AssetRegistry, CanonicalStore, CanonicalWriter, RawStore, Store};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What to backfill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillRequest {
    pub assets: Vec<AssetId>,
    pub range: DayRange,
    /// Re-fetch tasks that are already `Done`.
    pub force: bool,
}

impl BackfillRequest {
    pub fn new(
        assets: impl IntoIterator<Item = AssetId>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Self, BackfillError> {
        let assets: Vec<AssetId> = assets
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if assets.is_empty() {
            return Err(BackfillError::NoAssets);
        }
        Ok(Self {
            assets,
            range: DayRange::new(start, end)?,
            force: false,
        })
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

/// A task planned for this run.
struct Job {
    key: TaskKey,
    asset: Arc<Asset>,
    adapter: Arc<dyn SourceAdapter>,
}

/// Result of planning: jobs to run plus keys with nothing to fetch.
struct Plan {
    jobs: Vec<Job>,
    skipped: BTreeSet<TaskKey>,
    /// Keys whose every task was skipped.
    settled_keys: BTreeSet<DayKey>,
    inactive: Vec<AssetId>,
}

/// Why an attempt failed.
enum AttemptError {
    Fetch(FetchError),
    Store(StoreError),
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        match self {
            AttemptError::Fetch(e) => e.is_retryable(),
            AttemptError::Store(e) => e.is_retryable(),
        }
    }

    /// Minimum wait the provider asked for.
    fn retry_after(&self) -> Option<Duration> {
        match self {
            AttemptError::Fetch(FetchError::RateLimited {
                retry_after_secs, ..
            }) => Some(Duration::from_secs(*retry_after_secs)),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            AttemptError::Fetch(e) => e.to_string(),
            AttemptError::Store(e) => format!("store: {e}"),
        }
    }
}

pub struct Orchestrator<S: Store> {
    config: PipelineConfig,
    store: Arc<S>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    reconciler: Reconciler,
    review: Arc<dyn ReviewSink>,
    sleep: fn(Duration),
}

impl<S: Store> Orchestrator<S> {
    pub fn new(config: PipelineConfig, store: Arc<S>, adapters: Vec<Arc<dyn SourceAdapter>>) -> Self {
        let mut seen = BTreeSet::new();
        let adapters = adapters
            .into_iter()
            .filter(|a| {
                let fresh = seen.insert(a.source().clone());
                if !fresh {
                    warn!(source = %a.source(), "duplicate adapter ignored");
                }
                fresh
            })
            .collect();
        Self {
            reconciler: Reconciler::from_config(&config.reconcile),
            config,
            store,
            adapters,
            review: Arc::new(MemoryReviewQueue::new()),
            sleep: std::thread::sleep,
        }
    }

    /// Where discrepancy flags go. Defaults to an in-memory queue.
    pub fn with_review_sink(mut self, sink: Arc<dyn ReviewSink>) -> Self {
        self.review = sink;
        self
    }

    /// Replace the backoff sleep (tests use a no-op).
    pub fn with_sleep(mut self, sleep: fn(Duration)) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn sources(&self) -> Vec<&SourceId> {
        self.adapters.iter().map(|a| a.source()).collect()
    }

    /// Execute `request` against `ledger`. Per-task failures end in the
    /// report; only planning, store lookup and ledger persistence errors
    /// abort the run.
    pub fn run(
        &self,
        request: &BackfillRequest,
        ledger: &mut TaskLedger,
        cancel: &CancelHandle,
    ) -> Result<RunReport, BackfillError> {
        if self.adapters.is_empty() {
            return Err(BackfillError::NoSources);
        }
        let started_at = Utc::now();
        let run_id = run_id(request, started_at);
        let config_hash = self.config.config_hash();

        let plan = self.plan(request, ledger)?;
        info!(
            run_id = %run_id,
            assets = request.assets.len(),
            start = %request.range.start(),
            end = %request.range.end(),
            tasks = plan.jobs.len(),
            skipped = plan.skipped.len(),
            force = request.force,
            "starting backfill"
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.concurrency.workers)
            .thread_name(|i| format!("backfill-{i}"))
            .build()
            .map_err(|e| BackfillError::Pool(e.to_string()))?;

        let ctx = RunContext::new(run_id.clone(), &self.config, ledger, cancel.clone());
        for job in &plan.jobs {
            ctx.expect_tasks(job.key.day_key(), 1);
        }

        pool.scope(|scope| {
            for job in &plan.jobs {
                let ctx = &ctx;
                scope.spawn(move |_| {
                    if self.drive(ctx, job) && ctx.complete_task(&job.key.day_key()) {
                        self.reconcile_key(ctx, &job.key.day_key());
                    }
                });
            }
        });

        // Keys skipped entirely: repair a missing canonical record left by an
        // interrupted earlier run.
        for key in &plan.settled_keys {
            if ctx.is_cancelled() {
                break;
            }
            match self.store.canonical(&key.asset_id, key.day) {
                Ok(Some(_)) => {}
                Ok(None) => self.reconcile_key(&ctx, key),
                Err(e) => ctx.record_write_failure(key.clone(), e.to_string()),
            }
        }

        let cancelled = ctx.is_cancelled();
        let results = ctx.into_results();

        let mut keys: BTreeSet<TaskKey> = plan.skipped.clone();
        keys.extend(plan.jobs.iter().map(|j| j.key.clone()));
        let tasks: Vec<TaskOutcome> = keys
            .into_iter()
            .map(|key| {
                let progress = results.progress.get(&key).cloned().unwrap_or_default();
                let task = ledger.entry(key.clone()).clone();
                TaskOutcome {
                    skipped: plan.skipped.contains(&key),
                    key,
                    status: task.status,
                    attempt_count: task.attempt_count,
                    last_error: task.last_error,
                    acknowledged: task.acknowledged,
                    dispatched: progress.dispatched,
                    backoff_ms: progress.backoff_ms,
                }
            })
            .collect();

        ledger.save()?;

        let report = RunReport {
            run_id,
            config_hash,
            started_at,
            finished_at: Utc::now(),
            cancelled,
            tasks,
            reconciled: results.reconciled.into_iter().collect(),
            unreconciled: results.unreconciled.into_iter().collect(),
            discrepancies: results.discrepancies,
            inactive_assets: plan.inactive,
            write_failures: results.write_failures,
        };
        if report.succeeded() {
            info!(run_id = %report.run_id, summary = %report.summary(), "backfill finished");
        } else {
            warn!(run_id = %report.run_id, summary = %report.summary(), "backfill finished with unsettled tasks");
        }
        Ok(report)
    }

    fn plan(&self, request: &BackfillRequest, ledger: &mut TaskLedger) -> Result<Plan, BackfillError> {
        let mut plan = Plan {
            jobs: Vec::new(),
            skipped: BTreeSet::new(),
            settled_keys: BTreeSet::new(),
            inactive: Vec::new(),
        };

        // Resolve every asset before touching the ledger.
        let mut active = Vec::new();
        for asset_id in &request.assets {
            let asset = self
                .store
                .asset(asset_id)?
                .ok_or_else(|| BackfillError::UnknownAsset(asset_id.clone()))?;
            if asset.is_active() {
                active.push(Arc::new(asset));
            } else {
                warn!(asset_id = %asset_id, "asset is deactivated, skipping");
                plan.inactive.push(asset_id.clone());
            }
        }

        for asset in active {
            let asset_id = &asset.asset_id;
            for day in request.range.days() {
                let mut planned = 0;
                for adapter in &self.adapters {
                    let key = TaskKey::new(asset_id.clone(), day, adapter.source().clone());
                    let task = ledger.entry(key.clone());
                    if task.is_settled() && !request.force {
                        debug!(task = %key, status = %task.status, "already settled, skipping");
                        plan.skipped.insert(key);
                        continue;
                    }
                    if task.status == TaskStatus::InFlight {
                        warn!(task = %key, "task was left in flight by an earlier run, resetting");
                    }
                    task.reset();
                    planned += 1;
                    plan.jobs.push(Job {
                        key,
                        asset: asset.clone(),
                        adapter: adapter.clone(),
                    });
                }
                if planned == 0 {
                    plan.settled_keys.insert(DayKey::new(asset_id.clone(), day));
                }
            }
        }
        Ok(plan)
    }

    /// Run one task until it is terminal or the run is cancelled. Returns
    /// true when the task ended `Done` or `Failed`.
    fn drive(&self, ctx: &RunContext<'_>, job: &Job) -> bool {
        let policy = self.config.retry;
        loop {
            // Waiting for the source budget is not a dispatch: the task stays
            // Pending until a permit is held and the run is still live.
            let permit = ctx.gate().acquire(&job.key.source);
            if ctx.is_cancelled() {
                debug!(task = %job.key, "run cancelled, task stays pending");
                return false;
            }

            let attempt = match ctx.with_task(&job.key, |t| t.begin_attempt()) {
                Ok(n) => n,
                Err(e) => {
                    error!(task = %job.key, error = %e, "task in unexpected state");
                    return false;
                }
            };
            ctx.mark_dispatched(&job.key);
            debug!(task = %job.key, attempt, "fetching");

            let result =
                fetch_day(job.adapter.as_ref(), &job.asset, job.key.day).map_err(AttemptError::Fetch);
            drop(permit);
            let result = result.and_then(|record| {
                self.store
                    .put_raw(record)
                    .map(|_| ())
                    .map_err(AttemptError::Store)
            });

            let err = match result {
                Ok(()) => {
                    if let Err(e) = ctx.with_task(&job.key, |t| t.succeed()) {
                        error!(task = %job.key, error = %e, "task in unexpected state");
                    }
                    debug!(task = %job.key, attempt, "task done");
                    return true;
                }
                Err(err) => err,
            };

            let reason = err.describe();
            let transition =
                ctx.with_task(&job.key, |t| t.fail(reason.clone(), err.is_retryable(), &policy));
            match transition {
                Ok(Transition::Retry { delay }) => {
                    let ceiling = Duration::from_millis(policy.backoff_ceiling_ms);
                    let delay = err
                        .retry_after()
                        .map_or(delay, |hint| delay.max(hint.min(ceiling)));
                    warn!(
                        task = %job.key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "attempt failed, retrying"
                    );
                    ctx.record_backoff(&job.key, delay);
                    (self.sleep)(delay);
                }
                Ok(Transition::Failed) => {
                    if err.is_retryable() {
                        error!(task = %job.key, attempts = attempt, error = %reason, "retries exhausted");
                    } else {
                        warn!(task = %job.key, attempt, error = %reason, "task failed");
                    }
                    return true;
                }
                Err(e) => {
                    error!(task = %job.key, error = %e, "task in unexpected state");
                    return false;
                }
            }
        }
    }

    /// Merge every source's raw record for `key` and write the result.
    fn reconcile_key(&self, ctx: &RunContext<'_>, key: &DayKey) {
        let raws = match self.store.raw_records(&key.asset_id, key.day) {
            Ok(r) => r,
            Err(e) => {
                error!(key = %key, error = %e, "cannot read raw records");
                ctx.record_write_failure(key.clone(), e.to_string());
                return;
            }
        };

        let Some(merged) = self.reconciler.reconcile(&key.asset_id, key.day, &raws) else {
            debug!(key = %key, "no source reported this day, nothing to reconcile");
            return;
        };

        for flag in &merged.flags {
            if let Err(e) = self.review.submit(flag) {
                error!(key = %key, error = %e, "failed to submit discrepancy for review");
            }
        }
        ctx.add_discrepancies(merged.flags.len());

        let writer = CanonicalWriter::new(self.store.as_ref(), self.config.retry).with_sleep(self.sleep);
        match writer.write(&merged.record) {
            Ok(_) => {
                debug!(key = %key, sources = merged.record.contributing_sources.len(), "reconciled");
                ctx.record_reconciled(key.clone());
            }
            Err(e) => {
                error!(key = %key, error = %e, "canonical write failed");
                ctx.record_write_failure(key.clone(), e.to_string());
            }
        }
    }
}

/// Fetch one day from `adapter`.
///
/// A retryable error ends the fetch at once. Otherwise the latest record for
/// the day wins, and without one the first day-scoped error is reported.
fn fetch_day(adapter: &dyn SourceAdapter, asset: &Asset, day: NaiveDate) -> Result<RawRecord, FetchError> {
    let mut found: Option<RawRecord> = None;
    let mut first_error: Option<FetchError> = None;

    for item in adapter.fetch(asset, DayRange::single(day)) {
        match item {
            Ok(rec) if rec.day == day && rec.asset_id == asset.asset_id => {
                if found.as_ref().map_or(true, |f| rec.fetched_at > f.fetched_at) {
                    found = Some(rec);
                }
            }
            Ok(rec) => {
                debug!(source = %adapter.source(), day = %rec.day, "ignoring record outside the task");
            }
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                if first_error.is_none() && e.day().map_or(true, |d| d == day) {
                    first_error = Some(e);
                }
            }
        }
    }

    found.ok_or_else(|| {
        first_error.unwrap_or_else(|| FetchError::data_format(adapter.source(), day, "no data"))
    })
}

fn run_id(request: &BackfillRequest, started_at: chrono::DateTime<Utc>) -> String {
    let json = serde_json::to_vec(request).unwrap_or_default();
    let digest = blake3::hash(&json).to_hex();
    format!(
        "run-{}-{}",
        started_at.format("%Y%m%dT%H%M%S"),
        &digest.as_str()[..8]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use canonbar_core::adapter::{DayScript, FixtureAdapter, FixtureBar};
    use canonbar_core::domain::AssetType;
    use canonbar_core::store::MemoryStore;

    fn d(n: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, n).unwrap()
    }

    fn store() -> Arc<MemoryStore> {
        let btc = Asset::new("btc", "BTC", AssetType::Coin, Utc::now());
        Arc::new(MemoryStore::with_assets([btc]).unwrap())
    }

    fn no_sleep(_: Duration) {}

    #[test]
    fn request_rejects_bad_input() {
        assert!(matches!(
            BackfillRequest::new(["btc".into()], d(5), d(1)),
            Err(BackfillError::InvalidRange(_))
        ));
        assert!(matches!(
            BackfillRequest::new(Vec::<AssetId>::new(), d(1), d(2)),
            Err(BackfillError::NoAssets)
        ));
        let req = BackfillRequest::new(["eth".into(), "btc".into(), "btc".into()], d(1), d(2)).unwrap();
        assert_eq!(req.assets, vec![AssetId::from("btc"), AssetId::from("eth")]);
    }

    #[test]
    fn unknown_asset_aborts_before_any_fetch() {
        let adapter = Arc::new(FixtureAdapter::new("a"));
        let orch = Orchestrator::new(
            PipelineConfig::default(),
            store(),
            vec![adapter.clone() as Arc<dyn SourceAdapter>],
        );
        let req = BackfillRequest::new(["doge".into()], d(1), d(1)).unwrap();
        let err = orch
            .run(&req, &mut TaskLedger::new(), &CancelHandle::new())
            .unwrap_err();
        assert!(matches!(err, BackfillError::UnknownAsset(_)));
        assert_eq!(adapter.call_count(), 0);
    }

    #[test]
    fn fetch_day_prefers_records_over_errors() {
        let adapter = FixtureAdapter::new("a").script(
            "btc",
            d(1),
            DayScript::Record(FixtureBar::new(2.0, 1.0, 1.0)),
        );
        let asset = Asset::new("btc", "BTC", AssetType::Coin, Utc::now());
        assert!(fetch_day(&adapter, &asset, d(1)).is_ok());
        let err = fetch_day(&adapter, &asset, d(2)).unwrap_err();
        assert_eq!(err.day(), Some(d(2)));
    }

    #[test]
    fn single_source_run_writes_canonical_records() {
        let adapter = Arc::new(FixtureAdapter::new("a").script_range(
            "btc",
            DayRange::new(d(1), d(3)).unwrap(),
            DayScript::Record(FixtureBar::new(2.0, 1.0, 1.0)),
        ));
        let store = store();
        let orch = Orchestrator::new(PipelineConfig::default(), store.clone(), vec![adapter as Arc<dyn SourceAdapter>])
            .with_sleep(no_sleep);
        let req = BackfillRequest::new(["btc".into()], d(1), d(3)).unwrap();
        let mut ledger = TaskLedger::new();
        let report = orch.run(&req, &mut ledger, &CancelHandle::new()).unwrap();

        assert!(report.succeeded(), "{}", report.summary());
        assert_eq!(report.reconciled.len(), 3);
        assert_eq!(store.canonical_len(), 3);
        assert_eq!(ledger.count(TaskStatus::Done), 3);
    }
}
