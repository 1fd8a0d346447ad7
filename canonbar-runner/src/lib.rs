//! Canonbar Runner: backfill orchestration on top of `canonbar-core`.
//!
//! - Request planning into `(asset, day, source)` tasks
//! - Per-task retry state machine with exponential backoff
//! - Persistent task ledger with operator acknowledgement
//! - Worker pool with per-source in-flight budgets
//! - Reconciliation gated on per-key completion
//! - Run reports with JSON and CSV export

pub mod context;
pub mod error;
pub mod gate;
pub mod ledger;
pub mod orchestrator;
pub mod report;
pub mod task;

pub use context::{CancelHandle, RunContext};
pub use error::BackfillError;
pub use gate::SourceGate;
pub use ledger::{LedgerError, TaskLedger, LEDGER_FILE};
pub use orchestrator::{BackfillRequest, Orchestrator};
pub use report::{ReportError, RunReport, TaskOutcome, WriteFailure};
pub use task::{BackfillTask, TaskStatus, Transition, TransitionError};

#[cfg(test)]
mod send_sync_checks {
    use super::*;
    use canonbar_core::store::{MemoryStore, ParquetStore};

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn run_state_is_send_sync() {
        assert_send::<RunContext<'static>>();
        assert_sync::<RunContext<'static>>();
        assert_send::<CancelHandle>();
        assert_sync::<CancelHandle>();
        assert_sync::<SourceGate>();
        assert_send::<TaskLedger>();
        assert_send::<RunReport>();
    }

    #[test]
    fn orchestrator_is_send_sync() {
        assert_send::<Orchestrator<MemoryStore>>();
        assert_sync::<Orchestrator<MemoryStore>>();
        assert_send::<Orchestrator<ParquetStore>>();
        assert_sync::<Orchestrator<ParquetStore>>();
    }
}
