//! Rebalancer Runner: planning orchestration on top of `rebalancer-core`.
//!
//! This crate provides:
//! - Single-shot planning with a full plan report
//! - Plan repository contract with in-memory and JSONL implementations
//! - Resumable batch controller, one run per portfolio fingerprint
//! - Background batch task with cancellation and a result channel
//! - Drop-on-full progress events and derived planning status
//! - JSON/CSV export and step-by-step execution through a trade executor

pub mod batch;
pub mod events;
pub mod execution;
pub mod export;
pub mod planner;
pub mod registry;
pub mod repository;
pub mod status;
pub mod task;

pub use batch::{BatchConfig, BatchController, BatchError, BatchResult};
pub use events::{EventBroadcaster, PlannerEvent, Subscription};
pub use execution::{execute_plan, execute_step, ExecutionError, ExecutionReport, TradeExecutor};
pub use planner::{create_plan, Plan, PlanError, SelectionBasis};
pub use registry::{JobGuard, JobRegistry};
pub use repository::{
    BestResult, EvaluationRecord, GenerationRecord, InMemoryRepository, JsonlRepository, PlanRepository,
    RepositoryError, SequenceRecord,
};
pub use status::{status, PlanningStatus, StatusReport};
pub use task::{spawn_batch, BatchHandle, CancelToken};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn batch_types_cross_threads() {
        assert_send::<BatchController>();
        assert_sync::<BatchController>();
        assert_send::<BatchResult>();
        assert_send::<BatchError>();
        assert_send::<CancelToken>();
        assert_sync::<CancelToken>();
        assert_send::<BatchHandle>();
    }

    #[test]
    fn repositories_are_send_sync() {
        assert_send::<InMemoryRepository>();
        assert_sync::<InMemoryRepository>();
        assert_send::<JsonlRepository>();
        assert_sync::<JsonlRepository>();
        assert_send::<std::sync::Arc<dyn PlanRepository>>();
        assert_sync::<std::sync::Arc<dyn PlanRepository>>();
    }

    #[test]
    fn events_and_registry_are_send_sync() {
        assert_send::<EventBroadcaster>();
        assert_sync::<EventBroadcaster>();
        assert_send::<Subscription>();
        assert_send::<JobRegistry>();
        assert_sync::<JobRegistry>();
        assert_send::<JobGuard>();
    }

    #[test]
    fn plan_report_is_send_sync() {
        assert_send::<Plan>();
        assert_sync::<Plan>();
    }
}
