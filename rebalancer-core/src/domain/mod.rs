//! Domain types for the planning engine.

pub mod context;
pub mod ids;
pub mod plan;
pub mod step;

pub use context::{
    EvaluationContext, Exclusions, OpportunityContext, PendingOrder, Position, PriceAdjustments,
    Security,
};
pub use ids::{PortfolioHash, SequenceHash};
pub use plan::{affordable_prefix, HolisticPlan, ObjectiveScores, Relaxation};
pub use step::{ActionCandidate, HolisticStep, OpportunityCategory, TradeSide};
