//! Rebalancer Core: holistic trade planning over a portfolio snapshot.
//!
//! This crate contains the planning engine:
//! - Snapshot and plan domain types, portfolio fingerprinting
//! - Typed planner configuration with load-time validation
//! - Opportunity calculators and plan-shape patterns
//! - Sequence generation (combinatorial, partial execution, relaxation)
//! - Plan evaluation (single, multi-objective, stochastic, Monte-Carlo)
//! - Diversity-aware frontier selection and beam search

pub mod calculators;
pub mod config;
pub mod cost_model;
pub mod domain;
pub mod evaluator;
pub mod fingerprint;
pub mod generator;
pub mod patterns;
pub mod rng;
pub mod search;
pub mod selector;

pub use config::{ConvergencePolicy, EvaluationMode, PlannerConfiguration, PlanningContext, SelectionPolicy};
pub use cost_model::CostModel;
pub use domain::{HolisticPlan, HolisticStep, OpportunityContext, PortfolioHash};
pub use evaluator::{Evaluation, EvaluationError, Evaluator};
pub use search::{beam_search, SearchOutcome};
pub use selector::select_frontier;
