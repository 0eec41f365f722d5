//! Sequence generator: from snapshot to candidate actions to ordered plans.
//!
//! Two stages:
//! 1. [`generate_candidates`] runs every enabled calculator over every symbol,
//!    deduplicates by `(symbol, side)`, applies the priority threshold and the
//!    per-category cap.
//! 2. [`expand_sequences`] runs every enabled pattern and generation strategy
//!    over the candidate pool, deduplicates by sequence hash, applies the
//!    post-generation filters, and relaxes constraints when nothing viable is left.
//!
//! Failures inside a calculator, pattern or strategy (errors or panics) skip
//! that unit of work and are counted; they never abort the run.

pub mod combinatorial;
pub mod filters;
pub mod partial;
pub mod relaxation;

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::calculators::{create_calculator, universe, OpportunityCalculator};
use crate::config::{GeneratorConfig, PlannerConfiguration, RelaxationParams};
use crate::domain::{
    ActionCandidate, HolisticPlan, HolisticStep, OpportunityCategory, OpportunityContext, Relaxation,
    SequenceHash, TradeSide,
};
use crate::patterns::{create_pattern, PlanPattern};

use self::combinatorial::CandidateOrder;
use self::filters::{create_filter, SequenceFilter};

// ─── Candidates ──────────────────────────────────────────────────────

/// Why a calculator's proposal did not make it into the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    BelowThreshold,
    CategoryCap,
    /// A higher-priority proposal for the same symbol and side won.
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedOpportunity {
    pub symbol: String,
    pub side: TradeSide,
    pub category: OpportunityCategory,
    pub priority: f64,
    pub reason: RejectionReason,
}

impl RejectedOpportunity {
    fn new(candidate: &ActionCandidate, reason: RejectionReason) -> Self {
        Self {
            symbol: candidate.symbol().to_string(),
            side: candidate.side(),
            category: candidate.category,
            priority: candidate.priority,
            reason,
        }
    }
}

/// Output of [`generate_candidates`].
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    /// Pool for expansion: at or above the threshold, capped per category,
    /// sorted by priority (highest first, stable).
    pub candidates: Vec<ActionCandidate>,
    /// Dropped for priority alone, sorted by priority. Feeds relaxation.
    pub below_threshold: Vec<ActionCandidate>,
    pub rejected: Vec<RejectedOpportunity>,
    /// Calculator invocations that failed (error or panic).
    pub skipped: usize,
    pub threshold: f64,
}

impl CandidateSet {
    pub fn steps(&self) -> Vec<HolisticStep> {
        self.candidates.iter().map(|c| c.step.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Run `f`, turning errors and panics into `None` with a warning.
fn guarded<T, E: Display>(kind: &'static str, name: &str, f: impl FnOnce() -> Result<T, E>) -> Option<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!(kind, name, error = %e, "skipped after error");
            None
        }
        Err(_) => {
            warn!(kind, name, "skipped after panic");
            None
        }
    }
}

fn by_priority(a: &ActionCandidate, b: &ActionCandidate) -> Ordering {
    b.priority.partial_cmp(&a.priority).unwrap_or(Ordering::Equal)
}

/// Candidate actions for the configured calculators.
pub fn generate_candidates(ctx: &OpportunityContext, cfg: &PlannerConfiguration) -> CandidateSet {
    let calculators: Vec<Box<dyn OpportunityCalculator>> = cfg.calculators.iter().map(create_calculator).collect();
    generate_candidates_with(ctx, cfg, &calculators)
}

/// Same as [`generate_candidates`] with an explicit calculator list.
pub fn generate_candidates_with(
    ctx: &OpportunityContext,
    cfg: &PlannerConfiguration,
    calculators: &[Box<dyn OpportunityCalculator>],
) -> CandidateSet {
    let symbols = universe(ctx);
    let mut set = CandidateSet {
        threshold: cfg.priority_threshold,
        ..Default::default()
    };

    // Dedupe by (symbol, side); first seen wins ties.
    let mut best: BTreeMap<(String, TradeSide), ActionCandidate> = BTreeMap::new();
    for calc in calculators {
        for symbol in &symbols {
            let name = format!("{}:{}", calc.name(), symbol);
            let Some(found) = guarded("calculator", &name, || calc.calculate(ctx, symbol)) else {
                set.skipped += 1;
                continue;
            };
            let Some(candidate) = found else {
                continue;
            };
            let key = (candidate.symbol().to_string(), candidate.side());
            match best.get(&key) {
                Some(existing) if existing.priority >= candidate.priority => {
                    set.rejected.push(RejectedOpportunity::new(&candidate, RejectionReason::Superseded));
                }
                Some(existing) => {
                    set.rejected.push(RejectedOpportunity::new(existing, RejectionReason::Superseded));
                    best.insert(key, candidate);
                }
                None => {
                    best.insert(key, candidate);
                }
            }
        }
    }

    let mut per_category: BTreeMap<OpportunityCategory, Vec<ActionCandidate>> = BTreeMap::new();
    for candidate in best.into_values() {
        per_category.entry(candidate.category).or_default().push(candidate);
    }

    for (_, mut group) in per_category {
        group.sort_by(by_priority);
        let mut kept = 0;
        for candidate in group {
            if candidate.priority < cfg.priority_threshold {
                set.rejected.push(RejectedOpportunity::new(&candidate, RejectionReason::BelowThreshold));
                set.below_threshold.push(candidate);
            } else if kept >= cfg.max_opportunities_per_category {
                set.rejected.push(RejectedOpportunity::new(&candidate, RejectionReason::CategoryCap));
            } else {
                kept += 1;
                set.candidates.push(candidate);
            }
        }
    }

    set.candidates.sort_by(by_priority);
    set.below_threshold.sort_by(by_priority);

    info!(
        candidates = set.candidates.len(),
        below_threshold = set.below_threshold.len(),
        rejected = set.rejected.len(),
        skipped = set.skipped,
        "candidate generation done"
    );
    set
}

// ─── Expansion ───────────────────────────────────────────────────────

/// Output of [`expand_sequences`].
#[derive(Debug, Clone, Default)]
pub struct Expansion {
    /// Unique plans in generation order.
    pub plans: Vec<HolisticPlan>,
    /// Patterns or strategies that failed (error or panic).
    pub failures: usize,
    pub filtered: usize,
    pub duplicates: usize,
    /// Deepest relaxation notch applied, if any.
    pub relaxation: Option<Relaxation>,
}

impl Expansion {
    /// Plans with at least one step whose every step is payable in order.
    pub fn has_viable(&self, ctx: &OpportunityContext) -> bool {
        has_viable(&self.plans, ctx)
    }
}

fn has_viable(plans: &[HolisticPlan], ctx: &OpportunityContext) -> bool {
    plans
        .iter()
        .any(|p| !p.is_empty() && p.affordable_prefix(ctx.available_cash_eur, &ctx.cost_model) == p.len())
}

struct Expander<'a> {
    ctx: &'a OpportunityContext,
    cfg: &'a PlannerConfiguration,
    patterns: Vec<Box<dyn PlanPattern>>,
    filters: Vec<Box<dyn SequenceFilter>>,
    seen: BTreeSet<SequenceHash>,
    out: Expansion,
}

impl<'a> Expander<'a> {
    /// Every enabled pattern and strategy over `pool`, capped at `max_depth`.
    fn build(&mut self, pool: &[ActionCandidate], max_depth: usize) -> Vec<HolisticPlan> {
        let ctx = self.ctx;
        let mut plans = Vec::new();

        for pattern in &self.patterns {
            match guarded("pattern", pattern.name(), || pattern.generate(pool, ctx, max_depth)) {
                Some(generated) => plans.extend(generated),
                None => self.out.failures += 1,
            }
        }

        for generator in &self.cfg.generators {
            let produced = guarded("generator", generator.name(), || {
                Ok::<_, std::convert::Infallible>(match generator {
                    GeneratorConfig::Combinatorial(p) => combinatorial::enumerate(
                        pool,
                        ctx,
                        max_depth,
                        p,
                        CandidateOrder::Priority,
                        "combinatorial",
                    ),
                    GeneratorConfig::EnhancedCombinatorial(p) => combinatorial::enumerate(
                        pool,
                        ctx,
                        max_depth,
                        p,
                        CandidateOrder::SellsFirst,
                        "enhanced_combinatorial",
                    ),
                    GeneratorConfig::PartialExecution(p) => partial::affordable_prefixes(pool, ctx, max_depth, p),
                    // Relaxation runs only after everything else has been tried.
                    GeneratorConfig::ConstraintRelaxation(_) => Vec::new(),
                })
            });
            match produced {
                Some(generated) => plans.extend(generated),
                None => self.out.failures += 1,
            }
        }
        plans
    }

    /// Drop empty, over-deep, duplicate and filtered plans; keep the rest.
    fn admit(&mut self, plans: Vec<HolisticPlan>, max_depth: usize) -> Vec<HolisticPlan> {
        let mut admitted = Vec::new();
        for plan in plans {
            if plan.is_empty() || plan.len() > max_depth {
                continue;
            }
            if !self.seen.insert(plan.sequence_hash()) {
                self.out.duplicates += 1;
                continue;
            }
            if let Some(f) = self.filters.iter().find(|f| !f.permits(&plan, self.ctx)) {
                debug!(filter = f.name(), origin = %plan.origin, "plan filtered");
                self.out.filtered += 1;
                continue;
            }
            admitted.push(plan);
        }
        admitted
    }

    fn relax(&mut self, set: &CandidateSet, params: &RelaxationParams) {
        let max_depth = self.cfg.max_depth;
        let from = set.threshold;
        let to = relaxation::lowered_threshold(from, params.threshold_step);
        let pool = relaxation::relaxed_pool(&set.candidates, &set.below_threshold, to);

        let notch = Relaxation::Threshold { from, to };
        let built = self.build(&pool, max_depth);
        let plans = self.admit(relaxation::tag(built, notch), max_depth);
        let viable = has_viable(&plans, self.ctx);
        info!(from, to, plans = plans.len(), viable, "relaxed priority threshold");
        self.out.plans.extend(plans);
        self.out.relaxation = Some(notch);
        if viable || !params.depth_notch {
            return;
        }

        let notch = Relaxation::Depth { from: max_depth, to: 1 };
        let singles = relaxation::single_step_plans(&pool, self.ctx);
        let plans = self.admit(relaxation::tag(singles, notch), max_depth);
        info!(plans = plans.len(), "relaxed plan depth to a single step");
        self.out.plans.extend(plans);
        self.out.relaxation = Some(notch);
    }
}

/// Expand the candidate pool into unique, filtered plans of at most `max_depth` steps.
pub fn expand_sequences(set: &CandidateSet, ctx: &OpportunityContext, cfg: &PlannerConfiguration) -> Expansion {
    let mut expander = Expander {
        ctx,
        cfg,
        patterns: cfg.patterns.iter().map(create_pattern).collect(),
        filters: cfg.filters.iter().map(create_filter).collect(),
        seen: BTreeSet::new(),
        out: Expansion::default(),
    };

    let built = expander.build(&set.candidates, cfg.max_depth);
    let plans = expander.admit(built, cfg.max_depth);
    expander.out.plans = plans;

    if !has_viable(&expander.out.plans, ctx) {
        let relaxation = cfg.generators.iter().find_map(|g| match g {
            GeneratorConfig::ConstraintRelaxation(p) => Some(p.clone()),
            _ => None,
        });
        if let Some(params) = relaxation {
            expander.relax(set, &params);
        }
    }

    let out = expander.out;
    info!(
        plans = out.plans.len(),
        duplicates = out.duplicates,
        filtered = out.filtered,
        failures = out.failures,
        relaxed = out.relaxation.is_some(),
        "sequence expansion done"
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculators::CalculatorError;
    use crate::config::{CalculatorConfig, FilterConfig, PatternConfig};
    use crate::cost_model::CostModel;
    use crate::domain::{Position, Security};

    fn ctx() -> OpportunityContext {
        let mut nvda = Security::new("NVDA");
        nvda.score = Some(0.9);
        let mut amd = Security::new("AMD");
        amd.score = Some(0.75);
        OpportunityContext {
            positions: vec![Position {
                symbol: "AAPL".into(),
                quantity: 100,
                average_cost: 100.0,
                currency: "EUR".into(),
            }],
            securities: vec![Security::new("AAPL"), nvda, amd],
            available_cash_eur: 2000.0,
            prices: [("AAPL", 150.0), ("NVDA", 50.0), ("AMD", 100.0)]
                .into_iter()
                .map(|(s, p)| (s.to_string(), p))
                .collect(),
            cost_model: CostModel::frictionless(),
            ..Default::default()
        }
    }

    struct Exploding;

    impl OpportunityCalculator for Exploding {
        fn name(&self) -> &'static str {
            "exploding"
        }

        fn calculate(
            &self,
            _ctx: &OpportunityContext,
            symbol: &str,
        ) -> Result<Option<ActionCandidate>, CalculatorError> {
            match symbol {
                "AAPL" => panic!("boom"),
                "AMD" => Err(CalculatorError::Invalid {
                    symbol: symbol.into(),
                    reason: "bad data".into(),
                }),
                _ => Ok(None),
            }
        }
    }

    #[test]
    fn candidates_are_sorted_and_thresholded() {
        let set = generate_candidates(&ctx(), &PlannerConfiguration::default());
        let symbols: Vec<_> = set.candidates.iter().map(|c| c.symbol()).collect();
        // NVDA 0.9, AMD 0.75, AAPL profit taking 0.6
        assert_eq!(symbols, vec!["NVDA", "AMD", "AAPL"]);
        assert!(set.candidates.windows(2).all(|w| w[0].priority >= w[1].priority));
        assert_eq!(set.skipped, 0);
    }

    #[test]
    fn threshold_moves_candidates_aside() {
        let cfg = PlannerConfiguration {
            priority_threshold: 0.8,
            ..Default::default()
        };
        let set = generate_candidates(&ctx(), &cfg);
        assert_eq!(set.candidates.len(), 1);
        assert_eq!(set.below_threshold.len(), 2);
        assert_eq!(
            set.rejected
                .iter()
                .filter(|r| r.reason == RejectionReason::BelowThreshold)
                .count(),
            2
        );
    }

    #[test]
    fn category_cap_applies() {
        let cfg = PlannerConfiguration {
            max_opportunities_per_category: 1,
            ..Default::default()
        };
        let set = generate_candidates(&ctx(), &cfg);
        let buys = set
            .candidates
            .iter()
            .filter(|c| c.category == OpportunityCategory::OpportunityBuys)
            .count();
        assert_eq!(buys, 1);
        assert!(set.rejected.iter().any(|r| r.reason == RejectionReason::CategoryCap));
    }

    #[test]
    fn failing_calculator_skips_symbols_and_continues() {
        let cfg = PlannerConfiguration::default();
        let calculators: Vec<Box<dyn OpportunityCalculator>> = vec![
            Box::new(Exploding),
            create_calculator(&CalculatorConfig::OpportunityBuys(Default::default())),
        ];
        let set = generate_candidates_with(&ctx(), &cfg, &calculators);
        assert_eq!(set.skipped, 2);
        assert_eq!(set.candidates.len(), 2);
    }

    #[test]
    fn duplicate_side_keeps_highest_priority() {
        let mut c = ctx();
        c.target_weights.insert("NVDA".into(), 0.2);
        let set = generate_candidates(&c, &PlannerConfiguration::default());
        let nvda: Vec<_> = set.candidates.iter().filter(|c| c.symbol() == "NVDA").collect();
        assert_eq!(nvda.len(), 1);
        assert!(set.rejected.iter().any(|r| r.reason == RejectionReason::Superseded));
    }

    #[test]
    fn expansion_is_unique_and_depth_bounded() {
        let cfg = PlannerConfiguration {
            max_depth: 2,
            ..Default::default()
        };
        let set = generate_candidates(&ctx(), &cfg);
        let exp = expand_sequences(&set, &ctx(), &cfg);
        assert!(!exp.plans.is_empty());
        let hashes: BTreeSet<_> = exp.plans.iter().map(|p| p.sequence_hash()).collect();
        assert_eq!(hashes.len(), exp.plans.len());
        assert!(exp.plans.iter().all(|p| !p.is_empty() && p.len() <= 2));
        assert!(exp.duplicates > 0);
        assert!(exp.relaxation.is_none());
    }

    #[test]
    fn filters_remove_plans() {
        let mut c = ctx();
        c.exclusions.ineligible.insert("NVDA".into());
        let cfg = PlannerConfiguration {
            filters: vec![FilterConfig::Eligibility(Default::default())],
            ..Default::default()
        };
        // Candidates were built before NVDA became ineligible
        let set = generate_candidates(&ctx(), &cfg);
        let exp = expand_sequences(&set, &c, &cfg);
        assert!(exp.filtered > 0);
        assert!(exp.plans.iter().all(|p| !p.touches("NVDA")));
    }

    #[test]
    fn relaxation_lowers_threshold_when_nothing_viable() {
        let mut c = ctx();
        c.available_cash_eur = 2000.0;
        c.positions.clear();
        c.prices.insert("NVDA".into(), 50.0);
        let cfg = PlannerConfiguration {
            priority_threshold: 0.8,
            patterns: vec![PatternConfig::DirectBuy(Default::default())],
            ..Default::default()
        };
        // Only NVDA (0.9) passes; make it unaffordable
        let mut set = generate_candidates(&c, &cfg);
        assert_eq!(set.candidates.len(), 1);
        set.candidates[0].step = HolisticStep::new("NVDA", TradeSide::Buy, 1000, 50.0, "EUR", "too big");

        let exp = expand_sequences(&set, &c, &cfg);
        assert!(matches!(exp.relaxation, Some(Relaxation::Threshold { .. })));
        let relaxed: Vec<_> = exp.plans.iter().filter(|p| p.relaxation.is_some()).collect();
        assert!(relaxed.iter().any(|p| p.touches("AMD")));
        assert!(exp.has_viable(&c));
    }

    #[test]
    fn depth_notch_when_threshold_notch_fails() {
        let mut c = ctx();
        c.available_cash_eur = 10.0;
        c.positions.clear();
        let cfg = PlannerConfiguration::default();
        let set = generate_candidates(&c, &cfg);
        let exp = expand_sequences(&set, &c, &cfg);
        assert!(matches!(exp.relaxation, Some(Relaxation::Depth { to: 1, .. })));
        assert!(!exp.has_viable(&c));
    }
}
