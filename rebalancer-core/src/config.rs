//! Planner configuration: tunable policy for one planning run.
//!
//! Every calculator, pattern, generator and filter is a tagged variant with its
//! own parameter struct. Unknown module types and unknown parameter keys are
//! rejected when the configuration is loaded, never silently ignored at use time.
//!
//! ```toml
//! max_depth = 4
//! beam_width = 10
//!
//! [evaluation]
//! type = "stochastic"
//! shifts = [-0.10, -0.05, 0.0, 0.05, 0.10]
//!
//! [[calculators]]
//! type = "profit_taking"
//! windfall_threshold = 0.25
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cost_model::CostModel;
use crate::domain::OpportunityContext;

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{field} out of range: {value} (expected {expected})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        expected: &'static str,
    },
    #[error("no calculators enabled")]
    NoCalculators,
    #[error("duplicate {kind} module: {name}")]
    DuplicateModule { kind: &'static str, name: String },
    #[error("unknown {kind} module: {name}")]
    UnknownModule { kind: &'static str, name: String },
    #[error("unknown parameter `{key}` for {kind} module {module}")]
    UnknownParameter {
        kind: &'static str,
        module: String,
        key: String,
    },
    #[error("invalid parameters for {kind} module {module}: {message}")]
    InvalidParameters {
        kind: &'static str,
        module: String,
        message: String,
    },
}

/// Parameter struct for modules without options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmptyParams {}

// ─── Calculators ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProfitTakingParams {
    /// Minimum unrealized gain (0.30 = +30%) before a position is trimmed.
    pub windfall_threshold: f64,
    /// Fraction of the position to sell.
    pub sell_fraction: f64,
    pub priority_weight: f64,
    pub max_cost_ratio: f64,
}

impl Default for ProfitTakingParams {
    fn default() -> Self {
        Self {
            windfall_threshold: 0.30,
            sell_fraction: 0.5,
            priority_weight: 1.2,
            max_cost_ratio: 0.02,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AveragingDownParams {
    /// Deepest loss still considered (-0.20 = -20%).
    pub max_loss: f64,
    /// Shallowest loss that qualifies.
    pub min_loss: f64,
    /// Fraction of the held quantity to add.
    pub fraction: f64,
    pub max_value_per_position: f64,
    pub max_cost_ratio: f64,
}

impl Default for AveragingDownParams {
    fn default() -> Self {
        Self {
            max_loss: -0.20,
            min_loss: -0.05,
            fraction: 0.10,
            max_value_per_position: 1000.0,
            max_cost_ratio: 0.02,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OpportunityBuysParams {
    pub min_score: f64,
    pub max_value_per_position: f64,
    pub exclude_existing: bool,
    pub max_cost_ratio: f64,
}

impl Default for OpportunityBuysParams {
    fn default() -> Self {
        Self {
            min_score: 0.7,
            max_value_per_position: 1000.0,
            exclude_existing: false,
            max_cost_ratio: 0.02,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RebalanceSellsParams {
    /// Minimum excess weight over target before selling.
    pub min_overweight: f64,
    /// Largest fraction of a position sold in one step.
    pub max_sell_fraction: f64,
    pub max_cost_ratio: f64,
}

impl Default for RebalanceSellsParams {
    fn default() -> Self {
        Self {
            min_overweight: 0.05,
            max_sell_fraction: 1.0,
            max_cost_ratio: 0.02,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RebalanceBuysParams {
    /// Minimum shortfall under target before buying.
    pub min_underweight: f64,
    pub max_value_per_position: f64,
    pub max_cost_ratio: f64,
}

impl Default for RebalanceBuysParams {
    fn default() -> Self {
        Self {
            min_underweight: 0.05,
            max_value_per_position: 1000.0,
            max_cost_ratio: 0.02,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WeightBasedParams {
    pub min_weight_diff: f64,
    pub max_value_per_trade: f64,
    pub max_sell_fraction: f64,
    pub max_cost_ratio: f64,
}

impl Default for WeightBasedParams {
    fn default() -> Self {
        Self {
            min_weight_diff: 0.02,
            max_value_per_trade: 1000.0,
            max_sell_fraction: 1.0,
            max_cost_ratio: 0.02,
        }
    }
}

/// Opportunity calculator selection + parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CalculatorConfig {
    ProfitTaking(ProfitTakingParams),
    AveragingDown(AveragingDownParams),
    OpportunityBuys(OpportunityBuysParams),
    RebalanceSells(RebalanceSellsParams),
    RebalanceBuys(RebalanceBuysParams),
    WeightBased(WeightBasedParams),
}

impl CalculatorConfig {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProfitTaking(_) => "profit_taking",
            Self::AveragingDown(_) => "averaging_down",
            Self::OpportunityBuys(_) => "opportunity_buys",
            Self::RebalanceSells(_) => "rebalance_sells",
            Self::RebalanceBuys(_) => "rebalance_buys",
            Self::WeightBased(_) => "weight_based",
        }
    }

    pub fn default_for(name: &str) -> Option<Self> {
        Some(match name {
            "profit_taking" => Self::ProfitTaking(Default::default()),
            "averaging_down" => Self::AveragingDown(Default::default()),
            "opportunity_buys" => Self::OpportunityBuys(Default::default()),
            "rebalance_sells" => Self::RebalanceSells(Default::default()),
            "rebalance_buys" => Self::RebalanceBuys(Default::default()),
            "weight_based" => Self::WeightBased(Default::default()),
            _ => return None,
        })
    }

    pub fn all_defaults() -> Vec<Self> {
        [
            "profit_taking",
            "averaging_down",
            "opportunity_buys",
            "rebalance_sells",
            "rebalance_buys",
            "weight_based",
        ]
        .iter()
        .filter_map(|n| Self::default_for(n))
        .collect()
    }
}

// ─── Patterns ────────────────────────────────────────────────────────

/// Common pattern option: cap on plan length (bounded by `max_depth` regardless).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PatternParams {
    pub max_steps: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CashGenerationParams {
    /// Cash to hold after the plan, as a fraction of total portfolio value.
    pub target_cash_fraction: f64,
    pub max_steps: Option<usize>,
}

impl Default for CashGenerationParams {
    fn default() -> Self {
        Self {
            target_cash_fraction: 0.05,
            max_steps: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    Bull,
    Bear,
    #[default]
    Sideways,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MarketRegimeParams {
    pub regime: MarketRegime,
    pub max_steps: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CostOptimizedParams {
    pub max_steps: usize,
}

impl Default for CostOptimizedParams {
    fn default() -> Self {
        Self { max_steps: 2 }
    }
}

/// Plan-shape pattern selection + parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PatternConfig {
    DirectBuy(PatternParams),
    ProfitTaking(PatternParams),
    Rebalance(PatternParams),
    AveragingDown(PatternParams),
    SingleBest(EmptyParams),
    MultiSell(PatternParams),
    MixedStrategy(PatternParams),
    OpportunityFirst(PatternParams),
    DeepRebalance(PatternParams),
    CashGeneration(CashGenerationParams),
    CostOptimized(CostOptimizedParams),
    Adaptive(PatternParams),
    MarketRegime(MarketRegimeParams),
}

impl PatternConfig {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DirectBuy(_) => "direct_buy",
            Self::ProfitTaking(_) => "profit_taking",
            Self::Rebalance(_) => "rebalance",
            Self::AveragingDown(_) => "averaging_down",
            Self::SingleBest(_) => "single_best",
            Self::MultiSell(_) => "multi_sell",
            Self::MixedStrategy(_) => "mixed_strategy",
            Self::OpportunityFirst(_) => "opportunity_first",
            Self::DeepRebalance(_) => "deep_rebalance",
            Self::CashGeneration(_) => "cash_generation",
            Self::CostOptimized(_) => "cost_optimized",
            Self::Adaptive(_) => "adaptive",
            Self::MarketRegime(_) => "market_regime",
        }
    }

    pub const NAMES: [&'static str; 13] = [
        "direct_buy",
        "profit_taking",
        "rebalance",
        "averaging_down",
        "single_best",
        "multi_sell",
        "mixed_strategy",
        "opportunity_first",
        "deep_rebalance",
        "cash_generation",
        "cost_optimized",
        "adaptive",
        "market_regime",
    ];

    pub fn default_for(name: &str) -> Option<Self> {
        let p = PatternParams::default();
        Some(match name {
            "direct_buy" => Self::DirectBuy(p),
            "profit_taking" => Self::ProfitTaking(p),
            "rebalance" => Self::Rebalance(p),
            "averaging_down" => Self::AveragingDown(p),
            "single_best" => Self::SingleBest(EmptyParams {}),
            "multi_sell" => Self::MultiSell(p),
            "mixed_strategy" => Self::MixedStrategy(p),
            "opportunity_first" => Self::OpportunityFirst(p),
            "deep_rebalance" => Self::DeepRebalance(p),
            "cash_generation" => Self::CashGeneration(Default::default()),
            "cost_optimized" => Self::CostOptimized(Default::default()),
            "adaptive" => Self::Adaptive(p),
            "market_regime" => Self::MarketRegime(Default::default()),
            _ => return None,
        })
    }

    pub fn all_defaults() -> Vec<Self> {
        Self::NAMES
            .iter()
            .filter_map(|n| Self::default_for(n))
            .collect()
    }
}

// ─── Generators ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CombinatorialParams {
    /// Stop enumerating after this many plans.
    pub max_combinations: usize,
    pub max_sells: usize,
    pub max_buys: usize,
    /// Size of the candidate pool fed to enumeration.
    pub max_candidates: usize,
}

impl Default for CombinatorialParams {
    fn default() -> Self {
        Self {
            max_combinations: 50,
            max_sells: 4,
            max_buys: 4,
            max_candidates: 12,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PartialExecutionParams {
    /// Shortest prefix worth keeping.
    pub min_steps: usize,
}

impl Default for PartialExecutionParams {
    fn default() -> Self {
        Self { min_steps: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelaxationParams {
    /// How far one notch lowers the priority threshold.
    pub threshold_step: f64,
    /// Whether the second notch (single-step plans) may be tried.
    pub depth_notch: bool,
}

impl Default for RelaxationParams {
    fn default() -> Self {
        Self {
            threshold_step: 0.1,
            depth_notch: true,
        }
    }
}

/// Sequence generation strategy selection + parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GeneratorConfig {
    Combinatorial(CombinatorialParams),
    EnhancedCombinatorial(CombinatorialParams),
    PartialExecution(PartialExecutionParams),
    ConstraintRelaxation(RelaxationParams),
}

impl GeneratorConfig {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Combinatorial(_) => "combinatorial",
            Self::EnhancedCombinatorial(_) => "enhanced_combinatorial",
            Self::PartialExecution(_) => "partial_execution",
            Self::ConstraintRelaxation(_) => "constraint_relaxation",
        }
    }

    pub fn default_for(name: &str) -> Option<Self> {
        Some(match name {
            "combinatorial" => Self::Combinatorial(Default::default()),
            "enhanced_combinatorial" => Self::EnhancedCombinatorial(Default::default()),
            "partial_execution" => Self::PartialExecution(Default::default()),
            "constraint_relaxation" => Self::ConstraintRelaxation(Default::default()),
            _ => return None,
        })
    }
}

// ─── Filters ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiversityFilterParams {
    /// Most BUY steps allowed into one industry within a plan.
    pub max_same_industry: usize,
    /// Most BUY steps allowed into one country within a plan.
    pub max_same_country: usize,
}

impl Default for DiversityFilterParams {
    fn default() -> Self {
        Self {
            max_same_industry: 2,
            max_same_country: 3,
        }
    }
}

/// Post-generation sequence filter selection + parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterConfig {
    Eligibility(EmptyParams),
    RecentlyTraded(EmptyParams),
    Diversity(DiversityFilterParams),
}

impl FilterConfig {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Eligibility(_) => "eligibility",
            Self::RecentlyTraded(_) => "recently_traded",
            Self::Diversity(_) => "diversity",
        }
    }

    pub fn default_for(name: &str) -> Option<Self> {
        Some(match name {
            "eligibility" => Self::Eligibility(EmptyParams {}),
            "recently_traded" => Self::RecentlyTraded(EmptyParams {}),
            "diversity" => Self::Diversity(Default::default()),
            _ => return None,
        })
    }
}

// ─── Evaluation mode ─────────────────────────────────────────────────

/// Weights for combining objective sub-scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ObjectiveWeights {
    pub allocation_fit: f64,
    pub diversification: f64,
    pub risk: f64,
    pub cost_efficiency: f64,
}

impl Default for ObjectiveWeights {
    fn default() -> Self {
        Self {
            allocation_fit: 0.4,
            diversification: 0.2,
            risk: 0.2,
            cost_efficiency: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StochasticParams {
    /// Uniform relative price shifts, one scenario each.
    pub shifts: Vec<f64>,
}

impl Default for StochasticParams {
    fn default() -> Self {
        Self {
            shifts: vec![-0.10, -0.05, 0.0, 0.05, 0.10],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonteCarloParams {
    pub paths: usize,
    /// Annualized volatility for securities without their own estimate.
    pub default_volatility: f64,
    pub seed: u64,
}

impl Default for MonteCarloParams {
    fn default() -> Self {
        Self {
            paths: 100,
            default_volatility: 0.2,
            seed: 42,
        }
    }
}

/// How plans are scored. Closed set: every mode is handled exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvaluationMode {
    SingleObjective(EmptyParams),
    MultiObjective(ObjectiveWeights),
    Stochastic(StochasticParams),
    MonteCarlo(MonteCarloParams),
}

impl Default for EvaluationMode {
    fn default() -> Self {
        Self::SingleObjective(EmptyParams {})
    }
}

impl EvaluationMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SingleObjective(_) => "single_objective",
            Self::MultiObjective(_) => "multi_objective",
            Self::Stochastic(_) => "stochastic",
            Self::MonteCarlo(_) => "monte_carlo",
        }
    }
}

// ─── Raw module descriptions ─────────────────────────────────────────

/// A module described as a type name plus a flat numeric parameter map.
///
/// Converted into the typed configuration by [`ModuleSpec::into_calculator`]
/// and friends; keys the module does not know are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSpec {
    pub module_type: String,
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
}

impl ModuleSpec {
    pub fn new(module_type: impl Into<String>) -> Self {
        Self {
            module_type: module_type.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: f64) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn into_calculator(&self) -> Result<CalculatorConfig, ConfigError> {
        let default = CalculatorConfig::default_for(&self.module_type).ok_or_else(|| {
            ConfigError::UnknownModule {
                kind: "calculator",
                name: self.module_type.clone(),
            }
        })?;
        self.apply("calculator", default)
    }

    pub fn into_pattern(&self) -> Result<PatternConfig, ConfigError> {
        let default =
            PatternConfig::default_for(&self.module_type).ok_or_else(|| ConfigError::UnknownModule {
                kind: "pattern",
                name: self.module_type.clone(),
            })?;
        self.apply("pattern", default)
    }

    pub fn into_generator(&self) -> Result<GeneratorConfig, ConfigError> {
        let default = GeneratorConfig::default_for(&self.module_type).ok_or_else(|| {
            ConfigError::UnknownModule {
                kind: "generator",
                name: self.module_type.clone(),
            }
        })?;
        self.apply("generator", default)
    }

    pub fn into_filter(&self) -> Result<FilterConfig, ConfigError> {
        let default =
            FilterConfig::default_for(&self.module_type).ok_or_else(|| ConfigError::UnknownModule {
                kind: "filter",
                name: self.module_type.clone(),
            })?;
        self.apply("filter", default)
    }

    /// Overlay the numeric params onto the serialized defaults of the module.
    ///
    /// The default's serialized keys define the schema. Numbers are coerced to
    /// the default's JSON kind (bool, integer, float).
    fn apply<T: Serialize + DeserializeOwned>(
        &self,
        kind: &'static str,
        default: T,
    ) -> Result<T, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidParameters {
            kind,
            module: self.module_type.clone(),
            message,
        };

        let mut value = serde_json::to_value(&default).map_err(|e| invalid(e.to_string()))?;
        let object = value
            .as_object_mut()
            .ok_or_else(|| invalid("module does not serialize to an object".into()))?;

        for (key, v) in &self.params {
            if key == "type" || !object.contains_key(key) {
                return Err(ConfigError::UnknownParameter {
                    kind,
                    module: self.module_type.clone(),
                    key: key.clone(),
                });
            }
            let coerced = match &object[key] {
                serde_json::Value::Bool(_) => serde_json::Value::Bool(*v != 0.0),
                serde_json::Value::Number(n) if n.is_u64() || n.is_i64() => {
                    if v.fract() != 0.0 || !v.is_finite() {
                        return Err(invalid(format!("`{key}` must be an integer, got {v}")));
                    }
                    serde_json::Value::from(*v as i64)
                }
                serde_json::Value::Null if v.fract() == 0.0 && *v >= 0.0 => {
                    serde_json::Value::from(*v as u64)
                }
                _ => serde_json::Number::from_f64(*v)
                    .map(serde_json::Value::Number)
                    .ok_or_else(|| invalid(format!("`{key}` is not finite")))?,
            };
            object.insert(key.clone(), coerced);
        }

        serde_json::from_value(value).map_err(|e| invalid(e.to_string()))
    }
}

// ─── Planner configuration ───────────────────────────────────────────

/// Tunable policy for one planning run. Immutable during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlannerConfiguration {
    pub name: String,
    pub description: String,

    // ── Search bounds ──
    pub max_depth: usize,
    pub max_opportunities_per_category: usize,
    pub priority_threshold: f64,
    pub beam_width: usize,

    // ── Selection ──
    pub enable_diverse_selection: bool,
    pub diversity_weight: f64,

    // ── Trading constraints ──
    pub transaction_cost_fixed: f64,
    pub transaction_cost_percent: f64,
    pub allow_buy: bool,
    pub allow_sell: bool,

    // ── Scoring ──
    pub evaluation: EvaluationMode,
    pub convergence: ConvergencePolicy,

    // ── Modules ──
    pub calculators: Vec<CalculatorConfig>,
    pub patterns: Vec<PatternConfig>,
    pub generators: Vec<GeneratorConfig>,
    pub filters: Vec<FilterConfig>,
}

impl Default for PlannerConfiguration {
    fn default() -> Self {
        Self {
            name: "default".into(),
            description: String::new(),
            max_depth: 5,
            max_opportunities_per_category: 5,
            priority_threshold: 0.3,
            beam_width: 10,
            enable_diverse_selection: true,
            diversity_weight: 0.3,
            transaction_cost_fixed: 5.0,
            transaction_cost_percent: 0.001,
            allow_buy: true,
            allow_sell: true,
            evaluation: EvaluationMode::default(),
            convergence: ConvergencePolicy::default(),
            calculators: CalculatorConfig::all_defaults(),
            patterns: PatternConfig::all_defaults(),
            generators: vec![
                GeneratorConfig::Combinatorial(Default::default()),
                GeneratorConfig::EnhancedCombinatorial(Default::default()),
                GeneratorConfig::PartialExecution(Default::default()),
                GeneratorConfig::ConstraintRelaxation(Default::default()),
            ],
            filters: vec![
                FilterConfig::Eligibility(EmptyParams {}),
                FilterConfig::RecentlyTraded(EmptyParams {}),
            ],
        }
    }
}

impl PlannerConfiguration {
    /// Parse and validate a TOML configuration.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from disk; `.json` files are parsed as JSON, anything else as TOML.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_toml_str(&text),
        }
    }

    pub fn cost_model(&self) -> CostModel {
        CostModel::new(self.transaction_cost_fixed, self.transaction_cost_percent)
    }

    /// Snapshot with this configuration's cost model and side permissions applied.
    ///
    /// A side stays allowed only if both the snapshot and the configuration allow it.
    pub fn constrain(&self, ctx: &OpportunityContext) -> OpportunityContext {
        OpportunityContext {
            cost_model: self.cost_model(),
            allow_buy: ctx.allow_buy && self.allow_buy,
            allow_sell: ctx.allow_sell && self.allow_sell,
            ..ctx.clone()
        }
    }

    pub fn selection_policy(&self) -> SelectionPolicy {
        SelectionPolicy {
            beam_width: self.beam_width,
            enable_diverse_selection: self.enable_diverse_selection,
            diversity_weight: self.diversity_weight,
        }
    }

    /// Check every range and module list. Bad configuration is surfaced before
    /// any work starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("max_depth", self.max_depth as f64, 1.0, 10.0, "1..=10")?;
        check_range("beam_width", self.beam_width as f64, 1.0, 50.0, "1..=50")?;
        check_range(
            "max_opportunities_per_category",
            self.max_opportunities_per_category as f64,
            1.0,
            100.0,
            "1..=100",
        )?;
        check_range(
            "priority_threshold",
            self.priority_threshold,
            0.0,
            1.0,
            "0.0..=1.0",
        )?;
        check_range("diversity_weight", self.diversity_weight, 0.0, 1.0, "0.0..=1.0")?;
        check_range(
            "transaction_cost_fixed",
            self.transaction_cost_fixed,
            0.0,
            f64::MAX,
            "finite, >= 0",
        )?;
        check_range(
            "transaction_cost_percent",
            self.transaction_cost_percent,
            0.0,
            1.0,
            "0.0..=1.0",
        )?;

        match &self.evaluation {
            EvaluationMode::SingleObjective(_) => {}
            EvaluationMode::MultiObjective(w) => {
                for (field, value) in [
                    ("evaluation.allocation_fit", w.allocation_fit),
                    ("evaluation.diversification", w.diversification),
                    ("evaluation.risk", w.risk),
                    ("evaluation.cost_efficiency", w.cost_efficiency),
                ] {
                    check_range(field, value, 0.0, f64::MAX, "finite, >= 0")?;
                }
            }
            EvaluationMode::Stochastic(p) => {
                for &shift in &p.shifts {
                    if !shift.is_finite() || shift <= -1.0 {
                        return Err(ConfigError::OutOfRange {
                            field: "evaluation.shifts",
                            value: shift,
                            expected: "finite, > -1.0",
                        });
                    }
                }
            }
            EvaluationMode::MonteCarlo(p) => {
                check_range("evaluation.paths", p.paths as f64, 10.0, 500.0, "10..=500")?;
                check_range(
                    "evaluation.default_volatility",
                    p.default_volatility,
                    0.0,
                    5.0,
                    "0.0..=5.0",
                )?;
            }
        }

        if self.convergence.enabled {
            check_range(
                "convergence.plateau",
                self.convergence.plateau as f64,
                1.0,
                10_000.0,
                "1..=10000",
            )?;
            check_range(
                "convergence.check_every",
                self.convergence.check_every as f64,
                1.0,
                10_000.0,
                "1..=10000",
            )?;
        }

        if self.calculators.is_empty() {
            return Err(ConfigError::NoCalculators);
        }
        check_unique("calculator", self.calculators.iter().map(|c| c.name()))?;
        check_unique("pattern", self.patterns.iter().map(|p| p.name()))?;
        check_unique("generator", self.generators.iter().map(|g| g.name()))?;
        check_unique("filter", self.filters.iter().map(|f| f.name()))?;

        for g in &self.generators {
            if let GeneratorConfig::ConstraintRelaxation(p) = g {
                check_range(
                    "constraint_relaxation.threshold_step",
                    p.threshold_step,
                    0.0,
                    1.0,
                    "0.0..=1.0",
                )?;
            }
        }

        Ok(())
    }
}

fn check_range(
    field: &'static str,
    value: f64,
    min: f64,
    max: f64,
    expected: &'static str,
) -> Result<(), ConfigError> {
    if !value.is_finite() || value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            value,
            expected,
        });
    }
    Ok(())
}

fn check_unique<'a>(
    kind: &'static str,
    names: impl Iterator<Item = &'a str>,
) -> Result<(), ConfigError> {
    let mut seen = BTreeSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(ConfigError::DuplicateModule {
                kind,
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

// ─── Run-level parameters ────────────────────────────────────────────

/// Beam width and diversity controls for the selector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectionPolicy {
    pub beam_width: usize,
    pub enable_diverse_selection: bool,
    pub diversity_weight: f64,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            beam_width: 10,
            enable_diverse_selection: true,
            diversity_weight: 0.3,
        }
    }
}

/// Early stop for beam search.
///
/// Plans are scored in groups of `check_every`. After a group, the search stops
/// once at least `min_evaluated` plans were scored and the last `plateau`
/// scored plans brought no new best score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConvergencePolicy {
    pub enabled: bool,
    pub min_evaluated: usize,
    pub plateau: usize,
    pub check_every: usize,
}

impl Default for ConvergencePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            min_evaluated: 10,
            plateau: 5,
            check_every: 5,
        }
    }
}

impl ConvergencePolicy {
    /// Search until no round adds a new sequence.
    pub fn exhaustive() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Run-level parameters composed from the configuration. Immutable per run.
///
/// Built once per planning call or batch and handed to the search and the
/// frontier selection.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanningContext {
    pub max_depth: usize,
    pub selection: SelectionPolicy,
    pub convergence: ConvergencePolicy,
    pub evaluation_mode: EvaluationMode,
    pub enabled_calculators: Vec<&'static str>,
    pub enabled_patterns: Vec<&'static str>,
    pub enabled_generators: Vec<&'static str>,
}

impl PlanningContext {
    pub fn from_config(cfg: &PlannerConfiguration) -> Self {
        Self {
            max_depth: cfg.max_depth,
            selection: cfg.selection_policy(),
            convergence: cfg.convergence,
            evaluation_mode: cfg.evaluation.clone(),
            enabled_calculators: cfg.calculators.iter().map(|c| c.name()).collect(),
            enabled_patterns: cfg.patterns.iter().map(|p| p.name()).collect(),
            enabled_generators: cfg.generators.iter().map(|g| g.name()).collect(),
        }
    }
}
