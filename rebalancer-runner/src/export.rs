//! Plan export: JSON manifest and CSV step/alternative tables.
//!
//! The JSON manifest wraps the [`Plan`] with a `schema_version`; newer versions
//! are rejected on load.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use rebalancer_core::domain::{HolisticPlan, HolisticStep};

use crate::planner::Plan;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanManifest {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub plan: Plan,
}

// ─── JSON ────────────────────────────────────────────────────────────

/// Serialize a plan manifest to pretty JSON.
pub fn export_json(plan: &Plan) -> Result<String> {
    let manifest = PlanManifest {
        schema_version: SCHEMA_VERSION,
        generated_at: Utc::now(),
        plan: plan.clone(),
    };
    serde_json::to_string_pretty(&manifest).context("failed to serialize plan to JSON")
}

/// Parse a plan manifest, rejecting unknown schema versions.
pub fn import_json(json: &str) -> Result<Plan> {
    let manifest: PlanManifest = serde_json::from_str(json).context("failed to deserialize plan from JSON")?;
    if manifest.schema_version > SCHEMA_VERSION {
        bail!(
            "unsupported schema version {} (max supported: {})",
            manifest.schema_version,
            SCHEMA_VERSION
        );
    }
    Ok(manifest.plan)
}

// ─── CSV ─────────────────────────────────────────────────────────────

/// Steps in execution order.
///
/// Columns: step, symbol, side, quantity, estimated_price, estimated_value,
/// currency, reason
pub fn export_steps_csv(steps: &[HolisticStep]) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record([
        "step",
        "symbol",
        "side",
        "quantity",
        "estimated_price",
        "estimated_value",
        "currency",
        "reason",
    ])?;
    for (i, s) in steps.iter().enumerate() {
        wtr.write_record([
            &(i + 1).to_string(),
            &s.symbol,
            s.side.as_str(),
            &s.quantity.to_string(),
            &format!("{:.4}", s.estimated_price),
            &format!("{:.2}", s.estimated_value),
            &s.currency,
            &s.reason,
        ])?;
    }
    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

/// One row per plan, in the given order.
///
/// Columns: rank, sequence_hash, origin, steps, score, feasible, priority, relaxed
pub fn export_plans_csv(plans: &[HolisticPlan]) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record([
        "rank",
        "sequence_hash",
        "origin",
        "steps",
        "score",
        "feasible",
        "priority",
        "relaxed",
    ])?;
    for (i, p) in plans.iter().enumerate() {
        wtr.write_record([
            &(i + 1).to_string(),
            p.sequence_hash().as_str(),
            &p.origin,
            &p.len().to_string(),
            &p.score.map(|s| format!("{s:.6}")).unwrap_or_default(),
            &p.feasible.to_string(),
            &format!("{:.4}", p.priority),
            &p.relaxation.is_some().to_string(),
        ])?;
    }
    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

// ─── Artifact bundle ─────────────────────────────────────────────────

/// Write `plan.json`, `steps.csv` and `alternatives.csv` into a new
/// `{portfolio}_{timestamp}/` directory under `output_dir`.
///
/// Returns the created directory.
pub fn save_artifacts(plan: &Plan, output_dir: &Path) -> Result<PathBuf> {
    let dirname = format!(
        "{}_{}",
        plan.portfolio_hash.short(),
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    );
    let run_dir = output_dir.join(dirname);
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("failed to create artifact dir: {}", run_dir.display()))?;

    write(&run_dir.join("plan.json"), &export_json(plan)?)?;
    write(&run_dir.join("steps.csv"), &export_steps_csv(&plan.steps)?)?;
    write(&run_dir.join("alternatives.csv"), &export_plans_csv(&plan.alternatives)?)?;
    Ok(run_dir)
}

/// Load the plan from an artifact directory's `plan.json`.
pub fn load_artifacts(dir: &Path) -> Result<Plan> {
    let path = dir.join("plan.json");
    let json = std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    import_json(&json)
}

fn write(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::create_plan;
    use rebalancer_core::config::PlannerConfiguration;
    use rebalancer_core::domain::{OpportunityContext, Security, TradeSide};

    fn plan() -> Plan {
        let mut nvda = Security::new("NVDA");
        nvda.score = Some(0.9);
        let ctx = OpportunityContext {
            securities: vec![nvda],
            available_cash_eur: 2_000.0,
            prices: [("NVDA".to_string(), 50.0)].into_iter().collect(),
            ..Default::default()
        };
        create_plan(&ctx, &PlannerConfiguration::default()).unwrap()
    }

    #[test]
    fn steps_csv_has_one_row_per_step() {
        let steps = vec![
            HolisticStep::new("AAPL", TradeSide::Sell, 5, 150.0, "EUR", "take profit"),
            HolisticStep::new("NVDA", TradeSide::Buy, 10, 50.0, "EUR", "high score, strong"),
        ];
        let csv = export_steps_csv(&steps).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("step,symbol,side"));
        assert!(lines[1].starts_with("1,AAPL,SELL,5,"));
        // Commas inside a field are quoted.
        assert!(lines[2].ends_with("\"high score, strong\""));
    }

    #[test]
    fn newer_schema_is_rejected() {
        let json = export_json(&plan()).unwrap();
        let bumped = json.replace(
            &format!("\"schema_version\": {SCHEMA_VERSION}"),
            &format!("\"schema_version\": {}", SCHEMA_VERSION + 1),
        );
        assert!(import_json(&bumped).is_err());
        assert!(import_json(&json).is_ok());
    }

    #[test]
    fn artifacts_round_trip_through_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let p = plan();
        let run_dir = save_artifacts(&p, dir.path()).unwrap();
        assert!(run_dir.join("steps.csv").exists());
        assert!(run_dir.join("alternatives.csv").exists());
        let loaded = load_artifacts(&run_dir).unwrap();
        assert_eq!(loaded.steps.len(), p.steps.len());
        assert_eq!(loaded.portfolio_hash, p.portfolio_hash);
        assert_eq!(loaded.basis, p.basis);
    }
}
