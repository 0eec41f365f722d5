//! Price scenarios and the rules that aggregate their scores.
//!
//! Stochastic: `0.6 × worst + 0.4 × mean` over the uniform shifts.
//! Monte-Carlo: `0.4 × worst + 0.3 × p10 + 0.3 × mean` over the sampled paths.
//! Both are convex combinations of order statistics, so the aggregate always
//! lies within `[min, max]` of the scenario scores.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use rand::Rng;

use crate::domain::OpportunityContext;

const TRADING_DAYS: f64 = 252.0;
const MIN_MULTIPLIER: f64 = 0.5;
const MAX_MULTIPLIER: f64 = 2.0;

fn sorted(scores: &[f64]) -> Vec<f64> {
    let mut s = scores.to_vec();
    s.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    s
}

fn mean(scores: &[f64]) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    scores.iter().sum::<f64>() / scores.len() as f64
}

pub fn stochastic_aggregate(scores: &[f64]) -> f64 {
    let s = sorted(scores);
    let Some(&worst) = s.first() else {
        return 0.0;
    };
    0.6 * worst + 0.4 * mean(&s)
}

/// Lower nearest-rank percentile of an ascending slice.
fn percentile(ascending: &[f64], q: f64) -> f64 {
    if ascending.is_empty() {
        return 0.0;
    }
    let idx = ((ascending.len() - 1) as f64 * q).floor() as usize;
    ascending[idx.min(ascending.len() - 1)]
}

pub fn monte_carlo_aggregate(scores: &[f64]) -> f64 {
    let s = sorted(scores);
    let Some(&worst) = s.first() else {
        return 0.0;
    };
    0.4 * worst + 0.3 * percentile(&s, 0.10) + 0.3 * mean(&s)
}

/// Standard normal draw (Box-Muller).
pub fn standard_normal<R: Rng>(rng: &mut R) -> f64 {
    // gen() is in [0, 1); flip it so ln never sees zero.
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// One day's price multiplier per symbol: `exp(σ_daily × z)`, clamped to
/// `[0.5, 2.0]`. Symbols are visited in the given order, so a fixed order and
/// seed give a fixed path.
pub fn sample_multipliers<R: Rng>(
    rng: &mut R,
    symbols: &[String],
    snapshot: &OpportunityContext,
    default_volatility: f64,
) -> BTreeMap<String, f64> {
    symbols
        .iter()
        .map(|symbol| {
            let vol = snapshot
                .security(symbol)
                .and_then(|s| s.volatility)
                .filter(|v| v.is_finite() && *v >= 0.0)
                .unwrap_or(default_volatility);
            let daily = vol / TRADING_DAYS.sqrt();
            let multiplier = (daily * standard_normal(rng)).exp().clamp(MIN_MULTIPLIER, MAX_MULTIPLIER);
            (symbol.clone(), multiplier)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn stochastic_weights_worst_case() {
        // 0.6 * -1 + 0.4 * 0.5
        let agg = stochastic_aggregate(&[2.0, -1.0, 0.5]);
        assert!((agg - (-0.4)).abs() < 1e-12);
    }

    #[test]
    fn aggregates_stay_within_bounds() {
        let scores = [0.3, -0.2, 0.1, 0.05, 0.4, -0.1, 0.0, 0.2, 0.25, 0.15];
        for agg in [stochastic_aggregate(&scores), monte_carlo_aggregate(&scores)] {
            assert!((-0.2..=0.4).contains(&agg));
        }
    }

    #[test]
    fn empty_scores_aggregate_to_zero() {
        assert_eq!(stochastic_aggregate(&[]), 0.0);
        assert_eq!(monte_carlo_aggregate(&[]), 0.0);
    }

    #[test]
    fn normal_draws_look_normal() {
        let mut rng = StdRng::seed_from_u64(7);
        let draws: Vec<f64> = (0..10_000).map(|_| standard_normal(&mut rng)).collect();
        let m = mean(&draws);
        let var = draws.iter().map(|d| (d - m).powi(2)).sum::<f64>() / draws.len() as f64;
        assert!(m.abs() < 0.05);
        assert!((var - 1.0).abs() < 0.1);
        assert!(draws.iter().all(|d| d.is_finite()));
    }

    #[test]
    fn multipliers_are_clamped_and_seeded() {
        let snapshot = OpportunityContext::default();
        let symbols = vec!["A".to_string(), "B".to_string()];
        let a = sample_multipliers(&mut StdRng::seed_from_u64(1), &symbols, &snapshot, 100.0);
        let b = sample_multipliers(&mut StdRng::seed_from_u64(1), &symbols, &snapshot, 100.0);
        assert_eq!(a, b);
        assert!(a.values().all(|m| (MIN_MULTIPLIER..=MAX_MULTIPLIER).contains(m)));
    }
}
