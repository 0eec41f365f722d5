//! Deterministic identification of portfolios and plans.
//!
//! - `portfolio_hash`: positions + securities + cash + pending orders. Prices are
//!   not part of the fingerprint.
//! - `sequence_hash`: the ordered `(symbol, side, quantity)` tuples of a plan.

use std::collections::{BTreeMap, BTreeSet};

use crate::domain::{HolisticStep, OpportunityContext, PortfolioHash, SequenceHash, TradeSide};

/// Compute the portfolio fingerprint.
///
/// Pending orders are applied first (buys add shares and consume cash, sells
/// remove shares and release cash), then one canonical line per symbol and per
/// cash currency is emitted in sorted order and hashed.
pub fn portfolio_hash(ctx: &OpportunityContext) -> PortfolioHash {
    let mut quantities: BTreeMap<&str, u64> = BTreeMap::new();
    for p in &ctx.positions {
        *quantities.entry(p.symbol.as_str()).or_insert(0) += p.quantity;
    }

    let mut cash: BTreeMap<String, f64> = if ctx.cash_balances.is_empty() {
        BTreeMap::from([("EUR".to_string(), ctx.available_cash_eur)])
    } else {
        ctx.cash_balances.clone()
    };

    for order in &ctx.pending_orders {
        let qty = quantities.entry(order.symbol.as_str()).or_insert(0);
        let value = order.quantity as f64 * order.price;
        let balance = cash.entry(order.currency.clone()).or_insert(0.0);
        match order.side {
            TradeSide::Buy => {
                *qty += order.quantity;
                *balance -= value;
            }
            TradeSide::Sell => {
                *qty = qty.saturating_sub(order.quantity);
                *balance += value;
            }
        }
    }

    let symbols: BTreeSet<&str> = quantities
        .keys()
        .copied()
        .chain(ctx.securities.iter().map(|s| s.symbol.as_str()))
        .collect();

    let mut lines: Vec<String> = Vec::with_capacity(symbols.len() + cash.len());
    for symbol in symbols {
        let qty = quantities.get(symbol).copied().unwrap_or(0);
        let line = match ctx.security(symbol) {
            Some(sec) => format!(
                "{}:{}:{}:{}:{}:{}:{}",
                symbol,
                qty,
                sec.allow_buy,
                sec.allow_sell,
                sec.min_lot,
                sec.country.as_deref().unwrap_or(""),
                sec.industry.as_deref().unwrap_or(""),
            ),
            None => format!("{symbol}:{qty}:::::"),
        };
        lines.push(line);
    }
    for (currency, amount) in &cash {
        lines.push(format!("CASH.{}:{:.2}", currency, round2(*amount)));
    }

    PortfolioHash::from_bytes(lines.join("|").as_bytes())
}

/// Hash of the ordered `(symbol, side, quantity)` tuples.
pub fn sequence_hash(steps: &[HolisticStep]) -> SequenceHash {
    let canonical: Vec<String> = steps
        .iter()
        .map(|s| format!("{}:{}:{}", s.symbol, s.side, s.quantity))
        .collect();
    SequenceHash::from_bytes(canonical.join("|").as_bytes())
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
