//! Branch-and-bound enumeration of candidate combinations.
//!
//! Candidates are visited in a fixed order and every subset (kept in that
//! order) up to `max_depth` steps becomes a plan. A branch is cut as soon as a
//! BUY would overdraw the running cash balance, so unaffordable supersets are
//! never visited.

use std::collections::BTreeSet;

use tracing::debug;

use crate::config::CombinatorialParams;
use crate::domain::{ActionCandidate, HolisticPlan, OpportunityContext, TradeSide};

/// CandidateOrder applied to the pool before enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOrder {
    /// Priority order as given.
    Priority,
    /// All sells first so their proceeds can fund later buys.
    SellsFirst,
}

struct Search<'a> {
    pool: Vec<&'a ActionCandidate>,
    ctx: &'a OpportunityContext,
    params: &'a CombinatorialParams,
    max_depth: usize,
    origin: &'static str,
    out: Vec<HolisticPlan>,
    pruned: usize,
}

impl<'a> Search<'a> {
    fn full(&self) -> bool {
        self.out.len() >= self.params.max_combinations
    }

    fn descend(
        &mut self,
        start: usize,
        chosen: &mut Vec<&'a ActionCandidate>,
        symbols: &mut BTreeSet<&'a str>,
        cash: f64,
        sells: usize,
        buys: usize,
    ) {
        for i in start..self.pool.len() {
            if self.full() {
                return;
            }
            let candidate = self.pool[i];
            if symbols.contains(candidate.symbol()) {
                continue;
            }
            let (next_cash, next_sells, next_buys) = match candidate.side() {
                TradeSide::Buy => {
                    if buys >= self.params.max_buys {
                        continue;
                    }
                    let total = self.ctx.cost_model.buy_total(candidate.value());
                    if total > cash {
                        self.pruned += 1;
                        continue;
                    }
                    (cash - total, sells, buys + 1)
                }
                TradeSide::Sell => {
                    if sells >= self.params.max_sells {
                        continue;
                    }
                    (cash + self.ctx.cost_model.sell_proceeds(candidate.value()), sells + 1, buys)
                }
            };

            chosen.push(candidate);
            symbols.insert(candidate.symbol());
            let owned: Vec<ActionCandidate> = chosen.iter().map(|c| (*c).clone()).collect();
            self.out.push(HolisticPlan::from_candidates(&owned, self.origin));
            if chosen.len() < self.max_depth {
                self.descend(i + 1, chosen, symbols, next_cash, next_sells, next_buys);
            }
            symbols.remove(candidate.symbol());
            chosen.pop();
        }
    }
}

/// Enumerate affordable combinations of the top `max_candidates` candidates.
///
/// `pool` must be sorted by priority, highest first.
pub fn enumerate(
    pool: &[ActionCandidate],
    ctx: &OpportunityContext,
    max_depth: usize,
    params: &CombinatorialParams,
    ordering: CandidateOrder,
    origin: &'static str,
) -> Vec<HolisticPlan> {
    let top: Vec<&ActionCandidate> = pool.iter().take(params.max_candidates).collect();
    let ordered = match ordering {
        CandidateOrder::Priority => top,
        CandidateOrder::SellsFirst => {
            let (sells, buys): (Vec<_>, Vec<_>) = top.into_iter().partition(|c| c.side().is_sell());
            sells.into_iter().chain(buys).collect()
        }
    };

    let mut search = Search {
        pool: ordered,
        ctx,
        params,
        max_depth,
        origin,
        out: Vec::new(),
        pruned: 0,
    };
    if max_depth > 0 {
        let cash = ctx.available_cash_eur.max(0.0);
        search.descend(0, &mut Vec::new(), &mut BTreeSet::new(), cash, 0, 0);
    }
    debug!(
        origin,
        plans = search.out.len(),
        pruned = search.pruned,
        "combinatorial enumeration done"
    );
    search.out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::test_support::{ctx, pool};

    #[test]
    fn every_plan_is_affordable_and_bounded() {
        let c = ctx(1000.0);
        let plans = enumerate(&pool(), &c, 3, &CombinatorialParams::default(), CandidateOrder::Priority, "combinatorial");
        assert!(!plans.is_empty());
        for plan in &plans {
            assert!(plan.len() <= 3);
            assert_eq!(plan.affordable_prefix(c.available_cash_eur, &c.cost_model), plan.len());
        }
    }

    #[test]
    fn sells_first_unlocks_more_buys() {
        use crate::domain::OpportunityCategory;
        use crate::patterns::test_support::candidate;

        let c = ctx(0.0);
        let pool = vec![
            candidate("X", TradeSide::Buy, 8, 100.0, 0.9, OpportunityCategory::OpportunityBuys),
            candidate("A", TradeSide::Sell, 10, 100.0, 0.8, OpportunityCategory::ProfitTaking),
        ];
        let params = CombinatorialParams::default();
        let plain = enumerate(&pool, &c, 5, &params, CandidateOrder::Priority, "combinatorial");
        let enhanced = enumerate(&pool, &c, 5, &params, CandidateOrder::SellsFirst, "enhanced_combinatorial");
        // X precedes the sell in priority order, so it can never be funded
        assert_eq!(plain.len(), 1);
        assert!(plain[0].steps[0].side.is_sell());
        assert_eq!(enhanced.len(), 2);
        assert_eq!(enhanced[1].len(), 2);
        assert!(enhanced[1].steps[1].side.is_buy());
    }

    #[test]
    fn respects_combination_cap() {
        let params = CombinatorialParams {
            max_combinations: 4,
            ..Default::default()
        };
        let plans = enumerate(&pool(), &ctx(100_000.0), 5, &params, CandidateOrder::Priority, "combinatorial");
        assert_eq!(plans.len(), 4);
    }

    #[test]
    fn respects_side_caps() {
        let params = CombinatorialParams {
            max_buys: 1,
            max_sells: 0,
            ..Default::default()
        };
        let plans = enumerate(&pool(), &ctx(100_000.0), 5, &params, CandidateOrder::Priority, "combinatorial");
        assert_eq!(plans.len(), 3);
        assert!(plans.iter().all(|p| p.len() == 1 && p.steps[0].side.is_buy()));
    }

    #[test]
    fn zero_depth_enumerates_nothing() {
        let plans = enumerate(&pool(), &ctx(1000.0), 0, &CombinatorialParams::default(), CandidateOrder::Priority, "combinatorial");
        assert!(plans.is_empty());
    }
}
