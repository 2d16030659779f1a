//! Settlement / Payout Calculator
//!
//! Pari-mutuel redistribution: the whole pool is split across winning bets
//! in proportion to their share of the winning pool. `calculate_payouts` is
//! a pure function; `SettlementEngine::settle` layers the ledger transfers
//! and bet bookkeeping on top.

use std::sync::Arc;
use tracing::{info, warn};

use crate::ledger::LedgerTransfer;
use crate::models::{Bet, PayoutCalculation, SettlementResult, TransferAttempt};
use crate::stores::BetStore;

/// Compute every bet's payout for a resolved market.
///
/// `payout = floor(amount * total_pool / winning_pool)` in smallest-unit
/// integer arithmetic, so the sum of payouts never exceeds the pool. The
/// flooring remainder (at most one unit per winning bet) is not
/// redistributed; it stays in the pool. If nobody bet on the winning
/// outcome, every bet loses and the house keeps the entire pool.
///
/// The total pool must fit in `i64`; markets whose bets sum past that are
/// rejected rather than letting the narrowing casts truncate.
pub fn calculate_payouts(
    bets: &[Bet],
    winning_outcome: &str,
) -> anyhow::Result<Vec<PayoutCalculation>> {
    let total_pool: u128 = bets.iter().map(|b| b.amount as u128).sum();
    anyhow::ensure!(
        i64::try_from(total_pool).is_ok(),
        "total pool {total_pool} exceeds supported size"
    );
    let winning_pool: u128 = bets
        .iter()
        .filter(|b| b.outcome == winning_outcome)
        .map(|b| b.amount as u128)
        .sum();

    Ok(bets
        .iter()
        .map(|bet| {
            let is_winner = winning_pool > 0 && bet.outcome == winning_outcome;
            let payout_amount = if is_winner {
                // winning_pool > 0 here, so the division is safe; the result
                // is bounded by total_pool, checked above.
                (bet.amount as u128 * total_pool / winning_pool) as u64
            } else {
                0
            };
            PayoutCalculation {
                bet_id: bet.id.clone(),
                user_address: bet.user_address.clone(),
                outcome: bet.outcome.clone(),
                bet_amount: bet.amount,
                payout_amount,
                is_winner,
                profit_loss: payout_amount as i64 - bet.amount as i64,
            }
        })
        .collect())
}

/// Executes settlement for a resolved market: computes payouts, issues one
/// ledger transfer per winning bet, and records bookkeeping on every bet.
pub struct SettlementEngine {
    bets: Arc<dyn BetStore>,
    ledger: Arc<dyn LedgerTransfer>,
}

impl SettlementEngine {
    pub fn new(bets: Arc<dyn BetStore>, ledger: Arc<dyn LedgerTransfer>) -> Self {
        Self { bets, ledger }
    }

    /// Settle all bets on a market against the winning outcome.
    ///
    /// Transfers run sequentially to bound simultaneous load on the ledger.
    /// A failed transfer is recorded on its bet and does not abort the rest;
    /// the result comes back flagged `partial` for out-of-band retry of only
    /// the failed transfers. Settled flags and payout amounts are written
    /// regardless of transfer outcome.
    pub async fn settle(
        &self,
        market_id: &str,
        winning_outcome: &str,
    ) -> anyhow::Result<SettlementResult> {
        let bets = self.bets.bets_for_market(market_id).await?;
        let payouts = calculate_payouts(&bets, winning_outcome)?;

        let mut transfers = Vec::new();
        let mut total_payouts: u64 = 0;
        let mut partial = false;

        for payout in &payouts {
            if payout.is_winner && payout.payout_amount > 0 {
                let memo = format!("payout for bet {}", payout.bet_id);
                match self
                    .ledger
                    .transfer(&payout.user_address, payout.payout_amount, &memo)
                    .await
                {
                    Ok(receipt) => transfers.push(TransferAttempt {
                        bet_id: payout.bet_id.clone(),
                        success: true,
                        tx_id: Some(receipt.tx_id),
                        error: None,
                    }),
                    Err(e) => {
                        warn!(
                            bet_id = %payout.bet_id,
                            amount = payout.payout_amount,
                            error = %e,
                            "⚠️ Payout transfer failed"
                        );
                        partial = true;
                        transfers.push(TransferAttempt {
                            bet_id: payout.bet_id.clone(),
                            success: false,
                            tx_id: None,
                            error: Some(e.to_string()),
                        });
                    }
                }
            }

            // Bookkeeping is decoupled from transfer success.
            self.bets
                .mark_settled(&payout.bet_id, payout.payout_amount)
                .await?;
            total_payouts += payout.payout_amount;
        }

        info!(
            market_id,
            winning_outcome,
            total_bets = payouts.len(),
            total_payouts,
            partial,
            "✅ Market settled"
        );

        Ok(SettlementResult {
            market_id: market_id.to_string(),
            winning_outcome: winning_outcome.to_string(),
            total_bets: payouts.len(),
            total_payouts,
            transfers,
            partial,
        })
    }
}
