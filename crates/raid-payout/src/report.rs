//! report stage: ranking rewards to nonce-tagged rows, and the CSV
//! summaries operators check before and after a payout round

use crate::address::Address;
use crate::batch::{RewardRow, MAX_RECIPIENTS_PER_TX};
use crate::error::{PayoutError, Result};
use crate::store::{TransactionRecord, TxResult};
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Raider {
    /// avatar address
    pub address: Address,
    pub ranking: u64,
    pub agent_address: Address,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardCurrency {
    pub ticker: String,
    pub decimal_places: u8,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Reward {
    /// whole units, as a decimal string
    pub quantity: String,
    pub currency: RewardCurrency,
}

/// one raider's rewards as returned by the ranking data provider
#[derive(Clone, Debug, Deserialize)]
pub struct RankingReward {
    pub raider: Raider,
    pub rewards: Vec<Reward>,
}

/// flatten rankings into rows; the i-th amount gets `start_nonce + i / 100`
pub fn assign_target_nonces(
    raid_id: u64,
    rankings: &[RankingReward],
    start_nonce: u64,
) -> Result<Vec<RewardRow>> {
    let mut rows = Vec::new();
    for entry in rankings {
        for reward in &entry.rewards {
            let amount = reward.quantity.trim().parse::<i128>().map_err(|e| {
                PayoutError::InvalidRow {
                    line: rows.len() + 1,
                    reason: format!("quantity {:?}: {}", reward.quantity, e),
                }
            })?;
            let line = rows.len() + 1;
            let target_nonce = start_nonce
                .checked_add((rows.len() / MAX_RECIPIENTS_PER_TX) as u64)
                .ok_or(PayoutError::NonceExhausted(start_nonce))?;
            let row = RewardRow {
                raid_id,
                ranking: entry.raider.ranking,
                agent_address: entry.raider.agent_address,
                avatar_address: entry.raider.address,
                amount,
                ticker: reward.currency.ticker.clone(),
                decimal_places: reward.currency.decimal_places,
                target_nonce,
            };
            row.validate(line)?;
            rows.push(row);
        }
    }
    Ok(rows)
}

/// per-nonce per-ticker subtotals
pub type NonceTotals = BTreeMap<u64, BTreeMap<String, i128>>;

/// verify per-ticker totals against the operator's figures: every ticker
/// present, no extras, exact sums
pub fn check_total_amount(rows: &[RewardRow], expected: &[(String, i128)]) -> Result<NonceTotals> {
    let mut per_ticker: BTreeMap<&str, i128> = BTreeMap::new();
    let mut per_nonce: NonceTotals = BTreeMap::new();
    for row in rows {
        *per_ticker.entry(row.ticker.as_str()).or_default() += row.amount;
        *per_nonce
            .entry(row.target_nonce)
            .or_default()
            .entry(row.ticker.clone())
            .or_default() += row.amount;
    }

    for ticker in per_ticker.keys() {
        if !expected.iter().any(|(t, _)| t == ticker) {
            return Err(PayoutError::AmountMismatch(format!("missing check {}", ticker)));
        }
    }
    if per_ticker.len() != expected.len() {
        return Err(PayoutError::AmountMismatch("missing currency".into()));
    }
    for (ticker, amount) in expected {
        let actual = per_ticker.get(ticker.as_str()).copied().unwrap_or_default();
        if actual != *amount {
            return Err(PayoutError::AmountMismatch(format!(
                "{} total amount is wrong. given: {}, actual: {}",
                ticker, amount, actual
            )));
        }
    }
    Ok(per_nonce)
}

/// `TICKER=AMOUNT`
pub fn parse_expected(spec: &str) -> Result<(String, i128)> {
    let (ticker, amount) = spec
        .split_once('=')
        .ok_or_else(|| PayoutError::Config(format!("expected TICKER=AMOUNT, got {:?}", spec)))?;
    let amount = amount
        .trim()
        .parse()
        .map_err(|e| PayoutError::Config(format!("amount for {}: {}", ticker, e)))?;
    Ok((ticker.trim().to_string(), amount))
}

pub fn write_nonce_summary(totals: &NonceTotals) -> String {
    let mut out = String::from("nonce,ticker,amount\n");
    for (nonce, tickers) in totals {
        for (ticker, amount) in tickers {
            out.push_str(&format!("{},{},{}\n", nonce, ticker, amount));
        }
    }
    out
}

pub fn write_tx_results(results: &[(String, Option<TxResult>)]) -> String {
    let mut out = String::from("tx_id,result\n");
    for (tx_id, result) in results {
        let result = match result {
            Some(TxResult::Included) => "included",
            Some(TxResult::Failed) => "failed",
            None => "",
        };
        out.push_str(&format!("{},{}\n", tx_id, result));
    }
    out
}

/// `(tx_id, result)` pairs in nonce order
pub fn tx_results(records: &[TransactionRecord]) -> Vec<(String, Option<TxResult>)> {
    records
        .iter()
        .map(|r| (r.tx_id.clone(), r.tx_result))
        .collect()
}
