//! reward rows and nonce-grouped batch planning
//!
//! row columns, in order:
//! `raid_id,ranking,agent_address,avatar_address,amount,ticker,decimal_places,target_nonce`

use crate::action::Recipient;
use crate::address::Address;
use crate::currency::{Currency, FungibleAssetValue, CRYSTAL};
use crate::error::{PayoutError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// recipients one transaction may carry
pub const MAX_RECIPIENTS_PER_TX: usize = 100;

pub const CSV_HEADER: &str =
    "raid_id,ranking,agent_address,avatar_address,amount,ticker,decimal_places,target_nonce";

const COLUMNS: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardRow {
    pub raid_id: u64,
    pub ranking: u64,
    pub agent_address: Address,
    pub avatar_address: Address,
    /// whole-unit quantity, scaled by `decimal_places` when encoded
    pub amount: i128,
    pub ticker: String,
    pub decimal_places: u8,
    pub target_nonce: u64,
}

impl RewardRow {
    /// CRYSTAL goes to the agent, everything else to the avatar
    pub fn recipient_address(&self) -> Address {
        if self.ticker == CRYSTAL {
            self.agent_address
        } else {
            self.avatar_address
        }
    }

    pub fn recipient(&self) -> Result<Recipient> {
        let currency = Currency::new(self.ticker.clone(), self.decimal_places);
        Ok(Recipient {
            address: self.recipient_address(),
            amount: FungibleAssetValue::from_quantity(currency, self.amount)?,
        })
    }

    fn parse(line_no: usize, fields: &[&str]) -> Result<Self> {
        if fields.len() != COLUMNS {
            return Err(PayoutError::InvalidRow {
                line: line_no,
                reason: format!("expected {} columns, got {}", COLUMNS, fields.len()),
            });
        }
        let bad = |column: &str, e: &dyn std::fmt::Display| PayoutError::InvalidRow {
            line: line_no,
            reason: format!("{}: {}", column, e),
        };
        let row = Self {
            raid_id: fields[0].parse().map_err(|e| bad("raid_id", &e))?,
            ranking: fields[1].parse().map_err(|e| bad("ranking", &e))?,
            agent_address: fields[2].parse().map_err(|e| bad("agent_address", &e))?,
            avatar_address: fields[3].parse().map_err(|e| bad("avatar_address", &e))?,
            amount: fields[4].parse().map_err(|e| bad("amount", &e))?,
            ticker: fields[5].to_string(),
            decimal_places: fields[6].parse().map_err(|e| bad("decimal_places", &e))?,
            target_nonce: fields[7].parse().map_err(|e| bad("target_nonce", &e))?,
        };
        row.validate(line_no)?;
        Ok(row)
    }

    /// positive amount, and a target nonce in `1..u64::MAX` so the next
    /// nonce after it still exists
    pub fn validate(&self, line_no: usize) -> Result<()> {
        let reason = if self.amount <= 0 {
            format!("amount must be positive, got {}", self.amount)
        } else if self.target_nonce == 0 || self.target_nonce == u64::MAX {
            format!("target_nonce {} out of range", self.target_nonce)
        } else {
            return Ok(());
        };
        Err(PayoutError::InvalidRow {
            line: line_no,
            reason,
        })
    }

    pub fn to_csv_line(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{}",
            self.raid_id,
            self.ranking,
            self.agent_address,
            self.avatar_address,
            self.amount,
            self.ticker,
            self.decimal_places,
            self.target_nonce
        )
    }
}

/// parse report rows; a first line whose first field is not an integer is
/// treated as the header
pub fn parse_rows(text: &str) -> Result<Vec<RewardRow>> {
    let mut rows = Vec::new();
    let mut first = true;
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if std::mem::take(&mut first) && fields[0].parse::<i128>().is_err() {
            continue;
        }
        rows.push(RewardRow::parse(idx + 1, &fields)?);
    }
    Ok(rows)
}

pub fn write_rows(rows: &[RewardRow]) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for row in rows {
        out.push_str(&row.to_csv_line());
        out.push('\n');
    }
    out
}

/// recipients grouped by target nonce, ascending
#[derive(Clone, Debug, Default)]
pub struct BatchPlan {
    batches: BTreeMap<u64, Vec<Recipient>>,
}

impl BatchPlan {
    /// rejects any nonce carrying more than [`MAX_RECIPIENTS_PER_TX`]
    pub fn plan(rows: &[RewardRow]) -> Result<Self> {
        let mut batches: BTreeMap<u64, Vec<Recipient>> = BTreeMap::new();
        for row in rows {
            batches
                .entry(row.target_nonce)
                .or_default()
                .push(row.recipient()?);
        }
        for (nonce, recipients) in &batches {
            if recipients.len() > MAX_RECIPIENTS_PER_TX {
                return Err(PayoutError::BatchTooLarge {
                    nonce: *nonce,
                    size: recipients.len(),
                    max: MAX_RECIPIENTS_PER_TX,
                });
            }
        }
        Ok(Self { batches })
    }

    pub fn nonces(&self) -> impl Iterator<Item = u64> + '_ {
        self.batches.keys().copied()
    }

    pub fn get(&self, nonce: u64) -> Option<&[Recipient]> {
        self.batches.get(&nonce).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn into_batches(self) -> BTreeMap<u64, Vec<Recipient>> {
        self.batches
    }
}
