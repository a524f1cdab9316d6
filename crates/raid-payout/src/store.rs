//! idempotent persistence for transactions and the reward ledger
//!
//! sled trees:
//! - `transactions`: `tx_id -> TransactionRecord`
//! - `tx_by_signer_nonce`: `signer \0 nonce_be -> tx_id`, unique per (signer, nonce)
//! - `rewards`: `reward_id_be -> RewardRecord`
//! - `reward_keys`: `raid_id_be \0 avatar \0 agent \0 ranking_be -> reward_id_be`
//! - `reward_amounts`: `reward_id_be \0 ticker -> RewardAmount`
//!
//! index trees are written in the same sled transaction as the rows they
//! guard, so uniqueness holds across concurrent writers.

use crate::address::Address;
use crate::batch::RewardRow;
use crate::error::{PayoutError, Result};
use crate::nonce::next_nonce_from;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError, Transactional,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info, warn};

/// terminal chain outcome; absent while unset
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxResult {
    Included,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub tx_id: String,
    pub nonce: u64,
    pub signer: Address,
    /// hex of the signed bytes
    pub payload: String,
    pub tx_result: Option<TxResult>,
    pub created_at: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn new(tx_id: String, nonce: u64, signer: Address, payload: String) -> Self {
        Self {
            tx_id,
            nonce,
            signer,
            payload,
            tx_result: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardRecord {
    pub id: u64,
    pub raid_id: u64,
    pub ranking: u64,
    pub avatar_address: Address,
    pub agent_address: Address,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardAmount {
    pub reward_id: u64,
    pub ticker: String,
    pub decimal_places: u8,
    pub amount: i128,
    pub tx_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxInsert {
    Inserted,
    /// the (signer, nonce) slot or tx id is taken; carries the stored id
    AlreadyExists(String),
}

/// outcome of one ledger pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LedgerSummary {
    pub rewards_inserted: usize,
    pub amounts_inserted: usize,
    pub amounts_skipped: usize,
    /// nonces without a persisted transaction; their rows were not recorded
    pub missing_nonces: Vec<u64>,
}

impl LedgerSummary {
    pub fn is_complete(&self) -> bool {
        self.missing_nonces.is_empty()
    }
}

#[derive(Default)]
struct GroupCounts {
    rewards_inserted: usize,
    amounts_inserted: usize,
    amounts_skipped: usize,
}

/// one amount joined with its transaction's status
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AmountView {
    pub amount: i128,
    pub ticker: String,
    pub tx_id: String,
    pub decimal_places: u8,
    pub tx_result: Option<TxResult>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardView {
    pub avatar_address: Address,
    pub agent_address: Address,
    pub raid_id: u64,
    pub ranking: u64,
    pub rewards: Vec<AmountView>,
}

#[derive(Clone)]
pub struct Store {
    db: sled::Db,
    transactions: sled::Tree,
    tx_by_signer_nonce: sled::Tree,
    rewards: sled::Tree,
    reward_keys: sled::Tree,
    reward_amounts: sled::Tree,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("opening ledger at {}", path.display());
        let db = sled::open(path)?;
        Ok(Self {
            transactions: db.open_tree("transactions")?,
            tx_by_signer_nonce: db.open_tree("tx_by_signer_nonce")?,
            rewards: db.open_tree("rewards")?,
            reward_keys: db.open_tree("reward_keys")?,
            reward_amounts: db.open_tree("reward_amounts")?,
            db,
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    // === transactions ===

    /// insert unless (signer, nonce) or the tx id already exists
    pub fn insert_transaction(&self, record: &TransactionRecord) -> Result<TxInsert> {
        let index_key = signer_nonce_key(&record.signer, record.nonce);
        let value = bincode::serialize(record)?;
        let outcome = (&self.transactions, &self.tx_by_signer_nonce)
            .transaction(
                |(txs, index)| -> ConflictableTransactionResult<TxInsert, PayoutError> {
                    if let Some(existing) = index.get(&index_key)? {
                        return Ok(TxInsert::AlreadyExists(
                            String::from_utf8_lossy(&existing).into_owned(),
                        ));
                    }
                    if txs.get(record.tx_id.as_bytes())?.is_some() {
                        return Ok(TxInsert::AlreadyExists(record.tx_id.clone()));
                    }
                    txs.insert(record.tx_id.as_bytes(), value.as_slice())?;
                    index.insert(index_key.as_slice(), record.tx_id.as_bytes())?;
                    Ok(TxInsert::Inserted)
                },
            )
            .map_err(abort_to_error)?;

        match &outcome {
            TxInsert::Inserted => {
                debug!(tx_id = %record.tx_id, nonce = record.nonce, "transaction stored")
            }
            TxInsert::AlreadyExists(existing) => {
                debug!(nonce = record.nonce, %existing, "transaction slot already taken")
            }
        }
        Ok(outcome)
    }

    pub fn get_transaction(&self, tx_id: &str) -> Result<Option<TransactionRecord>> {
        match self.transactions.get(tx_id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn tx_id_for(&self, signer: &Address, nonce: u64) -> Result<Option<String>> {
        Ok(self
            .tx_by_signer_nonce
            .get(signer_nonce_key(signer, nonce))?
            .map(|id| String::from_utf8_lossy(&id).into_owned()))
    }

    /// ascending nonces persisted for `signer`
    pub fn list_nonces(&self, signer: &Address) -> Result<Vec<u64>> {
        let prefix = signer_prefix(signer);
        self.tx_by_signer_nonce
            .scan_prefix(&prefix)
            .keys()
            .map(|key| {
                let key = key?;
                decode_u64(&key[prefix.len()..])
            })
            .collect()
    }

    pub fn next_nonce(&self, signer: &Address) -> Result<u64> {
        next_nonce_from(self.list_nonces(signer)?)
    }

    /// transactions for `signer` in nonce order
    pub fn transactions_for(&self, signer: &Address) -> Result<Vec<TransactionRecord>> {
        let mut out = Vec::new();
        for entry in self.tx_by_signer_nonce.scan_prefix(signer_prefix(signer)) {
            let (_, tx_id) = entry?;
            let record = self
                .transactions
                .get(&tx_id)?
                .ok_or_else(|| {
                    PayoutError::Storage(format!(
                        "index points at missing transaction {}",
                        String::from_utf8_lossy(&tx_id)
                    ))
                })?;
            out.push(bincode::deserialize(&record)?);
        }
        Ok(out)
    }

    /// unset transactions for `signer` in nonce order
    pub fn pending_transactions(&self, signer: &Address) -> Result<Vec<TransactionRecord>> {
        Ok(self
            .transactions_for(signer)?
            .into_iter()
            .filter(|tx| tx.tx_result.is_none())
            .collect())
    }

    /// set a terminal result; returns false when the row was already terminal
    pub fn set_tx_result(&self, tx_id: &str, result: TxResult) -> Result<bool> {
        self.transactions
            .transaction(|txs| -> ConflictableTransactionResult<bool, PayoutError> {
                let bytes = txs.get(tx_id.as_bytes())?.ok_or_else(|| {
                    ConflictableTransactionError::Abort(PayoutError::Storage(format!(
                        "unknown transaction {}",
                        tx_id
                    )))
                })?;
                let mut record: TransactionRecord = from_bytes(&bytes)?;
                if record.tx_result.is_some() {
                    return Ok(false);
                }
                record.tx_result = Some(result);
                txs.insert(tx_id.as_bytes(), to_bytes(&record)?)?;
                Ok(true)
            })
            .map_err(abort_to_error)
    }

    // === reward ledger ===

    /// record reward rows grouped by nonce; each group lands in one sled
    /// transaction and only if its nonce has a persisted transaction.
    /// rewards and (reward, ticker) amounts that already exist are skipped
    pub fn record_rewards(&self, signer: &Address, rows: &[RewardRow]) -> Result<LedgerSummary> {
        let mut groups: BTreeMap<u64, Vec<&RewardRow>> = BTreeMap::new();
        for row in rows {
            groups.entry(row.target_nonce).or_default().push(row);
        }

        let mut summary = LedgerSummary::default();
        for (nonce, group) in groups {
            let Some(tx_id) = self.tx_id_for(signer, nonce)? else {
                warn!(nonce, rows = group.len(), "no transaction for nonce, rows left for retry");
                summary.missing_nonces.push(nonce);
                continue;
            };
            let counts = self.record_group(&tx_id, &group)?;
            summary.rewards_inserted += counts.rewards_inserted;
            summary.amounts_inserted += counts.amounts_inserted;
            summary.amounts_skipped += counts.amounts_skipped;
        }
        info!(
            rewards = summary.rewards_inserted,
            amounts = summary.amounts_inserted,
            skipped = summary.amounts_skipped,
            missing = summary.missing_nonces.len(),
            "ledger updated"
        );
        Ok(summary)
    }

    fn record_group(&self, tx_id: &str, rows: &[&RewardRow]) -> Result<GroupCounts> {
        let now = Utc::now();
        (&self.rewards, &self.reward_keys, &self.reward_amounts)
            .transaction(
                |(rewards, keys, amounts)| -> ConflictableTransactionResult<GroupCounts, PayoutError> {
                    let mut counts = GroupCounts::default();
                    for row in rows {
                        let key = reward_key(
                            row.raid_id,
                            &row.avatar_address,
                            &row.agent_address,
                            row.ranking,
                        );
                        let reward_id = match keys.get(&key)? {
                            Some(id) => decode_u64(&id).map_err(ConflictableTransactionError::Abort)?,
                            None => {
                                let id = self.db.generate_id()?;
                                let record = RewardRecord {
                                    id,
                                    raid_id: row.raid_id,
                                    ranking: row.ranking,
                                    avatar_address: row.avatar_address,
                                    agent_address: row.agent_address,
                                    created_at: now,
                                };
                                rewards.insert(&id.to_be_bytes()[..], to_bytes(&record)?)?;
                                keys.insert(key.as_slice(), &id.to_be_bytes()[..])?;
                                counts.rewards_inserted += 1;
                                id
                            }
                        };

                        let amount_key = amount_key(reward_id, &row.ticker);
                        if amounts.get(&amount_key)?.is_some() {
                            counts.amounts_skipped += 1;
                            continue;
                        }
                        let amount = RewardAmount {
                            reward_id,
                            ticker: row.ticker.clone(),
                            decimal_places: row.decimal_places,
                            amount: row.amount,
                            tx_id: tx_id.to_string(),
                            created_at: now,
                        };
                        amounts.insert(amount_key.as_slice(), to_bytes(&amount)?)?;
                        counts.amounts_inserted += 1;
                    }
                    Ok(counts)
                },
            )
            .map_err(abort_to_error)
    }

    /// the record for `avatar` in `raid_id`, joined with amounts and results
    pub fn reward_for_avatar(&self, raid_id: u64, avatar: &Address) -> Result<Option<RewardView>> {
        let mut prefix = raid_id.to_be_bytes().to_vec();
        prefix.push(0);
        prefix.extend_from_slice(&avatar.0);
        prefix.push(0);

        let Some(entry) = self.reward_keys.scan_prefix(&prefix).next() else {
            return Ok(None);
        };
        let (_, id_bytes) = entry?;
        self.reward_view(&id_bytes)
    }

    /// every recorded reward of `raid_id`, in (avatar, agent, ranking) order
    pub fn rewards_for_raid(&self, raid_id: u64) -> Result<Vec<RewardView>> {
        let mut prefix = raid_id.to_be_bytes().to_vec();
        prefix.push(0);
        let mut views = Vec::new();
        for entry in self.reward_keys.scan_prefix(&prefix) {
            let (_, id_bytes) = entry?;
            views.extend(self.reward_view(&id_bytes)?);
        }
        Ok(views)
    }

    fn reward_view(&self, id_bytes: &[u8]) -> Result<Option<RewardView>> {
        let record: RewardRecord = match self.rewards.get(id_bytes)? {
            Some(bytes) => bincode::deserialize(&bytes)?,
            None => return Ok(None),
        };

        let mut amount_prefix = id_bytes.to_vec();
        amount_prefix.push(0);
        let mut rewards = Vec::new();
        for entry in self.reward_amounts.scan_prefix(&amount_prefix) {
            let (_, bytes) = entry?;
            let amount: RewardAmount = bincode::deserialize(&bytes)?;
            let tx_result = self
                .get_transaction(&amount.tx_id)?
                .and_then(|tx| tx.tx_result);
            rewards.push(AmountView {
                amount: amount.amount,
                ticker: amount.ticker,
                tx_id: amount.tx_id,
                decimal_places: amount.decimal_places,
                tx_result,
            });
        }

        Ok(Some(RewardView {
            avatar_address: record.avatar_address,
            agent_address: record.agent_address,
            raid_id: record.raid_id,
            ranking: record.ranking,
            rewards,
        }))
    }

    /// distinct (ticker, decimal places) paid out by the ledger
    pub fn currencies(&self) -> Result<Vec<(String, u8)>> {
        let mut set = BTreeSet::new();
        for entry in self.reward_amounts.iter() {
            let (_, bytes) = entry?;
            let amount: RewardAmount = bincode::deserialize(&bytes)?;
            set.insert((amount.ticker, amount.decimal_places));
        }
        Ok(set.into_iter().collect())
    }

    pub fn reward_count(&self) -> usize {
        self.rewards.len()
    }

    pub fn amount_count(&self) -> usize {
        self.reward_amounts.len()
    }
}

fn signer_prefix(signer: &Address) -> Vec<u8> {
    let mut key = signer.0.to_vec();
    key.push(0);
    key
}

fn signer_nonce_key(signer: &Address, nonce: u64) -> Vec<u8> {
    let mut key = signer_prefix(signer);
    key.extend_from_slice(&nonce.to_be_bytes());
    key
}

fn reward_key(raid_id: u64, avatar: &Address, agent: &Address, ranking: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + 1 + 20 + 1 + 20 + 1 + 8);
    key.extend_from_slice(&raid_id.to_be_bytes());
    key.push(0);
    key.extend_from_slice(&avatar.0);
    key.push(0);
    key.extend_from_slice(&agent.0);
    key.push(0);
    key.extend_from_slice(&ranking.to_be_bytes());
    key
}

fn amount_key(reward_id: u64, ticker: &str) -> Vec<u8> {
    let mut key = reward_id.to_be_bytes().to_vec();
    key.push(0);
    key.extend_from_slice(ticker.as_bytes());
    key
}

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| PayoutError::Storage(format!("expected 8-byte id, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(arr))
}

fn to_bytes<T: Serialize>(value: &T) -> ConflictableTransactionResult<Vec<u8>, PayoutError> {
    bincode::serialize(value).map_err(|e| ConflictableTransactionError::Abort(e.into()))
}

fn from_bytes<T: for<'de> Deserialize<'de>>(
    bytes: &[u8],
) -> ConflictableTransactionResult<T, PayoutError> {
    bincode::deserialize(bytes).map_err(|e| ConflictableTransactionError::Abort(e.into()))
}

fn abort_to_error(e: TransactionError<PayoutError>) -> PayoutError {
    match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => e.into(),
    }
}
