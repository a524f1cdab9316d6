//! signing round orchestration
//!
//! one task per nonce signs and persists its transaction; the ledger is
//! written only after every task has resolved. a failed nonce never blocks
//! the others and can be retried on its own with the rows from
//! [`SignReport::retry_rows`], unless a higher nonce already landed; those
//! are reported as [`SignReport::gaps`].

use crate::action::{Action, PrepareRewardAssets, Recipient, TransferAssets};
use crate::address::Address;
use crate::batch::{BatchPlan, RewardRow};
use crate::currency::{Currency, FungibleAssetValue};
use crate::error::{PayoutError, Result};
use crate::headless::{HeadlessClient, TxStatus};
use crate::kms::{SignedTx, Signer};
use crate::nonce::NonceGuard;
use crate::notify::{notify_quietly, Notifier};
use crate::store::{LedgerSummary, RewardView, Store, TransactionRecord, TxInsert, TxResult};
use crate::tx::{self, PlanetId, UnsignedTx};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// where unsigned transactions are built
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Assembly {
    /// encode and canonicalize in-process
    Local,
    /// legacy: the node builds the unsigned tx and attaches the signature
    Remote { url: String },
}

#[derive(Clone, Debug)]
pub struct SignRequest {
    pub timestamp: DateTime<Utc>,
    pub memo: Option<String>,
    pub assembly: Assembly,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NonceOutcome {
    Signed { tx_id: String },
    /// the (signer, nonce) slot was already taken by an earlier run
    AlreadyPersisted { tx_id: String },
    /// at or below the last allocated nonce with no persisted transaction
    Skipped,
    Failed { error: String },
}

#[derive(Clone, Debug, Default)]
pub struct SignReport {
    pub outcomes: BTreeMap<u64, NonceOutcome>,
    /// unsigned nonces below the highest persisted one; the guard will never
    /// sign them, so their rows need a new target nonce
    pub gaps: Vec<u64>,
    pub ledger: LedgerSummary,
}

impl SignReport {
    pub fn failed_nonces(&self) -> Vec<u64> {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, NonceOutcome::Failed { .. }))
            .map(|(n, _)| *n)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.failed_nonces().is_empty() && self.gaps.is_empty() && self.ledger.is_complete()
    }

    /// rows whose nonce still lacks a transaction or ledger entry and can
    /// still be signed; gap nonces are excluded
    pub fn retry_rows(&self, rows: &[RewardRow]) -> Vec<RewardRow> {
        let mut nonces: BTreeSet<u64> = self.failed_nonces().into_iter().collect();
        nonces.extend(self.ledger.missing_nonces.iter().copied());
        for gap in &self.gaps {
            nonces.remove(gap);
        }
        rows.iter()
            .filter(|r| nonces.contains(&r.target_nonce))
            .cloned()
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageFailure {
    pub nonce: u64,
    pub tx_id: String,
    pub url: String,
    pub error: String,
}

#[derive(Clone, Debug, Default)]
pub struct StageReport {
    pub staged: usize,
    pub failures: Vec<StageFailure>,
}

#[derive(Clone, Debug, Default)]
pub struct PollReport {
    /// transactions moved to a terminal result by this poll
    pub updated: Vec<(String, TxResult)>,
    pub still_pending: Vec<String>,
    pub invalid: Vec<String>,
    pub errors: Vec<(String, String)>,
}

/// shared handles for a payout round
#[derive(Clone)]
pub struct Pipeline {
    store: Store,
    signer: Arc<Signer>,
    headless: HeadlessClient,
    notifier: Arc<dyn Notifier>,
    planet: PlanetId,
}

impl Pipeline {
    pub fn new(
        store: Store,
        signer: Arc<Signer>,
        headless: HeadlessClient,
        notifier: Arc<dyn Notifier>,
        planet: PlanetId,
    ) -> Self {
        Self {
            store,
            signer,
            headless,
            notifier,
            planet,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    pub fn headless(&self) -> &HeadlessClient {
        &self.headless
    }

    /// plan, sign every nonce concurrently, then record the ledger
    pub async fn sign_and_record(&self, rows: &[RewardRow], req: &SignRequest) -> Result<SignReport> {
        let plan = BatchPlan::plan(rows)?;
        let sender = self.signer.address();
        let guard = NonceGuard::from_store(&self.store, &sender)?;
        info!(
            nonces = plan.len(),
            max_nonce = guard.max_nonce(),
            planet = %self.planet,
            "starting signing round"
        );

        let mut report = SignReport::default();
        let mut tasks = JoinSet::new();
        let mut spawned = Vec::new();
        for (nonce, recipients) in plan.into_batches() {
            if !guard.should_sign(nonce) {
                let outcome = match self.store.tx_id_for(&sender, nonce)? {
                    Some(tx_id) => NonceOutcome::AlreadyPersisted { tx_id },
                    None => NonceOutcome::Skipped,
                };
                info!(nonce, ?outcome, "not signing");
                report.outcomes.insert(nonce, outcome);
                continue;
            }
            let this = self.clone();
            let req = req.clone();
            spawned.push(nonce);
            tasks.spawn(async move { (nonce, this.sign_batch(nonce, recipients, &req).await) });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((nonce, Ok(outcome))) => {
                    report.outcomes.insert(nonce, outcome);
                }
                Ok((nonce, Err(e))) => {
                    error!(nonce, error = %e, "signing failed");
                    report
                        .outcomes
                        .insert(nonce, NonceOutcome::Failed { error: e.to_string() });
                }
                Err(e) => error!(error = %e, "signing task aborted"),
            }
        }
        for nonce in spawned {
            report
                .outcomes
                .entry(nonce)
                .or_insert_with(|| NonceOutcome::Failed {
                    error: "signing task aborted".into(),
                });
        }

        let highest = self.store.list_nonces(&sender)?.last().copied().unwrap_or(0);
        report.gaps = report
            .outcomes
            .iter()
            .filter(|(nonce, outcome)| {
                **nonce < highest
                    && matches!(outcome, NonceOutcome::Failed { .. } | NonceOutcome::Skipped)
            })
            .map(|(nonce, _)| *nonce)
            .collect();

        report.ledger = self.store.record_rewards(&sender, rows)?;
        self.store.flush()?;

        let failed = report.failed_nonces();
        if !failed.is_empty() {
            let text = format!(
                "raid payout: {} of {} nonces failed to sign: {:?}",
                failed.len(),
                report.outcomes.len(),
                failed
            );
            notify_quietly(self.notifier.as_ref(), &text).await;
        }
        if !report.gaps.is_empty() {
            warn!(gaps = ?report.gaps, highest, "nonce gap left behind");
            let text = format!(
                "raid payout: nonce gap {:?} below taken nonce {}; \
                 these rows cannot be retried and need new target nonces",
                report.gaps, highest
            );
            notify_quietly(self.notifier.as_ref(), &text).await;
        }
        Ok(report)
    }

    /// fund `reward_pool` with the raid's recorded per-currency totals
    pub async fn prepare_reward_assets(
        &self,
        raid_id: u64,
        reward_pool: Address,
        timestamp: DateTime<Utc>,
    ) -> Result<(u64, NonceOutcome)> {
        let assets = reward_totals(&self.store.rewards_for_raid(raid_id)?)?;
        if assets.is_empty() {
            return Err(PayoutError::EmptyRaid(raid_id));
        }
        info!(raid_id, currencies = assets.len(), %reward_pool, "preparing reward assets");
        let action = Action::PrepareRewardAssets(PrepareRewardAssets {
            reward_pool,
            assets,
        });
        self.sign_action(action, timestamp).await
    }

    /// sign `action` at the signer's next free nonce and persist it
    pub async fn sign_action(
        &self,
        action: Action,
        timestamp: DateTime<Utc>,
    ) -> Result<(u64, NonceOutcome)> {
        let nonce = self.store.next_nonce(&self.signer.address())?;
        let type_id = action.type_id();
        let signed = self.sign_local(nonce, action, timestamp).await?;
        let outcome = self.persist(nonce, signed)?;
        self.store.flush()?;
        info!(nonce, type_id, ?outcome, "action signed");
        Ok((nonce, outcome))
    }

    async fn sign_local(
        &self,
        nonce: u64,
        action: Action,
        timestamp: DateTime<Utc>,
    ) -> Result<SignedTx> {
        let unsigned = UnsignedTx {
            planet: self.planet,
            public_key: self.signer.public_key().to_vec(),
            signer: self.signer.address(),
            nonce,
            action,
            timestamp,
        }
        .encode();
        self.signer.sign_transaction(&unsigned).await
    }

    async fn sign_batch(
        &self,
        nonce: u64,
        recipients: Vec<Recipient>,
        req: &SignRequest,
    ) -> Result<NonceOutcome> {
        let sender = self.signer.address();
        let signed = match &req.assembly {
            Assembly::Local => {
                let action = Action::TransferAssets(TransferAssets {
                    sender,
                    recipients,
                    memo: req.memo.clone(),
                });
                self.sign_local(nonce, action, req.timestamp).await?
            }
            Assembly::Remote { url } => {
                let unsigned = self
                    .headless
                    .transfer_assets_tx(
                        url,
                        self.signer.public_key(),
                        &req.timestamp,
                        nonce,
                        &sender,
                        &recipients,
                        req.memo.as_deref(),
                    )
                    .await?;
                let signature = self.signer.sign_digest(&tx::message_hash(&unsigned)).await?;
                let signed = self.headless.sign_transaction(url, &unsigned, &signature).await?;
                SignedTx::from_bytes(signed)
            }
        };
        self.persist(nonce, signed)
    }

    fn persist(&self, nonce: u64, signed: SignedTx) -> Result<NonceOutcome> {
        let sender = self.signer.address();
        let record = TransactionRecord::new(
            signed.tx_id.clone(),
            nonce,
            sender,
            hex::encode(&signed.bytes),
        );
        match self.store.insert_transaction(&record)? {
            TxInsert::Inserted => {
                info!(nonce, tx_id = %signed.tx_id, "transaction signed");
                Ok(NonceOutcome::Signed { tx_id: signed.tx_id })
            }
            TxInsert::AlreadyExists(tx_id) => {
                warn!(nonce, %tx_id, "nonce taken concurrently, keeping stored transaction");
                Ok(NonceOutcome::AlreadyPersisted { tx_id })
            }
        }
    }

    /// broadcast every unset transaction to every url
    pub async fn stage_pending(&self, urls: &[String]) -> Result<StageReport> {
        let pending = self.store.pending_transactions(&self.signer.address())?;
        info!(transactions = pending.len(), nodes = urls.len(), "staging");

        let mut tasks = JoinSet::new();
        for record in pending {
            for url in urls {
                let headless = self.headless.clone();
                let url = url.clone();
                let record = record.clone();
                tasks.spawn(async move {
                    let result = headless.stage_transaction(&url, &record.payload).await;
                    (record, url, result)
                });
            }
        }

        let mut report = StageReport::default();
        while let Some(joined) = tasks.join_next().await {
            let (record, url, result) = joined.map_err(|e| PayoutError::Task(e.to_string()))?;
            match result {
                Ok(staged_id) => {
                    if staged_id != record.tx_id {
                        warn!(nonce = record.nonce, %staged_id, expected = %record.tx_id, "node reported a different tx id");
                    }
                    info!(nonce = record.nonce, tx_id = %record.tx_id, %url, "staged");
                    report.staged += 1;
                }
                Err(e) => {
                    warn!(nonce = record.nonce, %url, error = %e, "stage failed");
                    report.failures.push(StageFailure {
                        nonce: record.nonce,
                        tx_id: record.tx_id,
                        url,
                        error: e.to_string(),
                    });
                }
            }
        }

        if !report.failures.is_empty() {
            let lines: Vec<String> = report
                .failures
                .iter()
                .map(|f| format!("nonce {} at {}: {}", f.nonce, f.url, f.error))
                .collect();
            let text = format!("raid payout: staging failed\n{}", lines.join("\n"));
            notify_quietly(self.notifier.as_ref(), &text).await;
        }
        Ok(report)
    }

    /// poll unset transactions and persist terminal results
    pub async fn poll_pending(&self, url: &str) -> Result<PollReport> {
        let pending = self.store.pending_transactions(&self.signer.address())?;
        let mut tasks = JoinSet::new();
        for record in pending {
            let headless = self.headless.clone();
            let url = url.to_string();
            tasks.spawn(async move {
                let result = headless.transaction_result(&url, &record.tx_id).await;
                (record, result)
            });
        }

        let mut report = PollReport::default();
        let mut rejected = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (record, result) = joined.map_err(|e| PayoutError::Task(e.to_string()))?;
            let info = match result {
                Ok(info) => info,
                Err(e) => {
                    warn!(tx_id = %record.tx_id, error = %e, "poll failed");
                    report.errors.push((record.tx_id, e.to_string()));
                    continue;
                }
            };
            match info.status.terminal() {
                Some(result) => {
                    if self.store.set_tx_result(&record.tx_id, result)? {
                        info!(nonce = record.nonce, tx_id = %record.tx_id, ?result, "result recorded");
                        report.updated.push((record.tx_id.clone(), result));
                    }
                    if result == TxResult::Failed {
                        rejected.push(format!(
                            "nonce {} ({}) failed: {}",
                            record.nonce,
                            record.tx_id,
                            info.exception_name.as_deref().unwrap_or("unknown")
                        ));
                    }
                }
                None if info.status == TxStatus::Invalid => {
                    warn!(nonce = record.nonce, tx_id = %record.tx_id, "transaction invalid");
                    rejected.push(format!("nonce {} ({}) is INVALID", record.nonce, record.tx_id));
                    report.invalid.push(record.tx_id);
                }
                None => report.still_pending.push(record.tx_id),
            }
        }
        self.store.flush()?;

        if !rejected.is_empty() {
            let text = format!("raid payout: chain rejected transactions\n{}", rejected.join("\n"));
            notify_quietly(self.notifier.as_ref(), &text).await;
        }
        Ok(report)
    }
}

/// per-currency sums of recorded amounts, scaled to minor units
fn reward_totals(views: &[RewardView]) -> Result<Vec<FungibleAssetValue>> {
    let mut totals: BTreeMap<(String, u8), i128> = BTreeMap::new();
    for amount in views.iter().flat_map(|v| &v.rewards) {
        let total = totals
            .entry((amount.ticker.clone(), amount.decimal_places))
            .or_default();
        *total = total.checked_add(amount.amount).ok_or_else(|| {
            PayoutError::Encoding(format!("{} total overflows", amount.ticker))
        })?;
    }
    totals
        .into_iter()
        .map(|((ticker, decimal_places), total)| {
            FungibleAssetValue::from_quantity(Currency::new(ticker, decimal_places), total)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::kms::LocalKms;
    use crate::retry::RetryPolicy;
    use crate::tx::DecodedTx;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::tempdir;

    const TEST_SECRET: &str =
        "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify(&self, text: &str) -> Result<()> {
            self.0.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    impl Recorder {
        fn messages(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    async fn pipeline(store: Store) -> (Pipeline, Arc<Recorder>) {
        let kms = LocalKms::from_hex(TEST_SECRET).unwrap();
        let signer = Signer::connect(Arc::new(kms), "local").await.unwrap();
        let headless = HeadlessClient::new(RetryPolicy {
            attempts: 2,
            initial_delay_ms: 1,
            max_delay_ms: 2,
        })
        .unwrap();
        let recorder = Arc::new(Recorder::default());
        let pipeline = Pipeline::new(
            store,
            Arc::new(signer),
            headless,
            recorder.clone(),
            PlanetId::Odin,
        );
        (pipeline, recorder)
    }

    fn row(ranking: u64, ticker: &str, nonce: u64) -> RewardRow {
        RewardRow {
            raid_id: 2,
            ranking,
            agent_address: Address([ranking as u8; 20]),
            avatar_address: Address([ranking as u8 + 50; 20]),
            amount: 10,
            ticker: ticker.into(),
            decimal_places: if ticker == "CRYSTAL" { 18 } else { 0 },
            target_nonce: nonce,
        }
    }

    fn rows() -> Vec<RewardRow> {
        vec![
            row(1, "CRYSTAL", 1),
            row(1, "RUNESTONE_FENRIR1", 1),
            row(2, "CRYSTAL", 2),
        ]
    }

    fn request(assembly: Assembly) -> SignRequest {
        SignRequest {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            memo: Some("raid 2".into()),
            assembly,
        }
    }

    #[tokio::test]
    async fn test_sign_round_persists_transactions_and_ledger() {
        let dir = tempdir().unwrap();
        let (pipeline, recorder) = pipeline(Store::open(dir.path()).unwrap()).await;
        let signer = pipeline.signer().address();

        let report = pipeline.sign_and_record(&rows(), &request(Assembly::Local)).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.outcomes.len(), 2);
        assert!(report
            .outcomes
            .values()
            .all(|o| matches!(o, NonceOutcome::Signed { .. })));
        assert_eq!(report.ledger.rewards_inserted, 2);
        assert_eq!(report.ledger.amounts_inserted, 3);
        assert!(recorder.messages().is_empty());

        let stored = pipeline.store().transactions_for(&signer).unwrap();
        assert_eq!(stored.iter().map(|t| t.nonce).collect::<Vec<_>>(), vec![1, 2]);
        let decoded = DecodedTx::decode(&hex::decode(&stored[0].payload).unwrap()).unwrap();
        assert_eq!(decoded.nonce, 1);
        assert_eq!(decoded.signer, signer);
        match &decoded.actions[0] {
            Action::TransferAssets(t) => {
                assert_eq!(t.recipients.len(), 2);
                // CRYSTAL to the agent, the runestone to the avatar
                assert_eq!(t.recipients[0].address, Address([1; 20]));
                assert_eq!(t.recipients[0].amount.raw, 10 * 10i128.pow(18));
                assert_eq!(t.recipients[1].address, Address([51; 20]));
                assert_eq!(t.memo.as_deref(), Some("raid 2"));
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let dir = tempdir().unwrap();
        let (pipeline, _) = pipeline(Store::open(dir.path()).unwrap()).await;
        let first = pipeline.sign_and_record(&rows(), &request(Assembly::Local)).await.unwrap();

        let mut later = request(Assembly::Local);
        later.timestamp = later.timestamp + chrono::Duration::minutes(5);
        let second = pipeline.sign_and_record(&rows(), &later).await.unwrap();

        for (nonce, outcome) in &second.outcomes {
            let NonceOutcome::Signed { tx_id } = &first.outcomes[nonce] else {
                panic!("first run did not sign {}", nonce);
            };
            assert_eq!(outcome, &NonceOutcome::AlreadyPersisted { tx_id: tx_id.clone() });
        }
        assert_eq!(second.ledger.rewards_inserted, 0);
        assert_eq!(second.ledger.amounts_inserted, 0);
        assert_eq!(second.ledger.amounts_skipped, 3);
        assert_eq!(pipeline.store().amount_count(), 3);
        assert_eq!(pipeline.store().list_nonces(&pipeline.signer().address()).unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_oversized_batch_rejected_before_signing() {
        let dir = tempdir().unwrap();
        let (pipeline, _) = pipeline(Store::open(dir.path()).unwrap()).await;
        let rows: Vec<_> = (0..101).map(|i| row(i, "CRYSTAL", 1)).collect();
        let err = pipeline
            .sign_and_record(&rows, &request(Assembly::Local))
            .await
            .unwrap_err();
        assert!(matches!(err, PayoutError::BatchTooLarge { size: 101, .. }));
        assert!(pipeline
            .store()
            .list_nonces(&pipeline.signer().address())
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_remote_assembly_partial_failure() {
        let dir = tempdir().unwrap();
        let (pipeline, recorder) = pipeline(Store::open(dir.path()).unwrap()).await;
        let signer = pipeline.signer().address();
        let req = request(Assembly::Local);

        // what the node would build and return for nonce 1
        let plan = BatchPlan::plan(&rows()).unwrap();
        let unsigned = UnsignedTx {
            planet: PlanetId::Odin,
            public_key: pipeline.signer().public_key().to_vec(),
            signer,
            nonce: 1,
            action: Action::TransferAssets(TransferAssets {
                sender: signer,
                recipients: plan.get(1).unwrap().to_vec(),
                memo: req.memo.clone(),
            }),
            timestamp: req.timestamp,
        }
        .encode();
        let signed = pipeline.signer().sign_transaction(&unsigned).await.unwrap();

        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .body_contains("actionTxQuery")
                    .body_contains("\"nonce\":1");
                then.status(200).json_body(json!({
                    "data": {"actionTxQuery": {"transferAssets": hex::encode(&unsigned)}}
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .body_contains("actionTxQuery")
                    .body_contains("\"nonce\":2");
                then.status(200).json_body(json!({
                    "data": null,
                    "errors": [{"message": "insufficient balance"}]
                }));
            })
            .await;
        let sign_mock = server
            .mock_async(|when, then| {
                when.method(POST).body_contains("signTransaction(");
                then.status(200).json_body(json!({
                    "data": {"transaction": {"signTransaction": hex::encode(&signed.bytes)}}
                }));
            })
            .await;

        let remote = request(Assembly::Remote {
            url: server.url("/graphql"),
        });
        let report = pipeline.sign_and_record(&rows(), &remote).await.unwrap();
        sign_mock.assert_hits_async(1).await;

        assert_eq!(
            report.outcomes[&1],
            NonceOutcome::Signed {
                tx_id: signed.tx_id.clone()
            }
        );
        assert!(matches!(
            &report.outcomes[&2],
            NonceOutcome::Failed { error } if error.contains("insufficient balance")
        ));
        assert_eq!(report.failed_nonces(), vec![2]);
        assert_eq!(report.ledger.missing_nonces, vec![2]);
        assert_eq!(report.ledger.amounts_inserted, 2);
        let retry = report.retry_rows(&rows());
        assert_eq!(retry, vec![row(2, "CRYSTAL", 2)]);

        let messages = recorder.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("[2]"));

        // retrying only the failed subset completes the round
        let report = pipeline.sign_and_record(&retry, &req).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(pipeline.store().amount_count(), 3);
    }

    #[tokio::test]
    async fn test_lower_failed_nonce_reported_as_gap() {
        let dir = tempdir().unwrap();
        let (pipeline, recorder) = pipeline(Store::open(dir.path()).unwrap()).await;
        let signer = pipeline.signer().address();
        let req = request(Assembly::Local);

        // nonce 2 builds on the node, nonce 1 does not
        let plan = BatchPlan::plan(&rows()).unwrap();
        let unsigned = UnsignedTx {
            planet: PlanetId::Odin,
            public_key: pipeline.signer().public_key().to_vec(),
            signer,
            nonce: 2,
            action: Action::TransferAssets(TransferAssets {
                sender: signer,
                recipients: plan.get(2).unwrap().to_vec(),
                memo: req.memo.clone(),
            }),
            timestamp: req.timestamp,
        }
        .encode();
        let signed = pipeline.signer().sign_transaction(&unsigned).await.unwrap();

        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .body_contains("actionTxQuery")
                    .body_contains("\"nonce\":1");
                then.status(200).json_body(json!({
                    "data": null,
                    "errors": [{"message": "insufficient balance"}]
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .body_contains("actionTxQuery")
                    .body_contains("\"nonce\":2");
                then.status(200).json_body(json!({
                    "data": {"actionTxQuery": {"transferAssets": hex::encode(&unsigned)}}
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).body_contains("signTransaction(");
                then.status(200).json_body(json!({
                    "data": {"transaction": {"signTransaction": hex::encode(&signed.bytes)}}
                }));
            })
            .await;

        let remote = request(Assembly::Remote {
            url: server.url("/graphql"),
        });
        let report = pipeline.sign_and_record(&rows(), &remote).await.unwrap();
        assert_eq!(report.failed_nonces(), vec![1]);
        assert_eq!(report.gaps, vec![1]);
        assert_eq!(report.ledger.missing_nonces, vec![1]);
        assert!(!report.is_complete());
        assert!(report.retry_rows(&rows()).is_empty());

        let messages = recorder.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[1].contains("nonce gap [1]"));

        // rerunning the same rows skips nonce 1 and still reports the gap
        let again = pipeline.sign_and_record(&rows(), &req).await.unwrap();
        assert_eq!(again.outcomes[&1], NonceOutcome::Skipped);
        assert_eq!(again.gaps, vec![1]);
        assert!(again.retry_rows(&rows()).is_empty());
        assert_eq!(pipeline.store().list_nonces(&signer).unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_prepare_reward_assets_from_ledger() {
        let dir = tempdir().unwrap();
        let (pipeline, _) = pipeline(Store::open(dir.path()).unwrap()).await;
        let signer = pipeline.signer().address();
        let pool = Address([0xee; 20]);
        let ts = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();

        assert!(matches!(
            pipeline.prepare_reward_assets(2, pool, ts).await,
            Err(PayoutError::EmptyRaid(2))
        ));

        pipeline.sign_and_record(&rows(), &request(Assembly::Local)).await.unwrap();
        let (nonce, outcome) = pipeline.prepare_reward_assets(2, pool, ts).await.unwrap();
        assert_eq!(nonce, 3);
        let NonceOutcome::Signed { tx_id } = outcome else {
            panic!("unexpected {:?}", outcome);
        };

        let record = pipeline.store().get_transaction(&tx_id).unwrap().unwrap();
        assert_eq!(record.nonce, 3);
        let decoded = DecodedTx::decode(&hex::decode(&record.payload).unwrap()).unwrap();
        assert_eq!(decoded.signer, signer);
        match &decoded.actions[0] {
            Action::PrepareRewardAssets(p) => {
                assert_eq!(p.reward_pool, pool);
                assert_eq!(p.assets.len(), 2);
                // two CRYSTAL amounts of 10, one runestone amount of 10
                assert_eq!(p.assets[0].currency.ticker, "CRYSTAL");
                assert_eq!(p.assets[0].raw, 20 * 10i128.pow(18));
                assert_eq!(p.assets[1].currency.ticker, "RUNESTONE_FENRIR1");
                assert_eq!(p.assets[1].raw, 10);
            }
            other => panic!("unexpected action {:?}", other),
        }
        assert_eq!(pipeline.store().list_nonces(&signer).unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_stage_and_poll() {
        let dir = tempdir().unwrap();
        let (pipeline, recorder) = pipeline(Store::open(dir.path()).unwrap()).await;
        let signed = pipeline.sign_and_record(&rows(), &request(Assembly::Local)).await.unwrap();
        let tx_id = |nonce: u64| match &signed.outcomes[&nonce] {
            NonceOutcome::Signed { tx_id } => tx_id.clone(),
            other => panic!("unexpected {:?}", other),
        };
        let (first, second) = (tx_id(1), tx_id(2));

        let server = MockServer::start_async().await;
        let stage = server
            .mock_async(|when, then| {
                when.method(POST).body_contains("stageTransaction");
                then.status(200)
                    .json_body(json!({"data": {"stageTransaction": "staged"}}));
            })
            .await;
        let urls = vec![server.url("/a"), server.url("/b")];
        let report = pipeline.stage_pending(&urls).await.unwrap();
        assert_eq!(report.staged, 4);
        assert!(report.failures.is_empty());
        stage.assert_hits_async(4).await;

        server
            .mock_async(|when, then| {
                when.method(POST)
                    .body_contains("transactionResult")
                    .body_contains(first.as_str());
                then.status(200).json_body(json!({
                    "data": {"transaction": {"transactionResult": {
                        "blockHash": "00", "blockIndex": 7, "txStatus": "SUCCESS", "exceptionName": null
                    }}}
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .body_contains("transactionResult")
                    .body_contains(second.as_str());
                then.status(200).json_body(json!({
                    "data": {"transaction": {"transactionResult": {
                        "blockHash": null, "blockIndex": null, "txStatus": "INVALID", "exceptionName": null
                    }}}
                }));
            })
            .await;

        let polled = pipeline.poll_pending(&server.url("/graphql")).await.unwrap();
        assert_eq!(polled.updated, vec![(first.clone(), TxResult::Included)]);
        assert_eq!(polled.invalid, vec![second.clone()]);
        assert_eq!(
            pipeline.store().get_transaction(&first).unwrap().unwrap().tx_result,
            Some(TxResult::Included)
        );
        assert_eq!(pipeline.store().get_transaction(&second).unwrap().unwrap().tx_result, None);
        assert!(recorder.messages().iter().any(|m| m.contains("INVALID")));

        // only the unset transaction is polled again
        let again = pipeline.poll_pending(&server.url("/graphql")).await.unwrap();
        assert!(again.updated.is_empty());
        assert_eq!(again.invalid, vec![second]);
    }
}
