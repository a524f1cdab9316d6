//! raid-payout: signing and bookkeeping for raid reward transfers
//!
//! rows from the ranking report are grouped by target nonce, encoded as
//! bencodex `transfer_assets3` transactions, signed by a custodial KMS key
//! and persisted so that any step can be re-run without duplicating
//! transactions or ledger rows.
//!
//! ## flow
//!
//! ```text
//! rows -> BatchPlan -> UnsignedTx -> kms sign -> low-s -> SignedTx
//!      -> Store (tx) -> stage / poll -> Store (result, ledger)
//! ```
//!
//! ## usage
//!
//! ```rust,ignore
//! let signer = Signer::connect(Arc::new(HttpKms::new(&endpoint, retry)?), &key_id).await?;
//! let pipeline = Pipeline::new(store, Arc::new(signer), headless, notifier, PlanetId::Odin);
//! let report = pipeline.sign_and_record(&rows, &request).await?;
//! ```

pub mod action;
pub mod address;
pub mod batch;
pub mod bencodex;
pub mod config;
pub mod currency;
pub mod error;
pub mod headless;
pub mod kms;
pub mod nonce;
pub mod notify;
pub mod pipeline;
pub mod report;
pub mod retry;
pub mod signature;
pub mod store;
pub mod tx;

pub use action::{Action, PrepareRewardAssets, Recipient, TransferAssets};
pub use address::Address;
pub use batch::{BatchPlan, RewardRow, MAX_RECIPIENTS_PER_TX};
pub use config::{NetworkType, PayoutConfig};
pub use currency::{Currency, FungibleAssetValue, CRYSTAL};
pub use error::{PayoutError, Result};
pub use headless::HeadlessClient;
pub use kms::{HttpKms, KeyManagementService, LocalKms, SignedTx, Signer};
pub use nonce::NonceGuard;
pub use notify::{LogNotifier, Notifier, WebhookNotifier};
pub use pipeline::{Assembly, NonceOutcome, Pipeline, SignReport, SignRequest};
pub use retry::RetryPolicy;
pub use store::{Store, TransactionRecord, TxResult};
pub use tx::{PlanetId, UnsignedTx};
