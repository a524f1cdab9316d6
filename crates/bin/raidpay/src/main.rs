//! raidpay - operator cli for raid reward payouts
//!
//! ## Usage
//!
//! ```bash
//! # turn ranking rewards into nonce-tagged rows
//! raidpay assign --input rewards.json --raid-id 7 --start-nonce 120 --output rows.csv
//!
//! # check totals before signing
//! raidpay check-amount --csv rows.csv --expect CRYSTAL=1000000 --expect RUNESTONE_FENRIR1=500
//!
//! # sign, broadcast, track
//! raidpay --config raidpay.toml sign --csv rows.csv
//! raidpay --config raidpay.toml stage
//! raidpay --config raidpay.toml poll --output results.csv
//!
//! # fund the reward pool with a raid's recorded totals
//! raidpay --config raidpay.toml prepare-reward-assets --raid-id 7 --reward-pool 0x...
//! ```

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use raid_payout::batch::{parse_rows, write_rows};
use raid_payout::report::{
    assign_target_nonces, check_total_amount, parse_expected, tx_results, write_nonce_summary,
    write_tx_results, RankingReward,
};
use raid_payout::{
    Address, Assembly, Currency, HeadlessClient, HttpKms, KeyManagementService, LocalKms,
    LogNotifier, NonceOutcome, Notifier, PayoutConfig, Pipeline, RewardRow, SignRequest, Signer,
    Store, WebhookNotifier,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "raidpay")]
#[command(about = "sign, broadcast and track raid reward transfers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// config file
    #[arg(short, long, env = "RAIDPAY_CONFIG", default_value = "raidpay.toml")]
    config: PathBuf,

    /// ledger directory, overrides `db_path`
    #[arg(long, env = "RAIDPAY_DB")]
    db: Option<PathBuf>,

    /// kms key id, overrides `kms.key_id`
    #[arg(long, env = "KMS_KEY_ID")]
    key_id: Option<String>,

    /// hex secret for an in-process signer instead of the kms (development only)
    #[arg(long, env = "RAIDPAY_LOCAL_KEY", hide_env_values = true)]
    local_key: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// print signer address and public key
    Address,

    /// print the next unused nonce
    NextNonce,

    /// write nonce-tagged rows from ranking rewards json
    Assign {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(long)]
        raid_id: u64,

        #[arg(long)]
        start_nonce: u64,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// verify per-ticker totals and write per-nonce subtotals
    CheckAmount {
        #[arg(long)]
        csv: PathBuf,

        /// TICKER=AMOUNT, once per currency
        #[arg(long = "expect", required = true)]
        expected: Vec<String>,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// sign every nonce in the rows and record the ledger
    Sign {
        #[arg(long)]
        csv: PathBuf,

        /// rfc3339 transaction timestamp, defaults to now
        #[arg(long)]
        timestamp: Option<String>,

        #[arg(long)]
        memo: Option<String>,

        /// let the miner build and sign the transaction
        #[arg(long)]
        remote_assembly: bool,

        /// where to write rows that still need a retry
        #[arg(long)]
        retry_output: Option<PathBuf>,
    },

    /// broadcast unset transactions to every headless node
    Stage,

    /// poll unset transactions and store results
    Poll {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// sign a prepare_reward_assets tx for a raid's recorded totals
    PrepareRewardAssets {
        #[arg(long)]
        raid_id: u64,

        #[arg(long)]
        reward_pool: Address,

        /// rfc3339 transaction timestamp, defaults to now
        #[arg(long)]
        timestamp: Option<String>,
    },

    /// signer balance for each currency in the ledger
    Balance,

    /// print one avatar's reward record as json
    Reward {
        #[arg(long)]
        raid_id: u64,

        #[arg(long)]
        avatar: Address,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "raidpay=info,raid_payout=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Commands::Assign {
            input,
            raid_id,
            start_nonce,
            output,
        } => return assign(input, *raid_id, *start_nonce, output),
        Commands::CheckAmount {
            csv,
            expected,
            output,
        } => return check_amount(csv, expected, output.as_deref()),
        _ => {}
    }

    let (pipeline, config) = connect(&cli).await?;
    let signer = pipeline.signer().address();
    match &cli.command {
        Commands::Address => {
            println!("address    {}", signer);
            println!("public key {}", hex::encode(pipeline.signer().public_key()));
        }

        Commands::NextNonce => {
            println!("{}", pipeline.store().next_nonce(&signer)?);
        }

        Commands::Sign {
            csv,
            timestamp,
            memo,
            remote_assembly,
            retry_output,
        } => {
            let rows = read_rows(csv)?;
            let timestamp = parse_timestamp(timestamp.as_deref())?;
            let assembly = if *remote_assembly {
                Assembly::Remote {
                    url: config.miner_url(),
                }
            } else {
                Assembly::Local
            };
            let request = SignRequest {
                timestamp,
                memo: Some(memo.clone().unwrap_or_else(|| config.memo().to_string())),
                assembly,
            };

            let report = pipeline.sign_and_record(&rows, &request).await?;
            for (nonce, outcome) in &report.outcomes {
                match outcome {
                    NonceOutcome::Signed { tx_id } => println!("{} signed {}", nonce, tx_id),
                    NonceOutcome::AlreadyPersisted { tx_id } => println!("{} exists {}", nonce, tx_id),
                    NonceOutcome::Skipped => println!("{} skipped", nonce),
                    NonceOutcome::Failed { error } => println!("{} failed {}", nonce, error),
                }
            }
            println!(
                "ledger: {} rewards, {} amounts, {} already recorded",
                report.ledger.rewards_inserted,
                report.ledger.amounts_inserted,
                report.ledger.amounts_skipped
            );
            if !report.gaps.is_empty() {
                println!("gap {:?}: rows need new target nonces", report.gaps);
            }
            if !report.is_complete() {
                let retry = report.retry_rows(&rows);
                if let Some(path) = retry_output {
                    fs::write(path, write_rows(&retry))?;
                }
                bail!(
                    "round incomplete: {} rows need a retry (failed nonces {:?}, unrecorded {:?}, gaps {:?})",
                    retry.len(),
                    report.failed_nonces(),
                    report.ledger.missing_nonces,
                    report.gaps
                );
            }
        }

        Commands::Stage => {
            let report = pipeline.stage_pending(&config.headless_urls()).await?;
            println!("staged {} ({} failures)", report.staged, report.failures.len());
        }

        Commands::Poll { output } => {
            let report = pipeline.poll_pending(&config.miner_url()).await?;
            println!(
                "{} updated, {} pending, {} invalid, {} errors",
                report.updated.len(),
                report.still_pending.len(),
                report.invalid.len(),
                report.errors.len()
            );
            if let Some(path) = output {
                let records = pipeline.store().transactions_for(&signer)?;
                fs::write(path, write_tx_results(&tx_results(&records)))?;
            }
        }

        Commands::PrepareRewardAssets {
            raid_id,
            reward_pool,
            timestamp,
        } => {
            let timestamp = parse_timestamp(timestamp.as_deref())?;
            let (nonce, outcome) = pipeline
                .prepare_reward_assets(*raid_id, *reward_pool, timestamp)
                .await?;
            match outcome {
                NonceOutcome::Signed { tx_id } => println!("{} signed {}", nonce, tx_id),
                NonceOutcome::AlreadyPersisted { tx_id } => println!("{} exists {}", nonce, tx_id),
                other => bail!("nonce {}: {:?}", nonce, other),
            }
        }

        Commands::Balance => {
            let url = config.miner_url();
            for (ticker, decimal_places) in pipeline.store().currencies()? {
                let currency = Currency::new(ticker, decimal_places);
                let balance = pipeline.headless().balance(&url, &signer, &currency).await?;
                println!("{} {}", balance.quantity, balance.currency.ticker);
            }
        }

        Commands::Reward { raid_id, avatar } => {
            match pipeline.store().reward_for_avatar(*raid_id, avatar)? {
                Some(view) => println!("{}", serde_json::to_string_pretty(&view)?),
                None => bail!("no reward for {} in raid {}", avatar, raid_id),
            }
        }

        Commands::Assign { .. } | Commands::CheckAmount { .. } => {}
    }
    Ok(())
}

fn assign(input: &Path, raid_id: u64, start_nonce: u64, output: &Path) -> Result<()> {
    let json = fs::read_to_string(input).with_context(|| format!("read {}", input.display()))?;
    let rankings: Vec<RankingReward> = serde_json::from_str(&json).context("ranking rewards")?;
    let rows = assign_target_nonces(raid_id, &rankings, start_nonce)?;
    fs::write(output, write_rows(&rows))?;
    let last = rows.last().map_or(start_nonce, |r| r.target_nonce);
    info!(rows = rows.len(), first = start_nonce, last, "rows written to {}", output.display());
    Ok(())
}

fn check_amount(csv: &Path, expected: &[String], output: Option<&Path>) -> Result<()> {
    let rows = read_rows(csv)?;
    let expected = expected
        .iter()
        .map(|s| parse_expected(s))
        .collect::<raid_payout::Result<Vec<_>>>()?;
    let totals = check_total_amount(&rows, &expected)?;
    let summary = write_nonce_summary(&totals);
    match output {
        Some(path) => fs::write(path, &summary)?,
        None => print!("{}", summary),
    }
    info!(nonces = totals.len(), "totals match");
    Ok(())
}

/// rfc3339, or now
fn parse_timestamp(ts: Option<&str>) -> Result<DateTime<Utc>> {
    Ok(match ts {
        Some(ts) => DateTime::parse_from_rfc3339(ts)
            .context("timestamp")?
            .with_timezone(&Utc),
        None => Utc::now(),
    })
}

fn read_rows(path: &Path) -> Result<Vec<RewardRow>> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Ok(parse_rows(&text)?)
}

/// load config, apply overrides, build the signer and ledger handles
async fn connect(cli: &Cli) -> Result<(Pipeline, PayoutConfig)> {
    let mut config = PayoutConfig::load(&cli.config)?;
    if let Some(db) = &cli.db {
        config.db_path = db.clone();
    }
    if let Some(key_id) = &cli.key_id {
        config.kms.key_id = key_id.clone();
    }

    let kms: Arc<dyn KeyManagementService> = match &cli.local_key {
        Some(secret) => {
            warn!("using in-process signing key");
            config.kms.key_id = "local".into();
            Arc::new(LocalKms::from_hex(secret)?)
        }
        None => {
            let kms = config.require_kms()?;
            Arc::new(HttpKms::new(&kms.endpoint, config.retry.clone())?)
        }
    };
    let signer = Signer::connect(kms, &config.kms.key_id).await?;
    let notifier: Arc<dyn Notifier> = match &config.notify.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url)?),
        None => Arc::new(LogNotifier),
    };

    let pipeline = Pipeline::new(
        Store::open(&config.db_path)?,
        Arc::new(signer),
        HeadlessClient::new(config.retry.clone())?,
        notifier,
        config.planet()?,
    );
    Ok((pipeline, config))
}
