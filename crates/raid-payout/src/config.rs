//! operator configuration file

use crate::error::{PayoutError, Result};
use crate::retry::RetryPolicy;
use crate::tx::PlanetId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_MEMO: &str = "world boss ranking rewards by world boss signer";

const MAIN_MINER: &str = "http://9c-main-miner-3.nine-chronicles.com/graphql";
const INTERNAL_MINER: &str =
    "http://a778316ca16af4065a02dc2753c1a0fc-1775306312.us-east-2.elb.amazonaws.com/graphql";
const INTERNAL_RPC: &str = "http://9c-internal-rpc-1.nine-chronicles.com/graphql";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    #[default]
    Main,
    Internal,
}

impl NetworkType {
    /// node used for building, signing and polling
    pub fn miner_url(&self) -> &'static str {
        match self {
            NetworkType::Main => MAIN_MINER,
            NetworkType::Internal => INTERNAL_MINER,
        }
    }

    /// every node a signed transaction is staged to
    pub fn headless_urls(&self) -> Vec<&'static str> {
        match self {
            NetworkType::Main => vec![MAIN_MINER],
            NetworkType::Internal => vec![INTERNAL_MINER, INTERNAL_RPC],
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KmsConfig {
    pub endpoint: String,
    pub key_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutConfig {
    pub db_path: PathBuf,
    #[serde(default)]
    pub network: NetworkType,
    pub planet_id: String,
    #[serde(default)]
    pub kms: KmsConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub notify: NotifyConfig,
    pub memo: Option<String>,
    /// overrides the network's miner url
    pub miner_url: Option<String>,
    /// overrides the network's staging targets
    pub headless_urls: Option<Vec<String>>,
}

impl PayoutConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| PayoutError::Config(format!("read {}: {}", path.display(), e)))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| PayoutError::Config(e.to_string()))?;
        config.planet()?;
        Ok(config)
    }

    pub fn planet(&self) -> Result<PlanetId> {
        self.planet_id.parse()
    }

    pub fn miner_url(&self) -> String {
        self.miner_url
            .clone()
            .unwrap_or_else(|| self.network.miner_url().to_string())
    }

    pub fn headless_urls(&self) -> Vec<String> {
        match &self.headless_urls {
            Some(urls) => urls.clone(),
            None => self
                .network
                .headless_urls()
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn memo(&self) -> &str {
        self.memo.as_deref().unwrap_or(DEFAULT_MEMO)
    }

    /// key id and endpoint must be set before a signer can be built
    pub fn require_kms(&self) -> Result<&KmsConfig> {
        if self.kms.key_id.is_empty() || self.kms.endpoint.is_empty() {
            return Err(PayoutError::Config("kms.endpoint and kms.key_id are required".into()));
        }
        Ok(&self.kms)
    }
}
