//! graphql client for chain query nodes
//!
//! connection failures are retried with backoff. once a node answers, any
//! graphql `errors` are returned as-is, since they usually mean the
//! transaction itself was rejected.

use crate::action::Recipient;
use crate::address::Address;
use crate::currency::Currency;
use crate::error::{PayoutError, Result};
use crate::retry::{with_backoff, RetryPolicy};
use crate::store::TxResult;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const STAGE_TRANSACTION: &str = r#"
mutation($payload: String!) {
  stageTransaction(payload: $payload)
}"#;

const TRANSACTION_RESULT: &str = r#"
query($txId: TxId!) {
  transaction {
    transactionResult(txId: $txId) {
      blockHash
      blockIndex
      txStatus
      exceptionName
    }
  }
}"#;

const BALANCE: &str = r#"
query($address: Address!, $currency: CurrencyInput!) {
  stateQuery {
    balance(address: $address, currency: $currency) {
      quantity
      currency {
        ticker
        decimalPlaces
      }
    }
  }
}"#;

const TRANSFER_ASSETS_TX: &str = r#"
query($publicKey: String!, $timeStamp: DateTimeOffset!, $nonce: Long, $sender: Address!, $recipients: [RecipientsInputType!]!, $memo: String) {
  actionTxQuery(publicKey: $publicKey, timestamp: $timeStamp, nonce: $nonce) {
    transferAssets(sender: $sender, recipients: $recipients, memo: $memo)
  }
}"#;

const SIGN_TRANSACTION: &str = r#"
query($unsignedTransaction: String!, $signature: String!) {
  transaction {
    signTransaction(unsignedTransaction: $unsignedTransaction, signature: $signature)
  }
}"#;

/// status reported by `transactionResult`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    Success,
    Failure,
    Staging,
    Invalid,
}

impl TxStatus {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "SUCCESS" => Ok(TxStatus::Success),
            "FAILURE" => Ok(TxStatus::Failure),
            "STAGING" => Ok(TxStatus::Staging),
            "INVALID" => Ok(TxStatus::Invalid),
            other => Err(PayoutError::GraphQl(format!("unknown tx status {}", other))),
        }
    }

    /// result to persist; `None` keeps the row unset
    pub fn terminal(&self) -> Option<TxResult> {
        match self {
            TxStatus::Success => Some(TxResult::Included),
            TxStatus::Failure => Some(TxResult::Failed),
            TxStatus::Staging | TxStatus::Invalid => None,
        }
    }
}

/// reported details of a transaction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxResultInfo {
    pub status: TxStatus,
    pub block_index: Option<u64>,
    pub exception_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Balance {
    pub quantity: String,
    pub currency: BalanceCurrency,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceCurrency {
    pub ticker: String,
    pub decimal_places: u8,
}

#[derive(Deserialize)]
struct GraphQlResponse {
    data: Option<Value>,
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Clone)]
pub struct HeadlessClient {
    client: Client,
    retry: RetryPolicy,
}

impl HeadlessClient {
    pub fn new(retry: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| PayoutError::Config(format!("http client: {}", e)))?;
        Ok(Self { client, retry })
    }

    async fn post(&self, url: &str, query: &str, variables: &Value) -> Result<Value> {
        let payload = json!({ "query": query, "variables": variables });
        let response = self.client.post(url).json(&payload).send().await?;
        let status = response.status();
        let body: GraphQlResponse = response
            .json()
            .await
            .map_err(|e| PayoutError::Http(format!("{} ({}): {}", url, status, e)))?;

        if let Some(errors) = body.errors.filter(|e| !e.is_empty()) {
            let messages: Vec<_> = errors.into_iter().map(|e| e.message).collect();
            return Err(PayoutError::GraphQl(messages.join("; ")));
        }
        body.data
            .ok_or_else(|| PayoutError::GraphQl("response has no data".into()))
    }

    /// post with backoff on connection failures and return `data`
    pub async fn query(&self, url: &str, query: &str, variables: Value) -> Result<Value> {
        debug!(url, "graphql request");
        with_backoff(&self.retry, url, || self.post(url, query, &variables)).await
    }

    async fn query_at<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &str,
        variables: Value,
        path: &[&str],
    ) -> Result<T> {
        let data = self.query(url, query, variables).await?;
        let mut node = &data;
        for key in path {
            node = node
                .get(key)
                .ok_or_else(|| PayoutError::GraphQl(format!("missing field {}", key)))?;
        }
        serde_json::from_value(node.clone())
            .map_err(|e| PayoutError::GraphQl(format!("{}: {}", path.join("."), e)))
    }

    /// submit a signed payload; returns the node's tx id
    pub async fn stage_transaction(&self, url: &str, payload_hex: &str) -> Result<String> {
        self.query_at(
            url,
            STAGE_TRANSACTION,
            json!({ "payload": payload_hex }),
            &["stageTransaction"],
        )
        .await
    }

    pub async fn transaction_result(&self, url: &str, tx_id: &str) -> Result<TxResultInfo> {
        let node: Value = self
            .query_at(
                url,
                TRANSACTION_RESULT,
                json!({ "txId": tx_id }),
                &["transaction", "transactionResult"],
            )
            .await?;
        let status = node
            .get("txStatus")
            .and_then(Value::as_str)
            .ok_or_else(|| PayoutError::GraphQl("missing txStatus".into()))?;
        Ok(TxResultInfo {
            status: TxStatus::parse(status)?,
            block_index: node.get("blockIndex").and_then(Value::as_u64),
            exception_name: node
                .get("exceptionName")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    pub async fn balance(&self, url: &str, address: &Address, currency: &Currency) -> Result<Balance> {
        let minters: Option<Vec<String>> = currency
            .minters
            .as_ref()
            .map(|m| m.iter().map(Address::to_checksum).collect());
        self.query_at(
            url,
            BALANCE,
            json!({
                "address": address.to_checksum(),
                "currency": {
                    "ticker": currency.ticker,
                    "decimalPlaces": currency.decimal_places,
                    "minters": minters,
                },
            }),
            &["stateQuery", "balance"],
        )
        .await
    }

    /// node-built unsigned transfer transaction
    #[allow(clippy::too_many_arguments)]
    pub async fn transfer_assets_tx(
        &self,
        url: &str,
        public_key: &[u8],
        timestamp: &DateTime<Utc>,
        nonce: u64,
        sender: &Address,
        recipients: &[Recipient],
        memo: Option<&str>,
    ) -> Result<Vec<u8>> {
        let recipients: Vec<Value> = recipients
            .iter()
            .map(|r| {
                json!({
                    "recipient": r.address.to_checksum(),
                    "amount": {
                        "ticker": r.amount.currency.ticker,
                        "decimalPlaces": r.amount.currency.decimal_places,
                        "quantity": r.amount.quantity().to_string(),
                    },
                })
            })
            .collect();
        let hex_tx: String = self
            .query_at(
                url,
                TRANSFER_ASSETS_TX,
                json!({
                    "publicKey": hex::encode(public_key),
                    "timeStamp": timestamp.to_rfc3339(),
                    "nonce": nonce,
                    "sender": sender.to_checksum(),
                    "recipients": recipients,
                    "memo": memo,
                }),
                &["actionTxQuery", "transferAssets"],
            )
            .await?;
        hex::decode(hex_tx).map_err(|e| PayoutError::GraphQl(format!("unsigned tx hex: {}", e)))
    }

    /// node-side signature attachment
    pub async fn sign_transaction(&self, url: &str, unsigned: &[u8], signature: &[u8]) -> Result<Vec<u8>> {
        let hex_tx: String = self
            .query_at(
                url,
                SIGN_TRANSACTION,
                json!({
                    "unsignedTransaction": hex::encode(unsigned),
                    "signature": hex::encode(signature),
                }),
                &["transaction", "signTransaction"],
            )
            .await?;
        hex::decode(hex_tx).map_err(|e| PayoutError::GraphQl(format!("signed tx hex: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn client() -> HeadlessClient {
        HeadlessClient::new(RetryPolicy {
            attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 2,
        })
        .unwrap()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(TxStatus::parse("SUCCESS").unwrap().terminal(), Some(TxResult::Included));
        assert_eq!(TxStatus::parse("FAILURE").unwrap().terminal(), Some(TxResult::Failed));
        assert_eq!(TxStatus::parse("STAGING").unwrap().terminal(), None);
        assert_eq!(TxStatus::parse("INVALID").unwrap().terminal(), None);
        assert!(TxStatus::parse("???").is_err());
    }

    #[tokio::test]
    async fn test_stage_transaction() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/graphql")
                    .body_contains("stageTransaction")
                    .body_contains("\"payload\":\"6475\"");
                then.status(200)
                    .json_body(json!({"data": {"stageTransaction": "abcd"}}));
            })
            .await;

        let id = client()
            .stage_transaction(&server.url("/graphql"), "6475")
            .await
            .unwrap();
        assert_eq!(id, "abcd");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_transaction_result() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).body_contains("transactionResult");
                then.status(200).json_body(json!({
                    "data": {"transaction": {"transactionResult": {
                        "blockHash": "00", "blockIndex": 42,
                        "txStatus": "FAILURE", "exceptionName": "InsufficientBalanceException"
                    }}}
                }));
            })
            .await;

        let info = client()
            .transaction_result(&server.url("/graphql"), "ff")
            .await
            .unwrap();
        assert_eq!(info.status, TxStatus::Failure);
        assert_eq!(info.block_index, Some(42));
        assert_eq!(info.exception_name.as_deref(), Some("InsufficientBalanceException"));
    }

    #[tokio::test]
    async fn test_graphql_errors_not_retried() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST);
                then.status(200).json_body(json!({
                    "data": null,
                    "errors": [{"message": "nonce too low"}]
                }));
            })
            .await;

        let err = client()
            .stage_transaction(&server.url("/graphql"), "00")
            .await
            .unwrap_err();
        match err {
            PayoutError::GraphQl(msg) => assert_eq!(msg, "nonce too low"),
            other => panic!("unexpected: {}", other),
        }
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn test_unreachable_node_exhausts_retries() {
        let err = client()
            .stage_transaction("http://127.0.0.1:9/graphql", "00")
            .await
            .unwrap_err();
        assert!(matches!(err, PayoutError::RetriesExhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_balance_and_legacy_assembly() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).body_contains("balance(");
                then.status(200).json_body(json!({
                    "data": {"stateQuery": {"balance": {
                        "quantity": "1500.5",
                        "currency": {"ticker": "CRYSTAL", "decimalPlaces": 18}
                    }}}
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).body_contains("actionTxQuery");
                then.status(200).json_body(json!({
                    "data": {"actionTxQuery": {"transferAssets": "6465"}}
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).body_contains("signTransaction(");
                then.status(200).json_body(json!({
                    "data": {"transaction": {"signTransaction": "64313a5365"}}
                }));
            })
            .await;

        let c = client();
        let url = server.url("/graphql");
        let balance = c
            .balance(&url, &Address([1; 20]), &Currency::new("CRYSTAL", 18))
            .await
            .unwrap();
        assert_eq!(balance.quantity, "1500.5");
        assert_eq!(balance.currency.decimal_places, 18);

        let unsigned = c
            .transfer_assets_tx(&url, &[4; 65], &Utc::now(), 3, &Address([1; 20]), &[], None)
            .await
            .unwrap();
        assert_eq!(unsigned, b"de");
        let signed = c.sign_transaction(&url, &unsigned, &[0x30]).await.unwrap();
        assert_eq!(signed, b"d1:Se");
    }
}
