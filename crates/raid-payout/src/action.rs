//! typed actions carried by reward transactions
//!
//! each variant owns its plain-value encoding: a text dict with `type_id` and
//! `values`.

use crate::address::Address;
use crate::bencodex::Value;
use crate::currency::FungibleAssetValue;
use crate::error::{PayoutError, Result};
use serde::{Deserialize, Serialize};

pub const TRANSFER_ASSETS: &str = "transfer_assets3";
pub const PREPARE_REWARD_ASSETS: &str = "prepare_reward_assets";

/// one payout line inside a transfer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub address: Address,
    pub amount: FungibleAssetValue,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferAssets {
    pub sender: Address,
    pub recipients: Vec<Recipient>,
    pub memo: Option<String>,
}

/// moves the raid's reward totals into the reward pool before payout
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrepareRewardAssets {
    pub reward_pool: Address,
    pub assets: Vec<FungibleAssetValue>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    TransferAssets(TransferAssets),
    PrepareRewardAssets(PrepareRewardAssets),
}

impl Action {
    pub fn type_id(&self) -> &'static str {
        match self {
            Action::TransferAssets(_) => TRANSFER_ASSETS,
            Action::PrepareRewardAssets(_) => PREPARE_REWARD_ASSETS,
        }
    }

    pub fn plain_value(&self) -> Value {
        let values = match self {
            Action::TransferAssets(a) => a.values(),
            Action::PrepareRewardAssets(a) => a.values(),
        };
        Value::text_dict([
            ("type_id", Value::text(self.type_id())),
            ("values", values),
        ])
    }

    pub fn from_plain_value(value: &Value) -> Result<Self> {
        let type_id = value
            .get("type_id")
            .and_then(Value::as_text)
            .ok_or_else(|| PayoutError::Decoding("action: missing type_id".into()))?;
        let values = value
            .get("values")
            .ok_or_else(|| PayoutError::Decoding("action: missing values".into()))?;
        match type_id {
            TRANSFER_ASSETS => Ok(Action::TransferAssets(TransferAssets::from_values(values)?)),
            PREPARE_REWARD_ASSETS => Ok(Action::PrepareRewardAssets(
                PrepareRewardAssets::from_values(values)?,
            )),
            other => Err(PayoutError::Decoding(format!("unknown action type: {}", other))),
        }
    }
}

fn memo_entry(memo: &Option<String>) -> Option<(&'static str, Value)> {
    memo.as_ref().map(|m| ("memo", Value::text(m.clone())))
}

fn address_from(value: &Value, what: &str) -> Result<Address> {
    let bytes = value
        .as_binary()
        .ok_or_else(|| PayoutError::Decoding(format!("{} must be binary", what)))?;
    let arr: [u8; 20] = bytes
        .try_into()
        .map_err(|_| PayoutError::Decoding(format!("{} must be 20 bytes", what)))?;
    Ok(Address(arr))
}

fn fav_list(value: Option<&Value>, what: &str) -> Result<Vec<FungibleAssetValue>> {
    value
        .and_then(Value::as_list)
        .ok_or_else(|| PayoutError::Decoding(format!("{} must be a list", what)))?
        .iter()
        .map(FungibleAssetValue::from_value)
        .collect()
}

impl TransferAssets {
    fn values(&self) -> Value {
        let recipients = self
            .recipients
            .iter()
            .map(|r| {
                Value::List(vec![
                    Value::binary(r.address.0.to_vec()),
                    r.amount.to_value(),
                ])
            })
            .collect();
        let mut entries = vec![
            ("sender", Value::binary(self.sender.0.to_vec())),
            ("recipients", Value::List(recipients)),
        ];
        entries.extend(memo_entry(&self.memo));
        Value::text_dict(entries)
    }

    fn from_values(values: &Value) -> Result<Self> {
        let sender = address_from(
            values
                .get("sender")
                .ok_or_else(|| PayoutError::Decoding("transfer: missing sender".into()))?,
            "sender",
        )?;
        let recipients = values
            .get("recipients")
            .and_then(Value::as_list)
            .ok_or_else(|| PayoutError::Decoding("transfer: missing recipients".into()))?
            .iter()
            .map(|entry| match entry.as_list() {
                Some([addr, fav]) => Ok(Recipient {
                    address: address_from(addr, "recipient")?,
                    amount: FungibleAssetValue::from_value(fav)?,
                }),
                _ => Err(PayoutError::Decoding(
                    "recipient must be [address, amount]".into(),
                )),
            })
            .collect::<Result<Vec<_>>>()?;
        let memo = values.get("memo").and_then(Value::as_text).map(str::to_string);
        Ok(Self {
            sender,
            recipients,
            memo,
        })
    }
}

impl PrepareRewardAssets {
    fn values(&self) -> Value {
        Value::text_dict([
            ("r", Value::binary(self.reward_pool.0.to_vec())),
            (
                "a",
                Value::List(self.assets.iter().map(FungibleAssetValue::to_value).collect()),
            ),
        ])
    }

    fn from_values(values: &Value) -> Result<Self> {
        let reward_pool = address_from(
            values
                .get("r")
                .ok_or_else(|| PayoutError::Decoding("prepare: missing r".into()))?,
            "reward pool",
        )?;
        Ok(Self {
            reward_pool,
            assets: fav_list(values.get("a"), "assets")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::{Currency, CRYSTAL};

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    #[test]
    fn test_transfer_assets_plain_value() {
        let to = addr("0x2531e5e06cBD11aF54f98D39578990716fFC7dBa");
        let action = Action::TransferAssets(TransferAssets {
            sender: addr("0xCFCd6565287314FF70e4C4CF309dB701C43eA5bD"),
            recipients: vec![
                Recipient {
                    address: to,
                    amount: FungibleAssetValue::from_quantity(Currency::new(CRYSTAL, 18), 10)
                        .unwrap(),
                },
                Recipient {
                    address: to,
                    amount: FungibleAssetValue::from_quantity(
                        Currency::new("RUNESTONE_FENRIR1", 0),
                        100,
                    )
                    .unwrap(),
                },
            ],
            memo: Some("memo".into()),
        });
        let pv = action.plain_value();
        assert_eq!(pv.get("type_id").and_then(Value::as_text), Some("transfer_assets3"));

        let values = pv.get("values").unwrap();
        let recipients = values.get("recipients").and_then(Value::as_list).unwrap();
        assert_eq!(recipients.len(), 2);
        let first = recipients[0].as_list().unwrap();
        assert_eq!(first[0].as_binary(), Some(&to.0[..]));
        let fav = FungibleAssetValue::from_value(&first[1]).unwrap();
        assert_eq!(fav.raw, 10_000_000_000_000_000_000);
        assert_eq!(values.get("memo").and_then(Value::as_text), Some("memo"));

        assert_eq!(Action::from_plain_value(&pv).unwrap(), action);
    }

    #[test]
    fn test_transfer_without_memo_omits_key() {
        let action = Action::TransferAssets(TransferAssets {
            sender: Address([1; 20]),
            recipients: vec![],
            memo: None,
        });
        let pv = action.plain_value();
        assert!(pv.get("values").unwrap().get("memo").is_none());
    }

    #[test]
    fn test_prepare_reward_assets_plain_value() {
        let rune = FungibleAssetValue::from_quantity(Currency::new("RUNESTONE_FENRIR1", 0), 3).unwrap();
        let prepare = Action::PrepareRewardAssets(PrepareRewardAssets {
            reward_pool: Address([3; 20]),
            assets: vec![rune.clone()],
        });
        assert_eq!(prepare.type_id(), "prepare_reward_assets");
        let pv = prepare.plain_value();
        let values = pv.get("values").unwrap();
        assert_eq!(values.get("r").and_then(Value::as_binary), Some(&[3u8; 20][..]));
        let assets = values.get("a").and_then(Value::as_list).unwrap();
        assert_eq!(FungibleAssetValue::from_value(&assets[0]).unwrap(), rune);
        assert_eq!(Action::from_plain_value(&pv).unwrap(), prepare);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let pv = Value::text_dict([("type_id", Value::text("hack")), ("values", Value::Null)]);
        assert!(Action::from_plain_value(&pv).is_err());
    }
}
