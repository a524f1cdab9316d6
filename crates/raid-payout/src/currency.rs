//! currencies and fungible asset values

use crate::address::Address;
use crate::bencodex::Value;
use crate::error::{PayoutError, Result};
use serde::{Deserialize, Serialize};

/// ticker of the currency whose rewards route to the agent address
pub const CRYSTAL: &str = "CRYSTAL";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Currency {
    pub ticker: String,
    pub decimal_places: u8,
    /// `None` means anyone may mint
    pub minters: Option<Vec<Address>>,
}

impl Currency {
    pub fn new(ticker: impl Into<String>, decimal_places: u8) -> Self {
        Self {
            ticker: ticker.into(),
            decimal_places,
            minters: None,
        }
    }

    /// gas fee currency
    pub fn mead() -> Self {
        Self::new("Mead", 18)
    }

    /// `decimalPlaces` is a single raw byte, not an integer
    pub fn to_value(&self) -> Value {
        let minters = match &self.minters {
            None => Value::Null,
            Some(list) => Value::List(list.iter().map(|a| Value::binary(a.0.to_vec())).collect()),
        };
        Value::text_dict([
            ("decimalPlaces", Value::binary(vec![self.decimal_places])),
            ("minters", minters),
            ("ticker", Value::text(self.ticker.clone())),
        ])
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let bad = |what: &str| PayoutError::Decoding(format!("currency: {}", what));
        let dp = value
            .get("decimalPlaces")
            .and_then(Value::as_binary)
            .ok_or_else(|| bad("missing decimalPlaces"))?;
        if dp.len() != 1 {
            return Err(bad("decimalPlaces must be one byte"));
        }
        let ticker = value
            .get("ticker")
            .and_then(Value::as_text)
            .ok_or_else(|| bad("missing ticker"))?;
        let minters = match value.get("minters") {
            None | Some(Value::Null) => None,
            Some(Value::List(items)) => Some(
                items
                    .iter()
                    .map(|v| {
                        let bytes = v.as_binary().ok_or_else(|| bad("minter not binary"))?;
                        let arr: [u8; 20] =
                            bytes.try_into().map_err(|_| bad("minter not 20 bytes"))?;
                        Ok(Address(arr))
                    })
                    .collect::<Result<Vec<_>>>()?,
            ),
            Some(_) => return Err(bad("minters must be null or list")),
        };
        Ok(Self {
            ticker: ticker.to_string(),
            decimal_places: dp[0],
            minters,
        })
    }
}

/// an amount of a currency in minor units
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FungibleAssetValue {
    pub currency: Currency,
    pub raw: i128,
}

impl FungibleAssetValue {
    /// scale a whole-unit quantity by `10^decimal_places`
    pub fn from_quantity(currency: Currency, quantity: i128) -> Result<Self> {
        let scale = 10i128
            .checked_pow(currency.decimal_places as u32)
            .ok_or_else(|| {
                PayoutError::Encoding(format!(
                    "{} decimal places overflow",
                    currency.decimal_places
                ))
            })?;
        let raw = quantity.checked_mul(scale).ok_or_else(|| {
            PayoutError::Encoding(format!(
                "{} {} overflows when scaled",
                quantity, currency.ticker
            ))
        })?;
        Ok(Self { currency, raw })
    }

    /// whole units, fractional part truncated
    pub fn quantity(&self) -> i128 {
        10i128
            .checked_pow(self.currency.decimal_places as u32)
            .map_or(0, |scale| self.raw / scale)
    }

    pub fn to_value(&self) -> Value {
        Value::List(vec![self.currency.to_value(), Value::Integer(self.raw)])
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        match value.as_list() {
            Some([currency, Value::Integer(raw)]) => Ok(Self {
                currency: Currency::from_value(currency)?,
                raw: *raw,
            }),
            _ => Err(PayoutError::Decoding(
                "fungible asset value must be [currency, integer]".into(),
            )),
        }
    }
}
