//! unsigned transaction layout, signature attachment and transaction ids
//!
//! the top-level dictionary uses single-byte binary keys:
//! `a` actions, `g` genesis hash, `l` gas limit, `m` max gas price, `n` nonce,
//! `p` public key, `s` signer, `t` timestamp, `u` updated addresses.
//! the signed form adds `S` (DER signature), which sorts before the
//! lowercase keys.

use crate::action::Action;
use crate::address::Address;
use crate::bencodex::{self, Dict, Key, Value};
use crate::currency::{Currency, FungibleAssetValue};
use crate::error::{PayoutError, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

pub const GAS_LIMIT: i128 = 4;

/// max gas price: one whole Mead
pub const MAX_GAS_PRICE_RAW: i128 = 1_000_000_000_000_000_000;

const SIGNATURE_KEY: &[u8] = b"S";

const ODIN_GENESIS: [u8; 32] = [
    0x45, 0x82, 0x25, 0x0d, 0x0d, 0xa3, 0x3b, 0x06,
    0x77, 0x9a, 0x84, 0x75, 0xd2, 0x83, 0xd5, 0xdd,
    0x21, 0x0c, 0x68, 0x3b, 0x9b, 0x99, 0x9d, 0x74,
    0xd0, 0x3f, 0xac, 0x4f, 0x58, 0xfa, 0x6b, 0xce,
];

const HEIMDALL_GENESIS: [u8; 32] = [
    0x72, 0x9f, 0xa2, 0x69, 0x58, 0x64, 0x8a, 0x35,
    0xb5, 0x3e, 0x8e, 0x39, 0x05, 0xd1, 0x1e, 0xc5,
    0x3b, 0x1b, 0x49, 0x29, 0xbf, 0x5f, 0x49, 0x98,
    0x84, 0xae, 0xd7, 0xdf, 0x61, 0x6f, 0x59, 0x13,
];

/// planets with a known genesis block
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PlanetId {
    Odin,
    Heimdall,
}

impl PlanetId {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanetId::Odin => "0x000000000000",
            PlanetId::Heimdall => "0x000000000001",
        }
    }

    pub fn genesis_hash(&self) -> [u8; 32] {
        match self {
            PlanetId::Odin => ODIN_GENESIS,
            PlanetId::Heimdall => HEIMDALL_GENESIS,
        }
    }
}

impl FromStr for PlanetId {
    type Err = PayoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "0x000000000000" => Ok(PlanetId::Odin),
            "0x000000000001" => Ok(PlanetId::Heimdall),
            other => Err(PayoutError::UnknownPlanet(other.to_string())),
        }
    }
}

impl fmt::Display for PlanetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `YYYY-MM-DDTHH:MM:SS.ffffffZ`
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// header plus one action, before signing
#[derive(Clone, Debug)]
pub struct UnsignedTx {
    pub planet: PlanetId,
    /// uncompressed sec1 public key
    pub public_key: Vec<u8>,
    pub signer: Address,
    pub nonce: u64,
    pub action: Action,
    pub timestamp: DateTime<Utc>,
}

impl UnsignedTx {
    pub fn to_value(&self) -> Value {
        let mut dict = Dict::new();
        let mut put = |k: &[u8], v: Value| {
            dict.insert(Key::bin(k.to_vec()), v);
        };
        put(b"a", Value::List(vec![self.action.plain_value()]));
        put(b"g", Value::binary(self.planet.genesis_hash().to_vec()));
        put(b"l", Value::Integer(GAS_LIMIT));
        put(
            b"m",
            FungibleAssetValue {
                currency: Currency::mead(),
                raw: MAX_GAS_PRICE_RAW,
            }
            .to_value(),
        );
        put(b"n", Value::Integer(self.nonce as i128));
        put(b"p", Value::binary(self.public_key.clone()));
        put(b"s", Value::binary(self.signer.0.to_vec()));
        put(b"t", Value::text(format_timestamp(&self.timestamp)));
        put(b"u", Value::List(Vec::new()));
        Value::Dict(dict)
    }

    pub fn encode(&self) -> Vec<u8> {
        bencodex::encode(&self.to_value())
    }
}

/// digest handed to the signer
pub fn message_hash(unsigned: &[u8]) -> [u8; 32] {
    Sha256::digest(unsigned).into()
}

/// decode, insert the signature under `S`, re-encode
pub fn append_signature(unsigned: &[u8], signature_der: &[u8]) -> Result<Vec<u8>> {
    let mut value = bencodex::decode(unsigned)?;
    match &mut value {
        Value::Dict(dict) => {
            dict.insert(Key::bin(SIGNATURE_KEY.to_vec()), Value::binary(signature_der.to_vec()));
        }
        _ => return Err(PayoutError::Decoding("transaction is not a dictionary".into())),
    }
    Ok(bencodex::encode(&value))
}

/// content-addressed id of a signed transaction
pub fn tx_id(signed: &[u8]) -> String {
    hex::encode(Sha256::digest(signed))
}

/// fields read back from encoded transaction bytes
#[derive(Clone, Debug)]
pub struct DecodedTx {
    pub genesis_hash: Vec<u8>,
    pub nonce: u64,
    pub public_key: Vec<u8>,
    pub signer: Address,
    pub timestamp: String,
    pub actions: Vec<Action>,
    pub signature: Option<Vec<u8>>,
}

impl DecodedTx {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value = bencodex::decode(bytes)?;
        let field = |k: &[u8]| {
            value.get_bin(k).ok_or_else(|| {
                PayoutError::Decoding(format!("transaction missing '{}'", k[0] as char))
            })
        };
        let binary = |k: &[u8]| -> Result<Vec<u8>> {
            field(k)?
                .as_binary()
                .map(<[u8]>::to_vec)
                .ok_or_else(|| PayoutError::Decoding(format!("'{}' must be binary", k[0] as char)))
        };

        let nonce = field(b"n")?
            .as_integer()
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| PayoutError::Decoding("nonce must be a non-negative integer".into()))?;
        let signer: [u8; 20] = binary(b"s")?
            .try_into()
            .map_err(|_| PayoutError::Decoding("signer must be 20 bytes".into()))?;
        let timestamp = field(b"t")?
            .as_text()
            .ok_or_else(|| PayoutError::Decoding("timestamp must be text".into()))?
            .to_string();
        let actions = field(b"a")?
            .as_list()
            .ok_or_else(|| PayoutError::Decoding("actions must be a list".into()))?
            .iter()
            .map(Action::from_plain_value)
            .collect::<Result<Vec<_>>>()?;
        let signature = value
            .get_bin(SIGNATURE_KEY)
            .and_then(Value::as_binary)
            .map(<[u8]>::to_vec);

        Ok(Self {
            genesis_hash: binary(b"g")?,
            nonce,
            public_key: binary(b"p")?,
            signer: Address(signer),
            timestamp,
            actions,
            signature,
        })
    }
}
