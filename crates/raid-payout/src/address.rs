//! 20-byte account addresses

use crate::error::{PayoutError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;

/// serializes as a checksum string for human-readable formats and as raw
/// bytes otherwise
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// derive from an uncompressed secp256k1 public key (0x04 || x || y)
    pub fn from_public_key(uncompressed: &[u8]) -> Result<Self> {
        if uncompressed.len() != 65 || uncompressed[0] != 0x04 {
            return Err(PayoutError::MalformedPublicKey(format!(
                "expected 65-byte uncompressed key, got {} bytes",
                uncompressed.len()
            )));
        }
        let hash = Keccak256::digest(&uncompressed[1..]);
        let mut out = [0u8; 20];
        out.copy_from_slice(&hash[12..]);
        Ok(Address(out))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// EIP-55 mixed-case checksum form with 0x prefix
    pub fn to_checksum(&self) -> String {
        let lower = hex::encode(self.0);
        let hash = Keccak256::digest(lower.as_bytes());
        let mut out = String::with_capacity(42);
        out.push_str("0x");
        for (i, c) in lower.chars().enumerate() {
            let nibble = (hash[i / 2] >> (if i % 2 == 0 { 4 } else { 0 })) & 0x0f;
            if c.is_ascii_alphabetic() && nibble >= 8 {
                out.push(c.to_ascii_uppercase());
            } else {
                out.push(c);
            }
        }
        out
    }
}

impl FromStr for Address {
    type Err = PayoutError;

    /// accepts any case, with or without the 0x prefix
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let hex_part = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        let bytes = hex::decode(hex_part)
            .map_err(|e| PayoutError::InvalidAddress(format!("{}: {}", s, e)))?;
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| PayoutError::InvalidAddress(format!("{}: expected 20 bytes", s)))?;
        Ok(Address(arr))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_checksum())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        } else {
            <[u8; 20]>::deserialize(deserializer).map(Address)
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_checksum())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_checksum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eip55_vectors() {
        // vectors from EIP-55
        for expected in [
            "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed",
            "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359",
            "0xdbF03B407c01E7cD3CBea99509d93f8DDDC8C6FB",
            "0xD1220A0cf47c7B9Be7A2E6BA89F429762e7b9aDb",
        ] {
            let addr: Address = expected.to_lowercase().parse().unwrap();
            assert_eq!(addr.to_checksum(), expected);
        }
    }

    #[test]
    fn test_parse_without_prefix() {
        let a: Address = "5Ea5755eD86631a4D086CC4Fae41740C8985F1B4".parse().unwrap();
        let b: Address = "0x5ea5755ed86631a4d086cc4fae41740c8985f1b4".parse().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_parse_rejects_bad_length() {
        assert!("0x1234".parse::<Address>().is_err());
        assert!("zz".parse::<Address>().is_err());
    }

    #[test]
    fn test_serde_forms() {
        let addr: Address = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed".parse().unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed\"");
        assert_eq!(serde_json::from_str::<Address>(&json).unwrap(), addr);

        let bin = bincode::serialize(&addr).unwrap();
        assert_eq!(bin.len(), 20);
        assert_eq!(bincode::deserialize::<Address>(&bin).unwrap(), addr);
    }

    #[test]
    fn test_from_public_key_rejects_compressed() {
        let compressed = [0x02u8; 33];
        assert!(matches!(
            Address::from_public_key(&compressed),
            Err(PayoutError::MalformedPublicKey(_))
        ));
    }
}
