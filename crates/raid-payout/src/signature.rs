//! low-S canonicalization of secp256k1 signatures
//!
//! the chain verifier only accepts `s <= n/2`. a raw `(r, s)` from the key
//! service is rewritten to `(r, min(s, n - s))` and DER encoded.

use crate::error::{PayoutError, Result};
use k256::ecdsa::Signature;

/// secp256k1 group order
pub const CURVE_ORDER: [u8; 32] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfe,
    0xba, 0xae, 0xdc, 0xe6, 0xaf, 0x48, 0xa0, 0x3b,
    0xbf, 0xd2, 0x5e, 0x8c, 0xd0, 0x36, 0x41, 0x41,
];

/// `floor(n / 2)`
pub const HALF_ORDER: [u8; 32] = [
    0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0x5d, 0x57, 0x6e, 0x73, 0x57, 0xa4, 0x50, 0x1d,
    0xdf, 0xe9, 0x2f, 0x46, 0x68, 0x1b, 0x20, 0xa0,
];

/// big-endian scalars as returned by the key service
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawSignature {
    pub r: [u8; 32],
    pub s: [u8; 32],
}

impl RawSignature {
    /// parse a DER `SEQUENCE { r INTEGER, s INTEGER }`
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let sig = Signature::from_der(der)
            .map_err(|e| PayoutError::Signature(format!("invalid der signature: {}", e)))?;
        let (r, s) = sig.split_bytes();
        let mut out = RawSignature {
            r: [0u8; 32],
            s: [0u8; 32],
        };
        out.r.copy_from_slice(&r);
        out.s.copy_from_slice(&s);
        Ok(out)
    }

    pub fn is_low_s(&self) -> bool {
        is_low_s(&self.s)
    }

    /// same signature with `s` in low form
    pub fn normalized(&self) -> Self {
        RawSignature {
            r: self.r,
            s: normalize_s(&self.s),
        }
    }

    /// DER encoding of the canonical form
    pub fn to_canonical_der(&self) -> Result<Vec<u8>> {
        let normalized = self.normalized();
        let sig = Signature::from_scalars(normalized.r, normalized.s)
            .map_err(|e| PayoutError::Signature(format!("scalar out of range: {}", e)))?;
        Ok(sig.to_der().as_bytes().to_vec())
    }
}

pub fn is_low_s(s: &[u8; 32]) -> bool {
    s <= &HALF_ORDER
}

/// `min(s, n - s)`
pub fn normalize_s(s: &[u8; 32]) -> [u8; 32] {
    if is_low_s(s) {
        *s
    } else {
        complement(s)
    }
}

/// `n - s` for `s < n`
pub fn complement(s: &[u8; 32]) -> [u8; 32] {
    sub_be(&CURVE_ORDER, s)
}

/// `a - b` for big-endian 256-bit values with `a >= b`
fn sub_be(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let mut borrow = 0i16;
    for i in (0..32).rev() {
        let mut diff = a[i] as i16 - b[i] as i16 - borrow;
        borrow = if diff < 0 {
            diff += 256;
            1
        } else {
            0
        };
        out[i] = diff as u8;
    }
    out
}
