//! per-signer nonce allocation
//!
//! the `(signer, nonce)` unique index in [`crate::store`] is the real
//! exclusion mechanism. [`NonceGuard`] only avoids signing work for nonces
//! that are already taken.

use crate::address::Address;
use crate::error::{PayoutError, Result};
use crate::store::Store;
use std::collections::BTreeSet;

/// `max + 1`, or `1` for a signer with no transactions
pub fn next_nonce_from<I: IntoIterator<Item = u64>>(nonces: I) -> Result<u64> {
    match nonces.into_iter().max() {
        None => Ok(1),
        Some(max) => max.checked_add(1).ok_or(PayoutError::NonceExhausted(max)),
    }
}

/// snapshot of allocated nonces taken before a signing round
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NonceGuard {
    max_nonce: u64,
    existing: BTreeSet<u64>,
}

impl NonceGuard {
    pub fn new(max_nonce: u64, existing: impl IntoIterator<Item = u64>) -> Self {
        Self {
            max_nonce,
            existing: existing.into_iter().collect(),
        }
    }

    pub fn from_store(store: &Store, signer: &Address) -> Result<Self> {
        let existing = store.list_nonces(signer)?;
        let max_nonce = existing.iter().max().copied().unwrap_or(0);
        Ok(Self::new(max_nonce, existing))
    }

    pub fn max_nonce(&self) -> u64 {
        self.max_nonce
    }

    /// beyond the last allocated nonce and not already persisted
    pub fn should_sign(&self, nonce: u64) -> bool {
        nonce > self.max_nonce && !self.existing.contains(&nonce)
    }
}
