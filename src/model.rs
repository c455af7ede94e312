//! # Data Model
//!
//! [`StorageEntry`] is the atomic unit of state (§3); [`ChangeEvent`] is its
//! wire form, published per mutation and applied by peers under LWW.
//!
//! Canonical encoding note: `serde_cbor` serializes a `#[derive(Serialize)]`
//! struct as a CBOR map with keys emitted in field-declaration order, so
//! keeping `ChangeEvent`'s fields in the exact order below — with no
//! `HashMap`-typed field to reorder keys at random — is sufficient for
//! byte-stable, deterministic encoding (no custom canonicalization pass is
//! needed, unlike formats such as JSON where key order is ambiguous).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;

use crate::error::{MkvError, Result};

/// Hard limits from §3.
pub const MAX_KEY_BYTES: usize = 256;
pub const MAX_VALUE_BYTES: usize = 262_144;

/// The atomic unit of state. At most one `StorageEntry` is ever visible for
/// a given key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEntry {
    pub key: String,
    /// Absent iff this entry is a tombstone.
    pub value: Option<String>,
    pub is_tombstone: bool,
    pub timestamp_ms: u64,
    pub node_id: String,
    /// Per-node monotonic sequence; authoritative only for dedup, never LWW.
    pub seq: u64,
}

impl StorageEntry {
    pub fn new_set(key: String, value: String, timestamp_ms: u64, node_id: String, seq: u64) -> Self {
        Self { key, value: Some(value), is_tombstone: false, timestamp_ms, node_id, seq }
    }

    pub fn new_tombstone(key: String, timestamp_ms: u64, node_id: String, seq: u64) -> Self {
        Self { key, value: None, is_tombstone: true, timestamp_ms, node_id, seq }
    }

    /// Validate the payload-size invariants from §3. Does not validate skew;
    /// that depends on wall-clock context the entry itself doesn't carry.
    pub fn validate_sizes(&self) -> Result<()> {
        if self.key.is_empty() || self.key.len() > MAX_KEY_BYTES {
            return Err(MkvError::payload_too_large(format!(
                "key length {} exceeds {} bytes",
                self.key.len(),
                MAX_KEY_BYTES
            )));
        }
        if let Some(v) = &self.value {
            if v.len() > MAX_VALUE_BYTES {
                return Err(MkvError::payload_too_large(format!(
                    "value length {} exceeds {} bytes",
                    v.len(),
                    MAX_VALUE_BYTES
                )));
            }
        }
        Ok(())
    }

    /// LWW rank: `(timestamp_ms, node_id)`, compared lexicographically.
    pub fn lww_rank(&self) -> (u64, &str) {
        (self.timestamp_ms, self.node_id.as_str())
    }

    /// `true` if `other` strictly wins over `self` under LWW (§3: strictly
    /// greater `timestamp_ms` wins; on ties, lexicographically greater
    /// `node_id` wins; exact ties are not a win, so re-applying the same
    /// event is a no-op).
    pub fn is_strictly_won_by(&self, other: &StorageEntry) -> bool {
        other.lww_rank() > self.lww_rank()
    }

    /// Build the canonical [`ChangeEvent`] projection of this entry.
    pub fn to_change_event(&self) -> ChangeEvent {
        ChangeEvent {
            key: self.key.clone(),
            value: self.value.clone(),
            tombstone: self.is_tombstone,
            node_id: self.node_id.clone(),
            seq: self.seq,
            timestamp_ms: self.timestamp_ms,
        }
    }
}

/// Wire form of a mutation (§3). Field order is part of the canonical
/// encoding contract — do not reorder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "is_false", default)]
    pub tombstone: bool,
    pub node_id: String,
    pub seq: u64,
    pub timestamp_ms: u64,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl ChangeEvent {
    pub fn to_storage_entry(&self) -> StorageEntry {
        StorageEntry {
            key: self.key.clone(),
            value: self.value.clone(),
            is_tombstone: self.tombstone,
            timestamp_ms: self.timestamp_ms,
            node_id: self.node_id.clone(),
            seq: self.seq,
        }
    }

    /// Deterministic (canonical) CBOR encoding, suitable for Merkle leaf
    /// hashing and wire transport alike.
    pub fn to_canonical_cbor(&self) -> Result<Vec<u8>> {
        Ok(serde_cbor::to_vec(self)?)
    }

    pub fn from_canonical_cbor(bytes: &[u8]) -> Result<Self> {
        Ok(serde_cbor::from_slice(bytes)?)
    }

    /// SHA-256 digest of the canonical CBOR encoding; the unit hashed into
    /// Merkle leaves (§4.6).
    pub fn digest(&self) -> Result<[u8; 32]> {
        let bytes = self.to_canonical_cbor()?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hasher.finalize().into())
    }

    /// Dedup key used by the replication subscriber's recent-window set.
    pub fn dedup_key(&self) -> (String, u64) {
        (self.node_id.clone(), self.seq)
    }
}

/// Ordering helper mirroring [`StorageEntry::lww_rank`], usable when only
/// the wire `ChangeEvent` is at hand (e.g. during anti-entropy summary
/// comparison, before any entry is materialized).
pub fn lww_cmp(a_ts: u64, a_node: &str, b_ts: u64, b_node: &str) -> Ordering {
    (a_ts, a_node).cmp(&(b_ts, b_node))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lww_tie_break_by_node_id() {
        let a = StorageEntry::new_set("k".into(), "old".into(), 1000, "A".into(), 1);
        let c = StorageEntry::new_set("k".into(), "new".into(), 1000, "C".into(), 1);
        assert!(a.is_strictly_won_by(&c));
        let b = StorageEntry::new_set("k".into(), "older".into(), 1000, "B".into(), 1);
        assert!(!c.is_strictly_won_by(&b));
    }

    #[test]
    fn lww_exact_tie_is_not_a_win() {
        let a = StorageEntry::new_set("k".into(), "v".into(), 1000, "A".into(), 1);
        let a2 = StorageEntry::new_set("k".into(), "v".into(), 1000, "A".into(), 2);
        assert!(!a.is_strictly_won_by(&a2));
    }

    #[test]
    fn canonical_cbor_roundtrip_is_byte_stable() {
        let entry = StorageEntry::new_set("user:1".into(), "alice".into(), 123, "node-a".into(), 7);
        let ev = entry.to_change_event();
        let b1 = ev.to_canonical_cbor().unwrap();
        let b2 = ev.to_canonical_cbor().unwrap();
        assert_eq!(b1, b2);
        let decoded = ChangeEvent::from_canonical_cbor(&b1).unwrap();
        assert_eq!(decoded, ev);
    }

    #[test]
    fn tombstone_change_event_has_no_value() {
        let entry = StorageEntry::new_tombstone("k".into(), 5, "n".into(), 1);
        let ev = entry.to_change_event();
        assert!(ev.value.is_none());
        assert!(ev.tombstone);
        let bytes = ev.to_canonical_cbor().unwrap();
        // tombstone flag and missing value should both be present/omitted deterministically
        let decoded = ChangeEvent::from_canonical_cbor(&bytes).unwrap();
        assert_eq!(decoded, ev);
    }

    #[test]
    fn oversize_key_rejected() {
        let entry = StorageEntry::new_set("x".repeat(257), "v".into(), 1, "n".into(), 1);
        assert!(entry.validate_sizes().is_err());
        let entry_ok = StorageEntry::new_set("x".repeat(256), "v".into(), 1, "n".into(), 1);
        assert!(entry_ok.validate_sizes().is_ok());
    }

    #[test]
    fn oversize_value_rejected() {
        let entry = StorageEntry::new_set("k".into(), "x".repeat(262_145), 1, "n".into(), 1);
        assert!(entry.validate_sizes().is_err());
        let entry_ok = StorageEntry::new_set("k".into(), "x".repeat(262_144), 1, "n".into(), 1);
        assert!(entry_ok.validate_sizes().is_ok());
    }
}
