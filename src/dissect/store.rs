//! Cross-reference stores
//!
//! Three maps keyed by referenced address: jumps record each origin with its
//! mnemonic, calls and strings record the set of origins. Entries are only
//! ever added; [`CrossReferenceStores::reset`] is the one way to drop them.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::ipc::blob::{BlobError, BlobKind, BlobStore};

/// Origins referencing one address
pub type OriginSet = BTreeSet<u64>;

/// Origin -> lowercase jump mnemonic
pub type JumpOrigins = BTreeMap<u64, String>;

/// Number of distinct referenced addresses per store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceCounts {
    pub strings: usize,
    pub jumps: usize,
    pub calls: usize,
}

/// The three reference indexes of one process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossReferenceStores {
    pub strings: BTreeMap<u64, OriginSet>,
    pub jumps: BTreeMap<u64, JumpOrigins>,
    pub calls: BTreeMap<u64, OriginSet>,
}

impl CrossReferenceStores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_string(&mut self, target: u64, origin: u64) {
        self.strings.entry(target).or_default().insert(origin);
    }

    /// Last write wins per origin
    pub fn insert_jump(&mut self, target: u64, origin: u64, mnemonic: &str) {
        self.jumps
            .entry(target)
            .or_default()
            .insert(origin, mnemonic.to_string());
    }

    pub fn insert_call(&mut self, target: u64, origin: u64) {
        self.calls.entry(target).or_default().insert(origin);
    }

    pub fn counts(&self) -> ReferenceCounts {
        ReferenceCounts {
            strings: self.strings.len(),
            jumps: self.jumps.len(),
            calls: self.calls.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty() && self.jumps.is_empty() && self.calls.is_empty()
    }

    pub fn reset(&mut self) {
        self.strings.clear();
        self.jumps.clear();
        self.calls.clear();
    }

    /// Load the stores of `pid`; missing blobs load as empty
    pub fn load(blobs: &BlobStore, pid: u32) -> Result<Self, BlobError> {
        Ok(Self {
            strings: blobs
                .read(pid, BlobKind::ReferencedStrings)?
                .unwrap_or_default(),
            jumps: blobs
                .read(pid, BlobKind::ReferencedJumps)?
                .unwrap_or_default(),
            calls: blobs
                .read(pid, BlobKind::ReferencedCalls)?
                .unwrap_or_default(),
        })
    }

    /// Write all three stores, one blob each
    pub fn persist(&self, blobs: &BlobStore, pid: u32) -> Result<(), BlobError> {
        blobs.write(pid, BlobKind::ReferencedStrings, &self.strings)?;
        blobs.write(pid, BlobKind::ReferencedJumps, &self.jumps)?;
        blobs.write(pid, BlobKind::ReferencedCalls, &self.calls)
    }

    /// Remove the blobs of `pid`
    pub fn discard(blobs: &BlobStore, pid: u32) -> Result<(), BlobError> {
        blobs.remove(pid, BlobKind::ReferencedStrings)?;
        blobs.remove(pid, BlobKind::ReferencedJumps)?;
        blobs.remove(pid, BlobKind::ReferencedCalls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_is_idempotent_per_origin() {
        let mut stores = CrossReferenceStores::new();
        stores.insert_call(0x2000, 0x1000);
        stores.insert_call(0x2000, 0x1000);
        stores.insert_jump(0x3000, 0x1010, "jne");
        stores.insert_jump(0x3000, 0x1010, "je");
        assert_eq!(stores.calls[&0x2000].len(), 1);
        assert_eq!(stores.jumps[&0x3000][&0x1010], "je");
        assert_eq!(
            stores.counts(),
            ReferenceCounts {
                strings: 0,
                jumps: 1,
                calls: 1
            }
        );
    }

    #[test]
    fn test_persist_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::new(dir.path());
        assert!(CrossReferenceStores::load(&blobs, 5).unwrap().is_empty());

        let mut stores = CrossReferenceStores::new();
        stores.insert_string(0x4000, 0x1000);
        stores.insert_jump(0x1008, 0x1002, "jmp");
        stores.persist(&blobs, 5).unwrap();
        assert_eq!(CrossReferenceStores::load(&blobs, 5).unwrap(), stores);

        CrossReferenceStores::discard(&blobs, 5).unwrap();
        assert!(CrossReferenceStores::load(&blobs, 5).unwrap().is_empty());
    }
}
