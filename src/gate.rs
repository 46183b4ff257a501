//! Per-stage content deduplication.
//!
//! Capture tools rewrite their files in place (truncate then append, or
//! replace then rewrite), so one logical write surfaces as several
//! create/modify notifications. The gate keys on a SHA-256 of the full file
//! content: the same bytes are processed once per stage no matter which path
//! or which notification kind delivered them. The seen-set is never evicted.
use std::collections::HashSet;
use std::path::Path;

use log::debug;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

pub type Fingerprint = [u8; 32];

pub fn fingerprint(content: &[u8]) -> Fingerprint {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(content));
    out
}

#[derive(Debug, Default)]
pub struct FingerprintGate {
    seen: Mutex<HashSet<Fingerprint>>,
}

impl FingerprintGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `content` has not passed this gate before; the fingerprint is
    /// recorded before returning.
    pub fn accept(&self, path: &Path, content: &[u8]) -> bool {
        let fp = fingerprint(content);
        let fresh = self.seen.lock().insert(fp);
        if !fresh {
            debug!(
                "duplicate content {} at {}",
                &hex::encode(fp)[..12],
                path.display()
            );
        }
        fresh
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
