//! Process-wide hash aggregation.
//!
//! One [`HashRecord`] per distinct digest, holding every username observed
//! with that digest and the cracked secret once an engine recovers it. The
//! store is built once in `main` and handed to every stage as an
//! `Arc<HashStore>`; all operations go through a single lock so the
//! monotonic invariants hold under concurrent stage callbacks:
//!
//! - a record's user set only grows;
//! - `cracked` is set at most once and never overwritten.
use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Local};
use parking_lot::Mutex;

use crate::credential::CrackStats;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashRecord {
    pub digest: String,
    pub first_seen: DateTime<Local>,
    pub users: BTreeSet<String>,
    pub cracked: Option<String>,
}

impl HashRecord {
    fn new(digest: &str, first_seen: DateTime<Local>) -> Self {
        Self {
            digest: digest.to_string(),
            first_seen,
            users: BTreeSet::new(),
            cracked: None,
        }
    }

    pub fn is_cracked(&self) -> bool {
        self.cracked.is_some()
    }
}

/// Result of [`HashStore::upsert_user`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upsert {
    /// First observation of this digest; a record was created.
    NewDigest,
    /// Known digest, username added to its user set.
    NewUser,
    /// Username added to a digest whose secret is already recovered; the
    /// caller owes the operator a credential for it.
    NewUserCracked {
        secret: String,
        first_seen: DateTime<Local>,
    },
    /// Digest and username were both already recorded.
    Known,
}

#[derive(Debug, Default)]
pub struct HashStore {
    records: Mutex<HashMap<String, HashRecord>>,
}

impl HashStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `username` was observed with `digest`. Creates the record
    /// (first seen = `observed_at`) on first sight of the digest.
    pub fn upsert_user(&self, digest: &str, username: &str, observed_at: DateTime<Local>) -> Upsert {
        let mut records = self.records.lock();
        let mut created = false;
        let record = records.entry(digest.to_string()).or_insert_with(|| {
            created = true;
            HashRecord::new(digest, observed_at)
        });
        let inserted = record.users.insert(username.to_string());
        if created {
            return Upsert::NewDigest;
        }
        match (&record.cracked, inserted) {
            (_, false) => Upsert::Known,
            (Some(secret), true) => Upsert::NewUserCracked {
                secret: secret.clone(),
                first_seen: record.first_seen,
            },
            (None, true) => Upsert::NewUser,
        }
    }

    /// Set the cracked secret for `digest` if none is recorded yet. Returns
    /// whether the store changed; unknown digests and already-cracked
    /// records return false.
    pub fn mark_cracked(&self, digest: &str, secret: &str) -> bool {
        let mut records = self.records.lock();
        match records.get_mut(digest) {
            Some(record) if record.cracked.is_none() => {
                record.cracked = Some(secret.to_string());
                true
            }
            _ => false,
        }
    }

    /// `(cracked, total)` counted over username instances: a record with
    /// three users contributes three to the total, and three to cracked once
    /// its secret is known.
    pub fn snapshot_stats(&self) -> CrackStats {
        let records = self.records.lock();
        let mut stats = CrackStats::default();
        for record in records.values() {
            stats.total += record.users.len();
            if record.is_cracked() {
                stats.cracked += record.users.len();
            }
        }
        stats
    }

    pub fn get(&self, digest: &str) -> Option<HashRecord> {
        self.records.lock().get(digest).cloned()
    }

    pub fn is_cracked(&self, digest: &str) -> bool {
        self.records
            .lock()
            .get(digest)
            .is_some_and(HashRecord::is_cracked)
    }

    /// Copy of every record, sorted by digest.
    pub fn records(&self) -> Vec<HashRecord> {
        let mut all: Vec<HashRecord> = self.records.lock().values().cloned().collect();
        all.sort_by(|a, b| a.digest.cmp(&b.digest));
        all
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
