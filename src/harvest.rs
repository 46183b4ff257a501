//! Cracked-output parsing.
//!
//! Engines write their results into a stage output directory; the file name
//! suffix chosen at launch tells us which line shape to expect:
//!
//! - `.nt`: hashcat `digest:secret`, resolved through the [`HashStore`] so
//!   every username sharing the digest gets the secret;
//! - `.netntlm`: hashcat NetNTLMv1/v2 output, the captured challenge line
//!   followed by `:secret`, already carrying user and realm;
//! - `.mscash`: john pot lines `$DCC2$10240#user#hash:secret`.
//!
//! Malformed lines are dropped one at a time.
use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Local};
use log::debug;
use parking_lot::Mutex;

use crate::credential::{CredentialRecord, Recovered};
use crate::store::HashStore;

pub const SUFFIX_DIGEST: &str = ".nt";
pub const SUFFIX_NETNTLM: &str = ".netntlm";
pub const SUFFIX_MSCASH: &str = ".mscash";

/// `user::realm:challenge:proof:blob` (v2) or `user::realm:lm:nt:challenge`
/// (v1); the secret follows the sixth field.
pub const NETNTLM_HASH_FIELDS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputShape {
    Digest,
    NetNtlm,
    Mscash,
}

impl OutputShape {
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        if name.ends_with(SUFFIX_DIGEST) {
            Some(OutputShape::Digest)
        } else if name.ends_with(SUFFIX_NETNTLM) {
            Some(OutputShape::NetNtlm)
        } else if name.ends_with(SUFFIX_MSCASH) {
            Some(OutputShape::Mscash)
        } else {
            None
        }
    }
}

/// `digest:secret`; only the first `:` splits, the secret may be empty.
pub fn parse_digest_line(line: &str) -> Option<(String, String)> {
    let (digest, secret) = line.split_once(':')?;
    let digest = digest.trim();
    if digest.is_empty() {
        return None;
    }
    Some((digest.to_lowercase(), secret.to_string()))
}

/// Cracked NetNTLM line → credential; fewer than seven fields yields `None`.
pub fn parse_netntlm_line(line: &str) -> Option<CredentialRecord> {
    let fields: Vec<&str> = line.splitn(NETNTLM_HASH_FIELDS + 1, ':').collect();
    if fields.len() <= NETNTLM_HASH_FIELDS {
        return None;
    }
    let username = fields[0].trim();
    if username.is_empty() {
        return None;
    }
    Some(CredentialRecord::new(
        fields[2],
        username,
        fields[NETNTLM_HASH_FIELDS],
    ))
}

/// john mscash2 pot line → credential with an empty realm.
pub fn parse_mscash_line(line: &str) -> Option<CredentialRecord> {
    let (value, secret) = line.split_once(':')?;
    let mut parts = value.split('#');
    let _tag = parts.next()?;
    let username = parts.next()?.trim();
    let _hash = parts.next()?;
    if username.is_empty() {
        return None;
    }
    Some(CredentialRecord::new("", username, secret))
}

/// Per-stage harvester. Digest results are deduplicated by the store;
/// plaintext shapes by an already-emitted set, since engines append to their
/// result files and every rewrite is parsed in full again.
#[derive(Debug, Default)]
pub struct Harvester {
    emitted: Mutex<HashSet<CredentialRecord>>,
}

impl Harvester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn harvest(
        &self,
        shape: OutputShape,
        text: &str,
        store: &HashStore,
        now: DateTime<Local>,
    ) -> Vec<Recovered> {
        let mut out = Vec::new();
        for line in crate::io::lines(text) {
            if line.trim().is_empty() {
                continue;
            }
            match shape {
                OutputShape::Digest => out.extend(cracked_digest(line, store, now)),
                OutputShape::NetNtlm => {
                    if let Some(cred) = parse_netntlm_line(line) {
                        self.emit_plain(cred, &mut out);
                    } else {
                        debug!("malformed netntlm result skipped");
                    }
                }
                OutputShape::Mscash => {
                    if let Some(cred) = parse_mscash_line(line) {
                        self.emit_plain(cred, &mut out);
                    } else {
                        debug!("malformed mscash result skipped");
                    }
                }
            }
        }
        out
    }

    fn emit_plain(&self, cred: CredentialRecord, out: &mut Vec<Recovered>) {
        if self.emitted.lock().insert(cred.clone()) {
            out.push(Recovered::plain(cred));
        }
    }
}

/// Resolve one `digest:secret` line against the store: one credential per
/// username if this call is the one that marked the digest cracked.
pub fn cracked_digest(line: &str, store: &HashStore, now: DateTime<Local>) -> Vec<Recovered> {
    let Some((digest, secret)) = parse_digest_line(line) else {
        debug!("malformed digest result skipped");
        return Vec::new();
    };
    if store.is_cracked(&digest) || !store.mark_cracked(&digest, &secret) {
        return Vec::new();
    }
    let Some(record) = store.get(&digest) else {
        return Vec::new();
    };
    let stats = store.snapshot_stats();
    let elapsed = now.signed_duration_since(record.first_seen);
    record
        .users
        .iter()
        .map(|user| Recovered {
            credential: CredentialRecord::from_account(user, &secret),
            elapsed: Some(elapsed),
            stats: Some(stats),
        })
        .collect()
}

/// Credential for a username that joined a digest after it was cracked,
/// annotated the same way as [`cracked_digest`] output.
pub fn inherited_crack(
    account: &str,
    secret: &str,
    first_seen: DateTime<Local>,
    store: &HashStore,
    now: DateTime<Local>,
) -> Recovered {
    Recovered {
        credential: CredentialRecord::from_account(account, secret),
        elapsed: Some(now.signed_duration_since(first_seen)),
        stats: Some(store.snapshot_stats()),
    }
}
