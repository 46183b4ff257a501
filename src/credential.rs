//! Credential data model: the final `realm / username / secret` unit emitted
//! by the pipeline, plus the annotation attached to credentials recovered by a
//! cracking engine (time since the hash was first captured and the overall
//! crack ratio at the moment of recovery).
//!
//! Use [`CredentialRecord::from_account`] to build a record from a
//! `REALM\user` style account name, the same shape secretsdump and Responder
//! emit.
use std::fmt;

use chrono::TimeDelta;

/// A recovered credential.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialRecord {
    pub realm: String,
    pub username: String,
    pub secret: String,
}

impl CredentialRecord {
    pub fn new(realm: &str, username: &str, secret: &str) -> Self {
        Self {
            realm: realm.trim().to_string(),
            username: username.trim().to_string(),
            secret: secret.to_string(),
        }
    }

    /// Split a `REALM\user` (or bare `user`) account name into realm and
    /// username and attach `secret`.
    pub fn from_account(account: &str, secret: &str) -> Self {
        let (realm, username) = split_account(account);
        Self::new(realm, username, secret)
    }

    /// `REALM\user`, or just `user` when no realm is known.
    pub fn account(&self) -> String {
        if self.realm.is_empty() {
            self.username.clone()
        } else {
            format!("{}\\{}", self.realm, self.username)
        }
    }
}

impl fmt::Display for CredentialRecord {
    /// Sink line format: `realm username secret`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let realm = if self.realm.is_empty() {
            "."
        } else {
            self.realm.as_str()
        };
        write!(f, "{} {} {}", realm, self.username, self.secret)
    }
}

/// Split `DOMAIN\user` into `("DOMAIN", "user")`; a bare name has an empty
/// realm.
pub fn split_account(account: &str) -> (&str, &str) {
    match account.split_once('\\') {
        Some((realm, user)) => (realm.trim(), user.trim()),
        None => ("", account.trim()),
    }
}

/// Machine and managed service accounts end in `$`.
pub fn is_machine_account(username: &str) -> bool {
    username.trim_end().ends_with('$')
}

/// Crack ratio over username instances, see [`crate::store::HashStore::snapshot_stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrackStats {
    pub cracked: usize,
    pub total: usize,
}

impl CrackStats {
    pub fn percentage(&self) -> String {
        if self.total == 0 {
            return "0.00%".to_string();
        }
        format!("{:.2}%", (self.cracked as f64) / (self.total as f64) * 100.0)
    }
}

/// A credential plus the context it was recovered in. Plaintext dumps carry no
/// annotation; cracked digests carry both fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovered {
    pub credential: CredentialRecord,
    pub elapsed: Option<TimeDelta>,
    pub stats: Option<CrackStats>,
}

impl Recovered {
    pub fn plain(credential: CredentialRecord) -> Self {
        Self {
            credential,
            elapsed: None,
            stats: None,
        }
    }
}
