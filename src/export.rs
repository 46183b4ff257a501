//! Export helpers.
//!
//! - [`CredentialSink`] appends every recovered credential as
//!   `realm username secret` to one text file, shared by all stages.
//! - [`save_hash_store_csv`] writes one row per (digest, username) with the
//!   crack state, for the engagement report.
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use csv::Writer;
use parking_lot::Mutex;

use crate::credential::CredentialRecord;
use crate::store::HashStore;

pub const CREDENTIALS_FILE: &str = "credentials.txt";

#[derive(Debug)]
pub struct CredentialSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CredentialSink {
    /// Sink writing to `dir/credentials.txt`; the directory is created on
    /// first write.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(CREDENTIALS_FILE),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, creds: &[CredentialRecord]) -> Result<()> {
        if creds.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        for c in creds {
            writeln!(f, "{}", c)?;
        }
        Ok(())
    }
}

pub fn save_hash_store_csv<P: AsRef<Path>>(store: &HashStore, path: P) -> Result<()> {
    let mut wtr = Writer::from_writer(File::create(path.as_ref())?);
    wtr.write_record(["Digest", "Username", "Cracked", "FirstSeen"])?;
    for record in store.records() {
        let cracked = record.cracked.as_deref().unwrap_or("");
        let first_seen = record.first_seen.to_rfc3339();
        for user in &record.users {
            wtr.write_record([
                record.digest.as_str(),
                user.as_str(),
                cracked,
                first_seen.as_str(),
            ])?;
        }
    }
    wtr.flush()?;
    Ok(())
}
