//! Sectioned dump parser.
//!
//! secretsdump-style output interleaves several typed sections (local SAM
//! hashes, NTDS hashes, cached domain logons, LSA secrets) with progress and
//! blank lines. A line such as `alice:1001:aad3...:8846...:::` can only be
//! classified with the section it appears in, so parsing is a single pass
//! over the file with an explicit [`Mode`].
//!
//! Per line, in order:
//! 1. blank lines are skipped and never change the mode;
//! 2. inside a hash section, a well-formed hash line is data even if the
//!    username happens to contain a marker such as `_SC_`;
//! 3. a line containing a section marker switches mode and is discarded;
//! 4. anything else is data for the current mode.
//!
//! NTLM digests go to the [`HashStore`]; digests the store had never seen
//! form the NTLM crack batch. Cached logons become `$DCC2$10240#user#hash`
//! values in a separate batch. Batches go to a [`CrackSink`]: the NTLM batch
//! when the cached-logon section starts, and whatever is left once the whole
//! file has been consumed.
use std::collections::HashSet;

use chrono::{DateTime, Local};
use log::{debug, info};
use parking_lot::Mutex;

use crate::credential::{CredentialRecord, Recovered, is_machine_account};
use crate::harvest::inherited_crack;
use crate::store::{HashStore, Upsert};

/// `user:rid:lmhash:nthash:::`
pub const NTLM_SEPARATORS: usize = 6;
/// `user:hash:realm:fqdn`
pub const CACHED_SEPARATORS: usize = 3;
pub const DCC2_TAG: &str = "$DCC2$";
pub const DCC2_ITERATIONS: &str = "10240#";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    None,
    NtlmHash,
    CachedHash,
    ServiceSecret,
    DefaultPassword,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Ntlm,
    Cached,
    Reset,
    Service,
    DefaultPassword,
}

const MARKERS: &[(&str, Marker)] = &[
    ("Dumping local SAM hashes", Marker::Ntlm),
    ("Dumping Domain Credentials", Marker::Ntlm),
    ("Dumping cached domain logon information", Marker::Cached),
    ("Dumping LSA Secrets", Marker::Reset),
    ("Kerberos keys", Marker::Reset),
    ("Cleaning up", Marker::Reset),
    ("_SC_", Marker::Service),
    ("DefaultPassword", Marker::DefaultPassword),
];

fn marker(line: &str) -> Option<Marker> {
    MARKERS
        .iter()
        .find(|(needle, _)| line.contains(needle))
        .map(|(_, m)| *m)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    Ntlm,
    Cached,
}

/// Newly discovered values for one engine, in discovery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrackBatch {
    pub kind: BatchKind,
    pub values: Vec<String>,
}

/// Receives crack batches as the parser produces them.
pub trait CrackSink {
    fn submit(&mut self, batch: CrackBatch);
}

impl CrackSink for Vec<CrackBatch> {
    fn submit(&mut self, batch: CrackBatch) {
        self.push(batch);
    }
}

/// Count `:` separators without splitting.
pub fn separator_count(line: &str) -> usize {
    memchr::memchr_iter(b':', line.as_bytes()).count()
}

/// Parse a pwdump/secretsdump hash line into `(username, nt digest)`.
/// Machine accounts and lines with the wrong field count yield `None`.
pub fn parse_ntlm_line(line: &str) -> Option<(&str, String)> {
    if separator_count(line) != NTLM_SEPARATORS {
        return None;
    }
    let mut fields = line.split(':');
    let username = fields.next()?.trim();
    let nt = fields.nth(2)?.trim();
    if username.is_empty() || nt.is_empty() || is_machine_account(username) {
        return None;
    }
    Some((username, nt.to_lowercase()))
}

/// Build the mscash2 value for a cached logon line.
pub fn parse_cached_line(line: &str) -> Option<String> {
    if separator_count(line) != CACHED_SEPARATORS {
        return None;
    }
    let mut fields = line.split(':');
    let username = fields.next()?.trim();
    let hash = fields.next()?.trim();
    if username.is_empty() || hash.is_empty() || is_machine_account(username) {
        return None;
    }
    Some(format!(
        "{}{}{}#{}",
        DCC2_TAG,
        DCC2_ITERATIONS,
        username,
        hash.to_lowercase()
    ))
}

#[derive(Debug, Default)]
struct Seen {
    service: HashSet<String>,
    default_password: HashSet<String>,
    cached: HashSet<String>,
}

/// Long-lived parser state for one stage: the already-seen sets that
/// suppress secrets and cached values across passes over rewritten files.
#[derive(Debug, Default)]
pub struct SectionParser {
    seen: Mutex<Seen>,
}

/// Summary of one pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParseReport {
    pub secrets: Vec<CredentialRecord>,
    /// Users seen with a digest that was already cracked.
    pub inherited: Vec<Recovered>,
    pub hashes: usize,
    pub cached: usize,
    pub rejected: usize,
    pub batches: usize,
}

impl SectionParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a pass over one file's content.
    pub fn cursor<'a>(&'a self, store: &'a HashStore, observed_at: DateTime<Local>) -> Cursor<'a> {
        Cursor {
            parser: self,
            store,
            observed_at,
            mode: Mode::None,
            service_label: String::new(),
            ntlm: Vec::new(),
            ntlm_pass: HashSet::new(),
            cached: Vec::new(),
            report: ParseReport::default(),
        }
    }

    /// Parse `text` line by line and submit batches to `sink`.
    pub fn parse(
        &self,
        text: &str,
        store: &HashStore,
        observed_at: DateTime<Local>,
        sink: &mut dyn CrackSink,
    ) -> ParseReport {
        let mut cursor = self.cursor(store, observed_at);
        for line in crate::io::lines(text) {
            cursor.feed(line, sink);
        }
        cursor.finish(sink)
    }
}

/// One pass over one file.
pub struct Cursor<'a> {
    parser: &'a SectionParser,
    store: &'a HashStore,
    observed_at: DateTime<Local>,
    mode: Mode,
    service_label: String,
    ntlm: Vec<String>,
    ntlm_pass: HashSet<String>,
    cached: Vec<String>,
    report: ParseReport,
}

impl Cursor<'_> {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// NTLM digests accumulated and not yet submitted.
    pub fn pending_ntlm(&self) -> &[String] {
        &self.ntlm
    }

    pub fn feed(&mut self, raw: &str, sink: &mut dyn CrackSink) {
        let line = raw.trim();
        if line.is_empty() {
            return;
        }
        let hash_data = match self.mode {
            Mode::NtlmHash => parse_ntlm_line(line).is_some(),
            Mode::CachedHash => parse_cached_line(line).is_some(),
            _ => false,
        };
        if let Some(m) = marker(line).filter(|_| !hash_data) {
            self.enter(m, line, sink);
            return;
        }
        match self.mode {
            Mode::None => {}
            Mode::NtlmHash => self.ntlm_line(line),
            Mode::CachedHash => self.cached_line(line),
            Mode::ServiceSecret => {
                let fresh = self.parser.seen.lock().service.insert(line.to_string());
                if fresh {
                    let cred = match line.split_once(':') {
                        Some((account, secret)) => CredentialRecord::from_account(account, secret),
                        None => CredentialRecord::new("", &self.service_label, line),
                    };
                    info!("service account secret for {}", cred.account());
                    self.report.secrets.push(cred);
                }
                self.mode = Mode::None;
            }
            Mode::DefaultPassword => {
                let fresh = self
                    .parser
                    .seen
                    .lock()
                    .default_password
                    .insert(line.to_string());
                if fresh {
                    let cred = match line.split_once(':') {
                        Some((account, secret)) => CredentialRecord::from_account(account, secret),
                        None => CredentialRecord::new("", "(Unknown User)", line),
                    };
                    info!("default password for {}", cred.account());
                    self.report.secrets.push(cred);
                }
                self.mode = Mode::None;
            }
        }
    }

    fn enter(&mut self, m: Marker, line: &str, sink: &mut dyn CrackSink) {
        self.mode = match m {
            Marker::Ntlm => Mode::NtlmHash,
            Marker::Cached => {
                self.flush_ntlm(sink);
                Mode::CachedHash
            }
            Marker::Reset => Mode::None,
            Marker::Service => {
                self.service_label = line
                    .split_once("_SC_")
                    .map(|(_, name)| name.trim().to_string())
                    .unwrap_or_default();
                Mode::ServiceSecret
            }
            Marker::DefaultPassword => Mode::DefaultPassword,
        };
        debug!("section marker {:?} -> {:?}", m, self.mode);
    }

    fn ntlm_line(&mut self, line: &str) {
        let Some((username, digest)) = parse_ntlm_line(line) else {
            self.report.rejected += 1;
            return;
        };
        self.report.hashes += 1;
        match self.store.upsert_user(&digest, username, self.observed_at) {
            Upsert::NewDigest => {
                if self.ntlm_pass.insert(digest.clone()) {
                    self.ntlm.push(digest);
                }
            }
            Upsert::NewUserCracked { secret, first_seen } => {
                info!("{} shares an already cracked hash", username);
                self.report.inherited.push(inherited_crack(
                    username,
                    &secret,
                    first_seen,
                    self.store,
                    self.observed_at,
                ));
            }
            Upsert::NewUser | Upsert::Known => {}
        }
    }

    fn cached_line(&mut self, line: &str) {
        let Some(value) = parse_cached_line(line) else {
            self.report.rejected += 1;
            return;
        };
        self.report.cached += 1;
        if self.parser.seen.lock().cached.insert(value.clone()) {
            self.cached.push(value);
        }
    }

    fn flush_ntlm(&mut self, sink: &mut dyn CrackSink) {
        if self.ntlm.is_empty() {
            return;
        }
        self.report.batches += 1;
        sink.submit(CrackBatch {
            kind: BatchKind::Ntlm,
            values: std::mem::take(&mut self.ntlm),
        });
    }

    /// End of file: submit whatever is still pending.
    pub fn finish(mut self, sink: &mut dyn CrackSink) -> ParseReport {
        self.flush_ntlm(sink);
        if !self.cached.is_empty() {
            self.report.batches += 1;
            sink.submit(CrackBatch {
                kind: BatchKind::Cached,
                values: std::mem::take(&mut self.cached),
            });
        }
        self.report
    }
}
