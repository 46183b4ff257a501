//! One pipeline stage: a watched directory, the file-name patterns it cares
//! about, and the routine that turns an observed file into crack jobs and
//! recovered credentials.
//!
//! Routines are a closed set chosen when the graph is assembled:
//!
//! - [`Routine::Responder`]: raw Responder captures, one hash per line;
//! - [`Routine::Secretsdump`]: sectioned dump output, see [`crate::section`];
//! - [`Routine::Harvest`]: engine result files, see [`crate::harvest`].
//!
//! [`PipelineStage::handle`] may be called from any thread; every piece of
//! per-stage state sits behind its own lock.
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use chrono::Local;
use globset::{Glob, GlobSet, GlobSetBuilder};
use log::{debug, info, warn};
use parking_lot::Mutex;
use regex::Regex;

use crate::cracker::{BatchTarget, CrackInvoker, EngineParams};
use crate::credential::Recovered;
use crate::export::CredentialSink;
use crate::gate::FingerprintGate;
use crate::harvest::{
    Harvester, OutputShape, SUFFIX_DIGEST, SUFFIX_MSCASH, SUFFIX_NETNTLM, inherited_crack,
};
use crate::render::CredentialRenderer;
use crate::section::{BatchKind, CrackBatch, CrackSink, SectionParser, parse_ntlm_line};
use crate::store::{HashStore, Upsert};

pub const HASHCAT_NETNTLMV1: u32 = 5500;
pub const HASHCAT_NETNTLMV2: u32 = 5600;
pub const HASHCAT_NTLM: u32 = 1000;
pub const JOHN_MSCASH2: &str = "mscash2";

pub const RESPONDER_PATTERNS: &[&str] = &["*NTLM*.txt", "*hashdump*"];
pub const SECRETSDUMP_PATTERNS: &[&str] = &["*secretsdump*", "*.secrets", "*.sam", "*.ntds"];
pub const HARVEST_PATTERNS: &[&str] = &["*"];

/// Everything stages share: the hash store, the engine launcher and the
/// credential output.
#[derive(Debug)]
pub struct StageContext {
    pub store: Arc<HashStore>,
    pub invoker: CrackInvoker,
    pub renderer: CredentialRenderer,
    pub sink: CredentialSink,
}

impl StageContext {
    /// Print and persist newly recovered credentials.
    pub fn report(&self, stage: &str, recovered: &[Recovered]) {
        if recovered.is_empty() {
            return;
        }
        for r in recovered {
            println!("{}", self.renderer.render(r));
        }
        let creds: Vec<_> = recovered.iter().map(|r| r.credential.clone()).collect();
        if let Err(e) = self.sink.append(&creds) {
            warn!("{}: could not record credentials: {:#}", stage, e);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutineKind {
    Responder,
    Secretsdump,
    Harvest,
}

impl RoutineKind {
    pub fn default_patterns(&self) -> Vec<String> {
        let p = match self {
            RoutineKind::Responder => RESPONDER_PATTERNS,
            RoutineKind::Secretsdump => SECRETSDUMP_PATTERNS,
            RoutineKind::Harvest => HARVEST_PATTERNS,
        };
        p.iter().map(|s| s.to_string()).collect()
    }

    /// Harvest stages write to the credential sink only; everything else
    /// feeds engine results to a downstream stage.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RoutineKind::Harvest)
    }
}

#[derive(Debug)]
pub enum Routine {
    Responder {
        submitted: Mutex<HashSet<String>>,
        kinds: Regex,
    },
    Secretsdump(SectionParser),
    Harvest(Harvester),
}

impl Routine {
    pub fn new(kind: RoutineKind) -> Result<Self, regex::Error> {
        Ok(match kind {
            RoutineKind::Responder => Routine::Responder {
                submitted: Mutex::new(HashSet::new()),
                kinds: Regex::new(r"(?i)(ntlmv1|ntlmv2|hashdump)")?,
            },
            RoutineKind::Secretsdump => Routine::Secretsdump(SectionParser::new()),
            RoutineKind::Harvest => Routine::Harvest(Harvester::new()),
        })
    }

    pub fn kind(&self) -> RoutineKind {
        match self {
            Routine::Responder { .. } => RoutineKind::Responder,
            Routine::Secretsdump(_) => RoutineKind::Secretsdump,
            Routine::Harvest(_) => RoutineKind::Harvest,
        }
    }
}

/// What one call to [`PipelineStage::handle`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Not a file, or the name matched none of the stage's patterns.
    Ignored,
    /// Content already processed by this stage.
    Duplicate,
    Processed { launched: usize, recovered: usize },
}

pub fn build_globset(patterns: &[String]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        builder.add(Glob::new(p)?);
    }
    builder.build()
}

#[derive(Debug)]
pub struct PipelineStage {
    pub name: String,
    pub watch_dir: PathBuf,
    pub output_dir: PathBuf,
    pub junk_dir: PathBuf,
    pub patterns: Vec<String>,
    globs: GlobSet,
    routine: Routine,
    gate: FingerprintGate,
    ctx: Arc<StageContext>,
}

impl PipelineStage {
    pub fn new(
        name: &str,
        watch_dir: PathBuf,
        output_dir: PathBuf,
        junk_dir: PathBuf,
        patterns: Vec<String>,
        routine: Routine,
        ctx: Arc<StageContext>,
    ) -> Result<Self, globset::Error> {
        let globs = build_globset(&patterns)?;
        Ok(Self {
            name: name.to_string(),
            watch_dir,
            output_dir,
            junk_dir,
            patterns,
            globs,
            routine,
            gate: FingerprintGate::new(),
            ctx,
        })
    }

    pub fn kind(&self) -> RoutineKind {
        self.routine.kind()
    }

    /// Patterns match the file name, not the full path.
    pub fn matches(&self, path: &Path) -> bool {
        path.file_name()
            .is_some_and(|name| self.globs.is_match(Path::new(name)))
    }

    /// Process one created or modified file.
    pub fn handle(&self, path: &Path) -> Result<Outcome> {
        if !path.is_file() || !self.matches(path) {
            return Ok(Outcome::Ignored);
        }
        let bytes = crate::io::load_file(path)?;
        if !self.gate.accept(path, &bytes) {
            return Ok(Outcome::Duplicate);
        }
        debug!("{}: new data in {}", self.name, path.display());
        let text = crate::io::decode_lossy(&bytes);
        let outcome = match &self.routine {
            Routine::Responder { submitted, kinds } => {
                self.process_responder(path, &text, submitted, kinds)
            }
            Routine::Secretsdump(parser) => self.process_secretsdump(&text, parser),
            Routine::Harvest(harvester) => self.process_harvest(path, &text, harvester),
        };
        Ok(outcome)
    }

    fn launch(&self, params: &EngineParams, values: &[String], suffix: &str) -> bool {
        let target = BatchTarget {
            junk_dir: &self.junk_dir,
            output_dir: &self.output_dir,
            suffix,
        };
        match self.ctx.invoker.launch(params, values, &target) {
            Ok(job) => {
                info!(
                    "{}: {} value(s) submitted to {} (pid {})",
                    self.name,
                    values.len(),
                    params.kind(),
                    job.pid
                );
                true
            }
            Err(e) => {
                warn!("{}: crack launch failed: {}", self.name, e);
                false
            }
        }
    }

    fn process_responder(
        &self,
        path: &Path,
        text: &str,
        submitted: &Mutex<HashSet<String>>,
        kinds: &Regex,
    ) -> Outcome {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let Some(kind) = kinds.find(&file_name).map(|m| m.as_str().to_string()) else {
            info!("{}: no hash type in {}, skipping", self.name, file_name);
            return Outcome::Processed {
                launched: 0,
                recovered: 0,
            };
        };
        let now = Local::now();
        let mut batch: Vec<String> = Vec::new();
        let mut inherited: Vec<Recovered> = Vec::new();
        for line in crate::io::lines(text) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value = if kind == "hashdump" {
                let Some((username, digest)) = parse_ntlm_line(line) else {
                    continue;
                };
                match self.ctx.store.upsert_user(&digest, username, now) {
                    Upsert::NewDigest => digest,
                    Upsert::NewUserCracked { secret, first_seen } => {
                        inherited.push(inherited_crack(
                            username,
                            &secret,
                            first_seen,
                            &self.ctx.store,
                            now,
                        ));
                        continue;
                    }
                    Upsert::NewUser | Upsert::Known => continue,
                }
            } else {
                line.to_string()
            };
            if submitted.lock().insert(value.clone()) {
                info!("{}: new hash to crack: {}", self.name, line);
                batch.push(value);
            }
        }
        let (mode, suffix) = match kind.as_str() {
            "ntlmv1" => (HASHCAT_NETNTLMV1, SUFFIX_NETNTLM),
            "ntlmv2" => (HASHCAT_NETNTLMV2, SUFFIX_NETNTLM),
            _ => (HASHCAT_NTLM, SUFFIX_DIGEST),
        };
        let mut launched = 0;
        if !batch.is_empty() && self.launch(&EngineParams::Hashcat { mode }, &batch, suffix) {
            launched = 1;
        }
        self.ctx.report(&self.name, &inherited);
        Outcome::Processed {
            launched,
            recovered: inherited.len(),
        }
    }

    fn process_secretsdump(&self, text: &str, parser: &SectionParser) -> Outcome {
        let mut sink = LaunchSink {
            stage: self,
            launched: 0,
        };
        let report = parser.parse(text, &self.ctx.store, Local::now(), &mut sink);
        debug!(
            "{}: {} hash line(s), {} cached, {} rejected",
            self.name, report.hashes, report.cached, report.rejected
        );
        let recovered: Vec<Recovered> = report
            .secrets
            .into_iter()
            .map(Recovered::plain)
            .chain(report.inherited)
            .collect();
        self.ctx.report(&self.name, &recovered);
        Outcome::Processed {
            launched: sink.launched,
            recovered: recovered.len(),
        }
    }

    fn process_harvest(&self, path: &Path, text: &str, harvester: &Harvester) -> Outcome {
        let Some(shape) = OutputShape::from_path(path) else {
            debug!("{}: unknown result file {}", self.name, path.display());
            return Outcome::Ignored;
        };
        let recovered = harvester.harvest(shape, text, &self.ctx.store, Local::now());
        self.ctx.report(&self.name, &recovered);
        Outcome::Processed {
            launched: 0,
            recovered: recovered.len(),
        }
    }
}

/// Sends parser batches straight to the engines.
struct LaunchSink<'a> {
    stage: &'a PipelineStage,
    launched: usize,
}

impl CrackSink for LaunchSink<'_> {
    fn submit(&mut self, batch: CrackBatch) {
        let (params, suffix) = match batch.kind {
            BatchKind::Ntlm => (EngineParams::Hashcat { mode: HASHCAT_NTLM }, SUFFIX_DIGEST),
            BatchKind::Cached => (
                EngineParams::John {
                    format: JOHN_MSCASH2.to_string(),
                },
                SUFFIX_MSCASH,
            ),
        };
        if self.stage.launch(&params, &batch.values, suffix) {
            self.launched += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cracker::HashcatConfig;
    use crate::render::Style;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    fn context(dir: &Path) -> Arc<StageContext> {
        let hashcat = HashcatConfig {
            binary: dir.join("missing-hashcat"),
            ruleset: dir.join("r"),
            wordlist: dir.join("w"),
        };
        Arc::new(StageContext {
            store: Arc::new(HashStore::new()),
            invoker: CrackInvoker::new(hashcat, None),
            renderer: CredentialRenderer::new(Style::Plain),
            sink: CredentialSink::in_dir(&dir.join("creds")),
        })
    }

    fn stage(kind: RoutineKind) -> (TempDir, PipelineStage) {
        let dir = tempdir().unwrap();
        let root = dir.path();
        for d in ["in", "out", "junk"] {
            fs::create_dir_all(root.join(d)).unwrap();
        }
        let s = PipelineStage::new(
            "test",
            root.join("in"),
            root.join("out"),
            root.join("junk"),
            kind.default_patterns(),
            Routine::new(kind).unwrap(),
            context(root),
        )
        .unwrap();
        (dir, s)
    }

    #[test]
    fn patterns_match_file_names() {
        let (_d, s) = stage(RoutineKind::Responder);
        assert!(s.matches(Path::new("/x/SMB-NTLMv2-SSP-10.0.0.5.txt")));
        assert!(s.matches(Path::new("/x/host-hashdump")));
        assert!(!s.matches(Path::new("/x/Responder-Session.log")));
    }

    #[test]
    fn same_content_twice_is_duplicate() {
        let (d, s) = stage(RoutineKind::Secretsdump);
        let p = d.path().join("in").join("dc01.secretsdump");
        fs::write(&p, "[*] DefaultPassword\n(Unknown User):pw\n").unwrap();
        assert_eq!(
            s.handle(&p).unwrap(),
            Outcome::Processed {
                launched: 0,
                recovered: 1
            }
        );
        assert_eq!(s.handle(&p).unwrap(), Outcome::Duplicate);
        let creds = fs::read_to_string(d.path().join("creds").join("credentials.txt")).unwrap();
        assert_eq!(creds, ". (Unknown User) pw\n");
    }

    #[test]
    fn unmatched_files_and_directories_are_ignored() {
        let (d, s) = stage(RoutineKind::Secretsdump);
        let p = d.path().join("in").join("notes.txt");
        fs::write(&p, "x").unwrap();
        assert_eq!(s.handle(&p).unwrap(), Outcome::Ignored);
        assert_eq!(s.handle(&d.path().join("in")).unwrap(), Outcome::Ignored);
    }

    #[test]
    fn spawn_failure_does_not_fail_the_stage() {
        let (d, s) = stage(RoutineKind::Secretsdump);
        let p = d.path().join("in").join("ws01.sam");
        fs::write(
            &p,
            "Dumping local SAM hashes\nalice:1001:aad3b435b51404eeaad3b435b51404ee:ffffffffffffffffffffffffffffffff:::\n",
        )
        .unwrap();
        let out = s.handle(&p).unwrap();
        assert_eq!(
            out,
            Outcome::Processed {
                launched: 0,
                recovered: 0
            }
        );
        assert!(s.ctx.store.get("ffffffffffffffffffffffffffffffff").is_some());
        let junk: Vec<_> = fs::read_dir(d.path().join("junk")).unwrap().collect();
        assert_eq!(junk.len(), 1);
    }

    #[test]
    fn responder_hashdump_feeds_the_store() {
        let (d, s) = stage(RoutineKind::Responder);
        let p = d.path().join("in").join("10.0.0.9-hashdump");
        fs::write(
            &p,
            "bob:1001:aad3b435b51404eeaad3b435b51404ee:dddddddddddddddddddddddddddddddd:::\nWS$:1002:aad3b435b51404eeaad3b435b51404ee:eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee:::\n",
        )
        .unwrap();
        s.handle(&p).unwrap();
        assert!(s.ctx.store.get("dddddddddddddddddddddddddddddddd").is_some());
        assert!(s.ctx.store.get("eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee").is_none());
    }

    #[test]
    fn harvest_resolves_digests_through_the_store() {
        let (d, s) = stage(RoutineKind::Harvest);
        s.ctx.store.upsert_user("abcd", "alice", Local::now());
        s.ctx.store.upsert_user("abcd", "bob", Local::now());
        let p = d.path().join("in").join("batch-x.nt");
        fs::write(&p, "abcd:Summer2024!\n").unwrap();
        assert_eq!(
            s.handle(&p).unwrap(),
            Outcome::Processed {
                launched: 0,
                recovered: 2
            }
        );
        let q = d.path().join("in").join("batch-y.nt");
        fs::write(&q, "abcd:Other\n\n").unwrap();
        assert_eq!(
            s.handle(&q).unwrap(),
            Outcome::Processed {
                launched: 0,
                recovered: 0
            }
        );
        assert_eq!(s.ctx.store.snapshot_stats().cracked, 2);
    }

    #[test]
    fn user_seen_after_crack_is_reported_with_the_secret() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        for d in ["in", "out", "junk"] {
            fs::create_dir_all(root.join(d)).unwrap();
        }
        let ctx = context(root);
        let build = |name: &str, watch: &str, out: &str, kind: RoutineKind| {
            PipelineStage::new(
                name,
                root.join(watch),
                root.join(out),
                root.join("junk"),
                kind.default_patterns(),
                Routine::new(kind).unwrap(),
                Arc::clone(&ctx),
            )
            .unwrap()
        };
        let dump = build("secretsdump", "in", "out", RoutineKind::Secretsdump);
        let harvest = build("secretsdump_harvest", "out", "creds", RoutineKind::Harvest);
        let nt = "ffffffffffffffffffffffffffffffff";

        let ws01 = root.join("in").join("ws01.sam");
        fs::write(
            &ws01,
            format!("Dumping local SAM hashes\nalice:1001:aad3b435b51404eeaad3b435b51404ee:{}:::\n", nt),
        )
        .unwrap();
        dump.handle(&ws01).unwrap();

        let result = root.join("out").join("batch-a.nt");
        fs::write(&result, format!("{}:Summer2024!\n", nt)).unwrap();
        assert_eq!(
            harvest.handle(&result).unwrap(),
            Outcome::Processed {
                launched: 0,
                recovered: 1
            }
        );

        let ws02 = root.join("in").join("ws02.sam");
        fs::write(
            &ws02,
            format!("Dumping local SAM hashes\nbob:1002:aad3b435b51404eeaad3b435b51404ee:{}:::\n", nt),
        )
        .unwrap();
        assert_eq!(
            dump.handle(&ws02).unwrap(),
            Outcome::Processed {
                launched: 0,
                recovered: 1
            }
        );

        let creds = fs::read_to_string(root.join("creds").join("credentials.txt")).unwrap();
        assert_eq!(creds, ". alice Summer2024!\n. bob Summer2024!\n");
        let stats = ctx.store.snapshot_stats();
        assert_eq!((stats.cracked, stats.total), (2, 2));
    }

    #[test]
    fn responder_hashdump_reports_users_of_cracked_digests() {
        let (d, s) = stage(RoutineKind::Responder);
        let nt = "dddddddddddddddddddddddddddddddd";
        s.ctx.store.upsert_user(nt, "alice", Local::now());
        s.ctx.store.mark_cracked(nt, "Winter2024!");
        let p = d.path().join("in").join("10.0.0.9-hashdump");
        fs::write(
            &p,
            format!("bob:1001:aad3b435b51404eeaad3b435b51404ee:{}:::\n", nt),
        )
        .unwrap();
        assert_eq!(
            s.handle(&p).unwrap(),
            Outcome::Processed {
                launched: 0,
                recovered: 1
            }
        );
        let creds = fs::read_to_string(d.path().join("creds").join("credentials.txt")).unwrap();
        assert_eq!(creds, ". bob Winter2024!\n");
    }

    #[test]
    fn concurrent_handles_process_shared_content_once() {
        let (d, s) = stage(RoutineKind::Secretsdump);
        let p = d.path().join("in").join("dc01.secretsdump");
        fs::write(&p, "[*] DefaultPassword\n(Unknown User):AutoLogon1\n").unwrap();
        let s = Arc::new(s);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = Arc::clone(&s);
                let p = p.clone();
                std::thread::spawn(move || s.handle(&p).unwrap())
            })
            .collect();
        let outcomes: Vec<Outcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let processed = outcomes
            .iter()
            .filter(|o| matches!(o, Outcome::Processed { .. }))
            .count();
        assert_eq!(processed, 1);
        assert_eq!(
            outcomes.iter().filter(|o| **o == Outcome::Duplicate).count(),
            7
        );
        let creds = fs::read_to_string(d.path().join("creds").join("credentials.txt")).unwrap();
        assert_eq!(creds, ". (Unknown User) AutoLogon1\n");
    }

    #[test]
    fn harvest_ignores_unknown_suffix() {
        let (d, s) = stage(RoutineKind::Harvest);
        let p = d.path().join("in").join("hashcat.log");
        fs::write(&p, "abcd:pw\n").unwrap();
        assert_eq!(s.handle(&p).unwrap(), Outcome::Ignored);
    }
}
