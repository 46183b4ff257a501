//! Fire-and-forget cracking engine invocation.
//!
//! A batch of crackable values is written one per line to a fresh file in the
//! stage's junk directory, then the engine is spawned with its result file
//! pointed into the stage's output directory. Nothing is read back here: the
//! result file is picked up later by whichever stage watches that directory.
//! Junk files are never removed.
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::{debug, info, warn};
use serde::Deserialize;

/// Written next to the hashcat binary so it never blocks on the licence
/// prompt.
pub const EULA_FILE: &str = "eula.accepted";
const EULA_CONTENT: &[u8] = b"1\0\0\0";
/// Substring an outdated engine build prints on stderr.
pub const OUTDATED_MARKER: &str = "outdated";

#[derive(Debug, thiserror::Error)]
pub enum CrackError {
    #[error("empty crack batch")]
    EmptyBatch,
    #[error("{0} binary not found: {1}")]
    MissingBinary(EngineKind, PathBuf),
    #[error("{kind} {what} not found: {path}")]
    MissingFile {
        kind: EngineKind,
        what: &'static str,
        path: PathBuf,
    },
    #[error("{0} at {1} is outdated; install a current release before starting")]
    Outdated(EngineKind, PathBuf),
    #[error("no {0} engine configured")]
    NotConfigured(EngineKind),
    #[error("failed to write batch file in {dir}: {source}")]
    Batch {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn {kind}: {source}")]
    Spawn {
        kind: EngineKind,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Hashcat,
    John,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineKind::Hashcat => f.write_str("hashcat"),
            EngineKind::John => f.write_str("john"),
        }
    }
}

/// Per-launch engine selector: hash mode for hashcat, format name for john.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineParams {
    Hashcat { mode: u32 },
    John { format: String },
}

impl EngineParams {
    pub fn kind(&self) -> EngineKind {
        match self {
            EngineParams::Hashcat { .. } => EngineKind::Hashcat,
            EngineParams::John { .. } => EngineKind::John,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct HashcatConfig {
    pub binary: PathBuf,
    pub ruleset: PathBuf,
    pub wordlist: PathBuf,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct JohnConfig {
    pub binary: PathBuf,
    pub wordlist: PathBuf,
}

/// Where one stage's crack jobs put their files.
#[derive(Debug, Clone)]
pub struct BatchTarget<'a> {
    pub junk_dir: &'a Path,
    pub output_dir: &'a Path,
    /// Appended to the result file name; tells the harvest stage which line
    /// shape to expect.
    pub suffix: &'a str,
}

/// A spawned job. The child is reaped on a background thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launched {
    pub pid: u32,
    pub batch: PathBuf,
    pub output: PathBuf,
    pub command: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CrackInvoker {
    hashcat: HashcatConfig,
    john: Option<JohnConfig>,
}

impl CrackInvoker {
    pub fn new(hashcat: HashcatConfig, john: Option<JohnConfig>) -> Self {
        Self { hashcat, john }
    }

    /// Check every configured engine: binary and parameter files exist and
    /// the binary does not report itself as outdated.
    pub fn verify(&self) -> Result<(), CrackError> {
        verify_engine(
            EngineKind::Hashcat,
            &self.hashcat.binary,
            &[
                ("ruleset", &self.hashcat.ruleset),
                ("wordlist", &self.hashcat.wordlist),
            ],
        )?;
        if let Some(john) = &self.john {
            verify_engine(EngineKind::John, &john.binary, &[("wordlist", &john.wordlist)])?;
        }
        Ok(())
    }

    pub fn supports(&self, kind: EngineKind) -> bool {
        match kind {
            EngineKind::Hashcat => true,
            EngineKind::John => self.john.is_some(),
        }
    }

    /// Write `values` to a new batch file and start the engine without
    /// waiting for it.
    pub fn launch(
        &self,
        params: &EngineParams,
        values: &[String],
        target: &BatchTarget<'_>,
    ) -> Result<Launched, CrackError> {
        if values.is_empty() {
            return Err(CrackError::EmptyBatch);
        }
        let kind = params.kind();
        if !self.supports(kind) {
            return Err(CrackError::NotConfigured(kind));
        }
        let batch = write_batch(target.junk_dir, values)?;
        let token = batch
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let output = target
            .output_dir
            .join(format!("{}{}", token, target.suffix));

        let command = match params {
            EngineParams::Hashcat { mode } => {
                accept_eula(&self.hashcat.binary);
                hashcat_command(&self.hashcat, *mode, &output, &batch)
            }
            EngineParams::John { format } => {
                let john = self.john.as_ref().ok_or(CrackError::NotConfigured(kind))?;
                let session = target.junk_dir.join(format!("{}.session", token));
                john_command(john, format, &session, &output, &batch)
            }
        };

        info!("{}", command.join(" "));
        let child = Command::new(&command[0])
            .args(&command[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| CrackError::Spawn { kind, source })?;
        let pid = child.id();
        reap(kind, child);

        Ok(Launched {
            pid,
            batch,
            output,
            command,
        })
    }
}

fn write_batch(junk_dir: &Path, values: &[String]) -> Result<PathBuf, CrackError> {
    let wrap = |source: std::io::Error| CrackError::Batch {
        dir: junk_dir.to_path_buf(),
        source,
    };
    let mut tmp = tempfile::Builder::new()
        .prefix("batch-")
        .tempfile_in(junk_dir)
        .map_err(wrap)?;
    for v in values {
        writeln!(tmp, "{}", v).map_err(wrap)?;
    }
    tmp.flush().map_err(wrap)?;
    let (_file, path) = tmp.keep().map_err(|e| wrap(e.error))?;
    Ok(path)
}

fn hashcat_command(cfg: &HashcatConfig, mode: u32, output: &Path, batch: &Path) -> Vec<String> {
    vec![
        cfg.binary.display().to_string(),
        "-m".to_string(),
        mode.to_string(),
        "-r".to_string(),
        cfg.ruleset.display().to_string(),
        "-o".to_string(),
        output.display().to_string(),
        batch.display().to_string(),
        cfg.wordlist.display().to_string(),
    ]
}

/// john refuses to run two jobs against the same session, so every launch
/// gets its own session file.
fn john_command(
    cfg: &JohnConfig,
    format: &str,
    session: &Path,
    output: &Path,
    batch: &Path,
) -> Vec<String> {
    vec![
        cfg.binary.display().to_string(),
        format!("--format={}", format),
        format!("--wordlist={}", cfg.wordlist.display()),
        format!("--session={}", session.display()),
        format!("--pot={}", output.display()),
        batch.display().to_string(),
    ]
}

/// Write the licence acknowledgement next to `binary`. Safe to repeat.
pub fn accept_eula(binary: &Path) {
    let Some(dir) = binary.parent().filter(|d| !d.as_os_str().is_empty()) else {
        return;
    };
    let eula = dir.join(EULA_FILE);
    if let Err(e) = fs::write(&eula, EULA_CONTENT) {
        warn!("could not write {}: {}", eula.display(), e);
    }
}

fn reap(kind: EngineKind, mut child: std::process::Child) {
    let spawned = std::thread::Builder::new()
        .name(format!("reap-{}", child.id()))
        .spawn(move || match child.wait() {
            Ok(status) => debug!("{} pid {} exited: {}", kind, child.id(), status),
            Err(e) => debug!("{} pid {} wait failed: {}", kind, child.id(), e),
        });
    if let Err(e) = spawned {
        debug!("no reaper thread for {}: {}", kind, e);
    }
}

/// Startup health check for one engine.
pub fn verify_engine(
    kind: EngineKind,
    binary: &Path,
    files: &[(&'static str, &Path)],
) -> Result<(), CrackError> {
    if !binary.is_file() {
        return Err(CrackError::MissingBinary(kind, binary.to_path_buf()));
    }
    for &(what, path) in files {
        if !path.exists() {
            return Err(CrackError::MissingFile {
                kind,
                what,
                path: path.to_path_buf(),
            });
        }
    }
    if kind == EngineKind::Hashcat {
        accept_eula(binary);
    }
    let out = Command::new(binary)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .map_err(|source| CrackError::Spawn { kind, source })?;
    if is_outdated(&out.stderr) {
        return Err(CrackError::Outdated(kind, binary.to_path_buf()));
    }
    Ok(())
}

pub fn is_outdated(stderr: &[u8]) -> bool {
    String::from_utf8_lossy(stderr)
        .to_lowercase()
        .contains(OUTDATED_MARKER)
}
