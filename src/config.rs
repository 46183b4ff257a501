//! TOML configuration.
//!
//! ```toml
//! [project]
//! path = "/engagements/acme"
//!
//! [responder]
//! watch_path = "/usr/share/responder/logs"
//!
//! [secretsdump]
//! watch_path = "/engagements/acme/dumps"
//!
//! [hashcat]
//! binary = "/opt/hashcat/hashcat.bin"
//! ruleset = "/opt/hashcat/rules/best64.rule"
//! wordlist = "/usr/share/wordlists/rockyou.txt"
//!
//! [john]
//! binary = "/opt/john/run/john"
//! wordlist = "/usr/share/wordlists/rockyou.txt"
//! ```
//!
//! `[john]` is optional; without it cached logon batches are dropped with a
//! warning. At least one of `[responder]` and `[secretsdump]` must be set.
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::cracker::{HashcatConfig, JohnConfig};

pub const DEFAULT_CONFIG_FILE: &str = "gladius.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no capture source configured; set [responder] and/or [secretsdump]")]
    NoSources,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Root for stage output, junk and credential directories.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct WatchConfig {
    pub watch_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub project: ProjectConfig,
    pub responder: Option<WatchConfig>,
    pub secretsdump: Option<WatchConfig>,
    pub hashcat: HashcatConfig,
    pub john: Option<JohnConfig>,
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(s)?;
        if cfg.responder.is_none() && cfg.secretsdump.is_none() {
            return Err(ConfigError::NoSources);
        }
        Ok(cfg)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Shared junk directory for batch files.
    pub fn junk_dir(&self) -> PathBuf {
        self.project.path.join("junk")
    }

    /// Directory the harvest stages append recovered credentials to.
    pub fn creds_dir(&self) -> PathBuf {
        self.project.path.join("creds")
    }

    /// Output directory of a named stage.
    pub fn stage_out_dir(&self, stage: &str) -> PathBuf {
        self.project.path.join(format!("{}_out", stage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[project]
path = "/eng"

[responder]
watch_path = "/resp/logs"

[secretsdump]
watch_path = "/eng/dumps"

[hashcat]
binary = "/opt/hc/hashcat.bin"
ruleset = "/opt/hc/best64.rule"
wordlist = "/wl/rockyou.txt"

[john]
binary = "/opt/john/john"
wordlist = "/wl/rockyou.txt"
"#;

    #[test]
    fn parses_full_config() {
        let cfg = Config::from_toml_str(FULL).unwrap();
        assert_eq!(cfg.project.path, PathBuf::from("/eng"));
        assert_eq!(
            cfg.responder.as_ref().unwrap().watch_path,
            PathBuf::from("/resp/logs")
        );
        assert_eq!(cfg.hashcat.ruleset, PathBuf::from("/opt/hc/best64.rule"));
        assert!(cfg.john.is_some());
        assert_eq!(cfg.junk_dir(), PathBuf::from("/eng/junk"));
        assert_eq!(cfg.stage_out_dir("responder"), PathBuf::from("/eng/responder_out"));
    }

    #[test]
    fn john_is_optional() {
        let text = FULL.split("[john]").next().unwrap();
        let cfg = Config::from_toml_str(text).unwrap();
        assert!(cfg.john.is_none());
    }

    #[test]
    fn requires_a_capture_source() {
        let text = r#"
[project]
path = "/eng"
[hashcat]
binary = "h"
ruleset = "r"
wordlist = "w"
"#;
        assert!(matches!(
            Config::from_toml_str(text),
            Err(ConfigError::NoSources)
        ));
    }

    #[test]
    fn missing_hashcat_section_is_a_parse_error() {
        let text = "[project]\npath = \"/eng\"\n[responder]\nwatch_path = \"/r\"\n";
        assert!(matches!(
            Config::from_toml_str(text),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn unreadable_file_reports_path() {
        let err = Config::load("/definitely/not/here.toml").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.toml"));
    }
}
