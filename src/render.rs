//! Terminal rendering for recovered credentials.
//!
//! Two styles: an annotated one-liner carrying the secret, and a decorative
//! sword whose blade is sized to a masked credential so the secret's length
//! is not on screen. Both are pure string builders; printing happens in the
//! harvest stage.
use chrono::TimeDelta;
use colored::*;

use crate::credential::Recovered;

/// Fixed-width stand-in for the secret in decorative output.
pub const SECRET_MASK: &str = "********";

const SWORD_ART: &str = r"
        |\
 (O)====| |====LEN====-.
 (O)====| |    CRED     >
 (O)====| |====LEN====-'
        |/
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    Plain,
    Art,
}

#[derive(Debug, Clone, Copy)]
pub struct CredentialRenderer {
    pub style: Style,
}

impl CredentialRenderer {
    pub fn new(style: Style) -> Self {
        Self { style }
    }

    pub fn render(&self, recovered: &Recovered) -> String {
        match self.style {
            Style::Plain => render_plain(recovered),
            Style::Art => render_art(recovered),
        }
    }
}

/// `1h 2m 3s`, dropping leading zero units.
pub fn format_elapsed(d: TimeDelta) -> String {
    let secs = d.num_seconds().max(0);
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h {}m {}s", h, m, s)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}

/// Uncolored annotated line.
pub fn describe(recovered: &Recovered) -> String {
    let cred = &recovered.credential;
    let mut line = format!("[+] {} : {}", cred.account(), cred.secret);
    let mut notes: Vec<String> = Vec::new();
    if let Some(elapsed) = recovered.elapsed {
        notes.push(format!("cracked after {}", format_elapsed(elapsed)));
    }
    if let Some(stats) = recovered.stats {
        notes.push(format!(
            "{}/{} users cracked, {}",
            stats.cracked,
            stats.total,
            stats.percentage()
        ));
    }
    if !notes.is_empty() {
        line.push_str(&format!(" ({})", notes.join("; ")));
    }
    line
}

pub fn render_plain(recovered: &Recovered) -> String {
    describe(recovered).green().to_string()
}

/// Uncolored `account ********`.
pub fn masked(recovered: &Recovered) -> String {
    format!("{} {}", recovered.credential.account(), SECRET_MASK)
}

pub fn render_art(recovered: &Recovered) -> String {
    let cred = masked(recovered);
    let blade = "=".repeat(cred.chars().count());
    let mut out = String::new();
    for line in SWORD_ART.trim_matches('\n').lines() {
        if line.contains("CRED") {
            let (head, tail) = line.split_once("CRED").unwrap_or((line, ""));
            out.push_str(&format!(
                "{}{}{}\n",
                head.red(),
                cred.green().bold(),
                tail.red()
            ));
        } else {
            out.push_str(&format!("{}\n", line.replace("LEN", &blade).red()));
        }
    }
    out
}
