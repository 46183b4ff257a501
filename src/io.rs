use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};

/// Read a whole watched file through a buffered reader. Capture tools
/// truncate and rewrite these files while we read them, so a short or empty
/// read is an ordinary outcome; the next modify event delivers the rest.
pub fn load_bufread<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let file = File::open(&path).with_context(|| format!("open {}", path.as_ref().display()))?;
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    reader
        .read_to_end(&mut buf)
        .with_context(|| format!("read {}", path.as_ref().display()))?;
    Ok(buf)
}

/// Load a regular file; directories and other non-files are rejected.
pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let meta =
        std::fs::metadata(&path).with_context(|| format!("stat {}", path.as_ref().display()))?;
    if !meta.is_file() {
        anyhow::bail!("not a regular file: {}", path.as_ref().display());
    }
    load_bufread(path)
}

/// Decode observed bytes as text; capture tools occasionally emit invalid
/// UTF-8 in usernames, which is replaced rather than rejected.
pub fn decode_lossy(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).to_string(),
    }
}

/// Split text into lines, trimming a trailing `\r` (CRLF output from
/// Windows-side tooling).
pub fn lines(text: &str) -> impl Iterator<Item = &str> {
    text.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l))
}
