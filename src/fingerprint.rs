//! Acoustic fingerprints for move detection.
//!
//! [`FpcalcFingerprinter`] shells out to the `fpcalc` command-line tool
//! (part of Chromaprint). The scanner only needs an opaque identity string,
//! so every failure collapses to an empty string and the caller records
//! [`crate::model::FINGERPRINT_NONE`].
//!
//! Install fpcalc:
//! - Windows: `winget install AcoustID.Chromaprint`
//! - macOS: `brew install chromaprint`
//! - Linux: `apt install libchromaprint-tools` or equivalent

use std::path::Path;
use std::process::Command;

use crate::error::{Error, Result};

/// Computes an opaque acoustic identity for a file.
pub trait Fingerprinter: Send + Sync {
    /// Empty string on failure.
    fn fingerprint(&self, path: &Path) -> String;
}

#[cfg(windows)]
const FPCALC_PATHS: &[&str] = &[
    "fpcalc",
    r"C:\Program Files\Chromaprint\fpcalc.exe",
    r"C:\Program Files\MusicBrainz Picard\fpcalc.exe",
    r"C:\Program Files (x86)\Chromaprint\fpcalc.exe",
];

#[cfg(not(windows))]
const FPCALC_PATHS: &[&str] = &[
    "fpcalc",
    "/usr/bin/fpcalc",
    "/usr/local/bin/fpcalc",
    "/opt/homebrew/bin/fpcalc",
];

/// Find the fpcalc executable, checking common installation paths
fn find_fpcalc() -> Option<&'static str> {
    FPCALC_PATHS.iter().copied().find(|path| {
        Command::new(path)
            .arg("-version")
            .output()
            .is_ok_and(|o| o.status.success())
    })
}

/// Fingerprinter backed by Chromaprint's `fpcalc`.
#[derive(Debug, Clone)]
pub struct FpcalcFingerprinter {
    program: &'static str,
}

impl FpcalcFingerprinter {
    /// `None` when fpcalc is not installed.
    pub fn detect() -> Option<Self> {
        let program = find_fpcalc()?;
        tracing::debug!(target: "fingerprint", program, "Found fpcalc");
        Some(Self { program })
    }

    fn run(&self, path: &Path) -> Result<String> {
        let output = Command::new(self.program)
            .arg("-json")
            .arg(path)
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Fingerprint(format!("fpcalc failed: {}", stderr.trim())));
        }

        parse_fpcalc_json(&String::from_utf8_lossy(&output.stdout))
    }
}

impl Fingerprinter for FpcalcFingerprinter {
    fn fingerprint(&self, path: &Path) -> String {
        match self.run(path) {
            Ok(fp) => fp,
            Err(e) => {
                tracing::warn!(target: "fingerprint", path = %path.display(), "{}", e);
                String::new()
            }
        }
    }
}

/// fpcalc JSON output structure
#[derive(serde::Deserialize)]
struct FpcalcOutput {
    fingerprint: String,
}

/// Parse the JSON output from fpcalc
fn parse_fpcalc_json(json: &str) -> Result<String> {
    let parsed: FpcalcOutput = serde_json::from_str(json)
        .map_err(|e| Error::Fingerprint(format!("Failed to parse fpcalc output: {}", e)))?;
    Ok(parsed.fingerprint)
}
