use std::{fs, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::types::{DownloadOutcome, DownloadStatus};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const FAILURES_FILE: &str = "failures.json";

/// Per-run summary of what was fetched for one (congress, doc type)
/// pair. Each run's manifest for a pair replaces the previous one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    pub congress: u32,
    pub doc_type: String,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub new_files_count: usize,
    pub new_files: Vec<String>,
}

impl Manifest {
    pub fn from_outcomes(congress: u32, doc_type: &str, outcomes: &[DownloadOutcome]) -> Manifest {
        let mut succeeded = 0;
        let mut failed = 0;
        let mut new_files = Vec::new();

        for outcome in outcomes {
            match outcome.status {
                DownloadStatus::Completed => {
                    succeeded += 1;
                    new_files.push(outcome.relative_path.to_string_lossy().into_owned());
                }
                DownloadStatus::Failed => failed += 1,
                DownloadStatus::Skipped => {}
            }
        }
        new_files.sort();

        Manifest {
            congress,
            doc_type: doc_type.to_string(),
            attempted: outcomes.len(),
            succeeded,
            failed,
            new_files_count: new_files.len(),
            new_files,
        }
    }

    /// Whether a prior run finished this pair without failures, which
    /// lets the orchestrator skip re-listing it.
    pub fn is_complete(&self) -> bool {
        self.attempted > 0 && self.failed == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureLog {
    pub failed_urls: Vec<FailedUrl>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedUrl {
    pub url: String,
    pub error: String,
}

impl FailureLog {
    pub fn from_outcomes(outcomes: &[DownloadOutcome]) -> FailureLog {
        let mut failed_urls: Vec<FailedUrl> = outcomes
            .iter()
            .filter(|o| o.status == DownloadStatus::Failed)
            .map(|o| FailedUrl {
                url: o.url.clone(),
                error: o.error.clone().unwrap_or_default(),
            })
            .collect();
        failed_urls.sort_by(|a, b| a.url.cmp(&b.url));
        FailureLog { failed_urls }
    }
}

/// Write the manifest and failure log for a pair into its directory.
pub fn write_pair_reports(
    pair_dir: &Path,
    manifest: &Manifest,
    failures: &FailureLog,
) -> anyhow::Result<()> {
    fs::create_dir_all(pair_dir).context(format!("could not create {:?}", pair_dir))?;

    let manifest_path = pair_dir.join(MANIFEST_FILE);
    fs::write(&manifest_path, serde_json::to_string_pretty(manifest)?)
        .context(format!("could not write manifest {:?}", manifest_path))?;

    let failures_path = pair_dir.join(FAILURES_FILE);
    fs::write(&failures_path, serde_json::to_string_pretty(failures)?)
        .context(format!("could not write failure log {:?}", failures_path))?;

    Ok(())
}

/// Prior run's manifest for a pair, if one exists and parses.
pub fn read_manifest(pair_dir: &Path) -> Option<Manifest> {
    let path = pair_dir.join(MANIFEST_FILE);
    let raw = fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            warn!("ignoring unreadable manifest {:?}: {}", path, e);
            None
        }
    }
}
