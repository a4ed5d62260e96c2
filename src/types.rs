use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    /// Timeouts, connection resets, 5xx. Eligible for retry with backoff.
    #[error("transient: {0}")]
    Transient(String),
    /// 404, persistent 406, unsupported content. Never retried.
    #[error("permanent: {0}")]
    Permanent(String),
    /// Malformed XML or schema mismatch. The artifact is discarded.
    #[error("validation: {0}")]
    Validation(String),
    /// A directory could not be listed by any strategy.
    #[error("listing: {0}")]
    Listing(String),
    /// Environment problems (output dir, tracking store). Aborts the run.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl IngestError {
    pub fn is_transient(&self) -> bool {
        matches!(self, IngestError::Transient(_))
    }

    /// Classify a reqwest transport error. Everything the client can
    /// surface before a status code arrives is worth another attempt.
    pub fn from_transport(e: reqwest::Error) -> IngestError {
        IngestError::Transient(e.to_string())
    }

    pub fn from_status(status: reqwest::StatusCode, url: &str) -> IngestError {
        if status.is_server_error() {
            IngestError::Transient(format!("HTTP {} for {}", status.as_u16(), url))
        } else {
            IngestError::Permanent(format!("HTTP {} for {}", status.as_u16(), url))
        }
    }
}

/// Document collections published in the bulk data repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DocumentType {
    Bills,
    BillStatus,
    PublicLaw,
    Statute,
    FederalRegister,
    CongressionalRecord,
}

impl DocumentType {
    pub fn all() -> [DocumentType; 6] {
        [
            DocumentType::Bills,
            DocumentType::BillStatus,
            DocumentType::PublicLaw,
            DocumentType::Statute,
            DocumentType::FederalRegister,
            DocumentType::CongressionalRecord,
        ]
    }

    /// Collection tag as it appears in repository paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Bills => "BILLS",
            DocumentType::BillStatus => "BILLSTATUS",
            DocumentType::PublicLaw => "PLAW",
            DocumentType::Statute => "STATUTE",
            DocumentType::FederalRegister => "FR",
            DocumentType::CongressionalRecord => "CREC",
        }
    }

    /// Stem of the XSD file this collection validates against.
    pub fn schema_name(&self) -> &'static str {
        match self {
            DocumentType::Bills => "bills",
            DocumentType::BillStatus => "billstatus",
            DocumentType::PublicLaw => "plaw",
            DocumentType::Statute => "statute",
            DocumentType::FederalRegister => "fr",
            DocumentType::CongressionalRecord => "crec",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BILLS" => Ok(DocumentType::Bills),
            "BILLSTATUS" => Ok(DocumentType::BillStatus),
            "PLAW" => Ok(DocumentType::PublicLaw),
            "STATUTE" => Ok(DocumentType::Statute),
            "FR" => Ok(DocumentType::FederalRegister),
            "CREC" => Ok(DocumentType::CongressionalRecord),
            other => Err(anyhow!(
                "unknown document type {}, expected one of {}",
                other,
                DocumentType::all().map(|t| t.as_str()).join(", ")
            )),
        }
    }
}

/// A single remote file discovered during directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentReference {
    pub url: String,
    pub congress: u32,
    pub doc_type: DocumentType,
    /// Path under the output root where the file will be written.
    pub relative_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Completed,
    Failed,
    Skipped,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Skipped => "skipped",
        }
    }
}

/// Result of one download attempt. One per attempted URL per run.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub url: String,
    pub local_path: PathBuf,
    pub relative_path: PathBuf,
    pub status: DownloadStatus,
    pub error: Option<String>,
    pub size_bytes: u64,
    pub checksum: Option<String>,
    pub duration: Duration,
}

impl DownloadOutcome {
    pub fn completed(reference: &DocumentReference, local_path: PathBuf) -> Self {
        DownloadOutcome {
            url: reference.url.clone(),
            local_path,
            relative_path: reference.relative_path.clone(),
            status: DownloadStatus::Completed,
            error: None,
            size_bytes: 0,
            checksum: None,
            duration: Duration::ZERO,
        }
    }

    pub fn skipped(reference: &DocumentReference, local_path: PathBuf, reason: &str) -> Self {
        DownloadOutcome {
            url: reference.url.clone(),
            local_path,
            relative_path: reference.relative_path.clone(),
            status: DownloadStatus::Skipped,
            error: Some(reason.into()),
            size_bytes: 0,
            checksum: None,
            duration: Duration::ZERO,
        }
    }

    pub fn failed(reference: &DocumentReference, local_path: PathBuf, error: String) -> Self {
        DownloadOutcome {
            url: reference.url.clone(),
            local_path,
            relative_path: reference.relative_path.clone(),
            status: DownloadStatus::Failed,
            error: Some(error),
            size_bytes: 0,
            checksum: None,
            duration: Duration::ZERO,
        }
    }
}

/// Per (congress, document type) roll-up returned to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub bytes: u64,
}

impl PairSummary {
    pub fn from_outcomes(outcomes: &[DownloadOutcome]) -> Self {
        let mut summary = PairSummary {
            attempted: outcomes.len(),
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome.status {
                DownloadStatus::Completed => {
                    summary.succeeded += 1;
                    summary.bytes += outcome.size_bytes;
                }
                DownloadStatus::Failed => summary.failed += 1,
                DownloadStatus::Skipped => summary.skipped += 1,
            }
        }
        summary
    }
}
