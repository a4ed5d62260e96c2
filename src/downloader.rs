use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use sha2::{Digest, Sha256};
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncWriteExt},
};
use tokio_retry::RetryIf;

use crate::{
    rate_limiter::RateLimiter,
    tracking::TrackingStore,
    types::{DocumentReference, DownloadOutcome, IngestError},
    utils::{jitter, linear_backoff, WILDCARD_ACCEPT},
    validator::XmlValidator,
};

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub output_dir: PathBuf,
    /// Total GET attempts per URL.
    pub retry_count: u32,
    /// Base of the linear backoff between attempts.
    pub retry_delay: Duration,
    pub validate_xml: bool,
    /// Elide files whose checksum was already recorded for another URL.
    pub dedup_by_checksum: bool,
    /// Ignore the tracking store's completed set and fetch everything
    /// again (resume with revalidation).
    pub revalidate: bool,
}

/// Fetches single documents to deterministic local paths.
///
/// One worker instance is shared by every concurrent download task; the
/// tracking sets and byte counter are the only mutable state, each behind
/// its own lock.
pub struct DownloadWorker {
    client: Client,
    limiter: Arc<RateLimiter>,
    tracker: Arc<dyn TrackingStore>,
    validator: Option<XmlValidator>,
    options: DownloadOptions,
    completed: Mutex<HashSet<String>>,
    failed: Mutex<HashSet<String>>,
    total_bytes: AtomicU64,
}

impl DownloadWorker {
    pub fn new(
        client: Client,
        limiter: Arc<RateLimiter>,
        tracker: Arc<dyn TrackingStore>,
        validator: Option<XmlValidator>,
        options: DownloadOptions,
    ) -> anyhow::Result<DownloadWorker> {
        let completed = if options.revalidate {
            info!("revalidation forced, ignoring previously completed downloads");
            HashSet::new()
        } else {
            let urls = tracker
                .completed_urls()
                .context("could not load completed downloads from tracking store")?;
            info!("{} completed URL(s) loaded from tracking store", urls.len());
            urls
        };

        Ok(DownloadWorker {
            client,
            limiter,
            tracker,
            validator,
            options,
            completed: Mutex::new(completed),
            failed: Mutex::new(HashSet::new()),
            total_bytes: AtomicU64::new(0),
        })
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// URLs that exhausted their retries this run.
    pub fn failed_urls(&self) -> Vec<String> {
        let failed = self.failed.lock().expect("failed set lock poisoned");
        failed.iter().cloned().collect()
    }

    pub async fn download(&self, reference: &DocumentReference) -> DownloadOutcome {
        let started = Instant::now();
        let local_path = self.options.output_dir.join(&reference.relative_path);

        {
            let completed = self.completed.lock().expect("completed set lock poisoned");
            if completed.contains(&reference.url) {
                debug!("already downloaded, skipping {}", reference.url);
                return DownloadOutcome::skipped(reference, local_path, "already downloaded");
            }
        }

        if let Some(parent) = local_path.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                let error = format!("could not create {:?}: {}", parent, e);
                return self.fail(reference, local_path, error, started);
            }
        }

        let strategy =
            linear_backoff(self.options.retry_delay, self.options.retry_count).map(jitter);
        let fetched = RetryIf::spawn(
            strategy,
            || self.attempt(&reference.url, &local_path),
            |e: &IngestError| e.is_transient(),
        )
        .await;

        let size_bytes = match fetched {
            Ok(size) => size,
            Err(e) => return self.fail(reference, local_path, e.to_string(), started),
        };

        let checksum = match self.file_checksum(&local_path).await {
            Ok(checksum) => checksum,
            Err(e) => {
                discard(&local_path).await;
                return self.fail(reference, local_path, e.to_string(), started);
            }
        };

        if let Err(errors) = self.validate(reference, &local_path).await {
            discard(&local_path).await;
            error!("removed invalid file {:?}", local_path);
            let preview = errors.iter().take(3).cloned().collect::<Vec<_>>().join("; ");
            let error = if errors.len() > 3 {
                format!("{} (and {} more)", preview, errors.len() - 3)
            } else {
                preview
            };
            return self.fail(
                reference,
                local_path,
                IngestError::Validation(error).to_string(),
                started,
            );
        }

        if self.options.dedup_by_checksum {
            match self.tracker.checksum_owner(&checksum) {
                Ok(Some(owner)) if owner != reference.url => {
                    discard(&local_path).await;
                    warn!(
                        "duplicate content: {} matches checksum of {}",
                        reference.url, owner
                    );
                    let outcome =
                        DownloadOutcome::skipped(reference, local_path, "duplicate content");
                    self.record(&outcome);
                    return outcome;
                }
                Ok(_) => {}
                Err(e) => warn!("checksum lookup failed for {}: {}", reference.url, e),
            }
        }

        let mut outcome = DownloadOutcome::completed(reference, local_path);
        outcome.size_bytes = size_bytes;
        outcome.checksum = Some(checksum);
        outcome.duration = started.elapsed();

        {
            let mut completed = self.completed.lock().expect("completed set lock poisoned");
            completed.insert(reference.url.clone());
        }
        self.record(&outcome);

        info!(
            "downloaded {} ({} bytes, {:.2}s)",
            reference.url,
            size_bytes,
            outcome.duration.as_secs_f64()
        );
        outcome
    }

    /// One GET attempt: rate-limited, streamed to disk, partial writes
    /// discarded. Transient errors bubble up for the retry policy.
    async fn attempt(&self, url: &str, local_path: &Path) -> Result<u64, IngestError> {
        self.limiter
            .acquire()
            .await
            .map_err(|e| IngestError::Fatal(e.to_string()))?;

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(IngestError::from_transport)?;

        if response.status() == StatusCode::NOT_ACCEPTABLE {
            debug!("406 from {}, retrying with wildcard accept", url);
            self.limiter
                .acquire()
                .await
                .map_err(|e| IngestError::Fatal(e.to_string()))?;
            response = self
                .client
                .get(url)
                .header(header::ACCEPT, WILDCARD_ACCEPT)
                .send()
                .await
                .map_err(IngestError::from_transport)?;
            if response.status() == StatusCode::NOT_ACCEPTABLE {
                return Err(IngestError::Permanent(format!(
                    "HTTP 406 for {} even with wildcard accept header",
                    url
                )));
            }
        }

        if response.status() == StatusCode::NOT_FOUND {
            return Err(IngestError::Permanent(format!("HTTP 404 for {}", url)));
        }
        if !response.status().is_success() {
            return Err(IngestError::from_status(response.status(), url));
        }

        let mut file = fs::File::create(local_path)
            .await
            .map_err(|e| IngestError::Transient(format!("could not create {:?}: {}", local_path, e)))?;

        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    drop(file);
                    discard(local_path).await;
                    return Err(IngestError::from_transport(e));
                }
            };
            if let Err(e) = file.write_all(&bytes).await {
                drop(file);
                discard(local_path).await;
                return Err(IngestError::Transient(format!(
                    "write to {:?} failed: {}",
                    local_path, e
                )));
            }
            written += bytes.len() as u64;
            self.total_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        }

        if let Err(e) = file.flush().await {
            drop(file);
            discard(local_path).await;
            return Err(IngestError::Transient(format!(
                "flush of {:?} failed: {}",
                local_path, e
            )));
        }

        Ok(written)
    }

    async fn validate(
        &self,
        reference: &DocumentReference,
        local_path: &Path,
    ) -> Result<(), Vec<String>> {
        if !self.options.validate_xml {
            return Ok(());
        }
        let validator = match &self.validator {
            Some(v) => v,
            None => return Ok(()),
        };
        let schema = reference.doc_type.schema_name();
        if !validator.has_schema(schema) {
            return Ok(());
        }

        let content = fs::read_to_string(local_path)
            .await
            .map_err(|e| vec![format!("could not read {:?}: {}", local_path, e)])?;
        validator.validate(&content, schema)
    }

    async fn file_checksum(&self, path: &Path) -> anyhow::Result<String> {
        let mut file = fs::File::open(path)
            .await
            .context(format!("could not open {:?} for checksum", path))?;
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 8192];
        loop {
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        let digest = hasher.finalize();
        Ok(digest.iter().fold(String::new(), |mut acc, byte| {
            acc.push_str(&format!("{:02x}", byte));
            acc
        }))
    }

    fn fail(
        &self,
        reference: &DocumentReference,
        local_path: PathBuf,
        error: String,
        started: Instant,
    ) -> DownloadOutcome {
        error!("failed to download {}: {}", reference.url, error);
        {
            let mut failed = self.failed.lock().expect("failed set lock poisoned");
            failed.insert(reference.url.clone());
        }
        let mut outcome = DownloadOutcome::failed(reference, local_path, error);
        outcome.duration = started.elapsed();
        self.record(&outcome);
        outcome
    }

    fn record(&self, outcome: &DownloadOutcome) {
        if let Err(e) = self.tracker.record(outcome) {
            warn!("could not record outcome for {}: {}", outcome.url, e);
        }
    }
}

async fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        debug!("could not remove {:?}: {}", path, e);
    }
}
