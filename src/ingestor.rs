use std::{
    collections::BTreeMap,
    fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use futures::StreamExt;
use itertools::Itertools;
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT},
    Client,
};
use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    downloader::{DownloadOptions, DownloadWorker},
    lister::DirectoryLister,
    manifest::{self, FailureLog, Manifest},
    rate_limiter::RateLimiter,
    records::parser_for,
    tracking::TrackingStore,
    types::{DocumentReference, DocumentType, DownloadOutcome, DownloadStatus, PairSummary},
    utils,
    validator::XmlValidator,
};

/// Success counts per congress and document type.
pub type IngestReport = BTreeMap<u32, BTreeMap<DocumentType, PairSummary>>;

#[derive(Builder, Debug, Clone)]
#[builder(setter(into))]
pub struct IngestorOptions {
    #[builder(default = "self.default_base_url()")]
    base_url: String,
    output_dir: PathBuf,
    // simultaneous downloads within a pair
    #[builder(default = "10")]
    workers: usize,
    // outbound requests per second across the whole run
    #[builder(default = "10")]
    rate_limit: u32,
    #[builder(default = "30")]
    request_timeout_secs: u64,
    // total GET attempts per URL
    #[builder(default = "3")]
    retry_count: u32,
    #[builder(default = "5")]
    retry_delay_secs: u64,
    // listing recursion bound below each pair root
    #[builder(default = "4")]
    max_depth: u32,
    #[builder(default = "true")]
    validate_xml: bool,
    #[builder(default = "true")]
    dedup_by_checksum: bool,
    // re-fetch URLs the tracking store already marks completed
    #[builder(default = "false")]
    revalidate: bool,
    // run the per-collection metadata parsers over newly written files
    #[builder(default = "false")]
    extract_records: bool,
    #[builder(default = "self.default_schema_dir()")]
    schema_dir: PathBuf,
}

impl IngestorOptions {
    pub fn default_builder() -> IngestorOptionsBuilder {
        IngestorOptionsBuilder::default()
    }
}

impl IngestorOptionsBuilder {
    fn default_base_url(&self) -> String {
        utils::BASE_URL.clone()
    }
    fn default_schema_dir(&self) -> PathBuf {
        PathBuf::from("schemas")
    }
}

#[derive(Debug, Clone, Copy)]
enum PairState {
    Pending,
    Listing,
    Downloading,
    Finalized,
}

/// Drives the crawl -> download -> validate pipeline across the
/// cross-product of congress sessions and document types.
///
/// Pairs run sequentially; files within a pair download concurrently,
/// bounded by the semaphore and throttled by the one shared rate limiter.
pub struct Ingestor {
    options: IngestorOptions,
    lister: DirectoryLister,
    worker: Arc<DownloadWorker>,
    semaphore: Arc<Semaphore>,
}

impl Ingestor {
    pub fn new(options: IngestorOptions, tracker: Arc<dyn TrackingStore>) -> anyhow::Result<Ingestor> {
        fs::create_dir_all(&options.output_dir).context(format!(
            "could not create output directory {:?}",
            options.output_dir
        ))?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(utils::DEFAULT_ACCEPT));
        let client = Client::builder()
            .timeout(Duration::from_secs(options.request_timeout_secs))
            .user_agent(utils::USER_AGENT)
            .default_headers(headers)
            .build()
            .context("could not build http client")?;

        let limiter = Arc::new(RateLimiter::per_second(options.rate_limit));

        let validator = if options.validate_xml {
            Some(XmlValidator::new(&options.schema_dir)?)
        } else {
            None
        };

        let worker = DownloadWorker::new(
            client.clone(),
            limiter.clone(),
            tracker,
            validator,
            DownloadOptions {
                output_dir: options.output_dir.clone(),
                retry_count: options.retry_count,
                retry_delay: Duration::from_secs(options.retry_delay_secs),
                validate_xml: options.validate_xml,
                dedup_by_checksum: options.dedup_by_checksum,
                revalidate: options.revalidate,
            },
        )?;

        let lister = DirectoryLister::new(client, limiter, options.max_depth);
        let semaphore = Arc::new(Semaphore::new(options.workers.max(1)));

        Ok(Ingestor {
            options,
            lister,
            worker: Arc::new(worker),
            semaphore,
        })
    }

    pub fn total_bytes(&self) -> u64 {
        self.worker.total_bytes()
    }

    pub fn failed_urls(&self) -> Vec<String> {
        self.worker.failed_urls()
    }

    pub async fn run(
        &self,
        congresses: &[u32],
        doc_types: &[DocumentType],
        should_terminate: Arc<AtomicBool>,
    ) -> anyhow::Result<IngestReport> {
        let pairs: Vec<(u32, DocumentType)> = congresses
            .iter()
            .copied()
            .cartesian_product(doc_types.iter().copied())
            .collect();
        info!("processing {} (congress, document type) pair(s)", pairs.len());

        let mut report = IngestReport::new();
        for (congress, doc_type) in pairs {
            if should_terminate.load(Ordering::Relaxed) {
                warn!("termination requested, stopping before congress {} {}", congress, doc_type);
                break;
            }
            let summary = self
                .process_pair(congress, doc_type, &should_terminate)
                .await;
            report.entry(congress).or_default().insert(doc_type, summary);
        }
        Ok(report)
    }

    /// One (congress, doc type) pair. Errors are contained here: a pair
    /// that cannot be listed finalizes empty and its siblings proceed.
    async fn process_pair(
        &self,
        congress: u32,
        doc_type: DocumentType,
        should_terminate: &Arc<AtomicBool>,
    ) -> PairSummary {
        let pair_dir = self
            .options
            .output_dir
            .join(congress.to_string())
            .join(doc_type.as_str());

        if !self.options.revalidate {
            if let Some(previous) = manifest::read_manifest(&pair_dir) {
                if previous.is_complete() {
                    info!(
                        "congress {} {} already complete ({} of {} succeeded), skipping",
                        congress, doc_type, previous.succeeded, previous.attempted
                    );
                    return PairSummary {
                        attempted: previous.attempted,
                        skipped: previous.attempted,
                        ..Default::default()
                    };
                }
            }
        }

        let mut state = PairState::Pending;
        debug!("congress {} {}: {:?}", congress, doc_type, state);

        state = PairState::Listing;
        debug!("congress {} {}: {:?}", congress, doc_type, state);
        let root = format!(
            "{}/{}/{}/",
            self.options.base_url.trim_end_matches('/'),
            doc_type.as_str(),
            congress
        );
        let urls = match self.lister.list_documents(&root, doc_type.as_str()).await {
            Ok(urls) => urls,
            Err(e) => {
                warn!("could not list congress {} {}: {}", congress, doc_type, e);
                state = PairState::Finalized;
                debug!("congress {} {}: {:?}", congress, doc_type, state);
                return PairSummary::default();
            }
        };
        if urls.is_empty() {
            warn!("no documents found for {} in congress {}", doc_type, congress);
            let manifest = Manifest::from_outcomes(congress, doc_type.as_str(), &[]);
            let failures = FailureLog::from_outcomes(&[]);
            if let Err(e) = manifest::write_pair_reports(&pair_dir, &manifest, &failures) {
                error!("could not write reports for congress {} {}: {}", congress, doc_type, e);
            }
            state = PairState::Finalized;
            debug!("congress {} {}: {:?}", congress, doc_type, state);
            return PairSummary::default();
        }

        state = PairState::Downloading;
        debug!("congress {} {}: {:?}", congress, doc_type, state);

        let mut references: Vec<DocumentReference> = urls
            .into_iter()
            .filter_map(|url| match reqwest::Url::parse(&url) {
                Ok(parsed) => Some(DocumentReference {
                    relative_path: utils::relative_document_path(
                        &parsed,
                        congress,
                        doc_type.as_str(),
                    ),
                    url,
                    congress,
                    doc_type,
                }),
                Err(e) => {
                    warn!("discarding unparseable url {}: {}", url, e);
                    None
                }
            })
            .collect();
        references.sort_by(|a, b| a.url.cmp(&b.url));

        let total = references.len();
        info!("congress {} {}: {} document(s) to fetch", congress, doc_type, total);

        let outcomes = self.download_all(references, should_terminate).await;

        // join point: every outcome for the pair is known before any
        // report is computed
        let summary = PairSummary::from_outcomes(&outcomes);

        if should_terminate.load(Ordering::Relaxed) {
            warn!(
                "run interrupted, not writing reports for congress {} {}",
                congress, doc_type
            );
            return summary;
        }

        let manifest = Manifest::from_outcomes(congress, doc_type.as_str(), &outcomes);
        let failures = FailureLog::from_outcomes(&outcomes);
        if !failures.failed_urls.is_empty() {
            let preview = failures
                .failed_urls
                .iter()
                .take(10)
                .map(|f| format!("{} ({})", f.url, f.error))
                .join(", ");
            let rest = failures.failed_urls.len().saturating_sub(10);
            warn!(
                "{} failure(s) for congress {} {}: {}{}",
                failures.failed_urls.len(),
                congress,
                doc_type,
                preview,
                if rest > 0 {
                    format!(" and {} more", rest)
                } else {
                    String::new()
                }
            );
        }
        if let Err(e) = manifest::write_pair_reports(&pair_dir, &manifest, &failures) {
            error!("could not write reports for congress {} {}: {}", congress, doc_type, e);
        }

        if self.options.extract_records {
            self.extract_records(doc_type, &outcomes).await;
        }

        state = PairState::Finalized;
        debug!("congress {} {}: {:?}", congress, doc_type, state);
        info!(
            "congress {} {}: {} succeeded, {} failed, {} skipped of {}",
            congress, doc_type, summary.succeeded, summary.failed, summary.skipped, total
        );
        summary
    }

    /// Feed the pair's references through a channel drained by a bounded
    /// concurrent consumer, and collect one outcome per reference.
    async fn download_all(
        &self,
        references: Vec<DocumentReference>,
        should_terminate: &Arc<AtomicBool>,
    ) -> Vec<DownloadOutcome> {
        let total = references.len();
        let concurrency = self.options.workers.max(1);
        let (ref_tx, ref_rx) = mpsc::channel::<DocumentReference>(concurrency * 2);
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<DownloadOutcome>();

        let worker = self.worker.clone();
        let semaphore = self.semaphore.clone();
        let terminate = should_terminate.clone();
        let output_dir = self.options.output_dir.clone();

        let driver = tokio::spawn(async move {
            ReceiverStream::new(ref_rx)
                .for_each_concurrent(concurrency, |reference| {
                    let worker = worker.clone();
                    let semaphore = semaphore.clone();
                    let outcome_tx = outcome_tx.clone();
                    let terminate = terminate.clone();
                    let output_dir = output_dir.clone();
                    async move {
                        let outcome = if terminate.load(Ordering::Relaxed) {
                            let local_path = output_dir.join(&reference.relative_path);
                            DownloadOutcome::skipped(&reference, local_path, "interrupted")
                        } else {
                            let _permit = match semaphore.acquire().await {
                                Ok(permit) => permit,
                                Err(_) => return,
                            };
                            worker.download(&reference).await
                        };
                        if outcome_tx.send(outcome).is_err() {
                            error!("could not report outcome, receiver dropped");
                        }
                    }
                })
                .await;
        });

        for reference in references {
            if ref_tx.send(reference).await.is_err() {
                error!("download queue closed early");
                break;
            }
        }
        drop(ref_tx);

        let mut outcomes = Vec::with_capacity(total);
        while let Some(outcome) = outcome_rx.recv().await {
            outcomes.push(outcome);
        }
        if let Err(e) = driver.await {
            error!("download driver task failed: {}", e);
        }
        outcomes
    }

    async fn extract_records(&self, doc_type: DocumentType, outcomes: &[DownloadOutcome]) {
        let parser = parser_for(doc_type);
        let mut extracted = 0usize;
        let mut unparsed = 0usize;

        for outcome in outcomes
            .iter()
            .filter(|o| o.status == DownloadStatus::Completed)
        {
            match tokio::fs::read_to_string(&outcome.local_path).await {
                Ok(content) => match parser.parse(&outcome.local_path, &content) {
                    Some(_) => extracted += 1,
                    None => {
                        debug!("no metadata extracted from {:?}", outcome.local_path);
                        unparsed += 1;
                    }
                },
                Err(e) => {
                    debug!("could not read {:?} for extraction: {}", outcome.local_path, e);
                    unparsed += 1;
                }
            }
        }

        info!(
            "{}: extracted metadata from {} of {} new file(s)",
            doc_type,
            extracted,
            extracted + unparsed
        );
    }
}
