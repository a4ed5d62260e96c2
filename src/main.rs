use std::{
    path::PathBuf,
    str::FromStr,
    sync::{atomic::AtomicBool, Arc},
    time::Instant,
};

use anyhow::Context;
use clap::Parser;
use govinfo_ingestor::{
    ingestor::{IngestReport, Ingestor, IngestorOptions},
    tracking::{JsonFileStore, SqliteStore, TrackingStore},
    types::DocumentType,
};
use log::{debug, info};
use signal_hook::consts::{SIGINT, SIGTERM};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "GovInfo bulk data ingestion CLI", long_about = None)]
struct Args {
    /// Congress numbers to process (default: 113 through 119)
    #[arg(short = 'c', long = "congress", num_args = 1..)]
    congresses: Vec<u32>,
    /// Document types to process (default: all)
    #[arg(short = 't', long = "doc-types", num_args = 1..)]
    doc_types: Vec<String>,
    /// Output directory (default: $GOVINFO_DATA_DIR or govinfo_data)
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
    /// Number of parallel downloads
    #[arg(short = 'w', long)]
    workers: Option<usize>,
    /// Maximum outbound requests per second
    #[arg(long)]
    rate_limit: Option<u32>,
    /// HTTP request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,
    /// GET attempts per URL before recording a failure
    #[arg(short = 'r', long, default_value_t = 3)]
    retries: u32,
    /// Base delay between retry attempts in seconds
    #[arg(long, default_value_t = 5)]
    retry_delay: u64,
    /// Directory listing recursion bound
    #[arg(long, default_value_t = 4)]
    max_depth: u32,
    /// Skip XML schema validation of downloaded files
    #[arg(long, default_value_t = false)]
    no_validate: bool,
    /// Keep files whose content matches an already recorded download
    #[arg(long, default_value_t = false)]
    no_dedup: bool,
    /// Directory holding XSD schemas
    #[arg(long, default_value = "schemas")]
    schema_dir: PathBuf,
    /// Tracking store backend
    #[arg(long, default_value = "sqlite", value_parser = ["sqlite", "json"])]
    tracker: String,
    /// Re-fetch URLs the tracking store already marks completed
    #[arg(long, default_value_t = false)]
    revalidate: bool,
    /// Run the per-collection metadata parsers over newly written files
    #[arg(long, default_value_t = false)]
    extract_records: bool,
}

fn env_parsed<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();

    let congresses: Vec<u32> = if args.congresses.is_empty() {
        (113..=119).collect()
    } else {
        args.congresses.clone()
    };

    let doc_types: Vec<DocumentType> = if args.doc_types.is_empty() {
        DocumentType::all().to_vec()
    } else {
        args.doc_types
            .iter()
            .map(|s| s.parse())
            .collect::<anyhow::Result<Vec<_>>>()?
    };

    let output = args
        .output
        .clone()
        .or_else(|| env_parsed::<PathBuf>("GOVINFO_DATA_DIR"))
        .unwrap_or_else(|| PathBuf::from("govinfo_data"));
    let workers = args
        .workers
        .or_else(|| env_parsed("GOVINFO_WORKERS"))
        .unwrap_or(10);
    let rate_limit = args
        .rate_limit
        .or_else(|| env_parsed("GOVINFO_RATE_LIMIT"))
        .unwrap_or(10);
    let validate_xml = !args.no_validate
        && env_parsed::<String>("GOVINFO_VALIDATE_XML")
            .map(|v| v.to_ascii_lowercase() == "true")
            .unwrap_or(true);

    info!(
        "starting ingestion | congresses: {:?} | doc types: {:?} | workers: {} | output: {:?}",
        congresses, doc_types, workers, output
    );

    let tracker: Arc<dyn TrackingStore> = match args.tracker.as_str() {
        "json" => Arc::new(
            JsonFileStore::open(&output.join("downloads.json"))
                .context("could not open tracking file")?,
        ),
        _ => Arc::new(
            SqliteStore::open(&output.join("downloads.db"))
                .context("could not open tracking database")?,
        ),
    };

    let options = IngestorOptions::default_builder()
        .output_dir(output.clone())
        .workers(workers)
        .rate_limit(rate_limit)
        .request_timeout_secs(args.timeout)
        .retry_count(args.retries)
        .retry_delay_secs(args.retry_delay)
        .max_depth(args.max_depth)
        .validate_xml(validate_xml)
        .dedup_by_checksum(!args.no_dedup)
        .revalidate(args.revalidate)
        .extract_records(args.extract_records)
        .schema_dir(args.schema_dir.clone())
        .build()?;

    debug!("resolved options: {:#?}", options);

    let ingestor = Ingestor::new(options, tracker)?;

    let should_terminate = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGTERM, Arc::clone(&should_terminate))?;
    signal_hook::flag::register(SIGINT, Arc::clone(&should_terminate))?;

    let started = Instant::now();
    let report = ingestor
        .run(&congresses, &doc_types, should_terminate)
        .await?;

    print_summary(&report, &ingestor, &output, started);

    Ok(())
}

fn print_summary(report: &IngestReport, ingestor: &Ingestor, output: &PathBuf, started: Instant) {
    println!("\n=== GovInfo Ingestion Summary ===\n");
    println!(
        "{:<10} {:<12} {:>9} {:>9} {:>8} {:>8}",
        "Congress", "DocType", "Attempted", "Succeeded", "Failed", "Skipped"
    );

    let mut attempted = 0;
    let mut succeeded = 0;
    let mut failed = 0;
    let mut skipped = 0;
    for (congress, by_type) in report {
        for (doc_type, summary) in by_type {
            println!(
                "{:<10} {:<12} {:>9} {:>9} {:>8} {:>8}",
                congress,
                doc_type.as_str(),
                summary.attempted,
                summary.succeeded,
                summary.failed,
                summary.skipped
            );
            attempted += summary.attempted;
            succeeded += summary.succeeded;
            failed += summary.failed;
            skipped += summary.skipped;
        }
    }

    println!(
        "\nTotals: {} attempted, {} succeeded, {} failed, {} skipped",
        attempted, succeeded, failed, skipped
    );
    println!(
        "Downloaded {:.2} MB in {:.1}s",
        ingestor.total_bytes() as f64 / (1024.0 * 1024.0),
        started.elapsed().as_secs_f64()
    );

    let failed_urls = ingestor.failed_urls();
    if !failed_urls.is_empty() {
        println!("\nFailed URLs ({}):", failed_urls.len());
        for url in failed_urls.iter().take(10) {
            println!("  - {}", url);
        }
        if failed_urls.len() > 10 {
            println!("  ... and {} more", failed_urls.len() - 10);
        }
    }

    println!(
        "\nPer-pair manifests and failure logs are under {:?}/<congress>/<doctype>/",
        output
    );
}
