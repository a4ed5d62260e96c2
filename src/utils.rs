use std::{path::PathBuf, time::Duration};

use rand::Rng;
use reqwest::Url;

pub const DEFAULT_BASE_URL: &str = "https://www.govinfo.gov/bulkdata";
pub const USER_AGENT: &str = concat!("govinfo-ingestor/", env!("CARGO_PKG_VERSION"));

/// Extensions worth downloading from a listing. Everything else is noise
/// (zip bundles, sitemap fragments, render artifacts).
pub const ALLOWED_EXTENSIONS: &[&str] = &[".xml", ".xsl", ".xsd"];

pub const DEFAULT_ACCEPT: &str = "application/xml,text/xml,application/json,*/*";
pub const XML_ACCEPT: &str = "application/xml,*/*";
pub const JSON_ACCEPT: &str = "application/json";
pub const WILDCARD_ACCEPT: &str = "*/*";

lazy_static! {
    pub static ref BASE_URL: String = {
        match std::env::var("GOVINFO_BASE_URL") {
            Ok(url) if !url.is_empty() => url.trim_end_matches('/').to_string(),
            _ => DEFAULT_BASE_URL.into(),
        }
    };
}

/// Rewrite a directory URL to its structured listing endpoint
/// (`…/bulkdata/X` -> `…/bulkdata/xml/X` or `…/bulkdata/json/X`).
/// URLs outside the repository layout are returned unchanged.
pub fn listing_endpoint(url: &str, format: &str) -> String {
    url.replacen("/bulkdata/", &format!("/bulkdata/{}/", format), 1)
}

pub fn has_allowed_extension(url: &str) -> bool {
    let path = url.split(&['?', '#'][..]).next().unwrap_or(url);
    let lower = path.to_ascii_lowercase();
    ALLOWED_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Coarse data-type tag recorded in the tracking store.
pub fn data_type_of(url: &str) -> &'static str {
    let lower = url.to_ascii_lowercase();
    if lower.ends_with(".xml") {
        "xml"
    } else if lower.ends_with(".xsl") {
        "xsl"
    } else if lower.ends_with(".xsd") {
        "xsd"
    } else {
        "other"
    }
}

/// Collection tag from a repository URL, for tracking-store bookkeeping.
pub fn collection_of(url: &Url) -> String {
    let mut segments = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()))
        .into_iter()
        .flatten();
    match segments.find(|s| *s == "bulkdata") {
        Some(_) => segments.next().unwrap_or("unknown").to_string(),
        None => "unknown".to_string(),
    }
}

/// Deterministic local path for a document URL, rooted at
/// `<congress>/<doc_type>/`. Path segments between the congress segment
/// and the filename are preserved so nested listings (session, bill
/// subtype) keep their shape on disk.
pub fn relative_document_path(url: &Url, congress: u32, doc_type: &str) -> PathBuf {
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| {
            s.filter(|p| !p.is_empty() && !p.starts_with('.'))
                .collect()
        })
        .unwrap_or_default();

    let congress_str = congress.to_string();
    let mut tail: &[&str] = &segments;
    if let Some(i) = segments.iter().position(|s| *s == doc_type) {
        tail = &segments[i + 1..];
        if tail.first() == Some(&congress_str.as_str()) {
            tail = &tail[1..];
        }
    } else if segments.first() == Some(&"bulkdata") {
        tail = &segments[1..];
    }

    let mut path = PathBuf::from(congress_str);
    path.push(doc_type);
    for segment in tail {
        path.push(segment);
    }
    path
}

/// Linear backoff schedule: `delay`, `2*delay`, … between attempts, for
/// `retry_count` total attempts. Apply [`jitter`] at the call site.
pub fn linear_backoff(delay: Duration, retry_count: u32) -> impl Iterator<Item = Duration> {
    (1..retry_count.max(1)).map(move |attempt| delay * attempt)
}

/// Spread retries out a little so workers hitting the same failure don't
/// reissue in lockstep.
pub fn jitter(duration: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    duration.mul_f64(rng.gen_range(0.8..1.2))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rewrites_listing_endpoint() {
        assert_eq!(
            listing_endpoint("https://www.govinfo.gov/bulkdata/BILLS/119/", "xml"),
            "https://www.govinfo.gov/bulkdata/xml/BILLS/119/"
        );
        assert_eq!(
            listing_endpoint("https://www.govinfo.gov/bulkdata/BILLS/119/", "json"),
            "https://www.govinfo.gov/bulkdata/json/BILLS/119/"
        );
        // not part of the repository layout: unchanged
        assert_eq!(
            listing_endpoint("https://example.com/other/", "xml"),
            "https://example.com/other/"
        );
    }

    #[test]
    fn filters_extensions() {
        assert!(has_allowed_extension("https://x/BILLS-119hr1ih.xml"));
        assert!(has_allowed_extension("https://x/style.XSL"));
        assert!(has_allowed_extension("https://x/bill.xsd?v=2"));
        assert!(!has_allowed_extension("https://x/BILLS.zip"));
        assert!(!has_allowed_extension("https://x/index.html"));
    }

    #[test]
    fn derives_nested_relative_path() {
        let url = Url::parse("https://www.govinfo.gov/bulkdata/BILLS/119/1/hr/BILLS-119hr1ih.xml")
            .unwrap();
        assert_eq!(
            relative_document_path(&url, 119, "BILLS"),
            PathBuf::from("119/BILLS/1/hr/BILLS-119hr1ih.xml")
        );
    }

    #[test]
    fn derives_flat_relative_path() {
        let url =
            Url::parse("https://www.govinfo.gov/bulkdata/PLAW/113/PLAW-113publ1.xml").unwrap();
        assert_eq!(
            relative_document_path(&url, 113, "PLAW"),
            PathBuf::from("113/PLAW/PLAW-113publ1.xml")
        );
    }

    #[test]
    fn falls_back_when_collection_absent() {
        let url = Url::parse("https://mirror.example.com/bulkdata/odd/file.xml").unwrap();
        assert_eq!(
            relative_document_path(&url, 118, "STATUTE"),
            PathBuf::from("118/STATUTE/odd/file.xml")
        );
    }

    #[test]
    fn backoff_is_linear() {
        let steps: Vec<Duration> = linear_backoff(Duration::from_secs(5), 4).collect();
        assert_eq!(
            steps,
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(15)
            ]
        );
        // a single attempt has no retries
        assert_eq!(linear_backoff(Duration::from_secs(5), 1).count(), 0);
    }

    #[test]
    fn jitter_stays_near_input() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let jittered = jitter(base);
            assert!(jittered >= Duration::from_secs(8));
            assert!(jittered <= Duration::from_secs(12));
        }
    }

    #[test]
    fn extracts_collection_and_data_type() {
        let url = Url::parse("https://www.govinfo.gov/bulkdata/BILLS/119/1/a.xml").unwrap();
        assert_eq!(collection_of(&url), "BILLS");
        assert_eq!(data_type_of(url.as_str()), "xml");
        assert_eq!(data_type_of("https://x/common.xsl"), "xsl");
        assert_eq!(data_type_of("https://x/readme.txt"), "other");
    }
}
