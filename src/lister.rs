use std::{collections::HashSet, sync::Arc};

use anyhow::{anyhow, Context};
use quick_xml::{events::Event, Reader};
use reqwest::{header, Client, StatusCode, Url};
use scraper::{Html, Selector};
use serde_json::Value;

use crate::{
    rate_limiter::RateLimiter,
    types::IngestError,
    utils::{
        has_allowed_extension, listing_endpoint, JSON_ACCEPT, WILDCARD_ACCEPT, XML_ACCEPT,
    },
};

/// One row of a directory listing, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub link: String,
    pub folder: bool,
}

/// Resolves a collection's remote file tree into a flat set of document
/// URLs.
///
/// For each directory node three strategies are tried in order: the
/// structured XML listing endpoint, the structured JSON listing endpoint,
/// and finally anchor-scraping the rendered HTML page. The repository's
/// listings are inconsistent enough that all three see real use.
pub struct DirectoryLister {
    client: Client,
    limiter: Arc<RateLimiter>,
    max_depth: u32,
}

impl DirectoryLister {
    pub fn new(client: Client, limiter: Arc<RateLimiter>, max_depth: u32) -> DirectoryLister {
        DirectoryLister {
            client,
            limiter,
            max_depth,
        }
    }

    /// Every document URL reachable beneath `root_url`, recursively,
    /// deduplicated. Subdirectories deeper than `max_depth` levels below
    /// the root are dropped without error.
    pub async fn list_documents(
        &self,
        root_url: &str,
        collection: &str,
    ) -> anyhow::Result<HashSet<String>> {
        let mut discovered: HashSet<String> = HashSet::new();
        let mut seen_dirs: HashSet<String> = HashSet::new();
        let mut queue: Vec<(String, u32)> = vec![(root_url.to_string(), 0)];
        seen_dirs.insert(root_url.to_string());

        while let Some((url, depth)) = queue.pop() {
            if depth > self.max_depth {
                debug!("not descending into {} (depth {} exceeds bound)", url, depth);
                continue;
            }

            let entries = match self.list_directory(&url, collection).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("could not list {}: {}", url, e);
                    continue;
                }
            };

            for entry in entries {
                if entry.folder {
                    if seen_dirs.insert(entry.link.clone()) {
                        queue.push((entry.link, depth + 1));
                    }
                } else if has_allowed_extension(&entry.link) {
                    discovered.insert(entry.link);
                } else {
                    debug!("skipping unsupported file {}", entry.link);
                }
            }
        }

        debug!(
            "{} document(s) discovered under {}",
            discovered.len(),
            root_url
        );
        Ok(discovered)
    }

    /// List a single directory node, falling through the strategies.
    async fn list_directory(
        &self,
        url: &str,
        collection: &str,
    ) -> Result<Vec<ListingEntry>, IngestError> {
        let base = Url::parse(url)
            .map_err(|e| IngestError::Listing(format!("invalid directory url {}: {}", url, e)))?;

        let xml_endpoint = listing_endpoint(url, "xml");
        match self.fetch_listing(&xml_endpoint, XML_ACCEPT).await {
            Ok(body) => match parse_xml_listing(&body, &base) {
                Ok(entries) => return Ok(entries),
                Err(e) => debug!("XML listing at {} unusable: {}", xml_endpoint, e),
            },
            Err(e) => debug!("XML listing at {} unavailable: {}", xml_endpoint, e),
        }

        let json_endpoint = listing_endpoint(url, "json");
        match self.fetch_listing(&json_endpoint, JSON_ACCEPT).await {
            Ok(body) => match parse_json_listing(&body, &base) {
                Ok(entries) => return Ok(entries),
                Err(e) => debug!("JSON listing at {} unusable: {}", json_endpoint, e),
            },
            Err(e) => debug!("JSON listing at {} unavailable: {}", json_endpoint, e),
        }

        let body = self.fetch_listing(url, WILDCARD_ACCEPT).await.map_err(|e| {
            IngestError::Listing(format!("all listing strategies failed for {}: {}", url, e))
        })?;
        Ok(parse_html_listing(&body, &base, collection))
    }

    /// Rate-limited GET of a listing endpoint. A 406 on the preferred
    /// Accept header gets one more try with a wildcard before counting as
    /// a failure.
    async fn fetch_listing(&self, url: &str, accept: &str) -> Result<String, IngestError> {
        self.limiter
            .acquire()
            .await
            .map_err(|e| IngestError::Fatal(e.to_string()))?;

        let mut response = self
            .client
            .get(url)
            .header(header::ACCEPT, accept)
            .send()
            .await
            .map_err(IngestError::from_transport)?;

        if response.status() == StatusCode::NOT_ACCEPTABLE && accept != WILDCARD_ACCEPT {
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
        }

        if !response.status().is_success() {
            return Err(IngestError::from_status(response.status(), url));
        }
        response.text().await.map_err(IngestError::from_transport)
    }
}

/// Parse the structured XML listing: repeated
/// `<file><name/><link/><folder/></file>` elements. A listing without a
/// single `<file>` element is treated as a parse failure so HTML served
/// with the wrong content type falls through to the next strategy.
pub fn parse_xml_listing(xml: &str, base: &Url) -> anyhow::Result<Vec<ListingEntry>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut entries = Vec::new();
    let mut saw_file_element = false;
    let mut in_file = false;
    let mut current_tag: Option<String> = None;
    let mut name: Option<String> = None;
    let mut link: Option<String> = None;
    let mut folder = false;

    loop {
        match reader
            .read_event()
            .map_err(|e| anyhow!("invalid listing XML: {}", e))?
        {
            Event::Start(e) => {
                let tag = local_name(e.name().as_ref()).to_string();
                if tag == "file" {
                    saw_file_element = true;
                    in_file = true;
                    name = None;
                    link = None;
                    folder = false;
                } else if in_file {
                    current_tag = Some(tag);
                }
            }
            Event::Text(t) => {
                if in_file {
                    let text = t
                        .unescape()
                        .map_err(|e| anyhow!("invalid listing XML: {}", e))?
                        .trim()
                        .to_string();
                    match current_tag.as_deref() {
                        Some("name") => name = Some(text),
                        Some("link") => link = Some(text),
                        Some("folder") => folder = text.eq_ignore_ascii_case("true"),
                        _ => {}
                    }
                }
            }
            Event::End(e) => {
                let tag = local_name(e.name().as_ref()).to_string();
                if tag == "file" {
                    in_file = false;
                    if let Some(entry) = resolve_entry(base, link.take(), name.take(), folder) {
                        entries.push(entry);
                    }
                } else {
                    current_tag = None;
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_file_element {
        return Err(anyhow!("no file elements in listing"));
    }
    Ok(entries)
}

/// Parse the structured JSON listing. Two shapes occur in the wild: a
/// bare array of entries, and an object with a `files` array. Entries
/// carry `link` or `path` plus a `folder` boolean.
pub fn parse_json_listing(json: &str, base: &Url) -> anyhow::Result<Vec<ListingEntry>> {
    let value: Value = serde_json::from_str(json).context("listing is not valid JSON")?;

    let items = match &value {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("files") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => return Err(anyhow!("JSON listing has no files array")),
        },
        _ => return Err(anyhow!("unexpected JSON listing shape")),
    };

    let mut entries = Vec::new();
    for item in items {
        let obj = match item.as_object() {
            Some(obj) => obj,
            None => continue,
        };
        let folder = obj.get("folder").and_then(Value::as_bool).unwrap_or(false);
        let link = obj.get("link").and_then(Value::as_str).map(String::from);
        let name = obj.get("path").and_then(Value::as_str).map(String::from);
        if let Some(entry) = resolve_entry(base, link, name, folder) {
            entries.push(entry);
        }
    }
    Ok(entries)
}

/// Scrape anchors from a rendered directory page. An anchor is a
/// subdirectory when it ends in `/` and stays inside the current
/// collection, which keeps the crawl from escaping into unrelated
/// collections or walking upward out of the tree.
pub fn parse_html_listing(html: &str, base: &Url, collection: &str) -> Vec<ListingEntry> {
    let document = Html::parse_document(html);
    let selector = match Selector::parse("a[href]") {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };

    let mut entries = Vec::new();
    for anchor in document.select(&selector) {
        let href = match anchor.value().attr("href") {
            Some(href) => href,
            None => continue,
        };
        let resolved = match base.join(href) {
            Ok(url) => url,
            Err(_) => continue,
        };
        let link = resolved.to_string();

        if link.ends_with('/') {
            if link.contains(collection) && link != base.as_str() {
                entries.push(ListingEntry { link, folder: true });
            }
        } else if has_allowed_extension(&link) {
            entries.push(ListingEntry {
                link,
                folder: false,
            });
        }
    }
    entries
}

fn resolve_entry(
    base: &Url,
    link: Option<String>,
    name: Option<String>,
    folder: bool,
) -> Option<ListingEntry> {
    let link = match (link, name) {
        (Some(link), _) if !link.is_empty() => link,
        (_, Some(name)) if !name.is_empty() => base.join(&name).ok()?.to_string(),
        _ => return None,
    };
    Some(ListingEntry { link, folder })
}

fn local_name(name: &[u8]) -> &str {
    let raw = std::str::from_utf8(name).unwrap_or("");
    raw.rsplit(':').next().unwrap_or(raw)
}
