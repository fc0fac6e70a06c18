use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{info, warn};

pub const DEFAULT_CONCURRENCY: usize = 4;
const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF_MS: u64 = 2000;
const MANIFEST_FILE: &str = "manifest.json";

static HREF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)href\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap());

/// Fetch stats returned after completion.
pub struct FetchStats {
    pub total: usize,
    pub ok: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// One downloaded (or failed) resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub url: String,
    pub file: String,
    pub bytes: Option<u64>,
    pub status: Option<u16>,
    pub error: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

/// Download log kept next to the corpus, keyed by URL.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        match serde_json::from_str(&text) {
            Ok(m) => Ok(m),
            Err(e) => {
                warn!("Ignoring unreadable manifest {}: {}", path.display(), e);
                Ok(Self::default())
            }
        }
    }

    /// Write through a temporary file so an interrupted save keeps the old manifest.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(MANIFEST_FILE);
        let tmp = dir.join(format!("{MANIFEST_FILE}.tmp"));
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace {}", path.display()))
    }

    /// True when `url` was fetched successfully and its file is still there.
    pub fn is_done(&self, url: &str, dir: &Path) -> bool {
        self.entries
            .iter()
            .rev()
            .find(|e| e.url == url)
            .is_some_and(|e| e.error.is_none() && dir.join(&e.file).is_file())
    }

    /// Replace any previous entry for the same URL.
    pub fn record(&mut self, entry: ManifestEntry) {
        self.entries.retain(|e| e.url != entry.url);
        self.entries.push(entry);
    }

    /// Record `entry` and persist the manifest straight away, so an aborted
    /// run still skips every file it finished.
    pub fn record_and_save(&mut self, entry: ManifestEntry, dir: &Path) -> Result<()> {
        self.record(entry);
        self.save(dir)
    }
}

/// Resolve every `href` on the listing page ending with `suffix`.
/// Relative links are joined to `base`; duplicates keep their first position.
pub fn discover_links(base: &Url, html: &str, suffix: &str) -> Vec<Url> {
    let mut seen = HashSet::new();
    HREF_RE
        .captures_iter(html)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|m| m.as_str().trim())
        .filter(|href| href.ends_with(suffix))
        .filter_map(|href| base.join(href).ok())
        .filter(|url| seen.insert(url.to_string()))
        .collect()
}

/// Local file name for a download: the last path segment of the URL.
pub fn file_name_for(url: &Url) -> Option<String> {
    url.path_segments()?
        .last()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

pub async fn fetch_listing(client: &Client, listing: &Url, suffix: &str) -> Result<Vec<Url>> {
    info!("Fetching listing page: {}", listing);
    let response = client
        .get(listing.clone())
        .send()
        .await
        .with_context(|| format!("Failed to fetch {}", listing))?;
    if !response.status().is_success() {
        bail!("Failed to fetch {}: HTTP {}", listing, response.status());
    }
    let html = response.text().await.context("Failed to read listing page")?;
    let links = discover_links(listing, &html, suffix);
    info!("Links ending in {}: {}", suffix, links.len());
    Ok(links)
}

pub struct FetchOptions {
    pub dest: PathBuf,
    pub suffix: String,
    pub concurrency: usize,
    pub force: bool,
}

/// Download every corpus file linked from `listing` into `opts.dest`.
pub async fn fetch_corpus(listing: &str, opts: &FetchOptions) -> Result<FetchStats> {
    let listing = Url::parse(listing).with_context(|| format!("Invalid URL '{}'", listing))?;
    let client = Client::builder()
        .user_agent(concat!("pgn_san/", env!("CARGO_PKG_VERSION")))
        .build()?;

    std::fs::create_dir_all(&opts.dest)
        .with_context(|| format!("Failed to create {}", opts.dest.display()))?;
    let mut manifest = Manifest::load(&opts.dest)?;

    let links = fetch_listing(&client, &listing, &opts.suffix).await?;
    let mut targets: HashMap<String, Url> = HashMap::new();
    let mut queue = Vec::new();
    let mut skipped = 0usize;
    for url in links {
        let Some(file) = file_name_for(&url) else {
            warn!("No file name in {}, skipping", url);
            continue;
        };
        if let Some(prev) = targets.get(&file) {
            warn!("{} and {} both save to {}; keeping the first", prev, url, file);
            continue;
        }
        targets.insert(file.clone(), url.clone());
        if !opts.force && manifest.is_done(url.as_str(), &opts.dest) {
            skipped += 1;
            continue;
        }
        queue.push((url, file));
    }

    let total = queue.len() + skipped;
    let stats = download_all(&client, queue, opts, &mut manifest).await?;
    Ok(FetchStats {
        total,
        ok: stats.0,
        skipped,
        errors: stats.1,
    })
}

/// Download concurrently, recording each result in the manifest as it arrives.
async fn download_all(
    client: &Client,
    queue: Vec<(Url, String)>,
    opts: &FetchOptions,
    manifest: &mut Manifest,
) -> Result<(usize, usize)> {
    let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));
    let dest = Arc::new(opts.dest.clone());

    let pb = ProgressBar::new(queue.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );

    // Channel: workers send results, this loop records them
    let (tx, mut rx) = tokio::sync::mpsc::channel::<ManifestEntry>(opts.concurrency.max(1) * 2);

    for (url, file) in queue {
        let client = client.clone();
        let sem = Arc::clone(&semaphore);
        let dest = Arc::clone(&dest);
        let tx = tx.clone();

        tokio::spawn(async move {
            let Ok(_permit) = sem.acquire().await else {
                return;
            };
            let entry = download_with_retry(&client, &url, &dest, &file).await;
            let _ = tx.send(entry).await;
        });
    }

    // Drop our copy of tx so rx closes when all spawned tasks finish
    drop(tx);

    let mut ok = 0usize;
    let mut errors = 0usize;
    while let Some(entry) = rx.recv().await {
        match &entry.error {
            None => {
                ok += 1;
                info!("Downloaded: {}", entry.file);
            }
            Some(e) => {
                errors += 1;
                warn!("Failed to download {}: {}", entry.url, e);
            }
        }
        if let Err(e) = manifest.record_and_save(entry, &opts.dest) {
            warn!("Manifest not saved: {:#}", e);
        }
        pb.inc(1);
    }

    pb.finish_and_clear();
    manifest.save(&opts.dest)?;
    info!("Fetched {} files ({} errors)", ok, errors);
    Ok((ok, errors))
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

async fn download_with_retry(client: &Client, url: &Url, dest: &Path, file: &str) -> ManifestEntry {
    let mut attempt = 0;
    loop {
        let entry = download_one(client, url, dest, file).await;
        let retry = entry.status.and_then(|s| StatusCode::from_u16(s).ok()).is_some_and(is_retryable);
        if !retry || attempt == MAX_RETRIES {
            return entry;
        }

        let backoff = Duration::from_millis(BASE_BACKOFF_MS * 2u64.pow(attempt));
        warn!(
            "HTTP {} on {} (attempt {}/{}), backing off {:.1}s",
            entry.status.unwrap_or_default(),
            file,
            attempt + 1,
            MAX_RETRIES,
            backoff.as_secs_f64()
        );
        tokio::time::sleep(backoff).await;
        attempt += 1;
    }
}

async fn download_one(client: &Client, url: &Url, dest: &Path, file: &str) -> ManifestEntry {
    let mut entry = ManifestEntry {
        url: url.to_string(),
        file: file.to_string(),
        bytes: None,
        status: None,
        error: None,
        fetched_at: Utc::now(),
    };

    let response = match client.get(url.clone()).send().await {
        Ok(r) => r,
        Err(e) => {
            entry.error = Some(e.to_string());
            return entry;
        }
    };
    let status = response.status();
    entry.status = Some(status.as_u16());
    if !status.is_success() {
        entry.error = Some(format!("HTTP {}", status));
        return entry;
    }

    let body = match response.bytes().await {
        Ok(b) => b,
        Err(e) => {
            entry.error = Some(e.to_string());
            return entry;
        }
    };
    let path = dest.join(file);
    match write_file(&path, &body).await {
        Ok(()) => entry.bytes = Some(body.len() as u64),
        Err(e) => entry.error = Some(format!("Failed to write {}: {}", path.display(), e)),
    }
    entry
}

/// Write `body` to `<path>.part` and rename it into place. The corpus scan
/// never sees a half-written file; a failed write leaves no file at all.
async fn write_file(path: &Path, body: &[u8]) -> std::io::Result<()> {
    let mut part = path.as_os_str().to_owned();
    part.push(".part");
    let part = PathBuf::from(part);

    let result = match tokio::fs::write(&part, body).await {
        Ok(()) => tokio::fs::rename(&part, path).await,
        Err(e) => Err(e),
    };
    if result.is_err() {
        let _ = tokio::fs::remove_file(&part).await;
    }
    result
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://www.example.org/chess/files.html").unwrap()
    }

    #[test]
    fn discovers_relative_and_absolute_links() {
        let html = r#"
            <a href="players/Carlsen.pgn">Carlsen</a>
            <a HREF='openings/Sicilian.pgn'>Sicilian</a>
            <a href="https://cdn.example.org/events/Olympiad.pgn">Olympiad</a>
            <a href="players/Carlsen.zip">zip</a>
            <a href="index.html">home</a>
        "#;
        let links: Vec<String> = discover_links(&base(), html, ".pgn")
            .iter()
            .map(|u| u.to_string())
            .collect();
        assert_eq!(
            links,
            vec![
                "https://www.example.org/chess/players/Carlsen.pgn",
                "https://www.example.org/chess/openings/Sicilian.pgn",
                "https://cdn.example.org/events/Olympiad.pgn",
            ]
        );
    }

    #[test]
    fn duplicate_links_kept_once() {
        let html = r#"<a href="a.pgn">1</a><a href="./a.pgn">2</a><a href="b.pgn">3</a>"#;
        let links = discover_links(&base(), html, ".pgn");
        assert_eq!(links.len(), 2);
        assert!(links[0].as_str().ends_with("/chess/a.pgn"));
    }

    #[test]
    fn no_links() {
        assert!(discover_links(&base(), "<p>nothing here</p>", ".pgn").is_empty());
    }

    #[test]
    fn file_name_is_last_segment() {
        let url = Url::parse("https://x.org/a/b/Tal.pgn?dl=1").unwrap();
        assert_eq!(file_name_for(&url).as_deref(), Some("Tal.pgn"));
        let dir = Url::parse("https://x.org/a/").unwrap();
        assert_eq!(file_name_for(&dir), None);
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable(StatusCode::NOT_FOUND));
        assert!(!is_retryable(StatusCode::OK));
    }

    fn entry(url: &str, file: &str, error: Option<&str>) -> ManifestEntry {
        ManifestEntry {
            url: url.to_string(),
            file: file.to_string(),
            bytes: error.is_none().then_some(10),
            status: Some(200),
            error: error.map(str::to_string),
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn manifest_round_trip_and_skip_logic() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.pgn"), "1. e4").unwrap();

        let mut m = Manifest::default();
        m.record(entry("https://x.org/a.pgn", "a.pgn", None));
        m.record(entry("https://x.org/b.pgn", "b.pgn", Some("HTTP 404")));
        m.record(entry("https://x.org/c.pgn", "c.pgn", None));
        m.save(dir.path()).unwrap();

        let loaded = Manifest::load(dir.path()).unwrap();
        assert_eq!(loaded.entries.len(), 3);
        assert!(loaded.is_done("https://x.org/a.pgn", dir.path()));
        // failed download
        assert!(!loaded.is_done("https://x.org/b.pgn", dir.path()));
        // file deleted since
        assert!(!loaded.is_done("https://x.org/c.pgn", dir.path()));
        assert!(!loaded.is_done("https://x.org/unknown.pgn", dir.path()));
    }

    #[test]
    fn record_replaces_previous_entry() {
        let mut m = Manifest::default();
        m.record(entry("https://x.org/a.pgn", "a.pgn", Some("HTTP 503")));
        m.record(entry("https://x.org/a.pgn", "a.pgn", None));
        assert_eq!(m.entries.len(), 1);
        assert!(m.entries[0].error.is_none());
    }

    #[test]
    fn corrupt_manifest_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), "{not json").unwrap();
        assert!(Manifest::load(dir.path()).unwrap().entries.is_empty());
    }

    #[test]
    fn record_and_save_persists_each_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = Manifest::default();
        m.record_and_save(entry("https://x.org/a.pgn", "a.pgn", None), dir.path())
            .unwrap();
        assert_eq!(Manifest::load(dir.path()).unwrap().entries.len(), 1);

        m.record_and_save(entry("https://x.org/b.pgn", "b.pgn", None), dir.path())
            .unwrap();
        assert_eq!(Manifest::load(dir.path()).unwrap().entries.len(), 2);
        assert!(!dir.path().join(format!("{MANIFEST_FILE}.tmp")).exists());
    }

    #[tokio::test]
    async fn write_file_renames_part_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Tal.pgn");
        write_file(&path, b"1. e4 e5").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"1. e4 e5");
        assert!(!dir.path().join("Tal.pgn.part").exists());
    }

    #[tokio::test]
    async fn failed_write_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing/Tal.pgn");
        assert!(write_file(&path, b"1. e4").await.is_err());
        assert!(!path.exists());
        assert!(!dir.path().join("missing/Tal.pgn.part").exists());
    }
}
