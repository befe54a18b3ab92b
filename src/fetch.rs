//! Downloading originals (or thumbnails) of corpus images from a remote
//! catalog.
//!
//! The catalog is a JSON array of `{"filename", "original", "thumb"}` where
//! `filename` has no extension; files are stored locally as
//! `<filename>.jpg`, which is also the corpus image id.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::config::Config;
use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub filename: String,
    #[serde(default)]
    pub original: Option<String>,
    #[serde(default)]
    pub thumb: Option<String>,
}

impl CatalogEntry {
    /// Local file name, and corpus image id, of this entry.
    pub fn local_name(&self) -> String {
        format!("{}.jpg", self.filename)
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    #[default]
    Original,
    Thumb,
}

impl Resolution {
    pub fn field(&self) -> &'static str {
        match self {
            Resolution::Original => "original",
            Resolution::Thumb => "thumb",
        }
    }

    fn url<'a>(&self, entry: &'a CatalogEntry) -> Option<&'a str> {
        match self {
            Resolution::Original => entry.original.as_deref(),
            Resolution::Thumb => entry.thumb.as_deref(),
        }
    }
}

/// Catalog entries sorted by `filename`.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
    by_name: HashMap<String, usize>,
}

impl Catalog {
    pub fn from_entries(mut entries: Vec<CatalogEntry>) -> Self {
        entries.sort_by(|a, b| a.filename.cmp(&b.filename));
        let by_name = entries
            .iter()
            .enumerate()
            .map(|(idx, e)| (e.local_name(), idx))
            .collect();
        Self { entries, by_name }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading catalog {}", path.display()))?;
        let entries: Vec<CatalogEntry> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing catalog {}", path.display()))?;
        Ok(Self::from_entries(entries))
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an entry by corpus image id (`<filename>.jpg`).
    pub fn find(&self, image_id: &str) -> Option<&CatalogEntry> {
        self.by_name.get(image_id).map(|&idx| &self.entries[idx])
    }

    /// Entries from `start` (a bare `filename`, inclusive) onwards.
    pub fn slice_from(&self, start: Option<&str>) -> Result<&[CatalogEntry]> {
        let Some(start) = start else {
            return Ok(&self.entries);
        };
        let idx = self
            .entries
            .iter()
            .position(|e| e.filename == start)
            .ok_or_else(|| Error::UnknownResumeMarker {
                marker: start.to_string(),
            })?;
        Ok(&self.entries[idx..])
    }
}

/// Where downloaded bytes come from.
pub trait Source: Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Blocking HTTP source with a per-request timeout.
pub struct HttpSource {
    client: reqwest::blocking::Client,
}

impl HttpSource {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("building http client")?;
        Ok(Self { client })
    }
}

impl Source for HttpSource {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(url).send()?.error_for_status()?;
        Ok(response.bytes()?.to_vec())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    pub workers: usize,
    pub timeout: Duration,
    pub resolution: Resolution,
}

impl FetchOptions {
    pub fn from_config(cfg: &Config, resolution: Resolution) -> Self {
        Self {
            workers: cfg.fetch_workers,
            timeout: Duration::from_secs(cfg.fetch_timeout_secs),
            resolution,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Downloaded,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl FetchSummary {
    fn record(&mut self, name: &str, outcome: &FetchOutcome) {
        match outcome {
            FetchOutcome::Downloaded => {
                info!("[OK] {}", name);
                self.downloaded += 1;
            }
            FetchOutcome::Skipped(reason) => {
                debug!("[SKIP] {} {}", name, reason);
                self.skipped += 1;
            }
            FetchOutcome::Failed(reason) => {
                warn!("[ERROR] {}: {}", name, reason);
                self.failed += 1;
            }
        }
    }
}

fn write_atomic(dst: &Path, bytes: &[u8]) -> Result<()> {
    let dir = dst.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(dst).map_err(|e| e.error)?;
    Ok(())
}

/// Download one item unless it is unknown, lacks the wanted resolution, or
/// is already on disk.
pub fn fetch_one<S: Source + ?Sized>(
    source: &S,
    entry: Option<&CatalogEntry>,
    name: &str,
    out_dir: &Path,
    resolution: Resolution,
) -> FetchOutcome {
    let Some(entry) = entry else {
        return FetchOutcome::Skipped("not found in catalog".to_string());
    };
    let Some(url) = resolution.url(entry) else {
        return FetchOutcome::Skipped(format!("has no '{}'", resolution.field()));
    };

    let dst = out_dir.join(name);
    if dst.exists() {
        return FetchOutcome::Skipped("exists".to_string());
    }

    match source
        .fetch(url)
        .and_then(|bytes| write_atomic(&dst, &bytes))
    {
        Ok(()) => FetchOutcome::Downloaded,
        Err(err) => FetchOutcome::Failed(format!("{:#}", err)),
    }
}

fn run_pool<S: Source + ?Sized>(
    source: &S,
    tasks: Vec<(String, Option<&CatalogEntry>)>,
    out_dir: &Path,
    opts: &FetchOptions,
) -> Result<FetchSummary> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let mut summary = FetchSummary::default();
    if tasks.is_empty() {
        return Ok(summary);
    }
    let workers = opts.workers.clamp(1, tasks.len());
    info!("Workers: {}", workers);

    let (task_tx, task_rx) = crossbeam_channel::unbounded();
    for task in tasks {
        task_tx
            .send(task)
            .map_err(|err| anyhow::anyhow!("{}", err))
            .context("queueing downloads")?;
    }
    drop(task_tx);
    let (result_tx, result_rx) = crossbeam_channel::bounded(workers);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let tasks = task_rx.clone();
            let results = result_tx.clone();
            scope.spawn(move || {
                for (name, entry) in tasks {
                    let outcome = fetch_one(source, entry, &name, out_dir, opts.resolution);
                    if results.send((name, outcome)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        for (name, outcome) in result_rx {
            summary.record(&name, &outcome);
        }
    });

    Ok(summary)
}

/// Download the catalog entries for a set of matched corpus images.
pub fn fetch_selected<'a, S, I>(
    source: &S,
    catalog: &Catalog,
    image_ids: I,
    out_dir: &Path,
    opts: &FetchOptions,
) -> Result<FetchSummary>
where
    S: Source + ?Sized,
    I: IntoIterator<Item = &'a str>,
{
    let tasks = image_ids
        .into_iter()
        .map(|id| (id.to_string(), catalog.find(id)))
        .collect();
    run_pool(source, tasks, out_dir, opts)
}

/// Download every catalog entry from `start` onwards.
pub fn fetch_all<S: Source + ?Sized>(
    source: &S,
    catalog: &Catalog,
    start: Option<&str>,
    out_dir: &Path,
    opts: &FetchOptions,
) -> Result<FetchSummary> {
    if catalog.is_empty() {
        warn!("catalog is empty, nothing to download");
    }
    let entries = catalog.slice_from(start)?;
    if let Some(first) = entries.first() {
        info!("Starting from: {}", first.filename);
    }
    let tasks = entries
        .iter()
        .map(|entry| (entry.local_name(), Some(entry)))
        .collect();
    let summary = run_pool(source, tasks, out_dir, opts)?;
    info!("Total images processed: {}", entries.len());
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(filename: &str, original: Option<&str>, thumb: Option<&str>) -> CatalogEntry {
        CatalogEntry {
            filename: filename.to_string(),
            original: original.map(str::to_string),
            thumb: thumb.map(str::to_string),
        }
    }

    #[test]
    fn test_catalog_parsing_and_lookup() {
        let raw = r#"[
            {"filename": "b", "original": "http://x/b.jpg"},
            {"filename": "a", "original": "http://x/a.jpg", "thumb": "http://x/a_t.jpg"}
        ]"#;
        let entries: Vec<CatalogEntry> = serde_json::from_str(raw).unwrap();
        let catalog = Catalog::from_entries(entries);

        assert_eq!(catalog.len(), 2);
        assert!(!catalog.is_empty());
        assert_eq!(catalog.entries()[0].filename, "a");
        assert_eq!(catalog.find("b.jpg").unwrap().thumb, None);
        assert!(catalog.find("b").is_none());
        assert_eq!(
            Resolution::Thumb.url(catalog.find("a.jpg").unwrap()),
            Some("http://x/a_t.jpg")
        );
    }

    #[test]
    fn test_slice_from() {
        let catalog = Catalog::from_entries(vec![
            entry("c", None, None),
            entry("a", None, None),
            entry("b", None, None),
        ]);
        let tail = catalog.slice_from(Some("b")).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].filename, "b");
        assert_eq!(catalog.slice_from(None).unwrap().len(), 3);

        let err = catalog.slice_from(Some("zz")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::UnknownResumeMarker { .. })
        ));
    }
}
