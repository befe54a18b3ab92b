use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, info, warn};

use crate::config::Config;
use crate::embedder::Embedder;
use crate::error::Error;
use crate::preprocess::{self, MAX_DIMENSION};
use crate::storage::{EmbeddingRecord, EmbeddingStore, RecordOutcome};

/// Error recorded for an image in which the embedder found no face.
pub const NO_FACE: &str = "no face detected";

const PROGRESS_EVERY: usize = 100;

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub corpus_dir: PathBuf,
    pub store_path: PathBuf,
    pub max_faces: usize,
    pub workers: usize,
    /// First image (inclusive) of the sorted corpus to consider
    pub resume_from: Option<String>,
    pub max_dimension: u32,
    /// Re-extract images whose previous attempt was recorded as a failure
    pub retry_failed: bool,
}

impl ExtractOptions {
    pub fn new(corpus_dir: impl Into<PathBuf>, store_path: impl Into<PathBuf>) -> Self {
        Self {
            corpus_dir: corpus_dir.into(),
            store_path: store_path.into(),
            max_faces: 15,
            workers: num_cpus::get(),
            resume_from: None,
            max_dimension: MAX_DIMENSION,
            retry_failed: false,
        }
    }

    pub fn from_config(cfg: &Config, corpus_dir: impl Into<PathBuf>) -> Self {
        Self {
            max_faces: cfg.max_faces,
            workers: cfg.workers,
            max_dimension: cfg.max_dimension,
            ..Self::new(corpus_dir, cfg.store.clone())
        }
    }

    /// Reject settings that would record every image as faceless.
    pub fn validate(&self) -> Result<()> {
        if self.max_faces == 0 {
            anyhow::bail!("max_faces must be at least 1");
        }
        if self.max_dimension == 0 {
            anyhow::bail!("max_dimension must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    /// Images in the (resumed) corpus slice
    pub total: usize,
    /// Images already present in the store
    pub skipped: usize,
    /// Images that produced at least one face
    pub processed: usize,
    pub faces: usize,
    /// Images recorded as failures, including those without a face
    pub failed: usize,
}

/// Supported images of the corpus, sorted by file name.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::NoImagesFound {
            dir: dir.to_path_buf(),
        }
        .into());
    }
    let files = preprocess::scan_images(dir)?;
    if files.is_empty() {
        return Err(Error::NoImagesFound {
            dir: dir.to_path_buf(),
        }
        .into());
    }
    Ok(files)
}

/// Drop every image sorted before `marker`.
pub fn slice_from_marker(files: Vec<PathBuf>, marker: Option<&str>) -> Result<Vec<PathBuf>> {
    let Some(marker) = marker else {
        return Ok(files);
    };
    let start = files
        .iter()
        .position(|p| image_id(p) == marker)
        .ok_or_else(|| Error::UnknownResumeMarker {
            marker: marker.to_string(),
        })?;
    Ok(files.into_iter().skip(start).collect())
}

/// File name of `path`. Corpus scans only yield UTF-8 names.
pub fn image_id(path: &Path) -> String {
    path.file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
        .to_string()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Load, preprocess and embed one image. Never fails: problems become a
/// single failure record.
pub fn extract_image<E: Embedder + ?Sized>(
    embedder: &mut E,
    path: &Path,
    image_id: &str,
    max_faces: usize,
    max_dimension: u32,
) -> Vec<EmbeddingRecord> {
    let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
        let img = preprocess::load_image(path, max_dimension)?;
        embedder.detect_and_embed(&img, max_faces)
    }));

    let faces = match attempt {
        Ok(Ok(faces)) => faces,
        Ok(Err(err)) => return vec![EmbeddingRecord::failed(image_id, format!("{:#}", err))],
        Err(payload) => {
            return vec![EmbeddingRecord::failed(
                image_id,
                format!("embedder panicked: {}", panic_message(payload.as_ref())),
            )]
        }
    };

    if faces.is_empty() {
        return vec![EmbeddingRecord::failed(image_id, NO_FACE)];
    }

    faces
        .into_iter()
        .take(max_faces)
        .enumerate()
        .map(|(idx, vector)| EmbeddingRecord::face(image_id, idx, vector))
        .collect()
}

struct Job {
    image_id: String,
    path: PathBuf,
}

enum WorkerEvent {
    Done {
        image_id: String,
        records: Vec<EmbeddingRecord>,
    },
    InitFailed(anyhow::Error),
}

fn worker_loop<E, F>(
    worker: usize,
    factory: &F,
    jobs: Receiver<Job>,
    results: Sender<WorkerEvent>,
    abort: &AtomicBool,
    opts: &ExtractOptions,
) where
    E: Embedder,
    F: Fn() -> Result<E> + Sync,
{
    let mut embedder = match factory() {
        Ok(embedder) => embedder,
        Err(err) => {
            let _ = results.send(WorkerEvent::InitFailed(err));
            return;
        }
    };
    debug!("worker {} ready", worker);

    while let Ok(job) = jobs.recv() {
        if abort.load(Ordering::Relaxed) {
            break;
        }
        let records = extract_image(
            &mut embedder,
            &job.path,
            &job.image_id,
            opts.max_faces,
            opts.max_dimension,
        );
        let event = WorkerEvent::Done {
            image_id: job.image_id,
            records,
        };
        if results.send(event).is_err() {
            break;
        }
    }
    debug!("worker {} finished", worker);
}

/// Single owner of the store: merges each completed image and persists it
/// before looking at the next completion.
fn coordinate(
    store: &mut EmbeddingStore,
    results: Receiver<WorkerEvent>,
    summary: &mut ExtractSummary,
    pending: usize,
) -> Result<()> {
    let mut completed = 0;
    for event in results {
        let (image_id, records) = match event {
            WorkerEvent::InitFailed(err) => {
                return Err(err.context("embedder could not be constructed"));
            }
            WorkerEvent::Done { image_id, records } => (image_id, records),
        };

        let faces = records.iter().filter(|r| !r.is_failure()).count();
        if faces == 0 {
            summary.failed += 1;
            match records.first().map(|r| &r.outcome) {
                Some(RecordOutcome::Failed { error }) if error == NO_FACE => {
                    debug!("[NO FACE] {}", image_id)
                }
                Some(RecordOutcome::Failed { error }) => warn!("[FAILED] {}: {}", image_id, error),
                _ => {}
            }
        } else {
            summary.processed += 1;
            summary.faces += faces;
            debug!("[OK] {} ({} face(s))", image_id, faces);
        }

        let offered = records.len();
        let kept = store.extend(records);
        if kept != offered {
            debug!("{}: {} duplicate record(s) dropped", image_id, offered - kept);
        }
        store.persist()?;

        completed += 1;
        if completed % PROGRESS_EVERY == 0 {
            info!("{}/{} images extracted", completed, pending);
        }
    }
    Ok(())
}

/// Extract embeddings for every not-yet-processed image of the corpus.
///
/// `factory` is called once per worker thread; each worker owns the embedder
/// it builds. The store is persisted after every completed image, so killing
/// the process loses at most the images still in flight.
pub fn run<E, F>(opts: &ExtractOptions, factory: F) -> Result<ExtractSummary>
where
    E: Embedder,
    F: Fn() -> Result<E> + Sync,
{
    opts.validate()?;
    let files = list_images(&opts.corpus_dir)?;
    let files = slice_from_marker(files, opts.resume_from.as_deref())?;
    if let Some(first) = files.first() {
        info!("Starting from: {}", image_id(first));
    }

    let mut store = EmbeddingStore::open(&opts.store_path)?;
    if opts.retry_failed {
        let dropped = store.drop_failures();
        if dropped > 0 {
            info!("retrying {} previously failed image(s)", dropped);
        }
    }

    let mut summary = ExtractSummary {
        total: files.len(),
        ..Default::default()
    };
    let jobs: Vec<Job> = files
        .into_iter()
        .filter_map(|path| {
            let id = image_id(&path);
            if store.already_processed(&id) {
                summary.skipped += 1;
                None
            } else {
                Some(Job { image_id: id, path })
            }
        })
        .collect();

    if summary.skipped > 0 {
        info!("{} image(s) already in {}", summary.skipped, store.path().display());
    }
    if jobs.is_empty() {
        info!("Nothing to extract");
        return Ok(summary);
    }

    let pending = jobs.len();
    let workers = opts.workers.clamp(1, pending);
    info!("Workers: {}", workers);

    let (job_tx, job_rx) = crossbeam_channel::unbounded();
    for job in jobs {
        job_tx.send(job).context("queueing extraction jobs")?;
    }
    drop(job_tx);

    let (result_tx, result_rx) = crossbeam_channel::bounded(workers);
    let abort = AtomicBool::new(false);

    std::thread::scope(|scope| {
        for worker in 0..workers {
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            let factory = &factory;
            let abort = &abort;
            scope.spawn(move || worker_loop(worker, factory, jobs, results, abort, opts));
        }
        drop(result_tx);

        let outcome = coordinate(&mut store, result_rx, &mut summary, pending);
        if outcome.is_err() {
            abort.store(true, Ordering::Relaxed);
        }
        outcome
    })?;

    info!(
        "Done. {} image(s) with faces, {} face(s), {} failure(s)",
        summary.processed, summary.faces, summary.failed
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::DynamicImage;

    struct Fixed(Vec<Vec<f32>>);

    impl Embedder for Fixed {
        fn detect_and_embed(&mut self, _: &DynamicImage, _: usize) -> Result<Vec<Vec<f32>>> {
            Ok(self.0.clone())
        }
    }

    fn names(files: &[PathBuf]) -> Vec<String> {
        files.iter().map(|p| image_id(p)).collect()
    }

    #[test]
    fn test_slice_from_marker() {
        let files: Vec<PathBuf> = ["a.jpg", "b.jpg", "c.jpg"].iter().map(PathBuf::from).collect();

        let all = slice_from_marker(files.clone(), None).unwrap();
        assert_eq!(names(&all), ["a.jpg", "b.jpg", "c.jpg"]);

        let tail = slice_from_marker(files.clone(), Some("b.jpg")).unwrap();
        assert_eq!(names(&tail), ["b.jpg", "c.jpg"]);

        let err = slice_from_marker(files, Some("z.jpg")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::UnknownResumeMarker { marker }) if marker == "z.jpg"
        ));
    }

    #[test]
    fn test_unreadable_image_becomes_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"definitely not a jpeg").unwrap();

        let mut embedder = Fixed(vec![vec![1.0]]);
        let records = extract_image(&mut embedder, &path, "broken.jpg", 15, MAX_DIMENSION);
        assert_eq!(records.len(), 1);
        assert!(records[0].is_failure());
        assert_eq!(records[0].image_id, "broken.jpg");
    }

    #[test]
    fn test_face_cap_and_no_face() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.png");
        image::RgbImage::new(4, 4).save(&path).unwrap();

        let mut many = Fixed((0..5).map(|i| vec![i as f32 + 1.0]).collect());
        let records = extract_image(&mut many, &path, "a.png", 2, MAX_DIMENSION);
        let indices: Vec<_> = records.iter().filter_map(|r| r.face_vector()).collect();
        assert_eq!(indices, [(0, &[1.0f32][..]), (1, &[2.0f32][..])]);

        let mut none = Fixed(vec![]);
        let records = extract_image(&mut none, &path, "a.png", 2, MAX_DIMENSION);
        assert_eq!(records, [EmbeddingRecord::failed("a.png", NO_FACE)]);
    }
}
