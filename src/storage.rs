use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::error::Error;

/// One face (or one failed image) in the store.
///
/// Serialized as `{"image", "face_index", "embedding"}` for faces and
/// `{"image", "error"}` for failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    #[serde(rename = "image")]
    pub image_id: String,
    #[serde(flatten)]
    pub outcome: RecordOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordOutcome {
    Face {
        face_index: usize,
        #[serde(rename = "embedding")]
        vector: Vec<f32>,
    },
    Failed {
        error: String,
    },
}

impl EmbeddingRecord {
    pub fn face(image_id: impl Into<String>, face_index: usize, vector: Vec<f32>) -> Self {
        Self {
            image_id: image_id.into(),
            outcome: RecordOutcome::Face { face_index, vector },
        }
    }

    pub fn failed(image_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            image_id: image_id.into(),
            outcome: RecordOutcome::Failed {
                error: error.into(),
            },
        }
    }

    /// `(face_index, vector)` for successful records.
    pub fn face_vector(&self) -> Option<(usize, &[f32])> {
        match &self.outcome {
            RecordOutcome::Face { face_index, vector } => Some((*face_index, vector)),
            RecordOutcome::Failed { .. } => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, RecordOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub images: usize,
    pub faces: usize,
    pub failures: usize,
}

/// Whole-file JSON snapshot of every record, rewritten atomically on each
/// persist. At most one `Face` record exists per `(image_id, face_index)` and
/// at most one `Failed` record per image.
#[derive(Debug)]
pub struct EmbeddingStore {
    path: PathBuf,
    records: Vec<EmbeddingRecord>,
    faces: HashSet<(String, usize)>,
    images: HashSet<String>,
}

impl EmbeddingStore {
    /// Load prior records from `path`, or start empty when it does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let loaded = Self::load(&path)?;
        let total = loaded.len();

        let mut store = Self {
            path,
            records: Vec::with_capacity(total),
            faces: HashSet::new(),
            images: HashSet::new(),
        };
        let kept = store.extend(loaded);
        if kept != total {
            log::warn!(
                "dropped {} duplicate record(s) from {}",
                total - kept,
                store.path.display()
            );
        }
        Ok(store)
    }

    /// Like [`open`](Self::open), for readers that need prior results.
    pub fn open_existing(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_file() {
            return Err(Error::StoreNotFound { path }.into());
        }
        Self::open(path)
    }

    pub fn load(path: &Path) -> Result<Vec<EmbeddingRecord>> {
        if !path.exists() {
            return Ok(vec![]);
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&raw).map_err(|source| {
            Error::CorruptStore {
                path: path.to_path_buf(),
                source,
            }
            .into()
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[EmbeddingRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// True once any record, success or failure, exists for `image_id`.
    pub fn already_processed(&self, image_id: &str) -> bool {
        self.images.contains(image_id)
    }

    /// Append records, skipping duplicates. Returns how many were kept.
    pub fn extend(&mut self, records: impl IntoIterator<Item = EmbeddingRecord>) -> usize {
        let mut kept = 0;
        for record in records {
            let fresh = match &record.outcome {
                RecordOutcome::Face { face_index, .. } => self
                    .faces
                    .insert((record.image_id.clone(), *face_index)),
                RecordOutcome::Failed { .. } => !self.images.contains(&record.image_id),
            };
            if fresh {
                self.images.insert(record.image_id.clone());
                self.records.push(record);
                kept += 1;
            }
        }
        kept
    }

    /// Forget failure records so those images are extracted again.
    pub fn drop_failures(&mut self) -> usize {
        let before = self.records.len();
        self.records.retain(|r| !r.is_failure());
        self.images = self.records.iter().map(|r| r.image_id.clone()).collect();
        before - self.records.len()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            images: self.images.len(),
            faces: self.faces.len(),
            failures: self.records.iter().filter(|r| r.is_failure()).count(),
        }
    }

    /// Atomically replace the on-disk artifact with the current records.
    pub fn persist(&self) -> Result<()> {
        self.write_snapshot().map_err(|source| {
            Error::Persistence {
                path: self.path.clone(),
                source,
            }
            .into()
        })
    }

    fn write_snapshot(&self) -> std::io::Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer(&mut writer, &self.records)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}
