use std::path::PathBuf;

use thiserror::Error;

/// Named failures that abort a run. Per-image problems never surface here;
/// they are recorded in the store or reported in summaries instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no supported images found in {}", .dir.display())]
    NoImagesFound { dir: PathBuf },

    #[error("no face detected in any reference image under {}", .dir.display())]
    NoReferenceFace { dir: PathBuf },

    #[error("resume marker '{marker}' not found")]
    UnknownResumeMarker { marker: String },

    #[error("embedding store {} does not exist; run `extract` first", .path.display())]
    StoreNotFound { path: PathBuf },

    #[error("embedding store {} is corrupt", .path.display())]
    CorruptStore {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to persist embedding store {}", .path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed embedding for {image_id}: {reason}")]
    MalformedEmbedding { image_id: String, reason: String },

    #[error("similarity threshold {0} outside (0, 1]")]
    InvalidThreshold(f32),
}
