use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::matcher::MatchReport;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportSummary {
    pub copied: usize,
    /// Destination already present
    pub skipped: usize,
    pub failed: usize,
}

/// Output directory for one identity.
pub fn identity_dir(out_dir: &Path, identity_index: usize) -> PathBuf {
    out_dir.join(format!("ref_face_{}", identity_index))
}

/// Copy every matched image from the corpus into `out_dir/ref_face_<n>/`.
/// Existing destinations are left untouched, so repeated exports are cheap.
pub fn export_matches(
    report: &MatchReport,
    corpus_root: &Path,
    out_dir: &Path,
) -> Result<ExportSummary> {
    let mut summary = ExportSummary::default();

    for set in &report.sets {
        let dir = identity_dir(out_dir, set.identity_index);
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

        for (image_id, hit) in &set.images {
            let dst = dir.join(image_id);
            if dst.exists() {
                debug!("[SKIP] {} exists", dst.display());
                summary.skipped += 1;
                continue;
            }
            match std::fs::copy(corpus_root.join(image_id), &dst) {
                Ok(_) => {
                    info!(
                        "[SAVED] ref_face {} <- {} (sim={:.3})",
                        set.identity_index, image_id, hit.similarity
                    );
                    summary.copied += 1;
                }
                Err(err) => {
                    warn!("[ERROR] copying {}: {}", image_id, err);
                    summary.failed += 1;
                }
            }
        }
    }

    info!(
        "Total images saved: {} ({} already present)",
        summary.copied, summary.skipped
    );
    Ok(summary)
}
