use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;

use anyhow::Result;
use log::{debug, info, warn};

use crate::config::validate_threshold;
use crate::error::Error;
use crate::reference::ReferenceVector;
use crate::storage::EmbeddingRecord;

fn norm(v: &[f32]) -> Option<f64> {
    if v.is_empty() || !v.iter().all(|x| x.is_finite()) {
        return None;
    }
    let n = v.iter().map(|&x| x as f64 * x as f64).sum::<f64>().sqrt();
    (n > 0.0).then_some(n)
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(&x, &y)| x as f64 * y as f64).sum()
}

/// Cosine similarity computed in f64 and clamped to [-1, 1].
///
/// `None` when the vectors differ in length or either has zero norm or a
/// non-finite component.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    let (na, nb) = (norm(a)?, norm(b)?);
    Some((dot(a, b) / (na * nb)).clamp(-1.0, 1.0) as f32)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchedImage {
    /// Face that produced the best similarity for this identity
    pub face_index: usize,
    pub similarity: f32,
}

/// Images matched to one reference identity, each at most once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchSet {
    pub identity_index: usize,
    pub images: BTreeMap<String, MatchedImage>,
}

impl MatchSet {
    pub fn image_ids(&self) -> impl Iterator<Item = &str> {
        self.images.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchReport {
    /// One set per reference identity, in reference order
    pub sets: Vec<MatchSet>,
    /// Matched images whose source file is gone from the corpus
    pub missing: usize,
    /// Store records skipped for an unusable vector
    pub malformed: usize,
}

impl MatchReport {
    /// Every matched image across identities, deduplicated and sorted.
    pub fn all_images(&self) -> BTreeSet<&str> {
        self.sets.iter().flat_map(|s| s.image_ids()).collect()
    }

    pub fn total_matches(&self) -> usize {
        self.sets.iter().map(MatchSet::len).sum()
    }
}

/// Linear scan of stored faces against reference vectors.
#[derive(Debug, Clone)]
pub struct Matcher {
    threshold: f32,
    corpus_root: Option<PathBuf>,
}

impl Matcher {
    pub fn new(threshold: f32) -> Result<Self> {
        validate_threshold(threshold)?;
        Ok(Self {
            threshold,
            corpus_root: None,
        })
    }

    /// Only emit images that still exist under `root`.
    pub fn with_corpus_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.corpus_root = Some(root.into());
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn find_matches(
        &self,
        records: &[EmbeddingRecord],
        references: &[ReferenceVector],
    ) -> MatchReport {
        let mut report = MatchReport::default();
        let mut malformed: HashSet<(&str, usize)> = HashSet::new();
        let mut present: HashMap<&str, bool> = HashMap::new();

        for reference in references {
            let mut set = MatchSet {
                identity_index: reference.identity_index,
                images: BTreeMap::new(),
            };
            if norm(&reference.vector).is_none() {
                warn!(
                    "reference {} has an unusable vector, skipping it",
                    reference.identity_index
                );
                report.sets.push(set);
                continue;
            }

            for record in records {
                let Some((face_index, vector)) = record.face_vector() else {
                    continue;
                };
                let image_id = record.image_id.as_str();

                let Some(sim) = cosine_similarity(&reference.vector, vector) else {
                    if malformed.insert((image_id, face_index)) {
                        let err = Error::MalformedEmbedding {
                            image_id: image_id.to_string(),
                            reason: format!(
                                "face {} has dimension {} or zero norm (reference dimension {})",
                                face_index,
                                vector.len(),
                                reference.vector.len()
                            ),
                        };
                        warn!("[SKIP] {}", err);
                    }
                    continue;
                };
                if sim < self.threshold {
                    continue;
                }

                let exists = *present.entry(image_id).or_insert_with(|| {
                    let exists = self
                        .corpus_root
                        .as_ref()
                        .map_or(true, |root| root.join(image_id).is_file());
                    if !exists {
                        debug!("[MISSING] {} matched but is not in the corpus", image_id);
                    }
                    exists
                });
                if !exists {
                    continue;
                }

                let hit = MatchedImage {
                    face_index,
                    similarity: sim,
                };
                match set.images.get_mut(image_id) {
                    Some(best) if best.similarity < sim => *best = hit,
                    Some(_) => {}
                    None => {
                        info!(
                            "[MATCH] ref_face {} <- {} (sim={:.3})",
                            reference.identity_index, image_id, sim
                        );
                        set.images.insert(image_id.to_string(), hit);
                    }
                }
            }

            report.sets.push(set);
        }

        report.missing = present.values().filter(|&&exists| !exists).count();
        report.malformed = malformed.len();
        report
    }
}
