mod common;

use anyhow::Result;
use common::{write_faces, write_image, FakeEmbedder};
use faceseek::export::{self, identity_dir};
use faceseek::matcher::Matcher;
use faceseek::reference::{self, ReferenceMode, ReferenceVector};
use faceseek::storage::EmbeddingRecord;
use faceseek::Error;

fn reference(identity_index: usize, vector: &[f32]) -> ReferenceVector {
    ReferenceVector {
        identity_index,
        vector: vector.to_vec(),
    }
}

#[test]
fn test_reference_modes() -> Result<()> {
    env_logger::try_init().ok();
    let tmp = tempfile::tempdir()?;
    let dir = tmp.path().join("reference");
    // [1, 1, 0] and [3, 1, 0]
    write_image(&dir, "me_1.jpg", 8, 8, [0, 10, 0]);
    write_image(&dir, "me_2.png", 8, 8, [2, 10, 0]);
    write_faces(&dir, "nobody.jpg", 0, 0);
    std::fs::write(dir.join("broken.jpg"), b"nope")?;

    let mut embedder = FakeEmbedder::default();
    let mean = reference::build_references(&dir, &mut embedder, 15, 1600, ReferenceMode::Mean)?;
    assert_eq!(mean, vec![reference(0, &[2.0, 1.0, 0.0])]);

    let per_face =
        reference::build_references(&dir, &mut embedder, 15, 1600, ReferenceMode::PerFace)?;
    assert_eq!(
        per_face,
        vec![reference(0, &[1.0, 1.0, 0.0]), reference(1, &[3.0, 1.0, 0.0])]
    );
    Ok(())
}

#[test]
fn test_no_reference_face() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let faceless = tmp.path().join("faceless");
    write_faces(&faceless, "empty_room.jpg", 0, 0);
    let empty = tmp.path().join("empty");
    std::fs::create_dir(&empty)?;

    for dir in [faceless, empty, tmp.path().join("missing")] {
        let err = reference::build_references(
            &dir,
            &mut FakeEmbedder::default(),
            15,
            1600,
            ReferenceMode::Mean,
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::NoReferenceFace { .. })
        ));
    }
    Ok(())
}

#[test]
fn test_reference_identical_to_one_image() -> Result<()> {
    let records = vec![
        EmbeddingRecord::face("a.jpg", 0, vec![0.9, 0.1, 0.4]),
        EmbeddingRecord::face("b.jpg", 0, vec![0.2, 0.7, -0.3]),
        EmbeddingRecord::face("c.jpg", 0, vec![-0.5, 0.5, 0.5]),
    ];
    let report = Matcher::new(0.99)?.find_matches(&records, &[reference(0, &[0.2, 0.7, -0.3])]);
    assert_eq!(report.sets[0].image_ids().collect::<Vec<_>>(), ["b.jpg"]);
    assert_eq!(report.sets[0].images["b.jpg"].similarity, 1.0);
    Ok(())
}

#[test]
fn test_threshold_selection() -> Result<()> {
    let records = vec![
        EmbeddingRecord::face("a.jpg", 0, vec![0.0, 1.0, 0.0]),
        EmbeddingRecord::face("b.jpg", 0, vec![1.0, 0.01, 0.0]),
        EmbeddingRecord::face("c.jpg", 0, vec![1.0, 1.0, 0.0]),
        EmbeddingRecord::face("d.jpg", 0, vec![2.0, 0.0, 0.0]),
        EmbeddingRecord::failed("e.jpg", "no face detected"),
    ];
    let refs = [reference(0, &[1.0, 0.0, 0.0])];

    let report = Matcher::new(0.99)?.find_matches(&records, &refs);
    let matched: Vec<_> = report.sets[0].image_ids().collect();
    assert_eq!(matched, ["b.jpg", "d.jpg"]);

    let exact = Matcher::new(1.0)?.find_matches(&records, &refs);
    let matched: Vec<_> = exact.sets[0].image_ids().collect();
    assert_eq!(matched, ["d.jpg"]);
    assert_eq!(exact.sets[0].images["d.jpg"].similarity, 1.0);

    assert!(matches!(
        Matcher::new(0.0).unwrap_err().downcast_ref::<Error>(),
        Some(Error::InvalidThreshold(_))
    ));
    Ok(())
}

#[test]
fn test_multi_face_image_matches_once_per_identity() -> Result<()> {
    let records = vec![
        EmbeddingRecord::face("x.jpg", 0, vec![1.0, 0.001]),
        EmbeddingRecord::face("x.jpg", 1, vec![0.001, 1.0]),
        EmbeddingRecord::face("x.jpg", 2, vec![1.0, 0.0]),
        EmbeddingRecord::face("y.jpg", 0, vec![0.0, 3.0]),
    ];
    let refs = [reference(0, &[1.0, 0.0]), reference(1, &[0.0, 1.0])];

    let report = Matcher::new(0.9)?.find_matches(&records, &refs);
    assert_eq!(report.sets.len(), 2);

    let first = &report.sets[0];
    assert_eq!(first.len(), 1);
    assert_eq!(first.images["x.jpg"].face_index, 2);

    let second = &report.sets[1];
    assert_eq!(second.image_ids().collect::<Vec<_>>(), ["x.jpg", "y.jpg"]);
    assert_eq!(second.images["x.jpg"].face_index, 1);

    assert_eq!(report.total_matches(), 3);
    assert_eq!(
        report.all_images().into_iter().collect::<Vec<_>>(),
        ["x.jpg", "y.jpg"]
    );
    Ok(())
}

#[test]
fn test_missing_and_malformed_records_are_skipped() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let corpus = tmp.path().join("imagens");
    write_faces(&corpus, "kept.jpg", 1, 0);

    let records = vec![
        EmbeddingRecord::face("kept.jpg", 0, vec![1.0, 0.0]),
        EmbeddingRecord::face("deleted.jpg", 0, vec![1.0, 0.0]),
        EmbeddingRecord::face("zero.jpg", 0, vec![0.0, 0.0]),
        EmbeddingRecord::face("short.jpg", 0, vec![1.0]),
    ];
    let refs = [reference(0, &[1.0, 0.0])];

    let report = Matcher::new(0.8)?
        .with_corpus_root(&corpus)
        .find_matches(&records, &refs);
    assert_eq!(report.sets[0].image_ids().collect::<Vec<_>>(), ["kept.jpg"]);
    assert_eq!(report.missing, 1);
    assert_eq!(report.malformed, 2);
    Ok(())
}

#[test]
fn test_export_skips_existing() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let corpus = tmp.path().join("imagens");
    let out = tmp.path().join("output");
    write_faces(&corpus, "a.jpg", 1, 1);
    write_faces(&corpus, "b.jpg", 1, 2);

    let records = vec![
        EmbeddingRecord::face("a.jpg", 0, vec![1.0, 0.0]),
        EmbeddingRecord::face("b.jpg", 0, vec![1.0, 0.1]),
        EmbeddingRecord::face("gone.jpg", 0, vec![1.0, 0.0]),
    ];
    let report = Matcher::new(0.9)?.find_matches(&records, &[reference(0, &[1.0, 0.0])]);

    let dst = identity_dir(&out, 0);
    std::fs::create_dir_all(&dst)?;
    std::fs::write(dst.join("b.jpg"), "already exported")?;

    let summary = export::export_matches(&report, &corpus, &out)?;
    assert_eq!(summary.copied, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(
        std::fs::read(dst.join("a.jpg"))?,
        std::fs::read(corpus.join("a.jpg"))?
    );
    assert_eq!(std::fs::read_to_string(dst.join("b.jpg"))?, "already exported");

    let again = export::export_matches(&report, &corpus, &out)?;
    assert_eq!(again.copied, 0);
    assert_eq!(again.skipped, 2);
    Ok(())
}
