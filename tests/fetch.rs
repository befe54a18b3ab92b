use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use faceseek::fetch::{
    self, Catalog, CatalogEntry, FetchOptions, FetchSummary, Resolution, Source,
};

/// Serves fixed bodies by url and remembers every request.
#[derive(Default)]
struct FakeSource {
    bodies: HashMap<String, Vec<u8>>,
    requests: Mutex<Vec<String>>,
}

impl FakeSource {
    fn with(mut self, url: &str, body: &str) -> Self {
        self.bodies.insert(url.to_string(), body.as_bytes().to_vec());
        self
    }

    fn requested(&self) -> Vec<String> {
        let mut urls = self.requests.lock().unwrap().clone();
        urls.sort();
        urls
    }
}

impl Source for FakeSource {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        self.requests.lock().unwrap().push(url.to_string());
        match self.bodies.get(url) {
            Some(body) => Ok(body.clone()),
            None => bail!("404 Not Found for {}", url),
        }
    }
}

fn catalog() -> Catalog {
    let entry = |name: &str, original: bool, thumb: bool| CatalogEntry {
        filename: name.to_string(),
        original: original.then(|| format!("http://host/{}.jpg", name)),
        thumb: thumb.then(|| format!("http://host/{}_t.jpg", name)),
    };
    Catalog::from_entries(vec![
        entry("d", true, true),
        entry("a", true, true),
        entry("b", true, false),
        entry("c", false, true),
        entry("e", true, true),
    ])
}

fn options(resolution: Resolution) -> FetchOptions {
    FetchOptions {
        workers: 4,
        timeout: Duration::from_secs(1),
        resolution,
    }
}

fn read(dir: &Path, name: &str) -> String {
    std::fs::read_to_string(dir.join(name)).unwrap()
}

#[test]
fn test_fetch_selected() -> Result<()> {
    env_logger::try_init().ok();
    let tmp = tempfile::tempdir()?;
    let out = tmp.path().join("matched");
    std::fs::create_dir_all(&out)?;
    std::fs::write(out.join("a.jpg"), "kept")?;

    let source = FakeSource::default()
        .with("http://host/a.jpg", "new a")
        .with("http://host/b.jpg", "bytes of b");

    let selected = ["a.jpg", "b.jpg", "c.jpg", "e.jpg", "unknown.jpg"];
    let summary = fetch::fetch_selected(
        &source,
        &catalog(),
        selected,
        &out,
        &options(Resolution::Original),
    )?;

    assert_eq!(
        summary,
        FetchSummary {
            downloaded: 1,
            skipped: 3,
            failed: 1
        }
    );
    assert_eq!(read(&out, "a.jpg"), "kept");
    assert_eq!(read(&out, "b.jpg"), "bytes of b");
    assert!(!out.join("e.jpg").exists());
    assert_eq!(source.requested(), ["http://host/b.jpg", "http://host/e.jpg"]);

    // only the downloads themselves end up in the output directory
    let mut names: Vec<_> = std::fs::read_dir(&out)?
        .map(|e| e.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<std::io::Result<_>>()?;
    names.sort();
    assert_eq!(names, ["a.jpg", "b.jpg"]);
    Ok(())
}

#[test]
fn test_fetch_all_from_start() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let out = tmp.path().join("imagens");

    let source = FakeSource::default()
        .with("http://host/c_t.jpg", "thumb c")
        .with("http://host/d_t.jpg", "thumb d")
        .with("http://host/e_t.jpg", "thumb e");

    let summary = fetch::fetch_all(&source, &catalog(), Some("c"), &out, &options(Resolution::Thumb))?;
    assert_eq!(summary.downloaded, 3);
    assert_eq!(summary.failed, 0);
    assert_eq!(read(&out, "d.jpg"), "thumb d");
    assert!(!out.join("a.jpg").exists());

    let again = fetch::fetch_all(&source, &catalog(), None, &out, &options(Resolution::Thumb))?;
    // b has no thumbnail; a is the only new one and 404s
    assert_eq!(
        again,
        FetchSummary {
            downloaded: 0,
            skipped: 4,
            failed: 1
        }
    );

    let err = fetch::fetch_all(&source, &catalog(), Some("zz"), &out, &options(Resolution::Thumb))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<faceseek::Error>(),
        Some(faceseek::Error::UnknownResumeMarker { .. })
    ));
    Ok(())
}
