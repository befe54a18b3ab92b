use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use faceseek::config::{self, Config};
use faceseek::embedder::OnnxFactory;
use faceseek::export;
use faceseek::extract::{self, ExtractOptions};
use faceseek::fetch::{self, Catalog, FetchOptions, HttpSource, Resolution};
use faceseek::matcher::{MatchReport, Matcher};
use faceseek::reference::{self, ReferenceMode};
use faceseek::storage::EmbeddingStore;
use log::info;

#[derive(Parser)]
#[command(name = "faceseek")]
#[command(
    version,
    about = "Find every image of a person in a large photo collection by face similarity"
)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct MatchArgs {
    /// Directory with photos of the person to look for
    #[arg(short, long, default_value = "reference")]
    reference: PathBuf,
    /// Embedding store produced by `extract`
    #[arg(short, long)]
    store: Option<PathBuf>,
    /// Minimum cosine similarity in (0, 1]
    #[arg(short, long)]
    threshold: Option<f32>,
    /// How reference faces become identities
    #[arg(short, long, value_enum)]
    mode: Option<ReferenceMode>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute face embeddings for every image of a corpus directory
    Extract {
        /// Corpus directory
        #[arg(default_value = "imagens")]
        corpus: PathBuf,
        #[arg(short, long)]
        store: Option<PathBuf>,
        /// First image to process (inclusive), by file name
        #[arg(long)]
        resume_from: Option<String>,
        #[arg(long)]
        max_faces: Option<usize>,
        #[arg(short, long)]
        workers: Option<usize>,
        /// Re-extract images recorded as failures
        #[arg(long)]
        retry_failed: bool,
    },
    /// Copy corpus images matching the reference faces into per-identity folders
    Match {
        #[command(flatten)]
        args: MatchArgs,
        /// Corpus directory the store was built from
        #[arg(long, default_value = "imagens")]
        corpus: PathBuf,
        #[arg(short, long, default_value = "output")]
        output: PathBuf,
    },
    /// Download originals of matching images from a remote catalog
    Select {
        #[command(flatten)]
        args: MatchArgs,
        /// Catalog JSON listing filename, original and thumb urls
        #[arg(long, default_value = "images_source.json")]
        catalog: PathBuf,
        /// Only select images still present in this corpus directory
        #[arg(long)]
        corpus: Option<PathBuf>,
        #[arg(short, long, default_value = "output/matched")]
        output: PathBuf,
        #[arg(long, value_enum, default_value_t = Resolution::Original)]
        resolution: Resolution,
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Download the whole catalog, optionally starting from an entry
    Download {
        #[arg(long, default_value = "images_source.json")]
        catalog: PathBuf,
        #[arg(short, long, default_value = "imagens")]
        output: PathBuf,
        /// First catalog filename to download (inclusive)
        #[arg(long)]
        start: Option<String>,
        #[arg(long, value_enum, default_value_t = Resolution::Original)]
        resolution: Resolution,
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Summarize an embedding store
    Stats {
        #[arg(short, long)]
        store: Option<PathBuf>,
    },
    /// Open config file in editor
    Config {
        /// Write the default configuration instead of opening an editor
        #[arg(long)]
        init: bool,
    },
}

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_target(false)
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(cli.config.as_deref())?;
    if !matches!(cli.command, Commands::Config { .. }) {
        cfg.validate()?;
    }

    match cli.command {
        Commands::Extract {
            corpus,
            store,
            resume_from,
            max_faces,
            workers,
            retry_failed,
        } => {
            let mut opts = ExtractOptions::from_config(&cfg, corpus);
            opts.store_path = store.unwrap_or(opts.store_path);
            opts.max_faces = max_faces.unwrap_or(opts.max_faces);
            opts.workers = workers.unwrap_or(opts.workers);
            opts.resume_from = resume_from;
            opts.retry_failed = retry_failed;

            let factory = OnnxFactory::new(&cfg);
            let summary = extract::run(&opts, || factory.build())?;
            info!(
                "{} image(s): {} skipped, {} with faces, {} failed",
                summary.total, summary.skipped, summary.processed, summary.failed
            );
            Ok(())
        }
        Commands::Match {
            args,
            corpus,
            output,
        } => {
            let report = find_matches(&cfg, &args, Some(corpus.as_path()))?;
            if report.total_matches() == 0 {
                info!("No matches found.");
                return Ok(());
            }
            export::export_matches(&report, &corpus, &output)?;
            Ok(())
        }
        Commands::Select {
            args,
            catalog,
            corpus,
            output,
            resolution,
            workers,
        } => {
            let report = find_matches(&cfg, &args, corpus.as_deref())?;
            let selected = report.all_images();
            info!("Matched images: {}", selected.len());
            if selected.is_empty() {
                info!("No matches found.");
                return Ok(());
            }

            let catalog = Catalog::load(&catalog)?;
            info!("Catalog entries: {}", catalog.len());
            let mut opts = FetchOptions::from_config(&cfg, resolution);
            opts.workers = workers.unwrap_or(opts.workers);
            let source = HttpSource::new(opts.timeout)?;

            info!("Downloading matched images...");
            let summary = fetch::fetch_selected(&source, &catalog, selected, &output, &opts)?;
            info!(
                "Done. {} downloaded, {} skipped, {} failed",
                summary.downloaded, summary.skipped, summary.failed
            );
            Ok(())
        }
        Commands::Download {
            catalog,
            output,
            start,
            resolution,
            workers,
        } => {
            let catalog = Catalog::load(&catalog)?;
            info!("Catalog entries: {}", catalog.len());
            let mut opts = FetchOptions::from_config(&cfg, resolution);
            opts.workers = workers.unwrap_or(opts.workers);
            let source = HttpSource::new(opts.timeout)?;

            let summary = fetch::fetch_all(&source, &catalog, start.as_deref(), &output, &opts)?;
            info!(
                "Done. {} downloaded, {} skipped, {} failed",
                summary.downloaded, summary.skipped, summary.failed
            );
            Ok(())
        }
        Commands::Stats { store } => {
            let path = store.unwrap_or_else(|| cfg.store.clone());
            let store = EmbeddingStore::open_existing(&path)?;
            let stats = store.stats();
            info!("Store: {}", path.display());
            info!(
                "{} image(s), {} face(s), {} failure(s)",
                stats.images, stats.faces, stats.failures
            );
            if let Some(last) = store.records().last() {
                info!("Last image: {}", last.image_id);
            }
            Ok(())
        }
        Commands::Config { init } => open_config(&cfg, cli.config.as_deref(), init),
    }
}

/// Build references from the reference directory and scan the store.
fn find_matches(cfg: &Config, args: &MatchArgs, corpus: Option<&Path>) -> Result<MatchReport> {
    let threshold = args.threshold.unwrap_or(cfg.threshold);
    let mut matcher = Matcher::new(threshold)?;
    if let Some(corpus) = corpus {
        matcher = matcher.with_corpus_root(corpus);
    }

    let store_path = args.store.clone().unwrap_or_else(|| cfg.store.clone());
    let store = EmbeddingStore::open_existing(&store_path)?;
    info!("Loaded {} stored embedding record(s)", store.len());

    info!("Building reference embedding(s)...");
    let mut pipeline = OnnxFactory::new(cfg).build()?;
    let references = reference::build_references(
        &args.reference,
        &mut pipeline,
        cfg.max_faces,
        cfg.max_dimension,
        args.mode.unwrap_or(cfg.reference_mode),
    )?;

    info!("Searching for matches (threshold {:.2})...", threshold);
    let report = matcher.find_matches(store.records(), &references);
    for set in &report.sets {
        info!("ref_face {}: {} image(s)", set.identity_index, set.len());
    }
    if report.malformed > 0 {
        info!("{} malformed embedding(s) skipped", report.malformed);
    }
    Ok(report)
}

fn open_config(cfg: &Config, path: Option<&Path>, init: bool) -> Result<()> {
    let config_path = path.unwrap_or(&config::CONFIG_PATH);

    if init {
        config::save_config(cfg, Some(config_path))?;
        info!("Wrote config to {}", config_path.display());
        return Ok(());
    }

    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
    info!("Opening config file: {}", config_path.display());

    let status = std::process::Command::new(editor)
        .arg(config_path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        anyhow::bail!("Editor exited with non-zero status");
    }

    Ok(())
}
