use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use stemprep::cache::{ContentAddressableCache, Namespace, NamespaceStats};
use stemprep::pool::{Outcome, RunSummary, WorkerPool};
use stemprep::spectral::{ResynthesisOptions, SpectralResynthesizer};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "stemprep", version, about = "Cached multi-scale mel features for stem separation")]
struct Cli {
    /// Feature cache root
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum NamespaceArg {
    Augmented,
    Original,
    All,
}

impl NamespaceArg {
    fn namespaces(self) -> Vec<Namespace> {
        match self {
            Self::Augmented => vec![Namespace::Augmented],
            Self::Original => vec![Namespace::Original],
            Self::All => Namespace::ALL.to_vec(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Extract (or load cached) features for every stem under the data directory
    Prepare {
        /// Data root (defaults to config file data_dir)
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,

        /// Apply training-time augmentation (separate cache namespace)
        #[arg(long)]
        augment: bool,

        /// Only process stems whose identifier contains this pattern
        #[arg(long)]
        filter: Option<String>,
    },

    /// Resynthesize audio from a cached feature blob
    Invert {
        /// Path to a cache blob
        blob: PathBuf,

        /// Which hop-length scale to invert
        #[arg(short, long, default_value = "0")]
        scale: usize,

        /// Output WAV path
        #[arg(short, long)]
        out: PathBuf,

        /// Griffin-Lim iterations (overrides config)
        #[arg(long)]
        iterations: Option<usize>,
    },

    /// Inspect or clear the feature cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show entry counts and sizes per namespace
    Stats,

    /// Delete cached entries
    Purge {
        #[arg(long, value_enum, default_value = "all")]
        namespace: NamespaceArg,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = stemprep::config::AppConfig::load();

    // Resolve cache path: CLI > config > XDG default
    let cache_dir = cli.cache_dir.clone().unwrap_or_else(|| config.resolve_cache_dir());
    log::info!("Cache: {}", cache_dir.display());
    let cache = Arc::new(ContentAddressableCache::new(&cache_dir));

    match cli.command {
        Commands::Prepare { data_dir, jobs, augment, filter } => {
            let data_dir = data_dir.or(config.data_dir.clone()).context(
                "No data directory. Pass it as an argument or set data_dir in config.",
            )?;

            let mut tasks = stemprep::scanner::collect_stems(&data_dir)
                .with_context(|| format!("Failed to scan {}", data_dir.display()))?;
            if let Some(pattern) = filter {
                let pattern_lower = pattern.to_lowercase();
                tasks.retain(|t| t.stem_id.to_lowercase().contains(&pattern_lower));
            }
            if tasks.is_empty() {
                println!("No stems found under {}", data_dir.display());
                return Ok(());
            }

            let workers = config.resolve_workers(jobs);
            let pool = WorkerPool::new(
                Arc::clone(&cache),
                config.extraction.clone(),
                augment,
                workers,
            )
            .with_progress_bar(true);

            let run = pool.run(tasks).context("Failed to start worker pool")?;
            let progress = Arc::clone(run.progress());
            let results = run.collect().context("Worker pool failed")?;
            let summary = RunSummary::from_results(&results);
            progress.finish(format!(
                "Done {}/{}: {} cached, {} computed, {} failed",
                progress.completed(),
                progress.total(),
                summary.hits,
                summary.computed,
                summary.failed
            ));

            println!(
                "Prepare complete: {} stems, {} cache hits, {} computed ({} not cached), {} failed",
                summary.total(),
                summary.hits,
                summary.computed,
                summary.not_persisted,
                summary.failed
            );
            for result in &results {
                if let Outcome::Failure(failure) = &result.outcome {
                    println!("  FAILED {} [{:?}]: {}", result.stem_id, failure.kind, failure.message);
                }
            }
        }

        Commands::Invert { blob, scale, out, iterations } => {
            let entry = ContentAddressableCache::read_entry(&blob)
                .with_context(|| format!("Failed to read feature blob {}", blob.display()))?;
            let mel = entry.tensor.scale(scale).with_context(|| {
                format!(
                    "Scale {} out of range (blob has {} scales)",
                    scale, entry.tensor.scales
                )
            })?;

            let mut options: ResynthesisOptions = config.resynthesis.clone();
            if let Some(n) = iterations {
                options.n_iter = n;
            }
            // Invert with the hop the grid was analyzed at
            if options.hop_length.is_none() {
                options.hop_length = entry.metadata.config.hop_lengths.get(scale).copied();
            }

            let mut resynth = SpectralResynthesizer::new(options);
            let clip = resynth
                .resynthesize(&mel, &entry.metadata.config)
                .context("Resynthesis failed")?;
            stemprep::audio::decode::write_wav(&out, &clip)
                .with_context(|| format!("Failed to write {}", out.display()))?;
            println!(
                "Wrote {} ({:.2}s at {} Hz)",
                out.display(),
                clip.duration_secs(),
                clip.sample_rate
            );
        }

        Commands::Cache { action } => match action {
            CacheAction::Stats => {
                let stats = cache.stats().context("Failed to read cache")?;
                println!("Cache: {}", cache.root().display());
                print_namespace("original", &stats.original);
                print_namespace("augmented", &stats.augmented);
                if stats.staging > 0 {
                    println!("  {} leftover staging files (removed by purge)", stats.staging);
                }
            }
            CacheAction::Purge { namespace } => {
                let removed = cache
                    .purge(&namespace.namespaces())
                    .context("Failed to purge cache")?;
                println!("Removed {} files", removed);
            }
        },
    }

    Ok(())
}

fn print_namespace(label: &str, stats: &NamespaceStats) {
    println!(
        "  {:<10} {:>6} entries  {:>10.1} MiB",
        label,
        stats.entries,
        stats.bytes as f64 / (1024.0 * 1024.0)
    );
}
