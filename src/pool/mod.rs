//! Statically sharded extraction pool.
//!
//! Tasks are split into `concurrency` contiguous shards before anything runs;
//! each shard is processed start to finish by one worker on a dedicated rayon
//! pool. Workers share the on-disk cache and push results onto one unbounded
//! channel, so a producer never blocks on a slow consumer.

pub mod progress;
pub mod shard;

pub use progress::SharedProgress;

use crate::audio::augment::augment;
use crate::audio::decode::load_audio;
use crate::cache::{CacheEntry, CacheKey, ContentAddressableCache, EntryMetadata};
use crate::spectral::{ConfigError, ExtractError, ExtractionConfig, SpectralAnalyzer};
use chrono::Utc;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("concurrency must be positive")]
    InvalidConcurrency,
    #[error("Invalid extraction config: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Failed to spawn pool coordinator: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Pool coordinator panicked")]
    CoordinatorPanicked,
}

/// One stem to process. Assigned to exactly one worker before the pool starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StemTask {
    pub stem_id: String,
    pub source_path: PathBuf,
}

impl StemTask {
    pub fn new(stem_id: impl Into<String>, source_path: impl Into<PathBuf>) -> Self {
        Self {
            stem_id: stem_id.into(),
            source_path: source_path.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Source audio missing, unreadable or undecodable.
    Read,
    /// Audio decoded but could not be analyzed.
    Extract,
    /// The task panicked; the worker recovered and moved on.
    Panicked,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntrySource {
    CacheHit,
    /// Freshly extracted; `persisted` is false if the cache write failed.
    Computed { persisted: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success {
        entry: CacheEntry,
        source: EntrySource,
    },
    Failure(TaskFailure),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingResult {
    pub stem_id: String,
    pub worker: usize,
    pub outcome: Outcome,
}

impl ProcessingResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }

    pub fn entry(&self) -> Option<&CacheEntry> {
        match &self.outcome {
            Outcome::Success { entry, .. } => Some(entry),
            Outcome::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&TaskFailure> {
        match &self.outcome {
            Outcome::Failure(f) => Some(f),
            Outcome::Success { .. } => None,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunSummary {
    pub hits: u64,
    pub computed: u64,
    pub not_persisted: u64,
    pub failed: u64,
}

impl RunSummary {
    pub fn from_results(results: &[ProcessingResult]) -> Self {
        let mut summary = Self::default();
        for result in results {
            match &result.outcome {
                Outcome::Success {
                    source: EntrySource::CacheHit,
                    ..
                } => summary.hits += 1,
                Outcome::Success {
                    source: EntrySource::Computed { persisted },
                    ..
                } => {
                    summary.computed += 1;
                    if !persisted {
                        summary.not_persisted += 1;
                    }
                }
                Outcome::Failure(_) => summary.failed += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> u64 {
        self.hits + self.computed + self.failed
    }
}

/// A started pool. Drain `results()` (or call `collect`) to receive one
/// `ProcessingResult` per input task; the channel closes once every worker
/// has finished its shard.
pub struct PoolRun {
    results: Receiver<ProcessingResult>,
    progress: Arc<SharedProgress>,
    coordinator: JoinHandle<()>,
}

impl PoolRun {
    pub fn results(&self) -> &Receiver<ProcessingResult> {
        &self.results
    }

    pub fn progress(&self) -> &Arc<SharedProgress> {
        &self.progress
    }

    /// Block until the pool completes and return every result in arrival order.
    pub fn collect(self) -> Result<Vec<ProcessingResult>, PoolError> {
        let results: Vec<ProcessingResult> = self.results.iter().collect();
        self.coordinator
            .join()
            .map_err(|_| PoolError::CoordinatorPanicked)?;
        Ok(results)
    }
}

struct WorkerContext {
    cache: Arc<ContentAddressableCache>,
    config: ExtractionConfig,
    augmented: bool,
}

pub struct WorkerPool {
    cache: Arc<ContentAddressableCache>,
    config: ExtractionConfig,
    augmented: bool,
    concurrency: usize,
    show_progress: bool,
}

impl WorkerPool {
    pub fn new(
        cache: Arc<ContentAddressableCache>,
        config: ExtractionConfig,
        augmented: bool,
        concurrency: usize,
    ) -> Self {
        Self {
            cache,
            config,
            augmented,
            concurrency,
            show_progress: false,
        }
    }

    pub fn with_progress_bar(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn run(&self, tasks: Vec<StemTask>) -> Result<PoolRun, PoolError> {
        if self.concurrency == 0 {
            return Err(PoolError::InvalidConcurrency);
        }
        self.config.validate()?;

        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        if self.concurrency > available {
            log::warn!(
                "Requested {} workers but only {} cores are available",
                self.concurrency,
                available
            );
        }

        let total = tasks.len() as u64;
        let progress = Arc::new(if self.show_progress {
            SharedProgress::with_bar(total)
        } else {
            SharedProgress::new(total)
        });

        let shards = shard::partition(tasks, self.concurrency);
        log::info!(
            "Processing {} stems across {} workers (augmentation {})",
            total,
            self.concurrency,
            if self.augmented { "on" } else { "off" }
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.concurrency)
            .thread_name(|i| format!("stemprep-worker-{i}"))
            .build()?;

        let ctx = WorkerContext {
            cache: Arc::clone(&self.cache),
            config: self.config.clone(),
            augmented: self.augmented,
        };
        let (tx, rx) = mpsc::channel();
        let worker_progress = Arc::clone(&progress);

        let coordinator = std::thread::Builder::new()
            .name("stemprep-pool".into())
            .spawn(move || {
                pool.scope(|s| {
                    for (worker, shard) in shards.into_iter().enumerate() {
                        if shard.is_empty() {
                            continue;
                        }
                        let tx = tx.clone();
                        let ctx = &ctx;
                        let progress = &worker_progress;
                        s.spawn(move |_| run_shard(worker, shard, ctx, tx, progress));
                    }
                });
                drop(tx);
            })?;

        Ok(PoolRun {
            results: rx,
            progress,
            coordinator,
        })
    }
}

fn run_shard(
    worker: usize,
    shard: Vec<StemTask>,
    ctx: &WorkerContext,
    tx: Sender<ProcessingResult>,
    progress: &SharedProgress,
) {
    log::info!("worker-{worker}: started with {} stems", shard.len());
    // Transform parameters are built lazily and reused for the whole shard
    let mut analyzer = SpectralAnalyzer::new();

    for task in shard {
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| {
            process_task(worker, &task, ctx, &mut analyzer)
        })) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!("worker-{worker}: {} panicked: {}", task.stem_id, message);
                analyzer = SpectralAnalyzer::new();
                Outcome::Failure(TaskFailure::new(FailureKind::Panicked, message))
            }
        };

        let result = ProcessingResult {
            stem_id: task.stem_id,
            worker,
            outcome,
        };
        if tx.send(result).is_err() {
            log::warn!("worker-{worker}: result receiver dropped");
        }
        progress.increment();
    }

    log::info!("worker-{worker}: finished shard, output closed");
}

/// Stem id that makes `process_task` panic, for exercising worker recovery.
#[cfg(test)]
const PANICKING_STEM: &str = "forced-panic.wav";

fn process_task(
    worker: usize,
    task: &StemTask,
    ctx: &WorkerContext,
    analyzer: &mut SpectralAnalyzer,
) -> Outcome {
    #[cfg(test)]
    if task.stem_id == PANICKING_STEM {
        panic!("forced panic for {}", task.stem_id);
    }

    let key = CacheKey::compute(&task.stem_id, ctx.augmented, &ctx.config);

    if let Some(entry) = ctx.cache.load(&key) {
        log::debug!("worker-{worker}: cache hit for {}", task.stem_id);
        return Outcome::Success {
            entry,
            source: EntrySource::CacheHit,
        };
    }

    log::debug!(
        "worker-{worker}: processing {}",
        task.source_path.display()
    );
    let started = Instant::now();

    let clip = match load_audio(&task.source_path) {
        Ok(clip) => clip,
        Err(e) => {
            log::error!(
                "worker-{worker}: failed to read {}: {}",
                task.source_path.display(),
                e
            );
            return Outcome::Failure(TaskFailure::new(FailureKind::Read, e.to_string()));
        }
    };
    // Augmentation scales by the clip peak, so reject non-finite audio first
    if let Err(e) = clip.validate() {
        log::error!(
            "worker-{worker}: invalid audio in {}: {}",
            task.source_path.display(),
            e
        );
        return Outcome::Failure(TaskFailure::new(FailureKind::Read, e.to_string()));
    }
    let clip = if ctx.augmented {
        augment(&clip, key.seed())
    } else {
        clip
    };

    let tensor = match analyzer.extract(&clip, &ctx.config) {
        Ok(tensor) => tensor,
        Err(e) => {
            log::error!("worker-{worker}: extraction failed for {}: {}", task.stem_id, e);
            let kind = match e {
                ExtractError::Read(_) => FailureKind::Read,
                ExtractError::Config(_) => FailureKind::Extract,
            };
            return Outcome::Failure(TaskFailure::new(kind, e.to_string()));
        }
    };

    let elapsed = started.elapsed().as_secs_f64();
    let entry = CacheEntry {
        tensor,
        metadata: EntryMetadata {
            augmented: ctx.augmented,
            config: ctx.config.clone(),
            processing_time_secs: elapsed,
            created_at: Utc::now(),
        },
    };
    log::info!(
        "worker-{worker}: processed {} in {:.2}s",
        task.stem_id,
        elapsed
    );

    let persisted = match ctx.cache.store(&key, &entry) {
        Ok(()) => true,
        Err(e) => {
            log::error!("worker-{worker}: failed to cache {}: {}", task.stem_id, e);
            false
        }
    };

    Outcome::Success {
        entry,
        source: EntrySource::Computed { persisted },
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{SampleFormat, WavSpec, WavWriter};
    use std::collections::HashMap;
    use std::path::Path;
    use tempfile::TempDir;

    fn small_config() -> ExtractionConfig {
        ExtractionConfig {
            n_mels: 16,
            n_fft: 256,
            hop_lengths: vec![64, 128],
            target_length: 32,
            sample_rate: 16000,
        }
    }

    fn write_tone(path: &Path, freq: f32) {
        let spec = WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for i in 0..4000 {
            let t = i as f32 / 16000.0;
            let s = (0.3 * (2.0 * std::f32::consts::PI * freq * t).sin() * i16::MAX as f32) as i16;
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    /// `n` valid stems plus the given missing ones, in interleaved order.
    fn fixture(dir: &Path, n: usize, missing: &[usize]) -> Vec<StemTask> {
        (0..n)
            .map(|i| {
                let name = format!("stem{i:02}.wav");
                let path = dir.join(&name);
                if !missing.contains(&i) {
                    write_tone(&path, 200.0 + 50.0 * i as f32);
                }
                StemTask::new(name, path)
            })
            .collect()
    }

    fn pool(cache_root: &Path, augmented: bool, concurrency: usize) -> WorkerPool {
        WorkerPool::new(
            Arc::new(ContentAddressableCache::new(cache_root)),
            small_config(),
            augmented,
            concurrency,
        )
    }

    #[test]
    fn test_one_result_per_task_despite_failures() {
        let data = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let tasks = fixture(data.path(), 7, &[2, 5]);

        let run = pool(cache.path(), false, 3).run(tasks.clone()).unwrap();
        let progress = Arc::clone(run.progress());
        let results = run.collect().unwrap();

        assert_eq!(results.len(), 7);
        assert_eq!(progress.completed(), 7);

        let mut seen: HashMap<&str, &ProcessingResult> = HashMap::new();
        for r in &results {
            assert!(seen.insert(r.stem_id.as_str(), r).is_none(), "duplicate {}", r.stem_id);
        }
        for (i, task) in tasks.iter().enumerate() {
            let r = seen[task.stem_id.as_str()];
            if i == 2 || i == 5 {
                assert_eq!(r.failure().unwrap().kind, FailureKind::Read);
            } else {
                let entry = r.entry().unwrap();
                assert_eq!(entry.tensor.shape(), [2, 16, 32]);
                assert!(!entry.metadata.augmented);
            }
        }

        let summary = RunSummary::from_results(&results);
        assert_eq!(summary, RunSummary { hits: 0, computed: 5, not_persisted: 0, failed: 2 });
    }

    #[test]
    fn test_results_preserve_shard_order() {
        let data = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let tasks = fixture(data.path(), 10, &[3]);
        let shards = shard::partition(tasks.clone(), 3);

        let results = pool(cache.path(), false, 3).run(tasks).unwrap().collect().unwrap();

        for (worker, shard) in shards.iter().enumerate() {
            let got: Vec<&str> = results
                .iter()
                .filter(|r| r.worker == worker)
                .map(|r| r.stem_id.as_str())
                .collect();
            let want: Vec<&str> = shard.iter().map(|t| t.stem_id.as_str()).collect();
            assert_eq!(got, want);
        }
    }

    #[test]
    fn test_second_run_is_served_from_cache() {
        let data = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let tasks = fixture(data.path(), 4, &[]);

        let first = pool(cache.path(), false, 2).run(tasks.clone()).unwrap().collect().unwrap();
        assert!(first.iter().all(|r| matches!(
            r.outcome,
            Outcome::Success { source: EntrySource::Computed { persisted: true }, .. }
        )));

        // Sources gone: only the cache can satisfy these
        for task in &tasks {
            std::fs::remove_file(&task.source_path).unwrap();
        }
        let second = pool(cache.path(), false, 2).run(tasks).unwrap().collect().unwrap();
        assert_eq!(second.len(), 4);
        for r in &second {
            assert!(matches!(
                r.outcome,
                Outcome::Success { source: EntrySource::CacheHit, .. }
            ));
            let original = first.iter().find(|f| f.stem_id == r.stem_id).unwrap();
            assert_eq!(r.entry().unwrap().tensor, original.entry().unwrap().tensor);
        }
    }

    #[test]
    fn test_augmented_runs_use_their_own_namespace() {
        let data = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let tasks = fixture(data.path(), 2, &[]);

        let plain = pool(cache.path(), false, 1).run(tasks.clone()).unwrap().collect().unwrap();
        let aug = pool(cache.path(), true, 1).run(tasks.clone()).unwrap().collect().unwrap();

        assert!(aug.iter().all(|r| matches!(
            r.outcome,
            Outcome::Success { source: EntrySource::Computed { .. }, .. }
        )));
        assert!(aug.iter().all(|r| r.entry().unwrap().metadata.augmented));
        assert_ne!(plain[0].entry().unwrap().tensor, aug[0].entry().unwrap().tensor);

        let stats = ContentAddressableCache::new(cache.path()).stats().unwrap();
        assert_eq!(stats.original.entries, 2);
        assert_eq!(stats.augmented.entries, 2);

        // Augmentation is seeded by key, so a recompute matches the cached entry
        let again = pool(TempDir::new().unwrap().path(), true, 1)
            .run(tasks)
            .unwrap()
            .collect()
            .unwrap();
        assert_eq!(aug[0].entry().unwrap().tensor, again[0].entry().unwrap().tensor);
    }

    #[test]
    fn test_cache_write_failure_is_not_fatal() {
        let data = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let bogus_root = scratch.path().join("file-not-dir");
        std::fs::write(&bogus_root, b"x").unwrap();
        let tasks = fixture(data.path(), 3, &[]);

        let results = pool(&bogus_root, false, 2).run(tasks).unwrap().collect().unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| matches!(
            r.outcome,
            Outcome::Success { source: EntrySource::Computed { persisted: false }, .. }
        )));
        assert_eq!(RunSummary::from_results(&results).not_persisted, 3);
    }

    #[test]
    fn test_more_workers_than_tasks() {
        let data = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let tasks = fixture(data.path(), 2, &[]);
        let results = pool(cache.path(), false, 6).run(tasks).unwrap().collect().unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_empty_task_list_completes() {
        let cache = TempDir::new().unwrap();
        let run = pool(cache.path(), false, 2).run(Vec::new()).unwrap();
        assert!(run.collect().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        let cache = TempDir::new().unwrap();
        assert!(matches!(
            pool(cache.path(), false, 0).run(Vec::new()),
            Err(PoolError::InvalidConcurrency)
        ));

        let bad = WorkerPool::new(
            Arc::new(ContentAddressableCache::new(cache.path())),
            ExtractionConfig { hop_lengths: vec![], ..small_config() },
            false,
            1,
        );
        assert!(matches!(bad.run(Vec::new()), Err(PoolError::Config(_))));
    }

    #[test]
    fn test_non_finite_audio_is_a_read_failure() {
        let data = TempDir::new().unwrap();
        let path = data.path().join("blown.wav");
        let spec = WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for i in 0..2000 {
            let s = if i == 1000 { f32::INFINITY } else { 0.1 };
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();

        for augmented in [false, true] {
            let cache = TempDir::new().unwrap();
            let results = pool(cache.path(), augmented, 1)
                .run(vec![StemTask::new("blown.wav", &path)])
                .unwrap()
                .collect()
                .unwrap();
            assert_eq!(results.len(), 1);
            assert_eq!(
                results[0].failure().unwrap().kind,
                FailureKind::Read,
                "augmented={augmented}"
            );
        }
    }

    #[test]
    fn test_worker_recovers_from_panicking_task() {
        let data = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let mut tasks = fixture(data.path(), 5, &[]);
        tasks[2].stem_id = PANICKING_STEM.to_string();

        let run = pool(cache.path(), false, 1).run(tasks.clone()).unwrap();
        let progress = Arc::clone(run.progress());
        let results = run.collect().unwrap();

        assert_eq!(results.len(), 5);
        assert_eq!(progress.completed(), 5);
        let ids: Vec<&str> = results.iter().map(|r| r.stem_id.as_str()).collect();
        let want: Vec<&str> = tasks.iter().map(|t| t.stem_id.as_str()).collect();
        assert_eq!(ids, want);

        let failure = results[2].failure().unwrap();
        assert_eq!(failure.kind, FailureKind::Panicked);
        assert!(failure.message.contains("forced panic"));
        for (i, r) in results.iter().enumerate() {
            if i != 2 {
                assert_eq!(r.entry().unwrap().tensor.shape(), [2, 16, 32], "{}", r.stem_id);
            }
        }
        assert_eq!(
            RunSummary::from_results(&results),
            RunSummary { hits: 0, computed: 4, not_persisted: 0, failed: 1 }
        );
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
