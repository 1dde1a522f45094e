//! Content-addressable store for extracted feature tensors.
//!
//! Layout: `<root>/{augmented|original}/<hex sha-256>`, one blob per key.
//! Writers stage into a dot-prefixed temp file in the namespace directory and
//! publish with an atomic rename, so readers see either no file or a complete
//! one. Racing writers for the same key are harmless: whichever rename lands
//! last wins and both blobs are equivalent.

pub mod blob;

pub use blob::CacheCorruption;

use crate::spectral::{ExtractionConfig, FeatureTensor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::digest::Output;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

const STAGING_PREFIX: &str = ".staging-";

#[derive(Error, Debug)]
pub enum CacheWriteError {
    #[error("IO error writing {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to encode entry: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Entry augmentation flag ({entry}) does not match key namespace ({key})")]
    NamespaceMismatch { key: bool, entry: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Augmented,
    Original,
}

impl Namespace {
    pub const ALL: [Namespace; 2] = [Namespace::Augmented, Namespace::Original];

    pub fn from_flag(augmented: bool) -> Self {
        if augmented {
            Self::Augmented
        } else {
            Self::Original
        }
    }

    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Augmented => "augmented",
            Self::Original => "original",
        }
    }
}

/// Digest of `(stem, augmentation flag, canonical config)`, tagged with its namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    digest: Output<Sha256>,
    augmented: bool,
}

impl CacheKey {
    pub fn compute(stem_id: &str, augmented: bool, config: &ExtractionConfig) -> Self {
        let canonical = config.canonical();
        let flag = Namespace::from_flag(augmented).dir_name();

        // Length-prefix every field so ("ab", "c") and ("a", "bc") cannot collide
        let mut hasher = Sha256::new();
        for field in [stem_id.as_bytes(), flag.as_bytes(), canonical.as_bytes()] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field);
        }

        Self {
            digest: hasher.finalize(),
            augmented,
        }
    }

    pub fn hex(&self) -> String {
        format!("{:x}", self.digest)
    }

    pub fn namespace(&self) -> Namespace {
        Namespace::from_flag(self.augmented)
    }

    /// First 8 digest bytes, for seeding per-stem randomness.
    pub fn seed(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.digest[..8]);
        u64::from_le_bytes(bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub augmented: bool,
    pub config: ExtractionConfig,
    pub processing_time_secs: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub tensor: FeatureTensor,
    pub metadata: EntryMetadata,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct NamespaceStats {
    pub entries: u64,
    pub bytes: u64,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CacheStats {
    pub augmented: NamespaceStats,
    pub original: NamespaceStats,
    /// Leftover staging files from interrupted writes.
    pub staging: u64,
}

pub struct ContentAddressableCache {
    root: PathBuf,
}

impl ContentAddressableCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn compute_key(stem_id: &str, augmented: bool, config: &ExtractionConfig) -> CacheKey {
        CacheKey::compute(stem_id, augmented, config)
    }

    pub fn namespace_dir(&self, namespace: Namespace) -> PathBuf {
        self.root.join(namespace.dir_name())
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.namespace_dir(key.namespace()).join(key.hex())
    }

    /// Look up a key. Missing, unreadable and corrupt blobs all read as a miss.
    pub fn load(&self, key: &CacheKey) -> Option<CacheEntry> {
        let path = self.path_for(key);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::trace!("Cache miss: {}", path.display());
                return None;
            }
            Err(e) => {
                log::warn!("Unreadable cache blob {}, recomputing: {}", path.display(), e);
                return None;
            }
        };

        match blob::decode(&bytes) {
            Ok(entry) if entry.metadata.augmented == key.augmented => {
                log::debug!("Cache hit: {}", path.display());
                Some(entry)
            }
            Ok(_) => {
                log::warn!(
                    "Cache blob {} is in the wrong namespace, recomputing",
                    path.display()
                );
                None
            }
            Err(e) => {
                log::warn!("Corrupt cache blob {}, recomputing: {}", path.display(), e);
                None
            }
        }
    }

    /// Persist an entry atomically. Safe to call concurrently for the same key.
    pub fn store(&self, key: &CacheKey, entry: &CacheEntry) -> Result<(), CacheWriteError> {
        if entry.metadata.augmented != key.augmented {
            return Err(CacheWriteError::NamespaceMismatch {
                key: key.augmented,
                entry: entry.metadata.augmented,
            });
        }

        let bytes = blob::encode(entry)?;
        let dir = self.namespace_dir(key.namespace());
        let path = self.path_for(key);
        let io_err = |source: std::io::Error| CacheWriteError::Io {
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(&dir).map_err(io_err)?;
        let mut staged = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempfile_in(&dir)
            .map_err(io_err)?;
        staged.write_all(&bytes).map_err(io_err)?;
        staged.flush().map_err(io_err)?;
        staged.as_file().sync_all().map_err(io_err)?;
        staged.persist(&path).map_err(|e| io_err(e.error))?;

        log::debug!("Stored {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }

    /// Read a blob from an arbitrary path (e.g. one picked by hand for inversion).
    pub fn read_entry(path: &Path) -> Result<CacheEntry, CacheCorruption> {
        let bytes =
            std::fs::read(path).map_err(|e| CacheCorruption::Unreadable(e.to_string()))?;
        blob::decode(&bytes)
    }

    pub fn stats(&self) -> std::io::Result<CacheStats> {
        let mut stats = CacheStats::default();
        for namespace in Namespace::ALL {
            let dir = self.namespace_dir(namespace);
            if !dir.exists() {
                continue;
            }
            let slot = match namespace {
                Namespace::Augmented => &mut stats.augmented,
                Namespace::Original => &mut stats.original,
            };
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                if entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
                    stats.staging += 1;
                    continue;
                }
                slot.entries += 1;
                slot.bytes += entry.metadata()?.len();
            }
        }
        Ok(stats)
    }

    /// Delete every blob (and leftover staging file) in the given namespaces.
    pub fn purge(&self, namespaces: &[Namespace]) -> std::io::Result<u64> {
        let mut removed = 0;
        for &namespace in namespaces {
            let dir = self.namespace_dir(namespace);
            if !dir.exists() {
                continue;
            }
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    std::fs::remove_file(entry.path())?;
                    removed += 1;
                }
            }
            log::info!("Purged {} namespace", namespace.dir_name());
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn config() -> ExtractionConfig {
        ExtractionConfig {
            n_mels: 8,
            n_fft: 128,
            hop_lengths: vec![32, 64],
            target_length: 5,
            sample_rate: 8000,
        }
    }

    fn entry(augmented: bool, fill: f32) -> CacheEntry {
        let mut tensor = FeatureTensor::zeros(2, 8, 5);
        for (i, v) in tensor.data.iter_mut().enumerate() {
            *v = fill + i as f32;
        }
        CacheEntry {
            tensor,
            metadata: EntryMetadata {
                augmented,
                config: config(),
                processing_time_secs: 0.5,
                created_at: Utc::now(),
            },
        }
    }

    #[test]
    fn test_key_is_deterministic() {
        let a = CacheKey::compute("drums/track01.wav", false, &config());
        let b = CacheKey::compute("drums/track01.wav", false, &config());
        assert_eq!(a, b);
        assert_eq!(a.hex(), b.hex());
        assert_eq!(a.hex().len(), 64);
        assert!(a.hex().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_key_is_stable_across_runs() {
        // Fixed digest: changing the derivation invalidates every existing cache
        let key = CacheKey::compute("stem", false, &ExtractionConfig::default());
        let mut hasher = Sha256::new();
        for field in [
            "stem".as_bytes(),
            b"original".as_slice(),
            ExtractionConfig::default().canonical().as_bytes(),
        ] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field);
        }
        assert_eq!(key.digest, hasher.finalize());
        assert_eq!(key.hex(), format!("{:x}", key.digest));
    }

    #[test]
    fn test_augmentation_flag_separates_keys() {
        let a = CacheKey::compute("bass.wav", true, &config());
        let o = CacheKey::compute("bass.wav", false, &config());
        assert_ne!(a.hex(), o.hex());
        assert_eq!(a.namespace(), Namespace::Augmented);
        assert_eq!(o.namespace(), Namespace::Original);
    }

    #[test]
    fn test_key_depends_on_stem_and_config() {
        let base = CacheKey::compute("a.wav", false, &config());
        assert_ne!(base, CacheKey::compute("b.wav", false, &config()));
        let other = ExtractionConfig { n_mels: 16, ..config() };
        assert_ne!(base, CacheKey::compute("a.wav", false, &other));
    }

    #[test]
    fn test_path_layout() {
        let dir = TempDir::new().unwrap();
        let cache = ContentAddressableCache::new(dir.path());
        let key = CacheKey::compute("x.wav", true, &config());
        assert_eq!(
            cache.path_for(&key),
            dir.path().join("augmented").join(key.hex())
        );
    }

    #[test]
    fn test_store_then_load() {
        let dir = TempDir::new().unwrap();
        let cache = ContentAddressableCache::new(dir.path());
        let key = CacheKey::compute("vocals.wav", false, &config());
        let e = entry(false, 1.5);

        assert!(cache.load(&key).is_none());
        cache.store(&key, &e).unwrap();
        assert_eq!(cache.load(&key), Some(e));
    }

    #[test]
    fn test_namespaces_do_not_share_entries() {
        let dir = TempDir::new().unwrap();
        let cache = ContentAddressableCache::new(dir.path());
        let orig = CacheKey::compute("s.wav", false, &config());
        cache.store(&orig, &entry(false, 0.0)).unwrap();
        assert!(cache.load(&CacheKey::compute("s.wav", true, &config())).is_none());
    }

    #[test]
    fn test_store_rejects_namespace_mismatch() {
        let dir = TempDir::new().unwrap();
        let cache = ContentAddressableCache::new(dir.path());
        let key = CacheKey::compute("s.wav", true, &config());
        assert!(matches!(
            cache.store(&key, &entry(false, 0.0)),
            Err(CacheWriteError::NamespaceMismatch { key: true, entry: false })
        ));
    }

    #[test]
    fn test_corrupt_blobs_read_as_miss() {
        let dir = TempDir::new().unwrap();
        let cache = ContentAddressableCache::new(dir.path());
        let key = CacheKey::compute("c.wav", false, &config());
        cache.store(&key, &entry(false, 0.0)).unwrap();
        let path = cache.path_for(&key);
        let good = std::fs::read(&path).unwrap();

        std::fs::write(&path, &good[..good.len() / 2]).unwrap();
        assert!(cache.load(&key).is_none());

        std::fs::write(&path, vec![0u8; good.len()]).unwrap();
        assert!(cache.load(&key).is_none());

        std::fs::write(&path, b"").unwrap();
        assert!(cache.load(&key).is_none());

        // Recovers once rewritten
        cache.store(&key, &entry(false, 0.0)).unwrap();
        assert!(cache.load(&key).is_some());
    }

    #[test]
    fn test_directory_in_place_of_blob_reads_as_miss() {
        let dir = TempDir::new().unwrap();
        let cache = ContentAddressableCache::new(dir.path());
        let key = CacheKey::compute("d.wav", false, &config());
        std::fs::create_dir_all(cache.path_for(&key)).unwrap();
        assert!(cache.load(&key).is_none());
    }

    #[test]
    fn test_store_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("not-a-dir");
        std::fs::write(&root, b"file").unwrap();
        let cache = ContentAddressableCache::new(&root);
        let key = CacheKey::compute("e.wav", false, &config());
        assert!(matches!(
            cache.store(&key, &entry(false, 0.0)),
            Err(CacheWriteError::Io { .. })
        ));
    }

    #[test]
    fn test_racing_writers_never_expose_partial_blobs() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(ContentAddressableCache::new(dir.path()));
        let key = CacheKey::compute("race.wav", false, &config());
        let expected = entry(false, 3.0);

        std::thread::scope(|s| {
            for _ in 0..2 {
                let cache = Arc::clone(&cache);
                let expected = expected.clone();
                s.spawn(move || {
                    for _ in 0..50 {
                        cache.store(&key, &expected).unwrap();
                    }
                });
            }
            for _ in 0..2 {
                let cache = Arc::clone(&cache);
                let expected = expected.clone();
                s.spawn(move || {
                    for _ in 0..200 {
                        if let Some(seen) = cache.load(&key) {
                            assert_eq!(seen, expected);
                        }
                    }
                });
            }
        });

        assert_eq!(cache.load(&key), Some(expected));
        assert_eq!(cache.stats().unwrap().staging, 0);
    }

    #[test]
    fn test_stats_and_purge() {
        let dir = TempDir::new().unwrap();
        let cache = ContentAddressableCache::new(dir.path());
        for name in ["a", "b", "c"] {
            let key = CacheKey::compute(name, false, &config());
            cache.store(&key, &entry(false, 0.0)).unwrap();
        }
        let key = CacheKey::compute("a", true, &config());
        cache.store(&key, &entry(true, 0.0)).unwrap();
        std::fs::write(
            cache.namespace_dir(Namespace::Original).join(".staging-leftover"),
            b"partial",
        )
        .unwrap();

        let stats = cache.stats().unwrap();
        assert_eq!(stats.original.entries, 3);
        assert_eq!(stats.augmented.entries, 1);
        assert_eq!(stats.staging, 1);
        assert!(stats.original.bytes > 0);

        assert_eq!(cache.purge(&[Namespace::Original]).unwrap(), 4);
        let stats = cache.stats().unwrap();
        assert_eq!(stats.original, NamespaceStats::default());
        assert_eq!(stats.augmented.entries, 1);
        assert_eq!(stats.staging, 0);
    }
}
