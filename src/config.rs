//! Store configuration: a plain struct with named defaults, in the shape
//! of the storage engine's own `bubt_config.rs::Config`.

use std::path::{Path, PathBuf};

/// Tuning knobs for one `Store` (spec.md §6).
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory holding the WAL segments, `MANIFEST`, and snapshot files.
    pub path: PathBuf,
    /// Maximum delay before the background flusher fsyncs buffered WAL
    /// bytes. `0` means fsync on every commit.
    pub flush_interval_ms: u64,
    /// Worker thread count for parallel plan evaluation. `0` defers to
    /// `num_cpus::get()`.
    pub workers: usize,
    /// Maximum UTF-8 byte length of a tag's `val`.
    pub max_val_bytes: usize,
    /// Maximum UTF-8 byte length of a ttype identifier.
    pub max_ttype_bytes: usize,
    /// Candidate-set size above which `Intersect`/`Union`/`Difference`/
    /// `Traverse` switch to a `rayon` parallel scan.
    pub parallel_threshold: usize,
    /// Capacity of the per-revision planner memo cache.
    pub memo_cache_entries: usize,
    /// When set, a query referencing an undeclared ttype raises
    /// `QueryTypeError` instead of returning an empty result.
    pub strict_types: bool,
    /// Size, in bytes, at which a WAL segment rotates to a new file.
    pub journal_limit: usize,
}

impl Config {
    pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 200;
    pub const DEFAULT_MAX_VAL_BYTES: usize = 1024;
    pub const DEFAULT_MAX_TTYPE_BYTES: usize = 64;
    pub const DEFAULT_PARALLEL_THRESHOLD: usize = 1024;
    pub const DEFAULT_MEMO_CACHE_ENTRIES: usize = 10_000;
    /// 64 MiB: much smaller than the storage engine's 1 GiB `JOURNAL_LIMIT`
    /// default, since a ziptag tag value is capped at 1 KiB.
    pub const DEFAULT_JOURNAL_LIMIT: usize = 64 * 1024 * 1024;

    pub fn new<P: AsRef<Path>>(path: P) -> Config {
        Config {
            path: path.as_ref().to_path_buf(),
            flush_interval_ms: Self::DEFAULT_FLUSH_INTERVAL_MS,
            workers: 0,
            max_val_bytes: Self::DEFAULT_MAX_VAL_BYTES,
            max_ttype_bytes: Self::DEFAULT_MAX_TTYPE_BYTES,
            parallel_threshold: Self::DEFAULT_PARALLEL_THRESHOLD,
            memo_cache_entries: Self::DEFAULT_MEMO_CACHE_ENTRIES,
            strict_types: false,
            journal_limit: Self::DEFAULT_JOURNAL_LIMIT,
        }
    }

    pub(crate) fn resolved_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }

    pub(crate) fn manifest_path(&self) -> PathBuf {
        self.path.join("MANIFEST")
    }

    pub(crate) fn lock_path(&self) -> PathBuf {
        self.path.join("LOCK")
    }

    pub(crate) fn snapshot_path(&self, rev: u64) -> PathBuf {
        self.path.join(format!("ziptag-snapshot-{}.bin", rev))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::new("/tmp/whatever-ziptag-does-not-create");
        assert_eq!(cfg.flush_interval_ms, 200);
        assert_eq!(cfg.max_val_bytes, 1024);
        assert_eq!(cfg.max_ttype_bytes, 64);
        assert_eq!(cfg.parallel_threshold, 1024);
        assert_eq!(cfg.memo_cache_entries, 10_000);
        assert!(!cfg.strict_types);
    }

    #[test]
    fn test_resolved_workers_falls_back_to_num_cpus() {
        let mut cfg = Config::new("/tmp/x");
        cfg.workers = 4;
        assert_eq!(cfg.resolved_workers(), 4);
        cfg.workers = 0;
        assert!(cfg.resolved_workers() >= 1);
    }
}
