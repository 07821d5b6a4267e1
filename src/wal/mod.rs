//! Component G write path — the write-ahead log. Grounded in the storage
//! engine's `wal.rs`/`wal_thread.rs` shape (a dedicated background thread
//! owns the flush buffer under its own lock; writers append and signal it)
//! but simplified to a single stream: ZipTag's commits are already
//! serialized by the single writer lock in `store.rs`, so there is no
//! need for the storage engine's multi-shard fan-out.

pub mod entry;
pub mod journal;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::Result;
use crate::graph::Delta;
use crate::types::Rev;

pub use entry::{Record, TxOpPayload};
use journal::Journal;

/// fsync eagerly once this many bytes have been appended since the last
/// flush, rather than waiting for the interval timer. Mirrors the storage
/// engine's `FLUSH_SIZE` (1 MiB) in `wal.rs`.
const FLUSH_SIZE_THRESHOLD: usize = 1024 * 1024;

struct Inner {
    journal: Journal,
    dirty_bytes: usize,
}

/// One recovered, fully-committed transaction: every `TxOp` between its
/// `TXBEGIN` and the matching `TXCOMMIT` (spec.md §4.G recovery pass 2).
#[derive(Clone, Debug)]
pub struct CommittedGroup {
    pub txid: u64,
    pub parent_rev: Rev,
    pub new_rev: Rev,
    pub ops: Vec<TxOpPayload>,
}

impl CommittedGroup {
    /// Rebuild the `Delta` this group originally produced, for replay
    /// against `Graph::install_delta` during recovery (spec.md §4.G step 3).
    /// `install_delta` reassigns `Tref`s for new tags itself; replay is only
    /// correct because recovery starts from the same `next_tref` the
    /// original commit saw and replays every group in the same order.
    pub fn into_delta(self) -> Delta {
        let mut delta = Delta::default();
        for op in self.ops {
            match op {
                TxOpPayload::DeclareTtype { ttype } => delta.declared_ttypes.push(ttype),
                TxOpPayload::DropTtype { ttype } => delta.dropped_ttypes.push(ttype),
                TxOpPayload::AddTag { ttype, val, .. } => delta.new_tags.push((ttype, val)),
                TxOpPayload::RemTag { tref } => delta.tombstoned.push(tref),
                TxOpPayload::Link { a, b } => {
                    if let Some(link) = crate::tag::Link::new(a, b) {
                        delta.added_links.push(link);
                    }
                }
                TxOpPayload::Unlink { a, b } => {
                    if let Some(link) = crate::tag::Link::new(a, b) {
                        delta.removed_links.push(link);
                    }
                }
            }
        }
        delta
    }
}

pub struct Wal {
    dir: PathBuf,
    journal_limit: usize,
    inner: Mutex<Inner>,
    flush_cv: Condvar,
    next_txid: AtomicU64,
    flusher: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Wal {
    /// Open the WAL directory, resuming the highest-numbered segment (or
    /// creating segment 1), and start the background flusher.
    pub fn open(dir: &Path, journal_limit: usize, flush_interval_ms: u64) -> Result<Arc<Wal>> {
        std::fs::create_dir_all(dir)?;
        let segments = Journal::list_segments(dir)?;
        let journal = match segments.last() {
            Some(&seg) => {
                info!("wal: resuming segment {} under {:?}", seg, dir);
                Journal::reopen(dir, seg)?
            }
            None => Journal::create(dir, 1)?,
        };
        let wal = Arc::new(Wal {
            dir: dir.to_path_buf(),
            journal_limit,
            inner: Mutex::new(Inner { journal, dirty_bytes: 0 }),
            flush_cv: Condvar::new(),
            next_txid: AtomicU64::new(1),
            flusher: Mutex::new(None),
        });
        let flusher = Self::spawn_flusher(Arc::downgrade(&wal), flush_interval_ms);
        *wal.flusher.lock().unwrap() = Some(flusher);
        Ok(wal)
    }

    /// Background flusher. Holds only a `Weak` reference: once every `Arc<Wal>`
    /// the caller holds is dropped, the next `upgrade()` fails and the thread
    /// exits on its own, so `Wal::drop` never has to out-wait a thread that
    /// is itself keeping the `Wal` alive.
    fn spawn_flusher(weak: Weak<Wal>, flush_interval_ms: u64) -> thread::JoinHandle<()> {
        let interval = Duration::from_millis(flush_interval_ms.max(1));
        thread::spawn(move || loop {
            let wal = match weak.upgrade() {
                Some(wal) => wal,
                None => return,
            };
            let guard = wal.inner.lock().unwrap();
            let (mut guard, _timed_out) = wal.flush_cv.wait_timeout(guard, interval).unwrap();
            if guard.dirty_bytes > 0 {
                if let Err(e) = guard.journal.fsync() {
                    warn!("wal: background fsync failed: {}", e);
                } else {
                    guard.dirty_bytes = 0;
                }
            }
            drop(guard);
        })
    }

    pub fn next_txid(&self) -> u64 {
        self.next_txid.fetch_add(1, Ordering::Relaxed)
    }

    /// The segment currently being appended to, for `MANIFEST`'s "WAL head
    /// segment" pointer.
    pub fn current_segment(&self) -> usize {
        self.inner.lock().unwrap().journal.segment
    }

    /// Delete every segment file strictly older than `keep_from`, once a
    /// snapshot has made their contents redundant (spec.md §4.G).
    pub fn truncate_before(&self, keep_from: usize) -> Result<()> {
        for segment in Journal::list_segments(&self.dir)? {
            if segment < keep_from {
                std::fs::remove_file(Journal::segment_path(&self.dir, segment))?;
            }
        }
        Ok(())
    }

    /// Append a full `TXBEGIN/TXOP*/TXCOMMIT` record group for one commit,
    /// per spec.md §4.G step 4. `synchronous` forces an immediate fsync
    /// (the `flush_interval_ms == 0` / explicit-durability case);
    /// otherwise the background flusher or the size threshold handles it.
    pub fn append_commit_group(
        &self,
        txid: u64,
        parent_rev: Rev,
        new_rev: Rev,
        ops: &[TxOpPayload],
        ts_ms: u64,
        synchronous: bool,
    ) -> Result<()> {
        let mut buf = Vec::new();
        Record::TxBegin { txid, parent_rev, ts_ms }.encode(&mut buf);
        for (index, payload) in ops.iter().enumerate() {
            Record::TxOp { txid, index: index as u32, payload: payload.clone() }.encode(&mut buf);
        }
        Record::TxCommit { txid, new_rev }.encode(&mut buf);

        let mut inner = self.inner.lock().unwrap();
        inner.journal.append(&buf)?;
        inner.dirty_bytes += buf.len();
        debug!("wal: appended commit group txid={} new_rev={} ops={}", txid, new_rev, ops.len());

        if inner.journal.exceeds(self.journal_limit) {
            let next_segment = inner.journal.segment + 1;
            info!("wal: rotating journal segment {} -> {}", inner.journal.segment, next_segment);
            inner.journal.fsync()?;
            inner.dirty_bytes = 0;
            inner.journal = Journal::create(&self.dir, next_segment)?;
        } else if synchronous || inner.dirty_bytes >= FLUSH_SIZE_THRESHOLD {
            inner.journal.fsync()?;
            inner.dirty_bytes = 0;
        } else {
            drop(inner);
            self.flush_cv.notify_one();
            return Ok(());
        }
        drop(inner);
        self.flush_cv.notify_one();
        Ok(())
    }

    /// Block until every byte appended so far is fsynced (spec.md §5).
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.dirty_bytes > 0 {
            inner.journal.fsync()?;
            inner.dirty_bytes = 0;
        }
        Ok(())
    }

    /// Scan every segment under `dir` and reconstruct the set of fully
    /// committed transactions, in commit order (spec.md §4.G recovery).
    /// A CRC mismatch mid-log is fatal; a truncated trailing record is
    /// end-of-log.
    pub fn recover(dir: &Path) -> Result<Vec<CommittedGroup>> {
        use std::collections::HashMap;

        struct Open {
            parent_rev: Rev,
            ts_ms: u64,
            ops: Vec<(u32, TxOpPayload)>,
        }

        let mut open: HashMap<u64, Open> = HashMap::new();
        let mut committed: Vec<CommittedGroup> = Vec::new();

        for segment in Journal::list_segments(dir)? {
            let path = Journal::segment_path(dir, segment);
            let bytes = std::fs::read(&path)?;
            let mut off = 0;
            loop {
                match Record::decode(&bytes[off..])? {
                    None => break,
                    Some((record, n)) => {
                        off += n;
                        match record {
                            Record::TxBegin { txid, parent_rev, ts_ms } => {
                                open.insert(txid, Open { parent_rev, ts_ms, ops: Vec::new() });
                            }
                            Record::TxOp { txid, index, payload } => {
                                if let Some(o) = open.get_mut(&txid) {
                                    o.ops.push((index, payload));
                                }
                                // a TxOp with no open TxBegin is a dangling
                                // fragment from a prior truncated write;
                                // ignored per spec.md §4.G step 4.
                            }
                            Record::TxCommit { txid, new_rev } => {
                                if let Some(mut o) = open.remove(&txid) {
                                    o.ops.sort_by_key(|(i, _)| *i);
                                    committed.push(CommittedGroup {
                                        txid,
                                        parent_rev: o.parent_rev,
                                        new_rev,
                                        ops: o.ops.into_iter().map(|(_, p)| p).collect(),
                                    });
                                    let _ = o.ts_ms;
                                }
                            }
                        }
                    }
                }
            }
        }

        committed.sort_by_key(|g| g.new_rev);
        info!("wal: recovered {} committed transaction(s) from {:?}", committed.len(), dir);
        Ok(committed)
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        // The flusher thread's next `Weak::upgrade` fails now that the
        // strong count has hit zero; wake it so it exits promptly rather
        // than waiting out the rest of `flush_interval_ms`.
        self.flush_cv.notify_one();
        if let Some(handle) = self.flusher.lock().unwrap().take() {
            // If this `drop` is running on the flusher thread itself (it
            // just released the last strong `Arc<Wal>` it briefly held
            // mid-iteration), joining its own handle would deadlock; let it
            // return on its own instead.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
