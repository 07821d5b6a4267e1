//! The top-level `Store`: wires Graph Store, Revision, Tx, WAL, and
//! snapshot together into the single-writer/many-readers engine spec.md §5
//! describes. Grounded in the storage engine's `rdms.rs`, which plays the
//! same role of owning the writer lock and the startup recovery sequence
//! over its own index/wal/dgm pieces.

use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use log::info;

use crate::config::Config;
use crate::dsl::{self, ast::OverlayBlock, ast::Step};
use crate::error::{Error, Result};
use crate::exec::{self, Cancel, ExecCtx, OverlayBindings, QueryState, QueryStateCell};
use crate::graph::Graph;
use crate::plan::{self, MemoCache};
use crate::revision::{Generation, Revision};
use crate::snapshot::{self, Manifest};
use crate::tag::Tag;
use crate::tx::{Tx, View};
use crate::types::{Rev, Tref, Ttype};
use crate::wal::Wal;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// An embeddable ZipTag instance: one data directory, one writer lock, one
/// published `Revision` readers observe lock-free.
pub struct Store {
    config: Config,
    revision: Revision,
    wal: Arc<Wal>,
    writer_lock: Mutex<()>,
    memo: MemoCache,
    // Sized from `config.workers` (falling back to `num_cpus::get()`);
    // `query`/`query_observed` run plan evaluation inside it so
    // `Intersect`/`Union`/`Traverse`'s rayon fan-out is bounded by this
    // store's own worker count rather than the process-global rayon pool.
    pool: rayon::ThreadPool,
    // Held for the lifetime of the store; an exclusive flock on `LOCK`
    // under the data directory keeps a second `Store` from opening the
    // same directory and racing this one's WAL/snapshot writes.
    _lockfile: File,
}

impl Store {
    /// Open (or create) a store at `config.path`, replaying the durable
    /// snapshot and WAL per spec.md §4.G recovery.
    pub fn open(config: Config) -> Result<Arc<Store>> {
        std::fs::create_dir_all(&config.path)?;

        let lockfile = File::create(config.lock_path())?;
        lockfile.try_lock_exclusive().map_err(|_| {
            Error::Busy(format!("store already open at {:?}", config.path))
        })?;

        let manifest = Manifest::read(&config.manifest_path())?;
        let (mut graph, snapshot_rev) = match &manifest {
            Some(m) => {
                let path = config.snapshot_path(m.snapshot_rev.0);
                if path.exists() {
                    let (graph, rev) = snapshot::load(&path)?;
                    (graph, rev)
                } else {
                    (Graph::new(), Rev::zero())
                }
            }
            None => (Graph::new(), Rev::zero()),
        };

        let groups = Wal::recover(&config.path)?;
        let mut current_rev = snapshot_rev;
        for group in groups {
            if group.new_rev <= snapshot_rev {
                continue;
            }
            let (txid, parent_rev, new_rev) = (group.txid, group.parent_rev, group.new_rev);
            info!(
                "store: replaying txid={} parent_rev={} -> new_rev={}",
                txid, parent_rev, new_rev
            );
            graph.install_delta(group.into_delta(), new_rev)?;
            current_rev = new_rev;
        }
        info!("store: opened at rev {} under {:?}", current_rev, config.path);

        let wal = Wal::open(&config.path, config.journal_limit, config.flush_interval_ms)?;
        let memo = MemoCache::new(config.memo_cache_entries);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.resolved_workers())
            .thread_name(|idx| format!("ziptag-worker-{}", idx))
            .build()
            .map_err(|e| Error::ValidationError(format!("failed to start worker pool: {}", e)))?;
        Ok(Arc::new(Store {
            revision: Revision::new(graph, current_rev),
            wal,
            writer_lock: Mutex::new(()),
            memo,
            pool,
            config,
            _lockfile: lockfile,
        }))
    }

    pub fn current_rev(&self) -> Rev {
        self.revision.current_rev()
    }

    /// A read-only view at the latest published revision, with no overlays.
    pub fn view(&self) -> View<'static> {
        View::new(self.revision.current())
    }

    pub fn get_tag(&self, tref: Tref) -> Result<Tag> {
        self.revision
            .current()
            .graph
            .get(tref)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{}", tref)))
    }

    // ---- single-writer commit path --------------------------------------

    /// Validate, durably log, and publish `tx`'s staged delta. See spec.md
    /// §4.C step-by-step commit algorithm.
    pub fn commit(&self, tx: Tx) -> Result<Rev> {
        self.commit_assigning(tx).map(|(rev, _)| rev)
    }

    /// Like `commit`, but also returns the real `Tref` assigned to each of
    /// `tx`'s staged `add_tag` calls, in call order — callers that handed
    /// out a synthetic placeholder `Tref` (spec.md §4.C) resolve it here.
    fn commit_assigning(&self, tx: Tx) -> Result<(Rev, Vec<Tref>)> {
        let _guard = self.writer_lock.lock().unwrap();
        let current = self.revision.current();
        let delta = tx.commit_locked(&current)?;

        let declared_for_wal = delta.declared_ttypes.clone();
        let dropped_for_wal = delta.dropped_ttypes.clone();
        let new_tags_for_wal = delta.new_tags.clone();
        let tombstoned_for_wal = delta.tombstoned.clone();
        let added_links_for_wal = delta.added_links.clone();
        let removed_links_for_wal = delta.removed_links.clone();

        let new_rev = current.rev.next();
        let mut new_graph = current.graph.clone();
        let assigned = new_graph.install_delta(delta, new_rev)?;

        let mut ops = Vec::new();
        for ttype in declared_for_wal {
            ops.push(crate::wal::TxOpPayload::DeclareTtype { ttype });
        }
        for ttype in dropped_for_wal {
            ops.push(crate::wal::TxOpPayload::DropTtype { ttype });
        }
        for (i, (ttype, val)) in new_tags_for_wal.into_iter().enumerate() {
            if let Some(tref) = assigned.get(i).copied() {
                ops.push(crate::wal::TxOpPayload::AddTag { tref, ttype, val });
            }
        }
        for link in added_links_for_wal {
            ops.push(crate::wal::TxOpPayload::Link { a: link.lo, b: link.hi });
        }
        for link in removed_links_for_wal {
            ops.push(crate::wal::TxOpPayload::Unlink { a: link.lo, b: link.hi });
        }
        for tref in tombstoned_for_wal {
            ops.push(crate::wal::TxOpPayload::RemTag { tref });
        }

        let txid = self.wal.next_txid();
        let synchronous = self.config.flush_interval_ms == 0;
        self.wal
            .append_commit_group(txid, current.rev, new_rev, &ops, now_ms(), synchronous)?;

        self.revision.publish(new_graph, new_rev);
        Ok((new_rev, assigned))
    }

    /// Block until every durable commit so far is fsynced.
    pub fn sync(&self) -> Result<()> {
        self.wal.sync()
    }

    // ---- one-op convenience wrappers ------------------------------------

    pub fn add_tag(&self, ttype: Ttype, val: String) -> Result<(Tref, Rev)> {
        let current = self.revision.current();
        let mut tx = Tx::open(current.rev);
        let staged = tx.add_tag(&current.graph, ttype, val, self.config.max_val_bytes)?;
        let owner_id = tx.overlay_id();
        drop(current);
        let (rev, assigned) = self.commit_assigning(tx)?;
        let tref = crate::tx::resolve_assigned(owner_id, staged, &assigned);
        Ok((tref, rev))
    }

    pub fn rem_tag(&self, tref: Tref) -> Result<Rev> {
        let mut tx = Tx::open(self.revision.current_rev());
        tx.rem_tag(tref);
        self.commit(tx)
    }

    pub fn link(&self, a: Tref, b: Tref) -> Result<Rev> {
        let mut tx = Tx::open(self.revision.current_rev());
        tx.link(a, b)?;
        self.commit(tx)
    }

    pub fn unlink(&self, a: Tref, b: Tref) -> Result<Rev> {
        let mut tx = Tx::open(self.revision.current_rev());
        tx.unlink(a, b)?;
        self.commit(tx)
    }

    pub fn declare_ttype(&self, ttype: Ttype) -> Result<Rev> {
        let mut tx = Tx::open(self.revision.current_rev());
        tx.declare_ttype(ttype);
        self.commit(tx)
    }

    pub fn drop_ttype(&self, ttype: &str) -> Result<Rev> {
        let current = self.revision.current();
        let mut tx = Tx::open(current.rev);
        tx.drop_ttype(&current.graph, ttype)?;
        drop(current);
        self.commit(tx)
    }

    // ---- overlay staging, shared by query() and explicit preview/commit ---

    /// Stage `block`'s statements onto a fresh `Tx` opened against the
    /// current revision, without committing. Used both to preview a `with`
    /// block attached to a query, and as the building block for an explicit
    /// overlay-then-commit flow.
    pub fn stage_overlay(&self, block: &OverlayBlock) -> Result<(Tx, Arc<Generation>)> {
        let base = self.revision.current();
        let mut tx = Tx::open(base.rev);
        let mut bindings = OverlayBindings::new();
        for stmt in &block.stmts {
            match stmt {
                crate::dsl::ast::OverlayStmt::AddTag { ttype, val, bind } => {
                    let tref = tx.add_tag(&base.graph, ttype.clone(), val.clone(), self.config.max_val_bytes)?;
                    if let Some(name) = bind {
                        bindings.bind(name.clone(), tref);
                    }
                }
                crate::dsl::ast::OverlayStmt::RemTag { ttype, val } => {
                    let view = View::with_overlays(Arc::clone(&base), vec![&tx]);
                    let tref = view
                        .lookup_by_identity(ttype.as_str(), val)
                        .ok_or_else(|| Error::NotFound(format!("({}, {:?})", ttype, val)))?;
                    drop(view);
                    tx.rem_tag(tref);
                }
                crate::dsl::ast::OverlayStmt::Link(a, b) => {
                    let view = View::with_overlays(Arc::clone(&base), vec![&tx]);
                    let ta = bindings.resolve(a, &view)?;
                    let tb = bindings.resolve(b, &view)?;
                    drop(view);
                    tx.link(ta, tb)?;
                }
                crate::dsl::ast::OverlayStmt::Unlink(a, b) => {
                    let view = View::with_overlays(Arc::clone(&base), vec![&tx]);
                    let ta = bindings.resolve(a, &view)?;
                    let tb = bindings.resolve(b, &view)?;
                    drop(view);
                    tx.unlink(ta, tb)?;
                }
            }
        }
        Ok((tx, base))
    }

    fn check_strict_types(&self, steps: &[Step], graph: &Graph) -> Result<()> {
        if !self.config.strict_types {
            return Ok(());
        }
        for step in steps {
            if let Step::TypeFilter { ttype, .. } = step {
                if !graph.is_declared(ttype.as_str()) {
                    return Err(Error::QueryTypeError(ttype.as_str().to_string()));
                }
            }
        }
        Ok(())
    }

    /// Parse, plan, and execute a query. A leading `with { ... }` block is
    /// staged as a throwaway overlay: visible to this query only, discarded
    /// once it returns (spec.md §8 "overlay preview vs commit").
    pub fn query(&self, src: &str) -> Result<Vec<Tref>> {
        self.query_observed(src, &QueryStateCell::new(), None)
    }

    /// Like `query`, but records the `Parsing -> Planning -> Executing ->
    /// Done`/`Failed` lifecycle (spec.md §5) into `state` as it progresses,
    /// and checks `cancel` between plan operators.
    pub fn query_observed(&self, src: &str, state: &QueryStateCell, cancel: Option<&Cancel>) -> Result<Vec<Tref>> {
        state.set(QueryState::Parsing);
        let query = match dsl::parse(src) {
            Ok(q) => q,
            Err(e) => {
                state.set(QueryState::Failed);
                return Err(e);
            }
        };
        let run_view = |view: &View, state: &QueryStateCell| -> Result<Vec<Tref>> {
            state.set(QueryState::Planning);
            self.check_strict_types(&query.steps, &view.base.graph)?;
            let op = plan::plan(&query, view)?;
            state.set(QueryState::Executing);
            let ctx = ExecCtx {
                view,
                memo: Some(&self.memo),
                cancel,
                parallel_threshold: self.config.parallel_threshold,
            };
            exec::execute_with(&op, &ctx)
        };
        let result = match &query.overlay {
            Some(block) => {
                let (tx, base) = self.stage_overlay(block)?;
                let view = View::with_overlays(base, vec![&tx]);
                self.pool.install(|| run_view(&view, state))
            }
            None => {
                let base = self.revision.current();
                let view = View::new(base);
                self.pool.install(|| run_view(&view, state))
            }
        };
        state.set(if result.is_ok() { QueryState::Done } else { QueryState::Failed });
        result
    }

    /// Human-readable operator tree for a query, per spec.md §4.E.
    pub fn explain(&self, src: &str) -> Result<String> {
        let query = dsl::parse(src)?;
        let base = self.revision.current();
        let view = View::new(base);
        let op = plan::plan(&query, &view)?;
        Ok(plan::explain(&op, &view))
    }

    // ---- durability maintenance ------------------------------------------

    /// Build a fresh snapshot of the current revision, write `MANIFEST`, and
    /// truncate WAL segments it subsumes (spec.md §4.G).
    pub fn checkpoint(&self) -> Result<Rev> {
        let current = self.revision.current();
        let head_segment = self.wal.current_segment();
        let path = self.config.snapshot_path(current.rev.0);
        snapshot::build(&current.graph, current.rev, &path)?;
        Manifest {
            snapshot_rev: current.rev,
            wal_head_segment: head_segment,
        }
        .write(&self.config.manifest_path())?;
        self.wal.truncate_before(head_segment)?;
        Ok(current.rev)
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_tag_link_query_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(Config::new(dir.path())).unwrap();
        let (ada, _) = store.add_tag(Ttype::parse("person", 64).unwrap(), "ada".into()).unwrap();
        let (py, _) = store.add_tag(Ttype::parse("language", 64).unwrap(), "python".into()).unwrap();
        let (speaks, _) = store.add_tag(Ttype::parse("rel", 64).unwrap(), "speaks".into()).unwrap();
        store.link(ada, speaks).unwrap();
        store.link(speaks, py).unwrap();

        let result = store.query("| person == \"ada\" > rel > language").unwrap();
        assert_eq!(result, vec![py]);
    }

    #[test]
    fn test_add_tag_idempotent_across_commits() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(Config::new(dir.path())).unwrap();
        let (a, _) = store.add_tag(Ttype::parse("language", 64).unwrap(), "rust".into()).unwrap();
        let (b, _) = store.add_tag(Ttype::parse("language", 64).unwrap(), "rust".into()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_overlay_preview_does_not_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(Config::new(dir.path())).unwrap();
        let result = store
            .query(r#"with { +tag(language, "rust") as r } | language == "rust""#)
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(store.current_rev(), Rev::zero());
        assert!(store.query("| language == \"rust\"").unwrap().is_empty());
    }

    #[test]
    fn test_tombstone_masks_query_results() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(Config::new(dir.path())).unwrap();
        let (rust, _) = store.add_tag(Ttype::parse("language", 64).unwrap(), "rust".into()).unwrap();
        store.rem_tag(rust).unwrap();
        assert!(store.query("| language").unwrap().is_empty());
    }

    #[test]
    fn test_crash_recovery_replays_committed_state() {
        let dir = tempfile::tempdir().unwrap();
        let (ada, py, speaks) = {
            let store = Store::open(Config::new(dir.path())).unwrap();
            let (ada, _) = store.add_tag(Ttype::parse("person", 64).unwrap(), "ada".into()).unwrap();
            let (py, _) = store.add_tag(Ttype::parse("language", 64).unwrap(), "python".into()).unwrap();
            let (speaks, _) = store.add_tag(Ttype::parse("rel", 64).unwrap(), "speaks".into()).unwrap();
            store.link(ada, speaks).unwrap();
            store.link(speaks, py).unwrap();
            store.sync().unwrap();
            (ada, py, speaks)
        };
        let store = Store::open(Config::new(dir.path())).unwrap();
        assert!(store.get_tag(ada).is_ok());
        assert!(store.get_tag(py).is_ok());
        assert!(store.get_tag(speaks).is_ok());
        let result = store.query("| person == \"ada\" > rel > language").unwrap();
        assert_eq!(result, vec![py]);
    }

    #[test]
    fn test_checkpoint_then_recover() {
        let dir = tempfile::tempdir().unwrap();
        let rev = {
            let store = Store::open(Config::new(dir.path())).unwrap();
            store.add_tag(Ttype::parse("language", 64).unwrap(), "rust".into()).unwrap();
            store.checkpoint().unwrap()
        };
        let store = Store::open(Config::new(dir.path())).unwrap();
        assert_eq!(store.current_rev(), rev);
        assert_eq!(store.query("| language").unwrap().len(), 1);
    }

    #[test]
    fn test_strict_types_rejects_unknown_ttype() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new(dir.path());
        config.strict_types = true;
        let store = Store::open(config).unwrap();
        match store.query("| nonexistent") {
            Err(Error::QueryTypeError(t)) => assert_eq!(t, "nonexistent"),
            other => panic!("expected QueryTypeError, got {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn test_open_twice_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let _first = Store::open(Config::new(dir.path())).unwrap();
        match Store::open(Config::new(dir.path())) {
            Err(Error::Busy(_)) => (),
            other => panic!("expected Busy, got {:?}", other.map(|v| v.current_rev())),
        }
    }
}
