//! ziptag is an embeddable, in-memory, graph-flavored tag store: tags carry
//! a `(ttype, val)` identity, relate to one another through untyped
//! symmetric links, and are queried with a small pipeline DSL compiled down
//! to set operators over `tref`s.
//!
//! Writes are staged through a `Tx` overlay and committed atomically under a
//! single writer lock; reads are lock-free against an atomically-published
//! `Revision`. Durability is a write-ahead log plus periodic snapshots,
//! replayed on `Store::open`.

mod config;
mod dsl;
mod error;
mod exec;
mod graph;
mod plan;
mod revision;
mod snapshot;
mod store;
mod tag;
mod tx;
mod types;
mod util;
mod wal;

pub use crate::config::Config;
pub use crate::dsl::ast::{
    Compare, Expr, FunCall, OverlayBlock, OverlayRef, OverlayStmt, Predicate, Query, Step, ValueFilter,
};
pub use crate::error::{Error, Result};
pub use crate::exec::{Cancel, ExecCtx, OverlayBindings, QueryState, QueryStateCell};
pub use crate::graph::{Delta, Graph};
pub use crate::plan::{explain, plan, MemoCache, Op};
pub use crate::revision::{Generation, Revision};
pub use crate::store::Store;
pub use crate::tag::{Link, Serialize, Tag};
pub use crate::tx::{Tx, View};
pub use crate::types::{Rev, Tref, Ttype};

/// Parse a query string into an AST, per the grammar in the query DSL
/// module.
pub fn parse(src: &str) -> Result<Query> {
    dsl::parse(src)
}
