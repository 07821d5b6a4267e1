//! Component A — the in-memory Graph Store: per-type identity index,
//! `tref` index, and symmetric adjacency sets over committed state.
//!
//! `install_delta` is the only mutator, and it is only ever called by
//! `Tx::commit` under the writer lock (see `tx.rs`). Everything else here is
//! a read path, safe to call concurrently with other reads.

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::tag::{Link, Tag};
use crate::types::{Rev, Tref, Ttype};

/// A staged set of mutations to apply atomically to the store. Built up by
/// `Tx` (see `tx.rs`) and handed to `Graph::install_delta` at commit time.
#[derive(Default)]
pub struct Delta {
    pub declared_ttypes: Vec<Ttype>,
    pub dropped_ttypes: Vec<Ttype>,
    /// New tags to create, in order; assigned fresh `Tref`s at install time.
    pub new_tags: Vec<(Ttype, String)>,
    pub tombstoned: Vec<Tref>,
    pub added_links: Vec<Link>,
    pub removed_links: Vec<Link>,
}

/// The canonical in-memory state. Indices are kept mutually consistent by
/// `install_delta` alone; every other method is read-only.
///
/// `Clone` backs the copy-on-write commit path in `store.rs`: a writer
/// clones the currently-published `Graph`, mutates the clone, then hands it
/// to `Revision::publish` so existing readers keep seeing the old one.
#[derive(Default, Clone)]
pub struct Graph {
    by_type: HashMap<String, HashMap<String, Tref>>,
    by_tref: HashMap<Tref, Tag>,
    adj: HashMap<Tref, HashSet<Tref>>,
    next_tref: u64,
}

impl Graph {
    pub fn new() -> Graph {
        Graph {
            by_type: HashMap::new(),
            by_tref: HashMap::new(),
            adj: HashMap::new(),
            next_tref: 1,
        }
    }

    #[inline]
    pub fn next_tref(&self) -> u64 {
        self.next_tref
    }

    /// Restore state from a snapshot load; only `snapshot.rs` calls this.
    pub(crate) fn restore(tags: Vec<Tag>, links: Vec<Link>, next_tref: u64) -> Graph {
        let mut g = Graph::new();
        g.next_tref = next_tref;
        for tag in tags {
            g.by_type
                .entry(tag.ttype.as_str().to_string())
                .or_default()
                .insert(tag.val.clone(), tag.tref);
            g.by_tref.insert(tag.tref, tag);
        }
        for link in links {
            g.adj.entry(link.lo).or_default().insert(link.hi);
            g.adj.entry(link.hi).or_default().insert(link.lo);
        }
        g
    }

    // ---- read path -----------------------------------------------------

    pub fn lookup_by_identity(&self, ttype: &str, val: &str) -> Option<Tref> {
        self.by_type.get(ttype).and_then(|m| m.get(val)).copied()
    }

    pub fn get(&self, tref: Tref) -> Option<&Tag> {
        self.by_tref.get(&tref)
    }

    pub fn neighbors(&self, tref: Tref) -> impl Iterator<Item = Tref> + '_ {
        self.adj.get(&tref).into_iter().flatten().copied()
    }

    pub fn all_of_type(&self, ttype: &str) -> impl Iterator<Item = Tref> + '_ {
        self.by_type
            .get(ttype)
            .into_iter()
            .flat_map(|m| m.values().copied())
    }

    pub fn cardinality_of_type(&self, ttype: &str) -> usize {
        self.by_type.get(ttype).map(|m| m.len()).unwrap_or(0)
    }

    /// Whether `ttype` has ever been declared or tagged. `Config::strict_types`
    /// uses this to reject queries against a ttype nobody has used yet.
    pub fn is_declared(&self, ttype: &str) -> bool {
        self.by_type.contains_key(ttype)
    }

    pub fn len(&self) -> usize {
        self.by_tref.values().filter(|t| t.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all_tags(&self) -> impl Iterator<Item = &Tag> {
        self.by_tref.values().filter(|t| t.is_live())
    }

    pub fn all_links(&self) -> Vec<Link> {
        let mut seen = HashSet::new();
        for (&a, neighbors) in self.adj.iter() {
            for &b in neighbors {
                if let Some(link) = Link::new(a, b) {
                    seen.insert(link);
                }
            }
        }
        seen.into_iter().collect()
    }

    // ---- write path, exclusive writer lock only ------------------------

    /// Apply a staged delta in the order spec.md §4.A specifies: ttype
    /// declarations, tag creations, link additions, link removals, tag
    /// removals. Returns the `Tref`s assigned to `delta.new_tags`, in order.
    pub(crate) fn install_delta(&mut self, delta: Delta, new_rev: Rev) -> Result<Vec<Tref>> {
        for ttype in &delta.declared_ttypes {
            self.by_type.entry(ttype.as_str().to_string()).or_default();
        }

        let mut assigned = Vec::with_capacity(delta.new_tags.len());
        for (ttype, val) in delta.new_tags {
            if let Some(existing) = self.lookup_by_identity(ttype.as_str(), &val) {
                assigned.push(existing);
                continue;
            }
            let tref = Tref(self.next_tref);
            self.next_tref += 1;
            let tag = Tag::new(tref, ttype.clone(), val.clone(), new_rev);
            self.by_type
                .entry(ttype.as_str().to_string())
                .or_default()
                .insert(val, tref);
            self.by_tref.insert(tref, tag);
            self.adj.entry(tref).or_default();
            assigned.push(tref);
        }

        for link in delta.added_links {
            if !self.link_live(link) {
                self.adj.entry(link.lo).or_default().insert(link.hi);
                self.adj.entry(link.hi).or_default().insert(link.lo);
            }
        }

        for link in delta.removed_links {
            if let Some(set) = self.adj.get_mut(&link.lo) {
                set.remove(&link.hi);
            }
            if let Some(set) = self.adj.get_mut(&link.hi) {
                set.remove(&link.lo);
            }
        }

        for ttype in &delta.dropped_ttypes {
            if self.cardinality_of_type(ttype.as_str()) == 0 {
                self.by_type.remove(ttype.as_str());
            }
        }

        for tref in delta.tombstoned {
            let removed = match self.by_tref.get_mut(&tref) {
                Some(tag) if tag.is_live() => {
                    tag.delete_rev = new_rev;
                    Some((tag.ttype.as_str().to_string(), tag.val.clone()))
                }
                _ => None,
            };
            if let Some((ttype, val)) = removed {
                if let Some(bucket) = self.by_type.get_mut(&ttype) {
                    bucket.remove(&val);
                    if bucket.is_empty() {
                        self.by_type.remove(&ttype);
                    }
                }
                // Adjacency cleanup: drop the tombstoned tref's own set and
                // its mention in every former neighbor's set.
                if let Some(neighbors) = self.adj.remove(&tref) {
                    for n in neighbors {
                        if let Some(set) = self.adj.get_mut(&n) {
                            set.remove(&tref);
                        }
                    }
                }
            }
        }

        Ok(assigned)
    }

    fn link_live(&self, link: Link) -> bool {
        self.adj
            .get(&link.lo)
            .map(|s| s.contains(&link.hi))
            .unwrap_or(false)
    }

    pub fn check_ttype_droppable(&self, ttype: &str) -> Result<()> {
        if self.cardinality_of_type(ttype) > 0 {
            return Err(Error::ValidationError(format!(
                "cannot drop ttype {:?}: live tags remain",
                ttype
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Ttype;

    fn ttype(s: &str) -> Ttype {
        Ttype::parse(s, 64).unwrap()
    }

    #[test]
    fn test_install_creates_and_indexes() {
        let mut g = Graph::new();
        let delta = Delta {
            new_tags: vec![(ttype("person"), "ada".into()), (ttype("language"), "python".into())],
            ..Default::default()
        };
        let assigned = g.install_delta(delta, Rev(1)).unwrap();
        assert_eq!(assigned.len(), 2);
        assert_eq!(g.lookup_by_identity("person", "ada"), Some(assigned[0]));
        assert_eq!(g.len(), 2);
    }

    #[test]
    fn test_add_tag_idempotent() {
        let mut g = Graph::new();
        let d1 = Delta {
            new_tags: vec![(ttype("language"), "python".into())],
            ..Default::default()
        };
        let a1 = g.install_delta(d1, Rev(1)).unwrap();
        let d2 = Delta {
            new_tags: vec![(ttype("language"), "python".into())],
            ..Default::default()
        };
        let a2 = g.install_delta(d2, Rev(2)).unwrap();
        assert_eq!(a1, a2);
        assert_eq!(g.cardinality_of_type("language"), 1);
    }

    #[test]
    fn test_adjacency_symmetric_and_dedup() {
        let mut g = Graph::new();
        let d = Delta {
            new_tags: vec![(ttype("a"), "x".into()), (ttype("b"), "y".into())],
            ..Default::default()
        };
        let t = g.install_delta(d, Rev(1)).unwrap();
        let link = Link::new(t[0], t[1]).unwrap();
        let d2 = Delta {
            added_links: vec![link, link],
            ..Default::default()
        };
        g.install_delta(d2, Rev(2)).unwrap();
        assert!(g.neighbors(t[0]).any(|n| n == t[1]));
        assert!(g.neighbors(t[1]).any(|n| n == t[0]));
        assert_eq!(g.neighbors(t[0]).count(), 1);
    }

    #[test]
    fn test_rem_tag_clears_links() {
        let mut g = Graph::new();
        let d = Delta {
            new_tags: vec![(ttype("a"), "x".into()), (ttype("b"), "y".into())],
            ..Default::default()
        };
        let t = g.install_delta(d, Rev(1)).unwrap();
        let link = Link::new(t[0], t[1]).unwrap();
        g.install_delta(
            Delta {
                added_links: vec![link],
                ..Default::default()
            },
            Rev(2),
        )
        .unwrap();
        g.install_delta(
            Delta {
                tombstoned: vec![t[0]],
                ..Default::default()
            },
            Rev(3),
        )
        .unwrap();
        assert_eq!(g.neighbors(t[1]).count(), 0);
        assert!(g.get(t[0]).unwrap().delete_rev == Rev(3));
    }

    #[test]
    fn test_tref_never_reused() {
        let mut g = Graph::new();
        let t = g
            .install_delta(
                Delta {
                    new_tags: vec![(ttype("a"), "x".into())],
                    ..Default::default()
                },
                Rev(1),
            )
            .unwrap();
        g.install_delta(
            Delta {
                tombstoned: vec![t[0]],
                ..Default::default()
            },
            Rev(2),
        )
        .unwrap();
        let t2 = g
            .install_delta(
                Delta {
                    new_tags: vec![(ttype("a"), "x".into())],
                    ..Default::default()
                },
                Rev(3),
            )
            .unwrap();
        assert_ne!(t[0], t2[0]);
        assert!(t2[0].0 > t[0].0);
    }
}
