//! Component G snapshot path: an atomic point-in-time image of committed
//! state (`ziptag-snapshot-<rev>.bin`) plus the `MANIFEST` pointer file,
//! grounded in the storage engine's `bubt_config`/`robt_snap`
//! write-to-temp-then-rename discipline.

use std::path::Path;

use log::info;

use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::tag::{Link, Serialize, Tag};
use crate::types::Rev;
use crate::util;

/// Build a snapshot image from a read-only graph and write it atomically.
/// Only live tags/links are included — tombstones are dropped, which is
/// the compaction spec.md §2 calls "physical reclamation."
pub fn build(graph: &Graph, rev: Rev, path: &Path) -> Result<()> {
    let tags: Vec<&Tag> = graph.all_tags().collect();
    let links = graph.all_links();
    let mut buf = Vec::new();
    rev.0.encode(&mut buf);
    (graph.next_tref()).encode(&mut buf);
    (tags.len() as u64).encode(&mut buf);
    for tag in &tags {
        tag.encode(&mut buf);
    }
    (links.len() as u64).encode(&mut buf);
    for link in &links {
        link.encode(&mut buf);
    }
    util::write_atomic(path, &buf)?;
    info!("snapshot: wrote {} tag(s), {} link(s) at rev {} to {:?}", tags.len(), links.len(), rev, path);
    Ok(())
}

/// Load a snapshot image back into a fresh `Graph`.
pub fn load(path: &Path) -> Result<(Graph, Rev)> {
    let bytes = std::fs::read(path)?;
    let mut off = 0;
    let (rev, n) = u64::decode(&bytes[off..])?;
    off += n;
    let (next_tref, n) = u64::decode(&bytes[off..])?;
    off += n;
    let (tag_count, n) = u64::decode(&bytes[off..])?;
    off += n;
    let mut tags = Vec::with_capacity(tag_count as usize);
    for _ in 0..tag_count {
        let (tag, n) = Tag::decode(&bytes[off..])?;
        off += n;
        tags.push(tag);
    }
    let (link_count, n) = u64::decode(&bytes[off..])?;
    off += n;
    let mut links = Vec::with_capacity(link_count as usize);
    for _ in 0..link_count {
        let (link, n) = Link::decode(&bytes[off..])?;
        off += n;
        links.push(link);
    }
    let graph = Graph::restore(tags, links, next_tref);
    Ok((graph, Rev(rev)))
}

/// The durable pointer to "what to load on startup": latest snapshot rev
/// and the WAL segment recovery should resume scanning from (spec.md §5:
/// "MANIFEST (plain text: latest snapshot rev, WAL head segment)").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Manifest {
    pub snapshot_rev: Rev,
    pub wal_head_segment: usize,
}

impl Manifest {
    pub fn write(&self, path: &Path) -> Result<()> {
        let text = format!("snapshot_rev={}\nwal_head_segment={}\n", self.snapshot_rev.0, self.wal_head_segment);
        util::write_atomic(path, text.as_bytes())
    }

    pub fn read(path: &Path) -> Result<Option<Manifest>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path)?;
        let mut snapshot_rev = None;
        let mut wal_head_segment = None;
        for line in text.lines() {
            let (key, val) = line
                .split_once('=')
                .ok_or_else(|| Error::DurabilityIoFailed(format!("malformed MANIFEST line: {:?}", line)))?;
            match key {
                "snapshot_rev" => snapshot_rev = Some(val.parse::<u64>().map(Rev).map_err(|e| Error::DurabilityIoFailed(e.to_string()))?),
                "wal_head_segment" => {
                    wal_head_segment = Some(val.parse::<usize>().map_err(|e| Error::DurabilityIoFailed(e.to_string()))?)
                }
                _ => {}
            }
        }
        match (snapshot_rev, wal_head_segment) {
            (Some(snapshot_rev), Some(wal_head_segment)) => Ok(Some(Manifest { snapshot_rev, wal_head_segment })),
            _ => Err(Error::DurabilityIoFailed("MANIFEST missing required fields".into())),
        }
    }
}
