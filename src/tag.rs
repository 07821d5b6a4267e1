//! `Tag` and `Link`, the two graph primitives, plus the binary `Serialize`
//! trait used to encode both onto WAL/snapshot records.

use std::convert::TryInto;

use crate::error::{Error, Result};
use crate::types::{Rev, Tref, Ttype, REV_LIVE};

/// Binary encode/decode, mirroring the storage engine's `core::Serialize`
/// trait: encode appends to a scratch buffer, decode consumes a byte slice
/// and returns how many bytes it read.
pub trait Serialize: Sized {
    fn encode(&self, buf: &mut Vec<u8>);
    fn decode(buf: &[u8]) -> Result<(Self, usize)>;
}

impl Serialize for String {
    fn encode(&self, buf: &mut Vec<u8>) {
        let len: u32 = self.len().try_into().expect("string too large to encode");
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(self.as_bytes());
    }

    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 4 {
            return Err(Error::DurabilityCorrupt(0));
        }
        let len = u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;
        if buf.len() < 4 + len {
            return Err(Error::DurabilityCorrupt(0));
        }
        let s = String::from_utf8(buf[4..4 + len].to_vec())
            .map_err(|e| Error::DurabilityIoFailed(e.to_string()))?;
        Ok((s, 4 + len))
    }
}

impl Serialize for u64 {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 8 {
            return Err(Error::DurabilityCorrupt(0));
        }
        Ok((u64::from_le_bytes(buf[..8].try_into().unwrap()), 8))
    }
}

/// A tag: `(ttype, val)` is its immutable identity, `tref` its fast handle.
#[derive(Clone, Debug)]
pub struct Tag {
    pub tref: Tref,
    pub ttype: Ttype,
    pub val: String,
    pub create_rev: Rev,
    pub delete_rev: Rev,
}

impl Tag {
    pub fn new(tref: Tref, ttype: Ttype, val: String, create_rev: Rev) -> Tag {
        Tag {
            tref,
            ttype,
            val,
            create_rev,
            delete_rev: Rev(REV_LIVE),
        }
    }

    #[inline]
    pub fn is_live_at(&self, rev: Rev) -> bool {
        self.create_rev <= rev && rev < self.delete_rev
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.delete_rev.0 == REV_LIVE
    }
}

impl Serialize for Tag {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.tref.0.encode(buf);
        self.ttype.as_str().to_string().encode(buf);
        self.val.encode(buf);
        self.create_rev.0.encode(buf);
        self.delete_rev.0.encode(buf);
    }

    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let mut off = 0;
        let (tref, n) = u64::decode(&buf[off..])?;
        off += n;
        let (ttype_s, n) = String::decode(&buf[off..])?;
        off += n;
        let (val, n) = String::decode(&buf[off..])?;
        off += n;
        let (create_rev, n) = u64::decode(&buf[off..])?;
        off += n;
        let (delete_rev, n) = u64::decode(&buf[off..])?;
        off += n;
        let ttype = Ttype::parse(ttype_s, usize::MAX)
            .map_err(|_| Error::DurabilityCorrupt(0))?;
        Ok((
            Tag {
                tref: Tref(tref),
                ttype,
                val,
                create_rev: Rev(create_rev),
                delete_rev: Rev(delete_rev),
            },
            off,
        ))
    }
}

/// An unordered, bidirectional link between two distinct tags. Always
/// normalized so `lo <= hi`, making `Link` equality/hashing order-independent.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Link {
    pub lo: Tref,
    pub hi: Tref,
}

impl Link {
    /// Construct a normalized link. Returns `None` for a self-link.
    pub fn new(a: Tref, b: Tref) -> Option<Link> {
        if a == b {
            None
        } else if a.0 < b.0 {
            Some(Link { lo: a, hi: b })
        } else {
            Some(Link { lo: b, hi: a })
        }
    }
}

impl Serialize for Link {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.lo.0.encode(buf);
        self.hi.0.encode(buf);
    }

    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let mut off = 0;
        let (lo, n) = u64::decode(&buf[off..])?;
        off += n;
        let (hi, n) = u64::decode(&buf[off..])?;
        off += n;
        Ok((
            Link {
                lo: Tref(lo),
                hi: Tref(hi),
            },
            off,
        ))
    }
}
