//! WAL record types: `TXBEGIN`/`TXOP`/`TXCOMMIT` (spec.md §4.G), binary
//! framed the way the storage engine frames its own `wal_entry::Entry` /
//! `wal_op::Op` records — a bit-packed header followed by length-prefixed
//! fields — but with an explicit CRC32C trailer per record, since ZipTag's
//! WAL (unlike the storage engine's) is the *sole* durability path: there
//! is no separate on-disk index to cross-check a corrupted record against.

use std::convert::TryInto;

use crc::{Crc, CRC_32_ISCSI};

use crate::error::{Error, Result};
use crate::tag::Serialize as TagSerialize;
use crate::types::{Rev, Tref, Ttype};

/// CRC32C (Castagnoli), matching `CRC_32_ISCSI`'s polynomial.
const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum OpKind {
    AddTag = 1,
    RemTag = 2,
    Link = 3,
    Unlink = 4,
    DeclareTtype = 5,
    DropTtype = 6,
}

impl TryFrom<u8> for OpKind {
    type Error = Error;

    fn try_from(b: u8) -> Result<OpKind> {
        Ok(match b {
            1 => OpKind::AddTag,
            2 => OpKind::RemTag,
            3 => OpKind::Link,
            4 => OpKind::Unlink,
            5 => OpKind::DeclareTtype,
            6 => OpKind::DropTtype,
            _ => return Err(Error::DurabilityCorrupt(0)),
        })
    }
}

/// The payload carried by one staged op, pre-resolved to real `Tref`s
/// (placeholders never reach the WAL — `Tx::commit_locked` resolves them
/// first, see `tx.rs`).
#[derive(Clone, Debug, PartialEq)]
pub enum TxOpPayload {
    AddTag { tref: Tref, ttype: Ttype, val: String },
    RemTag { tref: Tref },
    Link { a: Tref, b: Tref },
    Unlink { a: Tref, b: Tref },
    DeclareTtype { ttype: Ttype },
    DropTtype { ttype: Ttype },
}

impl TxOpPayload {
    fn kind(&self) -> OpKind {
        match self {
            TxOpPayload::AddTag { .. } => OpKind::AddTag,
            TxOpPayload::RemTag { .. } => OpKind::RemTag,
            TxOpPayload::Link { .. } => OpKind::Link,
            TxOpPayload::Unlink { .. } => OpKind::Unlink,
            TxOpPayload::DeclareTtype { .. } => OpKind::DeclareTtype,
            TxOpPayload::DropTtype { .. } => OpKind::DropTtype,
        }
    }

    fn encode_fields(&self, buf: &mut Vec<u8>) {
        match self {
            TxOpPayload::AddTag { tref, ttype, val } => {
                tref.0.encode(buf);
                ttype.as_str().to_string().encode(buf);
                val.clone().encode(buf);
            }
            TxOpPayload::RemTag { tref } => tref.0.encode(buf),
            TxOpPayload::Link { a, b } | TxOpPayload::Unlink { a, b } => {
                a.0.encode(buf);
                b.0.encode(buf);
            }
            TxOpPayload::DeclareTtype { ttype } | TxOpPayload::DropTtype { ttype } => {
                ttype.as_str().to_string().encode(buf);
            }
        }
    }

    fn decode_fields(kind: OpKind, buf: &[u8]) -> Result<TxOpPayload> {
        let mut off = 0;
        let mut take_u64 = |b: &[u8]| -> Result<u64> {
            let (v, n) = u64::decode(&b[off..])?;
            off += n;
            Ok(v)
        };
        match kind {
            OpKind::AddTag => {
                let tref = Tref(take_u64(buf)?);
                let (ttype_s, n) = String::decode(&buf[off..])?;
                off += n;
                let (val, _) = String::decode(&buf[off..])?;
                let ttype = Ttype::parse(ttype_s, usize::MAX).map_err(|_| Error::DurabilityCorrupt(0))?;
                Ok(TxOpPayload::AddTag { tref, ttype, val })
            }
            OpKind::RemTag => Ok(TxOpPayload::RemTag { tref: Tref(take_u64(buf)?) }),
            OpKind::Link => {
                let a = Tref(take_u64(buf)?);
                let b = Tref(take_u64(buf)?);
                Ok(TxOpPayload::Link { a, b })
            }
            OpKind::Unlink => {
                let a = Tref(take_u64(buf)?);
                let b = Tref(take_u64(buf)?);
                Ok(TxOpPayload::Unlink { a, b })
            }
            OpKind::DeclareTtype => {
                let (ttype_s, _) = String::decode(&buf[off..])?;
                let ttype = Ttype::parse(ttype_s, usize::MAX).map_err(|_| Error::DurabilityCorrupt(0))?;
                Ok(TxOpPayload::DeclareTtype { ttype })
            }
            OpKind::DropTtype => {
                let (ttype_s, _) = String::decode(&buf[off..])?;
                let ttype = Ttype::parse(ttype_s, usize::MAX).map_err(|_| Error::DurabilityCorrupt(0))?;
                Ok(TxOpPayload::DropTtype { ttype })
            }
        }
    }
}

// Variant names spell out the TXBEGIN/TXOP/TXCOMMIT record kinds from
// spec.md §4.G; the shared `Tx` prefix is the wire vocabulary, not
// accidental repetition.
#[allow(clippy::enum_variant_names)]
#[derive(Clone, Debug, PartialEq)]
pub enum Record {
    TxBegin { txid: u64, parent_rev: Rev, ts_ms: u64 },
    TxOp { txid: u64, index: u32, payload: TxOpPayload },
    TxCommit { txid: u64, new_rev: Rev },
}

#[allow(clippy::enum_variant_names)]
#[repr(u8)]
enum RecordTag {
    TxBegin = 1,
    TxOp = 2,
    TxCommit = 3,
}

impl Record {
    /// Append `record`'s framed bytes (tag, len, body, crc32c) to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut body = Vec::new();
        let tag = match self {
            Record::TxBegin { txid, parent_rev, ts_ms } => {
                txid.encode(&mut body);
                parent_rev.0.encode(&mut body);
                ts_ms.encode(&mut body);
                RecordTag::TxBegin
            }
            Record::TxOp { txid, index, payload } => {
                txid.encode(&mut body);
                (*index as u64).encode(&mut body);
                (payload.kind() as u8 as u64).encode(&mut body);
                payload.encode_fields(&mut body);
                RecordTag::TxOp
            }
            Record::TxCommit { txid, new_rev } => {
                txid.encode(&mut body);
                new_rev.0.encode(&mut body);
                RecordTag::TxCommit
            }
        };
        let len: u32 = body.len().try_into().expect("wal record too large");
        let crc = CRC32C.checksum(&body);
        buf.push(tag as u8);
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&body);
        buf.extend_from_slice(&crc.to_le_bytes());
    }

    /// Decode one framed record starting at `buf[0]`. Returns the record
    /// and the total number of bytes consumed (header + body + crc).
    /// `Ok(None)` signals a truncated trailing record — treated as
    /// end-of-log, not corruption (spec.md §4.G).
    pub fn decode(buf: &[u8]) -> Result<Option<(Record, usize)>> {
        const HEADER_LEN: usize = 1 + 4;
        const CRC_LEN: usize = 4;
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let tag = buf[0];
        let len = u32::from_le_bytes(buf[1..5].try_into().unwrap()) as usize;
        let total = HEADER_LEN + len + CRC_LEN;
        if buf.len() < total {
            return Ok(None);
        }
        let body = &buf[HEADER_LEN..HEADER_LEN + len];
        let stored_crc = u32::from_le_bytes(buf[HEADER_LEN + len..total].try_into().unwrap());
        let actual_crc = CRC32C.checksum(body);
        if stored_crc != actual_crc {
            return Err(Error::DurabilityCorrupt(0));
        }
        let record = Self::decode_body(tag, body)?;
        Ok(Some((record, total)))
    }

    fn decode_body(tag: u8, body: &[u8]) -> Result<Record> {
        let mut off = 0;
        let mut take_u64 = |b: &[u8]| -> Result<u64> {
            let (v, n) = u64::decode(&b[off..])?;
            off += n;
            Ok(v)
        };
        match tag {
            t if t == RecordTag::TxBegin as u8 => {
                let txid = take_u64(body)?;
                let parent_rev = Rev(take_u64(body)?);
                let ts_ms = take_u64(body)?;
                Ok(Record::TxBegin { txid, parent_rev, ts_ms })
            }
            t if t == RecordTag::TxOp as u8 => {
                let txid = take_u64(body)?;
                let index = take_u64(body)? as u32;
                let kind = OpKind::try_from(take_u64(body)? as u8)?;
                let payload = TxOpPayload::decode_fields(kind, &body[off..])?;
                Ok(Record::TxOp { txid, index, payload })
            }
            t if t == RecordTag::TxCommit as u8 => {
                let txid = take_u64(body)?;
                let new_rev = Rev(take_u64(body)?);
                Ok(Record::TxCommit { txid, new_rev })
            }
            _ => Err(Error::DurabilityCorrupt(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_txbegin() {
        let rec = Record::TxBegin { txid: 7, parent_rev: Rev(3), ts_ms: 1000 };
        let mut buf = Vec::new();
        rec.encode(&mut buf);
        let (decoded, n) = Record::decode(&buf).unwrap().unwrap();
        assert_eq!(n, buf.len());
        assert_eq!(decoded, rec);
    }

    #[test]
    fn test_roundtrip_txop_add_tag() {
        let rec = Record::TxOp {
            txid: 1,
            index: 0,
            payload: TxOpPayload::AddTag {
                tref: Tref(5),
                ttype: Ttype::parse("person", 64).unwrap(),
                val: "ada".into(),
            },
        };
        let mut buf = Vec::new();
        rec.encode(&mut buf);
        let (decoded, n) = Record::decode(&buf).unwrap().unwrap();
        assert_eq!(n, buf.len());
        assert_eq!(decoded, rec);
    }

    #[test]
    fn test_truncated_record_is_not_corruption() {
        let rec = Record::TxCommit { txid: 1, new_rev: Rev(2) };
        let mut buf = Vec::new();
        rec.encode(&mut buf);
        buf.truncate(buf.len() - 1);
        assert!(Record::decode(&buf).unwrap().is_none());
    }

    #[test]
    fn test_crc_mismatch_is_corruption() {
        let rec = Record::TxCommit { txid: 1, new_rev: Rev(2) };
        let mut buf = Vec::new();
        rec.encode(&mut buf);
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        assert!(matches!(Record::decode(&buf), Err(Error::DurabilityCorrupt(_))));
    }

    #[test]
    fn test_multiple_records_concatenated() {
        let recs = vec![
            Record::TxBegin { txid: 1, parent_rev: Rev(0), ts_ms: 1 },
            Record::TxOp { txid: 1, index: 0, payload: TxOpPayload::DeclareTtype { ttype: Ttype::parse("person", 64).unwrap() } },
            Record::TxCommit { txid: 1, new_rev: Rev(1) },
        ];
        let mut buf = Vec::new();
        for r in &recs {
            r.encode(&mut buf);
        }
        let mut off = 0;
        let mut got = Vec::new();
        while off < buf.len() {
            let (rec, n) = Record::decode(&buf[off..]).unwrap().unwrap();
            got.push(rec);
            off += n;
        }
        assert_eq!(got, recs);
    }
}
