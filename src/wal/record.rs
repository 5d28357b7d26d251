//! Wire framing for a single WAL record.
//!
//! `[u32 length][u8 version][u64 group_hash][u64 index][u64 term][u8 kind][bytes payload][u32 crc32c]`
//!
//! `length` covers everything after itself, including the trailing checksum.
//! The checksum covers everything between `length` and itself.

use crate::error::{RaftError, Result};
use crate::types::{GroupId, LogIndex, Term};

pub const CURRENT_VERSION: u8 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    UserCommand = 0,
    ClusterConfig = 1,
    Noop = 2,
}

impl RecordKind {
    fn from_u8(b: u8) -> Result<Self> {
        match b {
            0 => Ok(RecordKind::UserCommand),
            1 => Ok(RecordKind::ClusterConfig),
            2 => Ok(RecordKind::Noop),
            other => Err(RaftError::Serialization(format!("unknown record kind byte {other}"))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct WalRecord {
    pub group_id: GroupId,
    pub index: LogIndex,
    pub term: Term,
    pub kind: RecordKind,
    pub payload: Vec<u8>,
}

impl WalRecord {
    /// Encodes the full framed record, ready to append to the WAL file.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(1 + 8 + 8 + 8 + 1 + self.payload.len());
        body.push(CURRENT_VERSION);
        body.extend_from_slice(&self.group_id.hash64().to_le_bytes());
        body.extend_from_slice(&self.index.0.to_le_bytes());
        body.extend_from_slice(&self.term.0.to_le_bytes());
        body.push(self.kind as u8);
        body.extend_from_slice(&self.payload);

        let checksum = crc32c::crc32c(&body);
        let length = (body.len() + 4) as u32;

        let mut out = Vec::with_capacity(4 + body.len() + 4);
        out.extend_from_slice(&length.to_le_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(&checksum.to_le_bytes());
        out
    }

    /// Attempts to decode one framed record from the front of `buf`.
    ///
    /// Returns `Ok(None)` if `buf` does not yet contain a complete record
    /// (the caller should wait for more bytes, e.g. mid-write on crash
    /// recovery). Returns `Err` if the record is corrupt.
    pub fn decode(buf: &[u8]) -> Result<Option<(WalRecord, usize)>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        let total = 4 + length;
        if buf.len() < total {
            return Ok(None);
        }
        let body = &buf[4..total - 4];
        let stored_crc = u32::from_le_bytes(buf[total - 4..total].try_into().unwrap());
        let actual_crc = crc32c::crc32c(body);
        if actual_crc != stored_crc {
            return Err(RaftError::Serialization("WAL record checksum mismatch".into()));
        }

        let mut off = 0usize;
        let version = body[off];
        off += 1;
        if version != CURRENT_VERSION {
            return Err(RaftError::Serialization(format!("unsupported WAL record version {version}")));
        }
        let group_hash = u64::from_le_bytes(body[off..off + 8].try_into().unwrap());
        off += 8;
        let index = u64::from_le_bytes(body[off..off + 8].try_into().unwrap());
        off += 8;
        let term = u64::from_le_bytes(body[off..off + 8].try_into().unwrap());
        off += 8;
        let kind = RecordKind::from_u8(body[off])?;
        off += 1;
        let payload = body[off..].to_vec();

        Ok(Some((
            WalRecord {
                group_id: GroupId::new(group_hash),
                index: LogIndex(index),
                term: Term(term),
                kind,
                payload,
            },
            total,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let rec = WalRecord {
            group_id: GroupId::new(7),
            index: LogIndex(42),
            term: Term(3),
            kind: RecordKind::UserCommand,
            payload: b"hello".to_vec(),
        };
        let encoded = rec.encode();
        let (decoded, consumed) = WalRecord::decode(&encoded).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.index, rec.index);
        assert_eq!(decoded.term, rec.term);
        assert_eq!(decoded.payload, rec.payload);
    }

    #[test]
    fn detects_corruption() {
        let rec = WalRecord {
            group_id: GroupId::new(1),
            index: LogIndex(1),
            term: Term(1),
            kind: RecordKind::Noop,
            payload: vec![],
        };
        let mut encoded = rec.encode();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        assert!(WalRecord::decode(&encoded).is_err());
    }

    #[test]
    fn incomplete_buffer_returns_none() {
        let rec = WalRecord {
            group_id: GroupId::new(1),
            index: LogIndex(1),
            term: Term(1),
            kind: RecordKind::Noop,
            payload: vec![1, 2, 3],
        };
        let encoded = rec.encode();
        assert!(WalRecord::decode(&encoded[..encoded.len() - 1]).unwrap().is_none());
    }
}
