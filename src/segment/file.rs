//! On-disk shape of one immutable per-group segment file.
//!
//! A segment is a sequence of framed records (the same framing the WAL
//! uses, see [`crate::wal::record`]) followed by a footer: an offset index
//! mapping each entry's index to its byte offset, plus a fixed trailer so
//! the footer can be located by reading backward from EOF.

use crate::error::Result;
use crate::types::LogIndex;
use crate::wal::record::WalRecord;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const TRAILER_MAGIC: u32 = 0x5347_4d54; // "SGMT"

pub struct SegmentFile {
    pub path: PathBuf,
    file: File,
    pub first_index: Option<LogIndex>,
    pub last_index: Option<LogIndex>,
    pub bytes_written: u64,
    index: Vec<(LogIndex, u64)>,
}

impl SegmentFile {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
        Ok(SegmentFile { path, file, first_index: None, last_index: None, bytes_written: 0, index: Vec::new() })
    }

    pub fn append(&mut self, record: &WalRecord) -> Result<()> {
        let offset = self.bytes_written;
        let encoded = record.encode();
        self.file.write_all(&encoded)?;
        self.bytes_written += encoded.len() as u64;
        self.index.push((record.index, offset));
        if self.first_index.is_none() {
            self.first_index = Some(record.index);
        }
        self.last_index = Some(record.index);
        Ok(())
    }

    pub fn entry_count(&self) -> usize {
        self.index.len()
    }

    /// Flushes and fsyncs the records written so far without sealing the
    /// segment — it stays open and mutable for further appends. Used to
    /// make a batch of appends crash-safe before the WAL file that fed them
    /// is deleted, independent of whether a rollover threshold has fired.
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Writes the offset-index footer and fsyncs. After this the segment
    /// is immutable.
    pub fn seal(&mut self) -> Result<()> {
        let footer_start = self.bytes_written;
        let mut footer = Vec::with_capacity(self.index.len() * 16 + 16);
        for (idx, off) in &self.index {
            footer.extend_from_slice(&idx.0.to_le_bytes());
            footer.extend_from_slice(&off.to_le_bytes());
        }
        let entry_count = self.index.len() as u64;
        self.file.write_all(&footer)?;
        self.file.write_all(&entry_count.to_le_bytes())?;
        self.file.write_all(&footer_start.to_le_bytes())?;
        self.file.write_all(&TRAILER_MAGIC.to_le_bytes())?;
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Reopens a previously sealed segment, reading its footer to build the
    /// offset index without scanning the whole file.
    pub fn open_sealed(path: impl AsRef<Path>) -> Result<(Self, Vec<(LogIndex, u64)>)> {
        let path = path.as_ref().to_path_buf();
        let mut file = std::fs::OpenOptions::new().read(true).open(&path)?;
        let len = file.metadata()?.len();

        file.seek(SeekFrom::End(-16))?;
        let mut trailer = [0u8; 16];
        file.read_exact(&mut trailer)?;
        let entry_count = u64::from_le_bytes(trailer[0..8].try_into().unwrap());
        let footer_start = u64::from_le_bytes(trailer[8..16].try_into().unwrap());

        file.seek(SeekFrom::Start(footer_start))?;
        let mut footer = vec![0u8; (entry_count as usize) * 16];
        file.read_exact(&mut footer)?;

        let mut index = Vec::with_capacity(entry_count as usize);
        for chunk in footer.chunks_exact(16) {
            let idx = u64::from_le_bytes(chunk[0..8].try_into().unwrap());
            let off = u64::from_le_bytes(chunk[8..16].try_into().unwrap());
            index.push((LogIndex(idx), off));
        }

        let first_index = index.first().map(|(i, _)| *i);
        let last_index = index.last().map(|(i, _)| *i);
        let reopened = std::fs::OpenOptions::new().read(true).write(true).open(&path)?;
        let segment = SegmentFile {
            path,
            file: reopened,
            first_index,
            last_index,
            bytes_written: len,
            index: index.clone(),
        };
        Ok((segment, index))
    }

    pub fn read_at(&self, offset: u64) -> Result<WalRecord> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf)?;
        let length = u32::from_le_bytes(len_buf) as usize;
        let mut rest = vec![0u8; length];
        file.read_exact(&mut rest)?;
        let mut full = Vec::with_capacity(4 + length);
        full.extend_from_slice(&len_buf);
        full.extend_from_slice(&rest);
        let (record, _) = WalRecord::decode(&full)?.ok_or_else(|| {
            crate::error::RaftError::Serialization("truncated segment record".into())
        })?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GroupId, Term};
    use crate::wal::record::RecordKind;

    #[test]
    fn write_then_reopen_sealed_segment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0001.segment");
        let mut seg = SegmentFile::create(&path).unwrap();
        for i in 1..=5u64 {
            let rec = WalRecord {
                group_id: GroupId::new(1),
                index: LogIndex(i),
                term: Term(1),
                kind: RecordKind::UserCommand,
                payload: vec![i as u8; 4],
            };
            seg.append(&rec).unwrap();
        }
        seg.seal().unwrap();

        let (reopened, index) = SegmentFile::open_sealed(&path).unwrap();
        assert_eq!(index.len(), 5);
        assert_eq!(reopened.first_index, Some(LogIndex(1)));
        assert_eq!(reopened.last_index, Some(LogIndex(5)));
        let (_, offset) = index[2];
        let rec = reopened.read_at(offset).unwrap();
        assert_eq!(rec.index, LogIndex(3));
    }
}
