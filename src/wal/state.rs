//! The crash-consistent state record, `state.bin`.
//!
//! A single fixed-size record holding everything the store must know before
//! it can serve: log extent, commit index, the node's hard state and the
//! active configuration fingerprint. The record is rewritten in place at
//! offset 0 and guarded by a crc32 trailer.

use std::io::SeekFrom;
use std::path::Path;

use bytes::Buf;
use bytes::BufMut;
use tokio::fs::File;
use tokio::fs::OpenOptions;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeekExt;
use tokio::io::AsyncWriteExt;

use crate::error::WalError;
use crate::membership::NodeId;
use crate::wal::WriteMode;

const STATE_MAGIC: u32 = 0x52_57_53_54; // "RWST"
const STATE_VERSION: u32 = 1;

/// The persistent state record of a log store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateRecord {
    pub node_id: NodeId,
    pub last_index: u64,
    pub last_term: u64,
    pub commit_index: u64,
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub config_fingerprint: u64,
}

impl StateRecord {
    /// The encoded size: magic, version, six u64 fields, vote presence byte,
    /// vote value, crc32.
    pub const SIZE: usize = 4 + 4 + 8 * 6 + 1 + 8 + 4;

    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.put_u32_le(STATE_MAGIC);
        buf.put_u32_le(STATE_VERSION);
        buf.put_u64_le(self.node_id);
        buf.put_u64_le(self.last_index);
        buf.put_u64_le(self.last_term);
        buf.put_u64_le(self.commit_index);
        buf.put_u64_le(self.current_term);
        buf.put_u64_le(self.config_fingerprint);
        match self.voted_for {
            None => {
                buf.put_u8(0);
                buf.put_u64_le(0);
            }
            Some(id) => {
                buf.put_u8(1);
                buf.put_u64_le(id);
            }
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf);
        buf.put_u32_le(hasher.finalize());
        buf
    }

    fn decode(raw: &[u8]) -> Result<Self, WalError> {
        if raw.len() < Self::SIZE {
            return Err(WalError::Corruption("state record is truncated".into()));
        }
        let (body, crc_bytes) = raw[..Self::SIZE].split_at(Self::SIZE - 4);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(body);
        let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        if hasher.finalize() != expected {
            return Err(WalError::Corruption("state record checksum mismatch".into()));
        }

        let mut buf = body;
        if buf.get_u32_le() != STATE_MAGIC {
            return Err(WalError::Corruption("state record bad magic".into()));
        }
        if buf.get_u32_le() != STATE_VERSION {
            return Err(WalError::Corruption("state record unsupported version".into()));
        }
        let node_id = buf.get_u64_le();
        let last_index = buf.get_u64_le();
        let last_term = buf.get_u64_le();
        let commit_index = buf.get_u64_le();
        let current_term = buf.get_u64_le();
        let config_fingerprint = buf.get_u64_le();
        let voted_for = match buf.get_u8() {
            0 => {
                let _ = buf.get_u64_le();
                None
            }
            _ => Some(buf.get_u64_le()),
        };
        Ok(Self {
            node_id,
            last_index,
            last_term,
            commit_index,
            current_term,
            voted_for,
            config_fingerprint,
        })
    }
}

/// The on-disk home of the state record, holding an open handle for in-place
/// rewrites.
pub(crate) struct StateFile {
    file: tokio::sync::Mutex<File>,
}

impl StateFile {
    /// Open or create `state.bin`, returning the loaded (or freshly
    /// initialized) record. A checksum mismatch is fatal when
    /// `integrity_check` is set; otherwise the record is rebuilt and the
    /// caller reconciles against the partition files.
    pub(crate) async fn open(
        path: &Path,
        node_id: NodeId,
        integrity_check: bool,
    ) -> Result<(Self, StateRecord, bool), WalError> {
        let exists = tokio::fs::metadata(path).await.is_ok();
        let mut file = OpenOptions::new().read(true).write(true).create(true).open(path).await?;

        if !exists {
            let record = StateRecord::new(node_id);
            let this = Self { file: tokio::sync::Mutex::new(file) };
            this.save(&record, WriteMode::WriteThrough).await?;
            return Ok((this, record, true));
        }

        let mut raw = vec![0u8; StateRecord::SIZE];
        file.seek(SeekFrom::Start(0)).await?;
        let record = match file.read_exact(&mut raw).await {
            Ok(_) => match StateRecord::decode(&raw) {
                Ok(record) => record,
                Err(err) if integrity_check => return Err(err),
                Err(_) => StateRecord::new(node_id),
            },
            Err(_) if !integrity_check => StateRecord::new(node_id),
            Err(err) => return Err(WalError::Io(err)),
        };
        Ok((Self { file: tokio::sync::Mutex::new(file) }, record, false))
    }

    /// Rewrite the record in place.
    ///
    /// Hard-state changes (term, vote) are always written through: a vote
    /// must be durable before the node responds to the candidate. The
    /// configured write mode only relaxes flushing of extent updates.
    pub(crate) async fn save(&self, record: &StateRecord, mode: WriteMode) -> Result<(), WalError> {
        let raw = record.encode();
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(0)).await?;
        file.write_all(&raw).await?;
        match mode {
            WriteMode::NoFlush => {}
            WriteMode::AutoFlush => file.flush().await?,
            WriteMode::WriteThrough => file.sync_data().await?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");

        let (file, mut record, fresh) = StateFile::open(&path, 7, true).await.unwrap();
        assert!(fresh);
        assert_eq!(record.node_id, 7);

        record.last_index = 200;
        record.last_term = 3;
        record.commit_index = 150;
        record.current_term = 4;
        record.voted_for = Some(2);
        record.config_fingerprint = 99;
        file.save(&record, WriteMode::WriteThrough).await.unwrap();
        drop(file);

        let (_, loaded, fresh) = StateFile::open(&path, 7, true).await.unwrap();
        assert!(!fresh);
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_fatal_with_integrity_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");
        {
            let (file, record, _) = StateFile::open(&path, 1, true).await.unwrap();
            file.save(&record, WriteMode::WriteThrough).await.unwrap();
        }
        let mut raw = std::fs::read(&path).unwrap();
        raw[10] ^= 0xFF;
        std::fs::write(&path, raw).unwrap();

        let res = StateFile::open(&path, 1, true).await;
        assert!(matches!(res, Err(WalError::Corruption(_))));

        // Without the integrity check the record is rebuilt instead.
        let (_, rebuilt, _) = StateFile::open(&path, 1, false).await.unwrap();
        assert_eq!(rebuilt, StateRecord::new(1));
    }
}
