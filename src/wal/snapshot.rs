//! The snapshot file, `snapshot.bin`.
//!
//! Header (magic, version, snapshot index, snapshot term, configuration
//! fingerprint, payload length, header crc32) followed by the raw
//! state-machine payload. When a snapshot is present it logically stands in
//! for every entry with index at or below its index; partitions fully
//! covered by it are deleted.

use std::io::SeekFrom;
use std::path::Path;

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeekExt;

use crate::error::WalError;

const SNAPSHOT_MAGIC: u32 = 0x52_57_53_4E; // "RWSN"
const SNAPSHOT_VERSION: u32 = 1;

/// The fixed header of a snapshot file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    /// The highest log index the snapshot covers, inclusive.
    pub index: u64,
    /// The term of that index.
    pub term: u64,
    /// Fingerprint of the configuration active at `index`.
    pub config_fingerprint: u64,
    /// Length of the state-machine payload that follows the header.
    pub payload_len: u64,
}

impl SnapshotHeader {
    pub const SIZE: usize = 4 + 4 + 8 * 4 + 4;

    /// Encode the header, including its crc32 trailer.
    ///
    /// The header frames every snapshot transfer as well: both ends of an
    /// InstallSnapshot stream parse it to learn the exact byte length and
    /// identity of the file in flight.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.put_u32_le(SNAPSHOT_MAGIC);
        buf.put_u32_le(SNAPSHOT_VERSION);
        buf.put_u64_le(self.index);
        buf.put_u64_le(self.term);
        buf.put_u64_le(self.config_fingerprint);
        buf.put_u64_le(self.payload_len);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf);
        buf.put_u32_le(hasher.finalize());
        buf
    }

    /// Decode and checksum-verify a header from the first [`Self::SIZE`]
    /// bytes of a snapshot file or stream.
    pub(crate) fn decode(raw: &[u8]) -> Result<Self, WalError> {
        if raw.len() < Self::SIZE {
            return Err(WalError::Corruption("snapshot header is truncated".into()));
        }
        let (body, crc_bytes) = raw[..Self::SIZE].split_at(Self::SIZE - 4);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(body);
        let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        if hasher.finalize() != expected {
            return Err(WalError::Corruption("snapshot header checksum mismatch".into()));
        }

        let mut buf = body;
        if buf.get_u32_le() != SNAPSHOT_MAGIC {
            return Err(WalError::Corruption("snapshot header bad magic".into()));
        }
        if buf.get_u32_le() != SNAPSHOT_VERSION {
            return Err(WalError::Corruption("snapshot header unsupported version".into()));
        }
        Ok(Self {
            index: buf.get_u64_le(),
            term: buf.get_u64_le(),
            config_fingerprint: buf.get_u64_le(),
            payload_len: buf.get_u64_le(),
        })
    }
}

/// Atomically write a complete snapshot file: header plus payload into a
/// temporary file, rename over the target, fsync the parent directory.
pub(crate) async fn write_snapshot(path: &Path, header: &SnapshotHeader, payload: &[u8]) -> Result<(), WalError> {
    debug_assert_eq!(header.payload_len as usize, payload.len());
    let tmp = path.with_extension("tmp");

    let mut raw = header.encode();
    raw.extend_from_slice(payload);
    tokio::fs::write(&tmp, &raw).await?;
    tokio::fs::rename(&tmp, path).await?;

    if let Some(parent) = path.parent() {
        let dir = File::open(parent).await?;
        dir.sync_all().await?;
    }
    Ok(())
}

/// Read the header of the snapshot file, or `None` when no snapshot exists.
pub(crate) async fn read_header(path: &Path) -> Result<Option<SnapshotHeader>, WalError> {
    let mut file = match File::open(path).await {
        Ok(f) => f,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(WalError::Io(err)),
    };
    let mut raw = vec![0u8; SnapshotHeader::SIZE];
    file.read_exact(&mut raw).await?;
    Ok(Some(SnapshotHeader::decode(&raw)?))
}

/// Read the state-machine payload of the snapshot file.
pub(crate) async fn read_payload(path: &Path) -> Result<Bytes, WalError> {
    let mut file = File::open(path).await?;
    let mut raw = vec![0u8; SnapshotHeader::SIZE];
    file.read_exact(&mut raw).await?;
    let header = SnapshotHeader::decode(&raw)?;

    let mut payload = vec![0u8; header.payload_len as usize];
    file.seek(SeekFrom::Start(SnapshotHeader::SIZE as u64)).await?;
    file.read_exact(&mut payload).await?;
    Ok(Bytes::from(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.bin");
        assert_eq!(read_header(&path).await.unwrap(), None);

        let header = SnapshotHeader {
            index: 800,
            term: 3,
            config_fingerprint: 42,
            payload_len: 12,
        };
        write_snapshot(&path, &header, b"machine-bits").await.unwrap();

        assert_eq!(read_header(&path).await.unwrap(), Some(header));
        assert_eq!(read_payload(&path).await.unwrap(), Bytes::from_static(b"machine-bits"));
    }

    #[tokio::test]
    async fn test_corrupt_header_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.bin");
        let header = SnapshotHeader {
            index: 1,
            term: 1,
            config_fingerprint: 0,
            payload_len: 3,
        };
        write_snapshot(&path, &header, b"abc").await.unwrap();

        let mut raw = std::fs::read(&path).unwrap();
        raw[9] ^= 0xFF;
        std::fs::write(&path, raw).unwrap();
        assert!(matches!(read_header(&path).await, Err(WalError::Corruption(_))));
    }
}
