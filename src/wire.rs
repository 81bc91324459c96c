//! The built-in binary codec for Raft RPC announcements, log-entry metadata
//! and streaming payloads.
//!
//! The consensus core is agnostic of transport framing: it produces and
//! consumes these frames through reader/writer interfaces only. Integer
//! fields are encoded in the endianness selected by the caller, except
//! log-entry metadata which is always little-endian, since the same 37-byte
//! record is the WAL's on-disk metadata-table slot format.

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::membership::Membership;
use crate::membership::NodeId;
use crate::raft::Entry;
use crate::raft::EntryConfigChange;
use crate::raft::EntryNormal;
use crate::raft::EntryPayload;
use crate::raft_types::LogId;

/// Errors decoding a wire frame.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame is truncated")]
    Truncated,
    #[error("unknown payload flags: {0:#04x}")]
    UnknownFlags(u8),
    #[error("unknown frame kind: {0:#04x}")]
    UnknownFrame(u8),
    #[error("malformed membership block: {0}")]
    BadMembership(String),
}

/// Byte order for integer fields, selected by the caller of the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    pub fn put_i32<B: BufMut>(&self, buf: &mut B, v: i32) {
        match self {
            Endianness::Little => buf.put_i32_le(v),
            Endianness::Big => buf.put_i32(v),
        }
    }

    pub fn put_i64<B: BufMut>(&self, buf: &mut B, v: i64) {
        match self {
            Endianness::Little => buf.put_i64_le(v),
            Endianness::Big => buf.put_i64(v),
        }
    }

    pub fn put_u64<B: BufMut>(&self, buf: &mut B, v: u64) {
        match self {
            Endianness::Little => buf.put_u64_le(v),
            Endianness::Big => buf.put_u64(v),
        }
    }

    pub fn put_u128<B: BufMut>(&self, buf: &mut B, v: u128) {
        match self {
            Endianness::Little => buf.put_u128_le(v),
            Endianness::Big => buf.put_u128(v),
        }
    }

    pub fn get_i32<B: Buf>(&self, buf: &mut B) -> i32 {
        match self {
            Endianness::Little => buf.get_i32_le(),
            Endianness::Big => buf.get_i32(),
        }
    }

    pub fn get_i64<B: Buf>(&self, buf: &mut B) -> i64 {
        match self {
            Endianness::Little => buf.get_i64_le(),
            Endianness::Big => buf.get_i64(),
        }
    }

    pub fn get_u64<B: Buf>(&self, buf: &mut B) -> u64 {
        match self {
            Endianness::Little => buf.get_u64_le(),
            Endianness::Big => buf.get_u64(),
        }
    }

    pub fn get_u128<B: Buf>(&self, buf: &mut B) -> u128 {
        match self {
            Endianness::Little => buf.get_u128_le(),
            Endianness::Big => buf.get_u128(),
        }
    }
}

/// The fixed-size on-disk and on-wire record describing one log entry.
///
/// Layout (always little-endian): `offset: i64, length: i64, term: i64,
/// timestamp: i64, command_id: i32 (-1 = none), flags: u8` — 37 bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogEntryMetadata {
    /// Offset of the payload within its partition file (or stream).
    pub offset: i64,
    /// Length of the payload in bytes.
    pub length: i64,
    /// The term of the entry.
    pub term: i64,
    /// Creation timestamp, in milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// The application command identifier; -1 when absent.
    pub command_id: i32,
    /// Payload-kind flags.
    pub flags: u8,
}

impl LogEntryMetadata {
    /// The size of the encoded record, known at compile time.
    pub const SIZE: usize = 8 + 8 + 8 + 8 + 4 + 1;

    /// The entry is a snapshot/purged-prefix pointer.
    pub const FLAG_SNAPSHOT: u8 = 0x01;
    /// The entry carries a cluster configuration.
    pub const FLAG_CONFIG: u8 = 0x02;
    /// The entry is a blank leader-commit marker.
    pub const FLAG_BLANK: u8 = 0x04;

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i64_le(self.offset);
        buf.put_i64_le(self.length);
        buf.put_i64_le(self.term);
        buf.put_i64_le(self.timestamp);
        buf.put_i32_le(self.command_id);
        buf.put_u8(self.flags);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        if buf.remaining() < Self::SIZE {
            return Err(WireError::Truncated);
        }
        Ok(Self {
            offset: buf.get_i64_le(),
            length: buf.get_i64_le(),
            term: buf.get_i64_le(),
            timestamp: buf.get_i64_le(),
            command_id: buf.get_i32_le(),
            flags: buf.get_u8(),
        })
    }

    /// Whether this record is an unwritten (zeroed) metadata-table slot.
    pub fn is_empty_slot(&self) -> bool {
        self.offset == 0 && self.length == 0 && self.term == 0 && self.timestamp == 0 && self.flags == 0
    }

    pub fn is_snapshot_pointer(&self) -> bool {
        self.flags & Self::FLAG_SNAPSHOT != 0
    }

    /// Build the record for an entry, leaving `offset` for the writer to fill.
    pub fn describe(entry: &Entry, offset: i64, length: i64) -> Self {
        let (flags, command_id) = match &entry.payload {
            EntryPayload::Blank => (Self::FLAG_BLANK, -1),
            EntryPayload::Normal(normal) => (0, normal.command_id.map(|id| id as i32).unwrap_or(-1)),
            EntryPayload::ConfigChange(_) => (Self::FLAG_CONFIG, -1),
            EntryPayload::PurgedMarker => (Self::FLAG_SNAPSHOT, -1),
        };
        Self {
            offset,
            length,
            term: entry.log_id.term as i64,
            timestamp: entry.timestamp,
            command_id,
            flags,
        }
    }
}

/// Encode an entry's payload body, the variable-length bytes a metadata
/// record points at.
pub fn encode_payload(entry: &Entry) -> Bytes {
    match &entry.payload {
        EntryPayload::Blank | EntryPayload::PurgedMarker => Bytes::new(),
        EntryPayload::Normal(normal) => normal.data.clone(),
        EntryPayload::ConfigChange(change) => {
            let mut buf = BytesMut::new();
            encode_membership(&change.membership, &mut buf);
            buf.freeze()
        }
    }
}

/// Reassemble an entry from its metadata record and payload body.
pub fn decode_entry(index: u64, meta: &LogEntryMetadata, payload: Bytes) -> Result<Entry, WireError> {
    let log_id = LogId {
        term: meta.term as u64,
        index,
    };
    let payload = if meta.flags & LogEntryMetadata::FLAG_BLANK != 0 {
        EntryPayload::Blank
    } else if meta.flags & LogEntryMetadata::FLAG_SNAPSHOT != 0 {
        EntryPayload::PurgedMarker
    } else if meta.flags & LogEntryMetadata::FLAG_CONFIG != 0 {
        let mut buf = payload;
        let membership = decode_membership(&mut buf)?;
        EntryPayload::ConfigChange(EntryConfigChange { membership })
    } else if meta.flags == 0 {
        EntryPayload::Normal(EntryNormal {
            command_id: if meta.command_id < 0 { None } else { Some(meta.command_id as u32) },
            data: payload,
        })
    } else {
        return Err(WireError::UnknownFlags(meta.flags));
    };
    Ok(Entry {
        log_id,
        timestamp: meta.timestamp,
        payload,
    })
}

/// Encode a membership block: active configuration plus optional proposal.
pub fn encode_membership<B: BufMut>(membership: &Membership, buf: &mut B) {
    membership.active.encode(buf);
    match &membership.proposed {
        None => buf.put_u8(0),
        Some(p) => {
            buf.put_u8(1);
            p.encode(buf);
        }
    }
}

/// Decode a membership block.
pub fn decode_membership<B: Buf>(buf: &mut B) -> Result<Membership, WireError> {
    let active = crate::membership::ClusterConfiguration::decode(buf)
        .map_err(|e| WireError::BadMembership(e.to_string()))?;
    if buf.remaining() < 1 {
        return Err(WireError::Truncated);
    }
    let proposed = match buf.get_u8() {
        0 => None,
        _ => Some(
            crate::membership::ClusterConfiguration::decode(buf)
                .map_err(|e| WireError::BadMembership(e.to_string()))?,
        ),
    };
    Ok(Membership { active, proposed })
}

/// The fixed announcement block preceding the entries of an AppendEntries
/// frame: `(sender_id: 16 B, term: i64, prev_log_index: i64,
/// prev_log_term: i64, commit_index: i64, entries_count: i32,
/// optional configuration fingerprint block)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendEntriesAnnouncement {
    pub sender_id: NodeId,
    pub term: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub commit_index: u64,
    pub entries_count: i32,
    pub config_fingerprint: Option<u64>,
}

impl AppendEntriesAnnouncement {
    pub fn encode<B: BufMut>(&self, buf: &mut B, endianness: Endianness) {
        // The sender occupies a 16-byte identity block on the wire.
        endianness.put_u128(buf, u128::from(self.sender_id));
        endianness.put_i64(buf, self.term as i64);
        endianness.put_i64(buf, self.prev_log_index as i64);
        endianness.put_i64(buf, self.prev_log_term as i64);
        endianness.put_i64(buf, self.commit_index as i64);
        endianness.put_i32(buf, self.entries_count);
        match self.config_fingerprint {
            None => buf.put_u8(0),
            Some(fp) => {
                buf.put_u8(1);
                endianness.put_u64(buf, fp);
            }
        }
    }

    pub fn decode<B: Buf>(buf: &mut B, endianness: Endianness) -> Result<Self, WireError> {
        if buf.remaining() < 16 + 8 * 4 + 4 + 1 {
            return Err(WireError::Truncated);
        }
        let sender_id = endianness.get_u128(buf) as NodeId;
        let term = endianness.get_i64(buf) as u64;
        let prev_log_index = endianness.get_i64(buf) as u64;
        let prev_log_term = endianness.get_i64(buf) as u64;
        let commit_index = endianness.get_i64(buf) as u64;
        let entries_count = endianness.get_i32(buf);
        let config_fingerprint = match buf.get_u8() {
            0 => None,
            _ => {
                if buf.remaining() < 8 {
                    return Err(WireError::Truncated);
                }
                Some(endianness.get_u64(buf))
            }
        };
        Ok(Self {
            sender_id,
            term,
            prev_log_index,
            prev_log_term,
            commit_index,
            entries_count,
            config_fingerprint,
        })
    }
}

/// Encode one streamed entry: the metadata record followed by the payload
/// body. The entry's index is implicit, `prev_log_index + 1 + n` for the
/// n-th entry of the frame.
pub fn encode_entry<B: BufMut>(entry: &Entry, buf: &mut B) {
    let payload = encode_payload(entry);
    let meta = LogEntryMetadata::describe(entry, 0, payload.len() as i64);
    meta.encode(buf);
    buf.put_slice(&payload);
}

/// Decode one streamed entry at the given index.
pub fn decode_streamed_entry<B: Buf>(index: u64, buf: &mut B) -> Result<Entry, WireError> {
    let meta = LogEntryMetadata::decode(buf)?;
    let len = meta.length as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    let payload = buf.copy_to_bytes(len);
    decode_entry(index, &meta, payload)
}

const FRAME_STREAM_START: u8 = 0x01;
const FRAME_FRAGMENT: u8 = 0x02;
const FRAME_STREAM_END: u8 = 0x03;

/// A chunk of a streamed AppendEntries or InstallSnapshot body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// Opens a stream of `total_len` payload bytes.
    StreamStart { total_len: u64 },
    /// A body fragment positioned at `offset`.
    Fragment { offset: u64, data: Bytes },
    /// Closes the stream; `crc` covers the whole body.
    StreamEnd { crc: u32 },
}

impl StreamFrame {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        match self {
            StreamFrame::StreamStart { total_len } => {
                buf.put_u8(FRAME_STREAM_START);
                buf.put_u64_le(*total_len);
            }
            StreamFrame::Fragment { offset, data } => {
                buf.put_u8(FRAME_FRAGMENT);
                buf.put_u64_le(*offset);
                buf.put_u32_le(data.len() as u32);
                buf.put_slice(data);
            }
            StreamFrame::StreamEnd { crc } => {
                buf.put_u8(FRAME_STREAM_END);
                buf.put_u32_le(*crc);
            }
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        if buf.remaining() < 1 {
            return Err(WireError::Truncated);
        }
        match buf.get_u8() {
            FRAME_STREAM_START => {
                if buf.remaining() < 8 {
                    return Err(WireError::Truncated);
                }
                Ok(StreamFrame::StreamStart {
                    total_len: buf.get_u64_le(),
                })
            }
            FRAME_FRAGMENT => {
                if buf.remaining() < 12 {
                    return Err(WireError::Truncated);
                }
                let offset = buf.get_u64_le();
                let len = buf.get_u32_le() as usize;
                if buf.remaining() < len {
                    return Err(WireError::Truncated);
                }
                Ok(StreamFrame::Fragment {
                    offset,
                    data: buf.copy_to_bytes(len),
                })
            }
            FRAME_STREAM_END => {
                if buf.remaining() < 4 {
                    return Err(WireError::Truncated);
                }
                Ok(StreamFrame::StreamEnd { crc: buf.get_u32_le() })
            }
            other => Err(WireError::UnknownFrame(other)),
        }
    }
}

/// Per-chunk flow-control replies of the streaming protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlowControl {
    /// No reply expected for this chunk.
    None = 0,
    /// Chunk received; keep sending.
    Ack = 1,
    /// Chunk received; the receiver is ready for the next entry.
    NextEntry = 2,
    /// Receiver is still consuming; resend or continue after a pause.
    Continue = 3,
}

impl FlowControl {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(*self as u8);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        if buf.remaining() < 1 {
            return Err(WireError::Truncated);
        }
        match buf.get_u8() {
            0 => Ok(FlowControl::None),
            1 => Ok(FlowControl::Ack),
            2 => Ok(FlowControl::NextEntry),
            3 => Ok(FlowControl::Continue),
            other => Err(WireError::UnknownFrame(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::Entry;

    #[test]
    fn test_metadata_layout_is_bit_exact() {
        let meta = LogEntryMetadata {
            offset: 0x0102030405060708,
            length: 5,
            term: 3,
            timestamp: 0x1122334455667788,
            command_id: -1,
            flags: LogEntryMetadata::FLAG_CONFIG,
        };
        let mut buf = BytesMut::new();
        meta.encode(&mut buf);
        assert_eq!(buf.len(), LogEntryMetadata::SIZE);
        // Little-endian, field order: offset, length, term, timestamp, command_id, flags.
        assert_eq!(&buf[0..8], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&buf[8..16], &[5, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&buf[16..24], &[3, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&buf[24..32], &[0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
        assert_eq!(&buf[32..36], &[0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(buf[36], LogEntryMetadata::FLAG_CONFIG);

        let decoded = LogEntryMetadata::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn test_announcement_round_trip_both_endiannesses() {
        let ann = AppendEntriesAnnouncement {
            sender_id: 42,
            term: 7,
            prev_log_index: 100,
            prev_log_term: 6,
            commit_index: 99,
            entries_count: 3,
            config_fingerprint: Some(0xDEAD_BEEF),
        };
        for endianness in &[Endianness::Little, Endianness::Big] {
            let mut buf = BytesMut::new();
            ann.encode(&mut buf, *endianness);
            // 16 B sender block + 4 * i64 + i32 + presence byte + u64 fingerprint.
            assert_eq!(buf.len(), 16 + 32 + 4 + 1 + 8);
            let decoded = AppendEntriesAnnouncement::decode(&mut buf.freeze(), *endianness).unwrap();
            assert_eq!(decoded, ann);
        }
    }

    #[test]
    fn test_sender_block_is_sixteen_bytes_little_endian() {
        let ann = AppendEntriesAnnouncement {
            sender_id: 0x0A0B,
            term: 0,
            prev_log_index: 0,
            prev_log_term: 0,
            commit_index: 0,
            entries_count: 0,
            config_fingerprint: None,
        };
        let mut buf = BytesMut::new();
        ann.encode(&mut buf, Endianness::Little);
        assert_eq!(&buf[0..2], &[0x0B, 0x0A]);
        assert!(buf[2..16].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_entry_stream_round_trip() {
        let entries = vec![
            Entry::new_blank(LogId::new(1, 1)),
            Entry::new_normal(LogId::new(1, 2), Some(9), Bytes::from_static(b"payload")),
        ];
        let mut buf = BytesMut::new();
        for entry in &entries {
            encode_entry(entry, &mut buf);
        }
        let mut buf = buf.freeze();
        for (n, expected) in entries.iter().enumerate() {
            let got = decode_streamed_entry(1 + n as u64, &mut buf).unwrap();
            assert_eq!(&got, expected);
        }
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn test_stream_frames_round_trip() {
        let frames = vec![
            StreamFrame::StreamStart { total_len: 1024 },
            StreamFrame::Fragment {
                offset: 0,
                data: Bytes::from_static(b"abc"),
            },
            StreamFrame::StreamEnd { crc: 0xABCD },
        ];
        for frame in frames {
            let mut buf = BytesMut::new();
            frame.encode(&mut buf);
            assert_eq!(StreamFrame::decode(&mut buf.freeze()).unwrap(), frame);
        }
        for fc in &[FlowControl::None, FlowControl::Ack, FlowControl::NextEntry, FlowControl::Continue] {
            let mut buf = BytesMut::new();
            fc.encode(&mut buf);
            assert_eq!(FlowControl::decode(&mut buf.freeze()).unwrap(), *fc);
        }
    }

    #[test]
    fn test_truncated_frames_are_rejected() {
        let mut short: &[u8] = &[0u8; 10];
        assert!(matches!(LogEntryMetadata::decode(&mut short), Err(WireError::Truncated)));

        let mut unknown: &[u8] = &[0xEE];
        assert!(matches!(StreamFrame::decode(&mut unknown), Err(WireError::UnknownFrame(0xEE))));
    }
}
