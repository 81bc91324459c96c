//! Receiving a streamed snapshot from the leader (§7).
//!
//! A snapshot transfer carries a complete snapshot file: the fixed header
//! followed by the state-machine payload. Chunk assembly is governed by
//! that header rather than by the sender's say-so: the preamble is parsed
//! and checksum-verified the moment enough bytes have arrived, its identity
//! must agree with the announced snapshot metadata, its declared length
//! bounds the stream, and only a length-exact file is handed to storage for
//! installation. A sender that never saw an acknowledgement may replay an
//! earlier chunk; a chunk that would leave a gap can never be valid.

use std::io::SeekFrom;

use tokio::io::AsyncSeek;
use tokio::io::AsyncSeekExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

use crate::core::RaftCore;
use crate::core::SnapshotState;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::network::RaftNetwork;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft_types::LogId;
use crate::raft_types::MessageSummary;
use crate::raft_types::SnapshotId;
use crate::raft_types::SnapshotSegmentId;
use crate::raft_types::Update;
use crate::storage::RaftStorage;
use crate::storage::SnapshotMeta;
use crate::wal::SnapshotHeader;

/// Why a streamed chunk (or the end of the stream) was refused.
#[derive(Debug, thiserror::Error)]
pub(super) enum SnapshotChunkError {
    /// The chunk starts past the assembled position; accepting it would
    /// leave a hole in the file.
    #[error("chunk at offset {got} leaves a gap, expected offset {expected}")]
    Gap { expected: u64, got: u64 },

    /// The file preamble failed its magic/version/checksum validation.
    #[error("snapshot stream header rejected: {0}")]
    BadHeader(String),

    /// The framed header names a different snapshot than the announcement.
    #[error("snapshot stream covers {header} but the announcement names {announced}")]
    WrongSnapshot { header: LogId, announced: LogId },

    /// More bytes arrived than the header declares the file to hold.
    #[error("snapshot stream overruns its declared length of {total} bytes")]
    Overrun { total: u64 },

    /// The stream was closed before the declared length was assembled.
    #[error("snapshot stream ended at {got} of {expected} declared bytes")]
    ShortStream { expected: u64, got: u64 },

    /// A local write failed; the stream itself may still be good.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl SnapshotChunkError {
    fn into_raft_error(self) -> RaftError {
        match self {
            SnapshotChunkError::Io(err) => RaftError::RaftStorage(err.into()),
            other => RaftError::RaftNetwork(anyhow::anyhow!(other)),
        }
    }
}

/// Assembles one streamed snapshot into a storage-provided writer, enforcing
/// the file's own framing along the way.
pub(super) struct SnapshotReceiver<W> {
    id: SnapshotId,
    /// Write position within the file being assembled.
    offset: u64,
    /// The file preamble, buffered until the header can be parsed.
    preamble: Vec<u8>,
    /// Parsed and checksum-verified once the preamble is complete.
    header: Option<SnapshotHeader>,
    writer: Box<W>,
}

impl<W> SnapshotReceiver<W>
where W: AsyncWrite + AsyncSeek + Send + Unpin
{
    pub(super) fn new(id: SnapshotId, writer: Box<W>) -> Self {
        Self {
            id,
            offset: 0,
            preamble: Vec::with_capacity(SnapshotHeader::SIZE),
            header: None,
            writer,
        }
    }

    pub(super) fn id(&self) -> &SnapshotId {
        &self.id
    }

    pub(super) fn offset(&self) -> u64 {
        self.offset
    }

    /// The exact byte length of the file, once the header is known.
    fn total_len(&self) -> Option<u64> {
        self.header.map(|h| SnapshotHeader::SIZE as u64 + h.payload_len)
    }

    pub(super) fn is_complete(&self) -> bool {
        self.total_len() == Some(self.offset)
    }

    /// Accept the chunk positioned at `offset`.
    ///
    /// In-order chunks append. A rewound offset replays bytes the sender
    /// never saw acknowledged and overwrites in place. A gap is refused
    /// outright.
    pub(super) async fn accept(
        &mut self,
        offset: u64,
        data: &[u8],
        meta: &SnapshotMeta,
    ) -> Result<(), SnapshotChunkError> {
        if offset > self.offset {
            return Err(SnapshotChunkError::Gap {
                expected: self.offset,
                got: offset,
            });
        }
        if offset < self.offset {
            self.writer.seek(SeekFrom::Start(offset)).await?;
            self.offset = offset;
            if (self.offset as usize) < SnapshotHeader::SIZE {
                // The replay reaches back into the preamble; re-collect it.
                self.preamble.truncate(self.offset as usize);
                self.header = None;
            }
        }

        // Collect the preamble until the header parses, then pin the stream
        // to the identity and length it declares.
        if self.header.is_none() {
            let need = SnapshotHeader::SIZE - self.preamble.len();
            self.preamble.extend_from_slice(&data[..need.min(data.len())]);
            if self.preamble.len() == SnapshotHeader::SIZE {
                let header = SnapshotHeader::decode(&self.preamble)
                    .map_err(|err| SnapshotChunkError::BadHeader(err.to_string()))?;
                if header.index != meta.last_log_id.index || header.term != meta.last_log_id.term {
                    return Err(SnapshotChunkError::WrongSnapshot {
                        header: LogId::new(header.term, header.index),
                        announced: meta.last_log_id,
                    });
                }
                self.header = Some(header);
            }
        }

        if let Some(total) = self.total_len() {
            if self.offset + data.len() as u64 > total {
                return Err(SnapshotChunkError::Overrun { total });
            }
        }

        self.writer.write_all(data).await?;
        self.offset += data.len() as u64;
        Ok(())
    }

    /// Close the stream, yielding the writer only when the assembled bytes
    /// match the header-declared length exactly.
    pub(super) async fn finish(mut self) -> Result<Box<W>, SnapshotChunkError> {
        if !self.is_complete() {
            return Err(SnapshotChunkError::ShortStream {
                expected: self.total_len().unwrap_or(SnapshotHeader::SIZE as u64),
                got: self.offset,
            });
        }
        self.writer.shutdown().await?;
        Ok(self.writer)
    }
}

impl<N: RaftNetwork, S: RaftStorage> RaftCore<N, S> {
    /// Invoked by the leader to send chunks of a snapshot to a follower (§7).
    ///
    /// Chunks always arrive in order (with possible replays after lost
    /// acknowledgements); the receiver validates them against the snapshot
    /// file's own framing as they land.
    #[tracing::instrument(level = "trace", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_install_snapshot_request(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse> {
        // If message's term is less than most recent term, then we do not honor the request.
        if req.term < self.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
            });
        }

        self.observe_leader(&req).await?;

        // Route the chunk to the receiver for its stream, opening a fresh
        // one when the chunk starts a new stream.
        let mut receiver = match self.snapshot_state.take() {
            Some(SnapshotState::Streaming(receiver)) => {
                if receiver.id() == &req.meta.snapshot_id {
                    receiver
                } else if req.offset == 0 {
                    // The leader abandoned the previous stream in favor of a
                    // newer snapshot; so do we.
                    self.open_snapshot_receiver(&req).await?
                } else {
                    return Err(RaftError::SnapshotMismatch {
                        expect: SnapshotSegmentId {
                            id: receiver.id().clone(),
                            offset: receiver.offset(),
                        },
                        got: (req.meta.snapshot_id.clone(), req.offset).into(),
                    });
                }
            }
            Some(SnapshotState::Snapshotting { handle, .. }) => {
                // Installation from the leader overrides a local compaction.
                handle.abort();
                self.open_snapshot_receiver(&req).await?
            }
            None => self.open_snapshot_receiver(&req).await?,
        };

        match receiver.accept(req.offset, &req.data, &req.meta).await {
            Ok(()) => {}
            Err(err @ SnapshotChunkError::Io(_)) => {
                // A local write failure does not invalidate the stream; keep
                // the receiver so the sender's retry of this chunk can land.
                self.snapshot_state = Some(SnapshotState::Streaming(receiver));
                return Err(err.into_raft_error());
            }
            Err(err) => {
                // A framing violation poisons the whole stream. Dropping the
                // receiver forces the sender to start over from offset 0.
                tracing::warn!(error=%err, "rejecting snapshot stream");
                return Err(err.into_raft_error());
            }
        }

        if req.done {
            self.complete_snapshot_installation(receiver, &req.meta).await?;
        } else {
            self.snapshot_state = Some(SnapshotState::Streaming(receiver));
        }

        Ok(InstallSnapshotResponse {
            term: self.current_term,
        })
    }

    /// Track the sender as the current leader and fall in line behind it.
    async fn observe_leader(&mut self, req: &InstallSnapshotRequest) -> RaftResult<()> {
        self.update_next_election_timeout(true);

        let mut report_metrics = false;
        if self.current_term != req.term {
            self.update_current_term(req.term, None);
            self.save_hard_state().await?;
            report_metrics = true;
        }
        if self.current_leader.as_ref() != Some(&req.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader_id));
            report_metrics = true;
        }
        if !self.target_state.is_follower() && !self.target_state.is_standby() {
            self.set_target_state(State::Follower);
        }
        if report_metrics {
            self.report_metrics(Update::Ignore);
        }
        Ok(())
    }

    /// Start a receiver for a new stream, which must open at offset 0.
    async fn open_snapshot_receiver(
        &mut self,
        req: &InstallSnapshotRequest,
    ) -> RaftResult<SnapshotReceiver<S::SnapshotData>> {
        if req.offset != 0 {
            return Err(RaftError::SnapshotMismatch {
                expect: (req.meta.snapshot_id.clone(), 0).into(),
                got: (req.meta.snapshot_id.clone(), req.offset).into(),
            });
        }
        let writer =
            self.storage.begin_receiving_snapshot().await.map_err(|err| self.map_fatal_storage_error(err))?;
        Ok(SnapshotReceiver::new(req.meta.snapshot_id.clone(), writer))
    }

    /// Hand the fully assembled, length-exact file to storage and adopt the
    /// snapshot's view of the log.
    ///
    /// Any errors which come up from this routine will cause the Raft node to go into shutdown.
    async fn complete_snapshot_installation(
        &mut self,
        receiver: SnapshotReceiver<S::SnapshotData>,
        meta: &SnapshotMeta,
    ) -> RaftResult<()> {
        let writer = receiver.finish().await.map_err(SnapshotChunkError::into_raft_error)?;

        self.storage
            .finalize_snapshot_installation(meta, writer)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        let membership = self.storage.get_membership().await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.update_membership(membership)?;
        self.last_log_id = meta.last_log_id;
        self.last_applied = meta.last_log_id;
        self.snapshot_last_log_id = meta.last_log_id;
        self.report_metrics(Update::Ignore);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::membership::Membership;

    fn snapshot_file(index: u64, term: u64, payload: &[u8]) -> Vec<u8> {
        let header = SnapshotHeader {
            index,
            term,
            config_fingerprint: 7,
            payload_len: payload.len() as u64,
        };
        let mut raw = header.encode();
        raw.extend_from_slice(payload);
        raw
    }

    fn meta(index: u64, term: u64) -> SnapshotMeta {
        SnapshotMeta {
            last_log_id: LogId::new(term, index),
            membership: Membership::new_initial(1),
            snapshot_id: "snap-1".to_string(),
        }
    }

    fn receiver() -> SnapshotReceiver<Cursor<Vec<u8>>> {
        SnapshotReceiver::new("snap-1".to_string(), Box::new(Cursor::new(Vec::new())))
    }

    #[tokio::test]
    async fn test_chunked_assembly_follows_the_header() {
        let raw = snapshot_file(800, 3, b"machine-bits");
        let meta = meta(800, 3);
        let mut rx = receiver();

        // Cut points chosen so the header itself straddles two chunks.
        let cuts = [0usize, 10, SnapshotHeader::SIZE + 3, raw.len()];
        for window in cuts.windows(2) {
            rx.accept(window[0] as u64, &raw[window[0]..window[1]], &meta).await.unwrap();
        }

        assert!(rx.is_complete());
        let writer = rx.finish().await.unwrap();
        assert_eq!(writer.into_inner(), raw);
    }

    #[tokio::test]
    async fn test_gap_is_rejected() {
        let raw = snapshot_file(800, 3, b"machine-bits");
        let mut rx = receiver();
        rx.accept(0, &raw[..10], &meta(800, 3)).await.unwrap();
        let res = rx.accept(20, &raw[20..], &meta(800, 3)).await;
        assert!(matches!(res, Err(SnapshotChunkError::Gap { expected: 10, got: 20 })));
    }

    #[tokio::test]
    async fn test_replayed_chunk_overwrites_in_place() {
        let raw = snapshot_file(800, 3, b"machine-bits");
        let meta = meta(800, 3);
        let mut rx = receiver();

        let mid = SnapshotHeader::SIZE + 4;
        rx.accept(0, &raw[..mid], &meta).await.unwrap();
        // The acknowledgement was lost; the sender replays the first chunk.
        rx.accept(0, &raw[..mid], &meta).await.unwrap();
        rx.accept(mid as u64, &raw[mid..], &meta).await.unwrap();

        let writer = rx.finish().await.unwrap();
        assert_eq!(writer.into_inner(), raw);
    }

    #[tokio::test]
    async fn test_header_must_match_the_announcement() {
        let raw = snapshot_file(800, 3, b"machine-bits");
        let mut rx = receiver();
        let res = rx.accept(0, &raw, &meta(900, 3)).await;
        assert!(matches!(res, Err(SnapshotChunkError::WrongSnapshot { .. })));
    }

    #[tokio::test]
    async fn test_corrupt_header_is_rejected() {
        let mut raw = snapshot_file(800, 3, b"machine-bits");
        raw[8] ^= 0xFF;
        let mut rx = receiver();
        let res = rx.accept(0, &raw, &meta(800, 3)).await;
        assert!(matches!(res, Err(SnapshotChunkError::BadHeader(_))));
    }

    #[tokio::test]
    async fn test_stream_may_not_overrun_its_declared_length() {
        let mut raw = snapshot_file(800, 3, b"machine-bits");
        raw.extend_from_slice(b"trailing-junk");
        let mut rx = receiver();
        let res = rx.accept(0, &raw, &meta(800, 3)).await;
        assert!(matches!(res, Err(SnapshotChunkError::Overrun { .. })));
    }

    #[tokio::test]
    async fn test_short_stream_is_refused_at_finish() {
        let raw = snapshot_file(800, 3, b"machine-bits");
        let mut rx = receiver();
        rx.accept(0, &raw[..raw.len() - 1], &meta(800, 3)).await.unwrap();
        assert!(!rx.is_complete());
        let res = rx.finish().await;
        assert!(matches!(res, Err(SnapshotChunkError::ShortStream { .. })));
    }
}
