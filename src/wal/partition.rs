//! A partition file: a fixed-size range of log entries.
//!
//! Layout: a dense metadata table of `records_per_partition` slots of
//! [`LogEntryMetadata::SIZE`] bytes at offset 0, followed by the payload
//! region. Payload offsets are strictly increasing with index within the
//! partition. The partition covering index `i` is `i / records_per_partition`
//! and starts at `first_index = number * records_per_partition`.

use std::io::SeekFrom;
use std::path::Path;
use std::path::PathBuf;
use std::sync::RwLock;

use bytes::Bytes;
use tokio::fs::File;
use tokio::fs::OpenOptions;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeekExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::raft::Entry;
use crate::wal::WriteMode;
use crate::wire;
use crate::wire::LogEntryMetadata;

pub(crate) struct Partition {
    /// The partition number, `first_index / records_per_partition`.
    pub number: u64,
    pub first_index: u64,
    records_per_partition: u64,
    path: PathBuf,
    /// Fresh read handles are opened per read instead of sharing `file`.
    parallel_io: bool,
    /// The shared read/write handle.
    file: Mutex<File>,
    /// The in-memory copy of the on-disk metadata table. Always resident
    /// while the partition is open.
    table: RwLock<Vec<LogEntryMetadata>>,
    /// Next payload write position within the file.
    cursor: RwLock<u64>,
}

impl Partition {
    pub(crate) fn table_size(records_per_partition: u64) -> u64 {
        records_per_partition * LogEntryMetadata::SIZE as u64
    }

    pub(crate) fn file_name(number: u64) -> String {
        format!("{}.dat", number)
    }

    /// Create a brand-new partition file, pre-allocated to at least the
    /// metadata table plus `initial_size`.
    pub(crate) async fn create(
        dir: &Path,
        number: u64,
        records_per_partition: u64,
        initial_size: u64,
        parallel_io: bool,
    ) -> std::io::Result<Self> {
        let path = dir.join(Self::file_name(number));
        let file = OpenOptions::new().read(true).write(true).create_new(true).open(&path).await?;
        let table_size = Self::table_size(records_per_partition);
        file.set_len(table_size.max(initial_size)).await?;

        Ok(Self {
            number,
            first_index: number * records_per_partition,
            records_per_partition,
            path,
            parallel_io,
            file: Mutex::new(file),
            table: RwLock::new(vec![LogEntryMetadata::default(); records_per_partition as usize]),
            cursor: RwLock::new(table_size),
        })
    }

    /// Open an existing partition file and load its metadata table.
    pub(crate) async fn open(
        dir: &Path,
        number: u64,
        records_per_partition: u64,
        buffer_size: usize,
        parallel_io: bool,
    ) -> std::io::Result<Self> {
        let path = dir.join(Self::file_name(number));
        let mut file = OpenOptions::new().read(true).write(true).open(&path).await?;
        let table_size = Self::table_size(records_per_partition);

        let mut raw = vec![0u8; table_size as usize];
        file.seek(SeekFrom::Start(0)).await?;
        {
            let mut reader = tokio::io::BufReader::with_capacity(buffer_size, &mut file);
            reader.read_exact(&mut raw).await?;
        }

        let mut table = Vec::with_capacity(records_per_partition as usize);
        let mut cursor = table_size;
        let mut slice: &[u8] = &raw;
        for _ in 0..records_per_partition {
            let meta = LogEntryMetadata::decode(&mut slice)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
            if !meta.is_empty_slot() {
                cursor = cursor.max((meta.offset + meta.length) as u64);
            }
            table.push(meta);
        }

        Ok(Self {
            number,
            first_index: number * records_per_partition,
            records_per_partition,
            path,
            parallel_io,
            file: Mutex::new(file),
            table: RwLock::new(table),
            cursor: RwLock::new(cursor),
        })
    }

    /// Index of the last slot this partition can hold.
    pub(crate) fn last_index(&self) -> u64 {
        self.first_index + self.records_per_partition - 1
    }

    pub(crate) fn holds(&self, index: u64) -> bool {
        index >= self.first_index && index <= self.last_index()
    }

    fn slot_of(&self, index: u64) -> usize {
        debug_assert!(self.holds(index));
        (index - self.first_index) as usize
    }

    fn slot_offset(&self, index: u64) -> u64 {
        self.slot_of(index) as u64 * LogEntryMetadata::SIZE as u64
    }

    /// The metadata record for `index`, or `None` for an unwritten slot.
    ///
    /// The store's zero-term sentinel at index 0 carries the blank flag, so
    /// it never reads as an unwritten slot.
    pub(crate) fn metadata(&self, index: u64) -> Option<LogEntryMetadata> {
        let table = self.table.read().unwrap();
        let meta = table[self.slot_of(index)];
        if meta.is_empty_slot() {
            None
        } else {
            Some(meta)
        }
    }

    /// The highest index with a written slot, scanning the table from the top.
    pub(crate) fn highest_present_index(&self) -> Option<u64> {
        let table = self.table.read().unwrap();
        for (slot, meta) in table.iter().enumerate().rev() {
            if !meta.is_empty_slot() {
                return Some(self.first_index + slot as u64);
            }
        }
        None
    }

    /// Append one entry: payload at the region cursor, metadata into its slot.
    pub(crate) async fn append_entry(&self, entry: &Entry) -> std::io::Result<()> {
        let index = entry.log_id.index;
        let payload = wire::encode_payload(entry);
        let offset = *self.cursor.read().unwrap();
        let meta = LogEntryMetadata::describe(entry, offset as i64, payload.len() as i64);

        let mut file = self.file.lock().await;
        if !payload.is_empty() {
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(&payload).await?;
        }
        let mut slot_bytes = Vec::with_capacity(LogEntryMetadata::SIZE);
        meta.encode(&mut slot_bytes);
        file.seek(SeekFrom::Start(self.slot_offset(index))).await?;
        file.write_all(&slot_bytes).await?;
        drop(file);

        self.table.write().unwrap()[self.slot_of(index)] = meta;
        *self.cursor.write().unwrap() = offset + payload.len() as u64;
        Ok(())
    }

    /// Read the payload body the given metadata record points at.
    pub(crate) async fn read_payload(&self, meta: &LogEntryMetadata) -> std::io::Result<Bytes> {
        let mut raw = vec![0u8; meta.length as usize];
        if meta.length == 0 {
            return Ok(Bytes::new());
        }
        if self.parallel_io {
            let mut file = File::open(&self.path).await?;
            file.seek(SeekFrom::Start(meta.offset as u64)).await?;
            file.read_exact(&mut raw).await?;
        } else {
            let mut file = self.file.lock().await;
            file.seek(SeekFrom::Start(meta.offset as u64)).await?;
            file.read_exact(&mut raw).await?;
        }
        Ok(Bytes::from(raw))
    }

    /// Read the full entry at `index`, or `None` for an unwritten slot.
    pub(crate) async fn read_entry(&self, index: u64) -> std::io::Result<Option<Entry>> {
        let meta = match self.metadata(index) {
            Some(meta) => meta,
            None => return Ok(None),
        };
        let payload = self.read_payload(&meta).await?;
        let entry = wire::decode_entry(index, &meta, payload)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        Ok(Some(entry))
    }

    /// Zero every metadata slot at or above `index`, dropping those entries.
    /// Payload bytes become unreferenced; the region cursor is rolled back to
    /// the end of the highest surviving payload.
    pub(crate) async fn truncate_from(&self, index: u64) -> std::io::Result<()> {
        let index = index.max(self.first_index);
        let start_slot = self.slot_of(index);
        let slots = self.records_per_partition as usize - start_slot;
        if slots == 0 {
            return Ok(());
        }

        let zeros = vec![0u8; slots * LogEntryMetadata::SIZE];
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(self.slot_offset(index))).await?;
        file.write_all(&zeros).await?;
        drop(file);

        let mut table = self.table.write().unwrap();
        let mut cursor = Self::table_size(self.records_per_partition);
        for (slot, meta) in table.iter_mut().enumerate() {
            if slot >= start_slot {
                *meta = LogEntryMetadata::default();
            } else if !meta.is_empty_slot() {
                cursor = cursor.max((meta.offset + meta.length) as u64);
            }
        }
        drop(table);
        *self.cursor.write().unwrap() = cursor;
        Ok(())
    }

    /// Flush buffered writes according to the configured mode.
    pub(crate) async fn flush(&self, mode: WriteMode) -> std::io::Result<()> {
        match mode {
            WriteMode::NoFlush => Ok(()),
            WriteMode::AutoFlush => {
                let mut file = self.file.lock().await;
                file.flush().await
            }
            WriteMode::WriteThrough => {
                let file = self.file.lock().await;
                file.sync_data().await
            }
        }
    }

    /// Delete the partition file. The partition must not be used afterwards.
    pub(crate) async fn delete(&self) -> std::io::Result<()> {
        tokio::fs::remove_file(&self.path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft_types::LogId;

    fn entry(term: u64, index: u64, body: &'static [u8]) -> Entry {
        Entry::new_normal(LogId::new(term, index), None, Bytes::from_static(body))
    }

    #[tokio::test]
    async fn test_create_append_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let p = Partition::create(dir.path(), 0, 8, 0, false).await.unwrap();

        let e1 = entry(1, 1, b"one");
        let e2 = entry(1, 2, b"two-two");
        p.append_entry(&e1).await.unwrap();
        p.append_entry(&e2).await.unwrap();

        assert_eq!(p.read_entry(1).await.unwrap().unwrap(), e1);
        assert_eq!(p.read_entry(2).await.unwrap().unwrap(), e2);
        assert_eq!(p.read_entry(3).await.unwrap(), None);
        assert_eq!(p.highest_present_index(), Some(2));
    }

    #[tokio::test]
    async fn test_payload_offsets_strictly_increase() {
        let dir = tempfile::tempdir().unwrap();
        let p = Partition::create(dir.path(), 0, 8, 0, false).await.unwrap();
        for i in 1..6 {
            p.append_entry(&entry(1, i, b"abcdef")).await.unwrap();
        }
        let mut last = 0i64;
        for i in 1..6 {
            let meta = p.metadata(i).unwrap();
            assert!(meta.offset > last);
            last = meta.offset;
        }
    }

    #[tokio::test]
    async fn test_reopen_recovers_table_and_cursor() {
        let dir = tempfile::tempdir().unwrap();
        {
            let p = Partition::create(dir.path(), 1, 8, 0, false).await.unwrap();
            for i in 8..12 {
                p.append_entry(&entry(2, i, b"payload")).await.unwrap();
            }
            p.flush(WriteMode::WriteThrough).await.unwrap();
        }

        let p = Partition::open(dir.path(), 1, 8, 4096, false).await.unwrap();
        assert_eq!(p.first_index, 8);
        assert_eq!(p.highest_present_index(), Some(11));
        for i in 8..12 {
            assert_eq!(p.read_entry(i).await.unwrap().unwrap(), entry(2, i, b"payload"));
        }

        // Appending after reopen continues past the recovered payload region.
        p.append_entry(&entry(2, 12, b"after-reopen")).await.unwrap();
        assert_eq!(p.read_entry(12).await.unwrap().unwrap(), entry(2, 12, b"after-reopen"));
    }

    #[tokio::test]
    async fn test_truncate_from_drops_tail_slots() {
        let dir = tempfile::tempdir().unwrap();
        let p = Partition::create(dir.path(), 0, 8, 0, false).await.unwrap();
        for i in 1..7 {
            p.append_entry(&entry(1, i, b"x")).await.unwrap();
        }
        p.truncate_from(4).await.unwrap();
        assert_eq!(p.highest_present_index(), Some(3));
        assert_eq!(p.read_entry(4).await.unwrap(), None);
        assert_eq!(p.read_entry(6).await.unwrap(), None);
        assert!(p.read_entry(3).await.unwrap().is_some());

        // The zeroed slots survive a reopen.
        p.flush(WriteMode::WriteThrough).await.unwrap();
        drop(p);
        let p = Partition::open(dir.path(), 0, 8, 4096, false).await.unwrap();
        assert_eq!(p.highest_present_index(), Some(3));
    }

    #[tokio::test]
    async fn test_initial_allocation_covers_table() {
        let dir = tempfile::tempdir().unwrap();
        let p = Partition::create(dir.path(), 0, 128, 1 << 16, false).await.unwrap();
        let len = tokio::fs::metadata(dir.path().join(Partition::file_name(0))).await.unwrap().len();
        assert!(len >= 1 << 16);
        assert!(len >= Partition::table_size(128));
        drop(p);
    }

    #[tokio::test]
    async fn test_parallel_io_reads_use_fresh_handles() {
        let dir = tempfile::tempdir().unwrap();
        let p = Partition::create(dir.path(), 0, 8, 0, true).await.unwrap();
        let e = entry(1, 1, b"parallel");
        p.append_entry(&e).await.unwrap();
        p.flush(WriteMode::AutoFlush).await.unwrap();

        let (a, b) = tokio::join!(p.read_entry(1), p.read_entry(1));
        assert_eq!(a.unwrap().unwrap(), e);
        assert_eq!(b.unwrap().unwrap(), e);
    }
}
