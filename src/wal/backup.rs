//! Backup archives of a log store directory.
//!
//! The archive is a deflate-compressed stream of length-prefixed file
//! records: `u16 path_len, path (relative, utf-8), u64 body_len, body`.
//! Restore unpacks into an empty directory which can then be opened as a
//! store.

use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::error::WalError;
use crate::wal::BackupCompression;
use crate::wal::PARTITIONS_DIRNAME;

const BACKUP_MAGIC: [u8; 4] = *b"RWBK";

fn compression_level(compression: BackupCompression) -> Compression {
    match compression {
        BackupCompression::None => Compression::none(),
        BackupCompression::Fast => Compression::fast(),
        BackupCompression::Optimal => Compression::best(),
    }
}

/// The store files worth archiving, as paths relative to the store root.
fn collect_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for name in &[
        super::STATE_FILENAME,
        super::SNAPSHOT_FILENAME,
        crate::membership::PersistentConfigurationStorage::ACTIVE_FILENAME,
        crate::membership::PersistentConfigurationStorage::PROPOSED_FILENAME,
    ] {
        if dir.join(name).is_file() {
            files.push(PathBuf::from(name));
        }
    }
    let partitions = dir.join(PARTITIONS_DIRNAME);
    if partitions.is_dir() {
        for dirent in std::fs::read_dir(&partitions)? {
            let dirent = dirent?;
            if dirent.path().extension().map(|e| e == "dat").unwrap_or(false) {
                files.push(PathBuf::from(PARTITIONS_DIRNAME).join(dirent.file_name()));
            }
        }
    }
    files.sort();
    Ok(files)
}

fn write_archive(dir: &Path, dest: &Path, compression: BackupCompression) -> std::io::Result<()> {
    let out = std::fs::File::create(dest)?;
    let mut encoder = DeflateEncoder::new(out, compression_level(compression));
    encoder.write_all(&BACKUP_MAGIC)?;

    for rel in collect_files(dir)? {
        let body = std::fs::read(dir.join(&rel))?;
        let name = rel.to_string_lossy();
        encoder.write_all(&(name.len() as u16).to_le_bytes())?;
        encoder.write_all(name.as_bytes())?;
        encoder.write_all(&(body.len() as u64).to_le_bytes())?;
        encoder.write_all(&body)?;
    }
    encoder.finish()?.sync_all()?;
    Ok(())
}

fn read_archive(archive: &Path, target: &Path) -> std::io::Result<()> {
    let raw = std::fs::File::open(archive)?;
    let mut decoder = DeflateDecoder::new(raw);
    let mut data = Vec::new();
    decoder.read_to_end(&mut data)?;

    let bad = |msg: &str| std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string());
    if data.len() < 4 || data[..4] != BACKUP_MAGIC {
        return Err(bad("not a log store backup archive"));
    }

    let mut at = 4;
    while at < data.len() {
        if at + 2 > data.len() {
            return Err(bad("truncated archive record"));
        }
        let name_len = u16::from_le_bytes([data[at], data[at + 1]]) as usize;
        at += 2;
        if at + name_len + 8 > data.len() {
            return Err(bad("truncated archive record"));
        }
        let name = std::str::from_utf8(&data[at..at + name_len]).map_err(|_| bad("archive path is not utf-8"))?;
        if name.contains("..") || name.starts_with('/') {
            return Err(bad("archive path escapes the target directory"));
        }
        at += name_len;
        let body_len = u64::from_le_bytes([
            data[at],
            data[at + 1],
            data[at + 2],
            data[at + 3],
            data[at + 4],
            data[at + 5],
            data[at + 6],
            data[at + 7],
        ]) as usize;
        at += 8;
        if at + body_len > data.len() {
            return Err(bad("truncated archive body"));
        }

        let path = target.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &data[at..at + body_len])?;
        at += body_len;
    }
    Ok(())
}

/// Archive the store directory into `dest`.
pub(crate) async fn create_backup(dir: &Path, dest: &Path, compression: BackupCompression) -> Result<(), WalError> {
    let dir = dir.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || write_archive(&dir, &dest, compression))
        .await
        .map_err(|e| WalError::Corruption(format!("backup task failed: {}", e)))??;
    Ok(())
}

/// Unpack a backup archive into `target`, which becomes an openable store
/// directory.
pub async fn restore_backup<P: AsRef<Path>, Q: AsRef<Path>>(archive: P, target: Q) -> Result<(), WalError> {
    let archive = archive.as_ref().to_path_buf();
    let target = target.as_ref().to_path_buf();
    tokio::task::spawn_blocking(move || read_archive(&archive, &target))
        .await
        .map_err(|e| WalError::Corruption(format!("restore task failed: {}", e)))??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_backup_round_trip_all_compression_levels() {
        for compression in &[BackupCompression::None, BackupCompression::Fast, BackupCompression::Optimal] {
            let src = tempfile::tempdir().unwrap();
            std::fs::write(src.path().join(super::super::STATE_FILENAME), b"state-bytes").unwrap();
            std::fs::create_dir_all(src.path().join(PARTITIONS_DIRNAME)).unwrap();
            std::fs::write(src.path().join(PARTITIONS_DIRNAME).join("0.dat"), b"partition-bytes").unwrap();

            let archive = src.path().join("backup.bin");
            create_backup(src.path(), &archive, *compression).await.unwrap();

            let restored = tempfile::tempdir().unwrap();
            restore_backup(&archive, restored.path()).await.unwrap();
            assert_eq!(
                std::fs::read(restored.path().join(super::super::STATE_FILENAME)).unwrap(),
                b"state-bytes"
            );
            assert_eq!(
                std::fs::read(restored.path().join(PARTITIONS_DIRNAME).join("0.dat")).unwrap(),
                b"partition-bytes"
            );
        }
    }
}
