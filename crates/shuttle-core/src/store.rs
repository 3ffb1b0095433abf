// SPDX-License-Identifier: AGPL-3.0
// LAN Shuttle Core - Incoming file store
//
// Chunks are written in place into `<name>.<session>.<index>.part` files. A file is
// renamed to its final, collision-free name only after its whole-file hash
// matches the sender's. Part files of a failed session are removed.

use sha2::{Digest, Sha256};
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::types::{FileDescriptor, SessionId, ShuttleError, ShuttleResult};

const HASH_BUFFER: usize = 64 * 1024;

/// Keep only the last path component of a peer-supplied name
pub fn sanitize_file_name(name: &str, fallback: &str) -> String {
    let trimmed = name.trim();
    let file_name = Path::new(trimmed)
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.trim())
        .filter(|n| !n.is_empty() && *n != "." && *n != "..");

    file_name
        .map(|n| n.to_string())
        .unwrap_or_else(|| fallback.to_string())
}

fn split_file_name(name: &str) -> (&str, &str) {
    if let Some((stem, ext)) = name.rsplit_once('.') {
        if !stem.is_empty() {
            return (stem, ext);
        }
    }
    (name, "")
}

/// Reserve `base_name` in `dir`, or `stem (n).ext` if it is taken
pub async fn reserve_unique_path(dir: &Path, base_name: &str) -> std::io::Result<PathBuf> {
    let (stem, ext) = split_file_name(base_name);

    for index in 0..1000 {
        let candidate = if index == 0 {
            base_name.to_string()
        } else if ext.is_empty() {
            format!("{} ({})", stem, index)
        } else {
            format!("{} ({}).{}", stem, index, ext)
        };

        let path = dir.join(&candidate);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => return Ok(path),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }

    Err(std::io::Error::new(
        ErrorKind::AlreadyExists,
        "Too many filename conflicts",
    ))
}

/// SHA-256 of a file on disk, hex encoded
pub async fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug)]
struct IncomingFile {
    descriptor: FileDescriptor,
    name: String,
    part_path: PathBuf,
    handle: Option<File>,
    received: Vec<bool>,
    received_count: u64,
    /// Set once the file is verified and renamed
    finished: Option<(PathBuf, String)>,
}

impl IncomingFile {
    fn is_complete(&self) -> bool {
        self.received_count == self.descriptor.chunk_count
    }
}

/// Result of checking a finished file against the sender's hash
#[derive(Debug, Clone, PartialEq)]
pub enum Verification {
    /// Hash matched; the file now lives at this path
    Verified(PathBuf),
    /// Not every chunk has arrived yet
    Incomplete,
    /// The reassembled file does not hash to the announced value
    HashMismatch { actual: String },
}

/// Part files of one receiving session
#[derive(Debug)]
pub struct IncomingStore {
    dir: PathBuf,
    chunk_size: usize,
    files: Vec<IncomingFile>,
}

impl IncomingStore {
    /// Create the download directory and one preallocated part file per entry
    pub async fn prepare(
        dir: &Path,
        descriptors: &[FileDescriptor],
        chunk_size: usize,
        session_id: SessionId,
    ) -> ShuttleResult<Self> {
        fs::create_dir_all(dir).await.map_err(|e| {
            ShuttleError::FileIo(format!("Failed to create {}: {}", dir.display(), e))
        })?;

        let tag = session_id.to_string();
        let tag = &tag[..8];
        let mut store = Self {
            dir: dir.to_path_buf(),
            chunk_size,
            files: Vec::with_capacity(descriptors.len()),
        };

        for (index, descriptor) in descriptors.iter().enumerate() {
            let name = sanitize_file_name(&descriptor.name, &format!("file-{}", index));
            let part_path = dir.join(format!("{}.{}.{}.part", name, tag, index));

            let opened = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&part_path)
                .await;
            let handle = match opened {
                Ok(h) => h,
                Err(e) => {
                    store.discard().await;
                    return Err(ShuttleError::FileIo(format!(
                        "Failed to create {}: {}",
                        part_path.display(),
                        e
                    )));
                }
            };
            if let Err(e) = handle.set_len(descriptor.size_bytes).await {
                tracing::debug!("Could not preallocate {}: {}", part_path.display(), e);
            }

            store.files.push(IncomingFile {
                descriptor: descriptor.clone(),
                name,
                part_path,
                handle: Some(handle),
                received: vec![false; descriptor.chunk_count as usize],
                received_count: 0,
                finished: None,
            });
        }

        Ok(store)
    }

    fn file_mut(&mut self, file_index: u32) -> ShuttleResult<&mut IncomingFile> {
        self.files
            .get_mut(file_index as usize)
            .ok_or_else(|| ShuttleError::Protocol(format!("unknown file index {}", file_index)))
    }

    /// Check that a chunk header matches the manifest
    pub fn check_chunk(
        &self,
        file_index: u32,
        chunk_index: u64,
        byte_offset: u64,
        length: u32,
    ) -> ShuttleResult<()> {
        let file = self
            .files
            .get(file_index as usize)
            .ok_or_else(|| ShuttleError::Protocol(format!("unknown file index {}", file_index)))?;
        let descriptor = &file.descriptor;

        if chunk_index >= descriptor.chunk_count {
            return Err(ShuttleError::Protocol(format!(
                "chunk {} out of range for {} ({} chunks)",
                chunk_index, descriptor.name, descriptor.chunk_count
            )));
        }
        if byte_offset != chunk_index * self.chunk_size as u64 {
            return Err(ShuttleError::Protocol(format!(
                "chunk {} of {} has offset {}",
                chunk_index, descriptor.name, byte_offset
            )));
        }
        let expected = descriptor.chunk_len(chunk_index, self.chunk_size);
        if length as usize != expected {
            return Err(ShuttleError::Protocol(format!(
                "chunk {} of {} is {} bytes, expected {}",
                chunk_index, descriptor.name, length, expected
            )));
        }
        Ok(())
    }

    /// Write a verified chunk. Returns true the first time a chunk lands.
    pub async fn write_chunk(
        &mut self,
        file_index: u32,
        chunk_index: u64,
        byte_offset: u64,
        data: &[u8],
    ) -> ShuttleResult<bool> {
        let file = self.file_mut(file_index)?;
        if file.finished.is_some() {
            return Ok(false);
        }

        let handle = file
            .handle
            .as_mut()
            .ok_or_else(|| ShuttleError::FileIo(format!("{} is closed", file.name)))?;
        handle.seek(SeekFrom::Start(byte_offset)).await?;
        handle.write_all(data).await?;

        let slot = &mut file.received[chunk_index as usize];
        if *slot {
            return Ok(false);
        }
        *slot = true;
        file.received_count += 1;
        Ok(true)
    }

    /// Check the whole file against `expected_hash` and move it into place
    pub async fn finish_file(
        &mut self,
        file_index: u32,
        expected_hash: &str,
    ) -> ShuttleResult<Verification> {
        let dir = self.dir.clone();
        let file = self.file_mut(file_index)?;

        if let Some((path, hash)) = &file.finished {
            return Ok(if hash == expected_hash {
                Verification::Verified(path.clone())
            } else {
                Verification::HashMismatch {
                    actual: hash.clone(),
                }
            });
        }
        if !file.is_complete() {
            return Ok(Verification::Incomplete);
        }

        if let Some(mut handle) = file.handle.take() {
            handle.flush().await?;
            handle.sync_all().await?;
        }

        let actual = hash_file(&file.part_path).await?;
        if actual != expected_hash {
            return Ok(Verification::HashMismatch { actual });
        }

        let final_path = reserve_unique_path(&dir, &file.name).await?;
        fs::rename(&file.part_path, &final_path).await?;
        tracing::info!("Saved {} to {}", file.descriptor.name, final_path.display());

        file.finished = Some((final_path.clone(), actual));
        Ok(Verification::Verified(final_path))
    }

    pub fn is_finished(&self, file_index: u32) -> bool {
        self.files
            .get(file_index as usize)
            .is_some_and(|f| f.finished.is_some())
    }

    /// Paths of files already moved into place
    pub fn finished_paths(&self) -> Vec<PathBuf> {
        self.files
            .iter()
            .filter_map(|f| f.finished.as_ref().map(|(p, _)| p.clone()))
            .collect()
    }

    /// Remove every part file that was not completed
    pub async fn discard(&mut self) {
        for file in &mut self.files {
            if file.finished.is_some() {
                continue;
            }
            file.handle = None;
            match fs::remove_file(&file.part_path).await {
                Ok(()) => tracing::debug!("Removed partial file {}", file.part_path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    "Failed to remove partial file {}: {}",
                    file.part_path.display(),
                    e
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::checksum;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("../../etc/passwd", "x"), "passwd");
        assert_eq!(sanitize_file_name("  ", "fallback"), "fallback");
        assert_eq!(sanitize_file_name("..", "fallback"), "fallback");
        assert_eq!(sanitize_file_name("report.pdf", "x"), "report.pdf");
    }

    #[test]
    fn test_split_file_name() {
        assert_eq!(split_file_name("a.tar.gz"), ("a.tar", "gz"));
        assert_eq!(split_file_name(".bashrc"), (".bashrc", ""));
        assert_eq!(split_file_name("README"), ("README", ""));
    }

    #[tokio::test]
    async fn test_unique_names() {
        let dir = tempfile::tempdir().unwrap();
        let first = reserve_unique_path(dir.path(), "a.txt").await.unwrap();
        let second = reserve_unique_path(dir.path(), "a.txt").await.unwrap();
        assert_eq!(first.file_name().unwrap(), "a.txt");
        assert_eq!(second.file_name().unwrap(), "a (1).txt");
    }

    #[tokio::test]
    async fn test_out_of_order_chunks_reassemble() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"hello shuttle!".to_vec();
        let descriptor = FileDescriptor::new("greeting.txt", data.len() as u64, 4);
        let mut store = IncomingStore::prepare(dir.path(), &[descriptor], 4, SessionId::new())
            .await
            .unwrap();

        for chunk_index in [3u64, 1, 0, 2, 1] {
            let start = chunk_index as usize * 4;
            let end = (start + 4).min(data.len());
            store
                .check_chunk(0, chunk_index, start as u64, (end - start) as u32)
                .unwrap();
            store
                .write_chunk(0, chunk_index, start as u64, &data[start..end])
                .await
                .unwrap();
        }

        let verification = store.finish_file(0, &checksum(&data)).await.unwrap();
        let Verification::Verified(path) = verification else {
            panic!("expected verified file, got {:?}", verification);
        };
        assert_eq!(std::fs::read(&path).unwrap(), data);
        assert_eq!(path.file_name().unwrap(), "greeting.txt");
    }

    #[tokio::test]
    async fn test_duplicate_chunk_counts_once() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = FileDescriptor::new("a.bin", 8, 4);
        let mut store = IncomingStore::prepare(dir.path(), &[descriptor], 4, SessionId::new())
            .await
            .unwrap();

        assert!(store.write_chunk(0, 0, 0, b"abcd").await.unwrap());
        assert!(!store.write_chunk(0, 0, 0, b"abcd").await.unwrap());
        assert_eq!(
            store.finish_file(0, "whatever").await.unwrap(),
            Verification::Incomplete
        );
    }

    #[tokio::test]
    async fn test_bad_chunk_header_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = FileDescriptor::new("a.bin", 10, 4);
        let store = IncomingStore::prepare(dir.path(), &[descriptor], 4, SessionId::new())
            .await
            .unwrap();

        assert!(store.check_chunk(0, 3, 12, 4).is_err());
        assert!(store.check_chunk(0, 1, 5, 4).is_err());
        assert!(store.check_chunk(0, 2, 8, 4).is_err());
        assert!(store.check_chunk(1, 0, 0, 4).is_err());
        assert!(store.check_chunk(0, 2, 8, 2).is_ok());
    }

    #[tokio::test]
    async fn test_discard_removes_part_files() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = FileDescriptor::new("a.bin", 8, 4);
        let mut store = IncomingStore::prepare(dir.path(), &[descriptor], 4, SessionId::new())
            .await
            .unwrap();
        store.write_chunk(0, 0, 0, b"abcd").await.unwrap();
        store.discard().await;

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_same_named_entries_do_not_share_a_part_file() {
        let dir = tempfile::tempdir().unwrap();
        let descriptors = [
            FileDescriptor::new("report.bin", 4, 4),
            FileDescriptor::new("report.bin", 4, 4),
        ];
        let mut store = IncomingStore::prepare(dir.path(), &descriptors, 4, SessionId::new())
            .await
            .unwrap();

        store.write_chunk(0, 0, 0, b"AAAA").await.unwrap();
        store.write_chunk(1, 0, 0, b"BBBB").await.unwrap();

        let Verification::Verified(first) = store.finish_file(0, &checksum(b"AAAA")).await.unwrap()
        else {
            panic!("first entry did not verify");
        };
        let Verification::Verified(second) = store.finish_file(1, &checksum(b"BBBB")).await.unwrap()
        else {
            panic!("second entry did not verify");
        };
        assert_eq!(first.file_name().unwrap(), "report.bin");
        assert_eq!(second.file_name().unwrap(), "report (1).bin");
        assert_eq!(std::fs::read(&first).unwrap(), b"AAAA");
        assert_eq!(std::fs::read(&second).unwrap(), b"BBBB");
    }

    #[tokio::test]
    async fn test_zero_byte_file_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = FileDescriptor::new("empty.txt", 0, 4);
        let mut store = IncomingStore::prepare(dir.path(), &[descriptor], 4, SessionId::new())
            .await
            .unwrap();

        let verification = store.finish_file(0, &checksum(b"")).await.unwrap();
        assert!(matches!(verification, Verification::Verified(_)));
        assert!(store.is_finished(0));
    }
}
