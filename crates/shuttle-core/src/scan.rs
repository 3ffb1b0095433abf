// SPDX-License-Identifier: AGPL-3.0
// LAN Shuttle Core - Outgoing file scan
//
// Runs before a code is issued: every selected path must be a readable
// regular file, and the manifest is sized up front so both sides can report
// progress against a fixed total.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::types::{FileDescriptor, ShuttleError, ShuttleResult};

/// A local file queued for sending
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub descriptor: FileDescriptor,
}

/// Files selected for one outgoing transfer, in send order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    pub files: Vec<ScannedFile>,
}

impl Manifest {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.descriptor.size_bytes).sum()
    }

    pub fn descriptors(&self) -> Vec<FileDescriptor> {
        self.files.iter().map(|f| f.descriptor.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Stat every path and build the manifest. Fails on the first path that is
/// missing, not a regular file, or unreadable.
pub fn scan_files<P: AsRef<Path>>(paths: &[P], chunk_size: usize) -> ShuttleResult<Manifest> {
    if paths.is_empty() {
        return Err(ShuttleError::FileIo("No files selected".to_string()));
    }

    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let path = path.as_ref();
        let metadata = fs::metadata(path)
            .map_err(|e| ShuttleError::FileIo(format!("{}: {}", path.display(), e)))?;

        if metadata.is_dir() {
            return Err(ShuttleError::FileIo(format!(
                "{} is a directory",
                path.display()
            )));
        }
        if !metadata.is_file() {
            return Err(ShuttleError::FileIo(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        File::open(path).map_err(|e| {
            ShuttleError::FileIo(format!("{} is not readable: {}", path.display(), e))
        })?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("file-{}", files.len()));

        files.push(ScannedFile {
            path: path.to_path_buf(),
            descriptor: FileDescriptor::new(name, metadata.len(), chunk_size),
        });
    }

    let manifest = Manifest { files };
    tracing::info!(
        "Scanned {} file(s), {} bytes total",
        manifest.len(),
        manifest.total_bytes()
    );
    Ok(manifest)
}
