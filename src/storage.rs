// SPDX-FileCopyrightText: 2025 The seedlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::content::{ContentDescriptor, FileEntry};
use crate::errors::StorageError;

use std::ops::Range;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::fs::{self, try_exists, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

#[derive(Debug, Clone, PartialEq)]
pub struct FileSlot {
    pub path: PathBuf,
    pub length: u64,
    /// Offset of the file's first byte in the concatenated content stream.
    pub global_start_offset: u64,
}

/// Maps the content byte stream onto a list of files on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct FileLayout {
    pub files: Vec<FileSlot>,
    pub total_size: u64,
}

impl FileLayout {
    /// Layout for a download: a single file lands directly in `root_dir`,
    /// multi-file content goes into a folder named after the content.
    pub fn for_download(root_dir: &Path, descriptor: &ContentDescriptor) -> Self {
        let base = if descriptor.files.len() == 1 {
            root_dir.to_path_buf()
        } else {
            root_dir.join(sanitize_component(&descriptor.name))
        };
        Self::from_entries(&descriptor.files, |entry| {
            let mut path = base.clone();
            for part in entry.name.split('/') {
                path.push(sanitize_component(part));
            }
            path
        })
    }

    /// Layout over existing files, in the order they were addressed.
    pub fn for_existing(paths: &[PathBuf], entries: &[FileEntry]) -> Self {
        let mut index = 0;
        Self::from_entries(entries, |_| {
            let path = paths.get(index).cloned().unwrap_or_default();
            index += 1;
            path
        })
    }

    fn from_entries(entries: &[FileEntry], mut path_for: impl FnMut(&FileEntry) -> PathBuf) -> Self {
        let mut files = Vec::with_capacity(entries.len());
        let mut offset = 0u64;
        for entry in entries {
            files.push(FileSlot {
                path: path_for(entry),
                length: entry.length,
                global_start_offset: offset,
            });
            offset += entry.length;
        }
        Self {
            files,
            total_size: offset,
        }
    }

    /// Creates parent folders and pre-sizes every file that does not exist yet.
    pub async fn create_and_allocate(&self) -> Result<(), StorageError> {
        for slot in &self.files {
            if let Some(parent) = slot.path.parent() {
                if !parent.as_os_str().is_empty() && !try_exists(parent).await? {
                    fs::create_dir_all(parent).await?;
                }
            }
            if !try_exists(&slot.path).await? {
                let file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&slot.path)
                    .await?;
                file.set_len(slot.length).await?;
            }
        }
        Ok(())
    }

    /// Files overlapping `offset..offset+len`, with the local range inside each.
    fn spans(&self, offset: u64, len: usize) -> impl Iterator<Item = (&FileSlot, u64, usize)> + '_ {
        let end = offset + len as u64;
        self.files.iter().filter_map(move |slot| {
            let file_end = slot.global_start_offset + slot.length;
            let start = offset.max(slot.global_start_offset);
            let stop = end.min(file_end);
            (start < stop).then(|| (slot, start - slot.global_start_offset, (stop - start) as usize))
        })
    }

    pub async fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
        check_bounds(offset, len, self.total_size)?;
        let mut buffer = Vec::with_capacity(len);
        for (slot, local_offset, chunk_len) in self.spans(offset, len) {
            let mut file = File::open(&slot.path).await?;
            file.seek(SeekFrom::Start(local_offset)).await?;
            let start = buffer.len();
            buffer.resize(start + chunk_len, 0);
            file.read_exact(&mut buffer[start..]).await?;
        }
        Ok(buffer)
    }

    pub async fn write(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        check_bounds(offset, data.len(), self.total_size)?;
        let mut written = 0usize;
        for (slot, local_offset, chunk_len) in self.spans(offset, data.len()) {
            let mut file = OpenOptions::new().write(true).open(&slot.path).await?;
            file.seek(SeekFrom::Start(local_offset)).await?;
            file.write_all(&data[written..written + chunk_len]).await?;
            written += chunk_len;
        }
        Ok(())
    }
}

fn check_bounds(offset: u64, len: usize, total: u64) -> Result<(), StorageError> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= total => Ok(()),
        _ => Err(StorageError::OutOfBounds {
            offset,
            length: len,
            total,
        }),
    }
}

/// Strips anything that would let a remote file name escape the download folder.
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect();
    match Path::new(&cleaned).components().next() {
        Some(Component::Normal(_)) if cleaned != "." && cleaned != ".." => cleaned,
        _ => "_".to_string(),
    }
}

#[derive(Debug)]
pub struct MemoryStore {
    data: RwLock<Vec<u8>>,
}

impl MemoryStore {
    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        check_bounds(offset, len, data.len() as u64)?;
        let start = offset as usize;
        Ok(data[start..start + len].to_vec())
    }

    fn write(&self, offset: u64, bytes: &[u8]) -> Result<(), StorageError> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        check_bounds(offset, bytes.len(), data.len() as u64)?;
        let start = offset as usize;
        data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

/// Where a session's bytes live: a memory buffer or a set of files.
#[derive(Debug, Clone)]
pub enum PieceStore {
    Memory(Arc<MemoryStore>),
    Files(Arc<FileLayout>),
}

impl PieceStore {
    pub fn memory(total_size: u64) -> Self {
        Self::from_bytes(vec![0; total_size as usize])
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        PieceStore::Memory(Arc::new(MemoryStore {
            data: RwLock::new(data),
        }))
    }

    pub fn files(layout: FileLayout) -> Self {
        PieceStore::Files(Arc::new(layout))
    }

    pub async fn prepare(&self) -> Result<(), StorageError> {
        match self {
            PieceStore::Memory(_) => Ok(()),
            PieceStore::Files(layout) => layout.create_and_allocate().await,
        }
    }

    pub async fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
        match self {
            PieceStore::Memory(store) => store.read(offset, len),
            PieceStore::Files(layout) => layout.read(offset, len).await,
        }
    }

    pub async fn write(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        match self {
            PieceStore::Memory(store) => store.write(offset, data),
            PieceStore::Files(layout) => layout.write(offset, data).await,
        }
    }

    /// Handles to every file of the content, for a finished session.
    pub fn completed_files(&self, descriptor: &ContentDescriptor) -> Vec<CompletedFile> {
        descriptor
            .file_ranges()
            .into_iter()
            .enumerate()
            .map(|(index, (file_name, byte_range))| {
                let handle = match self {
                    PieceStore::Memory(_) => RetrievableFile::Memory {
                        store: self.clone(),
                        range: byte_range.clone(),
                    },
                    PieceStore::Files(layout) => RetrievableFile::Disk {
                        path: layout
                            .files
                            .get(index)
                            .map(|slot| slot.path.clone())
                            .unwrap_or_default(),
                    },
                };
                CompletedFile {
                    file_name,
                    byte_range,
                    handle,
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct CompletedFile {
    pub file_name: String,
    pub byte_range: Range<u64>,
    pub handle: RetrievableFile,
}

/// A finished file the caller can read back.
#[derive(Debug, Clone)]
pub enum RetrievableFile {
    Memory { store: PieceStore, range: Range<u64> },
    Disk { path: PathBuf },
}

impl RetrievableFile {
    pub async fn read(&self) -> Result<Vec<u8>, StorageError> {
        match self {
            RetrievableFile::Memory { store, range } => {
                store
                    .read(range.start, (range.end - range.start) as usize)
                    .await
            }
            RetrievableFile::Disk { path } => Ok(fs::read(path).await?),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            RetrievableFile::Memory { .. } => None,
            RetrievableFile::Disk { path } => Some(path),
        }
    }
}
