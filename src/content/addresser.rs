// SPDX-FileCopyrightText: 2025 The seedlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use super::{hash_piece, ContentDescriptor, FileEntry, HASH_LENGTH};
use crate::errors::{EngineError, MetainfoError};

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tracing::{event, Level};

/// Partitions the concatenation of `files` into `piece_length` pieces and
/// builds the descriptor. Readers are consumed in order; only one piece is
/// buffered at a time.
pub fn address<R: Read>(
    files: Vec<(String, R)>,
    piece_length: u32,
    display_name: Option<String>,
) -> Result<ContentDescriptor, EngineError> {
    if files.is_empty() {
        return Err(EngineError::EmptyInput);
    }
    if piece_length == 0 {
        return Err(MetainfoError::Invalid("piece length must be positive".to_string()).into());
    }

    let name = display_name.unwrap_or_else(|| files[0].0.clone());
    let mut entries = Vec::with_capacity(files.len());
    let mut piece_hashes: Vec<[u8; HASH_LENGTH]> = Vec::new();
    let mut buffer = vec![0u8; piece_length as usize];
    let mut filled = 0usize;

    for (file_name, mut reader) in files {
        let mut file_length = 0u64;
        loop {
            let n = match reader.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            filled += n;
            file_length += n as u64;
            if filled == buffer.len() {
                piece_hashes.push(hash_piece(&buffer));
                filled = 0;
            }
        }
        entries.push(FileEntry {
            name: file_name,
            length: file_length,
        });
    }
    if filled > 0 {
        piece_hashes.push(hash_piece(&buffer[..filled]));
    }

    let descriptor = ContentDescriptor::from_parts(name, piece_length, piece_hashes, entries)?;
    event!(
        Level::DEBUG,
        content_id = %descriptor.content_id,
        pieces = descriptor.piece_count(),
        total_length = descriptor.total_length,
        "Content addressed"
    );
    Ok(descriptor)
}

pub fn address_buffers(
    files: &[(String, Vec<u8>)],
    piece_length: u32,
    display_name: Option<String>,
) -> Result<ContentDescriptor, EngineError> {
    let readers = files
        .iter()
        .map(|(name, data)| (name.clone(), data.as_slice()))
        .collect();
    address(readers, piece_length, display_name)
}

/// Hashes files on disk. Runs on the blocking pool.
pub async fn address_paths(
    paths: Vec<PathBuf>,
    piece_length: u32,
    display_name: Option<String>,
) -> Result<ContentDescriptor, EngineError> {
    if paths.is_empty() {
        return Err(EngineError::EmptyInput);
    }
    tokio::task::spawn_blocking(move || {
        let mut readers = Vec::with_capacity(paths.len());
        for path in &paths {
            let file = File::open(path)?;
            readers.push((file_name_of(path), io::BufReader::new(file)));
        }
        address(readers, piece_length, display_name)
    })
    .await
    .map_err(|e| EngineError::Io(io::Error::other(e)))?
}

pub fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_input_is_rejected() {
        let files: Vec<(String, &[u8])> = Vec::new();
        assert!(matches!(address(files, 16, None), Err(EngineError::EmptyInput)));
    }

    #[test]
    fn test_same_bytes_same_identity() {
        let files = vec![("a.bin".to_string(), vec![7u8; 1000])];
        let first = address_buffers(&files, 256, None).unwrap();
        let second = address_buffers(&files, 256, None).unwrap();
        assert_eq!(first.content_id, second.content_id);
        assert_eq!(first.piece_hashes, second.piece_hashes);
        assert_eq!(first.merkle_root, second.merkle_root);
    }

    #[test]
    fn test_pieces_span_file_boundaries() {
        let a = vec![1u8; 10];
        let b = vec![2u8; 7];
        let files = vec![("a".to_string(), a.clone()), ("b".to_string(), b.clone())];
        let d = address_buffers(&files, 8, None).unwrap();

        let mut all = a;
        all.extend_from_slice(&b);
        assert_eq!(d.piece_count(), 3);
        assert_eq!(d.piece_hashes[0], hash_piece(&all[0..8]));
        assert_eq!(d.piece_hashes[1], hash_piece(&all[8..16]));
        assert_eq!(d.piece_hashes[2], hash_piece(&all[16..17]));
        assert_eq!(d.name, "a");
        assert_eq!(d.files[1].length, 7);
    }

    #[test]
    fn test_piece_length_changes_identity() {
        let files = vec![("a".to_string(), vec![9u8; 64])];
        let small = address_buffers(&files, 16, None).unwrap();
        let large = address_buffers(&files, 32, None).unwrap();
        assert_ne!(small.content_id, large.content_id);
    }

    #[test]
    fn test_empty_file_yields_zero_pieces() {
        let files = vec![("empty".to_string(), Vec::new())];
        let d = address_buffers(&files, 16, Some("set".to_string())).unwrap();
        assert_eq!(d.piece_count(), 0);
        assert_eq!(d.total_length, 0);
        assert_eq!(d.name, "set");
    }

    #[tokio::test]
    async fn test_address_paths_matches_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.bin");
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&data)
            .unwrap();

        let from_disk = address_paths(vec![path], 1024, None).await.unwrap();
        let from_memory = address_buffers(&[("movie.bin".to_string(), data)], 1024, None).unwrap();
        assert_eq!(from_disk.content_id, from_memory.content_id);
        assert_eq!(from_disk.name, "movie.bin");
    }
}
