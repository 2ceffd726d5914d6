// SPDX-FileCopyrightText: 2025 The seedlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod addresser;
pub mod merkle;
pub mod metainfo;

use crate::errors::MetainfoError;
use merkle::MerkleHash;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use std::fmt;
use std::ops::Range;

pub const HASH_LENGTH: usize = 20;

/// SHA-1 of the canonical info dictionary. Names the content everywhere.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId(pub [u8; HASH_LENGTH]);

impl ContentId {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; HASH_LENGTH] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self.to_hex())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub length: u64,
}

/// On-the-wire info dictionary. Field order matches the sorted bencode keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct InfoDict {
    files: Vec<InfoFile>,
    length: u64,
    #[serde(rename = "merkle root", with = "serde_bytes")]
    merkle_root: Vec<u8>,
    name: String,
    #[serde(rename = "piece length")]
    piece_length: u32,
    #[serde(with = "serde_bytes")]
    pieces: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct InfoFile {
    length: u64,
    path: Vec<String>,
}

/// Immutable description of a piece of content: everything a downloader
/// needs to fetch and verify it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDescriptor {
    pub content_id: ContentId,
    pub name: String,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; HASH_LENGTH]>,
    pub total_length: u64,
    pub files: Vec<FileEntry>,
    pub merkle_root: MerkleHash,
    info_bytes: Vec<u8>,
}

impl ContentDescriptor {
    pub fn from_parts(
        name: String,
        piece_length: u32,
        piece_hashes: Vec<[u8; HASH_LENGTH]>,
        files: Vec<FileEntry>,
    ) -> Result<Self, MetainfoError> {
        let total_length = files.iter().map(|f| f.length).sum();
        let merkle_root = merkle::merkle_root(&piece_hashes);

        let info = InfoDict {
            files: files
                .iter()
                .map(|f| InfoFile {
                    length: f.length,
                    path: vec![f.name.clone()],
                })
                .collect(),
            length: total_length,
            merkle_root: merkle_root.to_vec(),
            name: name.clone(),
            piece_length,
            pieces: piece_hashes.concat(),
        };
        let info_bytes = serde_bencode::to_bytes(&info)?;
        let content_id = ContentId(Sha1::digest(&info_bytes).into());

        let descriptor = Self {
            content_id,
            name,
            piece_length,
            piece_hashes,
            total_length,
            files,
            merkle_root,
            info_bytes,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Rebuilds a descriptor from info dictionary bytes received from a peer
    /// or read from a metainfo file. The identifier is the hash of exactly
    /// these bytes.
    pub fn from_info_bytes(info_bytes: &[u8]) -> Result<Self, MetainfoError> {
        let info: InfoDict = serde_bencode::from_bytes(info_bytes)?;

        if info.pieces.len() % HASH_LENGTH != 0 {
            return Err(MetainfoError::Invalid(format!(
                "pieces field is {} bytes, not a multiple of {}",
                info.pieces.len(),
                HASH_LENGTH
            )));
        }
        let piece_hashes: Vec<[u8; HASH_LENGTH]> = info
            .pieces
            .chunks_exact(HASH_LENGTH)
            .filter_map(|chunk| chunk.try_into().ok())
            .collect();

        let merkle_root: MerkleHash = info
            .merkle_root
            .as_slice()
            .try_into()
            .map_err(|_| MetainfoError::Invalid("merkle root must be 32 bytes".to_string()))?;

        let mut files = Vec::with_capacity(info.files.len());
        for file in info.files {
            let name = file.path.join("/");
            if name.is_empty() {
                return Err(MetainfoError::Invalid("file with an empty path".to_string()));
            }
            files.push(FileEntry {
                name,
                length: file.length,
            });
        }

        let descriptor = Self {
            content_id: ContentId(Sha1::digest(info_bytes).into()),
            name: info.name,
            piece_length: info.piece_length,
            piece_hashes,
            total_length: info.length,
            files,
            merkle_root,
            info_bytes: info_bytes.to_vec(),
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    fn validate(&self) -> Result<(), MetainfoError> {
        if self.piece_length == 0 {
            return Err(MetainfoError::Invalid("piece length must be positive".to_string()));
        }
        let file_sum: u64 = self.files.iter().map(|f| f.length).sum();
        if file_sum != self.total_length {
            return Err(MetainfoError::Invalid(format!(
                "file lengths sum to {} but total length is {}",
                file_sum, self.total_length
            )));
        }
        let expected_pieces = self.total_length.div_ceil(self.piece_length as u64);
        if expected_pieces != self.piece_hashes.len() as u64 {
            return Err(MetainfoError::Invalid(format!(
                "expected {} piece hashes, found {}",
                expected_pieces,
                self.piece_hashes.len()
            )));
        }
        if merkle::merkle_root(&self.piece_hashes) != self.merkle_root {
            return Err(MetainfoError::Invalid(
                "merkle root does not match the piece hashes".to_string(),
            ));
        }
        Ok(())
    }

    pub fn info_bytes(&self) -> &[u8] {
        &self.info_bytes
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    pub fn piece_offset(&self, piece_index: u32) -> u64 {
        piece_index as u64 * self.piece_length as u64
    }

    /// Length of a piece. Only the last one may be shorter.
    pub fn piece_size(&self, piece_index: u32) -> u32 {
        let start = self.piece_offset(piece_index);
        let remaining = self.total_length.saturating_sub(start);
        remaining.min(self.piece_length as u64) as u32
    }

    pub fn piece_hash(&self, piece_index: u32) -> Option<&[u8; HASH_LENGTH]> {
        self.piece_hashes.get(piece_index as usize)
    }

    /// Byte range of every file within the concatenated content stream.
    pub fn file_ranges(&self) -> Vec<(String, Range<u64>)> {
        let mut offset = 0u64;
        self.files
            .iter()
            .map(|file| {
                let range = offset..offset + file.length;
                offset += file.length;
                (file.name.clone(), range)
            })
            .collect()
    }
}

pub fn hash_piece(data: &[u8]) -> [u8; HASH_LENGTH] {
    Sha1::digest(data).into()
}
