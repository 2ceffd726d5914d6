// SPDX-FileCopyrightText: 2025 The seedlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use thiserror::Error;

/// Errors surfaced by the engine to its caller.
///
/// Per-piece and per-peer failures (`PieceVerification`,
/// `UnreliablePeerDropped`, `HandshakeMismatch`) are recovered inside the
/// session manager and only logged; a caller sees them at most as the cause
/// text carried by `SessionFailed`.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("No files were supplied")]
    EmptyInput,

    #[error("Malformed share link: {reason}")]
    MalformedLink { reason: String },

    #[error("No peers found for the content")]
    NoPeersFound,

    #[error("Remote peer references a different content identifier")]
    HandshakeMismatch,

    #[error("Piece {piece_index} failed hash verification")]
    PieceVerification { piece_index: u32 },

    #[error("Peer {peer} dropped after repeated verification failures")]
    UnreliablePeerDropped { peer: String },

    #[error("Session failed: {cause}")]
    SessionFailed { cause: String },

    #[error("Content {content_id} already has a running session")]
    DuplicateSession { content_id: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Metainfo error: {0}")]
    Metainfo(#[from] MetainfoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn malformed_link(reason: impl Into<String>) -> Self {
        EngineError::MalformedLink {
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Range {offset}+{length} is outside the content ({total} bytes)")]
    OutOfBounds { offset: u64, length: usize, total: u64 },
}

#[derive(Error, Debug)]
pub enum MetainfoError {
    #[error("Bencode error: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("Missing 'info' dictionary")]
    MissingInfoDict,

    #[error("Invalid metainfo: {0}")]
    Invalid(String),
}

#[derive(Error, Debug, Clone)]
pub enum DiscoveryError {
    #[error("Endpoint {endpoint} request failed: {reason}")]
    Http { endpoint: String, reason: String },

    #[error("Endpoint {endpoint} timed out")]
    Timeout { endpoint: String },

    #[error("Endpoint {endpoint} refused the announce: {reason}")]
    Refused { endpoint: String, reason: String },

    #[error("Endpoint {endpoint} sent an undecodable response: {reason}")]
    Decode { endpoint: String, reason: String },

    #[error("No peers found on any discovery endpoint")]
    NoPeersFound,
}
