// SPDX-FileCopyrightText: 2025 The seedlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::networking::BlockInfo;

use std::net::SocketAddr;

use tokio::sync::mpsc::Sender;

/// Manager to peer session.
#[derive(Debug, PartialEq, Clone)]
pub enum PeerCommand {
    RequestPiece { piece_index: u32, piece_size: u32 },
    CancelPiece(u32),
    Have(u32),
    Bitfield(Vec<u8>),
    Upload(BlockInfo, Vec<u8>),
    RejectRequest(BlockInfo),
    RequestMetadata,
    SendMetadata(Vec<u8>),
    Disconnect,
}

/// Everything that flows into a session manager: peer traffic, connection
/// attempts, discovery results and the outcome of off-loop work.
#[derive(Debug)]
pub enum SessionEvent {
    PeerConnected {
        peer: String,
        peer_id: [u8; 20],
        supports_metadata: bool,
        peer_tx: Sender<PeerCommand>,
    },
    ConnectFailed {
        peer: String,
        reason: String,
    },
    Disconnect(String),

    PeerBitfield(String, Vec<u8>),
    PeerHave(String, u32),
    BlockRequested(String, BlockInfo),
    RequestCancelled(String, BlockInfo),
    PieceReceived {
        peer: String,
        piece_index: u32,
        data: Vec<u8>,
    },
    PieceRejected(String, u32),
    MetadataRequested(String),
    MetadataReceived(String, Vec<u8>),

    PeersDiscovered(Vec<SocketAddr>),
    DiscoveryFinished {
        error: Option<String>,
    },

    PieceVerified {
        peer: String,
        piece_index: u32,
        verification_result: Result<Vec<u8>, ()>,
    },
    PieceWritten {
        peer: String,
        piece_index: u32,
    },
    PieceWriteFailed {
        piece_index: u32,
        reason: String,
    },
    BlockRead {
        peer: String,
        block: BlockInfo,
        data: Option<Vec<u8>>,
    },
    StorageReady,
    StorageFailed(String),
    ContentVerified {
        bad_pieces: Vec<u32>,
    },
}
