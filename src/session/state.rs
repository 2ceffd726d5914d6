// SPDX-FileCopyrightText: 2025 The seedlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use super::piece_manager::PieceManager;
use super::{SessionRole, TransferState};

use crate::command::{PeerCommand, SessionEvent};
use crate::config::Settings;
use crate::content::{ContentDescriptor, ContentId};
use crate::errors::EngineError;
use crate::networking::protocol::{decode_bitfield, encode_bitfield};
use crate::networking::BlockInfo;

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::Sender;
use tracing::{event, Level};

const PEER_UPLOAD_IN_FLIGHT_LIMIT: usize = 8;
const MAX_EARLY_HAVES: usize = 4096;

#[derive(Debug)]
pub enum Action {
    Start,
    AnnounceDue,
    PeerEvent(SessionEvent),
}

#[derive(Debug)]
#[must_use]
pub enum Effect {
    StartDiscovery {
        delay: Duration,
    },
    ConnectToPeer(SocketAddr),
    SendToPeer {
        peer: String,
        cmd: PeerCommand,
    },
    DisconnectPeer {
        peer: String,
        peer_tx: Sender<PeerCommand>,
    },
    VerifyPiece {
        peer: String,
        piece_index: u32,
        data: Vec<u8>,
    },
    WritePiece {
        peer: String,
        piece_index: u32,
        data: Vec<u8>,
    },
    ReadBlock {
        peer: String,
        block: BlockInfo,
    },
    ResolveStorage(Arc<ContentDescriptor>),
    VerifyContent,
    EmitProgress,
    Completed,
    Failed {
        cause: String,
    },
}

/// Knobs the state machine reads from the settings.
#[derive(Debug, Clone)]
pub struct Limits {
    pub max_connected_peers: usize,
    pub max_requests_per_session: usize,
    pub max_requests_per_peer: usize,
    pub max_verification_failures: u32,
    pub max_discovery_rounds: u32,
    pub rediscovery_delay: Duration,
    pub verify_on_completion: bool,
}

impl From<&Settings> for Limits {
    fn from(settings: &Settings) -> Self {
        Self {
            max_connected_peers: settings.max_connected_peers.max(1),
            max_requests_per_session: settings.max_requests_per_session.max(1),
            max_requests_per_peer: settings.max_requests_per_peer.max(1),
            max_verification_failures: settings.max_verification_failures.max(1),
            max_discovery_rounds: settings.max_discovery_rounds,
            rediscovery_delay: settings.rediscovery_delay(),
            verify_on_completion: settings.verify_on_completion,
        }
    }
}

/// One connected remote peer as seen by the exchange engine.
#[derive(Debug)]
pub struct PeerHandle {
    pub address: String,
    pub peer_id: [u8; 20],
    pub peer_tx: Sender<PeerCommand>,
    pub supports_metadata: bool,
    pub bitfield: Vec<bool>,
    /// Bitfield received before the piece count was known.
    pub raw_bitfield: Option<Vec<u8>>,
    /// `Have` indexes received before the piece count was known, capped at `MAX_EARLY_HAVES`.
    pub early_haves: HashSet<u32>,
    pub pending_requests: HashSet<u32>,
    pub uploads_in_flight: usize,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
}

impl PeerHandle {
    pub fn new(
        address: String,
        peer_id: [u8; 20],
        peer_tx: Sender<PeerCommand>,
        supports_metadata: bool,
    ) -> Self {
        Self {
            address,
            peer_id,
            peer_tx,
            supports_metadata,
            bitfield: Vec::new(),
            raw_bitfield: None,
            early_haves: HashSet::new(),
            pending_requests: HashSet::new(),
            uploads_in_flight: 0,
            bytes_downloaded: 0,
            bytes_uploaded: 0,
        }
    }

    fn has_piece(&self, piece_index: u32) -> bool {
        self.bitfield.get(piece_index as usize) == Some(&true)
    }
}

#[derive(Debug)]
pub struct SessionState {
    pub role: SessionRole,
    pub transfer_state: TransferState,
    pub content_id: ContentId,
    pub descriptor: Option<Arc<ContentDescriptor>>,
    pub storage_ready: bool,
    pub piece_manager: PieceManager,
    pub peers: HashMap<String, PeerHandle>,
    pub connecting: HashSet<String>,
    pub candidates: VecDeque<SocketAddr>,
    pub failed_candidates: HashSet<SocketAddr>,
    pub discovery_active: bool,
    pub discovery_rounds: u32,
    pub metadata_requested_from: Option<String>,
    /// Consecutive verification failures per (piece, peer).
    pub verification_failures: HashMap<(u32, String), u32>,
    pub last_failure: Option<String>,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    pub limits: Limits,
}

impl SessionState {
    pub fn new_seed(descriptor: Arc<ContentDescriptor>, limits: Limits) -> Self {
        let mut piece_manager = PieceManager::new();
        piece_manager.set_initial_fields(descriptor.piece_count(), true);
        Self {
            storage_ready: true,
            piece_manager,
            ..Self::empty(SessionRole::Seed, descriptor.content_id, Some(descriptor), limits)
        }
    }

    pub fn new_download(
        content_id: ContentId,
        descriptor: Option<Arc<ContentDescriptor>>,
        limits: Limits,
    ) -> Self {
        let mut state = Self::empty(SessionRole::Download, content_id, None, limits);
        if let Some(descriptor) = descriptor {
            state.piece_manager.set_initial_fields(descriptor.piece_count(), false);
            state.descriptor = Some(descriptor);
        }
        state
    }

    fn empty(
        role: SessionRole,
        content_id: ContentId,
        descriptor: Option<Arc<ContentDescriptor>>,
        limits: Limits,
    ) -> Self {
        Self {
            role,
            transfer_state: TransferState::Idle,
            content_id,
            descriptor,
            storage_ready: false,
            piece_manager: PieceManager::new(),
            peers: HashMap::new(),
            connecting: HashSet::new(),
            candidates: VecDeque::new(),
            failed_candidates: HashSet::new(),
            discovery_active: false,
            discovery_rounds: 0,
            metadata_requested_from: None,
            verification_failures: HashMap::new(),
            last_failure: None,
            bytes_downloaded: 0,
            bytes_uploaded: 0,
            limits,
        }
    }

    pub fn owned_pieces(&self) -> usize {
        self.piece_manager.owned_count()
    }

    pub fn total_pieces(&self) -> usize {
        self.piece_manager.piece_count()
    }

    /// Payload bytes we still lack, or the advertised size when unknown.
    pub fn bytes_left(&self, advertised_total: u64) -> u64 {
        let Some(descriptor) = &self.descriptor else {
            return advertised_total;
        };
        let owned: u64 = (0..descriptor.piece_count() as u32)
            .filter(|&p| self.piece_manager.is_owned(p))
            .map(|p| descriptor.piece_size(p) as u64)
            .sum();
        descriptor.total_length.saturating_sub(owned)
    }

    pub fn update(&mut self, action: Action) -> Vec<Effect> {
        if self.transfer_state == TransferState::Failed {
            return Vec::new();
        }

        let mut effects = Vec::new();
        match action {
            Action::Start => self.start(&mut effects),
            Action::AnnounceDue => {
                if !self.discovery_active {
                    self.discovery_active = true;
                    effects.push(Effect::StartDiscovery {
                        delay: Duration::ZERO,
                    });
                }
            }
            Action::PeerEvent(session_event) => self.on_event(session_event, &mut effects),
        }

        self.assign_requests(&mut effects);
        self.check_starvation(&mut effects);
        effects
    }

    fn start(&mut self, effects: &mut Vec<Effect>) {
        if self.transfer_state != TransferState::Idle {
            return;
        }
        match self.role {
            SessionRole::Seed => {
                self.transfer_state = TransferState::Exchanging;
            }
            SessionRole::Download => {
                self.transfer_state = TransferState::Discovering;
                if let Some(descriptor) = &self.descriptor {
                    effects.push(Effect::ResolveStorage(descriptor.clone()));
                }
            }
        }
        self.discovery_active = true;
        effects.push(Effect::StartDiscovery {
            delay: Duration::ZERO,
        });
        effects.push(Effect::EmitProgress);
    }

    fn on_event(&mut self, session_event: SessionEvent, effects: &mut Vec<Effect>) {
        match session_event {
            SessionEvent::PeersDiscovered(addresses) => {
                if self.role == SessionRole::Seed {
                    return;
                }
                for address in addresses {
                    let key = address.to_string();
                    if self.peers.contains_key(&key)
                        || self.connecting.contains(&key)
                        || self.candidates.contains(&address)
                    {
                        continue;
                    }
                    self.failed_candidates.remove(&address);
                    self.candidates.push_back(address);
                }
                self.connect_candidates(effects);
            }

            SessionEvent::DiscoveryFinished { error } => {
                self.discovery_active = false;
                if let Some(error) = error {
                    self.last_failure = Some(error);
                }
            }

            SessionEvent::ConnectFailed { peer, reason } => {
                event!(Level::DEBUG, %peer, %reason, "Connection attempt failed");
                self.connecting.remove(&peer);
                if let Ok(address) = peer.parse::<SocketAddr>() {
                    self.failed_candidates.insert(address);
                }
                self.last_failure = Some(reason);
                self.connect_candidates(effects);
            }

            SessionEvent::PeerConnected {
                peer,
                peer_id,
                supports_metadata,
                peer_tx,
            } => {
                self.connecting.remove(&peer);
                if self.peers.contains_key(&peer)
                    || self.peers.len() >= self.limits.max_connected_peers
                {
                    effects.push(Effect::DisconnectPeer { peer, peer_tx });
                    return;
                }
                event!(Level::DEBUG, %peer, "Peer connected");

                let handle = PeerHandle::new(peer.clone(), peer_id, peer_tx, supports_metadata);
                self.peers.insert(peer.clone(), handle);

                if self.descriptor.is_some() {
                    if self.owned_pieces() > 0 {
                        effects.push(Effect::SendToPeer {
                            peer,
                            cmd: PeerCommand::Bitfield(encode_bitfield(
                                &self.piece_manager.owned_mask(),
                            )),
                        });
                    }
                } else {
                    self.request_metadata(effects);
                }
                self.maybe_begin_exchange(effects);
            }

            SessionEvent::Disconnect(peer) => {
                self.connecting.remove(&peer);
                if self.remove_peer(&peer).is_some() {
                    event!(Level::DEBUG, %peer, "Peer disconnected");
                    self.connect_candidates(effects);
                }
            }

            SessionEvent::PeerBitfield(peer, bytes) => {
                let piece_count = self.total_pieces();
                let known = self.descriptor.is_some();
                if let Some(handle) = self.peers.get_mut(&peer) {
                    if known {
                        handle.bitfield = decode_bitfield(&bytes, piece_count);
                    } else {
                        handle.raw_bitfield = Some(bytes);
                    }
                }
                self.refresh_rarity();
            }

            SessionEvent::PeerHave(peer, piece_index) => {
                let piece_count = self.total_pieces();
                let known = self.descriptor.is_some();
                let Some(handle) = self.peers.get_mut(&peer) else {
                    return;
                };
                if !known {
                    if handle.early_haves.len() < MAX_EARLY_HAVES {
                        handle.early_haves.insert(piece_index);
                    }
                    return;
                }
                if piece_index as usize >= piece_count {
                    return;
                }
                if handle.bitfield.len() < piece_count {
                    handle.bitfield.resize(piece_count, false);
                }
                handle.bitfield[piece_index as usize] = true;
                self.refresh_rarity();
            }

            SessionEvent::BlockRequested(peer, block) => self.on_block_requested(peer, block, effects),

            SessionEvent::RequestCancelled(peer, block) => {
                event!(Level::TRACE, %peer, ?block, "Peer cancelled a request");
            }

            SessionEvent::BlockRead { peer, block, data } => {
                let piece_end = self
                    .descriptor
                    .as_ref()
                    .map(|d| d.piece_size(block.piece_index))
                    .unwrap_or(0);
                let verifying = self.transfer_state == TransferState::Verifying;
                let Some(handle) = self.peers.get_mut(&peer) else {
                    return;
                };
                handle.uploads_in_flight = handle.uploads_in_flight.saturating_sub(1);
                match data {
                    Some(data) => {
                        handle.bytes_uploaded += data.len() as u64;
                        self.bytes_uploaded += data.len() as u64;
                        effects.push(Effect::SendToPeer {
                            peer,
                            cmd: PeerCommand::Upload(block, data),
                        });
                        if !verifying && block.offset + block.length >= piece_end {
                            effects.push(Effect::EmitProgress);
                        }
                    }
                    None => effects.push(Effect::SendToPeer {
                        peer,
                        cmd: PeerCommand::RejectRequest(block),
                    }),
                }
            }

            SessionEvent::PieceReceived {
                peer,
                piece_index,
                data,
            } => {
                self.bytes_downloaded += data.len() as u64;
                if let Some(handle) = self.peers.get_mut(&peer) {
                    handle.pending_requests.remove(&piece_index);
                    handle.bytes_downloaded += data.len() as u64;
                }
                let expected = self.descriptor.as_ref().map(|d| d.piece_size(piece_index));
                if self.piece_manager.is_owned(piece_index) || expected != Some(data.len() as u32) {
                    self.piece_manager.release_pending(piece_index, &peer);
                    return;
                }
                effects.push(Effect::VerifyPiece {
                    peer,
                    piece_index,
                    data,
                });
            }

            SessionEvent::PieceRejected(peer, piece_index) => {
                if let Some(handle) = self.peers.get_mut(&peer) {
                    handle.pending_requests.remove(&piece_index);
                    // The peer claims not to serve it after all.
                    if let Some(has) = handle.bitfield.get_mut(piece_index as usize) {
                        *has = false;
                    }
                }
                self.piece_manager.release_pending(piece_index, &peer);
                self.refresh_rarity();
            }

            SessionEvent::PieceVerified {
                peer,
                piece_index,
                verification_result,
            } => match verification_result {
                Ok(data) => {
                    self.verification_failures.remove(&(piece_index, peer.clone()));
                    effects.push(Effect::WritePiece {
                        peer,
                        piece_index,
                        data,
                    });
                }
                Err(()) => self.on_verification_failure(peer, piece_index, effects),
            },

            SessionEvent::PieceWritten { peer, piece_index } => {
                self.on_piece_written(peer, piece_index, effects);
            }

            SessionEvent::PieceWriteFailed { piece_index, reason } => {
                event!(Level::ERROR, piece_index, %reason, "Failed to store piece");
                self.piece_manager.requeue_pending_to_need(piece_index);
                self.fail(format!("Storage error: {}", reason), effects);
            }

            SessionEvent::StorageReady => {
                self.storage_ready = true;
            }

            SessionEvent::StorageFailed(reason) => {
                self.fail(format!("Storage error: {}", reason), effects);
            }

            SessionEvent::MetadataRequested(peer) => {
                if let Some(descriptor) = &self.descriptor {
                    effects.push(Effect::SendToPeer {
                        peer,
                        cmd: PeerCommand::SendMetadata(descriptor.info_bytes().to_vec()),
                    });
                }
            }

            SessionEvent::MetadataReceived(peer, info_bytes) => {
                self.on_metadata_received(peer, info_bytes, effects);
            }

            SessionEvent::ContentVerified { bad_pieces } => {
                if self.transfer_state != TransferState::Verifying {
                    return;
                }
                if bad_pieces.is_empty() {
                    self.complete(effects);
                } else {
                    event!(Level::WARN, ?bad_pieces, "Whole-content check found bad pieces");
                    for piece_index in bad_pieces {
                        self.piece_manager.requeue_pending_to_need(piece_index);
                    }
                    self.last_failure = Some("Whole-content verification failed".to_string());
                    self.refresh_rarity();
                    self.transfer_state = TransferState::Exchanging;
                    effects.push(Effect::EmitProgress);
                }
            }
        }
    }

    fn on_block_requested(&mut self, peer: String, block: BlockInfo, effects: &mut Vec<Effect>) {
        let servable = self.storage_ready
            && self.piece_manager.is_owned(block.piece_index)
            && self.descriptor.as_ref().is_some_and(|d| {
                block.offset as u64 + block.length as u64 <= d.piece_size(block.piece_index) as u64
            });

        let Some(handle) = self.peers.get_mut(&peer) else {
            return;
        };
        if servable && handle.uploads_in_flight < PEER_UPLOAD_IN_FLIGHT_LIMIT {
            handle.uploads_in_flight += 1;
            effects.push(Effect::ReadBlock { peer, block });
        } else {
            effects.push(Effect::SendToPeer {
                peer,
                cmd: PeerCommand::RejectRequest(block),
            });
        }
    }

    fn on_verification_failure(&mut self, peer: String, piece_index: u32, effects: &mut Vec<Effect>) {
        let failures = self
            .verification_failures
            .entry((piece_index, peer.clone()))
            .or_insert(0);
        *failures += 1;
        let failures = *failures;

        event!(Level::WARN, %peer, piece_index, failures, "Piece failed verification");
        self.last_failure = Some(EngineError::PieceVerification { piece_index }.to_string());
        if let Some(handle) = self.peers.get_mut(&peer) {
            handle.pending_requests.remove(&piece_index);
        }
        self.piece_manager.release_pending(piece_index, &peer);
        // A piece that was pending elsewhere too must still be fetched again.
        if !self.piece_manager.is_owned(piece_index)
            && !self.piece_manager.pending_queue.contains_key(&piece_index)
            && !self.piece_manager.need_queue.contains(&piece_index)
        {
            self.piece_manager.requeue_pending_to_need(piece_index);
        }

        if failures >= self.limits.max_verification_failures {
            let cause = EngineError::UnreliablePeerDropped { peer: peer.clone() }.to_string();
            event!(Level::WARN, %peer, "{}", cause);
            self.last_failure = Some(cause);
            if let Some(handle) = self.remove_peer(&peer) {
                effects.push(Effect::DisconnectPeer {
                    peer,
                    peer_tx: handle.peer_tx,
                });
            }
            self.connect_candidates(effects);
        }
    }

    fn on_piece_written(&mut self, peer: String, piece_index: u32, effects: &mut Vec<Effect>) {
        let still_pending = self.piece_manager.mark_as_complete(piece_index);
        for other in still_pending.into_iter().filter(|p| *p != peer) {
            if self.peers.contains_key(&other) {
                effects.push(Effect::SendToPeer {
                    peer: other,
                    cmd: PeerCommand::CancelPiece(piece_index),
                });
            }
        }
        for handle in self.peers.values_mut() {
            handle.pending_requests.remove(&piece_index);
        }
        for address in self.peers.keys() {
            effects.push(Effect::SendToPeer {
                peer: address.clone(),
                cmd: PeerCommand::Have(piece_index),
            });
        }
        self.discovery_rounds = 0;
        self.refresh_rarity();
        event!(
            Level::DEBUG,
            piece_index,
            owned = self.owned_pieces(),
            total = self.total_pieces(),
            "Piece stored"
        );

        if !self.piece_manager.is_complete() || self.transfer_state != TransferState::Exchanging {
            effects.push(Effect::EmitProgress);
            return;
        }
        if self.limits.verify_on_completion {
            self.transfer_state = TransferState::Verifying;
            effects.push(Effect::VerifyContent);
        } else {
            self.complete(effects);
        }
    }

    fn on_metadata_received(&mut self, peer: String, info_bytes: Vec<u8>, effects: &mut Vec<Effect>) {
        if self.descriptor.is_some() {
            return;
        }
        if self.metadata_requested_from.as_deref() == Some(peer.as_str()) {
            self.metadata_requested_from = None;
        }

        let descriptor = match ContentDescriptor::from_info_bytes(&info_bytes) {
            Ok(d) if d.content_id == self.content_id => Arc::new(d),
            Ok(_) | Err(_) => {
                event!(Level::WARN, %peer, "Peer sent metadata for different content");
                self.last_failure = Some(EngineError::HandshakeMismatch.to_string());
                if let Some(handle) = self.remove_peer(&peer) {
                    effects.push(Effect::DisconnectPeer {
                        peer,
                        peer_tx: handle.peer_tx,
                    });
                }
                self.request_metadata(effects);
                return;
            }
        };

        event!(
            Level::INFO,
            content_id = %self.content_id,
            pieces = descriptor.piece_count(),
            "Received content metadata"
        );
        let piece_count = descriptor.piece_count();
        self.piece_manager.set_initial_fields(piece_count, false);
        for handle in self.peers.values_mut() {
            let mut bitfield = handle
                .raw_bitfield
                .take()
                .map(|raw| decode_bitfield(&raw, piece_count))
                .unwrap_or_else(|| vec![false; piece_count]);
            for index in handle.early_haves.drain() {
                if let Some(has) = bitfield.get_mut(index as usize) {
                    *has = true;
                }
            }
            handle.bitfield = bitfield;
        }
        self.descriptor = Some(descriptor.clone());
        self.refresh_rarity();
        effects.push(Effect::ResolveStorage(descriptor));
        self.maybe_begin_exchange(effects);
        effects.push(Effect::EmitProgress);
    }

    fn request_metadata(&mut self, effects: &mut Vec<Effect>) {
        if self.descriptor.is_some() || self.metadata_requested_from.is_some() {
            return;
        }
        let mut capable: Vec<&String> = self
            .peers
            .values()
            .filter(|p| p.supports_metadata)
            .map(|p| &p.address)
            .collect();
        capable.sort();
        if let Some(peer) = capable.first() {
            let peer = (*peer).clone();
            self.metadata_requested_from = Some(peer.clone());
            effects.push(Effect::SendToPeer {
                peer,
                cmd: PeerCommand::RequestMetadata,
            });
        }
    }

    fn maybe_begin_exchange(&mut self, effects: &mut Vec<Effect>) {
        if self.transfer_state == TransferState::Discovering
            && self.descriptor.is_some()
            && !self.peers.is_empty()
        {
            self.transfer_state = TransferState::Exchanging;
            effects.push(Effect::EmitProgress);
        }
    }

    fn connect_candidates(&mut self, effects: &mut Vec<Effect>) {
        if self.role == SessionRole::Seed || self.transfer_state.is_terminal() {
            return;
        }
        while self.peers.len() + self.connecting.len() < self.limits.max_connected_peers {
            let Some(address) = self.candidates.pop_front() else {
                break;
            };
            let key = address.to_string();
            if self.peers.contains_key(&key) || !self.connecting.insert(key) {
                continue;
            }
            effects.push(Effect::ConnectToPeer(address));
        }
    }

    /// Issues piece requests to every peer with spare capacity.
    fn assign_requests(&mut self, effects: &mut Vec<Effect>) {
        if self.transfer_state != TransferState::Exchanging
            || self.role == SessionRole::Seed
            || !self.storage_ready
        {
            return;
        }
        let Some(descriptor) = self.descriptor.clone() else {
            return;
        };

        let mut addresses: Vec<String> = self.peers.keys().cloned().collect();
        addresses.sort();

        for address in addresses {
            loop {
                if self.piece_manager.pending_queue.len() >= self.limits.max_requests_per_session {
                    return;
                }
                let Some(handle) = self.peers.get(&address) else {
                    break;
                };
                if handle.pending_requests.len() >= self.limits.max_requests_per_peer {
                    break;
                }
                let excluded = self.excluded_pieces_for(&address);
                let Some(piece_index) = self.piece_manager.choose_piece_for_peer(
                    &handle.bitfield,
                    &handle.pending_requests,
                    &excluded,
                ) else {
                    break;
                };

                self.piece_manager.mark_as_pending(piece_index, address.clone());
                if let Some(handle) = self.peers.get_mut(&address) {
                    handle.pending_requests.insert(piece_index);
                }
                effects.push(Effect::SendToPeer {
                    peer: address.clone(),
                    cmd: PeerCommand::RequestPiece {
                        piece_index,
                        piece_size: descriptor.piece_size(piece_index),
                    },
                });
            }
        }
    }

    /// Pieces this peer has failed to deliver while another connected peer
    /// with a clean record for them also has them.
    fn excluded_pieces_for(&self, address: &str) -> HashSet<u32> {
        self.verification_failures
            .iter()
            .filter(|((_, peer), count)| peer == address && **count > 0)
            .map(|((piece_index, _), _)| *piece_index)
            .filter(|piece_index| {
                self.peers.values().any(|other| {
                    other.address != address
                        && other.has_piece(*piece_index)
                        && !self
                            .verification_failures
                            .contains_key(&(*piece_index, other.address.clone()))
                })
            })
            .collect()
    }

    fn check_starvation(&mut self, effects: &mut Vec<Effect>) {
        if self.role == SessionRole::Seed
            || self.transfer_state.is_terminal()
            || self.transfer_state == TransferState::Verifying
            || self.discovery_active
            || !self.connecting.is_empty()
            || !self.candidates.is_empty()
        {
            return;
        }

        let starving = if self.peers.is_empty() {
            true
        } else if self.descriptor.is_none() {
            self.metadata_requested_from.is_none()
                && !self.peers.values().any(|p| p.supports_metadata)
        } else {
            self.storage_ready
                && self.piece_manager.pending_queue.is_empty()
                && !self
                    .piece_manager
                    .is_obtainable(self.peers.values().map(|p| &p.bitfield))
        };
        if !starving {
            return;
        }

        if self.discovery_rounds < self.limits.max_discovery_rounds {
            self.discovery_rounds += 1;
            self.discovery_active = true;
            event!(
                Level::INFO,
                round = self.discovery_rounds,
                "No usable peers; restarting discovery"
            );
            effects.push(Effect::StartDiscovery {
                delay: self.limits.rediscovery_delay,
            });
        } else {
            let cause = self
                .last_failure
                .clone()
                .unwrap_or_else(|| EngineError::NoPeersFound.to_string());
            self.fail(cause, effects);
        }
    }

    fn complete(&mut self, effects: &mut Vec<Effect>) {
        event!(Level::INFO, content_id = %self.content_id, "Transfer completed");
        self.transfer_state = TransferState::Completed;
        effects.push(Effect::EmitProgress);
        effects.push(Effect::Completed);
    }

    fn fail(&mut self, cause: String, effects: &mut Vec<Effect>) {
        if self.transfer_state.is_terminal() {
            return;
        }
        event!(Level::ERROR, content_id = %self.content_id, %cause, "Session failed");
        self.transfer_state = TransferState::Failed;
        effects.push(Effect::EmitProgress);
        effects.push(Effect::Failed { cause });
    }

    fn remove_peer(&mut self, address: &str) -> Option<PeerHandle> {
        let handle = self.peers.remove(address)?;
        for piece_index in &handle.pending_requests {
            self.piece_manager.release_pending(*piece_index, address);
        }
        if self.metadata_requested_from.as_deref() == Some(address) {
            self.metadata_requested_from = None;
        }
        self.refresh_rarity();
        Some(handle)
    }

    fn refresh_rarity(&mut self) {
        self.piece_manager
            .update_rarity(self.peers.values().map(|p| &p.bitfield));
    }
}
