// SPDX-FileCopyrightText: 2025 The seedlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use super::state::{Action, Effect, Limits, SessionState};
use super::{
    IncomingPeer, ProgressEvent, SessionHandle, SessionOutcome, SessionRole, TransferState,
};

use crate::accounting::{ProgressSample, TransferAccounting};
use crate::command::{PeerCommand, SessionEvent};
use crate::config::Settings;
use crate::content::merkle::merkle_root;
use crate::content::{hash_piece, ContentDescriptor, ContentId};
use crate::discovery::{AnnounceEvent, AnnounceRequest, PeerDiscovery};
use crate::errors::StorageError;
use crate::networking::session::AbortOnDrop;
use crate::networking::{
    connect_and_handshake, ConnectionType, Handshake, PeerSession, PeerSessionParameters,
};
use crate::storage::{FileLayout, PieceStore};
use crate::token_bucket::TokenBucket;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tokio_stream::StreamExt;
use tracing::{event, Level};

const MANAGER_EVENT_CAPACITY: usize = 1000;
const INCOMING_PEER_CAPACITY: usize = 64;
const PROGRESS_CHANNEL_CAPACITY: usize = 256;
const TICK_INTERVAL: Duration = Duration::from_secs(1);

const MAX_PIECE_WRITE_ATTEMPTS: u32 = 3;
const BASE_BACKOFF_MS: u64 = 50;
const JITTER_MS: u64 = 25;

pub(crate) struct SessionManagerParameters {
    pub role: SessionRole,
    pub content_id: ContentId,
    pub descriptor: Option<Arc<ContentDescriptor>>,
    /// Seeds bring their own store; downloads create one once the
    /// descriptor is known.
    pub store: Option<PieceStore>,
    /// Size advertised by the link, used for announces before the
    /// descriptor arrives.
    pub advertised_length: u64,
    pub endpoints: Vec<String>,
    pub settings: Arc<Settings>,
    pub listen_port: u16,
    pub download_bucket: Arc<TokenBucket>,
    pub upload_bucket: Arc<TokenBucket>,
}

/// Owns one session's state and runs its event loop.
pub struct SessionManager {
    state: SessionState,
    store: Option<PieceStore>,
    settings: Arc<Settings>,
    peer_id: [u8; 20],
    listen_port: u16,
    advertised_length: u64,

    discovery: PeerDiscovery,
    discovery_task: Option<AbortOnDrop>,
    announced_started: bool,

    manager_tx: mpsc::Sender<SessionEvent>,
    manager_rx: mpsc::Receiver<SessionEvent>,
    incoming_rx: mpsc::Receiver<IncomingPeer>,
    stop_rx: mpsc::Receiver<()>,
    shutdown_tx: broadcast::Sender<()>,

    connect_permits: Arc<Semaphore>,
    download_bucket: Arc<TokenBucket>,
    upload_bucket: Arc<TokenBucket>,

    accounting: TransferAccounting,
    progress_tx: broadcast::Sender<ProgressEvent>,
    snapshot_tx: watch::Sender<ProgressEvent>,
    outcome_tx: watch::Sender<Option<SessionOutcome>>,
    emit_pending: bool,
}

impl SessionManager {
    /// Spawns the manager task. Returns the caller's handle and the channel
    /// the listener uses to hand over accepted connections.
    pub(crate) fn spawn(params: SessionManagerParameters) -> (SessionHandle, mpsc::Sender<IncomingPeer>) {
        let (manager_tx, manager_rx) = mpsc::channel(MANAGER_EVENT_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_PEER_CAPACITY);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (shutdown_tx, _) = broadcast::channel(1);
        let (progress_tx, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(ProgressEvent::initial(params.content_id));
        let (outcome_tx, outcome_rx) = watch::channel(None);

        let limits = Limits::from(params.settings.as_ref());
        let state = match (params.role, params.descriptor) {
            (SessionRole::Seed, Some(descriptor)) => SessionState::new_seed(descriptor, limits),
            (_, descriptor) => SessionState::new_download(params.content_id, descriptor, limits),
        };

        let handle = SessionHandle::new(
            params.content_id,
            params.role,
            stop_tx,
            progress_tx.clone(),
            snapshot_rx,
            outcome_rx,
        );

        let manager = SessionManager {
            state,
            store: params.store,
            peer_id: params.settings.peer_id(),
            listen_port: params.listen_port,
            advertised_length: params.advertised_length,
            discovery: PeerDiscovery::new(params.endpoints, params.settings.discovery_timeout()),
            discovery_task: None,
            announced_started: false,
            manager_tx,
            manager_rx,
            incoming_rx,
            stop_rx,
            shutdown_tx,
            connect_permits: Arc::new(Semaphore::new(
                params.settings.connection_attempt_permits.max(1),
            )),
            download_bucket: params.download_bucket,
            upload_bucket: params.upload_bucket,
            accounting: TransferAccounting::new(Instant::now()),
            progress_tx,
            snapshot_tx,
            outcome_tx,
            emit_pending: false,
            settings: params.settings,
        };
        tokio::spawn(manager.run());

        (handle, incoming_tx)
    }

    pub async fn run(mut self) {
        event!(
            Level::INFO,
            content_id = %self.state.content_id,
            role = ?self.state.role,
            "Session started"
        );
        self.apply_action(Action::Start);

        let mut tick = tokio::time::interval(TICK_INTERVAL);
        let announce_interval = self.settings.announce_interval();
        let mut announce_timer = tokio::time::interval_at(
            tokio::time::Instant::now() + announce_interval,
            announce_interval,
        );

        loop {
            tokio::select! {
                _ = self.stop_rx.recv() => {
                    event!(Level::INFO, content_id = %self.state.content_id, "Session stop requested");
                    break;
                }
                Some(session_event) = self.manager_rx.recv() => {
                    self.apply_action(Action::PeerEvent(session_event));
                }
                Some(incoming) = self.incoming_rx.recv() => {
                    self.accept_incoming(incoming);
                }
                _ = tick.tick() => {
                    self.on_tick();
                }
                _ = announce_timer.tick() => {
                    self.apply_action(Action::AnnounceDue);
                }
            }

            if self.state.transfer_state == TransferState::Failed {
                break;
            }
        }

        self.shutdown();
    }

    fn apply_action(&mut self, action: Action) {
        let mut queue = VecDeque::from([action]);
        while let Some(action) = queue.pop_front() {
            let effects = self.state.update(action);
            for effect in effects {
                self.handle_effect(effect, &mut queue);
            }
        }
        if std::mem::take(&mut self.emit_pending) {
            self.emit_progress();
        }
    }

    fn handle_effect(&mut self, effect: Effect, queue: &mut VecDeque<Action>) {
        match effect {
            Effect::StartDiscovery { delay } => self.start_discovery(delay),

            Effect::ConnectToPeer(address) => self.connect_to_peer(address),

            Effect::SendToPeer { peer, cmd } => {
                let Some(handle) = self.state.peers.get(&peer) else {
                    return;
                };
                match handle.peer_tx.try_send(cmd) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        event!(Level::WARN, %peer, "Peer command queue full. Disconnecting.");
                        queue.push_back(Action::PeerEvent(SessionEvent::Disconnect(peer)));
                    }
                    // The session is gone; its disconnect event is on the way.
                    Err(TrySendError::Closed(_)) => {}
                }
            }

            Effect::DisconnectPeer { peer, peer_tx } => {
                event!(Level::DEBUG, %peer, "Disconnecting peer");
                let _ = peer_tx.try_send(PeerCommand::Disconnect);
            }

            Effect::VerifyPiece {
                peer,
                piece_index,
                data,
            } => {
                let expected = self
                    .state
                    .descriptor
                    .as_ref()
                    .and_then(|d| d.piece_hash(piece_index).copied());
                let tx = self.manager_tx.clone();
                let mut shutdown_rx = self.shutdown_tx.subscribe();

                tokio::spawn(async move {
                    let verification_task = tokio::task::spawn_blocking(move || {
                        let valid = expected.is_some_and(|hash| hash_piece(&data) == hash);
                        if valid {
                            Ok(data)
                        } else {
                            Err(())
                        }
                    });
                    let verification_result = tokio::select! {
                        biased;
                        _ = shutdown_rx.recv() => return,
                        res = verification_task => res.unwrap_or(Err(())),
                    };
                    let _ = tx
                        .send(SessionEvent::PieceVerified {
                            peer,
                            piece_index,
                            verification_result,
                        })
                        .await;
                });
            }

            Effect::WritePiece {
                peer,
                piece_index,
                data,
            } => {
                let (Some(store), Some(descriptor)) = (self.store.clone(), self.state.descriptor.clone()) else {
                    queue.push_back(Action::PeerEvent(SessionEvent::PieceWriteFailed {
                        piece_index,
                        reason: "no storage attached".to_string(),
                    }));
                    return;
                };
                let offset = descriptor.piece_offset(piece_index);
                let tx = self.manager_tx.clone();
                let mut shutdown_rx = self.shutdown_tx.subscribe();

                tokio::spawn(async move {
                    let result =
                        Self::write_piece_with_retry(&store, piece_index, offset, &data, &mut shutdown_rx)
                            .await;
                    let session_event = match result {
                        Ok(()) => SessionEvent::PieceWritten { peer, piece_index },
                        Err(e) => SessionEvent::PieceWriteFailed {
                            piece_index,
                            reason: e.to_string(),
                        },
                    };
                    let _ = tx.send(session_event).await;
                });
            }

            Effect::ReadBlock { peer, block } => {
                let (Some(store), Some(descriptor)) = (self.store.clone(), self.state.descriptor.clone()) else {
                    queue.push_back(Action::PeerEvent(SessionEvent::BlockRead {
                        peer,
                        block,
                        data: None,
                    }));
                    return;
                };
                let offset = descriptor.piece_offset(block.piece_index) + block.offset as u64;
                let tx = self.manager_tx.clone();
                let mut shutdown_rx = self.shutdown_tx.subscribe();

                tokio::spawn(async move {
                    let data = tokio::select! {
                        biased;
                        _ = shutdown_rx.recv() => return,
                        res = store.read(offset, block.length as usize) => match res {
                            Ok(data) => Some(data),
                            Err(e) => {
                                event!(Level::WARN, ?block, error = %e, "Failed to read block for upload");
                                None
                            }
                        },
                    };
                    let _ = tx.send(SessionEvent::BlockRead { peer, block, data }).await;
                });
            }

            Effect::ResolveStorage(descriptor) => {
                if self.store.is_some() {
                    queue.push_back(Action::PeerEvent(SessionEvent::StorageReady));
                    return;
                }
                let store = match &self.settings.download_folder {
                    Some(root) => PieceStore::files(FileLayout::for_download(root, &descriptor)),
                    None => PieceStore::memory(descriptor.total_length),
                };
                self.store = Some(store.clone());
                let tx = self.manager_tx.clone();

                tokio::spawn(async move {
                    let session_event = match store.prepare().await {
                        Ok(()) => SessionEvent::StorageReady,
                        Err(e) => SessionEvent::StorageFailed(e.to_string()),
                    };
                    let _ = tx.send(session_event).await;
                });
            }

            Effect::VerifyContent => {
                let (Some(store), Some(descriptor)) = (self.store.clone(), self.state.descriptor.clone()) else {
                    return;
                };
                let tx = self.manager_tx.clone();
                let mut shutdown_rx = self.shutdown_tx.subscribe();

                tokio::spawn(async move {
                    let bad_pieces = tokio::select! {
                        biased;
                        _ = shutdown_rx.recv() => return,
                        bad = Self::verify_content(store, descriptor) => bad,
                    };
                    let _ = tx.send(SessionEvent::ContentVerified { bad_pieces }).await;
                });
            }

            Effect::EmitProgress => self.emit_pending = true,

            Effect::Completed => self.on_completed(),

            Effect::Failed { cause } => {
                self.flush_progress();
                self.outcome_tx
                    .send_replace(Some(SessionOutcome::Failed { cause }));
            }
        }
    }

    fn announce_request(&mut self, announce_event: Option<AnnounceEvent>) -> AnnounceRequest {
        AnnounceRequest {
            content_id: self.state.content_id,
            peer_id: self.peer_id,
            port: self.listen_port,
            uploaded: self.state.bytes_uploaded,
            downloaded: self.state.bytes_downloaded,
            left: self.state.bytes_left(self.advertised_length),
            event: announce_event,
        }
    }

    fn start_discovery(&mut self, delay: Duration) {
        let announce_event = if self.announced_started {
            None
        } else {
            self.announced_started = true;
            Some(AnnounceEvent::Started)
        };
        let request = self.announce_request(announce_event);
        let discovery = self.discovery.clone();
        let tx = self.manager_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let task = tokio::spawn(async move {
            if !delay.is_zero() && Self::sleep_with_shutdown(delay, &mut shutdown_rx).await.is_err() {
                return;
            }
            let mut peers = discovery.discover(request);
            let mut error = None;
            while let Some(result) = peers.next().await {
                match result {
                    Ok(peer) => {
                        if tx
                            .send(SessionEvent::PeersDiscovered(vec![peer]))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => error = Some(e.to_string()),
                }
            }
            let _ = tx.send(SessionEvent::DiscoveryFinished { error }).await;
        });
        // Replacing the handle aborts a previous round still in flight.
        self.discovery_task = Some(AbortOnDrop(task));
    }

    fn local_handshake(&self) -> Handshake {
        Handshake::new(
            self.state.content_id,
            self.peer_id,
            self.state.descriptor.is_some(),
        )
    }

    fn connect_to_peer(&mut self, address: SocketAddr) {
        let local_handshake = self.local_handshake();
        let permits = self.connect_permits.clone();
        let connect_timeout = self.settings.connect_timeout();
        let manager_tx = self.manager_tx.clone();
        let download_bucket = self.download_bucket.clone();
        let upload_bucket = self.upload_bucket.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let peer_ip_port = address.to_string();
            let connected = {
                let _permit = tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => return,
                    permit = permits.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                };
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => return,
                    res = connect_and_handshake(address, &local_handshake, connect_timeout) => res,
                }
            };

            let (stream, remote_handshake) = match connected {
                Ok(connected) => connected,
                Err(e) => {
                    let _ = manager_tx
                        .send(SessionEvent::ConnectFailed {
                            peer: peer_ip_port,
                            reason: e.to_string(),
                        })
                        .await;
                    return;
                }
            };

            let session = PeerSession::new(PeerSessionParameters {
                local_handshake,
                remote_handshake,
                connection_type: ConnectionType::Outgoing,
                peer_ip_port: peer_ip_port.clone(),
                manager_tx,
                download_bucket,
                upload_bucket,
                shutdown_tx,
            });
            if let Err(e) = session.run(stream).await {
                event!(Level::DEBUG, peer = %peer_ip_port, error = %e, "Peer session ended in error");
            }
        });
    }

    fn accept_incoming(&mut self, incoming: IncomingPeer) {
        if self.state.transfer_state == TransferState::Failed {
            return;
        }
        if self.state.peers.len() >= self.state.limits.max_connected_peers {
            event!(Level::DEBUG, peer = %incoming.addr, "Peer limit reached. Dropping incoming connection.");
            return;
        }

        let session = PeerSession::new(PeerSessionParameters {
            local_handshake: self.local_handshake(),
            remote_handshake: incoming.handshake,
            connection_type: ConnectionType::Incoming,
            peer_ip_port: incoming.addr.to_string(),
            manager_tx: self.manager_tx.clone(),
            download_bucket: self.download_bucket.clone(),
            upload_bucket: self.upload_bucket.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
        });
        let peer_ip_port = incoming.addr.to_string();
        let stream = incoming.stream;
        tokio::spawn(async move {
            if let Err(e) = session.run(stream).await {
                event!(Level::DEBUG, peer = %peer_ip_port, error = %e, "Incoming peer session ended in error");
            }
        });
    }

    fn sample(&mut self) {
        self.accounting.record(ProgressSample {
            bytes_transferred: self.state.bytes_downloaded + self.state.bytes_uploaded,
            at: Instant::now(),
        });
    }

    fn progress_event(&self) -> ProgressEvent {
        let now = Instant::now();
        ProgressEvent {
            content_id: self.state.content_id,
            state: self.state.transfer_state,
            owned_pieces: self.state.owned_pieces(),
            total_pieces: self.state.total_pieces(),
            bytes_transferred: self.state.bytes_downloaded + self.state.bytes_uploaded,
            bytes_downloaded: self.state.bytes_downloaded,
            bytes_uploaded: self.state.bytes_uploaded,
            throughput_bps: self.accounting.throughput_bps(),
            connected_peers: self.state.peers.len(),
            elapsed: self.accounting.elapsed(now),
            since_first_byte: self.accounting.elapsed_since_first_byte(now),
        }
    }

    fn emit_progress(&mut self) {
        self.sample();
        let progress = self.progress_event();
        self.snapshot_tx.send_replace(progress.clone());
        // No subscribers is fine.
        let _ = self.progress_tx.send(progress);
    }

    /// Publishes the current state now. Waiters woken by the outcome then
    /// never observe an older snapshot.
    fn flush_progress(&mut self) {
        self.emit_pending = false;
        self.emit_progress();
    }

    fn on_tick(&mut self) {
        self.sample();
        // The final owned count is only published together with the
        // Completed state.
        if self.state.transfer_state != TransferState::Verifying {
            self.snapshot_tx.send_replace(self.progress_event());
        }
    }

    fn on_completed(&mut self) {
        let now = Instant::now();
        self.sample();
        self.accounting.mark_completed(now);

        let files = match (&self.store, &self.state.descriptor) {
            (Some(store), Some(descriptor)) => store.completed_files(descriptor),
            _ => Vec::new(),
        };
        let summary = self.accounting.summary();
        self.flush_progress();
        if let Some(summary) = &summary {
            event!(
                Level::INFO,
                content_id = %self.state.content_id,
                total_ms = summary.total.as_millis() as u64,
                transfer_ms = summary.transfer.as_millis() as u64,
                idle_ms = summary.idle.as_millis() as u64,
                "Download finished"
            );
        }
        self.outcome_tx
            .send_replace(Some(SessionOutcome::Completed { files, summary }));

        let request = self.announce_request(Some(AnnounceEvent::Completed));
        let discovery = self.discovery.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.recv() => {}
                _ = discovery.announce_all(request) => {}
            }
        });
    }

    fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(());
        self.discovery_task = None;
        if self.outcome_tx.borrow().is_none() {
            self.outcome_tx.send_replace(Some(SessionOutcome::Stopped));
        }
        event!(
            Level::INFO,
            content_id = %self.state.content_id,
            state = %self.state.transfer_state,
            "Session ended"
        );

        let request = self.announce_request(Some(AnnounceEvent::Stopped));
        let discovery = self.discovery.clone();
        tokio::spawn(async move {
            let _ = discovery.announce_all(request).await;
        });
    }

    async fn sleep_with_shutdown(
        duration: Duration,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<(), ()> {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => Err(()),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    async fn write_piece_with_retry(
        store: &PieceStore,
        piece_index: u32,
        offset: u64,
        data: &[u8],
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<(), StorageError> {
        let mut attempt = 0;
        loop {
            let res = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => return Err(StorageError::Io(std::io::Error::other("Shutdown"))),
                r = store.write(offset, data) => r,
            };
            let error = match res {
                Ok(()) => return Ok(()),
                Err(e @ StorageError::OutOfBounds { .. }) => return Err(e),
                Err(e) => e,
            };

            attempt += 1;
            if attempt >= MAX_PIECE_WRITE_ATTEMPTS {
                return Err(error);
            }
            let backoff = BASE_BACKOFF_MS.saturating_mul(2u64.pow(attempt));
            let jitter = rand::rng().random_range(0..=JITTER_MS);
            let duration = Duration::from_millis(backoff + jitter);
            event!(
                Level::WARN,
                piece = piece_index,
                attempt,
                duration_ms = duration.as_millis() as u64,
                error = %error,
                "Retrying piece write..."
            );
            if Self::sleep_with_shutdown(duration, shutdown_rx).await.is_err() {
                return Err(StorageError::Io(std::io::Error::other("Shutdown")));
            }
        }
    }

    /// Re-reads every piece from the store. Returns the pieces whose bytes no
    /// longer match, or every piece when the hash tree disagrees.
    async fn verify_content(store: PieceStore, descriptor: Arc<ContentDescriptor>) -> Vec<u32> {
        let mut bad_pieces = Vec::new();
        let mut actual_hashes = Vec::with_capacity(descriptor.piece_count());

        for piece_index in 0..descriptor.piece_count() as u32 {
            let offset = descriptor.piece_offset(piece_index);
            let size = descriptor.piece_size(piece_index) as usize;
            let hash = match store.read(offset, size).await {
                Ok(data) => tokio::task::spawn_blocking(move || hash_piece(&data))
                    .await
                    .ok(),
                Err(e) => {
                    event!(Level::WARN, piece_index, error = %e, "Failed to re-read piece");
                    None
                }
            };
            match hash {
                Some(hash) if descriptor.piece_hash(piece_index) == Some(&hash) => {
                    actual_hashes.push(hash);
                }
                other => {
                    actual_hashes.push(other.unwrap_or_default());
                    bad_pieces.push(piece_index);
                }
            }
        }

        if bad_pieces.is_empty() && merkle_root(&actual_hashes) != descriptor.merkle_root {
            event!(Level::ERROR, "Hash tree mismatch after download");
            return (0..descriptor.piece_count() as u32).collect();
        }
        bad_pieces
    }
}
