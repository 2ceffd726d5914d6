// SPDX-FileCopyrightText: 2025 The seedlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::config::{generate_client_id_string, Settings};
use crate::content::addresser::{address_buffers, address_paths, file_name_of};
use crate::content::{ContentDescriptor, ContentId};
use crate::errors::EngineError;
use crate::link::ShareLink;
use crate::networking::protocol::read_handshake;
use crate::networking::session::AbortOnDrop;
use crate::session::manager::{SessionManager, SessionManagerParameters};
use crate::session::{IncomingPeer, SessionHandle, SessionRole};
use crate::storage::{FileLayout, PieceStore};
use crate::token_bucket::TokenBucket;

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{event, Level};

const INCOMING_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Something to seed.
#[derive(Debug, Clone)]
pub enum SeedSource {
    /// A file on disk, served in place.
    Path(PathBuf),
    Memory { name: String, data: Vec<u8> },
}

/// A running seed and the link that downloads it.
#[derive(Debug, Clone)]
pub struct Seeding {
    pub link: ShareLink,
    pub descriptor: Arc<ContentDescriptor>,
    pub session: SessionHandle,
}

struct SessionEntry {
    incoming_tx: mpsc::Sender<IncomingPeer>,
    handle: SessionHandle,
}

type SessionRegistry = Arc<Mutex<HashMap<ContentId, SessionEntry>>>;

fn lock(sessions: &SessionRegistry) -> MutexGuard<'_, HashMap<ContentId, SessionEntry>> {
    sessions.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One per process. Owns the peer listener, the shared bandwidth buckets and
/// every session started through it.
pub struct Engine {
    settings: Arc<Settings>,
    listen_addr: SocketAddr,
    sessions: SessionRegistry,
    download_bucket: Arc<TokenBucket>,
    upload_bucket: Arc<TokenBucket>,
    shutdown_tx: broadcast::Sender<()>,
    _listener_task: AbortOnDrop,
}

impl Engine {
    /// Binds the peer listener on `client_port` (`0` picks a free port).
    pub async fn new(mut settings: Settings) -> Result<Self, EngineError> {
        if settings.client_id.is_empty() {
            settings.client_id = generate_client_id_string();
        }
        let settings = Arc::new(settings);

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, settings.client_port)).await?;
        let listen_addr = listener.local_addr()?;
        event!(Level::INFO, %listen_addr, "Peer listener bound");

        let sessions: SessionRegistry = Arc::default();
        let (shutdown_tx, _) = broadcast::channel(1);
        let listener_task = tokio::spawn(accept_loop(
            listener,
            sessions.clone(),
            settings.peer_id(),
            shutdown_tx.subscribe(),
        ));

        Ok(Self {
            download_bucket: Arc::new(TokenBucket::new(settings.global_download_limit_bps)),
            upload_bucket: Arc::new(TokenBucket::new(settings.global_upload_limit_bps)),
            settings,
            listen_addr,
            sessions,
            shutdown_tx,
            _listener_task: AbortOnDrop(listener_task),
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Content-addresses `sources`, starts seeding them and returns the link
    /// other engines download them with.
    pub async fn start_seeding(&self, sources: Vec<SeedSource>) -> Result<Seeding, EngineError> {
        if sources.is_empty() {
            return Err(EngineError::EmptyInput);
        }

        let piece_length = self.settings.piece_length;
        let all_paths: Option<Vec<PathBuf>> = sources
            .iter()
            .map(|source| match source {
                SeedSource::Path(path) => Some(path.clone()),
                SeedSource::Memory { .. } => None,
            })
            .collect();

        let (descriptor, store) = match all_paths {
            Some(paths) => {
                let descriptor = address_paths(paths.clone(), piece_length, None).await?;
                let store = PieceStore::files(FileLayout::for_existing(&paths, &descriptor.files));
                (descriptor, store)
            }
            None => {
                let mut buffers = Vec::with_capacity(sources.len());
                for source in sources {
                    match source {
                        SeedSource::Memory { name, data } => buffers.push((name, data)),
                        SeedSource::Path(path) => {
                            let data = tokio::fs::read(&path).await?;
                            buffers.push((file_name_of(&path), data));
                        }
                    }
                }
                let descriptor = address_buffers(&buffers, piece_length, None)?;
                let content = buffers.into_iter().flat_map(|(_, data)| data).collect();
                (descriptor, PieceStore::from_bytes(content))
            }
        };
        if descriptor.total_length == 0 {
            return Err(EngineError::EmptyInput);
        }

        let link = ShareLink::publish(&descriptor, &self.settings.discovery_endpoints);
        let descriptor = Arc::new(descriptor);
        let session = self.spawn_session(SessionManagerParameters {
            role: SessionRole::Seed,
            content_id: descriptor.content_id,
            advertised_length: descriptor.total_length,
            descriptor: Some(descriptor.clone()),
            store: Some(store),
            endpoints: link.endpoints.clone(),
            settings: self.settings.clone(),
            listen_port: self.listen_addr.port(),
            download_bucket: self.download_bucket.clone(),
            upload_bucket: self.upload_bucket.clone(),
        })?;

        event!(Level::INFO, content_id = %link.content_id, link = %link, "Seeding started");
        Ok(Seeding {
            link,
            descriptor,
            session,
        })
    }

    /// Starts downloading the content a link points at. The descriptor is
    /// fetched from the first peer that can serve it.
    pub fn start_download(&self, link: &ShareLink) -> Result<SessionHandle, EngineError> {
        let endpoints = if link.endpoints.is_empty() {
            self.settings.discovery_endpoints.clone()
        } else {
            link.endpoints.clone()
        };
        self.spawn_session(SessionManagerParameters {
            role: SessionRole::Download,
            content_id: link.content_id,
            descriptor: None,
            store: None,
            advertised_length: link.total_length,
            endpoints,
            settings: self.settings.clone(),
            listen_port: self.listen_addr.port(),
            download_bucket: self.download_bucket.clone(),
            upload_bucket: self.upload_bucket.clone(),
        })
    }

    pub fn start_download_str(&self, link: &str) -> Result<SessionHandle, EngineError> {
        let link = ShareLink::resolve(link)?;
        self.start_download(&link)
    }

    /// Starts a download whose descriptor is already known, e.g. from a
    /// metainfo file. Skips the metadata exchange.
    pub fn start_download_descriptor(
        &self,
        descriptor: ContentDescriptor,
        endpoints: Vec<String>,
    ) -> Result<SessionHandle, EngineError> {
        let endpoints = if endpoints.is_empty() {
            self.settings.discovery_endpoints.clone()
        } else {
            endpoints
        };
        self.spawn_session(SessionManagerParameters {
            role: SessionRole::Download,
            content_id: descriptor.content_id,
            advertised_length: descriptor.total_length,
            descriptor: Some(Arc::new(descriptor)),
            store: None,
            endpoints,
            settings: self.settings.clone(),
            listen_port: self.listen_addr.port(),
            download_bucket: self.download_bucket.clone(),
            upload_bucket: self.upload_bucket.clone(),
        })
    }

    /// Stops a session and forgets it. Safe to call more than once, including
    /// after the same content has been started again under a new handle.
    pub fn stop_session(&self, handle: &SessionHandle) {
        handle.stop();
        let mut sessions = lock(&self.sessions);
        let content_id = handle.content_id();
        if sessions
            .get(&content_id)
            .is_some_and(|entry| entry.handle.same_session(handle))
        {
            sessions.remove(&content_id);
        }
    }

    /// Handles of every session that has not ended yet.
    pub fn sessions(&self) -> Vec<SessionHandle> {
        lock(&self.sessions)
            .values()
            .filter(|entry| !entry.handle.is_finished())
            .map(|entry| entry.handle.clone())
            .collect()
    }

    /// Stops every session, waits briefly for them to wind down and closes
    /// the listener.
    pub async fn shutdown(&self) {
        let handles: Vec<SessionHandle> = lock(&self.sessions)
            .drain()
            .map(|(_, entry)| entry.handle)
            .collect();
        for handle in &handles {
            handle.stop();
        }
        for handle in &handles {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle.wait()).await.is_err() {
                event!(Level::WARN, content_id = %handle.content_id(), "Session did not stop in time");
            }
        }
        let _ = self.shutdown_tx.send(());
        event!(Level::INFO, "Engine shut down");
    }

    fn spawn_session(&self, params: SessionManagerParameters) -> Result<SessionHandle, EngineError> {
        let content_id = params.content_id;
        let mut sessions = lock(&self.sessions);
        if let Some(entry) = sessions.get(&content_id) {
            if !entry.handle.is_finished() {
                return Err(EngineError::DuplicateSession {
                    content_id: content_id.to_hex(),
                });
            }
        }

        let (handle, incoming_tx) = SessionManager::spawn(params);
        sessions.insert(
            content_id,
            SessionEntry {
                incoming_tx,
                handle: handle.clone(),
            },
        );
        Ok(handle)
    }
}

async fn accept_loop(
    listener: TcpListener,
    sessions: SessionRegistry,
    own_peer_id: [u8; 20],
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let sessions = sessions.clone();
                    tokio::spawn(async move {
                        route_incoming(stream, addr, sessions, own_peer_id).await;
                    });
                }
                Err(e) => {
                    event!(Level::WARN, error = %e, "Failed to accept peer connection");
                }
            },
        }
    }
}

/// Reads the remote handshake and hands the stream to the session that owns
/// the named content. Anything else is dropped.
async fn route_incoming(
    mut stream: TcpStream,
    addr: SocketAddr,
    sessions: SessionRegistry,
    own_peer_id: [u8; 20],
) {
    let handshake = match tokio::time::timeout(INCOMING_HANDSHAKE_TIMEOUT, read_handshake(&mut stream)).await {
        Ok(Ok(handshake)) => handshake,
        Ok(Err(e)) => {
            event!(Level::DEBUG, peer = %addr, error = %e, "Bad incoming handshake");
            return;
        }
        Err(_) => {
            event!(Level::DEBUG, peer = %addr, "Incoming handshake timed out");
            return;
        }
    };
    if handshake.peer_id == own_peer_id {
        event!(Level::DEBUG, peer = %addr, "Dropping connection to ourselves");
        return;
    }

    let incoming_tx = lock(&sessions)
        .get(&handshake.content_id)
        .map(|entry| entry.incoming_tx.clone());
    let Some(incoming_tx) = incoming_tx else {
        event!(Level::DEBUG, peer = %addr, content_id = %handshake.content_id, "No session for incoming peer");
        return;
    };
    let _ = incoming_tx
        .send(IncomingPeer {
            stream,
            addr,
            handshake,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::test_tracker::{TestTracker, TrackerMode};
    use crate::discovery::{AnnounceRequest, PeerDiscovery};
    use crate::networking::protocol::{encode_bitfield, generate_message, parse_message, Message};
    use crate::networking::Handshake;
    use crate::session::{SessionOutcome, TransferState};

    use tokio::io::AsyncWriteExt;

    const PIECE_LENGTH: u32 = 16 * 1024;

    fn settings(endpoints: Vec<String>) -> Settings {
        Settings {
            client_port: 0,
            piece_length: PIECE_LENGTH,
            discovery_endpoints: endpoints,
            discovery_timeout_ms: 1_000,
            rediscovery_delay_ms: 200,
            connect_timeout_ms: 1_000,
            ..Settings::default()
        }
    }

    /// Ten pieces, the last one short.
    fn ten_piece_content() -> Vec<u8> {
        (0..(PIECE_LENGTH as usize * 10 - 100))
            .map(|i| (i % 251) as u8)
            .collect()
    }

    fn memory_source(data: &[u8]) -> Vec<SeedSource> {
        vec![SeedSource::Memory {
            name: "payload.bin".to_string(),
            data: data.to_vec(),
        }]
    }

    /// Registers `port` for `content_id` on the tracker until at least
    /// `expected` other peers are listed.
    async fn register_and_wait(tracker_url: &str, content_id: ContentId, port: u16, expected: usize) {
        let discovery = PeerDiscovery::new(vec![tracker_url.to_string()], Duration::from_secs(1));
        for _ in 0..50 {
            let peers = discovery
                .announce_all(AnnounceRequest {
                    content_id,
                    peer_id: [b'x'; 20],
                    port,
                    uploaded: 0,
                    downloaded: 0,
                    left: 0,
                    event: None,
                })
                .await;
            if peers.len() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("swarm never reached {} peers", expected);
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn read_completed(outcome: SessionOutcome) -> Vec<u8> {
        let SessionOutcome::Completed { files, .. } = outcome else {
            panic!("download did not complete: {:?}", outcome);
        };
        let mut content = Vec::new();
        for file in files {
            content.extend(file.handle.read().await.unwrap());
        }
        content
    }

    #[tokio::test]
    async fn test_download_from_two_seeds_with_one_offline_peer() {
        let tracker = TestTracker::start(TrackerMode::Registry).await;
        let data = ten_piece_content();

        let seed_a = Engine::new(settings(vec![tracker.url.clone()])).await.unwrap();
        let seed_b = Engine::new(settings(vec![tracker.url.clone()])).await.unwrap();
        let seeding = seed_a.start_seeding(memory_source(&data)).await.unwrap();
        let seeding_b = seed_b.start_seeding(memory_source(&data)).await.unwrap();
        assert_eq!(seeding.link, seeding_b.link);

        let offline = closed_port().await;
        register_and_wait(&tracker.url, seeding.link.content_id, offline, 2).await;

        let downloader = Engine::new(settings(Vec::new())).await.unwrap();
        let handle = downloader.start_download_str(&seeding.link.to_uri()).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(20), handle.wait())
            .await
            .expect("download timed out");
        assert_eq!(read_completed(outcome).await, data);

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.state, TransferState::Completed);
        assert_eq!(snapshot.owned_pieces, 10);
        assert_eq!(snapshot.total_pieces, 10);
        assert_eq!(snapshot.completion_ratio(), 1.0);
        let since_first_byte = snapshot.since_first_byte.expect("bytes were transferred");
        assert!(since_first_byte <= snapshot.elapsed);

        downloader.shutdown().await;
        seed_a.shutdown().await;
        seed_b.shutdown().await;
    }

    #[tokio::test]
    async fn test_progress_ratio_never_decreases() {
        let tracker = TestTracker::start(TrackerMode::Registry).await;
        let data = ten_piece_content();

        let seed = Engine::new(settings(vec![tracker.url.clone()])).await.unwrap();
        let seeding = seed.start_seeding(memory_source(&data)).await.unwrap();
        register_and_wait(&tracker.url, seeding.link.content_id, closed_port().await, 1).await;

        let downloader = Engine::new(settings(Vec::new())).await.unwrap();
        let handle = downloader.start_download(&seeding.link).unwrap();
        let mut progress_rx = handle.subscribe();

        let mut ratios = Vec::new();
        let collect = async {
            while let Ok(progress) = progress_rx.recv().await {
                ratios.push(progress.completion_ratio());
                if progress.state.is_terminal() {
                    return progress.state;
                }
            }
            TransferState::Failed
        };
        let final_state = tokio::time::timeout(Duration::from_secs(20), collect)
            .await
            .expect("no terminal progress event");

        assert_eq!(final_state, TransferState::Completed);
        assert!(ratios.windows(2).all(|w| w[0] <= w[1]), "{:?}", ratios);
        assert_eq!(ratios.last().copied(), Some(1.0));

        downloader.shutdown().await;
        seed.shutdown().await;
    }

    /// Speaks the wire protocol, claims every piece and answers each request
    /// with junk.
    async fn spawn_corrupt_peer(content_id: ContentId, piece_count: usize) -> (u16, AbortOnDrop) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    if read_handshake(&mut socket).await.is_err() {
                        return;
                    }
                    let ours = Handshake::new(content_id, [b'z'; 20], false);
                    socket.write_all(&ours.to_bytes()).await.unwrap();
                    let bitfield = encode_bitfield(&vec![true; piece_count]);
                    let frame = generate_message(&Message::Bitfield(bitfield)).unwrap();
                    socket.write_all(&frame).await.unwrap();

                    while let Ok(message) = parse_message(&mut socket).await {
                        if let Message::Request(index, begin, length) = message {
                            let junk = vec![0xAA; length as usize];
                            let frame = generate_message(&Message::Block(index, begin, junk)).unwrap();
                            if socket.write_all(&frame).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });
        (port, AbortOnDrop(task))
    }

    #[tokio::test]
    async fn test_corrupt_peer_never_yields_bad_pieces() {
        let tracker = TestTracker::start(TrackerMode::Registry).await;
        let data = ten_piece_content();

        let seed = Engine::new(settings(vec![tracker.url.clone()])).await.unwrap();
        let seeding = seed.start_seeding(memory_source(&data)).await.unwrap();

        let (corrupt_port, _corrupt_task) = spawn_corrupt_peer(seeding.link.content_id, 10).await;
        register_and_wait(&tracker.url, seeding.link.content_id, corrupt_port, 1).await;

        let downloader = Engine::new(settings(Vec::new())).await.unwrap();
        let handle = downloader.start_download(&seeding.link).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(30), handle.wait())
            .await
            .expect("download timed out");
        assert_eq!(read_completed(outcome).await, data);

        downloader.shutdown().await;
        seed.shutdown().await;
    }

    #[tokio::test]
    async fn test_download_to_folder_from_seeded_paths() {
        let tracker = TestTracker::start(TrackerMode::Registry).await;
        let source_dir = tempfile::tempdir().unwrap();
        let first = source_dir.path().join("first.txt");
        let second = source_dir.path().join("second.bin");
        tokio::fs::write(&first, b"hello across a file boundary").await.unwrap();
        tokio::fs::write(&second, vec![7u8; 40_000]).await.unwrap();

        let seed = Engine::new(settings(vec![tracker.url.clone()])).await.unwrap();
        let seeding = seed
            .start_seeding(vec![SeedSource::Path(first), SeedSource::Path(second)])
            .await
            .unwrap();
        register_and_wait(&tracker.url, seeding.link.content_id, closed_port().await, 1).await;

        let out_dir = tempfile::tempdir().unwrap();
        let mut download_settings = settings(Vec::new());
        download_settings.download_folder = Some(out_dir.path().to_path_buf());
        let downloader = Engine::new(download_settings).await.unwrap();
        let handle = downloader.start_download(&seeding.link).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(20), handle.wait())
            .await
            .expect("download timed out");
        let SessionOutcome::Completed { files, .. } = outcome else {
            panic!("download did not complete: {:?}", outcome);
        };
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].file_name, "first.txt");
        let path = files[0].handle.path().unwrap();
        assert!(path.starts_with(out_dir.path()));
        assert_eq!(files[0].handle.read().await.unwrap(), b"hello across a file boundary");
        assert_eq!(files[1].handle.read().await.unwrap(), vec![7u8; 40_000]);

        downloader.shutdown().await;
        seed.shutdown().await;
    }

    #[tokio::test]
    async fn test_download_fails_when_no_peer_is_reachable() {
        let offline = SocketAddr::from(([127, 0, 0, 1], closed_port().await));
        let tracker = TestTracker::start(TrackerMode::Fixed(vec![offline])).await;
        let mut download_settings = settings(vec![tracker.url.clone()]);
        download_settings.max_discovery_rounds = 1;
        download_settings.rediscovery_delay_ms = 10;
        let downloader = Engine::new(download_settings).await.unwrap();

        let link = ShareLink {
            content_id: ContentId([9; 20]),
            display_name: "missing".to_string(),
            total_length: 1,
            endpoints: Vec::new(),
        };
        let handle = downloader.start_download(&link).unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(10), handle.wait())
            .await
            .unwrap();
        assert!(matches!(outcome, SessionOutcome::Failed { .. }), "{:?}", outcome);
        assert_eq!(handle.snapshot().state, TransferState::Failed);
    }

    #[tokio::test]
    async fn test_seeding_nothing_is_empty_input() {
        let engine = Engine::new(settings(Vec::new())).await.unwrap();
        assert!(matches!(
            engine.start_seeding(Vec::new()).await,
            Err(EngineError::EmptyInput)
        ));
        assert!(matches!(
            engine
                .start_seeding(vec![SeedSource::Memory {
                    name: "empty".to_string(),
                    data: Vec::new(),
                }])
                .await,
            Err(EngineError::EmptyInput)
        ));
    }

    #[tokio::test]
    async fn test_malformed_link_is_rejected() {
        let engine = Engine::new(settings(Vec::new())).await.unwrap();
        assert!(matches!(
            engine.start_download_str("http://not-a-link"),
            Err(EngineError::MalformedLink { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_session_twice_and_duplicate_sessions() {
        let engine = Engine::new(settings(Vec::new())).await.unwrap();
        let data = ten_piece_content();
        let seeding = engine.start_seeding(memory_source(&data)).await.unwrap();

        assert!(matches!(
            engine.start_seeding(memory_source(&data)).await,
            Err(EngineError::DuplicateSession { .. })
        ));
        assert_eq!(engine.sessions().len(), 1);

        engine.stop_session(&seeding.session);
        engine.stop_session(&seeding.session);
        let outcome = tokio::time::timeout(Duration::from_secs(5), seeding.session.wait())
            .await
            .unwrap();
        assert!(matches!(outcome, SessionOutcome::Stopped));
        assert!(engine.sessions().is_empty());

        // The content can be shared again once the old session is gone.
        let again = engine.start_seeding(memory_source(&data)).await.unwrap();
        assert_eq!(again.link, seeding.link);
        assert!(!again.session.same_session(&seeding.session));

        // A stale handle leaves the new session registered and running.
        engine.stop_session(&seeding.session);
        let live = engine.sessions();
        assert_eq!(live.len(), 1);
        assert!(live[0].same_session(&again.session));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!again.session.is_finished());
        assert!(again.session.outcome().is_none());

        engine.stop_session(&again.session);
        let outcome = tokio::time::timeout(Duration::from_secs(5), again.session.wait())
            .await
            .unwrap();
        assert!(matches!(outcome, SessionOutcome::Stopped));
        assert!(engine.sessions().is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_listener_drops_unknown_content() {
        let engine = Engine::new(settings(Vec::new())).await.unwrap();
        let addr = SocketAddr::from(([127, 0, 0, 1], engine.listen_addr().port()));
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let handshake = Handshake::new(ContentId([3; 20]), [b'q'; 20], false);
        stream.write_all(&handshake.to_bytes()).await.unwrap();

        let closed = tokio::time::timeout(Duration::from_secs(2), read_handshake(&mut stream)).await;
        assert!(matches!(closed, Ok(Err(_))));
    }
}
