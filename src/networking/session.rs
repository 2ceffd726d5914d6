// SPDX-FileCopyrightText: 2025 The seedlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use super::protocol::{
    calculate_blocks_for_piece, parse_message, writer_task, BlockInfo, Handshake, Message,
    MessageSummary, BLOCK_SIZE,
};

use crate::command::{PeerCommand, SessionEvent};
use crate::token_bucket::TokenBucket;

use std::collections::{HashMap, HashSet, VecDeque};
use std::error::Error as StdError;
use std::sync::Arc;

use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use tracing::{event, instrument, Level};

const PEER_BLOCK_IN_FLIGHT_LIMIT: usize = 5;
const PEER_COMMAND_CAPACITY: usize = 1024;
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(60);
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);

struct DisconnectGuard {
    peer_ip_port: String,
    manager_tx: Sender<SessionEvent>,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let _ = self
            .manager_tx
            .try_send(SessionEvent::Disconnect(self.peer_ip_port.clone()));
    }
}

pub(crate) struct AbortOnDrop(pub(crate) JoinHandle<()>);
impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    /// We dialled; handshakes were already exchanged by the connector.
    Outgoing,
    /// The listener read the remote handshake; ours still has to be sent.
    Incoming,
}

pub struct PeerSessionParameters {
    pub local_handshake: Handshake,
    pub remote_handshake: Handshake,
    pub connection_type: ConnectionType,
    pub peer_ip_port: String,
    pub manager_tx: Sender<SessionEvent>,
    pub download_bucket: Arc<TokenBucket>,
    pub upload_bucket: Arc<TokenBucket>,
    pub shutdown_tx: broadcast::Sender<()>,
}

/// Buffer for one piece being assembled from blocks.
struct PieceAssembly {
    buffer: Vec<u8>,
    blocks_remaining: usize,
}

pub struct PeerSession {
    local_handshake: Handshake,
    remote_handshake: Handshake,
    connection_type: ConnectionType,
    peer_ip_port: String,

    manager_tx: Sender<SessionEvent>,
    command_rx: Receiver<PeerCommand>,
    command_tx: Option<Sender<PeerCommand>>,

    writer_tx: Sender<Message>,
    writer_rx: Option<Receiver<Message>>,

    pending_blocks: VecDeque<BlockInfo>,
    in_flight: HashSet<BlockInfo>,
    assemblies: HashMap<u32, PieceAssembly>,

    download_bucket: Arc<TokenBucket>,
    upload_bucket: Arc<TokenBucket>,
    shutdown_tx: broadcast::Sender<()>,
}

enum Flow {
    Continue,
    Stop,
}

impl PeerSession {
    pub fn new(params: PeerSessionParameters) -> Self {
        let (writer_tx, writer_rx) = mpsc::channel::<Message>(100);
        let (command_tx, command_rx) = mpsc::channel::<PeerCommand>(PEER_COMMAND_CAPACITY);

        Self {
            local_handshake: params.local_handshake,
            remote_handshake: params.remote_handshake,
            connection_type: params.connection_type,
            peer_ip_port: params.peer_ip_port,
            manager_tx: params.manager_tx,
            command_rx,
            command_tx: Some(command_tx),
            writer_tx,
            writer_rx: Some(writer_rx),
            pending_blocks: VecDeque::new(),
            in_flight: HashSet::new(),
            assemblies: HashMap::new(),
            download_bucket: params.download_bucket,
            upload_bucket: params.upload_bucket,
            shutdown_tx: params.shutdown_tx,
        }
    }

    #[instrument(skip(self, stream), fields(peer = %self.peer_ip_port))]
    pub async fn run<S>(mut self, stream: S) -> Result<(), Box<dyn StdError + Send + Sync>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let _guard = DisconnectGuard {
            peer_ip_port: self.peer_ip_port.clone(),
            manager_tx: self.manager_tx.clone(),
        };

        let (mut read_half, mut write_half) = split(stream);

        if self.connection_type == ConnectionType::Incoming {
            write_half
                .write_all(&self.local_handshake.to_bytes())
                .await?;
        }

        let (error_tx, mut error_rx) = oneshot::channel();
        let writer_rx = self
            .writer_rx
            .take()
            .ok_or("peer session started twice")?;
        let writer_handle = tokio::spawn(writer_task(
            write_half,
            writer_rx,
            error_tx,
            self.upload_bucket.clone(),
            self.shutdown_tx.subscribe(),
        ));
        let _writer_abort_guard = AbortOnDrop(writer_handle);

        // Reading happens on its own task so a cancelled select branch never
        // drops half a frame.
        let (message_tx, mut message_rx) = mpsc::channel(64);
        let reader_handle = tokio::spawn(async move {
            loop {
                let result = parse_message(&mut read_half).await;
                let failed = result.is_err();
                if message_tx.send(result).await.is_err() || failed {
                    break;
                }
            }
        });
        let _reader_abort_guard = AbortOnDrop(reader_handle);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let peer_tx = self
            .command_tx
            .take()
            .ok_or("peer session started twice")?;
        self.manager_tx
            .send(SessionEvent::PeerConnected {
                peer: self.peer_ip_port.clone(),
                peer_id: self.remote_handshake.peer_id,
                supports_metadata: self.remote_handshake.supports_metadata,
                peer_tx,
            })
            .await?;

        let mut keep_alive_timer =
            tokio::time::interval_at(Instant::now() + KEEP_ALIVE_INTERVAL, KEEP_ALIVE_INTERVAL);
        let inactivity_timeout = tokio::time::sleep(INACTIVITY_TIMEOUT);
        tokio::pin!(inactivity_timeout);

        let result: Result<(), Box<dyn StdError + Send + Sync>> = 'session: loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    event!(Level::TRACE, "Peer session shutting down.");
                    break 'session Ok(());
                }

                _ = &mut inactivity_timeout => {
                    event!(Level::DEBUG, "Peer timed out due to inactivity. Disconnecting.");
                    break 'session Err("Peer connection timed out".into());
                }

                _ = keep_alive_timer.tick() => {
                    let _ = self.writer_tx.try_send(Message::KeepAlive);
                    event!(Level::TRACE, "Sent periodic Keep-Alive.");
                }

                writer_error = &mut error_rx => {
                    match writer_error {
                        Ok(err) => break 'session Err(err.into()),
                        Err(_) => break 'session Err("Writer task stopped unexpectedly".into()),
                    }
                }

                incoming = message_rx.recv() => {
                    match incoming {
                        Some(Ok(message)) => {
                            inactivity_timeout.as_mut().reset(Instant::now() + INACTIVITY_TIMEOUT);
                            event!(Level::TRACE, message_summary = ?MessageSummary(&message));
                            if let Err(e) = self.handle_message(message).await {
                                break 'session Err(e);
                            }
                        }
                        Some(Err(e)) => break 'session Err(e.into()),
                        None => break 'session Err("Peer reader stopped".into()),
                    }
                }

                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => match self.handle_command(command).await {
                            Ok(Flow::Continue) => {}
                            Ok(Flow::Stop) => break 'session Ok(()),
                            Err(e) => break 'session Err(e),
                        },
                        None => break 'session Ok(()),
                    }
                }
            }
        };

        if let Err(ref e) = result {
            event!(Level::DEBUG, error = %e, "Peer session ended");
        }
        result
    }

    async fn handle_message(
        &mut self,
        message: Message,
    ) -> Result<(), Box<dyn StdError + Send + Sync>> {
        let peer = self.peer_ip_port.clone();
        match message {
            Message::KeepAlive => {}
            Message::Bitfield(bitfield) => {
                self.manager_tx
                    .send(SessionEvent::PeerBitfield(peer, bitfield))
                    .await?;
            }
            Message::Have(piece_index) => {
                self.manager_tx
                    .send(SessionEvent::PeerHave(peer, piece_index))
                    .await?;
            }
            Message::Request(piece_index, offset, length) => {
                let block = BlockInfo {
                    piece_index,
                    offset,
                    length,
                };
                if length == 0 || length > BLOCK_SIZE {
                    self.writer_tx
                        .send(Message::Reject(piece_index, offset, length))
                        .await?;
                } else {
                    self.manager_tx
                        .send(SessionEvent::BlockRequested(peer, block))
                        .await?;
                }
            }
            Message::Cancel(piece_index, offset, length) => {
                let block = BlockInfo {
                    piece_index,
                    offset,
                    length,
                };
                self.manager_tx
                    .send(SessionEvent::RequestCancelled(peer, block))
                    .await?;
            }
            Message::Block(piece_index, offset, data) => {
                self.handle_block(piece_index, offset, data).await?;
                self.fill_pipeline().await?;
            }
            Message::Reject(piece_index, offset, length) => {
                let block = BlockInfo {
                    piece_index,
                    offset,
                    length,
                };
                if self.in_flight.contains(&block) {
                    self.drop_piece(piece_index, false).await?;
                    self.manager_tx
                        .send(SessionEvent::PieceRejected(peer, piece_index))
                        .await?;
                    self.fill_pipeline().await?;
                }
            }
            Message::MetadataRequest => {
                self.manager_tx
                    .send(SessionEvent::MetadataRequested(peer))
                    .await?;
            }
            Message::Metadata(info_bytes) => {
                self.manager_tx
                    .send(SessionEvent::MetadataReceived(peer, info_bytes))
                    .await?;
            }
        }
        Ok(())
    }

    async fn handle_block(
        &mut self,
        piece_index: u32,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<(), Box<dyn StdError + Send + Sync>> {
        let block = BlockInfo {
            piece_index,
            offset,
            length: data.len() as u32,
        };
        if !self.in_flight.remove(&block) {
            event!(Level::TRACE, ?block, "Ignoring unrequested block");
            return Ok(());
        }

        self.download_bucket.acquire(data.len()).await;

        let Some(assembly) = self.assemblies.get_mut(&piece_index) else {
            return Ok(());
        };
        let start = offset as usize;
        assembly.buffer[start..start + data.len()].copy_from_slice(&data);
        assembly.blocks_remaining = assembly.blocks_remaining.saturating_sub(1);

        if assembly.blocks_remaining == 0 {
            if let Some(done) = self.assemblies.remove(&piece_index) {
                self.manager_tx
                    .send(SessionEvent::PieceReceived {
                        peer: self.peer_ip_port.clone(),
                        piece_index,
                        data: done.buffer,
                    })
                    .await?;
            }
        }
        Ok(())
    }

    async fn handle_command(
        &mut self,
        command: PeerCommand,
    ) -> Result<Flow, Box<dyn StdError + Send + Sync>> {
        match command {
            PeerCommand::RequestPiece {
                piece_index,
                piece_size,
            } => {
                if self.assemblies.contains_key(&piece_index) {
                    return Ok(Flow::Continue);
                }
                let blocks = calculate_blocks_for_piece(piece_index, piece_size);
                self.assemblies.insert(
                    piece_index,
                    PieceAssembly {
                        buffer: vec![0; piece_size as usize],
                        blocks_remaining: blocks.len(),
                    },
                );
                self.pending_blocks.extend(blocks);
                self.fill_pipeline().await?;
            }
            PeerCommand::CancelPiece(piece_index) => {
                self.drop_piece(piece_index, true).await?;
                self.fill_pipeline().await?;
            }
            PeerCommand::Have(piece_index) => {
                self.writer_tx.send(Message::Have(piece_index)).await?;
            }
            PeerCommand::Bitfield(bitfield) => {
                self.writer_tx.send(Message::Bitfield(bitfield)).await?;
            }
            PeerCommand::Upload(block, data) => {
                self.writer_tx
                    .send(Message::Block(block.piece_index, block.offset, data))
                    .await?;
            }
            PeerCommand::RejectRequest(block) => {
                self.writer_tx
                    .send(Message::Reject(block.piece_index, block.offset, block.length))
                    .await?;
            }
            PeerCommand::RequestMetadata => {
                self.writer_tx.send(Message::MetadataRequest).await?;
            }
            PeerCommand::SendMetadata(info_bytes) => {
                self.writer_tx.send(Message::Metadata(info_bytes)).await?;
            }
            PeerCommand::Disconnect => return Ok(Flow::Stop),
        }
        Ok(Flow::Continue)
    }

    /// Keeps up to `PEER_BLOCK_IN_FLIGHT_LIMIT` block requests outstanding.
    async fn fill_pipeline(&mut self) -> Result<(), Box<dyn StdError + Send + Sync>> {
        while self.in_flight.len() < PEER_BLOCK_IN_FLIGHT_LIMIT {
            let Some(block) = self.pending_blocks.pop_front() else {
                break;
            };
            self.writer_tx
                .send(Message::Request(block.piece_index, block.offset, block.length))
                .await?;
            self.in_flight.insert(block);
        }
        Ok(())
    }

    async fn drop_piece(
        &mut self,
        piece_index: u32,
        notify_peer: bool,
    ) -> Result<(), Box<dyn StdError + Send + Sync>> {
        self.assemblies.remove(&piece_index);
        self.pending_blocks.retain(|b| b.piece_index != piece_index);

        let cancelled: Vec<BlockInfo> = self
            .in_flight
            .iter()
            .filter(|b| b.piece_index == piece_index)
            .copied()
            .collect();
        for block in cancelled {
            self.in_flight.remove(&block);
            if notify_peer {
                self.writer_tx
                    .send(Message::Cancel(block.piece_index, block.offset, block.length))
                    .await?;
            }
        }
        Ok(())
    }
}
