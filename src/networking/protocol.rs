// SPDX-FileCopyrightText: 2025 The seedlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::content::{ContentId, HASH_LENGTH};
use crate::token_bucket::TokenBucket;

use std::collections::BTreeSet;
use std::fmt;
use std::io::{Error, ErrorKind};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::sync::mpsc::Receiver;
use tokio::sync::oneshot;

use thiserror::Error;
use tracing::{event, Level};

pub const PROTOCOL_ID: &[u8] = b"seedlink/1";
pub const HANDSHAKE_LEN: usize = 1 + PROTOCOL_ID.len() + 8 + HASH_LENGTH + 20;
pub const BLOCK_SIZE: u32 = 16 * 1024;
/// Largest frame accepted from a peer, id byte included.
pub const MAX_MESSAGE_LEN: u32 = 16 * 1024 * 1024;

/// Reserved-byte flag advertising that the peer can serve the info dictionary.
const METADATA_FLAG: u8 = 0x01;

const ID_BITFIELD: u8 = 1;
const ID_HAVE: u8 = 2;
const ID_REQUEST: u8 = 3;
const ID_BLOCK: u8 = 4;
const ID_CANCEL: u8 = 5;
const ID_REJECT: u8 = 6;
const ID_METADATA_REQUEST: u8 = 7;
const ID_METADATA: u8 = 8;

#[derive(Debug, Error)]
pub enum MessageGenerationError {
    #[error("Payload too large: {0}")]
    PayloadTooLarge(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub content_id: ContentId,
    pub peer_id: [u8; 20],
    pub supports_metadata: bool,
}

impl Handshake {
    pub fn new(content_id: ContentId, peer_id: [u8; 20], supports_metadata: bool) -> Self {
        Self {
            content_id,
            peer_id,
            supports_metadata,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HANDSHAKE_LEN);
        bytes.push(PROTOCOL_ID.len() as u8);
        bytes.extend_from_slice(PROTOCOL_ID);
        let mut reserved = [0u8; 8];
        if self.supports_metadata {
            reserved[7] |= METADATA_FLAG;
        }
        bytes.extend_from_slice(&reserved);
        bytes.extend_from_slice(self.content_id.as_bytes());
        bytes.extend_from_slice(&self.peer_id);
        bytes
    }

    pub fn parse(buffer: &[u8]) -> Result<Self, Error> {
        if buffer.len() != HANDSHAKE_LEN {
            return Err(Error::new(ErrorKind::InvalidData, "Handshake has the wrong length"));
        }
        let pstrlen = buffer[0] as usize;
        if pstrlen != PROTOCOL_ID.len() || &buffer[1..1 + pstrlen] != PROTOCOL_ID {
            return Err(Error::new(ErrorKind::InvalidData, "Unknown protocol identifier"));
        }
        let reserved = &buffer[1 + pstrlen..9 + pstrlen];
        let id_start = 9 + pstrlen;
        let content_id = ContentId::from_slice(&buffer[id_start..id_start + HASH_LENGTH])
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, "Bad content identifier"))?;
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buffer[id_start + HASH_LENGTH..]);

        Ok(Self {
            content_id,
            peer_id,
            supports_metadata: reserved[7] & METADATA_FLAG != 0,
        })
    }
}

pub async fn read_handshake(socket: &mut (impl AsyncReadExt + Unpin)) -> Result<Handshake, Error> {
    let mut buffer = [0u8; HANDSHAKE_LEN];
    socket.read_exact(&mut buffer).await?;
    Handshake::parse(&buffer)
}

#[derive(Debug, PartialEq, Clone)]
pub enum Message {
    KeepAlive,
    Bitfield(Vec<u8>),
    Have(u32),
    Request(u32, u32, u32),
    Block(u32, u32, Vec<u8>),
    Cancel(u32, u32, u32),
    Reject(u32, u32, u32),
    MetadataRequest,
    Metadata(Vec<u8>),
}

pub struct MessageSummary<'a>(pub &'a Message);
impl fmt::Debug for MessageSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Message::Bitfield(bitfield) => write!(f, "BITFIELD(len: {})", bitfield.len()),
            Message::Block(index, begin, data) => write!(
                f,
                "BLOCK(index: {}, begin: {}, len: {})",
                index,
                begin,
                data.len()
            ),
            Message::Metadata(bytes) => write!(f, "METADATA(len: {})", bytes.len()),
            other => write!(f, "{:?}", other),
        }
    }
}

#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy, PartialOrd, Ord)]
pub struct BlockInfo {
    pub piece_index: u32,
    pub offset: u32,
    pub length: u32,
}

/// Blocks of a piece in ascending offset order.
pub fn calculate_blocks_for_piece(piece_index: u32, piece_size: u32) -> BTreeSet<BlockInfo> {
    (0..piece_size)
        .step_by(BLOCK_SIZE as usize)
        .map(|offset| BlockInfo {
            piece_index,
            offset,
            length: BLOCK_SIZE.min(piece_size - offset),
        })
        .collect()
}

pub fn encode_bitfield(owned: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; owned.len().div_ceil(8)];
    for (index, _) in owned.iter().enumerate().filter(|(_, has)| **has) {
        bytes[index / 8] |= 0x80 >> (index % 8);
    }
    bytes
}

/// Expands a wire bitfield to `piece_count` flags; spare trailing bits are ignored.
pub fn decode_bitfield(bytes: &[u8], piece_count: usize) -> Vec<bool> {
    (0..piece_count)
        .map(|index| {
            bytes
                .get(index / 8)
                .is_some_and(|byte| byte & (0x80 >> (index % 8)) != 0)
        })
        .collect()
}

fn frame(id: u8, payload_len: usize) -> Result<Vec<u8>, MessageGenerationError> {
    let frame_len: u32 = (1 + payload_len)
        .try_into()
        .map_err(|_| MessageGenerationError::PayloadTooLarge("frame"))?;
    if frame_len > MAX_MESSAGE_LEN {
        return Err(MessageGenerationError::PayloadTooLarge("frame"));
    }
    let mut bytes = Vec::with_capacity(5 + payload_len);
    bytes.extend(frame_len.to_be_bytes());
    bytes.push(id);
    Ok(bytes)
}

fn triple(id: u8, a: u32, b: u32, c: u32) -> Result<Vec<u8>, MessageGenerationError> {
    let mut bytes = frame(id, 12)?;
    bytes.extend(a.to_be_bytes());
    bytes.extend(b.to_be_bytes());
    bytes.extend(c.to_be_bytes());
    Ok(bytes)
}

pub fn generate_message(message: &Message) -> Result<Vec<u8>, MessageGenerationError> {
    match message {
        Message::KeepAlive => Ok(vec![0, 0, 0, 0]),
        Message::Bitfield(bitfield) => {
            let mut bytes = frame(ID_BITFIELD, bitfield.len())?;
            bytes.extend_from_slice(bitfield);
            Ok(bytes)
        }
        Message::Have(index) => {
            let mut bytes = frame(ID_HAVE, 4)?;
            bytes.extend(index.to_be_bytes());
            Ok(bytes)
        }
        Message::Request(index, begin, length) => triple(ID_REQUEST, *index, *begin, *length),
        Message::Block(index, begin, data) => {
            let mut bytes = frame(ID_BLOCK, 8 + data.len())?;
            bytes.extend(index.to_be_bytes());
            bytes.extend(begin.to_be_bytes());
            bytes.extend_from_slice(data);
            Ok(bytes)
        }
        Message::Cancel(index, begin, length) => triple(ID_CANCEL, *index, *begin, *length),
        Message::Reject(index, begin, length) => triple(ID_REJECT, *index, *begin, *length),
        Message::MetadataRequest => frame(ID_METADATA_REQUEST, 0),
        Message::Metadata(info_bytes) => {
            let mut bytes = frame(ID_METADATA, info_bytes.len())?;
            bytes.extend_from_slice(info_bytes);
            Ok(bytes)
        }
    }
}

fn read_u32(payload: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]])
}

fn expect_len(id: u8, payload: &[u8], len: usize) -> Result<(), Error> {
    if payload.len() == len {
        Ok(())
    } else {
        Err(Error::new(
            ErrorKind::InvalidData,
            format!(
                "Message {} carries {} payload bytes, expected {}",
                id,
                payload.len(),
                len
            ),
        ))
    }
}

/// Reads one whole frame before decoding it, so a truncated frame is an error
/// rather than a partially consumed stream.
pub async fn parse_message(socket: &mut (impl AsyncReadExt + Unpin)) -> Result<Message, Error> {
    let mut len_buf = [0u8; 4];
    socket.read_exact(&mut len_buf).await?;
    let frame_len = u32::from_be_bytes(len_buf);

    if frame_len == 0 {
        return Ok(Message::KeepAlive);
    }
    if frame_len > MAX_MESSAGE_LEN {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("Message of {} bytes exceeds the {} byte limit", frame_len, MAX_MESSAGE_LEN),
        ));
    }

    let mut body = vec![0u8; frame_len as usize];
    socket.read_exact(&mut body).await?;
    let id = body[0];
    let payload = &body[1..];

    match id {
        ID_BITFIELD => Ok(Message::Bitfield(payload.to_vec())),
        ID_HAVE => {
            expect_len(id, payload, 4)?;
            Ok(Message::Have(read_u32(payload, 0)))
        }
        ID_REQUEST | ID_CANCEL | ID_REJECT => {
            expect_len(id, payload, 12)?;
            let (a, b, c) = (read_u32(payload, 0), read_u32(payload, 4), read_u32(payload, 8));
            Ok(match id {
                ID_REQUEST => Message::Request(a, b, c),
                ID_CANCEL => Message::Cancel(a, b, c),
                _ => Message::Reject(a, b, c),
            })
        }
        ID_BLOCK => {
            if payload.len() < 8 {
                return Err(Error::new(ErrorKind::InvalidData, "Block message is truncated"));
            }
            Ok(Message::Block(
                read_u32(payload, 0),
                read_u32(payload, 4),
                payload[8..].to_vec(),
            ))
        }
        ID_METADATA_REQUEST => {
            expect_len(id, payload, 0)?;
            Ok(Message::MetadataRequest)
        }
        ID_METADATA => Ok(Message::Metadata(payload.to_vec())),
        _ => Err(Error::new(
            ErrorKind::InvalidData,
            format!("Invalid message ID received from peer: {}", id),
        )),
    }
}

/// Owns the write half of a peer connection. Block payloads spend tokens from
/// the shared upload bucket before they hit the socket.
pub async fn writer_task<W>(
    mut stream_write_half: W,
    mut write_rx: Receiver<Message>,
    error_tx: oneshot::Sender<Error>,
    upload_bucket: Arc<TokenBucket>,
    mut shutdown_rx: broadcast::Receiver<()>,
) where
    W: AsyncWriteExt + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            Some(message) = write_rx.recv() => {
                if let Message::Block(_, _, data) = &message {
                    upload_bucket.acquire(data.len()).await;
                }

                let bytes = match generate_message(&message) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        event!(Level::ERROR, "Failed to generate message for writer task: {}", e);
                        break;
                    }
                };

                tokio::select! {
                    write_result = stream_write_half.write_all(&bytes) => {
                        if let Err(e) = write_result {
                            let _ = error_tx.send(e);
                            break;
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        event!(Level::TRACE, "Writer task shutting down during TCP write.");
                        break;
                    }
                }
            }

            _ = shutdown_rx.recv() => {
                event!(Level::TRACE, "Writer task shutting down while idle.");
                break;
            }

            else => {
                event!(Level::TRACE, "Writer task shutting down, channel closed.");
                break;
            }
        }
    }
    let _ = stream_write_half.shutdown().await;
}
