// SPDX-FileCopyrightText: 2025 The seedlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use super::protocol::{read_handshake, Handshake};

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Remote peer references a different content identifier")]
    HandshakeMismatch,

    #[error("Connected to ourselves")]
    SelfConnection,
}

/// Dials `addr`, exchanges handshakes and checks the remote side serves the
/// same content. The whole exchange is bounded by `limit`.
pub async fn connect_and_handshake(
    addr: SocketAddr,
    local: &Handshake,
    limit: Duration,
) -> Result<(TcpStream, Handshake), ConnectError> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        stream.write_all(&local.to_bytes()).await?;
        let remote = read_handshake(&mut stream).await?;
        Ok::<_, ConnectError>((stream, remote))
    };

    let (stream, remote) = timeout(limit, exchange)
        .await
        .map_err(|_| ConnectError::Timeout(limit))??;

    if remote.content_id != local.content_id {
        return Err(ConnectError::HandshakeMismatch);
    }
    if remote.peer_id == local.peer_id {
        return Err(ConnectError::SelfConnection);
    }
    Ok((stream, remote))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentId;
    use tokio::net::TcpListener;

    async fn answering_peer(reply: Handshake) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let _ = read_handshake(&mut socket).await;
                let _ = socket.write_all(&reply.to_bytes()).await;
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_matching_content_connects() {
        let local = Handshake::new(ContentId([1; 20]), [1; 20], false);
        let addr = answering_peer(Handshake::new(ContentId([1; 20]), [2; 20], true)).await;

        let (_, remote) = connect_and_handshake(addr, &local, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(remote.peer_id, [2; 20]);
        assert!(remote.supports_metadata);
    }

    #[tokio::test]
    async fn test_other_content_is_a_mismatch() {
        let local = Handshake::new(ContentId([1; 20]), [1; 20], false);
        let addr = answering_peer(Handshake::new(ContentId([3; 20]), [2; 20], true)).await;

        let result = connect_and_handshake(addr, &local, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ConnectError::HandshakeMismatch)));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _held = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let local = Handshake::new(ContentId([1; 20]), [1; 20], false);
        let result = connect_and_handshake(addr, &local, Duration::from_millis(200)).await;
        assert!(matches!(result, Err(ConnectError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_refused_connection_is_io_error() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let local = Handshake::new(ContentId([1; 20]), [1; 20], false);
        let result = connect_and_handshake(addr, &local, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ConnectError::Io(_))));
    }
}
