// SPDX-FileCopyrightText: 2025 The seedlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! A tiny HTTP announce endpoint for tests.

use crate::networking::session::AbortOnDrop;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use serde_bencode::value::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub(crate) enum TrackerMode {
    /// Always answers with the same peers.
    Fixed(Vec<SocketAddr>),
    /// Accepts the connection and never answers.
    Hanging,
    /// Remembers every announcer per content id and hands back the others.
    Registry,
}

pub(crate) struct TestTracker {
    pub url: String,
    _task: AbortOnDrop,
}

type Swarms = Arc<Mutex<HashMap<Vec<u8>, Vec<SocketAddr>>>>;

impl TestTracker {
    pub async fn start(mode: TrackerMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/announce", listener.local_addr().unwrap());
        let mode = Arc::new(mode);
        let swarms: Swarms = Arc::default();

        let task = tokio::spawn(async move {
            while let Ok((socket, remote)) = listener.accept().await {
                let mode = mode.clone();
                let swarms = swarms.clone();
                tokio::spawn(async move {
                    let _ = serve(socket, remote.ip(), &mode, &swarms).await;
                });
            }
        });

        Self {
            url,
            _task: AbortOnDrop(task),
        }
    }
}

async fn serve(
    mut socket: TcpStream,
    remote_ip: IpAddr,
    mode: &TrackerMode,
    swarms: &Swarms,
) -> std::io::Result<()> {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        request.extend_from_slice(&buf[..n]);
    }

    let peers = match mode {
        TrackerMode::Hanging => {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            return Ok(());
        }
        TrackerMode::Fixed(peers) => peers.clone(),
        TrackerMode::Registry => register(&request, remote_ip, swarms),
    };

    let mut compact = Vec::new();
    for peer in peers {
        if let SocketAddr::V4(v4) = peer {
            compact.extend_from_slice(&v4.ip().octets());
            compact.extend_from_slice(&v4.port().to_be_bytes());
        }
    }
    let mut dict = HashMap::new();
    dict.insert(b"interval".to_vec(), Value::Int(30));
    dict.insert(b"peers".to_vec(), Value::Bytes(compact));
    let body = serde_bencode::to_bytes(&Value::Dict(dict)).unwrap();

    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    socket.write_all(header.as_bytes()).await?;
    socket.write_all(&body).await?;
    socket.shutdown().await
}

fn register(request: &[u8], remote_ip: IpAddr, swarms: &Swarms) -> Vec<SocketAddr> {
    let text = String::from_utf8_lossy(request);
    let target = text
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or_default();
    let query = target.split_once('?').map(|(_, q)| q).unwrap_or_default();

    let mut info_hash = Vec::new();
    let mut port = 0u16;
    let mut stopped = false;
    for pair in query.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        match key {
            "info_hash" => info_hash = urlencoding::decode_binary(value.as_bytes()).into_owned(),
            "port" => port = value.parse().unwrap_or(0),
            "event" => stopped = value == "stopped",
            _ => {}
        }
    }

    let me = SocketAddr::new(remote_ip, port);
    let mut swarms = swarms.lock().unwrap();
    let swarm = swarms.entry(info_hash).or_default();
    let others: Vec<SocketAddr> = swarm.iter().copied().filter(|p| *p != me).collect();
    if stopped {
        swarm.retain(|p| *p != me);
    } else if !swarm.contains(&me) {
        swarm.push(me);
    }
    others
}
