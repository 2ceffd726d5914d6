// SPDX-FileCopyrightText: 2025 The seedlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod tracker;

#[cfg(test)]
pub(crate) mod test_tracker;

use crate::content::ContentId;
use crate::errors::DiscoveryError;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{event, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Completed,
    Stopped,
}

impl AnnounceEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Completed => "completed",
            AnnounceEvent::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub content_id: ContentId,
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<AnnounceEvent>,
}

/// Queries a fixed set of discovery endpoints for peers holding some content.
#[derive(Debug, Clone)]
pub struct PeerDiscovery {
    client: reqwest::Client,
    endpoints: Vec<String>,
    timeout: Duration,
}

impl PeerDiscovery {
    pub fn new(endpoints: Vec<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints,
            timeout,
        }
    }

    /// Announces to every endpoint concurrently and streams peer addresses as
    /// responses arrive.
    ///
    /// Each address is yielded once. Endpoints that fail or exceed the
    /// timeout are logged and skipped. If no endpoint produced a single
    /// address the stream ends with one `NoPeersFound` error. Dropping the
    /// stream cancels the outstanding requests.
    pub fn discover(
        &self,
        request: AnnounceRequest,
    ) -> ReceiverStream<Result<SocketAddr, DiscoveryError>> {
        let (tx, rx) = mpsc::channel(64);
        let client = self.client.clone();
        let endpoints = self.endpoints.clone();
        let limit = self.timeout;

        tokio::spawn(async move {
            let mut announces = JoinSet::new();
            for endpoint in endpoints {
                if !is_supported_endpoint(&endpoint) {
                    event!(Level::WARN, %endpoint, "Skipping discovery endpoint with unsupported scheme");
                    continue;
                }
                let client = client.clone();
                let request = request.clone();
                announces.spawn(async move {
                    let result =
                        tokio::time::timeout(limit, tracker::announce(&client, &endpoint, &request))
                            .await
                            .unwrap_or_else(|_| {
                                Err(DiscoveryError::Timeout {
                                    endpoint: endpoint.clone(),
                                })
                            });
                    (endpoint, result)
                });
            }

            let mut seen = HashSet::new();
            while let Some(joined) = announces.join_next().await {
                let Ok((endpoint, result)) = joined else {
                    continue;
                };
                match result {
                    Ok(response) => {
                        event!(Level::DEBUG, %endpoint, peers = response.peers.len(), "Announce succeeded");
                        for peer in response.peers {
                            if seen.insert(peer) && tx.send(Ok(peer)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        event!(Level::WARN, %endpoint, error = %e, "Announce failed");
                    }
                }
            }

            if seen.is_empty() {
                let _ = tx.send(Err(DiscoveryError::NoPeersFound)).await;
            }
        });

        ReceiverStream::new(rx)
    }

    /// Runs one full announce round and collects the addresses. Used by seeds
    /// registering themselves, where failures only matter to the log.
    pub async fn announce_all(&self, request: AnnounceRequest) -> Vec<SocketAddr> {
        let mut peers = Vec::new();
        let mut stream = self.discover(request);
        while let Some(result) = tokio_stream::StreamExt::next(&mut stream).await {
            if let Ok(peer) = result {
                peers.push(peer);
            }
        }
        peers
    }
}

fn is_supported_endpoint(endpoint: &str) -> bool {
    endpoint.starts_with("http://") || endpoint.starts_with("https://")
}
