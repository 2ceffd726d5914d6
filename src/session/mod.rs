// SPDX-FileCopyrightText: 2025 The seedlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod manager;
pub mod piece_manager;
pub mod state;

use crate::accounting::TransferSummary;
use crate::content::ContentId;
use crate::networking::Handshake;
use crate::storage::CompletedFile;

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferState {
    #[default]
    Idle,
    Discovering,
    Exchanging,
    Verifying,
    Completed,
    Failed,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Failed)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferState::Idle => "idle",
            TransferState::Discovering => "discovering",
            TransferState::Exchanging => "exchanging",
            TransferState::Verifying => "verifying",
            TransferState::Completed => "completed",
            TransferState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Seed,
    Download,
}

/// Snapshot of a session, published on every piece completion and state
/// change.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub content_id: ContentId,
    pub state: TransferState,
    pub owned_pieces: usize,
    /// `0` until the descriptor is known.
    pub total_pieces: usize,
    /// Downloaded plus uploaded payload bytes.
    pub bytes_transferred: u64,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    pub throughput_bps: f64,
    pub connected_peers: usize,
    pub elapsed: Duration,
    /// `None` until the first payload byte moves in either direction.
    pub since_first_byte: Option<Duration>,
}

impl ProgressEvent {
    pub(crate) fn initial(content_id: ContentId) -> Self {
        Self {
            content_id,
            state: TransferState::Idle,
            owned_pieces: 0,
            total_pieces: 0,
            bytes_transferred: 0,
            bytes_downloaded: 0,
            bytes_uploaded: 0,
            throughput_bps: 0.0,
            connected_peers: 0,
            elapsed: Duration::ZERO,
            since_first_byte: None,
        }
    }

    pub fn completion_ratio(&self) -> f64 {
        if self.total_pieces == 0 {
            return 0.0;
        }
        self.owned_pieces as f64 / self.total_pieces as f64
    }
}

#[derive(Debug, Clone)]
pub enum SessionOutcome {
    Completed {
        files: Vec<CompletedFile>,
        summary: Option<TransferSummary>,
    },
    Failed {
        cause: String,
    },
    Stopped,
}

/// An accepted connection whose handshake named this session's content.
#[derive(Debug)]
pub struct IncomingPeer {
    pub stream: TcpStream,
    pub addr: SocketAddr,
    pub handshake: Handshake,
}

/// Caller-side view of a running session. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    content_id: ContentId,
    role: SessionRole,
    stop_tx: mpsc::Sender<()>,
    progress_tx: broadcast::Sender<ProgressEvent>,
    snapshot_rx: watch::Receiver<ProgressEvent>,
    outcome_rx: watch::Receiver<Option<SessionOutcome>>,
}

impl SessionHandle {
    pub(crate) fn new(
        content_id: ContentId,
        role: SessionRole,
        stop_tx: mpsc::Sender<()>,
        progress_tx: broadcast::Sender<ProgressEvent>,
        snapshot_rx: watch::Receiver<ProgressEvent>,
        outcome_rx: watch::Receiver<Option<SessionOutcome>>,
    ) -> Self {
        Self {
            content_id,
            role,
            stop_tx,
            progress_tx,
            snapshot_rx,
            outcome_rx,
        }
    }

    pub fn content_id(&self) -> ContentId {
        self.content_id
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// Live progress events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress_tx.subscribe()
    }

    /// The most recent progress event.
    pub fn snapshot(&self) -> ProgressEvent {
        self.snapshot_rx.borrow().clone()
    }

    /// Asks the session to stop. Calling it again, or after the session has
    /// ended, does nothing.
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    /// True when both handles refer to the same run of a session.
    pub fn same_session(&self, other: &SessionHandle) -> bool {
        self.stop_tx.same_channel(&other.stop_tx)
    }

    pub fn is_finished(&self) -> bool {
        self.stop_tx.is_closed()
    }

    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.outcome_rx.borrow().clone()
    }

    /// Resolves once the session has completed, failed or been stopped.
    pub async fn wait(&self) -> SessionOutcome {
        let mut outcome_rx = self.outcome_rx.clone();
        let outcome = match outcome_rx.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => outcome.clone().unwrap_or(SessionOutcome::Stopped),
            Err(_) => self.outcome().unwrap_or(SessionOutcome::Stopped),
        };
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_ratio_without_descriptor_is_zero() {
        let mut event = ProgressEvent::initial(ContentId([0; 20]));
        assert_eq!(event.completion_ratio(), 0.0);
        event.total_pieces = 4;
        event.owned_pieces = 1;
        assert_eq!(event.completion_ratio(), 0.25);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_wait_sees_outcome() {
        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        let (progress_tx, _) = broadcast::channel(4);
        let (_snapshot_tx, snapshot_rx) = watch::channel(ProgressEvent::initial(ContentId([0; 20])));
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let handle = SessionHandle::new(
            ContentId([0; 20]),
            SessionRole::Download,
            stop_tx,
            progress_tx,
            snapshot_rx,
            outcome_rx,
        );

        handle.stop();
        handle.stop();
        assert!(stop_rx.recv().await.is_some());
        assert!(stop_rx.try_recv().is_err());

        outcome_tx.send_replace(Some(SessionOutcome::Stopped));
        drop(stop_rx);
        assert!(matches!(handle.wait().await, SessionOutcome::Stopped));
        assert!(handle.is_finished());
        handle.stop();
    }
}
