// SPDX-FileCopyrightText: 2025 The seedlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::time::{Duration, Instant};

const SMOOTHING_PERIOD_MS: f64 = 5000.0;

/// One observation of a session's progress.
#[derive(Debug, Clone, Copy)]
pub struct ProgressSample {
    pub bytes_transferred: u64,
    pub at: Instant,
}

/// Wall-clock breakdown of a finished transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferSummary {
    /// Start to completion.
    pub total: Duration,
    /// First byte to completion.
    pub transfer: Duration,
    /// Start to first byte.
    pub idle: Duration,
}

/// Pure aggregation over progress samples. Performs no I/O and never reads
/// the clock itself.
#[derive(Debug, Clone)]
pub struct TransferAccounting {
    started_at: Instant,
    first_byte_at: Option<Instant>,
    completed_at: Option<Instant>,
    last_sample: Option<ProgressSample>,
    throughput_bps: f64,
}

impl TransferAccounting {
    pub fn new(started_at: Instant) -> Self {
        Self {
            started_at,
            first_byte_at: None,
            completed_at: None,
            last_sample: None,
            throughput_bps: 0.0,
        }
    }

    pub fn record(&mut self, sample: ProgressSample) {
        if self.first_byte_at.is_none() && sample.bytes_transferred > 0 {
            self.first_byte_at = Some(sample.at);
        }

        let Some(previous) = self.last_sample else {
            self.last_sample = Some(sample);
            return;
        };

        let dt = sample.at.saturating_duration_since(previous.at);
        let dt_ms = dt.as_secs_f64() * 1000.0;
        if dt_ms <= 0.0 {
            // Fold same-instant samples into the next interval.
            return;
        }

        let delta = sample
            .bytes_transferred
            .saturating_sub(previous.bytes_transferred);
        let instant_bps = delta as f64 / dt.as_secs_f64();
        let alpha = 1.0 - (-dt_ms / SMOOTHING_PERIOD_MS).exp();
        self.throughput_bps = instant_bps * alpha + self.throughput_bps * (1.0 - alpha);

        let mut latest = sample;
        latest.bytes_transferred = sample.bytes_transferred.max(previous.bytes_transferred);
        self.last_sample = Some(latest);
    }

    pub fn mark_completed(&mut self, at: Instant) {
        if self.completed_at.is_none() {
            self.completed_at = Some(at);
        }
    }

    pub fn throughput_bps(&self) -> f64 {
        self.throughput_bps
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }

    pub fn elapsed_since_first_byte(&self, now: Instant) -> Option<Duration> {
        self.first_byte_at
            .map(|first| now.saturating_duration_since(first))
    }

    pub fn summary(&self) -> Option<TransferSummary> {
        let completed = self.completed_at?;
        let first = self.first_byte_at.unwrap_or(completed);
        Some(TransferSummary {
            total: completed.saturating_duration_since(self.started_at),
            transfer: completed.saturating_duration_since(first),
            idle: first.saturating_duration_since(self.started_at),
        })
    }
}
