// SPDX-FileCopyrightText: 2025 The seedlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

struct BucketState {
    last_refill: Instant,
    /// May go negative: a consumer larger than the balance borrows against
    /// future refills and sleeps off the debt.
    balance: f64,
    rate: f64,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        // Burst is capped at one second worth of tokens.
        self.balance = (self.balance + elapsed.as_secs_f64() * self.rate).min(self.rate);
    }
}

/// Byte-rate limiter shared by every peer connection of the engine.
/// A rate of `0` means unlimited.
pub struct TokenBucket {
    unlimited: AtomicBool,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(bytes_per_second: u64) -> Self {
        let rate = bytes_per_second as f64;
        TokenBucket {
            unlimited: AtomicBool::new(bytes_per_second == 0),
            state: Mutex::new(BucketState {
                last_refill: Instant::now(),
                balance: rate,
                rate,
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn rate(&self) -> u64 {
        self.lock().rate as u64
    }

    pub fn set_rate(&self, bytes_per_second: u64) {
        let mut state = self.lock();
        state.rate = bytes_per_second as f64;
        state.balance = state.rate;
        state.last_refill = Instant::now();
        self.unlimited
            .store(bytes_per_second == 0, Ordering::Relaxed);
    }

    /// Spends `bytes` tokens, sleeping until the balance covers them.
    pub async fn acquire(&self, bytes: usize) {
        if bytes == 0 || self.unlimited.load(Ordering::Relaxed) {
            return;
        }

        let wait = {
            let mut state = self.lock();
            if state.rate <= 0.0 {
                return;
            }
            state.refill(Instant::now());
            state.balance -= bytes as f64;
            if state.balance >= 0.0 {
                return;
            }
            Duration::from_secs_f64(-state.balance / state.rate)
        };

        tokio::time::sleep(wait).await;
    }

    #[cfg(test)]
    fn balance(&self) -> f64 {
        self.lock().balance
    }
}
