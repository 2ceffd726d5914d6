// SPDX-FileCopyrightText: 2025 The seedlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod accounting;
pub mod cli;
pub mod command;
pub mod config;
pub mod content;
pub mod discovery;
pub mod engine;
pub mod errors;
pub mod link;
pub mod networking;
pub mod session;
pub mod storage;
pub mod token_bucket;

pub use engine::{Engine, SeedSource, Seeding};
pub use errors::EngineError;
pub use link::ShareLink;
pub use session::{ProgressEvent, SessionHandle, SessionOutcome, TransferState};
