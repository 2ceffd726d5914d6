// SPDX-FileCopyrightText: 2025 The seedlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod connector;
pub mod protocol;
pub mod session;

// Re-export key types for easier access.
pub use connector::{connect_and_handshake, ConnectError};
pub use protocol::{BlockInfo, Handshake};
pub use session::{ConnectionType, PeerSession, PeerSessionParameters};
