#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::unimplemented,
        clippy::todo,
        clippy::indexing_slicing
    )
)]

//! Core data structures shared by every Harbor crate: generation and range
//! types, connection identifiers, the error taxonomy, and server
//! configuration.

pub mod config;
pub mod error;
pub mod ids;

pub use config::ServerConfig;
pub use error::{ArchiveError, ErrorCode, ProtocolError};
pub use ids::{ConnectionId, Generation, HolderId, IntentUid, TimeRange};
