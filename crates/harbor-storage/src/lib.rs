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

//! Generation-based versioned file store.
//!
//! The store lives in one local directory. Every committed write transaction
//! advances a monotonically increasing generation; readers pin a generation
//! at begin and keep a consistent view of the whole store until their handle
//! is released, backed by per-commit redirection snapshots of displaced
//! content. Commits are crash-safe through a journal that is fsynced before
//! any destination mutation and replayed idempotently at startup.

pub mod journal;
pub mod names;
mod store;

pub use store::{ReadHandle, Storage, WriteHandle};
