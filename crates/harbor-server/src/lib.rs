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

//! The Harbor archive server.
//!
//! One tokio task per client connection; all coordination state (interval
//! locks, declared intents, notification books, transaction registry) lives
//! behind `parking_lot` mutexes that are never held across an await. The
//! storage engine does the durable work; this crate arranges who may touch
//! which key range when, and who hears about it afterwards.

pub mod connection;
pub mod controller;
pub mod diagnostics;
pub mod intent;
pub mod locker;
pub mod notify;
pub mod telemetry;
pub mod transaction;

pub use controller::{run, start, Controller, RunningServer};
