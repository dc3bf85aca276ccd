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

//! Wire protocol for the Harbor archive.
//!
//! Everything on the wire is little-endian. After the handshake, traffic is
//! length-prefixed frames whose payload starts with a one-byte opcode; file
//! content is the one exception and streams as raw bytes directly behind its
//! announcing frame, so large files never sit in a frame buffer.

pub mod diag;
pub mod frame;
pub mod handshake;
pub mod opcode;
pub mod packet;

pub use frame::{write_frame, FrameReader, MAX_FRAME_LEN};
pub use opcode::{Opcode, ReplyStatus};
pub use packet::{Fields, PacketBuf};
