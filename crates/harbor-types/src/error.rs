//! Error taxonomy for the Harbor archive.

use crate::ids::ConnectionId;
use thiserror::Error;

/// A trait for assigning a stable, machine-readable string code to an error.
pub trait ErrorCode {
    /// Returns the unique, stable string identifier for this error variant.
    fn code(&self) -> &'static str;
}

/// Wire protocol violations. Any of these tears the connection down; there
/// is no retry path.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The peer sent a handshake magic we do not recognize.
    #[error("bad handshake magic {0:#010x}")]
    BadMagic(u32),
    /// The peer speaks a protocol version we do not support.
    #[error("unsupported protocol version {0}")]
    BadVersion(u32),
    /// The packet opcode is not defined by the protocol.
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    /// The packet payload did not decode against its opcode's layout.
    #[error("malformed packet: {0}")]
    Malformed(String),
    /// A frame announced a length above the protocol limit.
    #[error("frame of {0} bytes exceeds the protocol limit")]
    FrameTooLarge(u32),
    /// A reply arrived with an opcode that does not match the request.
    #[error("unexpected reply opcode {0}")]
    UnexpectedReply(u8),
    /// The peer closed the stream mid-message.
    #[error("connection closed mid-message")]
    UnexpectedEof,
    /// Transport failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ErrorCode for ProtocolError {
    fn code(&self) -> &'static str {
        match self {
            Self::BadMagic(_) => "PROTO_BAD_MAGIC",
            Self::BadVersion(_) => "PROTO_BAD_VERSION",
            Self::UnknownOpcode(_) => "PROTO_UNKNOWN_OPCODE",
            Self::Malformed(_) => "PROTO_MALFORMED",
            Self::FrameTooLarge(_) => "PROTO_FRAME_TOO_LARGE",
            Self::UnexpectedReply(_) => "PROTO_UNEXPECTED_REPLY",
            Self::UnexpectedEof => "PROTO_UNEXPECTED_EOF",
            Self::Io(_) => "PROTO_IO",
        }
    }
}

/// Errors raised by archive operations. `LockDenied` and `IntentDenied` are
/// expected outcomes that the caller retries; the rest indicate a broken
/// caller (bad names, missing transaction, locking-discipline violations) or
/// an I/O failure.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// The file name failed normalization (absolute, empty, dot component,
    /// or missing directory component).
    #[error("invalid archive name {0:?}")]
    InvalidName(String),
    /// The named file does not exist at the requested generation.
    #[error("no such file {0:?}")]
    NotFound(String),
    /// Another open write transaction has already staged this name. The
    /// caller's locking is buggy; this is a hard failure, not a retry.
    #[error("{name:?} is staged by another open transaction (probable locking failure)")]
    StagedElsewhere {
        /// The contested file name.
        name: String,
    },
    /// The operation needs an active transaction.
    #[error("no transaction is active")]
    TransactionRequired,
    /// The operation needs an active *write* transaction.
    #[error("a write transaction is required")]
    WriteTransactionRequired,
    /// `TRANSACTION_BEGIN` while a transaction is already open.
    #[error("a transaction is already active")]
    TransactionActive,
    /// A lock request was blocked by another origin. Carries the blocker's
    /// current status string for diagnostics and back-pressure reporting.
    #[error("lock denied by {origin}: {status}")]
    LockDenied {
        /// The origin holding the conflicting lock.
        origin: ConnectionId,
        /// The blocker's transaction status string at denial time.
        status: String,
    },
    /// A lock request hit another origin's declared write intent. The
    /// intent holder has been pushed an intent hit; the caller retries.
    #[error("intent conflict with {origin}: {status}")]
    IntentDenied {
        /// The origin holding the conflicting intent.
        origin: ConnectionId,
        /// The intent holder's status string at denial time.
        status: String,
    },
    /// The acknowledged delivery id is not outstanding for this connection.
    #[error("unknown notification delivery id {0}")]
    UnknownDelivery(u64),
    /// An intent release named a uid this connection does not hold.
    #[error("unknown intent {0}")]
    UnknownIntent(crate::ids::IntentUid),
    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ErrorCode for ArchiveError {
    fn code(&self) -> &'static str {
        match self {
            Self::InvalidName(_) => "ARCHIVE_INVALID_NAME",
            Self::NotFound(_) => "ARCHIVE_NOT_FOUND",
            Self::StagedElsewhere { .. } => "ARCHIVE_STAGED_ELSEWHERE",
            Self::TransactionRequired => "ARCHIVE_TRANSACTION_REQUIRED",
            Self::WriteTransactionRequired => "ARCHIVE_WRITE_TRANSACTION_REQUIRED",
            Self::TransactionActive => "ARCHIVE_TRANSACTION_ACTIVE",
            Self::LockDenied { .. } => "ARCHIVE_LOCK_DENIED",
            Self::IntentDenied { .. } => "ARCHIVE_INTENT_DENIED",
            Self::UnknownDelivery(_) => "ARCHIVE_UNKNOWN_DELIVERY",
            Self::UnknownIntent(_) => "ARCHIVE_UNKNOWN_INTENT",
            Self::Io(_) => "ARCHIVE_IO",
        }
    }
}

impl ArchiveError {
    /// For the denial variants a client is expected to retry, the blocker's
    /// status string; `None` for hard failures. Replies are DENIED or ERROR
    /// accordingly.
    #[must_use]
    pub fn denial_status(&self) -> Option<&str> {
        match self {
            Self::LockDenied { status, .. } | Self::IntentDenied { status, .. } => Some(status),
            _ => None,
        }
    }
}
