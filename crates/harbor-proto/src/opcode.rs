//! Packet opcodes and reply status codes.

use harbor_types::ProtocolError;

/// Client request opcodes. Server replies mirror the request opcode; the
/// trailing variants are server-only (list results and unsolicited pushes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Heartbeat = 0,
    Close = 1,
    TransactionBegin = 2,
    TransactionCommit = 3,
    TransactionAbort = 4,
    SetTransactionStatus = 5,
    ReadFile = 6,
    WriteFile = 7,
    RemoveFile = 8,
    LockRead = 9,
    LockWrite = 10,
    SendNotification = 11,
    ListenNotification = 12,
    AcknowledgeNotification = 13,
    AcquireIntent = 14,
    ReleaseIntent = 15,
    ListFiles = 16,
    ListResult = 17,
    /// Unsolicited push: a notification was dispatched on a listened key.
    NotificationReceived = 18,
    /// Unsolicited push: another party is about to request a conflicting lock.
    IntentHit = 19,
}

impl TryFrom<u8> for Opcode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            0 => Self::Heartbeat,
            1 => Self::Close,
            2 => Self::TransactionBegin,
            3 => Self::TransactionCommit,
            4 => Self::TransactionAbort,
            5 => Self::SetTransactionStatus,
            6 => Self::ReadFile,
            7 => Self::WriteFile,
            8 => Self::RemoveFile,
            9 => Self::LockRead,
            10 => Self::LockWrite,
            11 => Self::SendNotification,
            12 => Self::ListenNotification,
            13 => Self::AcknowledgeNotification,
            14 => Self::AcquireIntent,
            15 => Self::ReleaseIntent,
            16 => Self::ListFiles,
            17 => Self::ListResult,
            18 => Self::NotificationReceived,
            19 => Self::IntentHit,
            other => return Err(ProtocolError::UnknownOpcode(other)),
        })
    }
}

/// Status byte leading every reply payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyStatus {
    /// The operation succeeded; opcode-specific payload follows.
    Ok = 0,
    /// Expected denial (lock/intent conflict); a diagnostic string follows.
    Denied = 1,
    /// Hard failure; a diagnostic string follows.
    Error = 2,
}

impl TryFrom<u8> for ReplyStatus {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            0 => Self::Ok,
            1 => Self::Denied,
            2 => Self::Error,
            other => {
                return Err(ProtocolError::Malformed(format!(
                    "invalid reply status {other}"
                )))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_round_trip() {
        for raw in 0u8..=19 {
            let op = Opcode::try_from(raw).unwrap();
            assert_eq!(op as u8, raw);
        }
        assert!(Opcode::try_from(20).is_err());
    }

    #[test]
    fn status_rejects_unknown() {
        assert!(ReplyStatus::try_from(3).is_err());
        assert_eq!(ReplyStatus::try_from(1).unwrap(), ReplyStatus::Denied);
    }
}
