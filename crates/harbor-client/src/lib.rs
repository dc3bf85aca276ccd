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

//! Async client for the Harbor archive.
//!
//! One `ArchiveClient` owns one connection. Requests are strictly
//! sequential; unsolicited pushes (notifications, intent hits) arriving
//! while a reply is awaited are stashed and surface through `next_event` or
//! `recv_event`. The server drops connections that stay silent past its
//! dead-peer timeout, so idle holders call `heartbeat` periodically.

use bytes::Bytes;
use std::collections::VecDeque;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

use harbor_proto::frame::{write_frame, FrameReader};
use harbor_proto::handshake;
use harbor_proto::opcode::{Opcode, ReplyStatus};
use harbor_proto::packet::{Fields, PacketBuf};
use harbor_types::{ProtocolError, TimeRange};

/// Client-side failure.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The connection violated the protocol and is unusable.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The server rejected the operation.
    #[error("server error: {0}")]
    Remote(String),
    /// The server denied an operation that is not retryable as a denial.
    #[error("denied: {0}")]
    Denied(String),
}

/// An unsolicited server push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A notification on a listened key. Must be acknowledged with its
    /// delivery id; the sending transaction's commit waits on it.
    Notification {
        id: u64,
        key: String,
        range: TimeRange,
    },
    /// Another connection wants a lock overlapping one of our intents.
    IntentHit { key: String, range: TimeRange },
}

/// Outcome of a lock request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Granted,
    /// Blocked; carries the blocking party's transaction status.
    Denied { status: String },
}

enum Reply {
    Ok(Opcode, Fields),
    Denied(String),
}

pub struct ArchiveClient {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    events: VecDeque<ClientEvent>,
}

impl ArchiveClient {
    /// Connects and performs the handshake, announcing `name` as this
    /// client's display name.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        name: &str,
    ) -> Result<ArchiveClient, ClientError> {
        let stream = TcpStream::connect(addr).await.map_err(ProtocolError::Io)?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let mut writer = write_half;
        handshake::connect(&mut reader, &mut writer, name).await?;
        debug!(name, "connected");
        Ok(ArchiveClient {
            reader,
            writer,
            events: VecDeque::new(),
        })
    }

    /// Pops a stashed push without touching the socket.
    pub fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.pop_front()
    }

    /// Waits for the next push, reading frames until one arrives.
    pub async fn recv_event(&mut self) -> Result<ClientEvent, ClientError> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Ok(event);
            }
            let frame = self
                .reader
                .next_frame()
                .await?
                .ok_or(ProtocolError::UnexpectedEof)?;
            self.stash_or_reject(frame)?;
        }
    }

    fn stash_or_reject(&mut self, frame: Bytes) -> Result<(), ClientError> {
        let (opcode, fields) = Fields::new(frame)?;
        if self.try_stash(opcode, fields)?.is_some() {
            return Err(ProtocolError::UnexpectedReply(opcode as u8).into());
        }
        Ok(())
    }

    /// Stashes push frames; hands reply frames back to the caller.
    fn try_stash(
        &mut self,
        opcode: Opcode,
        mut fields: Fields,
    ) -> Result<Option<Fields>, ClientError> {
        match opcode {
            Opcode::NotificationReceived => {
                let id = fields.u64()?;
                let key = fields.string()?;
                let range = TimeRange::new(fields.i64()?, fields.i64()?);
                fields.finish()?;
                self.events
                    .push_back(ClientEvent::Notification { id, key, range });
                Ok(None)
            }
            Opcode::IntentHit => {
                let key = fields.string()?;
                let range = TimeRange::new(fields.i64()?, fields.i64()?);
                fields.finish()?;
                self.events.push_back(ClientEvent::IntentHit { key, range });
                Ok(None)
            }
            _ => Ok(Some(fields)),
        }
    }

    /// Sends one request frame and reads frames until its reply, stashing
    /// pushes. `accept` lists the opcodes a reply may carry.
    async fn request(&mut self, payload: Bytes, accept: &[Opcode]) -> Result<Reply, ClientError> {
        write_frame(&mut self.writer, &payload).await?;
        self.writer.flush().await.map_err(ProtocolError::Io)?;
        loop {
            let frame = self
                .reader
                .next_frame()
                .await?
                .ok_or(ProtocolError::UnexpectedEof)?;
            let (opcode, fields) = Fields::new(frame)?;
            let Some(mut fields) = self.try_stash(opcode, fields)? else {
                continue;
            };
            if !accept.contains(&opcode) {
                return Err(ProtocolError::UnexpectedReply(opcode as u8).into());
            }
            let status = ReplyStatus::try_from(fields.u8()?)?;
            return match status {
                ReplyStatus::Ok => Ok(Reply::Ok(opcode, fields)),
                ReplyStatus::Denied => {
                    let status = fields.string()?;
                    fields.finish()?;
                    Ok(Reply::Denied(status))
                }
                ReplyStatus::Error => {
                    let message = fields.string()?;
                    fields.finish()?;
                    Err(ClientError::Remote(message))
                }
            };
        }
    }

    /// Like `request`, but any denial is an error.
    async fn request_ok(&mut self, payload: Bytes, expect: Opcode) -> Result<Fields, ClientError> {
        match self.request(payload, &[expect]).await? {
            Reply::Ok(_, fields) => Ok(fields),
            Reply::Denied(status) => Err(ClientError::Denied(status)),
        }
    }

    async fn simple(&mut self, opcode: Opcode) -> Result<(), ClientError> {
        let fields = self
            .request_ok(PacketBuf::new(opcode).freeze(), opcode)
            .await?;
        fields.finish()?;
        Ok(())
    }

    /// Keeps an idle connection ahead of the server's dead-peer timeout.
    pub async fn heartbeat(&mut self) -> Result<(), ClientError> {
        self.simple(Opcode::Heartbeat).await
    }

    /// Orderly shutdown; the connection is unusable afterwards.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.simple(Opcode::Close).await
    }

    /// Opens a transaction: read (`write == false`) or write.
    pub async fn begin(&mut self, write: bool) -> Result<(), ClientError> {
        let payload = PacketBuf::new(Opcode::TransactionBegin)
            .u8(u8::from(write))
            .freeze();
        let fields = self.request_ok(payload, Opcode::TransactionBegin).await?;
        fields.finish()?;
        Ok(())
    }

    /// Commits the open transaction. For a write transaction this returns
    /// only after every notified listener has acknowledged or disconnected.
    pub async fn commit(&mut self) -> Result<(), ClientError> {
        self.simple(Opcode::TransactionCommit).await
    }

    pub async fn abort(&mut self) -> Result<(), ClientError> {
        self.simple(Opcode::TransactionAbort).await
    }

    /// Sets the transaction status string other parties see in denials and
    /// diagnostics.
    pub async fn set_status(&mut self, status: &str) -> Result<(), ClientError> {
        let payload = PacketBuf::new(Opcode::SetTransactionStatus)
            .string(status)
            .freeze();
        let fields = self
            .request_ok(payload, Opcode::SetTransactionStatus)
            .await?;
        fields.finish()?;
        Ok(())
    }

    /// Reads a whole file at the transaction's pinned generation.
    pub async fn read_file(&mut self, name: &str) -> Result<Vec<u8>, ClientError> {
        let payload = PacketBuf::new(Opcode::ReadFile).string(name).freeze();
        let mut fields = self.request_ok(payload, Opcode::ReadFile).await?;
        let len = fields.u64()?;
        fields.finish()?;
        // Content streams raw behind the reply frame.
        Ok(self.reader.read_raw(len).await?)
    }

    /// Stages `content` under `name` in the open write transaction.
    pub async fn write_file(&mut self, name: &str, content: &[u8]) -> Result<(), ClientError> {
        let payload = PacketBuf::new(Opcode::WriteFile)
            .string(name)
            .u64(content.len() as u64)
            .freeze();
        write_frame(&mut self.writer, &payload).await?;
        self.writer
            .write_all(content)
            .await
            .map_err(ProtocolError::Io)?;
        self.writer.flush().await.map_err(ProtocolError::Io)?;
        loop {
            let frame = self
                .reader
                .next_frame()
                .await?
                .ok_or(ProtocolError::UnexpectedEof)?;
            let (opcode, fields) = Fields::new(frame)?;
            let Some(mut fields) = self.try_stash(opcode, fields)? else {
                continue;
            };
            if opcode != Opcode::WriteFile {
                return Err(ProtocolError::UnexpectedReply(opcode as u8).into());
            }
            return match ReplyStatus::try_from(fields.u8()?)? {
                ReplyStatus::Ok => {
                    fields.finish()?;
                    Ok(())
                }
                ReplyStatus::Denied => Err(ClientError::Denied(fields.string()?)),
                ReplyStatus::Error => Err(ClientError::Remote(fields.string()?)),
            };
        }
    }

    pub async fn remove_file(&mut self, name: &str) -> Result<(), ClientError> {
        let payload = PacketBuf::new(Opcode::RemoveFile).string(name).freeze();
        let fields = self.request_ok(payload, Opcode::RemoveFile).await?;
        fields.finish()?;
        Ok(())
    }

    async fn lock(
        &mut self,
        opcode: Opcode,
        key: &str,
        range: TimeRange,
    ) -> Result<LockOutcome, ClientError> {
        let payload = PacketBuf::new(opcode)
            .string(key)
            .i64(range.start)
            .i64(range.end)
            .freeze();
        match self.request(payload, &[opcode]).await? {
            Reply::Ok(_, fields) => {
                fields.finish()?;
                Ok(LockOutcome::Granted)
            }
            Reply::Denied(status) => Ok(LockOutcome::Denied { status }),
        }
    }

    /// Requests a read lock. A denial is an expected outcome the caller
    /// retries, not an error.
    pub async fn lock_read(
        &mut self,
        key: &str,
        range: TimeRange,
    ) -> Result<LockOutcome, ClientError> {
        self.lock(Opcode::LockRead, key, range).await
    }

    pub async fn lock_write(
        &mut self,
        key: &str,
        range: TimeRange,
    ) -> Result<LockOutcome, ClientError> {
        self.lock(Opcode::LockWrite, key, range).await
    }

    /// Queues a notification; it is delivered when the transaction commits.
    pub async fn send_notification(
        &mut self,
        key: &str,
        range: TimeRange,
    ) -> Result<(), ClientError> {
        let payload = PacketBuf::new(Opcode::SendNotification)
            .string(key)
            .i64(range.start)
            .i64(range.end)
            .freeze();
        let fields = self.request_ok(payload, Opcode::SendNotification).await?;
        fields.finish()?;
        Ok(())
    }

    /// Registers this connection as a listener on `key`.
    pub async fn listen(&mut self, key: &str) -> Result<(), ClientError> {
        let payload = PacketBuf::new(Opcode::ListenNotification)
            .string(key)
            .u8(0)
            .freeze();
        let fields = self.request_ok(payload, Opcode::ListenNotification).await?;
        fields.finish()?;
        Ok(())
    }

    /// Acknowledges a delivered notification by its delivery id.
    pub async fn acknowledge(&mut self, delivery_id: u64) -> Result<(), ClientError> {
        let payload = PacketBuf::new(Opcode::AcknowledgeNotification)
            .u64(delivery_id)
            .freeze();
        let fields = self
            .request_ok(payload, Opcode::AcknowledgeNotification)
            .await?;
        fields.finish()?;
        Ok(())
    }

    /// Declares a write intent; returns the server-assigned intent uid.
    /// Immediate intents register right away; staged ones take effect when
    /// the write transaction commits.
    pub async fn acquire_intent(
        &mut self,
        key: &str,
        range: TimeRange,
        immediate: bool,
    ) -> Result<u64, ClientError> {
        let payload = PacketBuf::new(Opcode::AcquireIntent)
            .string(key)
            .i64(range.start)
            .i64(range.end)
            .u8(u8::from(immediate))
            .freeze();
        let mut fields = self.request_ok(payload, Opcode::AcquireIntent).await?;
        let uid = fields.u64()?;
        fields.finish()?;
        Ok(uid)
    }

    pub async fn release_intent(&mut self, uid: u64, immediate: bool) -> Result<(), ClientError> {
        let payload = PacketBuf::new(Opcode::ReleaseIntent)
            .u64(uid)
            .u8(u8::from(immediate))
            .freeze();
        let fields = self.request_ok(payload, Opcode::ReleaseIntent).await?;
        fields.finish()?;
        Ok(())
    }

    /// Lists regular files under `path` with mtime strictly greater than
    /// `modified_after`, as (relative path, mtime) pairs.
    pub async fn list_files(
        &mut self,
        path: &str,
        modified_after: f64,
    ) -> Result<Vec<(String, f64)>, ClientError> {
        let payload = PacketBuf::new(Opcode::ListFiles)
            .string(path)
            .f64(modified_after)
            .freeze();
        // Success replies arrive as LIST_RESULT; failures mirror the request.
        let reply = self
            .request(payload, &[Opcode::ListResult, Opcode::ListFiles])
            .await?;
        match reply {
            Reply::Ok(Opcode::ListResult, mut fields) => {
                let count = fields.u32()?;
                let mut out = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let name = fields.string()?;
                    let mtime = fields.f64()?;
                    out.push((name, mtime));
                }
                fields.finish()?;
                Ok(out)
            }
            Reply::Ok(opcode, _) => Err(ProtocolError::UnexpectedReply(opcode as u8).into()),
            Reply::Denied(status) => Err(ClientError::Denied(status)),
        }
    }
}
