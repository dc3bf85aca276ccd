//! Per-socket connection task.
//!
//! After the handshake the task loops, racing the next inbound frame (with
//! the dead-peer timeout) against the connection's push channel. Frame bytes
//! for file content stream outside frames, so WRITE_FILE must drain its
//! announced bytes even when the operation is rejected, or the stream would
//! desynchronize.

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use harbor_proto::frame::{write_frame, FrameReader};
use harbor_proto::handshake;
use harbor_proto::opcode::{Opcode, ReplyStatus};
use harbor_proto::packet::{Fields, PacketBuf};
use harbor_types::{
    ArchiveError, ConnectionId, ErrorCode, IntentUid, ProtocolError, TimeRange,
};

use crate::controller::{Controller, Push};
use crate::notify::QueuedNotification;
use crate::transaction::{LockAttempt, Transaction};

/// Entry point for one accepted client socket.
pub async fn serve(controller: Controller, stream: TcpStream) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    if let Err(err) = run(&controller, stream).await {
        warn!(%peer, code = err.code(), %err, "connection failed");
    }
}

async fn run(controller: &Controller, stream: TcpStream) -> Result<(), ProtocolError> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let mut writer = write_half;

    let name = handshake::accept(&mut reader, &mut writer).await?;
    let (id, _slot, mut pushes) = controller.register(&name);

    let mut session = Session {
        controller: controller.clone(),
        id,
        txn: None,
        next_delivery: 1,
        next_intent: 1,
    };
    let result = session
        .run_loop(&mut reader, &mut writer, &mut pushes)
        .await;

    if let Some(txn) = session.txn.take() {
        warn!(%id, "connection ended with an open transaction; aborting it");
        txn.abort();
    }
    controller.deregister(id);
    info!(%id, %name, "connection closed");
    result
}

struct Session {
    controller: Controller,
    id: ConnectionId,
    txn: Option<Transaction>,
    next_delivery: u64,
    next_intent: u64,
}

/// What the dispatch of one frame decided about the loop.
enum Flow {
    Continue,
    Close,
}

impl Session {
    async fn run_loop(
        &mut self,
        reader: &mut FrameReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
        pushes: &mut mpsc::UnboundedReceiver<Push>,
    ) -> Result<(), ProtocolError> {
        let read_timeout = self.controller.read_timeout();
        loop {
            tokio::select! {
                frame = timeout(read_timeout, reader.next_frame()) => {
                    match frame {
                        Err(_) => {
                            warn!(id = %self.id, "no frame within the dead-peer timeout");
                            return Ok(());
                        }
                        Ok(Ok(None)) => return Ok(()),
                        Ok(Ok(Some(payload))) => {
                            match self.handle_frame(payload, reader, writer).await? {
                                Flow::Continue => {}
                                Flow::Close => return Ok(()),
                            }
                        }
                        Ok(Err(err)) => return Err(err),
                    }
                }
                push = pushes.recv() => {
                    match push {
                        None | Some(Push::Close) => {
                            debug!(id = %self.id, "close requested");
                            return Ok(());
                        }
                        Some(Push::Notification(queued)) => {
                            self.push_notification(writer, queued).await?;
                        }
                        Some(Push::IntentHit { key, range }) => {
                            let frame = PacketBuf::new(Opcode::IntentHit)
                                .string(&key)
                                .i64(range.start)
                                .i64(range.end)
                                .freeze();
                            write_frame(writer, &frame).await?;
                            writer.flush().await?;
                        }
                    }
                }
            }
        }
    }

    /// Writes one queued notification to the socket and moves its book entry
    /// from awaiting-send to awaiting-ack under a fresh delivery id.
    async fn push_notification(
        &mut self,
        writer: &mut OwnedWriteHalf,
        queued: QueuedNotification,
    ) -> Result<(), ProtocolError> {
        let delivery_id = self.next_delivery;
        self.next_delivery += 1;
        let range = queued.range();
        let frame = PacketBuf::new(Opcode::NotificationReceived)
            .u64(delivery_id)
            .string(queued.key())
            .i64(range.start)
            .i64(range.end)
            .freeze();
        write_frame(writer, &frame).await?;
        writer.flush().await?;
        self.controller
            .dispatch()
            .mark_delivered(self.id, delivery_id, &queued);
        Ok(())
    }

    async fn handle_frame(
        &mut self,
        payload: Bytes,
        reader: &mut FrameReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
    ) -> Result<Flow, ProtocolError> {
        let (opcode, mut fields) = Fields::new(payload)?;
        debug!(id = %self.id, ?opcode, "request");
        match opcode {
            Opcode::Heartbeat => {
                fields.finish()?;
                self.reply(writer, ok_reply(opcode).freeze()).await?;
            }
            Opcode::Close => {
                fields.finish()?;
                self.reply(writer, ok_reply(opcode).freeze()).await?;
                return Ok(Flow::Close);
            }
            Opcode::TransactionBegin => {
                let write = fields.u8()? != 0;
                fields.finish()?;
                let reply = if self.txn.is_some() {
                    error_reply(opcode, &ArchiveError::TransactionActive)
                } else {
                    match self.controller.begin_transaction(self.id, write) {
                        Ok(txn) => {
                            self.txn = Some(txn);
                            ok_reply(opcode).freeze()
                        }
                        Err(err) => error_reply(opcode, &err),
                    }
                };
                self.reply(writer, reply).await?;
            }
            Opcode::TransactionCommit => {
                fields.finish()?;
                let reply = match self.txn.take() {
                    None => error_reply(opcode, &ArchiveError::TransactionRequired),
                    Some(txn) => {
                        let controller = self.controller.clone();
                        let outcome = txn
                            .commit(|conn, queued| {
                                controller.push(conn, Push::Notification(queued))
                            })
                            .await;
                        match outcome {
                            Ok(_) => ok_reply(opcode).freeze(),
                            Err(err) => error_reply(opcode, &err),
                        }
                    }
                };
                self.reply(writer, reply).await?;
            }
            Opcode::TransactionAbort => {
                fields.finish()?;
                let reply = match self.txn.take() {
                    None => error_reply(opcode, &ArchiveError::TransactionRequired),
                    Some(txn) => {
                        txn.abort();
                        ok_reply(opcode).freeze()
                    }
                };
                self.reply(writer, reply).await?;
            }
            Opcode::SetTransactionStatus => {
                let status = fields.string()?;
                fields.finish()?;
                let reply = match self.txn.as_ref() {
                    None => error_reply(opcode, &ArchiveError::TransactionRequired),
                    Some(txn) => {
                        txn.set_status(&status);
                        ok_reply(opcode).freeze()
                    }
                };
                self.reply(writer, reply).await?;
            }
            Opcode::ReadFile => {
                let name = fields.string()?;
                fields.finish()?;
                let opened = match self.txn.as_ref() {
                    None => Err(ArchiveError::TransactionRequired),
                    Some(txn) => txn.read_file(&name),
                };
                match opened {
                    Ok((file, len)) => {
                        self.reply(writer, ok_reply(opcode).u64(len).freeze()).await?;
                        // Content streams raw behind the reply frame.
                        let mut file = tokio::fs::File::from_std(file).take(len);
                        tokio::io::copy(&mut file, writer).await?;
                        writer.flush().await?;
                    }
                    Err(err) => self.reply(writer, error_reply(opcode, &err)).await?,
                }
            }
            Opcode::WriteFile => {
                let name = fields.string()?;
                let size = fields.u64()?;
                fields.finish()?;
                self.write_file(reader, writer, &name, size).await?;
            }
            Opcode::RemoveFile => {
                let name = fields.string()?;
                fields.finish()?;
                let reply = match self.txn.as_mut() {
                    None => error_reply(opcode, &ArchiveError::TransactionRequired),
                    Some(txn) => match txn.remove_file(&name) {
                        Ok(()) => ok_reply(opcode).freeze(),
                        Err(err) => error_reply(opcode, &err),
                    },
                };
                self.reply(writer, reply).await?;
            }
            Opcode::LockRead => {
                let key = fields.string()?;
                let range = read_range(&mut fields)?;
                fields.finish()?;
                let attempt = match self.txn.as_mut() {
                    None => Err(ArchiveError::TransactionRequired),
                    Some(txn) => Ok(txn.lock_read(&key, range)),
                };
                self.reply_lock(writer, opcode, &key, range, attempt).await?;
            }
            Opcode::LockWrite => {
                let key = fields.string()?;
                let range = read_range(&mut fields)?;
                fields.finish()?;
                let attempt = match self.txn.as_mut() {
                    None => Err(ArchiveError::TransactionRequired),
                    Some(txn) => txn.lock_write(&key, range),
                };
                self.reply_lock(writer, opcode, &key, range, attempt).await?;
            }
            Opcode::SendNotification => {
                let key = fields.string()?;
                let range = read_range(&mut fields)?;
                fields.finish()?;
                let reply = match self.txn.as_mut() {
                    None => error_reply(opcode, &ArchiveError::TransactionRequired),
                    Some(txn) => match txn.send_notification(&key, range) {
                        Ok(()) => ok_reply(opcode).freeze(),
                        Err(err) => error_reply(opcode, &err),
                    },
                };
                self.reply(writer, reply).await?;
            }
            Opcode::ListenNotification => {
                let key = fields.string()?;
                let _flag = fields.u8()?;
                fields.finish()?;
                self.controller.dispatch().listen(self.id, &key);
                self.reply(writer, ok_reply(opcode).freeze()).await?;
            }
            Opcode::AcknowledgeNotification => {
                let delivery_id = fields.u64()?;
                fields.finish()?;
                let reply = if self.controller.dispatch().acknowledge(self.id, delivery_id) {
                    ok_reply(opcode).freeze()
                } else {
                    error_reply(opcode, &ArchiveError::UnknownDelivery(delivery_id))
                };
                self.reply(writer, reply).await?;
            }
            Opcode::AcquireIntent => {
                let key = fields.string()?;
                let range = read_range(&mut fields)?;
                let immediate = fields.u8()? != 0;
                fields.finish()?;
                let reply = match self.txn.as_mut() {
                    None => error_reply(opcode, &ArchiveError::TransactionRequired),
                    Some(txn) => {
                        let uid = IntentUid(self.next_intent);
                        match txn.acquire_intent(uid, &key, range, immediate) {
                            Ok(()) => {
                                self.next_intent += 1;
                                ok_reply(opcode).u64(uid.0).freeze()
                            }
                            Err(err) => error_reply(opcode, &err),
                        }
                    }
                };
                self.reply(writer, reply).await?;
            }
            Opcode::ReleaseIntent => {
                let uid = IntentUid(fields.u64()?);
                let immediate = fields.u8()? != 0;
                fields.finish()?;
                let reply = match self.txn.as_mut() {
                    None => error_reply(opcode, &ArchiveError::TransactionRequired),
                    Some(txn) => match txn.release_intent(uid, immediate) {
                        Ok(()) => ok_reply(opcode).freeze(),
                        Err(err) => error_reply(opcode, &err),
                    },
                };
                self.reply(writer, reply).await?;
            }
            Opcode::ListFiles => {
                let path = fields.string()?;
                let modified_after = fields.f64()?;
                fields.finish()?;
                let reply = match self.controller.storage().list_files(&path, modified_after) {
                    Ok(listed) => {
                        let mut packet =
                            ok_reply(Opcode::ListResult).u32(listed.len() as u32);
                        for (name, mtime) in &listed {
                            packet = packet.string(name).f64(*mtime);
                        }
                        packet.freeze()
                    }
                    Err(err) => error_reply(opcode, &err),
                };
                self.reply(writer, reply).await?;
            }
            Opcode::ListResult | Opcode::NotificationReceived | Opcode::IntentHit => {
                // Server-to-client opcodes are not valid requests.
                return Err(ProtocolError::UnknownOpcode(opcode as u8));
            }
        }
        Ok(Flow::Continue)
    }

    /// WRITE_FILE: the frame announced `size` raw bytes that follow it.
    /// When staging fails the bytes are drained to keep the stream aligned.
    async fn write_file(
        &mut self,
        reader: &mut FrameReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
        name: &str,
        size: u64,
    ) -> Result<(), ProtocolError> {
        let staged = match self.txn.as_mut() {
            None => Err(ArchiveError::TransactionRequired),
            Some(txn) => txn.stage_write(name),
        };
        let outcome = match staged {
            Ok(path) => {
                let written = match tokio::fs::File::create(&path).await {
                    Ok(mut file) => {
                        reader.copy_raw(&mut file, size).await?;
                        file.flush().await.map_err(ArchiveError::Io)
                    }
                    Err(err) => {
                        reader.copy_raw(&mut tokio::io::sink(), size).await?;
                        Err(ArchiveError::Io(err))
                    }
                };
                if written.is_err() {
                    // A staged action without its content would make the
                    // eventual commit journal a rename with no source.
                    if let Some(txn) = self.txn.as_mut() {
                        if let Err(err) = txn.unstage_write(name) {
                            warn!(id = %self.id, name, %err, "failed to discard staged write");
                        }
                    }
                }
                written
            }
            Err(err) => {
                reader.copy_raw(&mut tokio::io::sink(), size).await?;
                Err(err)
            }
        };
        let reply = match outcome {
            Ok(()) => ok_reply(Opcode::WriteFile).freeze(),
            Err(err) => error_reply(Opcode::WriteFile, &err),
        };
        self.reply(writer, reply).await
    }

    async fn reply_lock(
        &mut self,
        writer: &mut OwnedWriteHalf,
        opcode: Opcode,
        key: &str,
        range: TimeRange,
        attempt: Result<LockAttempt, ArchiveError>,
    ) -> Result<(), ProtocolError> {
        let outcome: Result<(), ArchiveError> = match attempt {
            Ok(LockAttempt::Granted) => Ok(()),
            Ok(LockAttempt::DeniedByLock(origin)) => {
                debug!(id = %self.id, %origin, key, "lock denied");
                Err(ArchiveError::LockDenied {
                    origin,
                    status: self.controller.status_of(origin),
                })
            }
            Ok(LockAttempt::DeniedByIntent(origins)) => {
                for origin in &origins {
                    self.controller.push(
                        *origin,
                        Push::IntentHit {
                            key: key.to_string(),
                            range,
                        },
                    );
                }
                debug!(id = %self.id, key, "lock denied by intent");
                let origin = origins.first().copied().unwrap_or(self.id);
                Err(ArchiveError::IntentDenied {
                    origin,
                    status: self.controller.status_of(origin),
                })
            }
            Err(err) => Err(err),
        };
        let reply = match outcome {
            Ok(()) => ok_reply(opcode).freeze(),
            Err(err) => failure_reply(opcode, &err),
        };
        self.reply(writer, reply).await
    }

    async fn reply(
        &mut self,
        writer: &mut OwnedWriteHalf,
        payload: Bytes,
    ) -> Result<(), ProtocolError> {
        write_frame(writer, &payload).await?;
        writer.flush().await?;
        Ok(())
    }
}

fn read_range(fields: &mut Fields) -> Result<TimeRange, ProtocolError> {
    let start = fields.i64()?;
    let end = fields.i64()?;
    Ok(TimeRange::new(start, end))
}

fn ok_reply(opcode: Opcode) -> PacketBuf {
    PacketBuf::new(opcode).u8(ReplyStatus::Ok as u8)
}

/// DENIED for the retryable denial variants, ERROR for everything else.
fn failure_reply(opcode: Opcode, err: &ArchiveError) -> Bytes {
    match err.denial_status() {
        Some(status) => PacketBuf::new(opcode)
            .u8(ReplyStatus::Denied as u8)
            .string(status)
            .freeze(),
        None => error_reply(opcode, err),
    }
}

fn error_reply(opcode: Opcode, err: &ArchiveError) -> Bytes {
    PacketBuf::new(opcode)
        .u8(ReplyStatus::Error as u8)
        .string(&format!("{}: {err}", err.code()))
        .freeze()
}
