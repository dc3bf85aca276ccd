//! Length-prefixed frame transport.
//!
//! `FrameReader` buffers incoming bytes and only ever consumes whole frames,
//! which makes `next_frame` safe to race inside `tokio::select!`: a
//! cancelled call leaves any partially received frame in the buffer.

use bytes::{Buf, Bytes, BytesMut};
use harbor_types::ProtocolError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a frame payload. File content streams outside frames, so
/// legitimate frames stay small.
pub const MAX_FRAME_LEN: u32 = 1 << 20;

/// Writes one `u32` length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    if payload.len() as u64 > u64::from(MAX_FRAME_LEN) {
        return Err(ProtocolError::FrameTooLarge(payload.len() as u32));
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    writer.write_all(payload).await?;
    Ok(())
}

/// Buffered reader over the inbound half of a connection.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        FrameReader {
            inner,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Reads until at least `n` buffered bytes are available.
    async fn fill_to(&mut self, n: usize) -> Result<(), ProtocolError> {
        while self.buf.len() < n {
            let read = self.inner.read_buf(&mut self.buf).await?;
            if read == 0 {
                return Err(ProtocolError::UnexpectedEof);
            }
        }
        Ok(())
    }

    /// Returns the next frame payload, or `None` on a clean end-of-stream at
    /// a frame boundary. Cancellation-safe.
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        loop {
            if let Some(head) = self.buf.get(..4) {
                let mut len_bytes = [0u8; 4];
                len_bytes.copy_from_slice(head);
                let len = u32::from_le_bytes(len_bytes);
                if len > MAX_FRAME_LEN {
                    return Err(ProtocolError::FrameTooLarge(len));
                }
                let total = 4 + len as usize;
                if self.buf.len() >= total {
                    self.buf.advance(4);
                    return Ok(Some(self.buf.split_to(len as usize).freeze()));
                }
            }
            let read = self.inner.read_buf(&mut self.buf).await?;
            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::UnexpectedEof);
            }
        }
    }

    /// Reads one raw little-endian `u32` (handshake fields are unframed).
    pub async fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        self.fill_to(4).await?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.buf.split_to(4));
        Ok(u32::from_le_bytes(raw))
    }

    /// Reads a raw length-prefixed string (handshake name field).
    pub async fn read_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_u32().await?;
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(len));
        }
        self.fill_to(len as usize).await?;
        let raw = self.buf.split_to(len as usize);
        String::from_utf8(raw.to_vec())
            .map_err(|_| ProtocolError::Malformed("handshake name is not valid UTF-8".into()))
    }

    /// Streams exactly `len` raw bytes (file content behind a frame) into
    /// `dest`. Not cancellation-safe; callers run it to completion.
    pub async fn copy_raw<W: AsyncWrite + Unpin>(
        &mut self,
        dest: &mut W,
        len: u64,
    ) -> Result<(), ProtocolError> {
        let mut remaining = len;
        while remaining > 0 {
            if self.buf.is_empty() {
                let read = self.inner.read_buf(&mut self.buf).await?;
                if read == 0 {
                    return Err(ProtocolError::UnexpectedEof);
                }
            }
            let take = self.buf.len().min(remaining as usize);
            let chunk = self.buf.split_to(take);
            dest.write_all(&chunk).await?;
            remaining -= take as u64;
        }
        Ok(())
    }

    /// Collects exactly `len` raw bytes into memory.
    pub async fn read_raw(&mut self, len: u64) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::with_capacity(len.min(1 << 20) as usize);
        let mut remaining = len;
        while remaining > 0 {
            if self.buf.is_empty() {
                let read = self.inner.read_buf(&mut self.buf).await?;
                if read == 0 {
                    return Err(ProtocolError::UnexpectedEof);
                }
            }
            let take = self.buf.len().min(remaining as usize);
            out.extend_from_slice(&self.buf.split_to(take));
            remaining -= take as u64;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip_over_a_buffer() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"first").await.unwrap();
        write_frame(&mut wire, b"").await.unwrap();
        write_frame(&mut wire, b"third frame").await.unwrap();

        let mut reader = FrameReader::new(wire.as_slice());
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), &b"first"[..]);
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), &b""[..]);
        assert_eq!(
            reader.next_frame().await.unwrap().unwrap(),
            &b"third frame"[..]
        );
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"complete").await.unwrap();
        wire.extend_from_slice(&20u32.to_le_bytes());
        wire.extend_from_slice(b"short");

        let mut reader = FrameReader::new(wire.as_slice());
        assert!(reader.next_frame().await.unwrap().is_some());
        assert!(matches!(
            reader.next_frame().await,
            Err(ProtocolError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn oversize_frame_rejected_before_buffering() {
        let wire = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        let mut reader = FrameReader::new(wire.as_slice());
        assert!(matches!(
            reader.next_frame().await,
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn raw_bytes_stream_behind_a_frame() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"header").await.unwrap();
        wire.extend_from_slice(&[7u8; 1000]);

        let mut reader = FrameReader::new(wire.as_slice());
        assert!(reader.next_frame().await.unwrap().is_some());
        let raw = reader.read_raw(1000).await.unwrap();
        assert_eq!(raw, vec![7u8; 1000]);
    }
}
