//! Packet payload building and parsing.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use harbor_types::ProtocolError;

use crate::opcode::Opcode;

/// Builder for a packet payload (opcode plus little-endian fields).
#[derive(Debug)]
pub struct PacketBuf {
    buf: BytesMut,
}

impl PacketBuf {
    #[must_use]
    pub fn new(opcode: Opcode) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(opcode as u8);
        PacketBuf { buf }
    }

    #[must_use]
    pub fn u8(mut self, value: u8) -> Self {
        self.buf.put_u8(value);
        self
    }

    #[must_use]
    pub fn u32(mut self, value: u32) -> Self {
        self.buf.put_u32_le(value);
        self
    }

    #[must_use]
    pub fn u64(mut self, value: u64) -> Self {
        self.buf.put_u64_le(value);
        self
    }

    #[must_use]
    pub fn i64(mut self, value: i64) -> Self {
        self.buf.put_i64_le(value);
        self
    }

    #[must_use]
    pub fn f64(mut self, value: f64) -> Self {
        self.buf.put_f64_le(value);
        self
    }

    /// Length-prefixed UTF-8 string.
    #[must_use]
    pub fn string(mut self, value: &str) -> Self {
        self.buf.put_u32_le(value.len() as u32);
        self.buf.put_slice(value.as_bytes());
        self
    }

    #[must_use]
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Cursor over a received packet payload. Every accessor checks the
/// remaining length; trailing bytes at `finish` are a protocol violation.
#[derive(Debug)]
pub struct Fields {
    buf: Bytes,
}

impl Fields {
    /// Wraps a payload and returns its leading opcode.
    pub fn new(buf: Bytes) -> Result<(Opcode, Fields), ProtocolError> {
        let mut fields = Fields { buf };
        let opcode = Opcode::try_from(fields.u8()?)?;
        Ok((opcode, fields))
    }

    fn need(&self, n: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < n {
            return Err(ProtocolError::Malformed(format!(
                "packet truncated: need {n} more bytes, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8, ProtocolError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn u64(&mut self) -> Result<u64, ProtocolError> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn i64(&mut self) -> Result<i64, ProtocolError> {
        self.need(8)?;
        Ok(self.buf.get_i64_le())
    }

    pub fn f64(&mut self) -> Result<f64, ProtocolError> {
        self.need(8)?;
        Ok(self.buf.get_f64_le())
    }

    pub fn string(&mut self) -> Result<String, ProtocolError> {
        let len = self.u32()? as usize;
        self.need(len)?;
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec())
            .map_err(|_| ProtocolError::Malformed("string is not valid UTF-8".into()))
    }

    /// Consumes the cursor, rejecting unparsed trailing bytes.
    pub fn finish(self) -> Result<(), ProtocolError> {
        if self.buf.has_remaining() {
            return Err(ProtocolError::Malformed(format!(
                "{} trailing bytes in packet",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_parse() {
        let payload = PacketBuf::new(Opcode::LockWrite)
            .string("mooring/ctd-7")
            .i64(-100)
            .i64(2_000)
            .freeze();
        let (opcode, mut fields) = Fields::new(payload).unwrap();
        assert_eq!(opcode, Opcode::LockWrite);
        assert_eq!(fields.string().unwrap(), "mooring/ctd-7");
        assert_eq!(fields.i64().unwrap(), -100);
        assert_eq!(fields.i64().unwrap(), 2_000);
        fields.finish().unwrap();
    }

    #[test]
    fn truncated_string_is_malformed() {
        let payload = PacketBuf::new(Opcode::ReadFile).u32(10).freeze();
        let (_, mut fields) = Fields::new(payload).unwrap();
        assert!(fields.string().is_err());
    }

    #[test]
    fn trailing_bytes_rejected() {
        let payload = PacketBuf::new(Opcode::Heartbeat).u8(1).freeze();
        let (_, fields) = Fields::new(payload).unwrap();
        assert!(fields.finish().is_err());
    }
}
