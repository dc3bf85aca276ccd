//! Connection handshake.
//!
//! All fields are raw little-endian values, not frames:
//!
//! 1. client → hello magic
//! 2. server → server magic, protocol version
//! 3. client → version echo
//! 4. client → length-prefixed UTF-8 display name
//! 5. client → ready magic
//! 6. server → ready magic
//!
//! Any mismatch is a fatal protocol error; the connection is torn down.

use harbor_types::ProtocolError;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::frame::FrameReader;

pub const CLIENT_HELLO_MAGIC: u32 = 0xEAD5_68C0;
pub const SERVER_HELLO_MAGIC: u32 = 0x3462_A633;
pub const PROTOCOL_VERSION: u32 = 3;
pub const CLIENT_READY_MAGIC: u32 = 0xA6CB_A125;
pub const SERVER_READY_MAGIC: u32 = 0x52EB_140A;

/// Server side of the handshake. Returns the client's display name.
pub async fn accept<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut W,
) -> Result<String, ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let hello = reader.read_u32().await?;
    if hello != CLIENT_HELLO_MAGIC {
        return Err(ProtocolError::BadMagic(hello));
    }

    writer.write_all(&SERVER_HELLO_MAGIC.to_le_bytes()).await?;
    writer.write_all(&PROTOCOL_VERSION.to_le_bytes()).await?;
    writer.flush().await?;

    let version = reader.read_u32().await?;
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::BadVersion(version));
    }

    let name = reader.read_string().await?;

    let ready = reader.read_u32().await?;
    if ready != CLIENT_READY_MAGIC {
        return Err(ProtocolError::BadMagic(ready));
    }

    writer.write_all(&SERVER_READY_MAGIC.to_le_bytes()).await?;
    writer.flush().await?;

    Ok(name)
}

/// Client side of the handshake.
pub async fn connect<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut W,
    name: &str,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_all(&CLIENT_HELLO_MAGIC.to_le_bytes()).await?;
    writer.flush().await?;

    let magic = reader.read_u32().await?;
    if magic != SERVER_HELLO_MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }
    let version = reader.read_u32().await?;
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::BadVersion(version));
    }

    writer.write_all(&version.to_le_bytes()).await?;
    writer.write_all(&(name.len() as u32).to_le_bytes()).await?;
    writer.write_all(name.as_bytes()).await?;
    writer.write_all(&CLIENT_READY_MAGIC.to_le_bytes()).await?;
    writer.flush().await?;

    let ready = reader.read_u32().await?;
    if ready != SERVER_READY_MAGIC {
        return Err(ProtocolError::BadMagic(ready));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handshake_succeeds_over_duplex() {
        let (client, server) = tokio::io::duplex(1024);
        let (client_r, client_w) = tokio::io::split(client);
        let (server_r, server_w) = tokio::io::split(server);

        let server_task = tokio::spawn(async move {
            let mut reader = FrameReader::new(server_r);
            let mut writer = server_w;
            accept(&mut reader, &mut writer).await
        });

        let mut reader = FrameReader::new(client_r);
        let mut writer = client_w;
        connect(&mut reader, &mut writer, "ctd-ingest").await.unwrap();

        let name = server_task.await.unwrap().unwrap();
        assert_eq!(name, "ctd-ingest");
    }

    #[tokio::test]
    async fn wrong_hello_magic_is_fatal() {
        let (client, server) = tokio::io::duplex(64);
        let (server_r, server_w) = tokio::io::split(server);
        let (_client_r, mut client_w) = tokio::io::split(client);

        client_w.write_all(&0xDEAD_BEEFu32.to_le_bytes()).await.unwrap();

        let mut reader = FrameReader::new(server_r);
        let mut writer = server_w;
        let err = accept(&mut reader, &mut writer).await.unwrap_err();
        assert!(matches!(err, ProtocolError::BadMagic(0xDEAD_BEEF)));
    }
}
