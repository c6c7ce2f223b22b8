//! Binary codec for the relay data phase.
//!
//! The handshake exchanges length-prefixed UTF-8 strings (u16 big-endian
//! byte length, then the bytes) and 8-byte big-endian integers. The relay
//! and both transfer agents use these helpers so the framing stays
//! identical on every hop.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub async fn write_string<W>(writer: &mut W, value: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = value.as_bytes();
    let len = u16::try_from(bytes.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("string of {} bytes exceeds frame limit", bytes.len()),
        )
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_string<R>(reader: &mut R) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

pub async fn write_u64<W>(writer: &mut W, value: u64) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&value.to_be_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_u64<R>(reader: &mut R) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf).await?;
    Ok(u64::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn string_roundtrip() {
        let (mut writer, mut reader) = tokio::io::duplex(256);
        write_string(&mut writer, "report.pdf").await.expect("write");
        let parsed = read_string(&mut reader).await.expect("read");
        assert_eq!(parsed, "report.pdf");
    }

    #[tokio::test]
    async fn empty_string_roundtrip() {
        let (mut writer, mut reader) = tokio::io::duplex(16);
        write_string(&mut writer, "").await.expect("write");
        assert_eq!(read_string(&mut reader).await.expect("read"), "");
    }

    #[tokio::test]
    async fn u64_roundtrip() {
        let (mut writer, mut reader) = tokio::io::duplex(16);
        write_u64(&mut writer, 8 * 1024 * 1024 + 17).await.expect("write");
        assert_eq!(read_u64(&mut reader).await.expect("read"), 8 * 1024 * 1024 + 17);
    }

    #[tokio::test]
    async fn rejects_invalid_utf8() {
        let (mut writer, mut reader) = tokio::io::duplex(16);
        tokio::io::AsyncWriteExt::write_all(&mut writer, &[0, 2, 0xff, 0xfe])
            .await
            .expect("write raw");
        let err = read_string(&mut reader).await.expect_err("must reject");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
