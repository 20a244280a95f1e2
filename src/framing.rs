//! Length-prefixed message framing for tunnel streams.
//!
//! Message format:
//! ```text
//! ┌─────────────────┬──────────────────────────┐
//! │ Length (4 bytes)│ Payload (N bytes)        │
//! │  big-endian u32 │                          │
//! └─────────────────┴──────────────────────────┘
//! ```
//!
//! A zero-length frame is a valid, empty message. A stream that ends before
//! the declared length has been read is an [`FramingError::UnexpectedEof`].

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default upper bound for a single message (32 MiB).
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 32 * 1024 * 1024;

/// Size of the length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FramingError {
    /// Declared length exceeds the configured bound. The body was not read.
    #[error("Message too large: {len} bytes (max {max})")]
    OversizedMessage { len: usize, max: usize },

    /// The stream closed before `expected` bytes were available.
    #[error("Unexpected EOF while reading {expected} bytes from stream")]
    UnexpectedEof { expected: usize },

    #[error("Stream I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Prefix `payload` with its big-endian u32 length.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, FramingError> {
    let len = u32::try_from(payload.len()).map_err(|_| FramingError::OversizedMessage {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;
    let mut out = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Read exactly one frame from `reader`.
///
/// Fails with [`FramingError::OversizedMessage`] before touching the body when
/// the declared length exceeds `max_len`.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Vec<u8>, FramingError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_LEN];
    read_exact_or_eof(reader, &mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_len {
        return Err(FramingError::OversizedMessage { len, max: max_len });
    }

    let mut payload = vec![0u8; len];
    read_exact_or_eof(reader, &mut payload).await?;
    Ok(payload)
}

/// Write one frame to `writer` and flush it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_exact_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), FramingError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(FramingError::UnexpectedEof { expected: buf.len() })
        }
        Err(e) => Err(FramingError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_roundtrip() {
        let payload = br#"{"jsonrpc":"2.0","method":"ping","id":1}"#;
        let mut cursor = Cursor::new(encode(payload).unwrap());
        let decoded = read_frame(&mut cursor, DEFAULT_MAX_MESSAGE_BYTES)
            .await
            .unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn test_message_format() {
        let buf = encode(b"hello").unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 5]);
        assert_eq!(&buf[4..], b"hello");
    }

    #[tokio::test]
    async fn test_empty_message_is_not_eof() {
        let mut cursor = Cursor::new(encode(b"").unwrap());
        let decoded = read_frame(&mut cursor, 16).await.unwrap();
        assert!(decoded.is_empty());

        // A second read on the drained stream is EOF, not another empty message.
        let err = read_frame(&mut cursor, 16).await.unwrap_err();
        assert!(matches!(err, FramingError::UnexpectedEof { expected: 4 }));
    }

    #[tokio::test]
    async fn test_oversized_rejected_before_body() {
        let mut buf = encode(&[7u8; 64]).unwrap();
        buf.extend_from_slice(b"trailing");
        let mut cursor = Cursor::new(buf);

        let err = read_frame(&mut cursor, 32).await.unwrap_err();
        assert!(matches!(
            err,
            FramingError::OversizedMessage { len: 64, max: 32 }
        ));
        // Only the prefix was consumed.
        assert_eq!(cursor.position(), 4);
    }

    #[tokio::test]
    async fn test_truncated_body() {
        let mut buf = encode(b"0123456789").unwrap();
        buf.truncate(8);
        let mut cursor = Cursor::new(buf);

        let err = read_frame(&mut cursor, 1024).await.unwrap_err();
        assert!(matches!(err, FramingError::UnexpectedEof { expected: 10 }));
    }

    #[tokio::test]
    async fn test_truncated_prefix() {
        let mut cursor = Cursor::new(vec![0u8, 0]);
        let err = read_frame(&mut cursor, 1024).await.unwrap_err();
        assert!(matches!(err, FramingError::UnexpectedEof { .. }));
    }

    #[tokio::test]
    async fn test_write_frame_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(8);
        let payload = vec![0xabu8; 100];
        let expected = payload.clone();

        // Duplex buffer is smaller than the payload, so the reader must keep
        // suspending until the whole body is available.
        let writer = tokio::spawn(async move { write_frame(&mut a, &payload).await });
        let decoded = read_frame(&mut b, 1024).await.unwrap();
        writer.await.unwrap().unwrap();
        assert_eq!(decoded, expected);
    }
}
