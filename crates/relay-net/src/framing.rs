//! Message framing for TCP byte streams.
//!
//! Two framings are supported and both endpoints of a session must agree on
//! one of them:
//!
//! - [`Framing::Raw`]: whatever a single read call returns is delivered as one
//!   chunk. This matches peers that write bare text with no framing at all,
//!   but a chunk is **not** an application message: the transport may split
//!   one write across several chunks or merge several writes into one.
//! - [`Framing::LengthPrefixed`]: every payload is preceded by its length.
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   payload          |
//! | u32 big-endian    |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The length does not include the 4 prefix bytes. A length of 0 is a valid
//! frame used as keepalive padding; readers skip it.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Default size of the read buffer used by [`Framing::Raw`].
pub const DEFAULT_READ_BUFFER: usize = 4096;

/// How a connection splits its byte stream into delivered chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// One read call yields one chunk of at most `read_buffer` bytes.
    Raw {
        /// Size of the per-read buffer.
        read_buffer: usize,
    },
    /// Each chunk is one length-prefixed frame.
    LengthPrefixed(FrameConfig),
}

impl Default for Framing {
    fn default() -> Self {
        Framing::Raw {
            read_buffer: DEFAULT_READ_BUFFER,
        }
    }
}

/// Limits for [`Framing::LengthPrefixed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes. Default: 1 MiB.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1_048_576,
        }
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload size exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The actual payload size.
        size: u64,
        /// The configured maximum.
        max: u32,
    },

    /// The peer closed the stream before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read one length-prefixed frame, waiting until all of it has arrived.
///
/// Returns [`FrameError::ConnectionClosed`] when the peer closes the stream
/// before the frame is complete, including a clean close between frames.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(eof_as_closed)?;

    let payload_len = u32::from_be_bytes(len_buf);
    if payload_len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: u64::from(payload_len),
            max: config.max_payload_size,
        });
    }

    let mut payload = vec![0u8; payload_len as usize];
    if payload_len > 0 {
        reader.read_exact(&mut payload).await.map_err(eof_as_closed)?;
    }

    Ok(payload)
}

/// Write `payload` as a single length-prefixed frame and flush.
///
/// An oversized payload is rejected before any byte is written, so the stream
/// stays usable.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let len = match u32::try_from(payload.len()) {
        Ok(len) if len <= config.max_payload_size => len,
        _ => {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len() as u64,
                max: config.max_payload_size,
            });
        }
    };

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;

    Ok(())
}

fn eof_as_closed(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_back_to_back_frames_stay_separate() {
        let (mut client, mut server) = duplex(1024);
        let config = FrameConfig::default();

        write_frame(&mut client, b"ping", &config).await.unwrap();
        write_frame(&mut client, b"pong", &config).await.unwrap();

        assert_eq!(read_frame(&mut server, &config).await.unwrap(), b"ping");
        assert_eq!(read_frame(&mut server, &config).await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn test_frame_split_across_small_buffer() {
        let (mut client, mut server) = duplex(8);
        let config = FrameConfig::default();
        let payload = b"a relay message spanning several duplex buffers";

        let write_config = config.clone();
        let write_task = tokio::spawn(async move {
            write_frame(&mut client, payload, &write_config)
                .await
                .unwrap();
        });

        let received = read_frame(&mut server, &config).await.unwrap();
        write_task.await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_length_prefix_is_big_endian() {
        let (mut client, mut server) = duplex(1024);
        client.write_all(&[0, 0, 0, 5]).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        client.flush().await.unwrap();

        let received = read_frame(&mut server, &FrameConfig::default())
            .await
            .unwrap();
        assert_eq!(received, b"hello");
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_both_ways() {
        let (mut client, mut server) = duplex(1024);
        let config = FrameConfig {
            max_payload_size: 16,
        };

        let result = write_frame(&mut client, &[0u8; 64], &config).await;
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { size: 64, max: 16 })));

        client.write_all(&1024u32.to_be_bytes()).await.unwrap();
        client.flush().await.unwrap();
        let result = read_frame(&mut server, &config).await;
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_zero_length_frame_is_valid() {
        let (mut client, mut server) = duplex(1024);
        let config = FrameConfig::default();

        write_frame(&mut client, &[], &config).await.unwrap();
        assert!(read_frame(&mut server, &config).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_stream_reports_connection_closed() {
        let (client, mut server) = duplex(64);
        drop(client);

        let result = read_frame(&mut server, &FrameConfig::default()).await;
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }

    #[test]
    fn test_default_framing_is_raw() {
        assert_eq!(
            Framing::default(),
            Framing::Raw {
                read_buffer: DEFAULT_READ_BUFFER
            }
        );
    }
}
