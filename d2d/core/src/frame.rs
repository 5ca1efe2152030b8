//! Frame Protocol
//!
//! Wire format for one D2D message: a signed length prefix, a flat JSON
//! header, then the raw body.
//!
//! # Frame Format
//!
//! ```text
//! +----------------+--------------------------+---------------------------+
//! | Length (4)     | Header (Length bytes)    | Body (fileLength bytes)   |
//! | big-endian i32 | {"key":"value",...} JSON | raw bytes                 |
//! +----------------+--------------------------+---------------------------+
//! ```
//!
//! The body length is carried in the header's `fileLength` field as a
//! decimal string.
//!
//! # Validation
//!
//! - A length prefix of zero or less is rejected before any header is read
//! - Header and body sizes are bounded by [`FrameLimits`] before allocating
//! - Header values must all be strings
//! - `fileLength` must be present and a positive integer

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::{D2dMessage, Header};

/// Size of the header length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Header field carrying the body length
pub const FILE_LENGTH_KEY: &str = "fileLength";

/// Header field carrying the shared secret
pub const SEC_KEY_KEY: &str = "secKey";

/// Default maximum header size (1 MiB)
pub const DEFAULT_MAX_HEADER_SIZE: usize = 1024 * 1024;

/// Default maximum body size (512 MiB)
pub const DEFAULT_MAX_BODY_SIZE: usize = 512 * 1024 * 1024;

/// Errors produced while building or parsing a frame
#[derive(Debug, Error)]
pub enum FrameError {
    /// Fewer than four bytes arrived for the length prefix
    #[error("invalid header size: expected {LENGTH_PREFIX_SIZE} bytes, got {0}")]
    ShortLengthPrefix(usize),

    /// The length prefix was zero or negative
    #[error("invalid header size: {0}")]
    InvalidHeaderLength(i32),

    /// The header is larger than the receiver accepts
    #[error("header of {size} bytes exceeds maximum {max}")]
    HeaderTooLarge {
        /// Announced header size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// The stream ended inside the header
    #[error("short header: expected {expected} bytes, got {actual}")]
    ShortHeader {
        /// Bytes announced by the prefix
        expected: usize,
        /// Bytes actually received
        actual: usize,
    },

    /// The header is not a flat string-to-string JSON object
    #[error("invalid header: {0}")]
    MalformedHeader(#[from] serde_json::Error),

    /// `fileLength` is missing, not an integer, or not positive
    #[error("invalid header: fileLength is missing or not positive ({0:?})")]
    InvalidFileLength(Option<String>),

    /// The body is larger than the receiver accepts
    #[error("body of {size} bytes exceeds maximum {max}")]
    BodyTooLarge {
        /// Announced body size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// The stream ended inside the body
    #[error("short body: expected {expected} bytes, got {actual}")]
    ShortBody {
        /// Bytes announced by `fileLength`
        expected: usize,
        /// Bytes actually received
        actual: usize,
    },

    /// IO error while reading or writing a frame directly
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Receive-side size bounds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameLimits {
    /// Largest accepted header
    pub max_header_size: usize,
    /// Largest accepted body
    pub max_body_size: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

/// Encode a header length as the signed big-endian prefix
pub fn encode_length_prefix(header_len: usize) -> Result<i32, FrameError> {
    i32::try_from(header_len).map_err(|_| FrameError::HeaderTooLarge {
        size: header_len,
        max: i32::MAX as usize,
    })
}

/// Decode the length prefix and check it against the limits
pub fn decode_length_prefix(bytes: &[u8], limits: &FrameLimits) -> Result<usize, FrameError> {
    let prefix: [u8; LENGTH_PREFIX_SIZE] = bytes
        .try_into()
        .map_err(|_| FrameError::ShortLengthPrefix(bytes.len()))?;
    let len = i32::from_be_bytes(prefix);
    if len <= 0 {
        return Err(FrameError::InvalidHeaderLength(len));
    }

    let len = len as usize;
    if len > limits.max_header_size {
        return Err(FrameError::HeaderTooLarge {
            size: len,
            max: limits.max_header_size,
        });
    }
    Ok(len)
}

/// Serialize a header to JSON text
pub fn encode_header(header: &Header) -> Result<Vec<u8>, FrameError> {
    Ok(serde_json::to_vec(header)?)
}

/// Parse JSON text into a header
pub fn decode_header(bytes: &[u8]) -> Result<Header, FrameError> {
    Ok(serde_json::from_slice::<BTreeMap<String, String>>(bytes)?)
}

/// Read `fileLength` from a header and check it against the limits
pub fn file_length(header: &Header, limits: &FrameLimits) -> Result<usize, FrameError> {
    let raw = header.get(FILE_LENGTH_KEY);
    let len = raw
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|len| *len > 0)
        .ok_or_else(|| FrameError::InvalidFileLength(raw.cloned()))?;

    let len = usize::try_from(len).map_err(|_| FrameError::InvalidFileLength(raw.cloned()))?;
    if len > limits.max_body_size {
        return Err(FrameError::BodyTooLarge {
            size: len,
            max: limits.max_body_size,
        });
    }
    Ok(len)
}

/// Encode a complete frame for a message exactly as its header stands
///
/// Unlike [`D2dService::send`](crate::D2dService::send), this injects no
/// `secKey` and computes no `fileLength`.
pub fn encode_message(message: &D2dMessage) -> Result<Vec<u8>, FrameError> {
    let header = encode_header(message.header())?;
    let prefix = encode_length_prefix(header.len())?;

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + header.len() + message.body_len());
    buf.extend_from_slice(&prefix.to_be_bytes());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(message.body());
    Ok(buf)
}

/// Write one frame directly to a stream
pub async fn write_message<W>(writer: &mut W, message: &D2dMessage) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_message(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame directly from a stream
///
/// For peers that do not run the queued messenger (listeners, tests).
pub async fn read_message<R>(reader: &mut R, limits: &FrameLimits) -> Result<D2dMessage, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    let got = read_up_to(reader, &mut prefix).await?;
    let header_len = decode_length_prefix(&prefix[..got], limits)?;

    let mut header_buf = vec![0u8; header_len];
    let got = read_up_to(reader, &mut header_buf).await?;
    if got < header_len {
        return Err(FrameError::ShortHeader {
            expected: header_len,
            actual: got,
        });
    }
    let header = decode_header(&header_buf)?;
    let body_len = file_length(&header, limits)?;

    let mut body = vec![0u8; body_len];
    let got = read_up_to(reader, &mut body).await?;
    if got < body_len {
        return Err(FrameError::ShortBody {
            expected: body_len,
            actual: got,
        });
    }

    Ok(D2dMessage::new(header, Bytes::from(body)))
}

/// Fill `buf` until it is full or the stream ends; returns bytes read
async fn read_up_to<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(pairs: &[(&str, &str)]) -> Header {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_length_prefix_rejects_zero_and_negative() {
        let limits = FrameLimits::default();
        assert!(matches!(
            decode_length_prefix(&0i32.to_be_bytes(), &limits),
            Err(FrameError::InvalidHeaderLength(0))
        ));
        assert!(matches!(
            decode_length_prefix(&(-7i32).to_be_bytes(), &limits),
            Err(FrameError::InvalidHeaderLength(-7))
        ));
        assert_eq!(decode_length_prefix(&42i32.to_be_bytes(), &limits).unwrap(), 42);
    }

    #[test]
    fn test_length_prefix_requires_four_bytes() {
        let limits = FrameLimits::default();
        assert!(matches!(
            decode_length_prefix(&[], &limits),
            Err(FrameError::ShortLengthPrefix(0))
        ));
        assert!(matches!(
            decode_length_prefix(&[0, 0, 1], &limits),
            Err(FrameError::ShortLengthPrefix(3))
        ));
    }

    #[test]
    fn test_length_prefix_enforces_limit() {
        let limits = FrameLimits {
            max_header_size: 16,
            max_body_size: 16,
        };
        assert!(matches!(
            decode_length_prefix(&17i32.to_be_bytes(), &limits),
            Err(FrameError::HeaderTooLarge { size: 17, max: 16 })
        ));
    }

    #[test]
    fn test_decode_header_rejects_non_string_values() {
        assert!(matches!(
            decode_header(br#"{"fileLength": 10}"#),
            Err(FrameError::MalformedHeader(_))
        ));
        assert!(matches!(
            decode_header(b"not json"),
            Err(FrameError::MalformedHeader(_))
        ));
        assert!(matches!(
            decode_header(br#"["a"]"#),
            Err(FrameError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_file_length_validation() {
        let limits = FrameLimits::default();
        assert_eq!(
            file_length(&header(&[("fileLength", "100")]), &limits).unwrap(),
            100
        );
        for bad in ["0", "-3", "abc", "", " 5 ", "5\n"] {
            assert!(
                matches!(
                    file_length(&header(&[("fileLength", bad)]), &limits),
                    Err(FrameError::InvalidFileLength(Some(_)))
                ),
                "fileLength {bad:?} should be rejected"
            );
        }
        assert!(matches!(
            file_length(&header(&[("fileName", "a.jpg")]), &limits),
            Err(FrameError::InvalidFileLength(None))
        ));
    }

    #[test]
    fn test_encode_message_layout() {
        let message = D2dMessage::new(
            header(&[("fileLength", "3"), ("fileName", "a.txt")]),
            Bytes::from_static(b"abc"),
        );
        let frame = encode_message(&message).unwrap();

        let header_len = i32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        let header_json = &frame[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + header_len];
        assert_eq!(
            header_json,
            br#"{"fileLength":"3","fileName":"a.txt"}"#.as_slice()
        );
        assert_eq!(&frame[LENGTH_PREFIX_SIZE + header_len..], b"abc");
    }

    #[tokio::test]
    async fn test_read_message_from_stream() {
        let message = D2dMessage::new(
            header(&[("fileLength", "5"), ("fileName", "x.bin")]),
            Bytes::from_static(b"hello"),
        );
        let (mut client, mut server) = tokio::io::duplex(64);

        let writer = tokio::spawn(async move {
            write_message(&mut client, &message).await.unwrap();
        });

        let received = read_message(&mut server, &FrameLimits::default())
            .await
            .unwrap();
        writer.await.unwrap();

        assert_eq!(received.header_value("fileName"), Some("x.bin"));
        assert_eq!(&received.body()[..], b"hello");
    }

    #[tokio::test]
    async fn test_read_message_short_body() {
        let mut frame = Vec::new();
        let json = br#"{"fileLength":"10"}"#;
        frame.extend_from_slice(&(json.len() as i32).to_be_bytes());
        frame.extend_from_slice(json);
        frame.extend_from_slice(b"1234");

        let mut reader = frame.as_slice();
        let result = read_message(&mut reader, &FrameLimits::default()).await;
        assert!(matches!(
            result,
            Err(FrameError::ShortBody {
                expected: 10,
                actual: 4
            })
        ));
    }
}
