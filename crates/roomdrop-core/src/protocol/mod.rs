//! RDRP (Roomdrop Protocol) wire format.
//!
//! Roomdrop carries two kinds of traffic over the same framing:
//!
//! - control-plane messages between peers and the rendezvous server
//!   (see [`crate::signaling`]), always text frames;
//! - transfer-plane messages between two peers: text frames holding a
//!   [`ControlMessage`] and binary frames holding file chunks.
//!
//! ## Frame Format
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      RDRP Frame                            │
//! ├────────────┬────────────┬────────────┬─────────────────────┤
//! │   Magic    │  Version   │    Kind    │      Length         │
//! │  4 bytes   │  2 bytes   │   1 byte   │      4 bytes        │
//! ├────────────┴────────────┴────────────┴─────────────────────┤
//! │                        Payload                             │
//! │                    (variable length)                       │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! - Magic: `0x52 0x44 0x52 0x50` ("RDRP")
//! - Version: `0x01 0x00` (1.0)
//! - Kind: `0x01` text (UTF-8), `0x02` binary
//! - Length: Payload length in bytes (big-endian)
//!
//! ## Tagged Chunks
//!
//! When several files share one channel, every binary chunk is prefixed
//! with its file id:
//!
//! ```text
//! ┌─────────┬──────────────────┬──────────────────────┐
//! │ L (1 B) │ fileId (L bytes) │ chunk payload        │
//! └─────────┴──────────────────┴──────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};

/// Protocol magic bytes: "RDRP"
pub const MAGIC: [u8; 4] = [0x52, 0x44, 0x52, 0x50];

/// Frame header size in bytes
pub const HEADER_SIZE: usize = 11;

/// Maximum payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Longest file id that fits the one-byte tag length
pub const MAX_FILE_ID_LEN: usize = u8::MAX as usize;

/// MIME type used when nothing better is known
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Frame payload kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// UTF-8 text (JSON control messages)
    Text = 0x01,
    /// Raw bytes (file chunks)
    Binary = 0x02,
}

impl FrameKind {
    /// Parse a frame kind from a byte.
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Text),
            0x02 => Some(Self::Binary),
            _ => None,
        }
    }
}

/// A protocol frame header.
#[derive(Debug, Clone)]
pub struct FrameHeader {
    /// Protocol version (major, minor)
    pub version: (u8, u8),
    /// Payload kind
    pub kind: FrameKind,
    /// Payload length
    pub payload_length: u32,
}

impl FrameHeader {
    /// Encode the header to bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = self.version.0;
        buf[5] = self.version.1;
        buf[6] = self.kind as u8;
        buf[7..11].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Decode a header from bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is invalid.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        if buf[0..4] != MAGIC {
            return Err(Error::ProtocolError("invalid magic bytes".to_string()));
        }

        let version = (buf[4], buf[5]);
        if version.0 != crate::PROTOCOL_VERSION.0 {
            return Err(Error::ProtocolError(format!(
                "unsupported protocol version: {}.{}",
                version.0, version.1
            )));
        }

        let kind = FrameKind::from_byte(buf[6])
            .ok_or_else(|| Error::ProtocolError(format!("unknown frame kind: {:#x}", buf[6])))?;

        let payload_length = u32::from_be_bytes([buf[7], buf[8], buf[9], buf[10]]);

        if payload_length as usize > MAX_PAYLOAD_SIZE {
            return Err(Error::ProtocolError(format!(
                "payload too large: {payload_length} bytes"
            )));
        }

        Ok(Self {
            version,
            kind,
            payload_length,
        })
    }
}

/// A single message carried by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Text message (JSON control message)
    Text(String),
    /// Binary message (file chunk)
    Binary(Vec<u8>),
}

impl Message {
    /// Payload length in bytes, as counted by a channel's buffered amount.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) => data.len(),
        }
    }

    /// Returns true for a zero-length payload.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frame kind this message is written with.
    #[must_use]
    pub const fn kind(&self) -> FrameKind {
        match self {
            Self::Text(_) => FrameKind::Text,
            Self::Binary(_) => FrameKind::Binary,
        }
    }

    /// Encode a serializable value as a text message.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        serde_json::to_string(value)
            .map(Self::Text)
            .map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Metadata announced in a transfer header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// File name (no directory components)
    pub filename: String,
    /// Total byte length
    pub size: u64,
    /// Advisory MIME type
    #[serde(rename = "type", default = "default_mime_type")]
    pub mime_type: String,
}

fn default_mime_type() -> String {
    DEFAULT_MIME_TYPE.to_string()
}

impl FileMeta {
    /// Create metadata with the default MIME type.
    #[must_use]
    pub fn new(filename: impl Into<String>, size: u64) -> Self {
        Self {
            filename: filename.into(),
            size,
            mime_type: default_mime_type(),
        }
    }

    /// Override the MIME type.
    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }
}

/// Transfer-plane control messages (text frames between peers).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Announces a file; precedes its chunks
    Header {
        /// File id, present when chunks are tagged
        #[serde(rename = "fileId", default, skip_serializing_if = "Option::is_none")]
        file_id: Option<String>,
        /// File metadata
        meta: FileMeta,
    },
    /// The sender has no more chunks for the file
    Done {
        /// File id, present when chunks are tagged
        #[serde(rename = "fileId", default, skip_serializing_if = "Option::is_none")]
        file_id: Option<String>,
    },
    /// Receiver acknowledgment (windowed flow control only)
    Ack {
        /// File id, present when chunks are tagged
        #[serde(rename = "fileId", default, skip_serializing_if = "Option::is_none")]
        file_id: Option<String>,
        /// Highest 0-based chunk sequence consumed for the file
        #[serde(rename = "throughSeq", default, skip_serializing_if = "Option::is_none")]
        through_seq: Option<u64>,
    },
}

impl ControlMessage {
    /// Name of the message type, as it appears on the wire.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Header { .. } => "header",
            Self::Done { .. } => "done",
            Self::Ack { .. } => "ack",
        }
    }

    /// Encode as a text message.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_message(&self) -> Result<Message> {
        Message::json(self)
    }

    /// Decode from the text of a text message.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid control message.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// How binary chunks are framed on a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkFraming {
    /// Raw chunk bytes; one file in flight at a time
    #[default]
    Untagged,
    /// Chunks prefixed with their file id
    Tagged,
}

/// Prefix a chunk payload with its file id.
///
/// # Errors
///
/// Returns an error if the file id is empty or longer than 255 bytes.
pub fn encode_tagged_chunk(file_id: &str, payload: &[u8]) -> Result<Vec<u8>> {
    let id = file_id.as_bytes();
    if id.is_empty() || id.len() > MAX_FILE_ID_LEN {
        return Err(Error::ProtocolError(format!(
            "file id must be 1..={MAX_FILE_ID_LEN} bytes, got {}",
            id.len()
        )));
    }

    let mut buf = Vec::with_capacity(1 + id.len() + payload.len());
    #[allow(clippy::cast_possible_truncation)]
    buf.push(id.len() as u8);
    buf.extend_from_slice(id);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Split a tagged chunk into its file id and payload.
///
/// # Errors
///
/// Returns an error if the tag is truncated or not valid UTF-8.
pub fn decode_tagged_chunk(data: &[u8]) -> Result<(String, &[u8])> {
    let Some((&len, rest)) = data.split_first() else {
        return Err(Error::ProtocolError("empty tagged chunk".to_string()));
    };
    let len = usize::from(len);
    if len == 0 || rest.len() < len {
        return Err(Error::ProtocolError(format!(
            "tagged chunk too short for {len}-byte file id"
        )));
    }

    let file_id = std::str::from_utf8(&rest[..len])
        .map_err(|e| Error::ProtocolError(format!("file id is not UTF-8: {e}")))?;
    Ok((file_id.to_string(), &rest[len..]))
}

/// Read the next message, returning `None` when the stream ends cleanly
/// at a frame boundary.
///
/// # Errors
///
/// Returns an error if the frame is invalid, truncated, or a text payload
/// is not UTF-8.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>>
where
    R: AsyncReadExt + Unpin,
{
    let mut header_buf = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let header = FrameHeader::decode(&header_buf)?;

    let mut payload = vec![0u8; header.payload_length as usize];
    if header.payload_length > 0 {
        reader.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::ProtocolError("frame truncated".to_string())
            } else {
                e.into()
            }
        })?;
    }

    match header.kind {
        FrameKind::Text => String::from_utf8(payload)
            .map(|text| Some(Message::Text(text)))
            .map_err(|e| Error::ProtocolError(format!("text frame is not UTF-8: {e}"))),
        FrameKind::Binary => Ok(Some(Message::Binary(payload))),
    }
}

/// Write a complete frame to a stream.
///
/// # Errors
///
/// Returns an error if writing fails or the payload exceeds
/// [`MAX_PAYLOAD_SIZE`].
pub async fn write_frame<W>(writer: &mut W, kind: FrameKind, payload: &[u8]) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::ProtocolError(format!(
            "payload too large: {} bytes",
            payload.len()
        )));
    }

    #[allow(clippy::cast_possible_truncation)]
    let header = FrameHeader {
        version: crate::PROTOCOL_VERSION,
        kind,
        payload_length: payload.len() as u32,
    };

    writer.write_all(&header.encode()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;

    Ok(())
}

/// Write a message as a single frame.
///
/// # Errors
///
/// Returns an error if writing fails.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    match message {
        Message::Text(text) => write_frame(writer, FrameKind::Text, text.as_bytes()).await,
        Message::Binary(data) => write_frame(writer, FrameKind::Binary, data).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_header_encode_decode() {
        let header = FrameHeader {
            version: (1, 0),
            kind: FrameKind::Binary,
            payload_length: 256,
        };

        let encoded = header.encode();
        let decoded = FrameHeader::decode(&encoded).expect("decode");

        assert_eq!(decoded.version, (1, 0));
        assert_eq!(decoded.kind, FrameKind::Binary);
        assert_eq!(decoded.payload_length, 256);
    }

    #[test]
    fn test_frame_header_rejects_bad_magic_and_kind() {
        let mut encoded = FrameHeader {
            version: (1, 0),
            kind: FrameKind::Text,
            payload_length: 1,
        }
        .encode();

        encoded[6] = 0x7F;
        assert!(FrameHeader::decode(&encoded).is_err());

        encoded[6] = 0x01;
        encoded[0] = b'X';
        assert!(FrameHeader::decode(&encoded).is_err());
    }

    #[test]
    fn test_frame_header_rejects_oversize() {
        let mut encoded = FrameHeader {
            version: (1, 0),
            kind: FrameKind::Binary,
            payload_length: 0,
        }
        .encode();
        #[allow(clippy::cast_possible_truncation)]
        encoded[7..11].copy_from_slice(&((MAX_PAYLOAD_SIZE + 1) as u32).to_be_bytes());
        assert!(FrameHeader::decode(&encoded).is_err());
    }

    #[tokio::test]
    async fn test_read_write_messages() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, &Message::Text("{\"type\":\"done\"}".into()))
            .await
            .expect("write text");
        write_message(&mut buffer, &Message::Binary(vec![1, 2, 3]))
            .await
            .expect("write binary");

        let mut cursor = std::io::Cursor::new(buffer);
        assert_eq!(
            read_message(&mut cursor).await.unwrap(),
            Some(Message::Text("{\"type\":\"done\"}".into()))
        );
        assert_eq!(
            read_message(&mut cursor).await.unwrap(),
            Some(Message::Binary(vec![1, 2, 3]))
        );
        assert_eq!(read_message(&mut cursor).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, &Message::Binary(vec![9; 32]))
            .await
            .unwrap();
        buffer.truncate(HEADER_SIZE + 4);

        let mut cursor = std::io::Cursor::new(buffer);
        assert!(read_message(&mut cursor).await.is_err());
    }

    #[test]
    fn test_header_json_shape() {
        let header = ControlMessage::Header {
            file_id: None,
            meta: FileMeta::new("a.bin", 500_000),
        };
        let Message::Text(text) = header.to_message().unwrap() else {
            panic!("header must be a text message");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "header");
        assert_eq!(value["meta"]["filename"], "a.bin");
        assert_eq!(value["meta"]["size"], 500_000);
        assert_eq!(value["meta"]["type"], DEFAULT_MIME_TYPE);
        assert!(value.get("fileId").is_none());
    }

    #[test]
    fn test_control_message_parse() {
        let done = ControlMessage::parse(r#"{"type":"done","fileId":"f1"}"#).unwrap();
        assert_eq!(
            done,
            ControlMessage::Done {
                file_id: Some("f1".into())
            }
        );

        let ack = ControlMessage::parse(r#"{"type":"ack","fileId":"f1","throughSeq":7}"#).unwrap();
        assert_eq!(
            ack,
            ControlMessage::Ack {
                file_id: Some("f1".into()),
                through_seq: Some(7)
            }
        );

        let header =
            ControlMessage::parse(r#"{"type":"header","meta":{"filename":"x","size":3}}"#).unwrap();
        let ControlMessage::Header { meta, .. } = header else {
            panic!("expected header");
        };
        assert_eq!(meta.mime_type, DEFAULT_MIME_TYPE);

        assert!(ControlMessage::parse(r#"{"type":"bogus"}"#).is_err());
        assert!(ControlMessage::parse("not json").is_err());
    }

    #[test]
    fn test_tagged_chunk_layout() {
        let encoded = encode_tagged_chunk("ab", &[7, 8, 9]).unwrap();
        assert_eq!(encoded, vec![2, b'a', b'b', 7, 8, 9]);

        let (file_id, payload) = decode_tagged_chunk(&encoded).unwrap();
        assert_eq!(file_id, "ab");
        assert_eq!(payload, &[7, 8, 9]);
    }

    #[test]
    fn test_tagged_chunk_errors() {
        assert!(encode_tagged_chunk("", &[1]).is_err());
        assert!(encode_tagged_chunk(&"x".repeat(256), &[1]).is_err());
        assert!(decode_tagged_chunk(&[]).is_err());
        assert!(decode_tagged_chunk(&[5, b'a']).is_err());
        assert!(decode_tagged_chunk(&[0, 1, 2]).is_err());
    }

    #[test]
    fn test_tagged_chunk_empty_payload() {
        let encoded = encode_tagged_chunk("f", &[]).unwrap();
        let (file_id, payload) = decode_tagged_chunk(&encoded).unwrap();
        assert_eq!(file_id, "f");
        assert!(payload.is_empty());
    }
}
