//! Reconnecting-PTY wire framing
//!
//! A reconnecting-PTY connection starts with a 2-byte little-endian length
//! followed by that many bytes of JSON describing the session to attach to.
//! After the init frame the client sends a bare stream of JSON request
//! objects, and the agent answers with raw PTY output bytes.
//!
//! The init frame must be read with exact-length semantics: a streaming JSON
//! decoder would greedily buffer bytes that belong to the request stream.

use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

/// First frame on a reconnecting-PTY connection.
///
/// `id` is chosen by the client and reused across reconnects; attaches with
/// the same id share one PTY session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectingPtyInit {
    pub id: String,
    pub command: String,
    pub height: u16,
    pub width: u16,
}

/// A single client request after the init frame.
///
/// `height`/`width` of zero mean "no resize".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectingPtyRequest {
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub height: u16,
    #[serde(default)]
    pub width: u16,
}

/// Read the init frame: a 2-byte little-endian length, then exactly that
/// many bytes of JSON.
pub async fn read_init<R>(reader: &mut R) -> Result<ReconnectingPtyInit, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut raw_len = [0u8; 2];
    reader.read_exact(&mut raw_len).await?;
    let len = u16::from_le_bytes(raw_len) as usize;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(serde_json::from_slice(&payload)?)
}

/// Encode an init frame for transmission.
pub fn encode_init(init: &ReconnectingPtyInit) -> Result<Vec<u8>, ProtocolError> {
    let payload = serde_json::to_vec(init)?;
    debug_assert!(payload.len() <= u16::MAX as usize);
    let mut frame = Vec::with_capacity(2 + payload.len());
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write an init frame to a stream.
pub async fn write_init<W>(writer: &mut W, init: &ReconnectingPtyInit) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_init(init)?;
    writer.write_all(&frame).await?;
    Ok(())
}

/// Incremental decoder for a stream of concatenated JSON values.
///
/// Feed raw bytes with [`extend`](JsonStream::extend) and drain complete
/// values with [`next`](JsonStream::next); partial values stay buffered
/// until more bytes arrive.
#[derive(Debug, Default)]
pub struct JsonStream {
    buf: BytesMut,
}

impl JsonStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Decode the next complete value, or `None` if the buffer holds only a
    /// partial value. A syntax error is fatal for the stream.
    pub fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtocolError> {
        // Leading whitespace between values never forms a value on its own.
        while self.buf.first().is_some_and(|b| b.is_ascii_whitespace()) {
            self.buf.advance(1);
        }
        if self.buf.is_empty() {
            return Ok(None);
        }

        let mut iter = serde_json::Deserializer::from_slice(&self.buf).into_iter::<T>();
        match iter.next() {
            Some(Ok(value)) => {
                let consumed = iter.byte_offset();
                self.buf.advance(consumed);
                Ok(Some(value))
            }
            Some(Err(err)) if err.is_eof() => Ok(None),
            Some(Err(err)) => Err(err.into()),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() -> ReconnectingPtyInit {
        ReconnectingPtyInit {
            id: "terminal-1".to_string(),
            command: String::new(),
            height: 24,
            width: 80,
        }
    }

    #[tokio::test]
    async fn test_init_frame_roundtrip() {
        let frame = encode_init(&init()).unwrap();
        let mut reader = std::io::Cursor::new(frame);
        let decoded = read_init(&mut reader).await.unwrap();
        assert_eq!(decoded, init());
    }

    #[tokio::test]
    async fn test_init_frame_length_prefix_is_little_endian() {
        let frame = encode_init(&init()).unwrap();
        let len = u16::from_le_bytes([frame[0], frame[1]]) as usize;
        assert_eq!(len, frame.len() - 2);
    }

    #[tokio::test]
    async fn test_init_frame_truncated_body_fails() {
        let mut frame = encode_init(&init()).unwrap();
        frame.truncate(frame.len() - 1);
        let mut reader = std::io::Cursor::new(frame);
        assert!(read_init(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_init_frame_does_not_consume_trailing_bytes() {
        let mut frame = encode_init(&init()).unwrap();
        frame.extend_from_slice(b"{\"data\":\"ls\\r\"}");
        let mut reader = std::io::Cursor::new(frame);
        let _ = read_init(&mut reader).await.unwrap();

        // The request bytes after the init frame must still be readable.
        let mut rest = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut rest)
            .await
            .unwrap();
        assert_eq!(rest, b"{\"data\":\"ls\\r\"}");
    }

    #[test]
    fn test_json_stream_single_value() {
        let mut stream = JsonStream::new();
        stream.extend(b"{\"data\":\"x\",\"height\":0,\"width\":0}");
        let req: ReconnectingPtyRequest = stream.next().unwrap().unwrap();
        assert_eq!(req.data, "x");
        assert!(stream.next::<ReconnectingPtyRequest>().unwrap().is_none());
    }

    #[test]
    fn test_json_stream_partial_then_complete() {
        let mut stream = JsonStream::new();
        stream.extend(b"{\"data\":\"he");
        assert!(stream.next::<ReconnectingPtyRequest>().unwrap().is_none());
        stream.extend(b"llo\"}");
        let req: ReconnectingPtyRequest = stream.next().unwrap().unwrap();
        assert_eq!(req.data, "hello");
    }

    #[test]
    fn test_json_stream_multiple_values_in_one_chunk() {
        let mut stream = JsonStream::new();
        stream.extend(b"{\"data\":\"a\"}{\"data\":\"b\",\"height\":50,\"width\":120}");
        let first: ReconnectingPtyRequest = stream.next().unwrap().unwrap();
        let second: ReconnectingPtyRequest = stream.next().unwrap().unwrap();
        assert_eq!(first.data, "a");
        assert_eq!(second.data, "b");
        assert_eq!((second.height, second.width), (50, 120));
    }

    #[test]
    fn test_json_stream_syntax_error_is_fatal() {
        let mut stream = JsonStream::new();
        stream.extend(b"not json at all");
        assert!(stream.next::<ReconnectingPtyRequest>().is_err());
    }

    #[test]
    fn test_request_resize_fields_default_to_zero() {
        let req: ReconnectingPtyRequest = serde_json::from_str("{\"data\":\"ls\"}").unwrap();
        assert_eq!((req.height, req.width), (0, 0));
    }
}
