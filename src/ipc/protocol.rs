//! Wire protocol types for the bridge transport
//!
//! Wire format (both directions):
//! ```text
//! [4 bytes: body length (u32 BE)]
//! [body bytes (MessagePack-encoded Frame)]
//! ```
//!
//! The page sends `Request` frames. The host answers each with a `Response`
//! carrying the same id, and pushes `Event` frames at any time.

use std::io;

use futures_lite::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::beacon::Beacon;

/// Default upper bound for a single frame body
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Errors that can occur during IPC operations
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),
}

/// Push event sent from the privileged host to a page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HostEvent {
    /// Ask the page to reload itself
    Refresh,
    /// Ask the page to toggle its developer tools
    ToggleDevTools,
    /// The host dropped its forwarding callback; the page may forget the function
    StoreDelete { beacon: Beacon },
    /// Invoke the page function registered under `beacon`
    StoreExecute { beacon: Beacon, params: Vec<Value> },
}

impl HostEvent {
    /// Event name as seen by page listeners
    pub fn name(&self) -> &'static str {
        match self {
            Self::Refresh => "Refresh",
            Self::ToggleDevTools => "ToggleDevTools",
            Self::StoreDelete { .. } => "StoreDelete",
            Self::StoreExecute { .. } => "StoreExecute",
        }
    }
}

/// A single message on the bridge transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Request {
        id: u64,
        channel: String,
        args: Vec<Value>,
    },
    Response {
        id: u64,
        result: Result<Value, String>,
    },
    Event(HostEvent),
}

impl Frame {
    /// Serialize to wire format, including the length prefix
    pub fn to_bytes(&self) -> Result<Vec<u8>, IpcError> {
        let body = rmp_serde::to_vec(self)?;
        let len = u32::try_from(body.len())
            .map_err(|_| IpcError::InvalidProtocol("frame too large".to_string()))?;

        let mut buf = Vec::with_capacity(4 + body.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Parse a frame body (after the length prefix)
    pub fn from_bytes(body: &[u8]) -> Result<Self, IpcError> {
        if body.is_empty() {
            return Err(IpcError::InvalidProtocol("empty frame".to_string()));
        }
        Ok(rmp_serde::from_slice(body)?)
    }
}

/// Read one frame, returning `None` when the peer closed the stream cleanly
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> Result<Option<Frame>, IpcError> {
    let mut len_buf = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut len_buf).await {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(e.into());
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > max_len {
        return Err(IpcError::InvalidProtocol(format!("invalid frame length: {len}")));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Frame::from_bytes(&body).map(Some)
}

/// Write one frame and flush it
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), IpcError> {
    let bytes = frame.to_bytes()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use futures_lite::future::block_on;
    use futures_lite::io::Cursor;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let frame = Frame::Request {
            id: 7,
            channel: "NodeWorker".to_string(),
            args: vec![json!("p/0"), json!("postMessage"), json!({ "n": 1 })],
        };

        let bytes = frame.to_bytes().unwrap();
        // Skip the 4-byte length prefix
        let parsed = Frame::from_bytes(&bytes[4..]).unwrap();

        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_error_response_roundtrip() {
        let frame = Frame::Response {
            id: 3,
            result: Err("worker creation failed: bad source".to_string()),
        };

        let bytes = frame.to_bytes().unwrap();
        let parsed = Frame::from_bytes(&bytes[4..]).unwrap();

        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_event_roundtrip() {
        let frame = Frame::Event(HostEvent::StoreExecute {
            beacon: Beacon::from("p/1"),
            params: vec![json!({ "type": "message", "data": "pong" })],
        });

        let bytes = frame.to_bytes().unwrap();
        let parsed = Frame::from_bytes(&bytes[4..]).unwrap();

        assert_eq!(parsed, frame);
        match parsed {
            Frame::Event(event) => assert_eq!(event.name(), "StoreExecute"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_read_frames_in_order_until_eof() {
        let first = Frame::Event(HostEvent::Refresh);
        let second = Frame::Event(HostEvent::StoreDelete {
            beacon: Beacon::from("p/9"),
        });

        let mut wire = first.to_bytes().unwrap();
        wire.extend(second.to_bytes().unwrap());
        let mut reader = Cursor::new(wire);

        block_on(async {
            let max = DEFAULT_MAX_FRAME_LEN;
            assert_eq!(read_frame(&mut reader, max).await.unwrap(), Some(first));
            assert_eq!(read_frame(&mut reader, max).await.unwrap(), Some(second));
            assert_eq!(read_frame(&mut reader, max).await.unwrap(), None);
        });
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let frame = Frame::Event(HostEvent::ToggleDevTools);
        let mut reader = Cursor::new(frame.to_bytes().unwrap());

        let result = block_on(read_frame(&mut reader, 1));
        assert!(matches!(result, Err(IpcError::InvalidProtocol(_))));
    }
}
