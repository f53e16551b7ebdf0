//! Binary frame codec.
//!
//! Every frame is a fixed 16-byte big-endian header followed by a compact JSON
//! payload:
//!
//! ```text
//! 0      2    3    4          6     7     8            12           16
//! +------+----+----+----------+-----+-----+------------+------------+---------
//! | "MB" | v1 |kind| method   |stat | rsv | request id | payload len| payload
//! +------+----+----+----------+-----+-----+------------+------------+---------
//! ```
//!
//! `kind` is 0 for requests and 1 for responses; `stat` is `0xFF` when the frame
//! carries no status (requests).

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::method::MethodId;
use crate::status::{RpcError, StatusCode};

pub const MAGIC: [u8; 2] = *b"MB";
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 16;

/// Default frame size limit (4 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

const NO_STATUS: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Response,
}

/// One request or response on the channel.
///
/// `method_id` stays raw so a peer can answer frames for ids it does not know.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    pub method_id: u16,
    pub request_id: u32,
    pub status: Option<StatusCode>,
    pub payload: Value,
}

impl Frame {
    #[must_use]
    pub fn request(method: MethodId, request_id: u32, payload: Value) -> Self {
        Self {
            kind: FrameKind::Request,
            method_id: method.as_u16(),
            request_id,
            status: None,
            payload,
        }
    }

    /// Successful response to `request`.
    #[must_use]
    pub fn ok(request: &Frame, payload: Value) -> Self {
        Self {
            kind: FrameKind::Response,
            method_id: request.method_id,
            request_id: request.request_id,
            status: Some(StatusCode::Ok),
            payload,
        }
    }

    /// Error response to `request`.
    #[must_use]
    pub fn error(request: &Frame, error: &RpcError) -> Self {
        Self {
            kind: FrameKind::Response,
            method_id: request.method_id,
            request_id: request.request_id,
            status: Some(error.code),
            payload: error.to_payload(),
        }
    }

    #[must_use]
    pub fn method(&self) -> Option<MethodId> {
        MethodId::from_u16(self.method_id)
    }

    /// Unpack a response into its payload or structured error.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.status {
            Some(StatusCode::Ok) => Ok(self.payload),
            Some(code) => Err(RpcError::from_payload(code, self.payload)),
            None => Err(RpcError::new(
                StatusCode::Internal,
                "response frame carries no status",
            )),
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected EOF inside a frame")]
    UnexpectedEof,
    #[error("bad frame magic {0:02x?}")]
    BadMagic([u8; 2]),
    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
    #[error("unknown status code {0}")]
    UnknownStatus(u8),
    #[error("frame payload of {len} bytes exceeds maximum {max}")]
    TooLarge { len: usize, max: usize },
    #[error("frame payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<CodecError> for RpcError {
    /// A frame that cannot be encoded fails only the call that produced it.
    fn from(error: CodecError) -> Self {
        match error {
            CodecError::TooLarge { .. } => Self::resource_exhausted(error.to_string()),
            CodecError::Io(_) | CodecError::UnexpectedEof => Self::unavailable(error.to_string()),
            other => Self::internal(other.to_string()),
        }
    }
}

/// Serialize `frame` into header + payload bytes.
pub fn encode(frame: &Frame, max_frame_bytes: usize) -> Result<Vec<u8>, CodecError> {
    let payload = serde_json::to_vec(&frame.payload)?;
    if payload.len() > max_frame_bytes {
        return Err(CodecError::TooLarge {
            len: payload.len(),
            max: max_frame_bytes,
        });
    }
    let len = u32::try_from(payload.len()).map_err(|_| CodecError::TooLarge {
        len: payload.len(),
        max: max_frame_bytes,
    })?;

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&MAGIC);
    out.push(VERSION);
    out.push(match frame.kind {
        FrameKind::Request => 0,
        FrameKind::Response => 1,
    });
    out.extend_from_slice(&frame.method_id.to_be_bytes());
    out.push(frame.status.map_or(NO_STATUS, StatusCode::as_u8));
    out.push(0);
    out.extend_from_slice(&frame.request_id.to_be_bytes());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

struct Header {
    kind: FrameKind,
    method_id: u16,
    status: Option<StatusCode>,
    request_id: u32,
    len: usize,
}

fn decode_header(bytes: &[u8; HEADER_LEN], max_frame_bytes: usize) -> Result<Header, CodecError> {
    let magic = [bytes[0], bytes[1]];
    if magic != MAGIC {
        return Err(CodecError::BadMagic(magic));
    }
    if bytes[2] != VERSION {
        return Err(CodecError::UnsupportedVersion(bytes[2]));
    }
    let kind = match bytes[3] {
        0 => FrameKind::Request,
        1 => FrameKind::Response,
        other => return Err(CodecError::UnknownKind(other)),
    };
    let status = match bytes[6] {
        NO_STATUS => None,
        raw => Some(StatusCode::from_u8(raw).ok_or(CodecError::UnknownStatus(raw))?),
    };
    let len = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]) as usize;
    if len > max_frame_bytes {
        return Err(CodecError::TooLarge {
            len,
            max: max_frame_bytes,
        });
    }
    Ok(Header {
        kind,
        method_id: u16::from_be_bytes([bytes[4], bytes[5]]),
        status,
        request_id: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        len,
    })
}

/// Reads frames from an async byte stream.
pub struct FrameReader<R> {
    reader: R,
    max_frame_bytes: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            max_frame_bytes,
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on EOF at a frame boundary (clean shutdown) and an
    /// error on EOF anywhere inside a frame.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        let mut header = [0u8; HEADER_LEN];
        let first = self.reader.read(&mut header).await?;
        if first == 0 {
            return Ok(None);
        }
        self.read_exact(&mut header[first..]).await?;
        let header = decode_header(&header, self.max_frame_bytes)?;

        let mut body = vec![0u8; header.len];
        self.read_exact(&mut body).await?;
        let payload = serde_json::from_slice(&body)?;

        Ok(Some(Frame {
            kind: header.kind,
            method_id: header.method_id,
            request_id: header.request_id,
            status: header.status,
            payload,
        }))
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), CodecError> {
        match self.reader.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(CodecError::UnexpectedEof),
            Err(e) => Err(e.into()),
        }
    }
}

/// Writes frames to an async byte stream.
pub struct FrameWriter<W> {
    writer: W,
    max_frame_bytes: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W, max_frame_bytes: usize) -> Self {
        Self {
            writer,
            max_frame_bytes,
        }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), CodecError> {
        let bytes = encode(frame, self.max_frame_bytes)?;
        self.write_encoded(&bytes).await
    }

    /// Write bytes produced by [`encode`]. Only I/O can fail here.
    pub async fn write_encoded(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
