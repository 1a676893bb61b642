//! Framing layer of the CQL binary protocol.
//!
//! Only the parts needed by the session core are implemented: the 8-byte
//! frame header with a single-byte stream id, request serialization and
//! response header parsing. Result-set deserialization is intentionally
//! minimal; the session treats response bodies as mostly opaque.

pub mod request;
pub mod response;
pub mod types;

use bytes::{Buf, BufMut, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::FrameError;
use crate::network::StreamId;
use request::{RequestOpcode, SerializableRequest};
use response::ResponseOpcode;

const HEADER_SIZE: usize = 8;

/// Protocol version sent in every request frame.
pub const REQUEST_VERSION: u8 = 0x01;
/// Protocol version expected in every response frame.
pub const RESPONSE_VERSION: u8 = 0x81;

/// Stream id on which the server pushes unsolicited event frames.
pub const EVENT_STREAM: StreamId = 0;

/// Parts of the frame header which are not determined by the request type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameParams {
    pub version: u8,
    pub flags: u8,
    pub stream: StreamId,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            version: REQUEST_VERSION,
            flags: 0x00,
            stream: 0,
        }
    }
}

/// A request body serialized once, ready to be framed with any stream id.
#[derive(Debug, Clone)]
pub struct SerializedRequest {
    opcode: RequestOpcode,
    body: Bytes,
}

impl SerializedRequest {
    pub fn make<R: SerializableRequest>(request: &R) -> Result<Self, FrameError> {
        Ok(Self {
            opcode: R::OPCODE,
            body: request.to_bytes()?,
        })
    }

    pub fn opcode(&self) -> RequestOpcode {
        self.opcode
    }
}

pub async fn write_request(
    writer: &mut (impl AsyncWrite + Unpin),
    stream: StreamId,
    request: &SerializedRequest,
) -> Result<(), FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    {
        let mut buf = &mut header[..];
        buf.put_u8(REQUEST_VERSION);
        buf.put_u8(0x00);
        buf.put_u8(stream);
        buf.put_u8(request.opcode as u8);
        buf.put_u32(request.body.len() as u32);
    }

    writer.write_all(&header).await?;
    writer.write_all(&request.body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_response(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameError> {
    let mut raw_header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw_header[..]).await?;

    let mut buf = &raw_header[..];

    let version = buf.get_u8();
    if version != RESPONSE_VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }

    let flags = buf.get_u8();
    let stream = buf.get_u8();
    let opcode = ResponseOpcode::try_from(buf.get_u8())?;
    let length = buf.get_u32() as usize;

    let mut raw_body = vec![0u8; length];
    reader.read_exact(&mut raw_body[..]).await?;

    let params = FrameParams {
        version,
        flags,
        stream,
    };

    Ok((params, opcode, raw_body.into()))
}
