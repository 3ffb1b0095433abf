// SPDX-License-Identifier: AGPL-3.0
// LAN Shuttle Core - Wire protocol
//
// Every frame on a transfer link or relay connection is:
//
//   [u32 BE header length][u32 BE payload length][JSON header][payload bytes]
//
// Only chunk frames carry a payload. The JSON header keeps the control
// messages readable; the raw payload keeps file bytes out of the JSON.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::codec::{Decoder, Encoder};

use crate::types::{FileDescriptor, Role, SessionId};

/// Bumped whenever frames change incompatibly
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest JSON header accepted
pub const MAX_HEADER_LEN: usize = 64 * 1024;

/// Largest chunk payload accepted
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

const PREFIX_LEN: usize = 8;

/// Receiver verdict on one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AckStatus {
    Ok,
    Mismatch,
}

/// Frame header. Serialized as JSON tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Header {
    /// First frame from the receiver on every link
    Hello {
        protocol_version: u32,
        code: String,
        role: Role,
        /// Set when the receiver is resuming an interrupted session
        #[serde(default)]
        resume_session: Option<SessionId>,
    },
    /// Sender accepts the link and freezes the manifest
    Welcome {
        session_id: SessionId,
        sender_name: String,
        chunk_size: usize,
        files: Vec<FileDescriptor>,
    },
    Reject {
        reason: String,
    },
    Chunk {
        file_index: u32,
        chunk_index: u64,
        byte_offset: u64,
        length: u32,
        /// SHA-256 of the payload, hex encoded
        checksum: String,
    },
    Ack {
        file_index: u32,
        chunk_index: u64,
        status: AckStatus,
    },
    FileComplete {
        file_index: u32,
        content_hash: String,
    },
    FileVerified {
        file_index: u32,
        ok: bool,
    },
    SessionComplete,
    /// The peer's user stopped the transfer
    Cancel {
        reason: String,
    },
    /// The peer hit an unrecoverable error
    Abort {
        reason: String,
    },
    RelayRegister {
        digest: String,
    },
    RelayJoin {
        digest: String,
    },
    RelayPaired,
    RelayRejected {
        reason: String,
    },
}

impl Header {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Header::Hello { .. } => "hello",
            Header::Welcome { .. } => "welcome",
            Header::Reject { .. } => "reject",
            Header::Chunk { .. } => "chunk",
            Header::Ack { .. } => "ack",
            Header::FileComplete { .. } => "fileComplete",
            Header::FileVerified { .. } => "fileVerified",
            Header::SessionComplete => "sessionComplete",
            Header::Cancel { .. } => "cancel",
            Header::Abort { .. } => "abort",
            Header::RelayRegister { .. } => "relayRegister",
            Header::RelayJoin { .. } => "relayJoin",
            Header::RelayPaired => "relayPaired",
            Header::RelayRejected { .. } => "relayRejected",
        }
    }
}

/// One unit on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: Header,
    pub payload: Bytes,
}

impl Frame {
    /// A frame without payload
    pub fn control(header: Header) -> Self {
        Self {
            header,
            payload: Bytes::new(),
        }
    }

    /// A chunk frame; the checksum is computed from `payload`
    pub fn chunk(file_index: u32, chunk_index: u64, byte_offset: u64, payload: Bytes) -> Self {
        Self {
            header: Header::Chunk {
                file_index,
                chunk_index,
                byte_offset,
                length: payload.len() as u32,
                checksum: checksum(&payload),
            },
            payload,
        }
    }
}

impl From<Header> for Frame {
    fn from(header: Header) -> Self {
        Frame::control(header)
    }
}

/// SHA-256 of `data`, hex encoded
pub fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Errors raised while framing
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Length-prefixed JSON header + raw payload codec
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if src.len() < PREFIX_LEN {
            return Ok(None);
        }

        let mut prefix = &src[..PREFIX_LEN];
        let header_len = prefix.get_u32() as usize;
        let payload_len = prefix.get_u32() as usize;

        if header_len == 0 || header_len > MAX_HEADER_LEN {
            return Err(CodecError::Malformed(format!(
                "header length {} out of range",
                header_len
            )));
        }
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(CodecError::Malformed(format!(
                "payload length {} exceeds maximum {}",
                payload_len, MAX_PAYLOAD_LEN
            )));
        }

        let total = PREFIX_LEN + header_len + payload_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(PREFIX_LEN);
        let header_bytes = src.split_to(header_len);
        let payload = src.split_to(payload_len).freeze();

        let header: Header = serde_json::from_slice(&header_bytes)
            .map_err(|e| CodecError::Malformed(format!("bad header: {}", e)))?;

        match &header {
            Header::Chunk { length, .. } if *length as usize != payload.len() => {
                return Err(CodecError::Malformed(format!(
                    "chunk declares {} bytes but carries {}",
                    length,
                    payload.len()
                )));
            }
            Header::Chunk { .. } => {}
            other if !payload.is_empty() => {
                return Err(CodecError::Malformed(format!(
                    "{} frame must not carry a payload",
                    other.kind()
                )));
            }
            _ => {}
        }

        Ok(Some(Frame { header, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let header = serde_json::to_vec(&frame.header)
            .map_err(|e| CodecError::Malformed(format!("cannot encode header: {}", e)))?;

        if header.len() > MAX_HEADER_LEN {
            return Err(CodecError::Malformed(format!(
                "header too large: {} bytes",
                header.len()
            )));
        }
        if frame.payload.len() > MAX_PAYLOAD_LEN {
            return Err(CodecError::Malformed(format!(
                "payload too large: {} bytes",
                frame.payload.len()
            )));
        }

        dst.reserve(PREFIX_LEN + header.len() + frame.payload.len());
        dst.put_u32(header.len() as u32);
        dst.put_u32(frame.payload.len() as u32);
        dst.put_slice(&header);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}
