// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for control-channel framing.
//!
//! Each WebSocket binary message carries one packet with the following
//! frame format:
//! - 4 bytes: payload length (big-endian)
//! - 2 bytes: protocol version
//! - N bytes: MessagePack payload

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Maximum frame size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame header size (4 bytes length + 2 bytes protocol version).
pub const HEADER_SIZE: usize = 6;

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("incomplete frame: {0}")]
    Truncated(&'static str),

    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

/// A framed packet with protocol version and payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub version: u16,
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame carrying the given message.
    pub fn new<M: Serialize>(version: u16, msg: &M) -> Result<Self, FrameError> {
        let payload = rmp_serde::to_vec(msg)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload.len()));
        }
        Ok(Self {
            version,
            payload: Bytes::from(payload),
        })
    }

    /// Decode the payload as a MessagePack message.
    pub fn decode<M: DeserializeOwned>(&self) -> Result<M, FrameError> {
        Ok(rmp_serde::from_slice(&self.payload)?)
    }

    /// Encode the frame to bytes for wire transmission.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u16(self.version);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    /// Decode a frame from bytes.
    pub fn decode_from_bytes(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Truncated("incomplete frame header"));
        }

        let length = bytes.get_u32() as usize;
        let version = bytes.get_u16();

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length));
        }

        if bytes.len() < length {
            return Err(FrameError::Truncated("incomplete frame payload"));
        }

        let payload = bytes.split_to(length);
        Ok(Self { version, payload })
    }
}
