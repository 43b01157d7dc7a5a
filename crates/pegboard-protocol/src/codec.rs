// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Versioned encode/decode entry points for control-channel packets.

use bytes::Bytes;

use crate::frame::{Frame, FrameError};
use crate::message::{ToClient, ToServer};

/// Current protocol version, advertised in the connection URL and carried
/// in every frame header.
pub const PROTOCOL_VERSION: u16 = 1;

/// Encode a runner → server packet.
pub fn encode_to_server(msg: &ToServer) -> Result<Bytes, FrameError> {
    Ok(Frame::new(PROTOCOL_VERSION, msg)?.encode())
}

/// Decode a server → runner packet.
pub fn decode_to_client(buf: &[u8]) -> Result<ToClient, FrameError> {
    decode_checked(buf)
}

/// Encode a server → runner packet. Used by the server side and by tests
/// standing in for it.
pub fn encode_to_client(msg: &ToClient) -> Result<Bytes, FrameError> {
    Ok(Frame::new(PROTOCOL_VERSION, msg)?.encode())
}

/// Decode a runner → server packet. Used by the server side and by tests
/// standing in for it.
pub fn decode_to_server(buf: &[u8]) -> Result<ToServer, FrameError> {
    decode_checked(buf)
}

fn decode_checked<M: serde::de::DeserializeOwned>(buf: &[u8]) -> Result<M, FrameError> {
    let frame = Frame::decode_from_bytes(Bytes::copy_from_slice(buf))?;
    if frame.version != PROTOCOL_VERSION {
        return Err(FrameError::UnsupportedVersion(frame.version));
    }
    frame.decode()
}
