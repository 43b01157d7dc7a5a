// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire protocol for the Pegboard runner control channel.
//!
//! Frames are length-prefixed binary: a 6-byte header (payload length +
//! protocol version) followed by a MessagePack-encoded tagged union. The
//! inbound union is [`ToClient`], the outbound union is [`ToServer`].

pub mod codec;
pub mod frame;
pub mod message;

pub use codec::{
    PROTOCOL_VERSION, decode_to_client, decode_to_server, encode_to_client, encode_to_server,
};
pub use frame::{Frame, FrameError, HEADER_SIZE, MAX_FRAME_SIZE};
pub use message::*;
