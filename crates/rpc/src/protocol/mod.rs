//! Protocol layer for the RPC runtime.
//!
//! This module contains the wire-level definitions:
//! - The marshalling codec
//! - Request and reply headers
//! - Length-prefixed framing

pub mod codec;
pub mod framing;
pub mod header;

pub use codec::{Marshal, Marshaller, Unmarshal, Unmarshaller};
pub use framing::{DEFAULT_BATCH_SIZE, InboundFrame, MAX_FRAME_SIZE, OutboundFrame};
pub use header::{BIND_PROC, HEADER_SIZE, ReplyHeader, RequestHeader};
