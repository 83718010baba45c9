//! Request and reply headers.
//!
//! Every frame starts with a fixed reserved region of [`HEADER_SIZE`] bytes:
//! the 4-byte length prefix followed by room for the larger of the two
//! headers. The region is overwritten in place just before transmission, so
//! the payload can be serialized first.

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Encoded size of a [`RequestHeader`].
pub const REQUEST_HEADER_SIZE: usize = 16;

/// Encoded size of a [`ReplyHeader`].
pub const REPLY_HEADER_SIZE: usize = 8;

/// Size of the reserved region in front of every payload.
pub const HEADER_SIZE: usize = LENGTH_PREFIX_SIZE + max(REQUEST_HEADER_SIZE, REPLY_HEADER_SIZE);

/// Procedure id reserved for the bind handshake.
pub const BIND_PROC: u32 = 1;

const fn max(a: usize, b: usize) -> usize {
    if a > b { a } else { b }
}

/// Header of a request frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestHeader {
    /// Client-assigned id used to correlate the reply.
    pub request_id: i32,
    /// Procedure to invoke.
    pub proc_id: u32,
    /// Random id of the calling client.
    pub client_id: u32,
    /// Incarnation id the client bound to, zero before bind.
    pub server_id: u32,
}

/// Header of a reply frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplyHeader {
    /// Id of the request this reply answers.
    pub request_id: i32,
    /// Zero on success, a negative [`crate::error::code`] on failure.
    pub result_code: i32,
}
