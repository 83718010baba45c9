//! Error types for the RPC runtime.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Result codes carried in the reply header.
///
/// Zero means the procedure ran. Negative values are runtime failures and map
/// onto [`Error`] variants through [`Error::from_code`].
pub mod code {
    /// The procedure ran and the reply payload holds its result.
    pub const OK: i32 = 0;
    /// No reply arrived before the caller's deadline.
    pub const TIMEOUT_FAILURE: i32 = -1;
    /// The server could not decode the request payload.
    pub const UNMARSHAL_ARGS_FAILURE: i32 = -2;
    /// The client could not decode the reply payload.
    pub const UNMARSHAL_REPLY_FAILURE: i32 = -3;
    /// Reserved for at-most-once duplicate suppression, which is not implemented.
    pub const ATMOSTONCE_FAILURE: i32 = -4;
    /// The request addressed a previous incarnation of the server.
    pub const OLDSRV_FAILURE: i32 = -5;
    /// Call before bind, or a second bind.
    pub const BIND_FAILURE: i32 = -6;
    /// Reserved for call cancellation, which is not implemented.
    pub const CANCEL_FAILURE: i32 = -7;
    /// No procedure registered under the requested id.
    pub const UNKNOWN_PROC: i32 = -8;
}

/// Main error type for RPC operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No reply arrived before the deadline.
    #[error("RPC timed out after {0:?}")]
    Timeout(Duration),

    /// The server failed to decode the arguments for the requested procedure.
    #[error("server failed to unmarshal the request arguments")]
    UnmarshalArgs,

    /// The reply did not match the expected result type.
    ///
    /// This is a contract violation on the calling side: the caller used the
    /// wrong result type for the procedure.
    #[error("failed to unmarshal the reply of proc {proc_id:#x}, wrong return type?")]
    UnmarshalReply {
        /// Procedure that was called.
        proc_id: u32,
    },

    /// The request was addressed to a server instance that has since restarted.
    #[error("request addressed an old server instance")]
    OldServer,

    /// Call issued before a successful bind, or a duplicate bind.
    #[error("client is not bound, or is already bound")]
    Bind,

    /// No procedure is registered under this id.
    #[error("unknown procedure {0:#x}")]
    UnknownProc(u32),

    /// The server answered with a negative code this runtime does not know.
    #[error("remote failure with code {0}")]
    Remote(i32),

    /// A frame exceeded the configured maximum.
    #[error("frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the frame.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// A frame header declared an impossible length.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// A procedure id was registered twice.
    #[error("procedure {0:#x} is already registered")]
    DuplicateProcedure(u32),

    /// The server address did not resolve.
    #[error("cannot resolve address {0}")]
    Resolve(String),

    /// Failed to establish the connection.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// The address we tried to connect to.
        addr: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Wire code for RPC-level failures, `None` for local-only errors.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Timeout(_) => Some(code::TIMEOUT_FAILURE),
            Self::UnmarshalArgs => Some(code::UNMARSHAL_ARGS_FAILURE),
            Self::UnmarshalReply { .. } => Some(code::UNMARSHAL_REPLY_FAILURE),
            Self::OldServer => Some(code::OLDSRV_FAILURE),
            Self::Bind => Some(code::BIND_FAILURE),
            Self::UnknownProc(_) => Some(code::UNKNOWN_PROC),
            Self::Remote(code) => Some(*code),
            _ => None,
        }
    }

    /// Maps a negative result code from a reply header back to an error.
    ///
    /// Returns `None` for non-negative codes, which are not failures.
    #[must_use]
    pub fn from_code(code: i32, proc_id: u32) -> Option<Self> {
        if code >= 0 {
            return None;
        }

        Some(match code {
            code::UNMARSHAL_ARGS_FAILURE => Self::UnmarshalArgs,
            code::UNMARSHAL_REPLY_FAILURE => Self::UnmarshalReply { proc_id },
            code::OLDSRV_FAILURE => Self::OldServer,
            code::BIND_FAILURE => Self::Bind,
            code::UNKNOWN_PROC => Self::UnknownProc(proc_id),
            other => Self::Remote(other),
        })
    }
}
