//! Demo protocol for the RPC runtime.
//!
//! Two procedures: `stat`, which answers a constant, and `pass_string`, which
//! takes a blob of text and answers a fixed 32 KiB string. Together they
//! exercise small and large round trips.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod client;
pub mod error;
pub mod server;

pub use client::DemoClient;
pub use error::{Error, Result};

/// Proc id of `stat(client_id: u32, var: u64) -> i32`.
pub const STAT: u32 = 0x7001;

/// Proc id of `pass_string(client_id: u32, start_us: u64, text: String) -> String`.
pub const PASS_STRING: u32 = 0x7002;

/// Value returned by `stat`.
pub const STAT_RESULT: i32 = 12345;

/// Length of the string returned by `pass_string`.
pub const PASS_STRING_REPLY_LEN: usize = 1 << 15;

/// Default port of the demo server.
pub const DEFAULT_PORT: u16 = 8888;
