//! Minimal synchronous RPC runtime over TCP.
//!
//! This crate provides a small request/response RPC framework: a fixed
//! big-endian binary codec, length-prefixed framing, a client endpoint that
//! turns asynchronous replies into blocking calls with deadlines, and a
//! single-threaded reactor server that dispatches to registered procedures.
//!
//! # Features
//!
//! - **Typed procedures**: Register plain closures of up to seven arguments
//! - **Out-of-order replies**: Concurrent calls are matched by request id
//! - **Restart detection**: Clients bind to one server incarnation and get
//!   [`Error::OldServer`] after a restart
//! - **No async runtime**: `poll(2)` readiness and plain threads
//!
//! # Example
//!
//! ```no_run
//! use std::thread;
//! use std::time::Duration;
//!
//! use proven_rpc::{RpcClient, RpcServer};
//!
//! const STAT: u32 = 0x7001;
//!
//! fn example() -> proven_rpc::Result<()> {
//!     let mut server = RpcServer::builder().addr("127.0.0.1:8888").build()?;
//!     server.register(STAT, |_client: u32, _var: u64| 12345i32)?;
//!     let handle = server.handle();
//!     let reactor = thread::spawn(move || server.start());
//!
//!     let client = RpcClient::builder().addr("127.0.0.1:8888").build()?;
//!     client.bind(Duration::from_secs(5))?;
//!
//!     let value: i32 = client.call(STAT, Duration::from_secs(5), (client.id(), 1u64))?;
//!     assert_eq!(value, 12345);
//!
//!     handle.stop();
//!     let _ = reactor.join();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod clock;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use error::{Error, Result};
pub use handler::{Handler, Procedure, ProcedureHandler, Registry};
pub use protocol::{
    codec::{Marshal, Marshaller, Unmarshal, Unmarshaller},
    header::{BIND_PROC, ReplyHeader, RequestHeader},
};
pub use transport::{
    client::{ClientBuilder, ClientConfig, RpcClient},
    connection::{Connection, ConnectionConfig},
    server::{RpcServer, ServerBuilder, ServerConfig, ServerHandle},
};

// Re-export dependencies that are part of our public API
pub use bytes::Bytes;
