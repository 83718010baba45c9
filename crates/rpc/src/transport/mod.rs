//! Transport layer for the RPC runtime.
//!
//! This module handles the socket side of things: readiness polling, the
//! framed connection state machine, and the client and server endpoints.

pub mod client;
pub mod connection;
pub mod poll;
pub mod server;

pub use client::{ClientBuilder, ClientConfig, RpcClient};
pub use connection::{Connection, ConnectionConfig};
pub use poll::Waker;
pub use server::{RpcServer, ServerBuilder, ServerConfig, ServerHandle};
