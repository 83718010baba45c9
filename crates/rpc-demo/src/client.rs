//! Client side of the demo protocol.

use std::fs;
use std::path::Path;
use std::time::Duration;

use proven_rpc::RpcClient;
use proven_rpc::clock::monotonic_micros;
use tracing::warn;

use crate::error::{Error, Result};
use crate::{DEFAULT_PORT, PASS_STRING, STAT};

/// Typed wrapper around an [`RpcClient`] speaking the demo protocol.
#[derive(Debug)]
pub struct DemoClient {
    rpc: RpcClient,
    timeout: Duration,
}

impl DemoClient {
    /// Connects to `addr` and binds.
    ///
    /// A failed bind is logged and the client is returned unbound, so the
    /// following calls report it.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let rpc = RpcClient::builder()
            .addr(normalize_addr(addr))
            .default_timeout(timeout)
            .build()?;

        if let Err(e) = rpc.bind(timeout) {
            warn!("Failed to bind to {}: {}", addr, e);
        }

        Ok(Self { rpc, timeout })
    }

    /// The underlying RPC client.
    #[must_use]
    pub const fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    /// Calls `stat`.
    ///
    /// # Errors
    ///
    /// Returns the RPC failure.
    pub fn stat(&self, var: u64) -> Result<i32> {
        Ok(self.rpc.call(STAT, self.timeout, (self.rpc.id(), var))?)
    }

    /// Calls `pass_string`, stamping the request with the current monotonic
    /// time so the server can log one-way latency.
    ///
    /// # Errors
    ///
    /// Returns the RPC failure.
    pub fn pass_string(&self, text: &str) -> Result<String> {
        let args = (self.rpc.id(), monotonic_micros(), text);
        Ok(self.rpc.call(PASS_STRING, self.timeout, args)?)
    }
}

/// Accepts `host:port` or a bare port, which means localhost.
#[must_use]
pub fn normalize_addr(addr: &str) -> String {
    if addr.contains(':') {
        addr.to_string()
    } else if addr.is_empty() {
        format!("127.0.0.1:{DEFAULT_PORT}")
    } else {
        format!("127.0.0.1:{addr}")
    }
}

/// Reads `path` line by line, terminating every line with `\n`.
///
/// # Errors
///
/// Returns [`Error::Input`] if the file cannot be read.
pub fn read_input(path: &Path) -> Result<String> {
    let contents = fs::read_to_string(path).map_err(|source| Error::Input {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(contents.lines().flat_map(|line| [line, "\n"]).collect())
}
