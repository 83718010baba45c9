//! Server side of the demo protocol.

use proven_rpc::RpcServer;
use proven_rpc::clock::elapsed_micros;
use tracing::info;

use crate::{PASS_STRING, PASS_STRING_REPLY_LEN, STAT, STAT_RESULT};

/// Answers [`STAT_RESULT`] regardless of the argument.
#[must_use]
pub fn stat(client_id: u32, _var: u64) -> i32 {
    info!("Received stat request from client {:#010x}", client_id);
    STAT_RESULT
}

/// Logs the one-way latency measured from `start_us` and answers a string of
/// [`PASS_STRING_REPLY_LEN`] NUL characters.
#[must_use]
#[allow(clippy::needless_pass_by_value)]
pub fn pass_string(client_id: u32, start_us: u64, text: String) -> String {
    info!(
        "Received pass_string request from client {:#010x} with {} bytes",
        client_id,
        text.len()
    );
    info!(
        "RPC (client->server) latency: {} usec",
        elapsed_micros(start_us)
    );
    "\0".repeat(PASS_STRING_REPLY_LEN)
}

/// Registers both demo procedures.
///
/// # Errors
///
/// Returns an error if either proc id is already taken.
pub fn register(server: &mut RpcServer) -> proven_rpc::Result<()> {
    server.register(STAT, stat)?;
    server.register(PASS_STRING, pass_string)?;
    Ok(())
}
