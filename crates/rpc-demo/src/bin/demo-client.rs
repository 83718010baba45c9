//! Demo RPC client binary.
//!
//! Calls `stat`, then sends the contents of an input file through
//! `pass_string` and prints the round-trip latency.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use proven_rpc::clock::{elapsed_micros, monotonic_micros};
use proven_rpc_demo::DemoClient;
use proven_rpc_demo::client::read_input;

#[derive(Parser, Debug)]
#[command(author, version, about = "Demo RPC client", long_about = None)]
struct Args {
    /// Server address, as host:port or a bare port on localhost
    #[arg(default_value = "127.0.0.1:8888", env = "PROVEN_RPC_DEMO_ADDR")]
    addr: String,

    /// File whose contents are sent with pass_string
    #[arg(short, long, default_value = "input.txt", env = "PROVEN_RPC_DEMO_INPUT")]
    input: PathBuf,

    /// Call timeout in seconds
    #[arg(long, default_value_t = 120, env = "PROVEN_RPC_DEMO_TIMEOUT")]
    timeout: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<(), proven_rpc_demo::Error> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(log_level).init();

    let client = DemoClient::connect(&args.addr, Duration::from_secs(args.timeout))?;

    let r = client.stat(1)?;
    println!("stat returned {r}");

    let text = read_input(&args.input)?;

    let start = monotonic_micros();
    let reply = client.pass_string(&text)?;
    let rtt = elapsed_micros(start);

    println!("pass {} bytes, returned {} bytes", text.len(), reply.len());
    println!("RPC (RTT) latency: {rtt} usec");

    Ok(())
}
