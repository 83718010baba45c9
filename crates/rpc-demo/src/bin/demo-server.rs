//! Demo RPC server binary.
//!
//! Serves the `stat` and `pass_string` procedures until interrupted.

use clap::Parser;
use proven_rpc::RpcServer;
use proven_rpc_demo::{DEFAULT_PORT, server};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Demo RPC server", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0", env = "PROVEN_RPC_DEMO_HOST")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "PROVEN_RPC_DEMO_PORT")]
    port: u16,

    /// Fixed server incarnation id (random when unset)
    #[arg(long, env = "PROVEN_RPC_DEMO_SERVER_ID")]
    server_id: Option<u32>,

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

    let mut builder = RpcServer::builder().addr(format!("{}:{}", args.host, args.port));
    if let Some(server_id) = args.server_id {
        builder = builder.server_id(server_id);
    }

    let mut rpc = builder.build()?;
    server::register(&mut rpc)?;

    info!("Demo server listening on {}", rpc.local_addr());

    if let Err(e) = rpc.start() {
        error!("Demo server error: {}", e);
        return Err(e.into());
    }

    Ok(())
}
