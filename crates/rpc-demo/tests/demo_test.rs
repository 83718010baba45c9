//! End-to-end test of the demo protocol.

use std::thread;
use std::time::Duration;

use proven_rpc::RpcServer;
use proven_rpc_demo::{DemoClient, PASS_STRING_REPLY_LEN, STAT_RESULT, server};

const TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn test_demo_round_trip() {
    let mut rpc_server = RpcServer::builder()
        .addr("127.0.0.1:0")
        .server_id(42)
        .build()
        .unwrap();
    server::register(&mut rpc_server).unwrap();
    let addr = rpc_server.local_addr().to_string();
    let handle = rpc_server.handle();
    let reactor = thread::spawn(move || rpc_server.start());

    let client = DemoClient::connect(&addr, TIMEOUT).unwrap();
    assert_eq!(client.rpc().server_id(), Some(42));
    assert_eq!(client.stat(1).unwrap(), STAT_RESULT);

    let text = "line\n".repeat(10_000);
    let reply = client.pass_string(&text).unwrap();
    assert_eq!(reply.len(), PASS_STRING_REPLY_LEN);

    drop(client);
    handle.stop();
    reactor.join().unwrap().unwrap();
}

#[test]
fn test_bare_port_address() {
    let mut rpc_server = RpcServer::builder().addr("127.0.0.1:0").build().unwrap();
    server::register(&mut rpc_server).unwrap();
    let port = rpc_server.local_addr().port().to_string();
    let handle = rpc_server.handle();
    let reactor = thread::spawn(move || rpc_server.start());

    let client = DemoClient::connect(&port, TIMEOUT).unwrap();
    assert_eq!(client.stat(7).unwrap(), STAT_RESULT);

    drop(client);
    handle.stop();
    reactor.join().unwrap().unwrap();
}
