//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use proven_rpc::{
    Bytes, Marshal, Marshaller, ReplyHeader, RequestHeader, RpcClient, RpcServer, ServerHandle,
    Unmarshaller,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// A real server running its reactor on a background thread.
pub struct TestServer {
    pub addr: SocketAddr,
    pub server_id: u32,
    handle: ServerHandle,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn spawn(configure: impl FnOnce(&mut RpcServer)) -> Self {
        let mut server = RpcServer::builder().addr("127.0.0.1:0").build().unwrap();
        configure(&mut server);

        let addr = server.local_addr();
        let server_id = server.server_id();
        let handle = server.handle();
        let thread = thread::spawn(move || server.start().unwrap());

        Self {
            addr,
            server_id,
            handle,
            thread: Some(thread),
        }
    }

    pub fn client(&self) -> RpcClient {
        RpcClient::builder()
            .addr(self.addr.to_string())
            .wait_slice(Duration::from_millis(50))
            .build()
            .unwrap()
    }

    pub fn bound_client(&self) -> RpcClient {
        let client = self.client();
        assert_eq!(client.bind(TIMEOUT).unwrap(), self.server_id);
        client
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.stop();
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

/// Reads one whole frame from a blocking socket.
pub fn read_frame(stream: &mut TcpStream) -> Option<Bytes> {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).ok()?;
    let len = u32::from_be_bytes(prefix) as usize;

    let mut frame = vec![0u8; len];
    frame[..4].copy_from_slice(&prefix);
    stream.read_exact(&mut frame[4..]).ok()?;
    Some(Bytes::from(frame))
}

/// Patches the length prefix and writes the frame.
pub fn write_frame(stream: &mut TcpStream, m: Marshaller) {
    let mut frame = m.into_frame();
    let len = u32::try_from(frame.len()).unwrap();
    frame[..4].copy_from_slice(&len.to_be_bytes());
    stream.write_all(&frame).unwrap();
}

pub fn read_request(stream: &mut TcpStream) -> Option<(RequestHeader, Unmarshaller)> {
    let mut u = Unmarshaller::new(read_frame(stream)?);
    let header = u.unpack_request_header();
    assert!(u.is_ok());
    Some((header, u))
}

pub fn read_reply(stream: &mut TcpStream) -> Option<(ReplyHeader, Unmarshaller)> {
    let mut u = Unmarshaller::new(read_frame(stream)?);
    let header = u.unpack_reply_header();
    assert!(u.is_ok());
    Some((header, u))
}

pub fn send_request(stream: &mut TcpStream, header: RequestHeader, args: &impl Marshal) {
    let mut m = Marshaller::new();
    m.pack(args);
    m.pack_request_header(&header);
    write_frame(stream, m);
}

pub fn send_reply(stream: &mut TcpStream, request_id: i32, result_code: i32, value: &impl Marshal) {
    let mut m = Marshaller::new();
    m.pack(value);
    m.pack_reply_header(&ReplyHeader {
        request_id,
        result_code,
    });
    write_frame(stream, m);
}
