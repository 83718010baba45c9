//! RPC server endpoint.
//!
//! A single-threaded reactor: every iteration waits for readiness on the
//! listener and all connections, accepts and drives I/O, dispatches every
//! completed request in order, then sweeps dead connections. Handlers run on
//! the reactor thread, so a slow handler stalls every connection.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use nix::poll::{PollFd, PollFlags};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, trace, warn};

use super::connection::{Connection, ConnectionConfig};
use super::poll::{Waker, is_ready, wait};
use crate::error::{Error, Result, code};
use crate::handler::{Handler, Procedure, Registry};
use crate::protocol::codec::{Marshaller, Unmarshal, Unmarshaller};
use crate::protocol::header::{BIND_PROC, ReplyHeader};

/// Configuration for the RPC server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Configuration applied to every accepted connection.
    pub connection: ConnectionConfig,
    /// Listen backlog.
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            backlog: 1000,
        }
    }
}

/// Builder for creating RPC servers.
#[derive(Debug, Default)]
pub struct ServerBuilder {
    addr: Option<String>,
    server_id: Option<u32>,
    config: ServerConfig,
}

impl ServerBuilder {
    /// Create a new server builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the listen address, as `host:port`.
    #[must_use]
    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = Some(addr.into());
        self
    }

    /// Use a fixed incarnation id instead of a random one.
    #[must_use]
    pub const fn server_id(mut self, server_id: u32) -> Self {
        self.server_id = Some(server_id);
        self
    }

    /// Set the maximum frame size.
    #[must_use]
    pub const fn max_frame_size(mut self, size: usize) -> Self {
        self.config.connection.max_frame_size = size;
        self
    }

    /// Set the listen backlog.
    #[must_use]
    pub const fn backlog(mut self, backlog: i32) -> Self {
        self.config.backlog = backlog;
        self
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Bind the listener and register the bind procedure.
    ///
    /// # Errors
    ///
    /// Returns an error if no address was set, it does not resolve, or the
    /// listener cannot be created.
    pub fn build(self) -> Result<RpcServer> {
        let addr = self.addr.ok_or_else(|| Error::Resolve(String::new()))?;
        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|_| Error::Resolve(addr.clone()))?
            .next()
            .ok_or_else(|| Error::Resolve(addr.clone()))?;

        let listener = listen(socket_addr, self.config.backlog)?;
        let local_addr = listener.local_addr()?;
        let server_id = self.server_id.unwrap_or_else(rand::random);

        let mut registry = Registry::new();
        registry.register(BIND_PROC, move |_: i32| server_id)?;

        info!(
            "RPC server {:#010x} listening on {}",
            server_id, local_addr
        );

        Ok(RpcServer {
            listener,
            local_addr,
            server_id,
            config: self.config,
            registry,
            connections: HashMap::new(),
            next_token: 0,
            waker: Arc::new(Waker::new()?),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }
}

fn listen(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Stops a running [`RpcServer`] from another thread.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ServerHandle {
    /// Asks the reactor to return from [`RpcServer::start`] after the
    /// current iteration.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.waker.wake();
    }

    /// Whether a stop was requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// RPC server that listens for incoming connections.
#[derive(Debug)]
pub struct RpcServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    server_id: u32,
    config: ServerConfig,
    registry: Registry,
    connections: HashMap<u64, Connection>,
    next_token: u64,
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
}

impl RpcServer {
    /// Create a new server builder.
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Registers a typed procedure under `proc_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateProcedure`] if the id is taken, including
    /// the reserved bind id.
    pub fn register<P, Args>(&mut self, proc_id: u32, procedure: P) -> Result<()>
    where
        P: Procedure<Args>,
        Args: Unmarshal + 'static,
    {
        self.registry.register(proc_id, procedure)?;
        debug!("Registered proc {:#x}", proc_id);
        Ok(())
    }

    /// Registers a hand-written handler under `proc_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateProcedure`] if the id is taken.
    pub fn register_handler(&mut self, proc_id: u32, handler: Box<dyn Handler>) -> Result<()> {
        self.registry.register_handler(proc_id, handler)
    }

    /// Address the listener is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// This instance's incarnation id.
    #[must_use]
    pub const fn server_id(&self) -> u32 {
        self.server_id
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Handle for stopping the reactor from another thread.
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            stop: Arc::clone(&self.stop),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Runs the reactor until [`ServerHandle::stop`] is called.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting for readiness fails.
    pub fn start(&mut self) -> Result<()> {
        info!("RPC server {:#010x} started", self.server_id);

        while !self.stop.load(Ordering::Acquire) {
            self.run_once(None)?;
        }

        info!("RPC server {:#010x} stopped", self.server_id);
        Ok(())
    }

    /// Runs one reactor iteration: wait for readiness up to `timeout`, drive
    /// I/O, dispatch every completed request, drop dead connections.
    ///
    /// Returns the number of requests dispatched.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting for readiness fails.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<usize> {
        self.poll_and_push(timeout)?;
        let dispatched = self.process();
        self.sweep();
        Ok(dispatched)
    }

    fn poll_and_push(&mut self, timeout: Option<Duration>) -> Result<()> {
        let tokens: Vec<u64> = self.connections.keys().copied().collect();

        let (accept, woken, ready) = {
            let mut fds = Vec::with_capacity(tokens.len() + 2);
            fds.push(PollFd::new(&self.listener, PollFlags::POLLIN));
            fds.push(PollFd::new(self.waker.as_ref(), PollFlags::POLLIN));
            for token in &tokens {
                let conn = &self.connections[token];
                let mut interest = PollFlags::POLLIN;
                if conn.has_pending_writes() {
                    interest |= PollFlags::POLLOUT;
                }
                fds.push(PollFd::new(conn, interest));
            }

            wait(&mut fds, timeout)?;

            let ready: Vec<(u64, bool, bool)> = tokens
                .iter()
                .zip(&fds[2..])
                .map(|(token, fd)| {
                    (
                        *token,
                        is_ready(fd, PollFlags::POLLIN),
                        is_ready(fd, PollFlags::POLLOUT),
                    )
                })
                .filter(|(_, readable, writable)| *readable || *writable)
                .collect();

            (
                is_ready(&fds[0], PollFlags::POLLIN),
                is_ready(&fds[1], PollFlags::POLLIN),
                ready,
            )
        };

        if woken {
            self.waker.drain();
        }
        if accept {
            self.accept();
        }

        for (token, readable, writable) in ready {
            let Some(conn) = self.connections.get(&token) else {
                continue;
            };
            if writable {
                conn.write_ready();
            }
            if readable {
                conn.read_ready();
            }
        }

        Ok(())
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    match Connection::new(stream, self.config.connection.clone()) {
                        Ok(conn) => {
                            let token = self.next_token;
                            self.next_token += 1;
                            self.connections.insert(token, conn);
                            debug!("Accepted connection {} from {}", token, peer);
                        }
                        Err(e) => warn!("Failed to set up connection from {}: {}", peer, e),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    break;
                }
            }
        }
    }

    fn process(&self) -> usize {
        let mut dispatched = 0;

        for conn in self.connections.values() {
            for frame in conn.drain_inbound() {
                let Some(reply) = self.dispatch(frame) else {
                    continue;
                };
                dispatched += 1;
                if let Err(e) = conn.send(reply) {
                    error!("Dropping reply to {:?}: {}", conn.peer_addr(), e);
                }
            }
        }

        dispatched
    }

    /// Routes one request frame and builds the reply frame. `None` when the
    /// frame cannot even be addressed.
    fn dispatch(&self, frame: Bytes) -> Option<BytesMut> {
        let mut request = Unmarshaller::new(frame);
        let header = request.unpack_request_header();
        if !request.is_ok() {
            debug!("Dropping request frame too short for a header");
            return None;
        }
        trace!(
            "Request {} for proc {:#x} from client {:#010x}",
            header.request_id, header.proc_id, header.client_id
        );

        let mut reply = Marshaller::new();
        let result_code = if header.server_id != 0 && header.server_id != self.server_id {
            warn!(
                "Request {} from client {:#010x} addressed old server instance {:#010x}",
                header.request_id, header.client_id, header.server_id
            );
            code::OLDSRV_FAILURE
        } else if let Some(handler) = self.registry.get(header.proc_id) {
            match handler.handle(&mut request, &mut reply) {
                Ok(()) => code::OK,
                Err(e) => {
                    warn!(
                        "Proc {:#x} failed for client {:#010x}: {}",
                        header.proc_id, header.client_id, e
                    );
                    reply = Marshaller::new();
                    e.code().unwrap_or(code::UNMARSHAL_ARGS_FAILURE)
                }
            }
        } else {
            warn!(
                "Unknown proc {:#x} requested by client {:#010x}",
                header.proc_id, header.client_id
            );
            code::UNKNOWN_PROC
        };

        reply.pack_reply_header(&ReplyHeader {
            request_id: header.request_id,
            result_code,
        });
        Some(reply.into_frame())
    }

    fn sweep(&mut self) {
        self.connections.retain(|token, conn| {
            if conn.is_dead() {
                debug!("Removing dead connection {} from {:?}", token, conn.peer_addr());
                conn.close();
                false
            } else {
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::header::RequestHeader;
    use std::io::Write;
    use std::net::TcpStream;
    use std::sync::atomic::AtomicUsize;
    use tracing_test::traced_test;

    const SERVER_ID: u32 = 0xfeed_0001;

    fn server() -> RpcServer {
        RpcServer::builder()
            .addr("127.0.0.1:0")
            .server_id(SERVER_ID)
            .build()
            .unwrap()
    }

    fn request(proc_id: u32, server_id: u32, args: &Marshaller) -> Bytes {
        let mut m = Marshaller::new();
        m.put_raw(args.payload());
        m.pack_request_header(&RequestHeader {
            request_id: 5,
            proc_id,
            client_id: 0xc11e,
            server_id,
        });
        m.into_frame().freeze()
    }

    fn reply_of(frame: BytesMut) -> (ReplyHeader, Unmarshaller) {
        let mut u = Unmarshaller::new(frame.freeze());
        let header = u.unpack_reply_header();
        (header, u)
    }

    fn args(value: u64) -> Marshaller {
        let mut m = Marshaller::new();
        m.pack(&value);
        m
    }

    #[test]
    fn test_dispatch_invokes_procedure() {
        let mut server = server();
        server.register(0x7001, |_: u64| 12345i32).unwrap();

        let frame = server.dispatch(request(0x7001, SERVER_ID, &args(1))).unwrap();
        let (header, mut body) = reply_of(frame);

        assert_eq!(header.request_id, 5);
        assert_eq!(header.result_code, code::OK);
        assert_eq!(body.unpack::<i32>(), 12345);
        assert!(body.fully_consumed());
    }

    #[test]
    fn test_bind_returns_incarnation_id() {
        let server = server();
        let mut bind_args = Marshaller::new();
        bind_args.pack(&0i32);

        let frame = server.dispatch(request(BIND_PROC, 0, &bind_args)).unwrap();
        let (header, mut body) = reply_of(frame);

        assert_eq!(header.result_code, code::OK);
        assert_eq!(body.unpack::<u32>(), SERVER_ID);
    }

    #[test]
    fn test_stale_server_id_is_rejected_without_invoking() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let mut server = server();
        server
            .register(0x7001, move |_: u64| {
                seen.fetch_add(1, Ordering::SeqCst);
                0i32
            })
            .unwrap();

        let frame = server.dispatch(request(0x7001, SERVER_ID + 1, &args(1))).unwrap();
        let (header, body) = reply_of(frame);

        assert_eq!(header.result_code, code::OLDSRV_FAILURE);
        assert!(body.fully_consumed());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    #[traced_test]
    fn test_unknown_proc() {
        let server = server();
        let frame = server.dispatch(request(0x9999, SERVER_ID, &args(1))).unwrap();
        let (header, _) = reply_of(frame);

        assert_eq!(header.result_code, code::UNKNOWN_PROC);
        assert!(logs_contain("Unknown proc 0x9999"));
    }

    #[test]
    fn test_bad_arguments_reply_has_empty_body() {
        let mut server = server();
        server.register(0x7002, |text: String| text).unwrap();

        let frame = server.dispatch(request(0x7002, SERVER_ID, &args(u64::MAX))).unwrap();
        let (header, body) = reply_of(frame);

        assert_eq!(header.result_code, code::UNMARSHAL_ARGS_FAILURE);
        assert_eq!(body.remaining(), 0);
    }

    #[test]
    fn test_truncated_header_is_dropped() {
        let server = server();
        assert!(server.dispatch(Bytes::from_static(&[0, 0, 0, 8, 1, 2, 3, 4])).is_none());
    }

    #[test]
    fn test_run_once_counts_only_dispatched_requests() {
        let mut server = server();
        server.register(0x7001, |_: u64| 12345i32).unwrap();

        let mut valid = request(0x7001, SERVER_ID, &args(1)).to_vec();
        let len = u32::try_from(valid.len()).unwrap();
        valid[..4].copy_from_slice(&len.to_be_bytes());
        let mut bytes = vec![0, 0, 0, 8, 1, 2, 3, 4];
        bytes.extend_from_slice(&valid);

        let mut stream = TcpStream::connect(server.local_addr()).unwrap();
        stream.write_all(&bytes).unwrap();
        stream.set_nonblocking(true).unwrap();

        let mut prefix = [0u8; 4];
        let mut dispatched = 0;
        let mut answered = false;
        for _ in 0..100 {
            dispatched += server.run_once(Some(Duration::from_millis(20))).unwrap();
            if stream.peek(&mut prefix).is_ok_and(|n| n == 4) {
                answered = true;
                break;
            }
        }

        assert!(answered);
        assert_eq!(dispatched, 1);
    }

    #[test]
    fn test_bind_id_is_reserved() {
        let mut server = server();
        let result = server.register(BIND_PROC, |x: u32| x);
        assert!(matches!(result, Err(Error::DuplicateProcedure(BIND_PROC))));
    }

    #[test]
    fn test_handle_stops_reactor() {
        let mut server = server();
        let handle = server.handle();
        handle.stop();

        assert!(handle.is_stopped());
        server.start().unwrap();
    }
}
