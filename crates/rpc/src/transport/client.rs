//! RPC client endpoint.
//!
//! The client owns one [`Connection`] and a background poller thread. Callers
//! register a pending call, send the request and block on the call's condition
//! variable; the poller reads replies and completes pending calls by request
//! id, so replies may arrive in any order.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use nix::poll::{PollFd, PollFlags};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use super::connection::{Connection, ConnectionConfig};
use super::poll::{Waker, is_ready, wait};
use crate::clock::{elapsed_micros, monotonic_micros};
use crate::error::{Error, Result};
use crate::protocol::codec::{Marshal, Marshaller, Unmarshal, Unmarshaller};
use crate::protocol::header::{BIND_PROC, RequestHeader};

/// Configuration for the RPC client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Connection configuration.
    pub connection: ConnectionConfig,
    /// Timeout used by callers that do not pick their own.
    pub default_timeout: Duration,
    /// Longest single wait before a blocked caller re-checks its deadline.
    pub wait_slice: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            default_timeout: Duration::from_secs(120),
            wait_slice: Duration::from_secs(1),
        }
    }
}

/// Builder for creating RPC clients.
#[derive(Debug, Default)]
pub struct ClientBuilder {
    addr: Option<String>,
    client_id: Option<u32>,
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a new client builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the server address, as `host:port`.
    #[must_use]
    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = Some(addr.into());
        self
    }

    /// Use a fixed client id instead of a random one.
    #[must_use]
    pub const fn client_id(mut self, client_id: u32) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// Set the default call timeout.
    #[must_use]
    pub const fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    /// Set the re-armed wait slice.
    #[must_use]
    pub const fn wait_slice(mut self, slice: Duration) -> Self {
        self.config.wait_slice = slice;
        self
    }

    /// Set the maximum frame size.
    #[must_use]
    pub const fn max_frame_size(mut self, size: usize) -> Self {
        self.config.connection.max_frame_size = size;
        self
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Connect and start the poller.
    ///
    /// # Errors
    ///
    /// Returns an error if no address was set, it does not resolve, the
    /// connection fails, or the poller thread cannot be spawned.
    pub fn build(self) -> Result<RpcClient> {
        let addr = self.addr.ok_or_else(|| Error::Resolve(String::new()))?;
        let client_id = self.client_id.unwrap_or_else(rand::random);

        let connection = Connection::connect(&addr, self.config.connection.clone())?;
        let shared = Arc::new(Shared {
            connection,
            waker: Waker::new()?,
            pending: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        });

        let poller = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("rpc-client-{client_id:08x}"))
                .spawn(move || poll_loop(&shared))?
        };

        info!("RPC client {:#010x} connected to {}", client_id, addr);

        Ok(RpcClient {
            shared,
            config: self.config,
            client_id,
            next_request_id: AtomicI32::new(1),
            server_id: RwLock::new(None),
            poller: Mutex::new(Some(poller)),
        })
    }
}

/// Reply handed from the poller to a waiting caller.
#[derive(Debug)]
struct Reply {
    result_code: i32,
    body: Unmarshaller,
}

#[derive(Debug, Default)]
struct CallState {
    done: bool,
    reply: Option<Reply>,
}

/// One in-flight call.
#[derive(Debug, Default)]
struct PendingCall {
    state: Mutex<CallState>,
    completed: Condvar,
}

impl PendingCall {
    /// Stores the reply and wakes the waiter. False if already completed.
    fn complete(&self, reply: Reply) -> bool {
        let mut state = self.state.lock();
        if state.done {
            return false;
        }
        state.done = true;
        state.reply = Some(reply);
        self.completed.notify_all();
        true
    }

    /// Blocks until completion or `timeout`, in steps of at most `slice`.
    /// A `timeout` too large to represent as an instant never expires.
    fn wait(&self, timeout: Duration, slice: Duration) -> Option<Reply> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();

        loop {
            if state.done {
                return state.reply.take();
            }

            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                return None;
            }
            let until = match (now.checked_add(slice), deadline) {
                (Some(until), Some(deadline)) => until.min(deadline),
                (Some(until), None) => until,
                (None, Some(deadline)) => deadline,
                (None, None) => {
                    self.completed.wait(&mut state);
                    continue;
                }
            };
            self.completed.wait_until(&mut state, until);
        }
    }
}

/// State shared with the poller thread.
struct Shared {
    connection: Connection,
    waker: Waker,
    pending: Mutex<HashMap<i32, Arc<PendingCall>>>,
    shutdown: AtomicBool,
}

/// RPC client for making calls.
pub struct RpcClient {
    shared: Arc<Shared>,
    config: ClientConfig,
    client_id: u32,
    next_request_id: AtomicI32,
    server_id: RwLock<Option<u32>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl RpcClient {
    /// Create a new client builder.
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// This client's id, sent in every request header.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.client_id
    }

    /// Incarnation id of the server, once bound.
    #[must_use]
    pub fn server_id(&self) -> Option<u32> {
        *self.server_id.read()
    }

    /// Whether [`bind`](Self::bind) has succeeded.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.server_id.read().is_some()
    }

    /// Whether the underlying connection is still usable.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.shared.connection.is_dead()
    }

    /// The configured default timeout.
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        self.config.default_timeout
    }

    /// Number of calls waiting for a reply.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Performs the bind handshake and records the server incarnation id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Bind`] if the client is already bound, or the error of
    /// the underlying call.
    pub fn bind(&self, timeout: Duration) -> Result<u32> {
        if self.is_bound() {
            return Err(Error::Bind);
        }

        let server_id: u32 = self.invoke(BIND_PROC, 0, &0i32, timeout)?;

        let mut bound = self.server_id.write();
        if bound.is_some() {
            return Err(Error::Bind);
        }
        *bound = Some(server_id);
        info!("Bound to server instance {:#010x}", server_id);

        Ok(server_id)
    }

    /// Calls `proc_id` with `args` and waits up to `timeout` for the result.
    ///
    /// `args` is packed as-is, so a tuple sends each element in order and a
    /// single value is sent alone.
    ///
    /// # Errors
    ///
    /// - [`Error::Bind`] before a successful bind, or when `proc_id` is the
    ///   bind procedure.
    /// - [`Error::FrameTooLarge`] if the request exceeds the frame limit.
    /// - [`Error::Timeout`] if no reply arrived in time.
    /// - [`Error::UnmarshalReply`] if the reply does not decode as `R`.
    /// - Any server-side failure code, mapped through [`Error::from_code`].
    pub fn call<A, R>(&self, proc_id: u32, timeout: Duration, args: A) -> Result<R>
    where
        A: Marshal,
        R: Unmarshal,
    {
        if proc_id == BIND_PROC {
            return Err(Error::Bind);
        }
        let server_id = self.server_id().ok_or(Error::Bind)?;

        self.invoke(proc_id, server_id, &args, timeout)
    }

    fn invoke<A, R>(&self, proc_id: u32, server_id: u32, args: &A, timeout: Duration) -> Result<R>
    where
        A: Marshal + ?Sized,
        R: Unmarshal,
    {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);

        let mut request = Marshaller::new();
        request.pack(args);
        request.pack_request_header(&RequestHeader {
            request_id,
            proc_id,
            client_id: self.client_id,
            server_id,
        });

        let call = Arc::new(PendingCall::default());
        self.shared
            .pending
            .lock()
            .insert(request_id, Arc::clone(&call));

        let start = monotonic_micros();
        match self.shared.connection.send(request.into_frame()) {
            Ok(true) => {}
            // The poller flushes the rest once the socket is writable.
            Ok(false) => self.shared.waker.wake(),
            Err(e) => {
                self.shared.pending.lock().remove(&request_id);
                return Err(e);
            }
        }

        let reply = call.wait(timeout, self.config.wait_slice);
        self.shared.pending.lock().remove(&request_id);

        let Some(reply) = reply else {
            debug!(
                "Call {} to proc {:#x} timed out after {:?}",
                request_id, proc_id, timeout
            );
            return Err(Error::Timeout(timeout));
        };
        trace!(
            "Call {} to proc {:#x} returned {} after {}us",
            request_id,
            proc_id,
            reply.result_code,
            elapsed_micros(start)
        );

        if let Some(e) = Error::from_code(reply.result_code, proc_id) {
            return Err(e);
        }

        let mut body = reply.body;
        let value = body.unpack::<R>();
        if !body.fully_consumed() {
            error!(
                "Reply to call {} does not match the result type of proc {:#x}",
                request_id, proc_id
            );
            return Err(Error::UnmarshalReply { proc_id });
        }

        Ok(value)
    }

    /// Closes the connection and stops the poller. In-flight calls run into
    /// their deadline.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shared.connection.close();
        self.shared.waker.wake();

        let poller = self.poller.lock().take();
        if poller.is_some_and(|handle| handle.join().is_err()) {
            error!("RPC client poller panicked");
        }
        debug!("RPC client {:#010x} shut down", self.client_id);
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("client_id", &self.client_id)
            .field("server_id", &self.server_id())
            .field("peer", &self.shared.connection.peer_addr())
            .finish_non_exhaustive()
    }
}

fn poll_loop(shared: &Shared) {
    while !shared.shutdown.load(Ordering::Acquire) {
        if shared.connection.is_dead() {
            // Nothing left to drive; pending calls expire on their own.
            let mut fds = [PollFd::new(&shared.waker, PollFlags::POLLIN)];
            if let Err(e) = wait(&mut fds, None) {
                error!("RPC client poller failed: {}", e);
                return;
            }
            shared.waker.drain();
            continue;
        }

        let mut interest = PollFlags::POLLIN;
        if shared.connection.has_pending_writes() {
            interest |= PollFlags::POLLOUT;
        }

        let (readable, writable, woken) = {
            let mut fds = [
                PollFd::new(&shared.connection, interest),
                PollFd::new(&shared.waker, PollFlags::POLLIN),
            ];
            if let Err(e) = wait(&mut fds, None) {
                error!("RPC client poller failed: {}", e);
                return;
            }
            (
                is_ready(&fds[0], PollFlags::POLLIN),
                interest.contains(PollFlags::POLLOUT) && is_ready(&fds[0], PollFlags::POLLOUT),
                is_ready(&fds[1], PollFlags::POLLIN),
            )
        };

        if woken {
            shared.waker.drain();
        }
        if writable {
            shared.connection.write_ready();
        }
        if readable {
            shared.connection.read_ready();
            for frame in shared.connection.drain_inbound() {
                process_reply(shared, frame);
            }
        }
    }
}

fn process_reply(shared: &Shared, frame: Bytes) {
    let mut body = Unmarshaller::new(frame);
    let header = body.unpack_reply_header();
    if !body.is_ok() {
        warn!("Dropping reply frame too short for a header");
        return;
    }

    let call = shared.pending.lock().get(&header.request_id).cloned();
    let Some(call) = call else {
        debug!("Dropping reply {} with no pending call", header.request_id);
        return;
    };

    let reply = Reply {
        result_code: header.result_code,
        body,
    };
    if !call.complete(reply) {
        debug!("Dropping duplicate reply {}", header.request_id);
    }
}
