//! Per-socket connection state machine.
//!
//! A [`Connection`] frames outgoing buffers, reassembles incoming frames and
//! keeps a FIFO queue per direction. Reads and writes are non-blocking steps
//! driven from outside whenever the descriptor reports readiness. The two
//! directions are locked independently so a caller thread can enqueue while
//! a poller drains inbound frames.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use nix::poll::PollFlags;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::poll::probe;
use crate::error::{Error, Result};
use crate::protocol::framing::{DEFAULT_BATCH_SIZE, InboundFrame, MAX_FRAME_SIZE, OutboundFrame};

/// Configuration shared by every connection of an endpoint.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Largest frame accepted or sent, prefix included.
    pub max_frame_size: usize,
    /// Frames moved per read or write step.
    pub batch_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Default)]
struct ReadHalf {
    frame: InboundFrame,
    completed: VecDeque<Bytes>,
}

/// Front of the queue is the frame being written.
#[derive(Debug, Default)]
struct WriteHalf {
    queue: VecDeque<OutboundFrame>,
}

/// One framed stream socket.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: Option<SocketAddr>,
    config: ConnectionConfig,
    dead: AtomicBool,
    reader: Mutex<ReadHalf>,
    writer: Mutex<WriteHalf>,
}

impl Connection {
    /// Wraps an established stream, switching it to non-blocking mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket options cannot be set.
    pub fn new(stream: TcpStream, config: ConnectionConfig) -> Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().ok();

        Ok(Self {
            stream,
            peer,
            config,
            dead: AtomicBool::new(false),
            reader: Mutex::new(ReadHalf::default()),
            writer: Mutex::new(WriteHalf::default()),
        })
    }

    /// Resolves `addr` and connects to the first address that accepts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Resolve`] if the address does not resolve and
    /// [`Error::Connect`] if no resolved address accepts the connection.
    pub fn connect(addr: &str, config: ConnectionConfig) -> Result<Self> {
        let addrs: Vec<SocketAddr> = addr
            .to_socket_addrs()
            .map_err(|_| Error::Resolve(addr.to_string()))?
            .collect();
        if addrs.is_empty() {
            return Err(Error::Resolve(addr.to_string()));
        }

        let stream = TcpStream::connect(addrs.as_slice()).map_err(|source| Error::Connect {
            addr: addr.to_string(),
            source,
        })?;
        debug!("Connected to {}", addr);

        Self::new(stream, config)
    }

    /// Remote address, if the socket still knows it.
    #[must_use]
    pub const fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Whether the connection hit an unrecoverable error or was closed.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Whether outbound bytes are waiting for write-readiness.
    #[must_use]
    pub fn has_pending_writes(&self) -> bool {
        !self.writer.lock().queue.is_empty()
    }

    /// Number of completed inbound frames not yet taken.
    #[must_use]
    pub fn inbound_count(&self) -> usize {
        self.reader.lock().completed.len()
    }

    /// Number of frames queued for sending, including a partially written one.
    #[must_use]
    pub fn outbound_count(&self) -> usize {
        self.writer.lock().queue.len()
    }

    /// Takes the oldest completed inbound frame.
    pub fn next_inbound(&self) -> Option<Bytes> {
        self.reader.lock().completed.pop_front()
    }

    /// Takes every completed inbound frame, oldest first.
    pub fn drain_inbound(&self) -> Vec<Bytes> {
        self.reader.lock().completed.drain(..).collect()
    }

    /// Reads up to one batch of frames. Call when the descriptor is readable.
    ///
    /// Returns the number of frames completed by this step. EOF, I/O errors
    /// and oversized frames mark the connection dead.
    pub fn read_ready(&self) -> usize {
        if self.is_dead() {
            return 0;
        }

        let mut guard = self.reader.lock();
        let reader = &mut *guard;
        let mut completed = 0;

        while completed < self.config.batch_size {
            match probe(&self.stream, PollFlags::POLLIN) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    self.fail("readiness probe", &e);
                    break;
                }
            }

            match (&self.stream).read(reader.frame.unfilled()) {
                Ok(0) => {
                    debug!("Connection to {:?} closed by peer", self.peer);
                    self.mark_dead();
                    break;
                }
                Ok(n) => match reader.frame.advance(n, self.config.max_frame_size) {
                    Ok(Some(frame)) => {
                        trace!("Received frame of {} bytes", frame.len());
                        reader.completed.push_back(frame);
                        completed += 1;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Dropping connection to {:?}: {}", self.peer, e);
                        self.mark_dead();
                        break;
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.fail("read", &e);
                    break;
                }
            }
        }

        completed
    }

    /// Writes up to one batch of queued frames. Call when the descriptor is
    /// writable.
    ///
    /// Returns the number of frames fully written by this step.
    pub fn write_ready(&self) -> usize {
        if self.is_dead() {
            return 0;
        }

        let mut writer = self.writer.lock();
        self.flush(&mut writer)
    }

    fn flush(&self, writer: &mut WriteHalf) -> usize {
        let mut written = 0;

        while written < self.config.batch_size {
            let Some(front) = writer.queue.front_mut() else {
                break;
            };

            match (&self.stream).write(front.unwritten()) {
                Ok(0) => {
                    debug!("Connection to {:?} stopped accepting data", self.peer);
                    self.mark_dead();
                    break;
                }
                Ok(n) => {
                    if front.advance(n) {
                        writer.queue.pop_front();
                        written += 1;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.fail("write", &e);
                    break;
                }
            }
        }

        written
    }

    /// Queues a marshalled frame and tries to write immediately.
    ///
    /// Returns whether the outbound queue drained completely. On a dead
    /// connection the frame is discarded and `false` is returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FrameTooLarge`] if the frame exceeds the configured
    /// maximum. Nothing is queued in that case.
    pub fn send(&self, frame: BytesMut) -> Result<bool> {
        let frame = OutboundFrame::new(frame, self.config.max_frame_size)?;
        if self.is_dead() {
            debug!("Discarding frame for dead connection to {:?}", self.peer);
            return Ok(false);
        }

        let mut writer = self.writer.lock();
        writer.queue.push_back(frame);
        self.flush(&mut writer);
        Ok(writer.queue.is_empty())
    }

    /// Marks the connection dead and shuts the socket down.
    pub fn close(&self) {
        if !self.dead.swap(true, Ordering::AcqRel) {
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }

    fn mark_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }

    fn fail(&self, op: &str, error: &io::Error) {
        warn!("Connection to {:?} failed on {}: {}", self.peer, op, error);
        self.mark_dead();
    }
}

impl AsFd for Connection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}
