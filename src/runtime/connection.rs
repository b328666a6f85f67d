//! Per-connection I/O state machine.
//!
//! A [`ConnectionContext`] owns one accepted socket, one receive buffer that
//! is reused for every receive, and an ordered queue of pooled send buffers.
//! Completions for its socket are routed to it by correlation key.
//!
//! Receive cycle: arm a receive into the whole buffer, and on completion
//! emit the raw bytes, feed the frame parser and re-arm. A failed or
//! zero-byte receive and a parse error all end in `close`.
//!
//! Send cycle: `send` copies the caller's bytes into a leased buffer and
//! queues it. At most one send is in flight; a partial completion resubmits
//! the remainder of the same buffer, a full one returns the buffer and pumps
//! the next entry.
//!
//! The kernel owns the receive buffer and the in-flight send buffer until
//! their completions arrive. Closing therefore shuts the socket down first,
//! returns queued send buffers at once, and defers returning the other two
//! and closing the descriptor until nothing is in flight.

use crate::protocols::frame::{FrameError, FrameParser};
use crate::runtime::buffer::{BufferPool, PooledBuffer};
use crate::runtime::event::ConnectionEvents;
use crate::runtime::token::{CorrelationKey, OpKind};
use crate::runtime::uring::{CompletionEvent, CompletionQueue, QueueError};
use parking_lot::Mutex;
use slab::Slab;
use socket2::Socket;
use std::collections::VecDeque;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Why a connection ended, or why an operation on it was refused.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),
    #[error("completion queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("connection closed")]
    Closed,
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Receiving and sending.
    Open,
    /// Closed; waiting for in-flight operations to drain.
    Closing,
    /// Buffers returned and socket closed.
    Released,
}

struct Inbox {
    buffer: PooledBuffer,
    parser: FrameParser,
}

struct ReceiveState {
    /// Taken out while a completion is being processed.
    inbox: Option<Inbox>,
    in_flight: bool,
}

struct SendEntry {
    buffer: PooledBuffer,
    offset: usize,
    remaining: usize,
}

struct SendState {
    queue: VecDeque<SendEntry>,
    /// The entry the kernel is sending from; `None` when idle.
    current: Option<SendEntry>,
}

enum ReceiveOutcome {
    Rearm,
    Close(Option<ConnectionError>),
    Closed,
}

/// One accepted socket.
pub struct ConnectionContext {
    key: CorrelationKey,
    fd: RawFd,
    peer_addr: Option<SocketAddr>,
    socket: Mutex<Option<Socket>>,
    queue: Arc<CompletionQueue>,
    pool: Arc<BufferPool>,
    recv: Mutex<ReceiveState>,
    send: Mutex<SendState>,
    closed: AtomicBool,
    released: AtomicBool,
    events: ConnectionEvents,
}

impl ConnectionContext {
    /// Wrap an accepted socket. The receive buffer is leased here and kept
    /// until the connection is released.
    ///
    /// The caller registers `fd()` with the queue under `key` before the
    /// first `receive`.
    pub fn new(
        key: CorrelationKey,
        socket: Socket,
        queue: Arc<CompletionQueue>,
        pool: Arc<BufferPool>,
        max_frame_len: Option<usize>,
    ) -> Arc<Self> {
        let parser = match max_frame_len {
            Some(max) => FrameParser::with_max_frame_len(max),
            None => FrameParser::new(),
        };
        let buffer = pool.lease_full();
        let peer_addr = socket.peer_addr().ok().and_then(|a| a.as_socket());

        Arc::new(Self {
            key,
            fd: socket.as_raw_fd(),
            peer_addr,
            socket: Mutex::new(Some(socket)),
            queue,
            pool,
            recv: Mutex::new(ReceiveState {
                inbox: Some(Inbox { buffer, parser }),
                in_flight: false,
            }),
            send: Mutex::new(SendState {
                queue: VecDeque::new(),
                current: None,
            }),
            closed: AtomicBool::new(false),
            released: AtomicBool::new(false),
            events: ConnectionEvents::default(),
        })
    }

    pub fn key(&self) -> CorrelationKey {
        self.key
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn events(&self) -> &ConnectionEvents {
        &self.events
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnState {
        if self.released.load(Ordering::Acquire) {
            ConnState::Released
        } else if self.is_closed() {
            ConnState::Closing
        } else {
            ConnState::Open
        }
    }

    /// Send buffers queued or in flight.
    pub fn pending_sends(&self) -> usize {
        let send = self.send.lock();
        send.queue.len() + usize::from(send.current.is_some())
    }

    /// Arm a receive. Does nothing if one is already pending.
    pub fn receive(self: &Arc<Self>) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let armed = {
            let mut recv = self.recv.lock();
            self.arm_receive(&mut recv)
        };
        if let Err(e) = armed {
            self.receive_arm_failed(e);
        }
        Ok(())
    }

    /// Queue `data` for transmission and return without waiting.
    ///
    /// Bytes are copied into a pooled buffer, so the caller's slice is free
    /// on return. Sends go out strictly in call order.
    pub fn send(self: &Arc<Self>, data: &[u8]) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        if data.is_empty() {
            return Ok(());
        }

        let mut buffer = self.pool.lease(data.len());
        buffer.copy_from_slice(data);
        let entry = SendEntry {
            buffer,
            offset: 0,
            remaining: data.len(),
        };

        let pumped = {
            let mut send = self.send.lock();
            // Re-checked under the lock: `close` drains the queue under it.
            if self.is_closed() {
                drop(send);
                self.pool.release(entry.buffer);
                return Err(ConnectionError::Closed);
            }
            send.queue.push_back(entry);
            self.pump(&mut send)
        };

        if let Err(e) = pumped {
            self.close_with(Some(e.into()));
        }
        Ok(())
    }

    /// Close the connection. Raises `disconnected` on the first call only.
    pub fn close(self: &Arc<Self>) {
        self.close_with(None);
    }

    /// Alias of [`close`](Self::close) for owners that tear a connection
    /// down rather than end it. Resources are released as soon as nothing is
    /// in flight either way.
    pub fn dispose(self: &Arc<Self>) {
        self.close_with(None);
    }

    /// Route a completion for this connection's socket.
    pub(crate) fn on_completion(self: &Arc<Self>, event: &CompletionEvent) {
        match event.kind {
            OpKind::Receive => self.on_receive_complete(event),
            OpKind::Send => self.on_send_complete(event),
            kind => warn!(conn_id = self.key.get(), ?kind, "Unexpected completion kind"),
        }
    }

    pub(crate) fn close_with(self: &Arc<Self>, cause: Option<ConnectionError>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(socket) = self.socket.lock().as_ref() {
            // Makes pending operations complete promptly.
            let _ = socket.shutdown(Shutdown::Both);
        }

        match &cause {
            Some(e) => debug!(conn_id = self.key.get(), fd = self.fd, error = %e, "Connection closed"),
            None => debug!(conn_id = self.key.get(), fd = self.fd, "Connection closed"),
        }

        self.events.emit_disconnected(self, cause.as_ref());

        let queued: Vec<SendEntry> = self.send.lock().queue.drain(..).collect();
        for entry in queued {
            self.pool.release(entry.buffer);
        }

        self.try_release();
    }

    fn on_receive_complete(self: &Arc<Self>, event: &CompletionEvent) {
        let mut inbox = match self.recv.lock().inbox.take() {
            Some(inbox) => inbox,
            None => {
                warn!(conn_id = self.key.get(), "Receive completed while already processing");
                return;
            }
        };

        let outcome = if self.is_closed() {
            ReceiveOutcome::Closed
        } else if !event.success {
            ReceiveOutcome::Close(Some(transport_error(event)))
        } else if event.bytes_transferred == 0 {
            trace!(conn_id = self.key.get(), "Peer closed connection");
            ReceiveOutcome::Close(None)
        } else {
            self.process_received(&mut inbox, event.bytes_transferred as usize)
        };

        let armed = {
            let mut recv = self.recv.lock();
            recv.inbox = Some(inbox);
            recv.in_flight = false;
            match outcome {
                ReceiveOutcome::Rearm if !self.is_closed() => self.arm_receive(&mut recv),
                _ => Ok(()),
            }
        };

        match outcome {
            ReceiveOutcome::Close(cause) => self.close_with(cause),
            _ => {
                if let Err(e) = armed {
                    self.receive_arm_failed(e);
                }
            }
        }
        self.try_release();
    }

    fn process_received(self: &Arc<Self>, inbox: &mut Inbox, n: usize) -> ReceiveOutcome {
        let data = &inbox.buffer[..n];
        self.events.emit_received(self, data);

        let parsed = inbox.parser.process(data, |frame| {
            if !self.is_closed() {
                self.events.emit_frame(self, &frame);
            }
        });

        match parsed {
            Ok(_) if self.is_closed() => ReceiveOutcome::Closed,
            Ok(_) => ReceiveOutcome::Rearm,
            Err(e) => {
                debug!(conn_id = self.key.get(), error = %e, "Frame parse error");
                if !self.is_closed() {
                    self.events.emit_parse_error(self, &e);
                }
                ReceiveOutcome::Close(Some(e.into()))
            }
        }
    }

    fn arm_receive(&self, recv: &mut ReceiveState) -> Result<(), QueueError> {
        if recv.in_flight {
            return Ok(());
        }
        let Some(inbox) = recv.inbox.as_mut() else {
            return Ok(());
        };

        inbox.buffer.reset_to_capacity();
        let len = inbox.buffer.capacity().min(u32::MAX as usize) as u32;
        let ptr = inbox.buffer.as_mut_ptr();

        // SAFETY: the inbox is only taken out after this receive completes,
        // and is released to the pool only when no receive is in flight.
        unsafe { self.queue.submit_receive(self.fd, ptr, len)? };
        recv.in_flight = true;
        Ok(())
    }

    fn receive_arm_failed(self: &Arc<Self>, error: QueueError) {
        if self.is_closed() {
            trace!(conn_id = self.key.get(), error = %error, "Receive not armed on closed connection");
        } else {
            debug!(conn_id = self.key.get(), error = %error, "Failed to arm receive");
            self.close_with(Some(error.into()));
        }
    }

    fn on_send_complete(self: &Arc<Self>, event: &CompletionEvent) {
        let mut close_cause = None;

        {
            let mut send = self.send.lock();
            let Some(mut entry) = send.current.take() else {
                warn!(conn_id = self.key.get(), "Send completed with nothing in flight");
                return;
            };

            if self.is_closed() {
                self.pool.release(entry.buffer);
            } else if !event.success {
                self.pool.release(entry.buffer);
                close_cause = Some(Some(transport_error(event)));
            } else if event.bytes_transferred == 0 {
                self.pool.release(entry.buffer);
                close_cause = Some(None);
            } else {
                let sent = event.bytes_transferred as usize;
                let next = if sent < entry.remaining {
                    trace!(conn_id = self.key.get(), sent, remaining = entry.remaining, "Partial send");
                    entry.offset += sent;
                    entry.remaining -= sent;
                    self.submit_send(&mut send, entry)
                } else {
                    self.pool.release(entry.buffer);
                    self.pump(&mut send)
                };
                if let Err(e) = next {
                    close_cause = Some(Some(e.into()));
                }
            }
        }

        if let Some(cause) = close_cause {
            self.close_with(cause);
        }
        self.try_release();
    }

    /// Start the next queued send unless one is in flight.
    fn pump(&self, send: &mut SendState) -> Result<(), QueueError> {
        if send.current.is_some() || self.is_closed() {
            return Ok(());
        }
        match send.queue.pop_front() {
            Some(entry) => self.submit_send(send, entry),
            None => Ok(()),
        }
    }

    fn submit_send(&self, send: &mut SendState, entry: SendEntry) -> Result<(), QueueError> {
        let len = entry.remaining.min(u32::MAX as usize) as u32;
        // SAFETY: offset + remaining never exceeds the buffer length.
        let ptr = unsafe { entry.buffer.as_ptr().add(entry.offset) };

        // SAFETY: the entry is parked in `current` until its completion is
        // reaped; moving it does not move the heap allocation.
        match unsafe { self.queue.submit_send(self.fd, ptr, len) } {
            Ok(_) => {
                send.current = Some(entry);
                Ok(())
            }
            Err(e) => {
                self.pool.release(entry.buffer);
                Err(e)
            }
        }
    }

    /// Return the remaining buffers and close the socket once closed and
    /// fully drained. Runs at most once.
    fn try_release(self: &Arc<Self>) {
        if !self.is_closed() {
            return;
        }

        let inbox = {
            let mut recv = self.recv.lock();
            let send = self.send.lock();
            if recv.in_flight || send.current.is_some() || recv.inbox.is_none() {
                return;
            }
            if self.released.swap(true, Ordering::AcqRel) {
                return;
            }
            recv.inbox.take()
        };

        if let Some(inbox) = inbox {
            self.pool.release(inbox.buffer);
        }

        self.queue.deregister(self.fd);
        drop(self.socket.lock().take());

        debug!(conn_id = self.key.get(), fd = self.fd, "Connection released");
        self.events.emit_released(self);
    }
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("key", &self.key)
            .field("fd", &self.fd)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

fn transport_error(event: &CompletionEvent) -> ConnectionError {
    let error = event
        .error()
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "operation failed"));
    ConnectionError::Transport(error)
}

/// Registry of live connections using slab allocation.
///
/// The slab index is the connection's correlation key, so a key cannot be
/// handed to a new connection while the old one is still registered.
pub struct ConnectionRegistry<T> {
    connections: Slab<T>,
    max_connections: usize,
}

impl<T> ConnectionRegistry<T> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(4096)),
            max_connections,
        }
    }

    /// Key the next `insert` will use.
    pub fn vacant_key(&self) -> CorrelationKey {
        CorrelationKey::new(self.connections.vacant_key() as u64)
    }

    /// Insert a connection.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, conn: T) -> Option<CorrelationKey> {
        if self.is_full() {
            return None;
        }
        Some(CorrelationKey::new(self.connections.insert(conn) as u64))
    }

    pub fn get(&self, key: CorrelationKey) -> Option<&T> {
        self.connections.get(key.get() as usize)
    }

    pub fn remove(&mut self, key: CorrelationKey) -> Option<T> {
        self.connections.try_remove(key.get() as usize)
    }

    pub fn contains(&self, key: CorrelationKey) -> bool {
        self.connections.contains(key.get() as usize)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    pub fn iter(&self) -> impl Iterator<Item = (CorrelationKey, &T)> {
        self.connections
            .iter()
            .map(|(idx, conn)| (CorrelationKey::new(idx as u64), conn))
    }

    /// Remove every connection.
    pub fn drain(&mut self) -> Vec<T> {
        self.connections.drain().collect()
    }
}
