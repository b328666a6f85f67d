//! Accept listener and dispatch loops.
//!
//! The listener owns the listening socket and the registry of live
//! connections. Dispatch threads pull completions from the shared queue and
//! route them by key: the listener key goes to the accept handler, connection
//! keys to their context, and wake-ups are dropped.
//!
//! Exactly one accept is armed at a time and it is re-armed after every
//! accept completion, successful or not, until the listener stops.

use crate::runtime::buffer::BufferPool;
use crate::runtime::connection::{ConnectionContext, ConnectionError, ConnectionRegistry};
use crate::runtime::event::ListenerEvents;
use crate::runtime::token::CorrelationKey;
use crate::runtime::uring::{CompletionEvent, CompletionQueue, QueueError};
use parking_lot::Mutex;
use socket2::Socket;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Settings for one listener and the resources it creates.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub addr: SocketAddr,
    pub backlog: i32,
    /// Dispatch threads; 0 means one per CPU.
    pub workers: usize,
    pub ring_entries: u32,
    /// Size of each pooled buffer, and so of every receive.
    pub buffer_size: usize,
    /// Buffers the pool keeps for reuse.
    pub pool_buffers: usize,
    pub max_connections: usize,
    pub max_frame_len: Option<usize>,
    /// Upper bound on how long a dispatch loop takes to notice a stop.
    pub poll_interval: Duration,
    /// How long `stop` waits for closed connections to drain.
    pub drain_timeout: Duration,
    pub nodelay: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 7400)),
            backlog: 1024,
            workers: 0,
            ring_entries: 4096,
            buffer_size: 16 * 1024,
            pool_buffers: 1024,
            max_connections: 10_000,
            max_frame_len: None,
            poll_interval: Duration::from_millis(100),
            drain_timeout: Duration::from_secs(2),
            nodelay: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Listening,
    Stopped,
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("listener is {0:?}")]
    InvalidState(ListenerState),
    #[error("no connection with key {0}")]
    UnknownConnection(CorrelationKey),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

struct Shared {
    config: ListenerConfig,
    queue: Arc<CompletionQueue>,
    pool: Arc<BufferPool>,
    listen_socket: Mutex<Option<Socket>>,
    listen_fd: AtomicI32,
    accept_token: Mutex<Option<u64>>,
    connections: Mutex<ConnectionRegistry<Arc<ConnectionContext>>>,
    events: ListenerEvents,
    stopping: AtomicBool,
}

/// TCP accept loop driving connections over a completion queue.
pub struct AcceptListener {
    shared: Arc<Shared>,
    state: Mutex<ListenerState>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl AcceptListener {
    /// Create a listener with its own completion queue and buffer pool.
    pub fn new(config: ListenerConfig) -> Result<Self, ListenerError> {
        let queue = CompletionQueue::create_with_entries(config.workers, config.ring_entries)?;
        let pool = BufferPool::new(config.pool_buffers, config.buffer_size);
        Ok(Self::with_parts(config, Arc::new(queue), Arc::new(pool)))
    }

    /// Create a listener over an existing queue and pool.
    pub fn with_parts(
        config: ListenerConfig,
        queue: Arc<CompletionQueue>,
        pool: Arc<BufferPool>,
    ) -> Self {
        let connections = ConnectionRegistry::new(config.max_connections);
        Self {
            shared: Arc::new(Shared {
                config,
                queue,
                pool,
                listen_socket: Mutex::new(None),
                listen_fd: AtomicI32::new(-1),
                accept_token: Mutex::new(None),
                connections: Mutex::new(connections),
                events: ListenerEvents::default(),
                stopping: AtomicBool::new(false),
            }),
            state: Mutex::new(ListenerState::Idle),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Bind, start the dispatch threads and arm the first accept.
    ///
    /// Returns the bound address, which resolves port 0.
    pub fn start(&self) -> Result<SocketAddr, ListenerError> {
        let mut state = self.state.lock();
        if *state != ListenerState::Idle {
            return Err(ListenerError::InvalidState(*state));
        }

        let shared = &self.shared;
        let addr = shared.config.addr;
        let socket = create_listener(addr, shared.config.backlog)
            .map_err(|source| ListenerError::Bind { addr, source })?;
        let local_addr = socket.local_addr()?.as_socket().unwrap_or(addr);
        let fd = socket.as_raw_fd();

        shared.queue.register(fd, CorrelationKey::LISTENER)?;
        shared.listen_fd.store(fd, Ordering::Release);
        *shared.listen_socket.lock() = Some(socket);

        let count = match shared.config.workers {
            0 => shared.queue.concurrency(),
            n => n,
        };

        {
            let mut workers = self.workers.lock();
            for worker_id in 0..count {
                let shared = Arc::clone(shared);
                let handle = thread::Builder::new()
                    .name(format!("dispatch-{}", worker_id))
                    .spawn(move || shared.dispatch_loop(worker_id));
                match handle {
                    Ok(handle) => workers.push(handle),
                    Err(e) => {
                        drop(workers);
                        *state = ListenerState::Listening;
                        drop(state);
                        self.stop();
                        return Err(e.into());
                    }
                }
            }
        }

        *state = ListenerState::Listening;
        drop(state);

        if let Err(e) = shared.arm_accept() {
            self.stop();
            return Err(e.into());
        }

        info!(
            addr = %local_addr,
            workers = count,
            max_connections = shared.config.max_connections,
            buffer_size = shared.config.buffer_size,
            "Listening"
        );

        Ok(local_addr)
    }

    /// Stop accepting, close every connection and shut the queue down.
    ///
    /// Idempotent. When called from an event handler the shutdown continues
    /// on a separate thread, since the calling dispatch thread has to return
    /// before its connections can drain; [`wait`](Self::wait) returns once
    /// it has finished.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            let was = *state;
            *state = ListenerState::Stopped;
            if was != ListenerState::Listening {
                return;
            }
        }

        let mut workers = self.workers.lock();
        let handles = std::mem::take(&mut *workers);
        let count = handles.len();

        let current = thread::current().id();
        if handles.iter().any(|h| h.thread().id() == current) {
            let shared = Arc::clone(&self.shared);
            let spawned = thread::Builder::new()
                .name("listener-stop".to_string())
                .spawn(move || shared.finish_stop(count, handles));
            match spawned {
                Ok(handle) => {
                    workers.push(handle);
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to spawn stop thread, stopping inline");
                    drop(workers);
                    self.shared.finish_stop(count, Vec::new());
                    return;
                }
            }
        }

        drop(workers);
        self.shared.finish_stop(count, handles);
    }

    /// Block until the dispatch threads exit, i.e. until another thread
    /// calls [`stop`](Self::stop) or a stop started from a handler finishes.
    pub fn wait(&self) {
        loop {
            let finished = {
                let workers = self.workers.lock();
                workers.is_empty() || workers.iter().all(|h| h.is_finished())
            };
            if finished {
                return;
            }
            thread::sleep(self.shared.config.poll_interval);
        }
    }

    /// Queue `data` on the connection with `key`.
    pub fn send(&self, key: CorrelationKey, data: &[u8]) -> Result<(), ListenerError> {
        let ctx = self
            .connection(key)
            .ok_or(ListenerError::UnknownConnection(key))?;
        ctx.send(data)?;
        Ok(())
    }

    /// Close the connection with `key`.
    pub fn close_connection(&self, key: CorrelationKey) -> Result<(), ListenerError> {
        let ctx = self
            .connection(key)
            .ok_or(ListenerError::UnknownConnection(key))?;
        ctx.close();
        Ok(())
    }

    pub fn connection(&self, key: CorrelationKey) -> Option<Arc<ConnectionContext>> {
        self.shared.connections.lock().get(key).cloned()
    }

    /// Snapshot of the live connections.
    pub fn connections(&self) -> Vec<Arc<ConnectionContext>> {
        self.shared.snapshot()
    }

    /// Connections accepted and not yet released.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().len()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared
            .listen_socket
            .lock()
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .and_then(|a| a.as_socket())
    }

    pub fn events(&self) -> &ListenerEvents {
        &self.shared.events
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.shared.pool
    }

    pub fn queue(&self) -> &Arc<CompletionQueue> {
        &self.shared.queue
    }

    pub fn state(&self) -> ListenerState {
        *self.state.lock()
    }
}

impl Drop for AcceptListener {
    fn drop(&mut self) {
        self.stop();

        // A stop started from a handler may still be running.
        let current = thread::current().id();
        for handle in std::mem::take(&mut *self.workers.lock()) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

impl Shared {
    fn dispatch_loop(self: Arc<Self>, worker_id: usize) {
        debug!(worker = worker_id, "Dispatch loop started");

        let result = self
            .queue
            .run(self.config.poll_interval, |event| self.dispatch(event));

        match result {
            Ok(()) => debug!(worker = worker_id, "Dispatch loop exited"),
            Err(e) => error!(worker = worker_id, error = %e, "Dispatch loop failed"),
        }
    }

    fn dispatch(self: &Arc<Self>, event: CompletionEvent) {
        match event.key {
            CorrelationKey::LISTENER => self.on_accept(&event),
            CorrelationKey::WAKE => trace!("Wake-up completion"),
            key => {
                let ctx = self.connections.lock().get(key).cloned();
                match ctx {
                    Some(ctx) => ctx.on_completion(&event),
                    None => warn!(conn_id = key.get(), kind = ?event.kind, "Completion for unknown connection"),
                }
            }
        }
    }

    fn on_accept(self: &Arc<Self>, event: &CompletionEvent) {
        {
            let mut token = self.accept_token.lock();
            if *token == Some(event.token) {
                *token = None;
            }
        }

        match event.accepted_fd() {
            Some(fd) => self.accept_connection(fd),
            None if self.is_stopping() => {}
            None => {
                if let Some(e) = event.error() {
                    warn!(error = %e, "Accept failed");
                }
            }
        }

        if let Err(e) = self.arm_accept() {
            error!(error = %e, "Failed to re-arm accept");
        }
    }

    fn accept_connection(self: &Arc<Self>, fd: RawFd) {
        // SAFETY: the descriptor was just returned by accept and has no
        // other owner.
        let socket = unsafe { Socket::from_raw_fd(fd) };

        if self.is_stopping() {
            return;
        }
        if self.config.nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                debug!(fd, error = %e, "Failed to set TCP_NODELAY");
            }
        }

        let ctx = {
            let mut connections = self.connections.lock();
            if connections.is_full() {
                warn!(
                    max_connections = connections.capacity(),
                    "Connection limit reached, closing"
                );
                return;
            }
            let ctx = ConnectionContext::new(
                connections.vacant_key(),
                socket,
                Arc::clone(&self.queue),
                Arc::clone(&self.pool),
                self.config.max_frame_len,
            );
            connections.insert(Arc::clone(&ctx));
            ctx
        };

        if let Err(e) = self.queue.register(ctx.fd(), ctx.key()) {
            warn!(conn_id = ctx.key().get(), fd, error = %e, "Failed to register connection");
            self.connections.lock().remove(ctx.key());
            ctx.dispose();
            return;
        }

        self.wire(&ctx);

        debug!(
            conn_id = ctx.key().get(),
            fd,
            peer = ?ctx.peer_addr(),
            "Accepted connection"
        );

        self.events.emit_accepted(&ctx);

        if let Err(e) = ctx.receive() {
            trace!(conn_id = ctx.key().get(), error = %e, "Connection closed before first receive");
        }
    }

    /// Re-publish the connection's events and drop it from the registry once
    /// it is released.
    fn wire(self: &Arc<Self>, ctx: &Arc<ConnectionContext>) {
        let events = ctx.events();

        let weak = Arc::downgrade(self);
        events.on_received(move |ctx, data| {
            if let Some(shared) = weak.upgrade() {
                shared.events.emit_raw_received(ctx, data);
            }
        });

        let weak = Arc::downgrade(self);
        events.on_frame(move |ctx, frame| {
            if let Some(shared) = weak.upgrade() {
                shared.events.emit_frame_received(ctx, frame);
            }
        });

        let weak = Arc::downgrade(self);
        events.on_parse_error(move |ctx, error| {
            if let Some(shared) = weak.upgrade() {
                shared.events.emit_parse_error(ctx, error);
            }
        });

        let weak = Arc::downgrade(self);
        events.on_disconnected(move |ctx, cause| {
            if let Some(shared) = weak.upgrade() {
                shared.events.emit_disconnected(ctx, cause);
            }
        });

        let weak: Weak<Shared> = Arc::downgrade(self);
        events.on_released(move |ctx| {
            if let Some(shared) = weak.upgrade() {
                let mut connections = shared.connections.lock();
                if matches!(connections.get(ctx.key()), Some(c) if Arc::ptr_eq(c, ctx)) {
                    connections.remove(ctx.key());
                }
            }
        });
    }

    fn arm_accept(&self) -> Result<(), QueueError> {
        let fd = self.listen_fd.load(Ordering::Acquire);
        if fd < 0 || self.is_stopping() {
            return Ok(());
        }
        let token = self.queue.submit_accept(fd)?;
        *self.accept_token.lock() = Some(token);
        Ok(())
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> Vec<Arc<ConnectionContext>> {
        self.connections
            .lock()
            .iter()
            .map(|(_, ctx)| Arc::clone(ctx))
            .collect()
    }

    /// Shut down, join the dispatch threads other than the caller and
    /// dispose the queue.
    fn finish_stop(&self, workers: usize, handles: Vec<JoinHandle<()>>) {
        self.shutdown(workers);

        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("Dispatch thread panicked");
            }
        }

        self.queue.dispose();
        info!("Listener stopped");
    }

    fn shutdown(&self, workers: usize) {
        self.stopping.store(true, Ordering::Release);

        if let Some(socket) = self.listen_socket.lock().take() {
            let _ = socket.shutdown(Shutdown::Both);
            if let Some(token) = self.accept_token.lock().take() {
                if let Err(e) = self.queue.cancel(token) {
                    debug!(error = %e, "Failed to cancel pending accept");
                }
            }
            self.queue.deregister(socket.as_raw_fd());
            self.listen_fd.store(-1, Ordering::Release);
        }

        let live = self.snapshot();
        debug!(connections = live.len(), "Closing connections");
        for ctx in &live {
            ctx.close();
        }
        drop(live);

        let deadline = Instant::now() + self.config.drain_timeout;
        while !self.connections.lock().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        let leftover = self.connections.lock().drain();
        if !leftover.is_empty() {
            warn!(
                connections = leftover.len(),
                "Connections still draining at stop"
            );
            // The kernel may still write into their buffers.
            for ctx in leftover {
                std::mem::forget(ctx);
            }
        }

        self.queue.request_stop();
        for _ in 0..workers {
            if let Err(e) = self.queue.post_synthetic(0, CorrelationKey::WAKE, 0) {
                debug!(error = %e, "Failed to post wake-up");
                break;
            }
        }
    }
}

/// Create a TCP listener bound to `addr`.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<Socket> {
    let socket = Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket)
}
