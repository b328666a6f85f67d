//! Connection and listener notifications.
//!
//! Handlers run synchronously on the thread that observed the completion, in
//! the order they were subscribed. The subscriber list is snapshotted before
//! dispatch, so a handler may subscribe more handlers or call back into the
//! connection (`send`, `close`) without deadlocking.

use crate::protocols::frame::{Frame, FrameError};
use crate::runtime::connection::{ConnectionContext, ConnectionError};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

pub type AcceptedHandler = dyn Fn(&Arc<ConnectionContext>) + Send + Sync;
pub type ReceivedHandler = dyn Fn(&Arc<ConnectionContext>, &[u8]) + Send + Sync;
pub type FrameHandler = dyn Fn(&Arc<ConnectionContext>, &Frame) + Send + Sync;
pub type ParseErrorHandler = dyn Fn(&Arc<ConnectionContext>, &FrameError) + Send + Sync;
pub type DisconnectedHandler =
    dyn Fn(&Arc<ConnectionContext>, Option<&ConnectionError>) + Send + Sync;

/// Ordered list of handlers.
pub struct Subscribers<F: ?Sized> {
    list: RwLock<Vec<Arc<F>>>,
}

impl<F: ?Sized> Default for Subscribers<F> {
    fn default() -> Self {
        Self {
            list: RwLock::new(Vec::new()),
        }
    }
}

impl<F: ?Sized> Subscribers<F> {
    pub fn subscribe(&self, handler: Arc<F>) {
        self.list.write().push(handler);
    }

    /// Handlers registered so far, in registration order.
    pub fn snapshot(&self) -> Vec<Arc<F>> {
        self.list.read().clone()
    }

    pub fn len(&self) -> usize {
        self.list.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.read().is_empty()
    }
}

impl<F: ?Sized> fmt::Debug for Subscribers<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers")
            .field("len", &self.len())
            .finish()
    }
}

/// Notifications raised by one [`ConnectionContext`].
#[derive(Debug, Default)]
pub struct ConnectionEvents {
    received: Subscribers<ReceivedHandler>,
    frame: Subscribers<FrameHandler>,
    parse_error: Subscribers<ParseErrorHandler>,
    disconnected: Subscribers<DisconnectedHandler>,
    released: Subscribers<AcceptedHandler>,
}

impl ConnectionEvents {
    /// Raw bytes of each successful receive, before parsing.
    pub fn on_received<H>(&self, handler: H)
    where
        H: Fn(&Arc<ConnectionContext>, &[u8]) + Send + Sync + 'static,
    {
        self.received.subscribe(Arc::new(handler));
    }

    /// Each complete frame, in stream order.
    pub fn on_frame<H>(&self, handler: H)
    where
        H: Fn(&Arc<ConnectionContext>, &Frame) + Send + Sync + 'static,
    {
        self.frame.subscribe(Arc::new(handler));
    }

    /// A malformed length prefix; the connection is closed right after.
    pub fn on_parse_error<H>(&self, handler: H)
    where
        H: Fn(&Arc<ConnectionContext>, &FrameError) + Send + Sync + 'static,
    {
        self.parse_error.subscribe(Arc::new(handler));
    }

    /// Raised exactly once. The cause is `None` for an orderly close.
    pub fn on_disconnected<H>(&self, handler: H)
    where
        H: Fn(&Arc<ConnectionContext>, Option<&ConnectionError>) + Send + Sync + 'static,
    {
        self.disconnected.subscribe(Arc::new(handler));
    }

    /// Raised once every buffer is back in the pool and the socket is closed.
    pub(crate) fn on_released<H>(&self, handler: H)
    where
        H: Fn(&Arc<ConnectionContext>) + Send + Sync + 'static,
    {
        self.released.subscribe(Arc::new(handler));
    }

    pub(crate) fn emit_received(&self, ctx: &Arc<ConnectionContext>, data: &[u8]) {
        for handler in self.received.snapshot() {
            handler(ctx, data);
        }
    }

    pub(crate) fn emit_frame(&self, ctx: &Arc<ConnectionContext>, frame: &Frame) {
        for handler in self.frame.snapshot() {
            handler(ctx, frame);
        }
    }

    pub(crate) fn emit_parse_error(&self, ctx: &Arc<ConnectionContext>, error: &FrameError) {
        for handler in self.parse_error.snapshot() {
            handler(ctx, error);
        }
    }

    pub(crate) fn emit_disconnected(
        &self,
        ctx: &Arc<ConnectionContext>,
        cause: Option<&ConnectionError>,
    ) {
        for handler in self.disconnected.snapshot() {
            handler(ctx, cause);
        }
    }

    pub(crate) fn emit_released(&self, ctx: &Arc<ConnectionContext>) {
        for handler in self.released.snapshot() {
            handler(ctx);
        }
    }
}

/// Notifications raised by an accept listener, re-published from every
/// connection it accepted.
#[derive(Debug, Default)]
pub struct ListenerEvents {
    accepted: Subscribers<AcceptedHandler>,
    raw_received: Subscribers<ReceivedHandler>,
    frame_received: Subscribers<FrameHandler>,
    parse_error: Subscribers<ParseErrorHandler>,
    disconnected: Subscribers<DisconnectedHandler>,
}

impl ListenerEvents {
    /// A connection was accepted; raised before its first receive is armed.
    pub fn on_accepted<H>(&self, handler: H)
    where
        H: Fn(&Arc<ConnectionContext>) + Send + Sync + 'static,
    {
        self.accepted.subscribe(Arc::new(handler));
    }

    pub fn on_raw_received<H>(&self, handler: H)
    where
        H: Fn(&Arc<ConnectionContext>, &[u8]) + Send + Sync + 'static,
    {
        self.raw_received.subscribe(Arc::new(handler));
    }

    pub fn on_frame_received<H>(&self, handler: H)
    where
        H: Fn(&Arc<ConnectionContext>, &Frame) + Send + Sync + 'static,
    {
        self.frame_received.subscribe(Arc::new(handler));
    }

    pub fn on_parse_error<H>(&self, handler: H)
    where
        H: Fn(&Arc<ConnectionContext>, &FrameError) + Send + Sync + 'static,
    {
        self.parse_error.subscribe(Arc::new(handler));
    }

    pub fn on_disconnected<H>(&self, handler: H)
    where
        H: Fn(&Arc<ConnectionContext>, Option<&ConnectionError>) + Send + Sync + 'static,
    {
        self.disconnected.subscribe(Arc::new(handler));
    }

    pub(crate) fn emit_accepted(&self, ctx: &Arc<ConnectionContext>) {
        for handler in self.accepted.snapshot() {
            handler(ctx);
        }
    }

    pub(crate) fn emit_raw_received(&self, ctx: &Arc<ConnectionContext>, data: &[u8]) {
        for handler in self.raw_received.snapshot() {
            handler(ctx, data);
        }
    }

    pub(crate) fn emit_frame_received(&self, ctx: &Arc<ConnectionContext>, frame: &Frame) {
        for handler in self.frame_received.snapshot() {
            handler(ctx, frame);
        }
    }

    pub(crate) fn emit_parse_error(&self, ctx: &Arc<ConnectionContext>, error: &FrameError) {
        for handler in self.parse_error.snapshot() {
            handler(ctx, error);
        }
    }

    pub(crate) fn emit_disconnected(
        &self,
        ctx: &Arc<ConnectionContext>,
        cause: Option<&ConnectionError>,
    ) {
        for handler in self.disconnected.snapshot() {
            handler(ctx, cause);
        }
    }
}
