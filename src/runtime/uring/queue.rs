//! Completion queue over io_uring.
//!
//! One ring is shared by the listener, every connection and every dispatch
//! thread. Submissions go through `submit_lock`, reaping through `reap_lock`,
//! so a dispatcher waiting for completions never blocks a thread that is
//! queueing a send.
//!
//! The kernel only sees slab tokens in `user_data`. Each token resolves to the
//! correlation key the descriptor was registered under, so completions are
//! routed by key and never by pointer.

use crate::runtime::token::{CorrelationKey, OpKind, OpType, TokenAllocator};
use io_uring::{opcode, squeue, types, IoUring};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Ring size used by [`CompletionQueue::create`].
pub const DEFAULT_RING_ENTRIES: u32 = 1024;

/// Setup, registration and submission failures.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to create completion queue: {0}")]
    Create(#[source] io::Error),
    #[error("failed to register fd {fd}: {source}")]
    Register {
        fd: RawFd,
        #[source]
        source: io::Error,
    },
    #[error("fd {fd} is already registered")]
    AlreadyRegistered { fd: RawFd },
    #[error("fd {fd} is not registered")]
    NotRegistered { fd: RawFd },
    #[error("submission queue full")]
    SubmissionFull,
    #[error("waiting for completions failed: {0}")]
    Wait(#[source] io::Error),
    #[error("completion queue disposed")]
    Disposed,
}

/// One completed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEvent {
    pub success: bool,
    pub bytes_transferred: u32,
    pub key: CorrelationKey,
    pub token: u64,
    pub kind: OpKind,
    /// Raw CQE result: a byte count, an accepted fd, or a negated errno.
    pub(crate) result: i32,
}

impl CompletionEvent {
    fn from_result(key: CorrelationKey, token: u64, kind: OpKind, result: i32) -> Self {
        Self {
            success: result >= 0,
            bytes_transferred: result.max(0) as u32,
            key,
            token,
            kind,
            result,
        }
    }

    /// The OS error of a failed operation.
    pub fn error(&self) -> Option<io::Error> {
        if self.success {
            None
        } else {
            Some(io::Error::from_raw_os_error(-self.result))
        }
    }

    /// Descriptor delivered by a successful accept.
    pub fn accepted_fd(&self) -> Option<RawFd> {
        if self.kind == OpKind::Accept && self.success {
            Some(self.result)
        } else {
            None
        }
    }
}

/// Shared io_uring instance with key-based completion routing.
pub struct CompletionQueue {
    ring: IoUring,
    concurrency: usize,
    tokens: Mutex<TokenAllocator>,
    registrations: Mutex<HashMap<RawFd, CorrelationKey>>,
    submit_lock: Mutex<()>,
    reap_lock: Mutex<()>,
    stopped: AtomicBool,
    disposed: AtomicBool,
}

// SAFETY: the submission and completion rings are only accessed through
// `submission_shared`/`completion_shared` while holding `submit_lock` and
// `reap_lock` respectively; all other state is behind mutexes or atomics.
unsafe impl Send for CompletionQueue {}
unsafe impl Sync for CompletionQueue {}

impl CompletionQueue {
    /// Create a queue sized for `concurrency_hint` dispatch loops.
    ///
    /// A hint of zero means one loop per available CPU.
    pub fn create(concurrency_hint: usize) -> Result<Self, QueueError> {
        Self::create_with_entries(concurrency_hint, DEFAULT_RING_ENTRIES)
    }

    /// Create a queue with an explicit ring size.
    pub fn create_with_entries(concurrency_hint: usize, entries: u32) -> Result<Self, QueueError> {
        let concurrency = if concurrency_hint == 0 {
            num_cpus()
        } else {
            concurrency_hint
        };

        let ring = IoUring::new(entries).map_err(QueueError::Create)?;

        debug!(entries, concurrency, "Created completion queue");

        Ok(Self {
            ring,
            concurrency,
            tokens: Mutex::new(TokenAllocator::new(entries as usize)),
            registrations: Mutex::new(HashMap::new()),
            submit_lock: Mutex::new(()),
            reap_lock: Mutex::new(()),
            stopped: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        })
    }

    /// Number of dispatch loops this queue was sized for.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Associate `fd` with `key`; later operations on `fd` complete under `key`.
    pub fn register(&self, fd: RawFd, key: CorrelationKey) -> Result<(), QueueError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(QueueError::Disposed);
        }

        // SAFETY: F_GETFD only inspects the descriptor table.
        if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
            return Err(QueueError::Register {
                fd,
                source: io::Error::last_os_error(),
            });
        }

        match self.registrations.lock().entry(fd) {
            Entry::Occupied(_) => Err(QueueError::AlreadyRegistered { fd }),
            Entry::Vacant(slot) => {
                slot.insert(key);
                trace!(fd, %key, "Registered descriptor");
                Ok(())
            }
        }
    }

    /// Drop the association for `fd`. Unknown descriptors are ignored.
    pub fn deregister(&self, fd: RawFd) {
        if self.registrations.lock().remove(&fd).is_some() {
            trace!(fd, "Deregistered descriptor");
        }
    }

    /// Number of registered descriptors.
    pub fn registered(&self) -> usize {
        self.registrations.lock().len()
    }

    /// Number of submitted operations whose completion has not been reaped.
    pub fn in_flight(&self) -> usize {
        self.tokens.lock().len()
    }

    pub(crate) fn submit_accept(&self, fd: RawFd) -> Result<u64, QueueError> {
        let key = self.key_of(fd)?;
        self.submit_op(OpType::Io { key, kind: OpKind::Accept }, |token| {
            opcode::Accept::new(types::Fd(fd), std::ptr::null_mut(), std::ptr::null_mut())
                .flags(libc::SOCK_CLOEXEC)
                .build()
                .user_data(token)
        })
    }

    /// # Safety
    /// `ptr..ptr+len` must stay valid and unaliased until the completion is reaped.
    pub(crate) unsafe fn submit_receive(
        &self,
        fd: RawFd,
        ptr: *mut u8,
        len: u32,
    ) -> Result<u64, QueueError> {
        let key = self.key_of(fd)?;
        self.submit_op(OpType::Io { key, kind: OpKind::Receive }, |token| {
            opcode::Recv::new(types::Fd(fd), ptr, len)
                .build()
                .user_data(token)
        })
    }

    /// # Safety
    /// `ptr..ptr+len` must stay valid until the completion is reaped.
    pub(crate) unsafe fn submit_send(
        &self,
        fd: RawFd,
        ptr: *const u8,
        len: u32,
    ) -> Result<u64, QueueError> {
        let key = self.key_of(fd)?;
        self.submit_op(OpType::Io { key, kind: OpKind::Send }, |token| {
            opcode::Send::new(types::Fd(fd), ptr, len)
                .flags(libc::MSG_NOSIGNAL)
                .build()
                .user_data(token)
        })
    }

    /// Ask the kernel to cancel the operation submitted under `token`.
    ///
    /// The cancelled operation still completes (usually with `ECANCELED`).
    pub fn cancel(&self, token: u64) -> Result<(), QueueError> {
        self.submit_op(OpType::Cancel, |cancel_token| {
            opcode::AsyncCancel::new(token)
                .build()
                .user_data(cancel_token)
        })
        .map(|_| ())
    }

    /// Inject a completion carrying the caller's values.
    pub fn post_synthetic(
        &self,
        bytes: u32,
        key: CorrelationKey,
        token: u64,
    ) -> Result<(), QueueError> {
        self.submit_op(OpType::Posted { key, bytes, token }, |op_token| {
            opcode::Nop::new().build().user_data(op_token)
        })
        .map(|_| ())
    }

    /// Wait up to `timeout` for one completion.
    ///
    /// Returns `Ok(None)` on timeout and once a stop was requested.
    pub fn dequeue(&self, timeout: Duration) -> Result<Option<CompletionEvent>, QueueError> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.is_stopped() {
                return Ok(None);
            }

            if let Some(event) = self.reap() {
                return Ok(Some(event));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.wait(deadline - now)?;
        }
    }

    /// Dequeue in a loop until a stop is requested, handing each event to
    /// `handler` in completion order.
    pub fn run<F>(&self, poll_interval: Duration, mut handler: F) -> Result<(), QueueError>
    where
        F: FnMut(CompletionEvent),
    {
        while !self.is_stopped() {
            if let Some(event) = self.dequeue(poll_interval)? {
                handler(event);
            }
        }
        Ok(())
    }

    /// Make every current and future `dequeue` return promptly. Idempotent.
    pub fn request_stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            debug!("Completion queue stop requested");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop the queue and refuse further registrations and submissions.
    ///
    /// Safe to call repeatedly. The ring itself is unmapped when the last
    /// owner drops the queue.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.request_stop();
        self.registrations.lock().clear();
        debug!(in_flight = self.in_flight(), "Completion queue disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn key_of(&self, fd: RawFd) -> Result<CorrelationKey, QueueError> {
        self.registrations
            .lock()
            .get(&fd)
            .copied()
            .ok_or(QueueError::NotRegistered { fd })
    }

    fn submit_op<B>(&self, op: OpType, build: B) -> Result<u64, QueueError>
    where
        B: FnOnce(u64) -> squeue::Entry,
    {
        if self.is_disposed() {
            return Err(QueueError::Disposed);
        }

        let token = self.tokens.lock().alloc(op);
        let entry = build(token);

        if let Err(e) = self.push(&entry) {
            self.tokens.lock().free(token);
            return Err(e);
        }

        // Entries left in the ring by a failed enter go out with the next one.
        if let Err(e) = self.ring.submit() {
            if !is_transient(&e) {
                warn!(error = %e, "io_uring submit failed");
            }
        }

        Ok(token)
    }

    fn push(&self, entry: &squeue::Entry) -> Result<(), QueueError> {
        let _guard = self.submit_lock.lock();

        // SAFETY: submit_lock serialises every access to the submission ring.
        let mut sq = unsafe { self.ring.submission_shared() };
        // SAFETY: the entry's buffers are kept alive by the caller until reaped.
        if unsafe { sq.push(entry) }.is_ok() {
            return Ok(());
        }
        drop(sq);

        // Full: flush to the kernel and retry once.
        if let Err(e) = self.ring.submit() {
            if !is_transient(&e) {
                return Err(QueueError::SubmissionFull);
            }
        }
        // SAFETY: as above.
        let mut sq = unsafe { self.ring.submission_shared() };
        unsafe { sq.push(entry) }.map_err(|_| QueueError::SubmissionFull)
    }

    fn reap(&self) -> Option<CompletionEvent> {
        let _guard = self.reap_lock.lock();

        loop {
            // SAFETY: reap_lock serialises every access to the completion ring.
            let cqe = unsafe { self.ring.completion_shared() }.next()?;
            let token = cqe.user_data();
            let result = cqe.result();

            let op = match self.tokens.lock().free(token) {
                Some(op) => op,
                None => {
                    warn!(token, "Completion for unknown token");
                    continue;
                }
            };

            match op {
                OpType::Cancel => {
                    trace!(result, "Cancel request completed");
                }
                OpType::Posted { key, bytes, token } => {
                    return Some(CompletionEvent {
                        success: true,
                        bytes_transferred: bytes,
                        key,
                        token,
                        kind: OpKind::Posted,
                        result: 0,
                    });
                }
                OpType::Io { key, kind } => {
                    return Some(CompletionEvent::from_result(key, token, kind, result));
                }
            }
        }
    }

    fn wait(&self, timeout: Duration) -> Result<(), QueueError> {
        let ts = types::Timespec::new()
            .sec(timeout.as_secs())
            .nsec(timeout.subsec_nanos());
        let args = types::SubmitArgs::new().timespec(&ts);

        match self.ring.submitter().submit_with_args(1, &args) {
            Ok(_) => Ok(()),
            Err(e) if is_transient(&e) => Ok(()),
            Err(e) => Err(QueueError::Wait(e)),
        }
    }
}

impl std::fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("concurrency", &self.concurrency)
            .field("registered", &self.registered())
            .field("in_flight", &self.in_flight())
            .field("stopped", &self.is_stopped())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Errors from `io_uring_enter` that only mean "try again later".
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY) | Some(libc::EAGAIN)
    )
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;

    fn queue() -> Option<CompletionQueue> {
        match CompletionQueue::create_with_entries(1, 64) {
            Ok(queue) => Some(queue),
            Err(e) => {
                eprintln!("skipping: io_uring unavailable ({e})");
                None
            }
        }
    }

    fn next_event(queue: &CompletionQueue) -> CompletionEvent {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(event) = queue.dequeue(Duration::from_millis(100)).unwrap() {
                return event;
            }
        }
        panic!("no completion within 5s");
    }

    #[test]
    fn test_post_synthetic_round_trips_values() {
        let Some(queue) = queue() else { return };

        queue
            .post_synthetic(42, CorrelationKey::new(7), 0xdead)
            .unwrap();
        let event = next_event(&queue);

        assert!(event.success);
        assert_eq!(event.bytes_transferred, 42);
        assert_eq!(event.key, CorrelationKey::new(7));
        assert_eq!(event.token, 0xdead);
        assert_eq!(event.kind, OpKind::Posted);
        assert!(event.error().is_none());
        assert_eq!(queue.in_flight(), 0);
    }

    #[test]
    fn test_dequeue_times_out() {
        let Some(queue) = queue() else { return };

        let start = Instant::now();
        assert!(queue.dequeue(Duration::from_millis(50)).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_register_rules() {
        let Some(queue) = queue() else { return };
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();

        assert!(matches!(
            queue.register(-1, CorrelationKey::new(1)),
            Err(QueueError::Register { fd: -1, .. })
        ));

        queue.register(fd, CorrelationKey::new(1)).unwrap();
        assert!(matches!(
            queue.register(fd, CorrelationKey::new(2)),
            Err(QueueError::AlreadyRegistered { .. })
        ));
        assert_eq!(queue.registered(), 1);

        queue.deregister(fd);
        queue.deregister(fd);
        assert_eq!(queue.registered(), 0);
        queue.register(fd, CorrelationKey::new(2)).unwrap();
    }

    #[test]
    fn test_unregistered_fd_rejected() {
        let Some(queue) = queue() else { return };
        let mut buf = [0u8; 8];

        let err = unsafe { queue.submit_receive(99_999, buf.as_mut_ptr(), 8) }.unwrap_err();
        assert!(matches!(err, QueueError::NotRegistered { fd: 99_999 }));
        assert_eq!(queue.in_flight(), 0);
    }

    #[test]
    fn test_send_and_receive_complete_under_key() {
        let Some(queue) = queue() else { return };
        let (a, b) = UnixStream::pair().unwrap();
        let (ka, kb) = (CorrelationKey::new(10), CorrelationKey::new(11));
        queue.register(a.as_raw_fd(), ka).unwrap();
        queue.register(b.as_raw_fd(), kb).unwrap();

        let mut inbox = vec![0u8; 16];
        let payload = b"ping".to_vec();
        unsafe {
            queue
                .submit_receive(b.as_raw_fd(), inbox.as_mut_ptr(), 16)
                .unwrap();
            queue
                .submit_send(a.as_raw_fd(), payload.as_ptr(), 4)
                .unwrap();
        }

        let mut seen = vec![next_event(&queue), next_event(&queue)];
        seen.sort_by_key(|e| e.key);

        assert_eq!((seen[0].key, seen[0].kind), (ka, OpKind::Send));
        assert_eq!((seen[1].key, seen[1].kind), (kb, OpKind::Receive));
        assert!(seen.iter().all(|e| e.success && e.bytes_transferred == 4));
        assert_eq!(&inbox[..4], b"ping");
    }

    #[test]
    fn test_failed_operation_reports_error() {
        let Some(queue) = queue() else { return };
        let (a, b) = UnixStream::pair().unwrap();
        queue.register(a.as_raw_fd(), CorrelationKey::new(3)).unwrap();
        drop(b);

        let payload = b"gone".to_vec();
        unsafe {
            queue
                .submit_send(a.as_raw_fd(), payload.as_ptr(), 4)
                .unwrap();
        }

        let event = next_event(&queue);
        assert!(!event.success);
        assert_eq!(event.bytes_transferred, 0);
        assert_eq!(event.error().unwrap().raw_os_error(), Some(libc::EPIPE));
    }

    #[test]
    fn test_cancel_is_not_surfaced() {
        let Some(queue) = queue() else { return };
        let (a, _b) = UnixStream::pair().unwrap();
        let key = CorrelationKey::new(5);
        queue.register(a.as_raw_fd(), key).unwrap();

        let mut inbox = vec![0u8; 8];
        let token = unsafe { queue.submit_receive(a.as_raw_fd(), inbox.as_mut_ptr(), 8) }.unwrap();
        queue.cancel(token).unwrap();

        let event = next_event(&queue);
        assert_eq!(event.key, key);
        assert_eq!(event.token, token);
        assert!(!event.success);
        assert!(queue.dequeue(Duration::from_millis(20)).unwrap().is_none());
        assert_eq!(queue.in_flight(), 0);
    }

    #[test]
    fn test_run_exits_after_stop() {
        let Some(queue) = queue() else { return };
        let queue = Arc::new(queue);

        let worker = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                let mut seen = Vec::new();
                queue
                    .run(Duration::from_millis(20), |event| seen.push(event.token))
                    .unwrap();
                seen
            })
        };

        queue.post_synthetic(0, CorrelationKey::WAKE, 1).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.in_flight() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        queue.request_stop();
        queue.request_stop();

        assert_eq!(worker.join().unwrap(), vec![1]);
        assert!(queue.dequeue(Duration::from_secs(1)).unwrap().is_none());
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let Some(queue) = queue() else { return };
        let (a, _b) = UnixStream::pair().unwrap();
        queue.register(a.as_raw_fd(), CorrelationKey::new(1)).unwrap();

        queue.dispose();
        queue.dispose();

        assert!(queue.is_stopped());
        assert_eq!(queue.registered(), 0);
        assert!(matches!(
            queue.post_synthetic(0, CorrelationKey::WAKE, 0),
            Err(QueueError::Disposed)
        ));
        assert!(matches!(
            queue.register(a.as_raw_fd(), CorrelationKey::new(1)),
            Err(QueueError::Disposed)
        ));
    }
}
