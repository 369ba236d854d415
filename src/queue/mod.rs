//! I/O dispatch queues
//!
//! Three FIFO queues connect workers with I/O threads:
//!
//! - **read** and **write** ([`RequestQueue`]): workers submit, I/O threads
//!   take from the head. Closed to new submissions once no-new-I/O is set.
//! - **done** ([`DoneQueue`]): I/O threads publish finished requests, always
//!   accepted so in-flight work can drain. Publishing posts the submitter's
//!   [`Completion`], and the submitter then pulls exactly its own request back
//!   out by id.
//!
//! Each queue has its own mutex; no code path holds two of them at once. A
//! request is a `Box<IoRequest>` moved between queues, so it can only ever be
//! on one queue at a time. The buffer moves with it and the submitting worker
//! cannot touch it until it reclaims the request.

use crate::engine::OperationType;
use crate::error::QueueError;
use crate::memory::Block;
use crate::state::SystemState;
use crossbeam::channel::{self, Receiver, Sender};
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use tracing::debug;

/// Unique id of an I/O request
pub type RequestId = u64;

/// Which of the three queues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Read,
    Write,
    Done,
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueKind::Read => write!(f, "read"),
            QueueKind::Write => write!(f, "write"),
            QueueKind::Done => write!(f, "done"),
        }
    }
}

/// Counting semaphore owned by one worker thread
///
/// Every [`CompletionHandle::post`] makes exactly one [`try_wait`](Completion::try_wait)
/// succeed.
#[derive(Debug)]
pub struct Completion {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Completion {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self { tx, rx }
    }

    /// Handle that travels with a request
    pub fn handle(&self) -> CompletionHandle {
        CompletionHandle {
            tx: self.tx.clone(),
        }
    }

    /// Consume one post if available, never blocks
    pub fn try_wait(&self) -> bool {
        self.rx.try_recv().is_ok()
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

/// Posting side of a worker's [`Completion`]
#[derive(Debug, Clone)]
pub struct CompletionHandle {
    tx: Sender<()>,
}

impl CompletionHandle {
    /// Wake the owner once; false if the owner has already exited
    pub fn post(&self) -> bool {
        self.tx.send(()).is_ok()
    }
}

/// One read or write travelling from a worker through an I/O thread and back
#[derive(Debug)]
pub struct IoRequest {
    id: RequestId,
    op: OperationType,
    /// The submitter's buffer, checked out for the lifetime of the request
    block: Block,
    len: usize,
    done: usize,
    /// Descriptor of the I/O thread currently servicing the request
    fd: Option<RawFd>,
    completion: Option<CompletionHandle>,
}

impl IoRequest {
    /// Build a request over the first `len` bytes of `block`
    ///
    /// `len` is clamped into `1..=block.len()`.
    pub fn new(
        id: RequestId,
        op: OperationType,
        block: Block,
        len: usize,
        completion: Option<CompletionHandle>,
    ) -> Box<Self> {
        let len = len.clamp(1, block.len().max(1));
        Box::new(Self {
            id,
            op,
            block,
            len,
            done: 0,
            fd: None,
            completion,
        })
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn op(&self) -> OperationType {
        self.op
    }

    /// Requested transfer length
    pub fn len(&self) -> usize {
        self.len
    }

    /// Bytes actually transferred
    pub fn done(&self) -> usize {
        self.done
    }

    pub fn set_done(&mut self, bytes: usize) {
        self.done = bytes.min(self.len);
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.fd
    }

    pub fn attach_fd(&mut self, fd: RawFd) {
        self.fd = Some(fd);
    }

    pub fn detach_fd(&mut self) {
        self.fd = None;
    }

    /// Pointer to the transfer buffer, valid while the request is alive
    pub fn buffer_ptr(&mut self) -> *mut u8 {
        self.block.as_mut_ptr()
    }

    /// Hand the buffer back to the submitter
    pub fn into_block(self: Box<Self>) -> Block {
        self.block
    }
}

/// Mutex-protected FIFO shared by all three queue types
#[derive(Debug)]
struct IoQueue {
    kind: QueueKind,
    nodes: Mutex<VecDeque<Box<IoRequest>>>,
    /// Mirrors `nodes.len()` for lock-free monitoring
    pending: AtomicUsize,
    state: Arc<SystemState>,
}

impl IoQueue {
    fn new(kind: QueueKind, state: Arc<SystemState>) -> Self {
        Self {
            kind,
            nodes: Mutex::new(VecDeque::new()),
            pending: AtomicUsize::new(0),
            state,
        }
    }

    /// Take the lock, escalating if it is poisoned
    fn lock(&self) -> Option<MutexGuard<'_, VecDeque<Box<IoRequest>>>> {
        match self.nodes.lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                self.state
                    .escalate(format!("{} queue lock poisoned", self.kind));
                None
            }
        }
    }

    fn pop_front(&self) -> Option<Box<IoRequest>> {
        let mut nodes = self.lock()?;
        let req = nodes.pop_front()?;
        self.pending.fetch_sub(1, Ordering::AcqRel);
        Some(req)
    }

    /// Emptiness check that never blocks
    ///
    /// Falls back to the pending counter while another thread holds the lock.
    fn is_empty(&self) -> bool {
        match self.nodes.try_lock() {
            Ok(nodes) => nodes.is_empty(),
            Err(TryLockError::WouldBlock) => self.pending.load(Ordering::Acquire) == 0,
            Err(TryLockError::Poisoned(_)) => {
                self.state
                    .escalate(format!("{} queue lock poisoned", self.kind));
                self.pending.load(Ordering::Acquire) == 0
            }
        }
    }

    fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Drop every queued request, returning how many there were
    ///
    /// Teardown only; producers must be gone. A poisoned lock is still
    /// drained so the buffers go back to the budget.
    fn clear(&self) -> usize {
        let mut nodes = match self.nodes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let drained = nodes.len();
        nodes.clear();
        self.pending.fetch_sub(drained, Ordering::AcqRel);
        drained
    }
}

/// Pending-read or pending-write queue
#[derive(Debug)]
pub struct RequestQueue {
    inner: IoQueue,
}

impl RequestQueue {
    fn new(kind: QueueKind, state: Arc<SystemState>) -> Self {
        Self {
            inner: IoQueue::new(kind, state),
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.inner.kind
    }

    /// Append at the tail
    ///
    /// Refused once no-new-I/O is set; the request comes back in the error.
    pub fn enqueue(&self, req: Box<IoRequest>) -> Result<(), QueueError> {
        let Some(mut nodes) = self.inner.lock() else {
            return Err(QueueError::Poisoned(self.inner.kind, req));
        };
        if self.inner.state.no_new_io() {
            return Err(QueueError::Closed(self.inner.kind, req));
        }
        nodes.push_back(req);
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Remove the head, if any
    pub fn dequeue(&self) -> Option<Box<IoRequest>> {
        self.inner.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.inner.pending()
    }

    pub fn clear(&self) -> usize {
        self.inner.clear()
    }
}

/// Queue of finished requests waiting for their submitters
#[derive(Debug)]
pub struct DoneQueue {
    inner: IoQueue,
}

impl DoneQueue {
    fn new(state: Arc<SystemState>) -> Self {
        Self {
            inner: IoQueue::new(QueueKind::Done, state),
        }
    }

    /// Append a finished request and wake its submitter
    ///
    /// Accepted even after no-new-I/O so in-flight work can drain. The post
    /// happens under the lock, so a woken submitter always finds its request.
    pub fn publish(&self, req: Box<IoRequest>) -> Result<(), QueueError> {
        let Some(mut nodes) = self.inner.lock() else {
            return Err(QueueError::Poisoned(QueueKind::Done, req));
        };
        let id = req.id;
        let completion = req.completion.clone();
        nodes.push_back(req);
        self.inner.pending.fetch_add(1, Ordering::AcqRel);

        if let Some(handle) = completion {
            if !handle.post() {
                debug!(request = id, "submitter exited before its request finished");
            }
        }
        Ok(())
    }

    /// Unlink the request with `id`, wherever it sits in the queue
    pub fn remove(&self, id: RequestId) -> Option<Box<IoRequest>> {
        let mut nodes = self.inner.lock()?;
        let pos = nodes.iter().position(|req| req.id == id)?;
        let req = nodes.remove(pos)?;
        self.inner.pending.fetch_sub(1, Ordering::AcqRel);
        Some(req)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.inner.pending()
    }

    pub fn clear(&self) -> usize {
        self.inner.clear()
    }
}

/// Requests left behind at teardown, per queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Leftovers {
    pub read: usize,
    pub write: usize,
    pub done: usize,
}

/// The three queues of a run
#[derive(Debug)]
pub struct IoQueues {
    pub read: RequestQueue,
    pub write: RequestQueue,
    pub done: DoneQueue,
}

impl IoQueues {
    pub fn new(state: &Arc<SystemState>) -> Arc<Self> {
        Arc::new(Self {
            read: RequestQueue::new(QueueKind::Read, Arc::clone(state)),
            write: RequestQueue::new(QueueKind::Write, Arc::clone(state)),
            done: DoneQueue::new(Arc::clone(state)),
        })
    }

    /// Submission queue for a transfer direction
    pub fn for_op(&self, op: OperationType) -> &RequestQueue {
        match op {
            OperationType::Read => &self.read,
            OperationType::Write => &self.write,
        }
    }

    /// Whether the read or write queue still holds requests
    pub fn requests_pending(&self) -> bool {
        !self.read.is_empty() || !self.write.is_empty()
    }

    /// Whether any of the three queues still holds requests
    pub fn any_pending(&self) -> bool {
        self.requests_pending() || !self.done.is_empty()
    }

    /// Drop every queued request
    pub fn clear_all(&self) -> Leftovers {
        Leftovers {
            read: self.read.clear(),
            write: self.write.clear(),
            done: self.done.clear(),
        }
    }
}
