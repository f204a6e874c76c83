//! Submission/completion ring engine.
//!
//! Owns the two kernel rings and everything between a queued request and
//! its completion callback: descriptor bookkeeping, slot acquisition,
//! batched submission, completion draining and dispatch, backpressure,
//! and best-effort cancellation.
//!
//! One engine instance belongs to exactly one thread. All mutation happens
//! on that thread and callbacks run synchronously during draining, so no
//! internal locking exists. A process wanting io_uring on several threads
//! runs one engine per thread.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::OnceLock;
use std::time::Duration;

use io_uring::{types, IoUring};
use slab::Slab;
use tracing::{debug, trace, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::operation::{Descriptor, OpState};
use crate::registry::{FdRegistry, FixedFd};


/// Blocking behavior for submission and draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Return immediately; a shortfall is reported for the caller to retry
    /// on its next loop iteration.
    DontWait,
    /// Allow the kernel to block until at least one completion is
    /// available.
    Wait,
}

/// Handle to a queued operation.
///
/// Doubles as the completion tag: the kernel echoes it back unchanged and
/// the drain path resolves it through the descriptor table. Handles are
/// generation-stamped, so a handle outliving its operation goes stale
/// rather than aliasing a reused table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpHandle {
    index: u32,
    serial: u32,
}

impl OpHandle {
    fn tag(self) -> u64 {
        (u64::from(self.serial) << 32) | u64::from(self.index)
    }

    fn from_tag(tag: u64) -> Self {
        Self {
            index: (tag & u64::from(u32::MAX)) as u32,
            serial: (tag >> 32) as u32,
        }
    }
}

/// Callback-driven io_uring submission/completion engine.
///
/// See the [crate docs](crate) for the lifecycle and an example.
pub struct Engine {
    ring: IoUring,
    /// Descriptor table; completion tags index into it.
    ops: Slab<Descriptor>,
    /// Created-but-not-yet-submitted descriptors, in program order.
    pending: VecDeque<usize>,
    /// Reusable table slots for pooled (internal) descriptors.
    pool_free: Vec<usize>,
    /// Scratch buffer for draining: (tag, result) pairs copied out of the
    /// completion ring before callbacks run.
    cqe_batch: Vec<(u64, i32)>,
    registry: FdRegistry,
    config: EngineConfig,
    /// Completion-ring length; in-flight operations never exceed it.
    cq_capacity: usize,
    in_flight: usize,
    next_serial: u32,
    total_submitted: u64,
    total_completed: u64,
}

// Raw buffer pointers inside descriptors and unconstrained callbacks make
// the engine structurally single-threaded.
static_assertions::assert_not_impl_any!(Engine: Send, Sync);

impl Engine {
    /// Whether the running kernel supports io_uring at all.
    ///
    /// Probes once by setting up a minimal ring; the result is cached for
    /// the process lifetime.
    pub fn is_available() -> bool {
        static PROBE: OnceLock<bool> = OnceLock::new();
        *PROBE.get_or_init(|| IoUring::new(1).is_ok())
    }

    /// Construct an engine.
    ///
    /// Fails with [`EngineError::NotAvailable`] when the kernel lacks
    /// io_uring support (checked before any ring setup) and with
    /// [`EngineError::InvalidConfig`] when the configuration does not
    /// validate. A rejected fixed-descriptor table is not an error: the
    /// registry degrades and operations use raw descriptors.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        if !Self::is_available() {
            return Err(EngineError::NotAvailable);
        }

        let mut builder = IoUring::builder();
        if config.cq_entries > 0 {
            builder.setup_cqsize(config.cq_entries);
        }
        let ring = builder.build(config.sq_entries)?;
        let cq_capacity = ring.params().cq_entries() as usize;

        let mut registry = if config.use_registered_fds {
            FdRegistry::new(config.registered_fd_slots)
        } else {
            FdRegistry::new(0)
        };
        if registry.capacity() > 0 {
            let submitter = ring.submitter();
            registry.init_with(|files| submitter.register_files(files));
        }

        debug!(
            sq_entries = ring.params().sq_entries(),
            cq_entries = cq_capacity,
            registered_fd_slots = registry.capacity(),
            "io_uring engine initialized"
        );

        Ok(Self {
            ring,
            ops: Slab::new(),
            pending: VecDeque::new(),
            pool_free: Vec::new(),
            cqe_batch: Vec::new(),
            registry,
            config,
            cq_capacity,
            in_flight: 0,
            next_serial: 0,
            total_submitted: 0,
            total_completed: 0,
        })
    }

    // ── Request surface ──────────────────────────────────────────────

    /// Queue a single-buffer read of `nbytes` at `offset`.
    ///
    /// Returns immediately; the operation is issued on the next
    /// [`submit_pending`](Self::submit_pending). The callback receives the
    /// signed result exactly as the kernel reported it: bytes read on
    /// success, a negated OS error code on failure.
    ///
    /// # Safety
    ///
    /// `buf` must point to at least `nbytes` writable bytes and stay valid
    /// until the callback has run.
    pub unsafe fn queue_read(
        &mut self,
        fd: RawFd,
        buf: *mut u8,
        nbytes: u32,
        offset: u64,
        callback: impl FnOnce(&mut Engine, i32) + 'static,
    ) -> OpHandle {
        self.enqueue(Descriptor::read(fd, buf, nbytes, offset, Box::new(callback)))
    }

    /// Queue a single-buffer write of `nbytes` at `offset`.
    ///
    /// # Safety
    ///
    /// `buf` must point to at least `nbytes` readable bytes and stay valid
    /// until the callback has run.
    pub unsafe fn queue_write(
        &mut self,
        fd: RawFd,
        buf: *const u8,
        nbytes: u32,
        offset: u64,
        callback: impl FnOnce(&mut Engine, i32) + 'static,
    ) -> OpHandle {
        self.enqueue(Descriptor::write(fd, buf, nbytes, offset, Box::new(callback)))
    }

    /// Queue a vectored read at `offset`. Semantically a read into the
    /// concatenation of the buffers, issued as one kernel request.
    ///
    /// # Safety
    ///
    /// Every iovec base must point to `iov_len` writable bytes that stay
    /// valid until the callback has run. The iovec array itself is copied.
    pub unsafe fn queue_readv(
        &mut self,
        fd: RawFd,
        iovecs: &[libc::iovec],
        offset: u64,
        callback: impl FnOnce(&mut Engine, i32) + 'static,
    ) -> OpHandle {
        self.enqueue(Descriptor::readv(fd, iovecs, offset, Box::new(callback)))
    }

    /// Queue a vectored write at `offset`.
    ///
    /// # Safety
    ///
    /// Every iovec base must point to `iov_len` readable bytes that stay
    /// valid until the callback has run. The iovec array itself is copied.
    pub unsafe fn queue_writev(
        &mut self,
        fd: RawFd,
        iovecs: &[libc::iovec],
        offset: u64,
        callback: impl FnOnce(&mut Engine, i32) + 'static,
    ) -> OpHandle {
        self.enqueue(Descriptor::writev(fd, iovecs, offset, Box::new(callback)))
    }

    /// Queue a readiness poll for `events` (a `poll(2)`-style mask, e.g.
    /// `libc::POLLIN as u32`). The descriptor comes from the reusable
    /// pool; the callback receives the triggered event mask.
    pub fn queue_poll(
        &mut self,
        fd: RawFd,
        events: u32,
        callback: impl FnOnce(&mut Engine, i32) + 'static,
    ) -> OpHandle {
        self.enqueue(Descriptor::poll(fd, events, Box::new(callback)))
    }

    /// Queue a message receive into a caller-owned `msghdr`.
    ///
    /// When the fixed-descriptor path is taken, truncation detection is
    /// requested so an oversized message reports its full length;
    /// the raw path stays in relaxed mode.
    ///
    /// # Safety
    ///
    /// `msg` and every buffer it references must stay valid until the
    /// callback has run.
    pub unsafe fn queue_recvmsg(
        &mut self,
        fd: RawFd,
        msg: *mut libc::msghdr,
        callback: impl FnOnce(&mut Engine, i32) + 'static,
    ) -> OpHandle {
        self.enqueue(Descriptor::recvmsg(fd, msg, Box::new(callback)))
    }

    /// Request cancellation of an in-flight operation. Best-effort and
    /// advisory: the target's callback still fires exactly once, with
    /// either its natural result or `-ECANCELED`, whichever the kernel
    /// resolves first. A stale handle or a descriptor that is not
    /// currently submitted makes this a no-op.
    pub fn cancel(&mut self, handle: OpHandle) {
        match self.ops.get_mut(handle.index as usize) {
            Some(desc) if desc.serial == handle.serial && desc.state == OpState::Submitted => {
                desc.state = OpState::Cancelling;
            }
            _ => return,
        }
        trace!(index = handle.index, "cancellation requested");
        self.enqueue(Descriptor::cancel(handle.tag()));
    }

    /// Request cancellation of every in-flight operation, one
    /// [`cancel`](Self::cancel) at a time.
    pub fn cancel_all(&mut self) {
        let targets: Vec<OpHandle> = self
            .ops
            .iter()
            .filter(|(_, desc)| desc.state == OpState::Submitted)
            .map(|(index, desc)| OpHandle {
                index: index as u32,
                serial: desc.serial,
            })
            .collect();
        for handle in targets {
            self.cancel(handle);
        }
    }

    /// Ask for a fixed-descriptor slot for `fd`, independent of any
    /// operation. `None` means the table is exhausted or degraded and the
    /// raw descriptor keeps working as before. The binding syncs to the
    /// kernel with the next submission batch.
    pub fn register_fd(&mut self, fd: RawFd) -> Option<FixedFd> {
        self.registry.bind(fd).map(|slot| FixedFd { slot })
    }

    /// Release a slot obtained from [`register_fd`](Self::register_fd).
    ///
    /// The caller guarantees no submitted-but-incomplete operation still
    /// references the slot.
    pub fn unregister_fd(&mut self, fixed: FixedFd) {
        self.registry.free_slot(fixed.slot);
    }

    // ── Submission ───────────────────────────────────────────────────

    /// Encode and submit queued operations in program order.
    ///
    /// Acquires one submission slot per descriptor, tags it, and issues
    /// the kernel submit call once per batch of
    /// [`max_submit_batch`](EngineConfig::max_submit_batch). A full
    /// submission ring or a completion ring at capacity is backpressure,
    /// not an error: the call returns the count the kernel accepted and
    /// leaves the remainder queued for the next call.
    ///
    /// Under [`WaitMode::Wait`] the final submit may also block until a
    /// completion is available, bounded by the configured retry ceiling;
    /// exhausting it is the fatal
    /// [`EngineError::SubmitRetriesExhausted`].
    pub fn submit_pending(&mut self, wait: WaitMode) -> Result<usize> {
        let prefer_fixed = self.config.use_registered_fds;
        let batch_limit = self.config.max_submit_batch;
        let mut accepted = 0usize;
        let mut unflushed = 0usize;

        while let Some(&index) = self.pending.front() {
            if self.in_flight >= self.cq_capacity {
                trace!(
                    in_flight = self.in_flight,
                    "completion ring at capacity; deferring submission"
                );
                break;
            }

            let entry = {
                let desc = self.ops.get_mut(index).expect("pending descriptor vanished");
                let tag = OpHandle {
                    index: index as u32,
                    serial: desc.serial,
                }
                .tag();
                desc.encode(&mut self.registry, prefer_fixed).user_data(tag)
            };

            // SAFETY: the buffers the entry references are kept alive by
            // the queue_* caller contract until the completion is drained.
            if unsafe { self.ring.submission().push(&entry) }.is_err() {
                // Submission ring full: stop here, the remainder is
                // retried on a later call.
                break;
            }

            self.pending.pop_front();
            let desc = self.ops.get_mut(index).expect("pending descriptor vanished");
            desc.state = OpState::Submitted;
            self.in_flight += 1;
            self.total_submitted += 1;
            unflushed += 1;

            if unflushed >= batch_limit {
                accepted += self.flush(WaitMode::DontWait)?;
                unflushed = 0;
            }
        }

        if unflushed > 0 {
            accepted += self.flush(wait)?;
        }
        trace!(accepted, queued = self.pending.len(), "submission pass done");
        Ok(accepted)
    }

    /// Sync the registry, then hand the pushed entries to the kernel.
    fn flush(&mut self, wait: WaitMode) -> Result<usize> {
        if self.registry.has_pending() {
            let submitter = self.ring.submitter();
            self.registry.commit_with(|offset, files| {
                submitter.register_files_update(offset, files).map(|_| ())
            });
        }
        self.submit_busy_check(wait)
    }

    /// Issue the kernel submit call, absorbing transient busy conditions.
    ///
    /// Non-blocking mode reports the shortfall immediately; blocking mode
    /// retries, asking the kernel to wait for a completion to make room,
    /// up to the configured ceiling. A persistent failure past the ceiling
    /// means the ring protocol is broken.
    fn submit_busy_check(&mut self, wait: WaitMode) -> Result<usize> {
        let mut attempts = 0u32;
        loop {
            let res = match wait {
                WaitMode::DontWait => self.ring.submit(),
                WaitMode::Wait => self.ring.submit_and_wait(1),
            };
            match res {
                Ok(n) => return Ok(n),
                Err(err) => match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::EBUSY) | Some(libc::EAGAIN) => {
                        if wait == WaitMode::DontWait {
                            trace!("kernel busy; submission deferred to next pass");
                            return Ok(0);
                        }
                        attempts += 1;
                        if attempts >= self.config.max_submit_retries {
                            warn!(attempts, "submit retry ceiling exhausted");
                            return Err(EngineError::SubmitRetriesExhausted { attempts });
                        }
                    }
                    _ => return Err(err.into()),
                },
            }
        }
    }

    // ── Completion draining ──────────────────────────────────────────

    /// Drain available completions and dispatch their callbacks.
    ///
    /// Each completion entry is resolved through its tag to the owning
    /// descriptor (stale tags are skipped), the signed result is recorded,
    /// the descriptor is released, and the callback runs exactly once
    /// per operation, in the order the kernel reported, which is not
    /// necessarily submission order. Returns the number dispatched.
    ///
    /// Under [`WaitMode::Wait`] with operations in flight and nothing
    /// ready, blocks until at least one completion appears or the wait is
    /// interrupted. Callbacks run synchronously on this thread; they must
    /// not block, and operations they enqueue join the next submission
    /// batch rather than being submitted mid-drain.
    pub fn drain_completions(&mut self, wait: WaitMode) -> Result<usize> {
        if wait == WaitMode::Wait && self.in_flight > 0 && self.ring.completion().is_empty() {
            match self.ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(err)
                    if matches!(
                        err.raw_os_error(),
                        Some(libc::EINTR) | Some(libc::EBUSY)
                    ) => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.dispatch_completions()
    }

    /// [`drain_completions`](Self::drain_completions) with a bounded wait.
    ///
    /// Returns 0 when the timeout elapses with nothing completed.
    pub fn drain_completions_timeout(&mut self, timeout: Duration) -> Result<usize> {
        if self.in_flight > 0 && self.ring.completion().is_empty() {
            let ts = types::Timespec::new()
                .sec(timeout.as_secs())
                .nsec(timeout.subsec_nanos());
            let args = types::SubmitArgs::new().timespec(&ts);
            match self.ring.submitter().submit_with_args(1, &args) {
                Ok(_) => {}
                Err(err) => match err.raw_os_error() {
                    Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY) => {}
                    // Timed waits need a newer kernel; degrade to a poll.
                    Some(libc::EINVAL) => {
                        warn!("timed completion wait unsupported; draining without blocking");
                    }
                    _ => return Err(err.into()),
                },
            }
        }
        self.dispatch_completions()
    }

    fn dispatch_completions(&mut self) -> Result<usize> {
        // The batch buffer is detached while callbacks run so a callback
        // that queues new work (or even re-enters draining) cannot alias
        // the entries being dispatched.
        let mut batch = std::mem::take(&mut self.cqe_batch);
        batch.clear();
        {
            let mut cq = self.ring.completion();
            for cqe in &mut cq {
                batch.push((cqe.user_data(), cqe.result()));
            }
            cq.sync();
        }

        let mut handled = 0usize;
        for &(tag, result) in &batch {
            let handle = OpHandle::from_tag(tag);
            let index = handle.index as usize;
            let (callback, slot, pooled) = match self.ops.get_mut(index) {
                Some(desc) if desc.serial == handle.serial => {
                    desc.complete(result);
                    (desc.take_callback(), desc.fixed.take(), desc.pooled)
                }
                _ => {
                    trace!(tag, "stale completion tag ignored");
                    continue;
                }
            };

            self.in_flight -= 1;
            self.total_completed += 1;
            if let Some(slot) = slot {
                // The completion has been delivered, so nothing in flight
                // references the slot anymore.
                self.registry.free_slot(slot);
            }
            self.release(index, pooled);
            handled += 1;

            if result < 0 {
                trace!(index, result, "operation completed with kernel error");
            }
            if let Some(callback) = callback {
                callback(self, result);
            }
        }

        batch.clear();
        self.cqe_batch = batch;
        Ok(handled)
    }

    fn release(&mut self, index: usize, pooled: bool) {
        if pooled && self.pool_free.len() < self.config.pool_capacity {
            let serial = self.bump_serial();
            let desc = self.ops.get_mut(index).expect("released descriptor vanished");
            desc.retire(serial);
            self.pool_free.push(index);
        } else {
            self.ops.remove(index);
        }
    }

    fn enqueue(&mut self, mut desc: Descriptor) -> OpHandle {
        let serial = self.bump_serial();
        desc.serial = serial;
        let pooled = desc.pooled;
        let index = if pooled {
            match self.pool_free.pop() {
                Some(free) => {
                    *self.ops.get_mut(free).expect("pool slot vanished") = desc;
                    free
                }
                None => self.ops.insert(desc),
            }
        } else {
            self.ops.insert(desc)
        };
        self.pending.push_back(index);
        OpHandle {
            index: index as u32,
            serial,
        }
    }

    fn bump_serial(&mut self) -> u32 {
        self.next_serial = self.next_serial.wrapping_add(1);
        self.next_serial
    }

    // ── Lifecycle and observability ──────────────────────────────────

    /// Cancel everything in flight and drain until quiescent, bounded.
    ///
    /// Operations queued but never submitted are discarded: their
    /// callbacks do not fire. Called from `Drop` as well; an engine that
    /// cannot quiesce within the bound leaks its remaining descriptors
    /// rather than blocking forever.
    pub fn shutdown(&mut self) {
        while let Some(index) = self.pending.pop_front() {
            self.ops.remove(index);
        }
        self.cancel_all();
        let _ = self.submit_pending(WaitMode::DontWait);
        for _ in 0..100 {
            if self.in_flight == 0 {
                break;
            }
            if self
                .drain_completions_timeout(Duration::from_millis(100))
                .is_err()
            {
                break;
            }
            let _ = self.submit_pending(WaitMode::DontWait);
        }
        if self.in_flight > 0 {
            warn!(
                in_flight = self.in_flight,
                "engine shut down with operations still in flight"
            );
        }
    }

    /// Operations submitted but not yet completed.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Operations queued but not yet submitted.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Completion-ring capacity: the upper bound on in-flight operations.
    pub fn capacity(&self) -> usize {
        self.cq_capacity
    }

    /// Operations handed to the kernel over the engine's lifetime.
    pub fn total_submitted(&self) -> u64 {
        self.total_submitted
    }

    /// Completions dispatched over the engine's lifetime.
    pub fn total_completed(&self) -> u64 {
        self.total_completed
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.in_flight > 0 || !self.pending.is_empty() {
            self.shutdown();
        }
    }
}
