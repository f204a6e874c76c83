//! Operation descriptors.
//!
//! Each in-flight I/O request is one [`Descriptor`]: a closed tagged
//! variant over the operation shapes the engine supports. A descriptor has
//! exactly two jobs: encode itself into a submission ring entry, and
//! resolve its own completion by handing the raw signed result to its
//! callback exactly once.

use std::fmt;
use std::os::unix::io::RawFd;
use std::ptr;

use io_uring::{opcode, squeue, types};

use crate::engine::Engine;
use crate::registry::FdRegistry;

#[cfg(test)]
mod tests;

/// Completion callback: receives the engine back (so it may enqueue
/// follow-up operations) and the raw signed kernel result.
pub(crate) type OpCallback = Box<dyn FnOnce(&mut Engine, i32)>;

/// The shape of an I/O operation.
///
/// The variant set is fixed: each corresponds to one submission opcode the
/// engine knows how to encode and resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Single-buffer read at a file offset.
    Read,
    /// Single-buffer write at a file offset.
    Write,
    /// Scatter read over an iovec array (readv).
    ReadVectored,
    /// Gather write over an iovec array (writev).
    WriteVectored,
    /// Readiness notification for an event mask.
    PollAdd,
    /// Message receive into a caller-owned msghdr.
    RecvMsg,
    /// Best-effort cancellation of another in-flight operation.
    Cancel,
}

impl OpKind {
    /// Whether this kind may address the kernel through a registered
    /// descriptor slot. Vectored operations stay on the raw-fd path, and
    /// cancellations target a tag rather than a descriptor.
    #[inline]
    pub const fn uses_fixed_fd(self) -> bool {
        matches!(self, Self::Read | Self::Write | Self::PollAdd | Self::RecvMsg)
    }

    /// Whether this kind carries an iovec array rather than one buffer.
    #[inline]
    pub const fn is_vectored(self) -> bool {
        matches!(self, Self::ReadVectored | Self::WriteVectored)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::ReadVectored => write!(f, "readv"),
            Self::WriteVectored => write!(f, "writev"),
            Self::PollAdd => write!(f, "poll"),
            Self::RecvMsg => write!(f, "recvmsg"),
            Self::Cancel => write!(f, "cancel"),
        }
    }
}

/// Descriptor lifecycle.
///
/// `Created → Submitted → Completed`, with a `Cancelling` detour when a
/// cancellation has been requested for a submitted descriptor. The
/// callback fires exactly once, on the `Completed` transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpState {
    Created,
    Submitted,
    Cancelling,
    Completed,
}

/// One pending I/O request.
///
/// Flat storage for every kind; unused fields stay at their defaults. The
/// iovec array doubles as the single-buffer storage for plain reads and
/// writes, so all file operations share one encode path.
pub(crate) struct Descriptor {
    pub(crate) kind: OpKind,
    pub(crate) fd: RawFd,
    /// Registered slot, once the registry has granted one. Encoding uses
    /// it only after the registry confirms the binding with the kernel.
    pub(crate) fixed: Option<u32>,
    iov: Vec<libc::iovec>,
    msg: *mut libc::msghdr,
    events: u32,
    offset: u64,
    /// Victim tag for `Cancel`.
    target: u64,
    pub(crate) state: OpState,
    pub(crate) result: Option<i32>,
    pub(crate) callback: Option<OpCallback>,
    /// Pool-reusable (internal polls and cancels) vs heap-owned
    /// (user-issued requests).
    pub(crate) pooled: bool,
    /// Generation stamp; completion tags carry it so a stale tag can be
    /// detected before dispatch.
    pub(crate) serial: u32,
}

impl Descriptor {
    fn new(kind: OpKind, fd: RawFd, pooled: bool) -> Self {
        Self {
            kind,
            fd,
            fixed: None,
            iov: Vec::new(),
            msg: ptr::null_mut(),
            events: 0,
            offset: 0,
            target: 0,
            state: OpState::Created,
            result: None,
            callback: None,
            pooled,
            serial: 0,
        }
    }

    pub(crate) fn read(
        fd: RawFd,
        buf: *mut u8,
        nbytes: u32,
        offset: u64,
        callback: OpCallback,
    ) -> Self {
        let mut desc = Self::new(OpKind::Read, fd, false);
        desc.iov.push(libc::iovec {
            iov_base: buf.cast(),
            iov_len: nbytes as usize,
        });
        desc.offset = offset;
        desc.callback = Some(callback);
        desc
    }

    pub(crate) fn write(
        fd: RawFd,
        buf: *const u8,
        nbytes: u32,
        offset: u64,
        callback: OpCallback,
    ) -> Self {
        let mut desc = Self::new(OpKind::Write, fd, false);
        desc.iov.push(libc::iovec {
            iov_base: buf.cast_mut().cast(),
            iov_len: nbytes as usize,
        });
        desc.offset = offset;
        desc.callback = Some(callback);
        desc
    }

    pub(crate) fn readv(
        fd: RawFd,
        iovecs: &[libc::iovec],
        offset: u64,
        callback: OpCallback,
    ) -> Self {
        let mut desc = Self::new(OpKind::ReadVectored, fd, false);
        desc.iov.extend_from_slice(iovecs);
        desc.offset = offset;
        desc.callback = Some(callback);
        desc
    }

    pub(crate) fn writev(
        fd: RawFd,
        iovecs: &[libc::iovec],
        offset: u64,
        callback: OpCallback,
    ) -> Self {
        let mut desc = Self::new(OpKind::WriteVectored, fd, false);
        desc.iov.extend_from_slice(iovecs);
        desc.offset = offset;
        desc.callback = Some(callback);
        desc
    }

    pub(crate) fn poll(fd: RawFd, events: u32, callback: OpCallback) -> Self {
        let mut desc = Self::new(OpKind::PollAdd, fd, true);
        desc.events = events;
        desc.callback = Some(callback);
        desc
    }

    pub(crate) fn recvmsg(fd: RawFd, msg: *mut libc::msghdr, callback: OpCallback) -> Self {
        let mut desc = Self::new(OpKind::RecvMsg, fd, false);
        desc.msg = msg;
        desc.callback = Some(callback);
        desc
    }

    /// Cancellation request targeting another descriptor's completion tag.
    /// Carries no user callback; its own completion is released silently.
    pub(crate) fn cancel(target: u64) -> Self {
        let mut desc = Self::new(OpKind::Cancel, -1, true);
        desc.target = target;
        desc
    }

    /// Build the submission ring entry for this descriptor.
    ///
    /// When `prefer_fixed` is set and the kind supports it, the registry is
    /// asked for a slot first. Only a binding the kernel has already
    /// confirmed is encoded as a fixed reference; a pending or denied slot
    /// falls back to raw-fd addressing with identical observable behavior.
    pub(crate) fn encode(&mut self, registry: &mut FdRegistry, prefer_fixed: bool) -> squeue::Entry {
        if prefer_fixed && self.kind.uses_fixed_fd() && self.fixed.is_none() {
            self.fixed = registry.bind(self.fd);
        }
        let fixed = self.fixed.filter(|&slot| registry.is_confirmed(slot));

        match self.kind {
            OpKind::Read => {
                let iov = self.iov[0];
                match fixed {
                    Some(slot) => {
                        opcode::Read::new(types::Fixed(slot), iov.iov_base.cast(), iov.iov_len as u32)
                            .offset(self.offset)
                            .build()
                    }
                    None => {
                        opcode::Read::new(types::Fd(self.fd), iov.iov_base.cast(), iov.iov_len as u32)
                            .offset(self.offset)
                            .build()
                    }
                }
            }
            OpKind::Write => {
                let iov = self.iov[0];
                match fixed {
                    Some(slot) => opcode::Write::new(
                        types::Fixed(slot),
                        iov.iov_base.cast_const().cast(),
                        iov.iov_len as u32,
                    )
                    .offset(self.offset)
                    .build(),
                    None => opcode::Write::new(
                        types::Fd(self.fd),
                        iov.iov_base.cast_const().cast(),
                        iov.iov_len as u32,
                    )
                    .offset(self.offset)
                    .build(),
                }
            }
            OpKind::ReadVectored => {
                opcode::Readv::new(types::Fd(self.fd), self.iov.as_ptr(), self.iov.len() as u32)
                    .offset(self.offset)
                    .build()
            }
            OpKind::WriteVectored => {
                opcode::Writev::new(types::Fd(self.fd), self.iov.as_ptr(), self.iov.len() as u32)
                    .offset(self.offset)
                    .build()
            }
            OpKind::PollAdd => match fixed {
                Some(slot) => opcode::PollAdd::new(types::Fixed(slot), self.events).build(),
                None => opcode::PollAdd::new(types::Fd(self.fd), self.events).build(),
            },
            // Truncation detection is only requested on the fixed path; the
            // raw path stays in relaxed mode, mirroring the kernel-side
            // behavior difference for oversized messages.
            OpKind::RecvMsg => match fixed {
                Some(slot) => opcode::RecvMsg::new(types::Fixed(slot), self.msg)
                    .flags(libc::MSG_TRUNC as u32)
                    .build(),
                None => opcode::RecvMsg::new(types::Fd(self.fd), self.msg).build(),
            },
            OpKind::Cancel => opcode::AsyncCancel::new(self.target).build(),
        }
    }

    /// Record the completion result. The callback is taken and invoked by
    /// the drain path; the state machine guarantees this happens once.
    pub(crate) fn complete(&mut self, result: i32) {
        debug_assert!(
            matches!(self.state, OpState::Submitted | OpState::Cancelling),
            "completion for a descriptor in state {:?}",
            self.state
        );
        self.result = Some(result);
        self.state = OpState::Completed;
    }

    pub(crate) fn take_callback(&mut self) -> Option<OpCallback> {
        self.callback.take()
    }

    /// Reset a pooled descriptor for reuse. The new serial makes any tag
    /// still referencing the previous occupant stale.
    pub(crate) fn retire(&mut self, serial: u32) {
        self.fd = -1;
        self.fixed = None;
        self.iov.clear();
        self.msg = ptr::null_mut();
        self.events = 0;
        self.offset = 0;
        self.target = 0;
        self.state = OpState::Created;
        self.result = None;
        self.callback = None;
        self.serial = serial;
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("kind", &self.kind)
            .field("fd", &self.fd)
            .field("fixed", &self.fixed)
            .field("state", &self.state)
            .field("result", &self.result)
            .field("pooled", &self.pooled)
            .field("serial", &self.serial)
            .finish_non_exhaustive()
    }
}
