//! # uring-engine: callback-driven io_uring for single-threaded reactors
//!
//! An asynchronous I/O backend built on the Linux io_uring completion-ring
//! facility. The engine owns a pair of fixed-capacity kernel ring buffers:
//! requests are encoded into submission ring slots and handed to the
//! kernel in batches, and their outcomes are later drained from the
//! completion ring and dispatched, one callback per operation, exactly
//! once, without a blocking system call per request.
//!
//! The crate is the submission/completion core a reactor builds on. It
//! deliberately does not own an event loop, futures, or buffers: the host
//! calls [`Engine::submit_pending`] and [`Engine::drain_completions`] on
//! each loop iteration and keeps operation buffers alive until their
//! callbacks run.
//!
//! ## Example
//!
//! ```no_run
//! use uring_engine::{Engine, EngineConfig, WaitMode};
//!
//! # fn main() -> uring_engine::Result<()> {
//! let mut engine = Engine::new(EngineConfig::default())?;
//!
//! let mut buf = vec![0u8; 4096];
//! // SAFETY: `buf` outlives the operation; we drain before dropping it.
//! let _handle = unsafe {
//!     engine.queue_read(0, buf.as_mut_ptr(), buf.len() as u32, 0, |_engine, res| {
//!         println!("read completed: {res}");
//!     })
//! };
//!
//! engine.submit_pending(WaitMode::DontWait)?;
//! while engine.in_flight() > 0 {
//!     engine.drain_completions(WaitMode::Wait)?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Backpressure and failure
//!
//! A full submission ring is not an error; [`Engine::submit_pending`]
//! reports how many entries the kernel accepted and keeps the remainder
//! queued. Per-operation kernel faults arrive as negative results in the
//! operation's own callback. Only two conditions are errors of the engine
//! itself: io_uring being unavailable at construction
//! ([`EngineError::NotAvailable`]) and a submit call that stays rejected
//! past the retry ceiling ([`EngineError::SubmitRetriesExhausted`]).
//!
//! ## Registered descriptors
//!
//! With [`EngineConfig::registered_fds`], single-buffer reads and writes,
//! readiness polls, and message receives address the kernel through a
//! pre-registered descriptor table when a slot is available, skipping the
//! per-operation descriptor lookup. The optimization is transparent:
//! exhaustion or a kernel rejection falls back to raw descriptors with no
//! change in behavior.
//!
//! ## Threading
//!
//! One engine belongs to one thread; it is intentionally neither `Send`
//! nor `Sync`. Run one engine per thread instead of sharing one.
//!
//! Linux only: construction fails with a distinct error on kernels
//! without io_uring, and [`Engine::is_available`] lets hosts probe before
//! committing to this backend.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod engine;
pub mod error;
pub mod operation;
pub mod registry;

pub use config::EngineConfig;
pub use engine::{Engine, OpHandle, WaitMode};
pub use error::{EngineError, Result};
pub use operation::OpKind;
pub use registry::{FdRegistry, FixedFd};
