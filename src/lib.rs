//! # evaio
//!
//! Asynchronous disk I/O backends for event-driven reactors.
//!
//! A host reactor multiplexes readiness, timers, and signals; this crate
//! adds batched, non-blocking disk reads and writes on top of the OS's
//! async I/O facilities, delivering completions back as ordinary reactor
//! events. The hard parts live here: queue management, batched submission
//! with backpressure, completion draining without starvation, and
//! cancellation racing safely against in-flight kernel completions.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                          AioDriver                             │
//! ├────────────────────────────────────────────────────────────────┤
//! │                                                                │
//! │  ┌──────────────┐   ┌────────────────┐   ┌─────────────────┐  │
//! │  │ Pending FIFO │──▶│ one AioBackend │──▶│ Submitted       │  │
//! │  │ (queue.rs)   │   │ (backend/)     │   │ Registry        │  │
//! │  └──────────────┘   └────────────────┘   └─────────────────┘  │
//! │                             │                     │            │
//! │                     OS batch calls        completion drains    │
//! │                             │                     │            │
//! │                      ┌──────▼─────────────────────▼────────┐   │
//! │                      │ activation list ──▶ dispatch()      │   │
//! │                      └─────────────────────────────────────┘   │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Three backends implement the [`AioBackend`] contract:
//!
//! - **kernel-aio** (Linux): `io_submit` batching, completions signaled
//!   through an `eventfd` registered with the reactor.
//! - **posix-aio-signal**: `lio_listio` batching, completions detected by
//!   scanning the submitted registry when the completion signal fires.
//! - **posix-aio-readiness**: `lio_listio` batching, completions
//!   delivered per operation by the reactor's own readiness
//!   demultiplexer.
//!
//! The host reactor implements [`ReactorHandle`] and drives the
//! [`AioDriver`] from its loop: `submit` each pass, the matching
//! `on_notify`/`on_signal`/`on_op_ready` on wake-ups, then `dispatch` to
//! run completion callbacks on its own control flow. The whole subsystem
//! is single-threaded-cooperative: callers hold the reactor's
//! serialization lock around every entry point, and nothing here blocks.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod backend;
pub mod config;
pub mod error;
pub mod queue;
pub mod reactor;
pub mod request;

// Re-exports
pub use backend::{create_native_backend, AioBackend, Wake};
#[cfg(target_os = "linux")]
pub use backend::KernelAio;
#[cfg(unix)]
pub use backend::{PosixReadinessAio, PosixSignalAio};
pub use config::{AioConfig, ConfigError, MAX_BATCH_CAPACITY};
pub use error::{InitError, RequestError, SubmitError};
pub use queue::AioQueues;
pub use reactor::{AioDriver, ReactorHandle};
pub use request::{
    AioCallback, AioHandle, AioRequest, AioRequestId, Completion, OpKind, RequestState,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
