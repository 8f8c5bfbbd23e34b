#![allow(clippy::let_and_return)]
//! A lightweight, cooperative M:N concurrency runtime.
//!
//! Fibers are stackful user-space tasks multiplexed onto one or a few OS
//! threads by a per-thread [scheduler](sched). Fibers talk to each other
//! through typed [channels](fiber::Channel) and a multi-way
//! [select](fiber::Select), sleep and wait on file descriptors through the
//! [poller](poller), and offload blocking syscalls onto a [pool](worker) of
//! worker threads connected back to their scheduler by a [pipe](pipe).
//!
//! - [Fibers: spawning, channels, select, mutex, wait-group](fiber)
//! - [CoIO: non-blocking descriptor wrapper](coio)
//! - [Worker pool and offloaded tasks](worker)
//! - [Clock](clock)
//! - [Error handling](error)
//!
//! ### Environment
//!
//! - `MILL_WORKERS` overrides the default number of permanent worker threads
//!   in the shared worker pool.
pub mod clock;
pub mod coio;
mod context;
pub mod error;
pub mod fiber;
pub mod pipe;
pub mod poller;
mod sched;
mod semaphore;
mod stack;
mod timer;
pub mod waitgroup;
pub mod worker;

pub use error::Result;
pub type StdResult<T, E> = std::result::Result<T, E>;
