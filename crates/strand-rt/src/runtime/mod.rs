// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler internals: task arena, ready queue, epoll reactor and the
//! readiness futures built on it.
//!
//! Components:
//! - `task`      — generational task arena, task states, wakers
//! - `queue`     — FIFO ready queue
//! - `reactor`   — epoll registrations, one-shot delivery
//! - `scheduler` — run loop and continuation handoff
//! - `io`        — readiness future and retrying syscall helpers
//! - `handle`    — `JoinHandle` for spawned units

pub mod handle;
pub mod io;
pub(crate) mod queue;
pub mod reactor;
pub(crate) mod scheduler;
pub mod task;
