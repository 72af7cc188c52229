// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Strand runtime library.
//!
//! Single-threaded cooperative runtime: units (suspended computations)
//! resumed by a scheduler with a FIFO ready queue, a timer heap and an
//! epoll reactor. A unit that finishes hands control straight to the unit
//! waiting on it instead of going back through the queue.
//!
//! Components:
//! - unit — `Unit<T>`, the result slot and the continuation protocol
//! - runtime — task arena, ready queue, reactor, run loop
//! - context — `Runtime` and its clonable `Handle`
//! - timer — `sleep_for` / `sleep_until`
//! - net — non-blocking `TcpStream` client
//! - combinator — `when_all`, `when_any`, `join`
//!
//! ```no_run
//! use std::time::Duration;
//! use strand_rt::{Runtime, Unit};
//!
//! let rt = Runtime::new()?;
//! let h = rt.handle();
//! let out = rt.block_on(Unit::new(async move {
//!     let conn = h.create_tcp_client("127.0.0.1", 7000).await?;
//!     conn.write_all(b"ping").await?;
//!     let mut buf = [0u8; 4];
//!     let n = conn.read(&mut buf).await?;
//!     h.sleep_for(Duration::from_millis(10)).await?;
//!     Ok(buf[..n].to_vec())
//! }))?;
//! assert_eq!(out, b"ping");
//! # Ok::<(), strand_rt::Failure>(())
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("strand-rt drives I/O through epoll and only builds on Linux");

pub mod cancel;
pub mod combinator;
pub mod config;
pub mod context;
pub mod error;
pub mod net;
pub mod runtime;
pub mod timer;
pub mod unit;

pub use cancel::CancelToken;
pub use combinator::JoinUnits;
pub use config::RuntimeConfig;
pub use context::{Handle, Runtime};
pub use error::{Failure, Outcome};
pub use net::TcpStream;
pub use runtime::handle::JoinHandle;
pub use runtime::io::AsyncReady;
pub use runtime::reactor::{Interest, Reactor, Readiness};
pub use runtime::task::{TaskId, TaskState};
pub use unit::{Slot, Unit};
