// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cancellation of pending waits.
//!
//! A timer entry keeps a token shared with the sleep that created it. When
//! the sleep is dropped before it fires, the guard flips the token and the
//! scheduler discards the entry instead of waking a unit that is gone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Flag shared between a waiter and whatever will eventually fire it.
#[derive(Debug, Default)]
pub struct CancelToken {
    flag: AtomicBool,
}

impl CancelToken {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Cancels its token on drop unless disarmed first.
#[derive(Debug)]
pub(crate) struct CancelOnDrop {
    token: Option<Arc<CancelToken>>,
}

impl CancelOnDrop {
    pub fn new(token: Arc<CancelToken>) -> Self {
        Self { token: Some(token) }
    }

    /// The wait completed normally; dropping no longer cancels.
    pub fn disarm(&mut self) {
        self.token = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }
}
