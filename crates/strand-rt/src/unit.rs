// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Units: suspended computations with a result slot.
//!
//! A `Unit<T>` owns a boxed future (its frame and resumption point) and a
//! tagged slot that is written exactly once, when the body finishes. Units
//! are lazy: nothing runs until the first `resume`.
//!
//! Awaiting a unit from inside another computation polls it inline, so a
//! finishing unit hands control straight back to its awaiter within the same
//! call. A chain of nested awaits therefore unwinds innermost-first without
//! touching the scheduler.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::{Failure, Outcome};

pub(crate) type LocalBoxFuture<T> = Pin<Box<dyn Future<Output = T>>>;

/// Result slot of a unit.
#[derive(Debug)]
pub enum Slot<T> {
    Empty,
    Value(T),
    Failed(Failure),
}

impl<T> Slot<T> {
    pub fn is_empty(&self) -> bool {
        matches!(self, Slot::Empty)
    }

    /// Store a terminal outcome. The slot must be empty.
    pub fn put(&mut self, outcome: Outcome<T>) {
        debug_assert!(self.is_empty(), "result slot written twice");
        *self = match outcome {
            Ok(v) => Slot::Value(v),
            Err(e) => Slot::Failed(e),
        };
    }

    /// Move the outcome out, leaving the slot empty.
    pub fn take(&mut self) -> Option<Outcome<T>> {
        match mem::replace(self, Slot::Empty) {
            Slot::Empty => None,
            Slot::Value(v) => Some(Ok(v)),
            Slot::Failed(e) => Some(Err(e)),
        }
    }
}

/// A suspendable computation producing `Outcome<T>`.
///
/// Exclusively owned. Awaiting consumes it, so a unit cannot be awaited
/// twice.
#[must_use = "units do nothing unless resumed, awaited or spawned"]
pub struct Unit<T> {
    body: Option<LocalBoxFuture<Outcome<T>>>,
    slot: Slot<T>,
}

// The slot is never pinned; only the boxed body is, and it pins itself.
impl<T> Unpin for Unit<T> {}

impl<T: 'static> Unit<T> {
    /// Wrap a computation. It starts suspended.
    pub fn new<F>(body: F) -> Self
    where
        F: Future<Output = Outcome<T>> + 'static,
    {
        Self {
            body: Some(Box::pin(body)),
            slot: Slot::Empty,
        }
    }

    /// An already-finished unit holding `value`.
    pub fn value(value: T) -> Self {
        Self {
            body: None,
            slot: Slot::Value(value),
        }
    }

    /// An already-finished unit holding `failure`.
    pub fn failure(failure: Failure) -> Self {
        Self {
            body: None,
            slot: Slot::Failed(failure),
        }
    }
}

impl<T> Unit<T> {
    /// True once the body has reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.body.is_none()
    }

    /// Run the body from its resumption point until it suspends or finishes.
    ///
    /// Returns `Ready` once the slot holds the outcome. A panic in the body
    /// is captured as `Failure::Panicked` and counts as finishing.
    pub fn resume(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let Some(body) = self.body.as_mut() else {
            return Poll::Ready(());
        };

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| body.as_mut().poll(cx))) {
            Ok(Poll::Pending) => return Poll::Pending,
            Ok(Poll::Ready(outcome)) => outcome,
            Err(payload) => Err(Failure::Panicked(panic_message(payload.as_ref()))),
        };

        // Drop the frame before publishing the result.
        self.body = None;
        self.slot.put(outcome);
        Poll::Ready(())
    }

    /// Move out the stored value or failure.
    ///
    /// Panics if the unit has not finished or the result was already taken.
    pub fn result(&mut self) -> Outcome<T> {
        assert!(
            self.is_finished(),
            "Unit::result called before the unit finished"
        );
        match self.slot.take() {
            Some(outcome) => outcome,
            None => panic!("Unit::result called twice"),
        }
    }

    /// Like `result`, but `None` while the unit is still suspended.
    pub fn try_result(&mut self) -> Option<Outcome<T>> {
        if self.is_finished() {
            self.slot.take()
        } else {
            None
        }
    }
}

impl<T> Future for Unit<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.resume(cx) {
            Poll::Ready(()) => Poll::Ready(this.result()),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> fmt::Debug for Unit<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.body.is_some() {
            "suspended"
        } else if self.slot.is_empty() {
            "consumed"
        } else {
            "finished"
        };
        f.debug_struct("Unit").field("state", &state).finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
