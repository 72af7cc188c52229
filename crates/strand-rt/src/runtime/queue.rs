// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Ready queue.
//!
//! FIFO of task ids that are eligible to run. Wakers push onto it and the
//! scheduler drains it front to back. A task appears here at most once per
//! Waiting -> Ready transition.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::task::TaskId;

/// Mutex-protected so wakers (which must be `Send + Sync`) can hold it.
/// Only the runtime thread touches it in practice.
pub(crate) struct ReadyQueue {
    deque: Mutex<VecDeque<TaskId>>,
}

impl ReadyQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            deque: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<TaskId>> {
        self.deque.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, id: TaskId) {
        self.lock().push_back(id);
    }

    pub fn pop(&self) -> Option<TaskId> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
