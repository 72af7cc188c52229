// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Join handles for spawned units.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use super::task::TaskId;
use crate::error::Outcome;
use crate::unit::Slot;

/// Result slot of a unit handed to `Runtime::spawn`.
///
/// The spawned task writes the unit's outcome here when it finishes. The
/// handle can be inspected after `run()` returns; dropping it detaches the
/// task, which keeps running.
pub struct JoinHandle<T> {
    id: TaskId,
    slot: Rc<RefCell<Slot<T>>>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(id: TaskId, slot: Rc<RefCell<Slot<T>>>) -> Self {
        Self { id, slot }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// True once the unit finished and its outcome has not been taken.
    pub fn is_finished(&self) -> bool {
        !self.slot.borrow().is_empty()
    }

    /// Take the outcome if the unit has finished.
    pub fn try_result(&self) -> Option<Outcome<T>> {
        self.slot.borrow_mut().take()
    }

    /// Take the outcome.
    ///
    /// Panics if the unit has not finished (or the outcome was already
    /// taken), same as `Unit::result`.
    pub fn result(&self) -> Outcome<T> {
        match self.try_result() {
            Some(outcome) => outcome,
            None => panic!("JoinHandle::result called before {:?} finished", self.id),
        }
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Failure, Runtime, Unit};

    #[test]
    fn spawn_and_collect() {
        let rt = Runtime::new().unwrap();
        let h = rt.spawn(Unit::new(async { Ok(42) }));
        assert!(!h.is_finished());
        rt.run().unwrap();
        assert!(h.is_finished());
        assert_eq!(h.result().unwrap(), 42);
        assert!(h.try_result().is_none());
    }

    #[test]
    fn failure_reaches_the_handle() {
        let rt = Runtime::new().unwrap();
        let h = rt.spawn(Unit::<()>::new(async { Err(Failure::custom("nope")) }));
        rt.run().unwrap();
        match h.result() {
            Err(Failure::Custom(msg)) => assert_eq!(msg, "nope"),
            other => panic!("expected Custom, got {:?}", other),
        }
    }

    #[test]
    fn panic_is_captured() {
        let rt = Runtime::new().unwrap();
        let h = rt.spawn(Unit::<i32>::new(async { panic!("boom") }));
        rt.run().unwrap();
        match h.result() {
            Err(Failure::Panicked(msg)) => assert!(msg.contains("boom")),
            other => panic!("expected Panicked, got {:?}", other),
        }
    }

    #[test]
    fn many_tasks() {
        let rt = Runtime::new().unwrap();
        let handles: Vec<_> = (0..100)
            .map(|i| rt.spawn(Unit::new(async move { Ok(i * 2) })))
            .collect();
        rt.run().unwrap();
        let sum: i32 = handles.iter().map(|h| h.result().unwrap()).sum();
        assert_eq!(sum, (0..100).map(|i| i * 2).sum());
    }

    #[test]
    #[should_panic(expected = "before")]
    fn early_result_panics() {
        let rt = Runtime::new().unwrap();
        let h = rt.spawn(Unit::new(async { Ok(1) }));
        let _ = h.result();
    }
}
