// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime context.
//!
//! A `Runtime` owns one scheduler (ready queue, timer heap, reactor). Code
//! running inside it reaches the scheduler through a cloned `Handle`
//! rather than a global, so several runtimes can coexist in one process
//! and tests get a fresh one each.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::config::RuntimeConfig;
use crate::error::{Failure, Outcome};
use crate::runtime::handle::JoinHandle;
use crate::runtime::reactor::Reactor;
use crate::runtime::scheduler::Core;
use crate::runtime::task::{TaskId, TaskState};
use crate::unit::{Slot, Unit};

/// Owner of a scheduler.
///
/// Dropping the runtime abandons any task that has not finished: their
/// frames are dropped, which cancels their timers and releases their
/// descriptors.
pub struct Runtime {
    handle: Handle,
}

impl Runtime {
    /// Runtime configured from the environment (`STRAND_*` variables).
    pub fn new() -> Result<Self, Failure> {
        Self::with_config(RuntimeConfig::from_env())
    }

    pub fn with_config(config: RuntimeConfig) -> Result<Self, Failure> {
        let core = Core::new(config)?;
        tracing::debug!(
            max_events = core.config().max_events,
            ready_capacity = core.config().ready_capacity,
            "runtime created"
        );
        Ok(Self {
            handle: Handle {
                core: Rc::new(core),
            },
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Queue `unit` as a top-level task. It first runs inside `run()`.
    pub fn spawn<T: 'static>(&self, unit: Unit<T>) -> JoinHandle<T> {
        self.handle.spawn(unit)
    }

    /// Drive queued tasks, timers and descriptor events until nothing is
    /// left that could make progress.
    pub fn run(&self) -> Result<(), Failure> {
        self.handle.core.run()?;
        Ok(())
    }

    /// Spawn `unit`, run to quiescence and return its outcome.
    ///
    /// Fails with `Failure::Stalled` if the runtime went idle while the
    /// unit was still suspended.
    pub fn block_on<T: 'static>(&self, unit: Unit<T>) -> Outcome<T> {
        let handle = self.spawn(unit);
        self.run()?;
        handle.try_result().unwrap_or(Err(Failure::Stalled))
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.handle.core.shutdown();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("tasks", &self.handle.core.task_count())
            .finish()
    }
}

/// Cheap, clonable access to a runtime's scheduler.
#[derive(Clone)]
pub struct Handle {
    core: Rc<Core>,
}

impl Handle {
    pub(crate) fn core(&self) -> &Rc<Core> {
        &self.core
    }

    pub fn reactor(&self) -> &Rc<Reactor> {
        self.core.reactor()
    }

    /// Queue `unit` at the back of the ready queue.
    pub fn spawn<T: 'static>(&self, unit: Unit<T>) -> JoinHandle<T> {
        let slot = Rc::new(RefCell::new(Slot::Empty));
        let out = slot.clone();
        let id = self.core.spawn(Box::pin(async move {
            let outcome = unit.await;
            out.borrow_mut().put(outcome);
            None
        }));
        JoinHandle::new(id, slot)
    }

    /// A unit that suspends once, putting its task at the back of the
    /// ready queue.
    pub fn yield_now(&self) -> Unit<()> {
        Unit::new(YieldNow { yielded: false })
    }

    /// Id of the task being resumed, `None` outside any task.
    pub fn current_task(&self) -> Option<TaskId> {
        self.core.current_task()
    }

    /// State of a live task; `None` once it has finished.
    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.core.task_state(id)
    }

    /// Number of tasks in the arena, finished ones excluded.
    pub fn task_count(&self) -> usize {
        self.core.task_count()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("current", &self.core.current_task())
            .finish()
    }
}

struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = Outcome<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.yielded {
            return Poll::Ready(Ok(()));
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn yield_lets_queued_tasks_run_first() {
        let rt = Runtime::new().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));

        for name in ["a", "b"] {
            let h = rt.handle();
            let log = log.clone();
            rt.spawn(Unit::new(async move {
                log.borrow_mut().push(format!("{name}1"));
                h.yield_now().await?;
                log.borrow_mut().push(format!("{name}2"));
                Ok(())
            }));
        }
        rt.run().unwrap();
        assert_eq!(*log.borrow(), vec!["a1", "b1", "a2", "b2"]);
    }

    #[test]
    fn current_task_inside_and_outside() {
        let rt = Runtime::new().unwrap();
        let handle = rt.handle();
        assert!(handle.current_task().is_none());

        let h = handle.clone();
        let joined = rt.spawn(Unit::new(async move { Ok(h.current_task()) }));
        let id = joined.id();
        assert_eq!(handle.task_state(id), Some(TaskState::Ready));
        rt.run().unwrap();
        assert!(handle.task_state(id).is_none());
        assert_eq!(joined.result().unwrap(), Some(id));
    }

    #[test]
    fn block_on_returns_value() {
        let rt = Runtime::new().unwrap();
        let h = rt.handle();
        let v = rt
            .block_on(Unit::new(async move {
                h.sleep_for(Duration::from_millis(1)).await?;
                Ok("done")
            }))
            .unwrap();
        assert_eq!(v, "done");
    }

    #[test]
    fn block_on_reports_stall() {
        let rt = Runtime::new().unwrap();
        let r = rt.block_on(Unit::<()>::new(std::future::pending()));
        assert!(matches!(r, Err(Failure::Stalled)));
    }

    #[test]
    fn drop_abandons_pending_tasks() {
        let flag = Rc::new(std::cell::Cell::new(false));

        struct SetOnDrop(Rc<std::cell::Cell<bool>>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        {
            let rt = Runtime::new().unwrap();
            let guard = SetOnDrop(flag.clone());
            let h = rt.handle();
            rt.spawn(Unit::new(async move {
                let _guard = guard;
                h.sleep_for(Duration::from_secs(60)).await
            }));
            assert!(!flag.get());
        }
        assert!(flag.get());
    }

    #[test]
    fn config_is_applied() {
        let config = RuntimeConfig::default()
            .with_max_events(8)
            .with_ready_capacity(16);
        let rt = Runtime::with_config(config).unwrap();
        let handle = rt.handle();
        let applied = handle.core().config();
        assert_eq!(applied.max_events, 8);
        assert_eq!(applied.ready_capacity, 16);
    }
}
