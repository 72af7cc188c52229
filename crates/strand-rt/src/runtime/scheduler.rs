// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Single-threaded scheduler: ready queue + timer heap + reactor.
//!
//! `run` drains the ready queue (including anything enqueued while
//! draining), fires due timers, and otherwise blocks in the reactor until
//! the next descriptor event or timer deadline. It returns once nothing is
//! queued, no timer is pending and no descriptor is armed.
//!
//! A task that finishes with a continuation hands control to it directly:
//! the continuation is resumed inside the same call, never queued.

use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Instant;

use super::queue::ReadyQueue;
use super::reactor::Reactor;
use super::task::{TaskArena, TaskBody, TaskId, TaskState};
use crate::cancel::CancelToken;
use crate::config::RuntimeConfig;
use crate::timer::TimerHeap;

/// Scheduler state shared by a `Runtime` and its `Handle`s.
pub(crate) struct Core {
    tasks: RefCell<TaskArena>,
    ready: Arc<ReadyQueue>,
    timers: RefCell<TimerHeap>,
    reactor: Rc<Reactor>,
    /// Innermost task being resumed right now.
    current: Cell<Option<TaskId>>,
    config: RuntimeConfig,
}

impl Core {
    pub fn new(config: RuntimeConfig) -> io::Result<Self> {
        let reactor = Rc::new(Reactor::new(config.max_events)?);
        Ok(Self {
            tasks: RefCell::new(TaskArena::new()),
            ready: Arc::new(ReadyQueue::with_capacity(config.ready_capacity)),
            timers: RefCell::new(TimerHeap::default()),
            reactor,
            current: Cell::new(None),
            config,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn reactor(&self) -> &Rc<Reactor> {
        &self.reactor
    }

    pub fn current_task(&self) -> Option<TaskId> {
        self.current.get()
    }

    /// Add a task to the arena and the back of the ready queue.
    pub fn spawn(&self, body: TaskBody) -> TaskId {
        let id = self.tasks.borrow_mut().insert(body, &self.ready, true);
        self.ready.push(id);
        tracing::debug!(?id, "task queued");
        id
    }

    /// Add a task that only runs when resumed directly or woken.
    pub fn insert_parked(&self, body: TaskBody) -> TaskId {
        let id = self.tasks.borrow_mut().insert(body, &self.ready, false);
        tracing::debug!(?id, "task parked");
        id
    }

    /// Resume `id` now, following continuations until one suspends.
    ///
    /// If `id` is already running further up the stack it is marked
    /// notified instead and will observe its new state when that resume
    /// returns.
    pub fn resume(&self, id: TaskId) {
        self.resume_from(id, false);
    }

    fn resume_from(&self, id: TaskId, from_queue: bool) {
        let mut next = Some((id, from_queue));

        while let Some((id, from_queue)) = next.take() {
            let checkout = self.tasks.borrow_mut().checkout(id, from_queue);
            let Some(mut task) = checkout else {
                if !from_queue {
                    self.notify(id);
                }
                tracing::trace!(?id, "not startable, skipped");
                continue;
            };

            let mut cx = Context::from_waker(&task.waker);
            let outer = self.current.replace(Some(id));
            tracing::trace!(?id, "resume");
            let poll = task.body.as_mut().poll(&mut cx);
            self.current.set(outer);

            match poll {
                Poll::Ready(handoff) => {
                    // Drop the finished frame before touching the arena; its
                    // destructors may deregister I/O or cancel timers.
                    drop(task.body);
                    self.tasks.borrow_mut().retire(id);
                    tracing::debug!(?id, continuation = ?handoff, "task finished");
                    next = handoff.map(|parent| (parent, false));
                }
                Poll::Pending => {
                    let parked = task.header.park();
                    self.tasks.borrow_mut().checkin(id, task.body);
                    if !parked {
                        self.ready.push(id);
                    }
                }
            }
        }
    }

    /// Ask a task that could not be started right away to run again.
    fn notify(&self, id: TaskId) {
        let waker = self.tasks.borrow_mut().waker(id);
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub fn add_timer(&self, due: Instant, waker: Waker, token: Arc<CancelToken>) {
        self.timers.borrow_mut().push(due, waker, token);
    }

    pub fn timers_empty(&self) -> bool {
        self.timers.borrow_mut().is_empty()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.borrow().len()
    }

    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.borrow_mut().state(id)
    }

    /// Resume queued tasks until the queue is empty, including tasks
    /// queued by those resumes.
    fn drain_ready(&self) {
        while let Some(id) = self.ready.pop() {
            self.resume_from(id, true);
        }
    }

    /// Wake every timer due at `now`. Returns how many fired.
    fn fire_timers(&self, now: Instant) -> usize {
        let due = self.timers.borrow_mut().pop_due(now);
        let fired = due.len();
        if fired > 0 {
            tracing::debug!(fired, "timers due");
        }
        for waker in due {
            waker.wake();
        }
        fired
    }

    /// Drive everything to quiescence.
    pub fn run(&self) -> io::Result<()> {
        loop {
            self.drain_ready();

            if self.fire_timers(Instant::now()) > 0 || !self.ready.is_empty() {
                continue;
            }

            let next_due = self.timers.borrow_mut().next_due();
            let armed = self.reactor.armed_count();
            if next_due.is_none() && armed == 0 {
                break;
            }

            let timeout = next_due.map(|due| due.saturating_duration_since(Instant::now()));
            tracing::trace!(
                ?timeout,
                armed,
                timers = self.timers.borrow().len(),
                "waiting for events"
            );
            self.reactor.wait(timeout)?;
        }

        let stalled = self.task_count();
        if stalled > 0 {
            tracing::debug!(stalled, "run finished with tasks nothing can wake");
        }
        Ok(())
    }

    /// Abandon all tasks and timers. Bodies are dropped outside any
    /// borrow so their destructors can still reach the runtime.
    pub fn shutdown(&self) {
        let bodies = self.tasks.borrow_mut().drain();
        let timers = self.timers.borrow_mut().drain();
        self.ready.clear();
        if !bodies.is_empty() {
            tracing::debug!(abandoned = bodies.len(), "runtime shutting down");
        }
        drop(bodies);
        drop(timers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::future::Future;
    use std::pin::Pin;

    fn core() -> Rc<Core> {
        Rc::new(Core::new(RuntimeConfig::default()).unwrap())
    }

    fn recorder(log: &Rc<RefCell<Vec<u32>>>, tag: u32) -> TaskBody {
        let log = log.clone();
        Box::pin(async move {
            log.borrow_mut().push(tag);
            None
        })
    }

    /// Pending once (waking itself), then ready.
    struct YieldOnce(bool);

    impl Future for YieldOnce {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.0 {
                return Poll::Ready(());
            }
            self.0 = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }

    #[test]
    fn ready_queue_is_fifo() {
        let core = core();
        let log = Rc::new(RefCell::new(Vec::new()));
        for tag in 0..5 {
            core.spawn(recorder(&log, tag));
        }
        core.run().unwrap();
        assert_eq!(*log.borrow(), vec![0, 1, 2, 3, 4]);
        assert_eq!(core.task_count(), 0);
    }

    #[test]
    fn tasks_queued_while_draining_run_in_same_pass() {
        let core = core();
        let log = Rc::new(RefCell::new(Vec::new()));
        let (c, l) = (core.clone(), log.clone());
        core.spawn(Box::pin(async move {
            l.borrow_mut().push(0);
            c.spawn(recorder(&l, 2));
            None
        }));
        core.spawn(recorder(&log, 1));
        core.run().unwrap();
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn self_wake_goes_to_back_of_queue() {
        let core = core();
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        core.spawn(Box::pin(async move {
            l.borrow_mut().push(0);
            YieldOnce(false).await;
            l.borrow_mut().push(2);
            None
        }));
        core.spawn(recorder(&log, 1));
        core.run().unwrap();
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn continuation_is_resumed_directly() {
        let core = core();
        let log = Rc::new(RefCell::new(Vec::new()));

        // Parent suspends without a waker path back; only the child's
        // handoff can resume it.
        let flag = Rc::new(Cell::new(false));
        let (l, f) = (log.clone(), flag.clone());
        let parent = core.insert_parked(Box::pin(async move {
            std::future::poll_fn(|_| {
                if f.get() {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            })
            .await;
            l.borrow_mut().push(1);
            None
        }));
        core.resume(parent);
        assert_eq!(core.task_state(parent), Some(TaskState::Waiting));

        let l = log.clone();
        core.spawn(Box::pin(async move {
            l.borrow_mut().push(0);
            flag.set(true);
            Some(parent)
        }));
        core.spawn(recorder(&log, 2));
        core.run().unwrap();

        // The parent ran before the next queued task.
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
        assert!(core.task_state(parent).is_none());
    }

    #[test]
    fn stale_continuation_is_ignored() {
        let core = core();
        let gone = core.spawn(Box::pin(async { None }));
        core.run().unwrap();

        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        core.spawn(Box::pin(async move {
            l.borrow_mut().push(0);
            Some(gone)
        }));
        core.spawn(recorder(&log, 1));
        core.run().unwrap();
        assert_eq!(*log.borrow(), vec![0, 1]);
    }

    #[test]
    fn current_task_tracks_the_resumed_task() {
        let core = core();
        let seen = Rc::new(Cell::new(None));
        let (c, s) = (core.clone(), seen.clone());
        let id = core.spawn(Box::pin(async move {
            s.set(c.current_task());
            None
        }));
        assert!(core.current_task().is_none());
        core.run().unwrap();
        assert_eq!(seen.get(), Some(id));
        assert!(core.current_task().is_none());
    }

    #[test]
    fn run_returns_with_unwakeable_tasks() {
        let core = core();
        let id = core.spawn(Box::pin(std::future::pending::<Option<TaskId>>()));
        core.run().unwrap();
        assert_eq!(core.task_state(id), Some(TaskState::Waiting));
        core.shutdown();
        assert_eq!(core.task_count(), 0);
    }
}
