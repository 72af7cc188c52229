// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fan-out / fan-in combinators.
//!
//! `when_all`, `when_any` and `join` launch their children as separate
//! arena tasks sharing one control block. The first child runs inline on
//! the parent's first resume; the rest go to the back of the ready queue.
//! A child whose completion satisfies the combinator's predicate returns
//! the parent task as its continuation, so the parent is resumed directly
//! and exactly once. Children still running after that are not cancelled;
//! their results are dropped.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::context::Handle;
use crate::error::{Failure, Outcome};
use crate::runtime::scheduler::Core;
use crate::runtime::task::{TaskBody, TaskId};
use crate::unit::Unit;

enum Mode {
    All { remaining: usize },
    Any { winner: Option<usize> },
}

/// Completion state shared by a combinator and its children.
struct ControlBlock {
    mode: Mode,
    /// Task to hand off to. Cleared once handed off or when the
    /// combinator is dropped.
    parent: Option<TaskId>,
    /// First failure observed.
    failure: Option<Failure>,
    fired: bool,
}

impl ControlBlock {
    fn all(count: usize) -> Rc<RefCell<Self>> {
        Self::with_mode(Mode::All { remaining: count })
    }

    fn any() -> Rc<RefCell<Self>> {
        Self::with_mode(Mode::Any { winner: None })
    }

    fn with_mode(mode: Mode) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            mode,
            parent: None,
            failure: None,
            fired: false,
        }))
    }

    /// Account for child `index` finishing with `outcome`. Returns the
    /// value if the combinator still wants it.
    fn settle<T>(&mut self, index: usize, outcome: Outcome<T>) -> Option<T> {
        if self.fired {
            return None;
        }
        match (&mut self.mode, outcome) {
            (Mode::All { remaining }, Ok(value)) => {
                *remaining -= 1;
                self.fired = *remaining == 0;
                Some(value)
            }
            (Mode::Any { winner }, Ok(value)) => {
                *winner = Some(index);
                self.fired = true;
                Some(value)
            }
            (mode, Err(failure)) => {
                if let Mode::Any { winner } = mode {
                    *winner = Some(index);
                }
                self.failure = Some(failure);
                self.fired = true;
                None
            }
        }
    }

    /// The parent to resume, at most once, after the predicate fired.
    fn handoff(&mut self) -> Option<TaskId> {
        if self.fired {
            self.parent.take()
        } else {
            None
        }
    }
}

/// Task body for child `index`: await the unit, settle it, and name the
/// parent as continuation if this completion fired the combinator.
fn child_body<T: 'static>(
    unit: Unit<T>,
    index: usize,
    block: Rc<RefCell<ControlBlock>>,
    store: impl FnOnce(T) + 'static,
) -> TaskBody {
    Box::pin(async move {
        let outcome = unit.await;
        let mut block = block.borrow_mut();
        if let Some(value) = block.settle(index, outcome) {
            store(value);
        }
        let parent = block.handoff();
        if parent.is_some() {
            tracing::trace!(index, "combinator fired");
        }
        parent
    })
}

type Finish<R> = Box<dyn FnOnce(Option<Failure>) -> Outcome<R>>;

/// Parent side of a combinator.
struct Fanout<R> {
    core: Rc<Core>,
    block: Rc<RefCell<ControlBlock>>,
    children: Vec<TaskBody>,
    launched: bool,
    finish: Option<Finish<R>>,
}

impl<R> Fanout<R> {
    fn new(
        core: Rc<Core>,
        block: Rc<RefCell<ControlBlock>>,
        children: Vec<TaskBody>,
        finish: impl FnOnce(Option<Failure>) -> Outcome<R> + 'static,
    ) -> Self {
        Self {
            core,
            block,
            children,
            launched: false,
            finish: Some(Box::new(finish)),
        }
    }

    fn launch(&mut self) {
        let Some(parent) = self.core.current_task() else {
            panic!("combinator awaited outside a runtime task");
        };
        self.block.borrow_mut().parent = Some(parent);
        self.launched = true;

        let mut children = std::mem::take(&mut self.children).into_iter();
        let first = children.next();
        let queued = children.len();
        for body in children {
            self.core.spawn(body);
        }
        tracing::debug!(?parent, children = queued + 1, "combinator launched");

        if let Some(body) = first {
            let id = self.core.insert_parked(body);
            self.core.resume(id);
        }
    }
}

impl<R> Future for Fanout<R> {
    type Output = Outcome<R>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.launched {
            self.launch();
        }

        let failure = {
            let mut block = self.block.borrow_mut();
            if !block.fired {
                return Poll::Pending;
            }
            block.failure.take()
        };
        match self.finish.take() {
            Some(finish) => Poll::Ready(finish(failure)),
            None => panic!("combinator polled after completion"),
        }
    }
}

impl<R> Drop for Fanout<R> {
    fn drop(&mut self) {
        if let Ok(mut block) = self.block.try_borrow_mut() {
            block.parent = None;
        }
    }
}

fn missing() -> Failure {
    Failure::custom("combinator fired without every child result")
}

impl Handle {
    /// Finishes with every child's value, in argument order, or with the
    /// first failure observed.
    pub fn when_all<T: 'static>(&self, units: Vec<Unit<T>>) -> Unit<Vec<T>> {
        if units.is_empty() {
            return Unit::value(Vec::new());
        }

        let count = units.len();
        let block = ControlBlock::all(count);
        let results: Rc<RefCell<Vec<Option<T>>>> =
            Rc::new(RefCell::new((0..count).map(|_| None).collect()));

        let children = units
            .into_iter()
            .enumerate()
            .map(|(index, unit)| {
                let results = results.clone();
                child_body(unit, index, block.clone(), move |value| {
                    results.borrow_mut()[index] = Some(value);
                })
            })
            .collect();

        Unit::new(Fanout::new(
            self.core().clone(),
            block,
            children,
            move |failure| match failure {
                Some(failure) => Err(failure),
                None => results
                    .borrow_mut()
                    .drain(..)
                    .collect::<Option<Vec<T>>>()
                    .ok_or_else(missing),
            },
        ))
    }

    /// Finishes with the first child to finish, tagged with its position.
    /// A failing first finisher fails the combinator.
    pub fn when_any<T: 'static>(&self, units: Vec<Unit<T>>) -> Unit<(usize, T)> {
        if units.is_empty() {
            return Unit::failure(Failure::NoUnits);
        }

        let block = ControlBlock::any();
        let winner: Rc<RefCell<Option<(usize, T)>>> = Rc::new(RefCell::new(None));

        let children = units
            .into_iter()
            .enumerate()
            .map(|(index, unit)| {
                let winner = winner.clone();
                child_body(unit, index, block.clone(), move |value| {
                    *winner.borrow_mut() = Some((index, value));
                })
            })
            .collect();

        Unit::new(Fanout::new(
            self.core().clone(),
            block,
            children,
            move |failure| match failure {
                Some(failure) => Err(failure),
                None => winner.borrow_mut().take().ok_or_else(missing),
            },
        ))
    }

    /// `when_all` over a tuple of differently typed units.
    pub fn join<J: JoinUnits>(&self, units: J) -> Unit<J::Output> {
        units.fanout(self)
    }
}

/// Tuples of units accepted by `Handle::join`.
pub trait JoinUnits {
    type Output: 'static;

    #[doc(hidden)]
    fn fanout(self, handle: &Handle) -> Unit<Self::Output>;
}

macro_rules! impl_join_units {
    ($($ty:ident $idx:tt),+) => {
        impl<$($ty: 'static),+> JoinUnits for ($(Unit<$ty>,)+) {
            type Output = ($($ty,)+);

            fn fanout(self, handle: &Handle) -> Unit<Self::Output> {
                let block = ControlBlock::all([$($idx),+].len());
                let slots = ($(Rc::new(RefCell::new(None::<$ty>)),)+);

                let children = vec![$(
                    {
                        let slot = slots.$idx.clone();
                        child_body(self.$idx, $idx, block.clone(), move |value| {
                            *slot.borrow_mut() = Some(value);
                        })
                    }
                ),+];

                Unit::new(Fanout::new(handle.core().clone(), block, children, move |failure| {
                    if let Some(failure) = failure {
                        return Err(failure);
                    }
                    Ok(($(slots.$idx.borrow_mut().take().ok_or_else(missing)?,)+))
                }))
            }
        }
    };
}

impl_join_units!(A 0, B 1);
impl_join_units!(A 0, B 1, C 2);
impl_join_units!(A 0, B 1, C 2, D 3);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Runtime;
    use std::time::{Duration, Instant};

    fn sleepy<T: 'static>(h: &Handle, ms: u64, value: Outcome<T>) -> Unit<T> {
        let h = h.clone();
        Unit::new(async move {
            h.sleep_for(Duration::from_millis(ms)).await?;
            value
        })
    }

    #[test]
    fn when_all_takes_the_longest_not_the_sum() {
        let rt = Runtime::new().unwrap();
        let h = rt.handle();
        let units = vec![
            sleepy(&h, 60, Ok(1)),
            sleepy(&h, 120, Ok(2)),
            sleepy(&h, 30, Ok(3)),
        ];
        let start = Instant::now();
        let all = rt.block_on(h.when_all(units)).unwrap();
        let elapsed = start.elapsed();

        assert_eq!(all, vec![1, 2, 3]);
        assert!(elapsed >= Duration::from_millis(120));
        assert!(elapsed < Duration::from_millis(200), "took {elapsed:?}");
    }

    #[test]
    fn when_all_first_failure_wins_and_resumes_early() {
        let rt = Runtime::new().unwrap();
        let h = rt.handle();
        let units = vec![
            sleepy(&h, 300, Ok(())),
            sleepy(&h, 10, Err(Failure::custom("first"))),
            sleepy(&h, 40, Err(Failure::custom("second"))),
        ];

        let inner = h.clone();
        let parent = rt.spawn(Unit::new(async move {
            let start = Instant::now();
            let r = inner.when_all(units).await;
            Ok((r, start.elapsed()))
        }));
        rt.run().unwrap();

        let (r, waited) = parent.result().unwrap();
        match r {
            Err(Failure::Custom(msg)) => assert_eq!(msg, "first"),
            other => panic!("expected the first failure, got {:?}", other),
        }
        assert!(waited < Duration::from_millis(200), "waited {waited:?}");
    }

    #[test]
    fn when_any_picks_the_fastest() {
        let rt = Runtime::new().unwrap();
        let h = rt.handle();

        let r = rt
            .block_on(h.when_any(vec![sleepy(&h, 10, Ok("fast")), sleepy(&h, 80, Ok("slow"))]))
            .unwrap();
        assert_eq!(r, (0, "fast"));

        let r = rt
            .block_on(h.when_any(vec![sleepy(&h, 80, Ok("slow")), sleepy(&h, 10, Ok("fast"))]))
            .unwrap();
        assert_eq!(r, (1, "fast"));
    }

    #[test]
    fn when_any_propagates_a_failing_winner() {
        let rt = Runtime::new().unwrap();
        let h = rt.handle();
        let r = rt.block_on(h.when_any(vec![
            sleepy(&h, 50, Ok(1)),
            sleepy::<i32>(&h, 5, Err(Failure::custom("lost"))),
        ]));
        assert!(matches!(r, Err(Failure::Custom(ref m)) if m == "lost"));
    }

    #[test]
    fn empty_inputs() {
        let rt = Runtime::new().unwrap();
        let h = rt.handle();
        assert!(rt.block_on(h.when_all(Vec::<Unit<u8>>::new())).unwrap().is_empty());
        assert!(matches!(
            rt.block_on(h.when_any(Vec::<Unit<u8>>::new())),
            Err(Failure::NoUnits)
        ));
    }

    #[test]
    fn join_mixed_types() {
        let rt = Runtime::new().unwrap();
        let h = rt.handle();
        let r = rt
            .block_on(h.join((
                sleepy(&h, 20, Ok(7u32)),
                Unit::value("ready"),
                sleepy(&h, 5, Ok(vec![1u8])),
            )))
            .unwrap();
        assert_eq!(r, (7, "ready", vec![1]));
    }

    #[test]
    fn first_child_inline_and_parent_resumed_by_handoff() {
        let rt = Runtime::new().unwrap();
        let h = rt.handle();
        let log = Rc::new(RefCell::new(Vec::new()));

        let child = |tag: &'static str| {
            let log = log.clone();
            Unit::new(async move {
                log.borrow_mut().push(tag);
                Ok(())
            })
        };
        let units = vec![child("c0"), child("c1")];

        let l = log.clone();
        rt.spawn(Unit::new(async move {
            h.when_all(units).await?;
            l.borrow_mut().push("parent");
            Ok(())
        }));
        let l = log.clone();
        rt.spawn(Unit::new(async move {
            l.borrow_mut().push("other");
            Ok(())
        }));
        rt.run().unwrap();

        assert_eq!(*log.borrow(), vec!["c0", "other", "c1", "parent"]);
    }

    /// Resumes a unit once and reports whether it finished.
    struct ResumeOnce<'a, T>(&'a mut Unit<T>);

    impl<T> Future for ResumeOnce<'_, T> {
        type Output = bool;

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
            Poll::Ready(self.0.resume(cx).is_ready())
        }
    }

    #[test]
    fn dropped_combinator_forgets_its_parent() {
        let rt = Runtime::new().unwrap();
        let h = rt.handle();
        let children = vec![sleepy(&h, 20, Ok(1)), sleepy(&h, 10, Ok(2))];

        let parent = rt.spawn(Unit::new(async move {
            let mut all = h.when_all(children);
            assert!(!ResumeOnce(&mut all).await);
            drop(all);
            Ok("abandoned")
        }));
        rt.run().unwrap();
        assert_eq!(parent.result().unwrap(), "abandoned");
        assert_eq!(rt.handle().task_count(), 0);
    }

    #[test]
    fn awaiting_outside_a_task_panics() {
        let rt = Runtime::new().unwrap();
        let mut all = rt.handle().when_all(vec![Unit::value(1)]);

        struct Noop;
        impl std::task::Wake for Noop {
            fn wake(self: std::sync::Arc<Self>) {}
        }
        let waker = std::task::Waker::from(std::sync::Arc::new(Noop));
        let mut cx = Context::from_waker(&waker);

        assert!(all.resume(&mut cx).is_ready());
        match all.result() {
            Err(Failure::Panicked(msg)) => assert!(msg.contains("outside a runtime task")),
            other => panic!("expected Panicked, got {:?}", other),
        }
    }

    #[test]
    fn control_block_fires_once() {
        let block = ControlBlock::all(2);
        let mut b = block.borrow_mut();
        b.parent = Some(TaskId::new(3, 0));
        assert_eq!(b.settle(0, Ok(1)), Some(1));
        assert!(b.handoff().is_none());
        assert!(b.settle::<i32>(1, Err(Failure::custom("x"))).is_none());
        assert_eq!(b.handoff(), Some(TaskId::new(3, 0)));
        assert!(b.handoff().is_none());
        assert!(b.settle(1, Ok(5)).is_none());
    }
}
