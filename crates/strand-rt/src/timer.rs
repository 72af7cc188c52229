// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Sleep units and the timer heap.
//!
//! A sleep pushes (deadline, waker) onto its runtime's min-heap on first
//! resume. The scheduler pops due entries in deadline order, ties broken by
//! insertion order, and wakes them. Dropping a pending sleep cancels its
//! entry so it neither fires nor keeps `run()` alive.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crate::cancel::{CancelOnDrop, CancelToken};
use crate::context::Handle;
use crate::error::Outcome;
use crate::runtime::scheduler::Core;
use crate::unit::Unit;

impl Handle {
    /// A unit that finishes once `deadline` has passed.
    pub fn sleep_until(&self, deadline: Instant) -> Unit<()> {
        Unit::new(Sleep {
            core: self.core().clone(),
            deadline: Deadline::At(deadline),
            state: SleepState::Idle,
        })
    }

    /// A unit that finishes after `duration`, measured from its first
    /// resume. Building it does not start the clock.
    pub fn sleep_for(&self, duration: Duration) -> Unit<()> {
        Unit::new(Sleep {
            core: self.core().clone(),
            deadline: Deadline::After(duration),
            state: SleepState::Idle,
        })
    }
}

#[derive(Clone, Copy)]
enum Deadline {
    After(Duration),
    At(Instant),
}

enum SleepState {
    Idle,
    /// Entry pushed; `waker` is the one it holds.
    Waiting { guard: CancelOnDrop, waker: Waker },
    Done,
}

struct Sleep {
    core: Rc<Core>,
    deadline: Deadline,
    state: SleepState,
}

impl Sleep {
    fn deadline(&mut self) -> Instant {
        match self.deadline {
            Deadline::At(at) => at,
            Deadline::After(duration) => {
                let at = Instant::now() + duration;
                self.deadline = Deadline::At(at);
                at
            }
        }
    }

    /// Push a fresh entry for `waker`. Replacing an earlier `Waiting`
    /// state drops its guard, which cancels the old entry.
    fn arm(&mut self, due: Instant, waker: &Waker) {
        let token = CancelToken::new();
        self.core.add_timer(due, waker.clone(), token.clone());
        self.state = SleepState::Waiting {
            guard: CancelOnDrop::new(token),
            waker: waker.clone(),
        };
    }
}

impl Future for Sleep {
    type Output = Outcome<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let due = this.deadline();
        if Instant::now() >= due {
            if let SleepState::Waiting { guard, .. } = &mut this.state {
                guard.disarm();
            }
            this.state = SleepState::Done;
            return Poll::Ready(Ok(()));
        }

        let rearm = match &this.state {
            SleepState::Idle => true,
            // Moved to another task since the entry was pushed.
            SleepState::Waiting { waker, .. } => !waker.will_wake(cx.waker()),
            SleepState::Done => false,
        };
        if rearm {
            this.arm(due, cx.waker());
        }
        Poll::Pending
    }
}

pub(crate) struct TimerEntry {
    pub due: Instant,
    seq: u64,
    waker: Waker,
    token: Arc<CancelToken>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

/// Entries below this count are never compacted.
const COMPACT_MIN: usize = 64;

/// Min-heap of pending timers.
///
/// Cancelled entries are dropped lazily when they reach the top, and in
/// bulk whenever the heap grows to twice its size after the last sweep
/// (or `COMPACT_MIN`). Dead entries therefore never outnumber live ones
/// by more than that margin, however far away their deadlines are.
#[derive(Default)]
pub(crate) struct TimerHeap {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    next_seq: u64,
    compact_at: usize,
}

impl TimerHeap {
    pub fn push(&mut self, due: Instant, waker: Waker, token: Arc<CancelToken>) {
        if self.heap.len() >= self.compact_at.max(COMPACT_MIN) {
            self.compact();
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(TimerEntry {
            due,
            seq,
            waker,
            token,
        }));
    }

    /// Drop every cancelled entry, wherever it sits.
    fn compact(&mut self) {
        let before = self.heap.len();
        self.heap.retain(|Reverse(entry)| !entry.token.is_cancelled());
        self.compact_at = self.heap.len() * 2;
        tracing::trace!(before, after = self.heap.len(), "timer heap compacted");
    }

    /// Entries held, cancelled ones included.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Discard cancelled entries sitting at the top.
    fn prune(&mut self) {
        while self
            .heap
            .peek()
            .is_some_and(|Reverse(top)| top.token.is_cancelled())
        {
            self.heap.pop();
        }
    }

    /// Earliest live deadline.
    pub fn next_due(&mut self) -> Option<Instant> {
        self.prune();
        self.heap.peek().map(|Reverse(top)| top.due)
    }

    /// Pop every live entry due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<Waker> {
        let mut due = Vec::new();
        loop {
            self.prune();
            match self.heap.peek() {
                Some(Reverse(top)) if top.due <= now => {}
                _ => break,
            }
            if let Some(Reverse(entry)) = self.heap.pop() {
                due.push(entry.waker);
            }
        }
        due
    }

    pub fn is_empty(&mut self) -> bool {
        self.prune();
        self.heap.is_empty()
    }

    pub fn drain(&mut self) -> Vec<TimerEntry> {
        self.heap.drain().map(|Reverse(e)| e).collect()
    }
}
