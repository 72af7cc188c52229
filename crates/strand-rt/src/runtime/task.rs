// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Arena tasks.
//!
//! The scheduler owns its units in a generational arena. Each task is a
//! type-erased body whose output is the continuation to hand control to
//! when it finishes (`None` for top-level tasks). Ids carry a generation so
//! a stale id from a finished task never resumes whatever reuses the slot.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Wake, Waker};

use super::queue::ReadyQueue;
use crate::unit::LocalBoxFuture;

/// Handle to a task in a runtime's arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    index: u32,
    generation: u32,
}

impl TaskId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}.{}", self.index, self.generation)
    }
}

/// Body of an arena task. Resolves to the continuation, if any.
pub(crate) type TaskBody = LocalBoxFuture<Option<TaskId>>;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// In the ready queue.
    Ready = 0,
    /// Being resumed right now.
    Running = 1,
    /// Suspended; only a waker or a handoff brings it back.
    Waiting = 2,
    /// Woken while running; goes back on the queue after this resume.
    Notified = 3,
    /// Finished and retired from the arena.
    Complete = 4,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Ready,
            1 => Self::Running,
            2 => Self::Waiting,
            3 => Self::Notified,
            _ => Self::Complete,
        }
    }
}

/// State shared between the arena entry and the task's waker.
pub(crate) struct TaskHeader {
    state: AtomicU8,
}

impl TaskHeader {
    fn new(state: TaskState) -> Self {
        Self {
            state: AtomicU8::new(state as u8),
        }
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn cas(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claim the task for a resume. Queue pops only accept Ready; direct
    /// handoffs also accept Waiting.
    fn try_start(&self, from_queue: bool) -> bool {
        self.cas(TaskState::Ready, TaskState::Running)
            || (!from_queue && self.cas(TaskState::Waiting, TaskState::Running))
    }

    /// Running -> Waiting after a pending resume. Returns false if a wake
    /// arrived meanwhile; the task is then Ready and must be re-queued.
    pub fn park(&self) -> bool {
        if self.cas(TaskState::Running, TaskState::Waiting) {
            return true;
        }
        self.state.store(TaskState::Ready as u8, Ordering::Release);
        false
    }

    fn complete(&self) {
        self.state.store(TaskState::Complete as u8, Ordering::Release);
    }
}

/// Waker that moves a Waiting task onto the ready queue.
struct TaskWaker {
    id: TaskId,
    header: Arc<TaskHeader>,
    ready: Arc<ReadyQueue>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        loop {
            match self.header.state() {
                TaskState::Waiting => {
                    if self.header.cas(TaskState::Waiting, TaskState::Ready) {
                        self.ready.push(self.id);
                        return;
                    }
                }
                TaskState::Running => {
                    if self.header.cas(TaskState::Running, TaskState::Notified) {
                        return;
                    }
                }
                // Already queued, already notified, or gone.
                TaskState::Ready | TaskState::Notified | TaskState::Complete => return,
            }
        }
    }
}

struct TaskEntry {
    header: Arc<TaskHeader>,
    /// Built once so `Waker::will_wake` holds across resumes.
    waker: Waker,
    /// `None` while checked out for a resume.
    body: Option<TaskBody>,
}

struct TaskSlot {
    generation: u32,
    entry: Option<TaskEntry>,
}

/// A task taken out of the arena for the duration of one resume.
pub(crate) struct Checkout {
    pub body: TaskBody,
    pub waker: Waker,
    pub header: Arc<TaskHeader>,
}

/// Generational slot arena of tasks.
pub(crate) struct TaskArena {
    slots: Vec<TaskSlot>,
    free: Vec<u32>,
    live: usize,
}

impl TaskArena {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Store a body. `queued` tasks start Ready (the caller pushes the id);
    /// others start Waiting and run only on a handoff or wake.
    pub fn insert(&mut self, body: TaskBody, ready: &Arc<ReadyQueue>, queued: bool) -> TaskId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(TaskSlot {
                    generation: 0,
                    entry: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let id = TaskId::new(index, slot.generation);

        let state = if queued {
            TaskState::Ready
        } else {
            TaskState::Waiting
        };
        let header = Arc::new(TaskHeader::new(state));
        let waker = Waker::from(Arc::new(TaskWaker {
            id,
            header: header.clone(),
            ready: ready.clone(),
        }));

        slot.entry = Some(TaskEntry {
            header,
            waker,
            body: Some(body),
        });
        self.live += 1;
        id
    }

    fn entry_mut(&mut self, id: TaskId) -> Option<&mut TaskEntry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Take the body out for a resume. `None` if the id is stale or the
    /// task is not in a startable state.
    pub fn checkout(&mut self, id: TaskId, from_queue: bool) -> Option<Checkout> {
        let entry = self.entry_mut(id)?;
        if !entry.header.try_start(from_queue) {
            return None;
        }
        let body = entry.body.take()?;
        Some(Checkout {
            body,
            waker: entry.waker.clone(),
            header: entry.header.clone(),
        })
    }

    /// Put a suspended body back.
    pub fn checkin(&mut self, id: TaskId, body: TaskBody) {
        if let Some(entry) = self.entry_mut(id) {
            entry.body = Some(body);
        }
    }

    /// Free the slot of a finished task and bump its generation.
    pub fn retire(&mut self, id: TaskId) {
        let Some(slot) = self.slots.get_mut(id.index as usize) else {
            return;
        };
        if slot.generation != id.generation {
            return;
        }
        if let Some(entry) = slot.entry.take() {
            entry.header.complete();
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(id.index);
            self.live -= 1;
        }
    }

    pub fn waker(&mut self, id: TaskId) -> Option<Waker> {
        self.entry_mut(id).map(|e| e.waker.clone())
    }

    pub fn state(&mut self, id: TaskId) -> Option<TaskState> {
        self.entry_mut(id).map(|e| e.header.state())
    }

    pub fn len(&self) -> usize {
        self.live
    }

    /// Remove every task, returning the bodies so the caller can drop them
    /// outside any borrow of the arena.
    pub fn drain(&mut self) -> Vec<TaskBody> {
        let mut bodies = Vec::with_capacity(self.live);
        for slot in &mut self.slots {
            if let Some(entry) = slot.entry.take() {
                entry.header.complete();
                slot.generation = slot.generation.wrapping_add(1);
                bodies.extend(entry.body);
            }
        }
        self.free = (0..self.slots.len() as u32).rev().collect();
        self.live = 0;
        bodies
    }
}
