//! # Deterministic Runtime
//!
//! Virtual-time scheduler for driving time- and task-dependent handlers
//! reproducibly under test.
//!
//! ## Model
//!
//! - A monotonic clock in milliseconds that only moves when asked to.
//! - A system clock kept as an offset from the monotonic clock.
//! - A FIFO queue of microtasks.
//! - A min-heap of timers ordered by `(due_at, seq)`, where `seq` is the
//!   insertion order. Equal due times fire in the order they were set.
//!
//! Clock reads go through a [`ClockHandle`], which any thread can query
//! without access to the runtime. Timer callbacks that call back into a
//! host clock while the runtime is busy firing them still see the time.
//!
//! Cleared timers leave an entry in the heap until they are popped. Once
//! those entries outnumber half the live timers the heap is rebuilt.
//!
//! Every drain is bounded by [`RuntimeConfig::max_turns`]. A handler chain
//! that keeps scheduling work is reported as [`SchedulerError::Divergence`]
//! instead of hanging the test.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::trace;

use crate::config::RuntimeConfig;

type Task = Box<dyn FnOnce(&mut DeterministicRuntime) + Send>;

/// Identifies a pending timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Which drain ran out of turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainPhase {
    Tasks,
    Timers,
}

impl fmt::Display for DrainPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrainPhase::Tasks => f.write_str("task queue"),
            DrainPhase::Timers => f.write_str("timer heap"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("{phase} did not drain within {max_turns} turns (virtual time {now_ms} ms)")]
    Divergence {
        phase: DrainPhase,
        max_turns: usize,
        now_ms: u64,
    },

    #[error("cannot move the clock backwards from {now_ms} ms to {target_ms} ms")]
    ClockRegression { now_ms: u64, target_ms: u64 },
}

#[derive(Default)]
struct SleepState {
    fired: bool,
    waker: Option<Waker>,
}

/// Resolves once the virtual clock reaches its due time.
///
/// Poll it as a future or check [`Sleep::is_elapsed`] after advancing.
#[derive(Clone)]
pub struct Sleep {
    due_at: u64,
    timer: TimerId,
    state: Arc<Mutex<SleepState>>,
}

impl Sleep {
    pub fn due_at(&self) -> u64 {
        self.due_at
    }

    pub fn timer_id(&self) -> TimerId {
        self.timer
    }

    pub fn is_elapsed(&self) -> bool {
        self.state.lock().fired
    }
}

impl fmt::Debug for Sleep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sleep")
            .field("due_at", &self.due_at)
            .field("elapsed", &self.is_elapsed())
            .finish()
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.state.lock();
        if state.fired {
            Poll::Ready(())
        } else {
            state.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

#[derive(Debug, Default)]
struct ClockState {
    now_ms: AtomicU64,
    system_offset_ms: AtomicI64,
}

/// Shared read access to a runtime's clocks.
#[derive(Debug, Clone, Default)]
pub struct ClockHandle {
    state: Arc<ClockState>,
}

impl ClockHandle {
    pub fn now_monotonic(&self) -> u64 {
        self.state.now_ms.load(Ordering::Acquire)
    }

    /// System time in ms since the epoch.
    pub fn now_system(&self) -> i64 {
        let offset = self.state.system_offset_ms.load(Ordering::Acquire);
        offset.saturating_add(self.now_monotonic() as i64)
    }

    fn set_monotonic(&self, ms: u64) {
        self.state.now_ms.store(ms, Ordering::Release);
    }

    fn set_offset(&self, offset_ms: i64) {
        self.state.system_offset_ms.store(offset_ms, Ordering::Release);
    }
}

/// The virtual-time scheduler.
pub struct DeterministicRuntime {
    config: RuntimeConfig,
    clock: ClockHandle,
    tasks: VecDeque<Task>,
    timers: BinaryHeap<Reverse<(u64, u64)>>,
    callbacks: FxHashMap<u64, Task>,
    /// Heap entries whose callback was cleared.
    cleared: usize,
    next_seq: u64,
}

impl Default for DeterministicRuntime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl fmt::Debug for DeterministicRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeterministicRuntime")
            .field("now_ms", &self.now_monotonic())
            .field("pending_tasks", &self.tasks.len())
            .field("pending_timers", &self.callbacks.len())
            .finish()
    }
}

impl DeterministicRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        let clock = ClockHandle::default();
        clock.set_offset(config.initial_system_ms);
        Self {
            config,
            clock,
            tasks: VecDeque::new(),
            timers: BinaryHeap::new(),
            callbacks: FxHashMap::default(),
            cleared: 0,
            next_seq: 0,
        }
    }

    /// A handle reading this runtime's clocks.
    pub fn clock(&self) -> ClockHandle {
        self.clock.clone()
    }

    pub fn now_monotonic(&self) -> u64 {
        self.clock.now_monotonic()
    }

    /// System time in ms since the epoch.
    pub fn now_system(&self) -> i64 {
        self.clock.now_system()
    }

    /// Re-base the system clock without touching monotonic time.
    pub fn set_system_time(&mut self, epoch_ms: i64) {
        self.clock.set_offset(epoch_ms.saturating_sub(self.now_monotonic() as i64));
    }

    /// Queue a microtask.
    pub fn schedule_task<F>(&mut self, task: F)
    where
        F: FnOnce(&mut DeterministicRuntime) + Send + 'static,
    {
        self.tasks.push_back(Box::new(task));
    }

    /// Run `callback` once the clock reaches `now + delay_ms`.
    pub fn set_timeout<F>(&mut self, delay_ms: u64, callback: F) -> TimerId
    where
        F: FnOnce(&mut DeterministicRuntime) + Send + 'static,
    {
        let seq = self.next_seq;
        self.next_seq += 1;
        let due = self.now_monotonic().saturating_add(delay_ms);
        self.timers.push(Reverse((due, seq)));
        self.callbacks.insert(seq, Box::new(callback));
        trace!(timer = seq, due_ms = due, "timer set");
        TimerId(seq)
    }

    /// Cancel a pending timer. Returns false if it already fired.
    pub fn clear_timeout(&mut self, id: TimerId) -> bool {
        if self.callbacks.remove(&id.0).is_none() {
            return false;
        }
        self.cleared += 1;
        if self.cleared > self.callbacks.len() / 2 {
            self.compact_timers();
        }
        true
    }

    /// Drop heap entries of cleared timers.
    fn compact_timers(&mut self) {
        let callbacks = &self.callbacks;
        self.timers.retain(|Reverse((_, seq))| callbacks.contains_key(seq));
        trace!(live = self.timers.len(), dropped = self.cleared, "timer heap compacted");
        self.cleared = 0;
    }

    /// A handle that resolves `ms` milliseconds from now.
    pub fn sleep_millis(&mut self, ms: u64) -> Sleep {
        let state = Arc::new(Mutex::new(SleepState::default()));
        let fired = Arc::clone(&state);
        let timer = self.set_timeout(ms, move |_| {
            let mut state = fired.lock();
            state.fired = true;
            if let Some(waker) = state.waker.take() {
                waker.wake();
            }
        });
        Sleep {
            due_at: self.now_monotonic().saturating_add(ms),
            timer,
            state,
        }
    }

    pub fn pending_timer_count(&self) -> usize {
        self.callbacks.len()
    }

    pub fn pending_task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Move the clock forward by `ms`, firing due timers in order.
    pub fn advance_by(&mut self, ms: u64) -> Result<(), SchedulerError> {
        self.advance_to(self.now_monotonic().saturating_add(ms))
    }

    /// Move the clock to `target_ms`, firing due timers in order and
    /// draining tasks after each.
    pub fn advance_to(&mut self, target_ms: u64) -> Result<(), SchedulerError> {
        let now_ms = self.now_monotonic();
        if target_ms < now_ms {
            return Err(SchedulerError::ClockRegression { now_ms, target_ms });
        }
        self.drain_tasks()?;
        self.fire_timers(Some(target_ms))?;
        self.clock.set_monotonic(target_ms);
        self.drain_tasks()
    }

    /// Run tasks and timers until nothing is pending, moving the clock to
    /// each timer's due time as it fires.
    pub fn run_until_idle(&mut self) -> Result<(), SchedulerError> {
        self.drain_tasks()?;
        self.fire_timers(None)
    }

    fn drain_tasks(&mut self) -> Result<(), SchedulerError> {
        let mut turns = 0usize;
        while let Some(task) = self.tasks.pop_front() {
            turns += 1;
            if turns > self.config.max_turns {
                return Err(self.divergence(DrainPhase::Tasks));
            }
            task(self);
        }
        Ok(())
    }

    fn fire_timers(&mut self, limit: Option<u64>) -> Result<(), SchedulerError> {
        let mut turns = 0usize;
        while let Some(Reverse((due, seq))) = self.timers.peek().copied() {
            if limit.is_some_and(|limit| due > limit) {
                break;
            }
            self.timers.pop();
            let Some(callback) = self.callbacks.remove(&seq) else {
                self.cleared = self.cleared.saturating_sub(1);
                continue;
            };
            turns += 1;
            if turns > self.config.max_turns {
                return Err(self.divergence(DrainPhase::Timers));
            }
            let now_ms = self.now_monotonic().max(due);
            self.clock.set_monotonic(now_ms);
            trace!(timer = seq, now_ms, "timer fired");
            callback(self);
            self.drain_tasks()?;
        }
        Ok(())
    }

    fn divergence(&self, phase: DrainPhase) -> SchedulerError {
        SchedulerError::Divergence {
            phase,
            max_turns: self.config.max_turns,
            now_ms: self.now_monotonic(),
        }
    }
}
