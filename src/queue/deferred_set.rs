//! Time-ordered holding area for work whose run time is in the future.
//!
//! Elements are kept in a min-heap on `(run_at, insertion order)`. Exactly
//! one thread may block in `take_next_ready_or_wait` at a time; a second
//! concurrent caller gets `QueueError::ContractViolation`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::utils::error::{QueueError, QueueResult};

#[derive(Debug)]
pub struct DeferredElement<T> {
    pub run_at: DateTime<Utc>,
    pub item: T,
    seq: u64,
}

impl<T> PartialEq for DeferredElement<T> {
    fn eq(&self, other: &Self) -> bool {
        self.run_at == other.run_at && self.seq == other.seq
    }
}

impl<T> Eq for DeferredElement<T> {}

impl<T> PartialOrd for DeferredElement<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for DeferredElement<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the max-heap pops the earliest element first.
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State<T> {
    heap: BinaryHeap<DeferredElement<T>>,
    next_seq: u64,
    waiter: Option<ThreadId>,
    interrupted: bool,
}

impl<T> State<T> {
    fn pop_ready(&mut self, now: DateTime<Utc>) -> Option<DeferredElement<T>> {
        if self.heap.peek().is_some_and(|earliest| earliest.run_at <= now) {
            self.heap.pop()
        } else {
            None
        }
    }
}

pub struct DeferredSet<T> {
    state: Mutex<State<T>>,
    wakeup: Condvar,
}

impl<T> Default for DeferredSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DeferredSet<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                next_seq: 0,
                waiter: None,
                interrupted: false,
            }),
            wakeup: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an element and wake the waiter so it re-evaluates its deadline.
    pub fn insert(&self, run_at: DateTime<Utc>, item: T) {
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(DeferredElement { run_at, item, seq });
        self.wakeup.notify_all();
    }

    /// Wake the waiter early. If nobody is waiting, the next call to
    /// `take_next_ready_or_wait` returns without blocking.
    pub fn interrupt(&self) {
        let mut state = self.lock();
        state.interrupted = true;
        self.wakeup.notify_all();
    }

    /// Block until the earliest element is due, `timeout` passes, or
    /// `interrupt` is called. Returns the due element, or `None` on timeout
    /// or interrupt when nothing is due.
    pub fn take_next_ready_or_wait(&self, timeout: Duration) -> QueueResult<Option<DeferredElement<T>>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock();

        if let Some(owner) = state.waiter {
            return Err(QueueError::ContractViolation(format!(
                "deferred set already has a blocked waiter ({owner:?})"
            )));
        }
        state.waiter = Some(thread::current().id());

        let result = loop {
            if let Some(element) = state.pop_ready(Utc::now()) {
                break Some(element);
            }
            if std::mem::take(&mut state.interrupted) {
                break None;
            }

            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                break None;
            }

            let until_due = state
                .heap
                .peek()
                .map(|earliest| (earliest.run_at - Utc::now()).to_std().unwrap_or_default());
            let wait = match (until_due, deadline) {
                (Some(due), Some(d)) => due.min(d - now),
                (Some(due), None) => due,
                (None, Some(d)) => d - now,
                (None, None) => Duration::MAX,
            };

            state = if wait == Duration::MAX {
                self.wakeup.wait(state).unwrap_or_else(PoisonError::into_inner)
            } else {
                self.wakeup
                    .wait_timeout(state, wait)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            };
        };

        state.waiter = None;
        Ok(result)
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }

    pub fn earliest_run_at(&self) -> Option<DateTime<Utc>> {
        self.lock().heap.peek().map(|e| e.run_at)
    }

    /// Remove every element, earliest first.
    pub fn drain(&self) -> Vec<DeferredElement<T>> {
        let heap = std::mem::take(&mut self.lock().heap);
        let mut elements = heap.into_sorted_vec();
        elements.reverse();
        elements
    }
}
