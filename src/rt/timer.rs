//! Deadline-ordered timeouts.
//!
//! The wheel is a deque of timeout records ordered by deadline. Deadlines
//! only ever move forward by a fixed period, so insertion and reset scan
//! from the back and are O(1) in the expected case. The wheel is the only
//! source of non-I/O wakeups: `tick` fires every expired record by waking
//! the task suspended on it.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use pin_project_lite::pin_project;
use tracing::trace;

use crate::rt::Handle;

pub(crate) struct TimeoutState {
    deadline: Cell<Instant>,
    period: Duration,
    fired: Cell<bool>,
    linked: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

impl TimeoutState {
    pub(crate) fn new(period: Duration) -> Rc<TimeoutState> {
        Rc::new(TimeoutState {
            deadline: Cell::new(Instant::now() + period),
            period,
            fired: Cell::new(false),
            linked: Cell::new(false),
            waker: RefCell::new(None),
        })
    }
}

#[derive(Default)]
pub(crate) struct Wheel {
    queue: std::collections::VecDeque<Rc<TimeoutState>>,
}

impl Wheel {
    pub(crate) fn new() -> Wheel {
        Wheel::default()
    }

    /// Links a timeout at its deadline-ordered position. Most adds belong
    /// at the tail.
    pub(crate) fn add(&mut self, state: &Rc<TimeoutState>) {
        debug_assert!(!state.linked.get());
        let deadline = state.deadline.get();
        let at = self
            .queue
            .iter()
            .rposition(|t| t.deadline.get() <= deadline)
            .map(|i| i + 1)
            .unwrap_or(0);
        self.queue.insert(at, Rc::clone(state));
        state.linked.set(true);
    }

    /// Unlinks a timeout. A no-op when it is not live.
    pub(crate) fn cancel(&mut self, state: &Rc<TimeoutState>) {
        if !state.linked.get() {
            return;
        }
        if let Some(at) = self.queue.iter().position(|t| Rc::ptr_eq(t, state)) {
            self.queue.remove(at);
        }
        state.linked.set(false);
    }

    /// Pushes the deadline forward one period from `now` and re-links at
    /// the correct position.
    pub(crate) fn reset(&mut self, state: &Rc<TimeoutState>, now: Instant) {
        let new_deadline = now + state.period;
        debug_assert!(state.deadline.get() <= new_deadline);
        self.cancel(state);
        state.deadline.set(new_deadline);
        state.fired.set(false);
        self.add(state);
    }

    /// The earliest live deadline, if any.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.queue.front().map(|t| t.deadline.get())
    }

    /// Fires every timeout whose deadline has passed, in deadline order.
    pub(crate) fn tick(&mut self, now: Instant) {
        while let Some(head) = self.queue.front() {
            if head.deadline.get() > now {
                break;
            }
            let head = self.queue.pop_front().unwrap();
            head.linked.set(false);
            head.fired.set(true);
            trace!("timeout fired");
            let waker = head.waker.borrow_mut().take();
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }

    #[cfg(test)]
    fn deadlines(&self) -> Vec<Instant> {
        self.queue.iter().map(|t| t.deadline.get()).collect()
    }
}

/// A connection-scoped idle timeout. Live (linked) for as long as it is
/// armed; dropping it unlinks it.
pub(crate) struct Timeout {
    handle: Handle,
    state: Rc<TimeoutState>,
}

impl Timeout {
    pub(crate) fn new(handle: &Handle, period: Duration) -> Timeout {
        Timeout {
            handle: handle.clone(),
            state: TimeoutState::new(period),
        }
    }

    /// (Re-)arms the timeout one period from now.
    pub(crate) fn reset(&self) {
        self.handle
            .inner
            .timer
            .borrow_mut()
            .reset(&self.state, Instant::now());
    }

    pub(crate) fn cancel(&self) {
        self.handle.inner.timer.borrow_mut().cancel(&self.state);
    }

    pub(crate) fn fired(&self) -> bool {
        self.state.fired.get()
    }

    /// Wraps an operation so that the timeout firing resolves it with a
    /// `TimedOut` error instead of its own result.
    pub(crate) fn guard<F>(&self, inner: F) -> Guarded<'_, F> {
        Guarded {
            timeout: self,
            inner,
        }
    }
}

impl Drop for Timeout {
    fn drop(&mut self) {
        self.cancel();
    }
}

pin_project! {
    pub(crate) struct Guarded<'a, F> {
        timeout: &'a Timeout,
        #[pin]
        inner: F,
    }
}

impl<'a, F, T> Future for Guarded<'a, F>
where
    F: Future<Output = crate::Result<T>>,
{
    type Output = crate::Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if this.timeout.fired() {
            return Poll::Ready(Err(crate::Error::new_timed_out()));
        }
        this.timeout
            .state
            .waker
            .borrow_mut()
            .replace(cx.waker().clone());
        this.inner.poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(now: Instant, period_ms: u64) -> Rc<TimeoutState> {
        let s = TimeoutState::new(Duration::from_millis(period_ms));
        s.deadline.set(now + Duration::from_millis(period_ms));
        s
    }

    #[test]
    fn fires_expired_in_deadline_order() {
        let now = Instant::now();
        let mut wheel = Wheel::new();

        let a = state(now, 10);
        let b = state(now, 30);
        let c = state(now, 20);
        wheel.add(&a);
        wheel.add(&b);
        wheel.add(&c);

        let deadlines = wheel.deadlines();
        let mut sorted = deadlines.clone();
        sorted.sort();
        assert_eq!(deadlines, sorted);

        wheel.tick(now + Duration::from_millis(20));
        assert!(a.fired.get());
        assert!(c.fired.get());
        assert!(!b.fired.get());
        assert_eq!(wheel.next_deadline(), Some(b.deadline.get()));
    }

    #[test]
    fn cancel_prevents_firing() {
        let now = Instant::now();
        let mut wheel = Wheel::new();

        let a = state(now, 10);
        wheel.add(&a);
        wheel.cancel(&a);
        wheel.tick(now + Duration::from_secs(1));
        assert!(!a.fired.get());
        assert_eq!(wheel.next_deadline(), None);
    }

    #[test]
    fn reset_moves_deadline_forward() {
        let now = Instant::now();
        let mut wheel = Wheel::new();

        let a = state(now, 10);
        let b = state(now, 20);
        wheel.add(&a);
        wheel.add(&b);

        // Refreshing `a` moves it behind `b`.
        wheel.reset(&a, now + Duration::from_millis(15));
        assert_eq!(wheel.next_deadline(), Some(b.deadline.get()));

        wheel.tick(now + Duration::from_millis(20));
        assert!(b.fired.get());
        assert!(!a.fired.get());

        wheel.tick(now + Duration::from_millis(25));
        assert!(a.fired.get());
    }

    #[test]
    fn reset_relinks_unlinked_timeout() {
        let now = Instant::now();
        let mut wheel = Wheel::new();

        let a = state(now, 10);
        wheel.add(&a);
        wheel.tick(now + Duration::from_millis(10));
        assert!(a.fired.get());
        assert!(!a.linked.get());

        wheel.reset(&a, now + Duration::from_millis(10));
        assert!(a.linked.get());
        assert!(!a.fired.get());
    }
}
