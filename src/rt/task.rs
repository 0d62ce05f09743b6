//! Task plumbing: wakers, cooperative yield, and scope-exit guards.

use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use super::Inner;

/// A spawned task's future. Tasks never migrate across threads, so no
/// `Send` bound is required.
pub(crate) type TaskFuture = Pin<Box<dyn Future<Output = ()>>>;

/// Wakes a task by pushing its id onto the scheduler's run queue.
///
/// Built on `Rc` rather than `Arc`: wakers never leave the scheduler
/// thread. The driver and timer wheel both live on that thread and are the
/// only holders.
struct WakerData {
    inner: Weak<Inner>,
    id: usize,
}

impl WakerData {
    fn wake(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.run_queue.borrow_mut().push_back(self.id);
        }
    }
}

static VTABLE: RawWakerVTable = RawWakerVTable::new(clone_raw, wake_raw, wake_by_ref_raw, drop_raw);

unsafe fn clone_raw(data: *const ()) -> RawWaker {
    Rc::increment_strong_count(data as *const WakerData);
    RawWaker::new(data, &VTABLE)
}

unsafe fn wake_raw(data: *const ()) {
    let data = Rc::from_raw(data as *const WakerData);
    data.wake();
}

unsafe fn wake_by_ref_raw(data: *const ()) {
    let data = &*(data as *const WakerData);
    data.wake();
}

unsafe fn drop_raw(data: *const ()) {
    drop(Rc::from_raw(data as *const WakerData));
}

pub(crate) fn waker(inner: &Rc<Inner>, id: usize) -> Waker {
    let data = Rc::into_raw(Rc::new(WakerData {
        inner: Rc::downgrade(inner),
        id,
    }));
    unsafe { Waker::from_raw(RawWaker::new(data as *const (), &VTABLE)) }
}

/// Returns control to the scheduler once, resuming on the next tick.
pub async fn yield_now() {
    struct YieldNow {
        yielded: bool,
    }

    impl Future for YieldNow {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.yielded {
                return Poll::Ready(());
            }
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }

    YieldNow { yielded: false }.await
}

/// Runs a closure when dropped. Guards declared later run first, so a
/// task's cleanup executes in LIFO order on exit, completed or not.
pub(crate) struct Defer<F: FnOnce()> {
    cb: Option<F>,
}

pub(crate) fn defer<F: FnOnce()>(cb: F) -> Defer<F> {
    Defer { cb: Some(cb) }
}

impl<F: FnOnce()> Drop for Defer<F> {
    fn drop(&mut self) {
        if let Some(cb) = self.cb.take() {
            cb();
        }
    }
}
