//! Single-threaded cooperative runtime.
//!
//! Tasks are eagerly-created futures stored in a slab, with a FIFO queue of
//! freshly spawned tasks awaiting their first poll and a run queue of woken
//! tasks. The scheduler loop drains both queues, pumps the I/O driver until
//! the timer wheel's next deadline, then ticks the wheel. It exits when
//! SIGINT has been observed or the last task completes.
//!
//! Everything here is thread-local to one scheduler; running two servers
//! means two runtimes on two threads with no shared state.

pub(crate) mod task;
pub(crate) mod timer;

pub use self::task::yield_now;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;

use slab::Slab;
use tracing::{debug, trace};

use crate::io::Driver;
use crate::rt::task::TaskFuture;
use crate::rt::timer::Wheel;

pub(crate) struct Inner {
    pub(crate) tasks: RefCell<Slab<Option<TaskFuture>>>,
    pub(crate) spawn_queue: RefCell<VecDeque<usize>>,
    pub(crate) run_queue: RefCell<VecDeque<usize>>,
    pub(crate) timer: RefCell<Wheel>,
    pub(crate) driver: RefCell<Driver>,
}

/// The runtime, owning the task set, timer wheel, and I/O driver.
pub struct Runtime {
    inner: Rc<Inner>,
}

/// A cheap handle for spawning tasks and submitting I/O.
#[derive(Clone)]
pub struct Handle {
    pub(crate) inner: Rc<Inner>,
}

impl Runtime {
    pub(crate) fn new(driver: Driver) -> Runtime {
        Runtime {
            inner: Rc::new(Inner {
                tasks: RefCell::new(Slab::new()),
                spawn_queue: RefCell::new(VecDeque::new()),
                run_queue: RefCell::new(VecDeque::new()),
                timer: RefCell::new(Wheel::new()),
                driver: RefCell::new(driver),
            }),
        }
    }

    pub fn handle(&self) -> Handle {
        Handle {
            inner: Rc::clone(&self.inner),
        }
    }

    /// Drives all tasks to completion. Returns after SIGINT or once the
    /// live-task count reaches zero.
    pub fn run(&self) -> crate::Result<()> {
        signal::install()?;
        trace!("starting event loop");

        loop {
            if signal::interrupted() {
                debug!("interrupted, draining");
                break;
            }

            // First-resume freshly spawned tasks in FIFO order, then the
            // woken ones. Wakes and spawns during this batch run on the
            // next tick, after the driver has had a turn.
            let batch: Vec<usize> = {
                let mut spawned = self.inner.spawn_queue.borrow_mut();
                let mut woken = self.inner.run_queue.borrow_mut();
                spawned.drain(..).chain(woken.drain(..)).collect()
            };
            for id in batch {
                poll_task(&self.inner, id);
            }

            if self.inner.tasks.borrow().is_empty() {
                trace!("all tasks complete");
                break;
            }

            // Tasks already runnable must not wait on I/O.
            let runnable = !self.inner.spawn_queue.borrow().is_empty()
                || !self.inner.run_queue.borrow().is_empty();
            let deadline = if runnable {
                Some(Instant::now())
            } else {
                self.inner.timer.borrow().next_deadline()
            };
            self.inner.driver.borrow_mut().pump(deadline)?;
            self.inner.timer.borrow_mut().tick(Instant::now());
        }

        Ok(())
    }
}

impl Handle {
    /// Queues a new task for its first poll on the next scheduler tick.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let id = self.inner.tasks.borrow_mut().insert(Some(Box::pin(fut)));
        self.inner.spawn_queue.borrow_mut().push_back(id);
        trace!(task = id, "spawned");
    }
}

fn poll_task(inner: &Rc<Inner>, id: usize) {
    // Take the future out of its slot so the poll cannot alias the slab;
    // a task spawning another task re-borrows it.
    let mut fut = {
        let mut tasks = inner.tasks.borrow_mut();
        match tasks.get_mut(id).and_then(|slot| slot.take()) {
            Some(fut) => fut,
            // Already completed; a stale waker or duplicate queue entry.
            None => return,
        }
    };

    let waker = task::waker(inner, id);
    let mut cx = Context::from_waker(&waker);
    match fut.as_mut().poll(&mut cx) {
        Poll::Ready(()) => {
            trace!(task = id, "complete");
            inner.tasks.borrow_mut().remove(id);
        }
        Poll::Pending => {
            if let Some(slot) = inner.tasks.borrow_mut().get_mut(id) {
                *slot = Some(fut);
            }
        }
    }
}

mod signal {
    use super::*;
    use std::io;

    static TERMINATE: AtomicBool = AtomicBool::new(false);

    extern "C" fn on_sigint(_signum: libc::c_int) {
        TERMINATE.store(true, Ordering::Relaxed);
    }

    pub(super) fn interrupted() -> bool {
        TERMINATE.load(Ordering::Relaxed)
    }

    pub(super) fn install() -> crate::Result<()> {
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = on_sigint as extern "C" fn(libc::c_int) as usize;
            libc::sigemptyset(&mut sa.sa_mask);
            // No SA_RESTART: a blocked pump must return EINTR so the loop
            // re-checks the flag.
            sa.sa_flags = 0;
            if libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut()) != 0 {
                return Err(crate::Error::new_io(io::Error::last_os_error()));
            }
            // Vectored writes to reset peers must surface EPIPE, not kill
            // the process.
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::task::{defer, yield_now};
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn test_runtime() -> Runtime {
        Runtime::new(Driver::new_poll())
    }

    #[test]
    fn run_completes_spawned_tasks() {
        let rt = test_runtime();
        let handle = rt.handle();
        let hits = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let hits = Rc::clone(&hits);
            handle.spawn(async move {
                hits.borrow_mut().push(i);
            });
        }

        rt.run().unwrap();
        // First resumes happen in spawn (FIFO) order.
        assert_eq!(*hits.borrow(), vec![0, 1, 2]);
        assert!(handle.inner.tasks.borrow().is_empty());
    }

    #[test]
    fn yields_interleave_tasks() {
        let rt = test_runtime();
        let handle = rt.handle();
        let order = Rc::new(RefCell::new(Vec::new()));

        for name in ["a", "b"] {
            let order = Rc::clone(&order);
            handle.spawn(async move {
                for round in 0..3 {
                    order.borrow_mut().push((name, round));
                    yield_now().await;
                }
            });
        }

        rt.run().unwrap();
        assert_eq!(
            *order.borrow(),
            vec![
                ("a", 0),
                ("b", 0),
                ("a", 1),
                ("b", 1),
                ("a", 2),
                ("b", 2)
            ]
        );
    }

    #[test]
    fn defers_run_lifo_on_exit() {
        let rt = test_runtime();
        let handle = rt.handle();
        let order = Rc::new(RefCell::new(Vec::new()));

        {
            let order = Rc::clone(&order);
            handle.spawn(async move {
                let _first = defer({
                    let order = Rc::clone(&order);
                    move || order.borrow_mut().push("first")
                });
                let _second = defer({
                    let order = Rc::clone(&order);
                    move || order.borrow_mut().push("second")
                });
                for _ in 0..100 {
                    yield_now().await;
                }
                order.borrow_mut().push("body");
            });
        }

        rt.run().unwrap();
        assert_eq!(*order.borrow(), vec!["body", "second", "first"]);
    }

    #[test]
    fn tasks_spawned_from_tasks_run() {
        let rt = test_runtime();
        let handle = rt.handle();
        let done = Rc::new(RefCell::new(false));

        {
            let done = Rc::clone(&done);
            let inner_handle = handle.clone();
            handle.spawn(async move {
                inner_handle.spawn(async move {
                    *done.borrow_mut() = true;
                });
            });
        }

        rt.run().unwrap();
        assert!(*done.borrow());
    }
}
