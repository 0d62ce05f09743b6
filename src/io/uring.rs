//! Completion ring back-end.
//!
//! Every operation is one submission-queue entry whose `user_data` is the
//! key of an op slot. Completions recover the waiting task from the slot
//! and resume it with the raw result. Dropped in-flight operations are
//! marked orphaned and reclaimed when their completion arrives, after a
//! best-effort async-cancel; neither the cancel completion nor the
//! orphan's ever reaches application code.

use std::collections::VecDeque;
use std::ffi::CStr;
use std::future::Future;
use std::mem;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use std::time::Instant;

use io_uring::{cqueue, opcode, squeue, types, IoUring, Probe};
use slab::Slab;
use tracing::{debug, trace, warn};

use crate::config::{Config, MIN_KERNEL_VERSION, SQE_RETRY_MAX, URING_ENTRIES_MIN};
use crate::io::{Metadata, RESOLVE_BENEATH};
use crate::rt::Handle;
use crate::Error;

/// Reserved `user_data` for the pump's wake-up timer.
const WAKE_USER_DATA: u64 = u64::MAX;
/// Reserved `user_data` for async-cancel entries.
const CANCEL_USER_DATA: u64 = u64::MAX - 1;

pub(crate) enum Lifecycle {
    /// Submitted, no poll yet.
    Submitted,
    /// A task is suspended on the result.
    Waiting(Waker),
    /// The owning future was dropped mid-flight. The slot is reclaimed by
    /// the pump when the (terminal) completion arrives.
    Ignored,
    /// Completed, result not yet collected.
    Completed(i32),
    /// A multishot op delivering a stream of results.
    Stream {
        results: VecDeque<i32>,
        done: bool,
        waker: Option<Waker>,
    },
}

/// Owned memory an in-flight entry points into. Held by the slot, not the
/// future, so a dropped future cannot free it out from under the kernel.
pub(crate) enum SideData {
    None,
    Open {
        _path: std::ffi::CString,
        _how: Box<types::OpenHow>,
    },
    Statx {
        _path: &'static CStr,
        buf: Box<libc::statx>,
    },
}

struct OpSlot {
    lifecycle: Lifecycle,
    data: SideData,
}

pub(crate) struct Driver {
    ring: IoUring,
    ops: Slab<OpSlot>,
    pump_ts: Box<types::Timespec>,
}

impl Driver {
    pub(crate) fn new(config: &Config) -> crate::Result<Driver> {
        kernel_check()?;
        limits_init(config);

        let ring = open_ring(config.uring_entries)?;

        let mut probe = Probe::new();
        ring.submitter()
            .register_probe(&mut probe)
            .map_err(Error::new_io)?;
        ops_check(&probe)?;

        if !ring.params().is_feature_nodrop() || !ring.params().is_feature_submit_stable() {
            return Err(Error::new_unsupported("missing required ring features"));
        }

        Ok(Driver {
            ring,
            ops: Slab::with_capacity(64),
            pump_ts: Box::new(types::Timespec::new()),
        })
    }

    /// Obtains a submission slot, eagerly submitting to drain a full
    /// queue, bounded by `SQE_RETRY_MAX` attempts.
    fn push(&mut self, entry: squeue::Entry) -> crate::Result<()> {
        for _ in 0..SQE_RETRY_MAX {
            // SAFETY: every pointer in the entry is owned by the op slot
            // or borrowed by a future that lives until the completion.
            if unsafe { self.ring.submission().push(&entry) }.is_ok() {
                return Ok(());
            }
            if self.ring.submit().is_err() {
                break;
            }
        }
        warn!("submission queue full");
        Err(Error::new_submit_failed())
    }

    fn submit_op(&mut self, entry: squeue::Entry, data: SideData) -> crate::Result<usize> {
        let key = self.ops.insert(OpSlot {
            lifecycle: Lifecycle::Submitted,
            data,
        });
        let entry = entry.user_data(key as u64);
        if let Err(e) = self.push(entry) {
            self.ops.remove(key);
            return Err(e);
        }
        Ok(key)
    }

    fn submit_stream_op(&mut self, entry: squeue::Entry) -> crate::Result<usize> {
        let key = self.ops.insert(OpSlot {
            lifecycle: Lifecycle::Stream {
                results: VecDeque::new(),
                done: false,
                waker: None,
            },
            data: SideData::None,
        });
        let entry = entry.user_data(key as u64);
        if let Err(e) = self.push(entry) {
            self.ops.remove(key);
            return Err(e);
        }
        Ok(key)
    }

    /// Submits pending entries and waits for a completion, arming a
    /// one-shot timeout so the wait returns at the wheel's next deadline.
    /// The completion queue is drained in one pass.
    pub(crate) fn pump(&mut self, deadline: Option<Instant>) -> crate::Result<()> {
        if let Some(deadline) = deadline {
            let until = deadline.saturating_duration_since(Instant::now());
            *self.pump_ts = types::Timespec::new()
                .sec(until.as_secs())
                .nsec(until.subsec_nanos());
            // count(1): the timer also completes with the next CQE, so
            // stale wake-ups never pile up in the kernel.
            let entry = opcode::Timeout::new(&*self.pump_ts as *const types::Timespec)
                .count(1)
                .build()
                .user_data(WAKE_USER_DATA);
            // Best effort: a full queue just means we wake on I/O instead.
            let _ = self.push(entry);
        }

        trace!("waiting for completions");
        match self.ring.submit_and_wait(1) {
            Ok(_) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => return Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {}
            Err(e) => return Err(Error::new_io(e)),
        }

        let Driver { ring, ops, .. } = self;
        for cqe in ring.completion() {
            let user_data = cqe.user_data();
            if user_data == WAKE_USER_DATA || user_data == CANCEL_USER_DATA {
                continue;
            }

            let key = user_data as usize;
            let more = cqueue::more(cqe.flags());
            let slot = match ops.get_mut(key) {
                Some(slot) => slot,
                None => {
                    warn!(key, "completion for unknown op");
                    continue;
                }
            };

            match slot.lifecycle {
                Lifecycle::Ignored => {
                    if !more {
                        ops.remove(key);
                    }
                }
                Lifecycle::Stream {
                    ref mut results,
                    ref mut done,
                    ref mut waker,
                } => {
                    results.push_back(cqe.result());
                    if !more {
                        *done = true;
                    }
                    if let Some(waker) = waker.take() {
                        waker.wake();
                    }
                }
                _ => {
                    let prev = mem::replace(&mut slot.lifecycle, Lifecycle::Completed(cqe.result()));
                    if let Lifecycle::Waiting(waker) = prev {
                        waker.wake();
                    }
                }
            }
        }

        Ok(())
    }

    fn orphan(&mut self, key: usize) {
        let cancelled = match self.ops.get_mut(key) {
            Some(slot) => match slot.lifecycle {
                Lifecycle::Completed(_) => {
                    self.ops.remove(key);
                    return;
                }
                Lifecycle::Stream { done: true, .. } => {
                    self.ops.remove(key);
                    return;
                }
                _ => {
                    slot.lifecycle = Lifecycle::Ignored;
                    true
                }
            },
            None => return,
        };

        if cancelled {
            let entry = opcode::AsyncCancel::new(key as u64)
                .build()
                .user_data(CANCEL_USER_DATA);
            let _ = self.push(entry);
        }
    }
}

fn with_uring<T>(handle: &Handle, f: impl FnOnce(&mut Driver) -> T) -> T {
    let mut driver = handle.inner.driver.borrow_mut();
    match *driver {
        super::Driver::Uring(ref mut d) => f(d),
        super::Driver::Poll(_) => unreachable!("op routed to the wrong back-end"),
    }
}

/// One submitted single-shot operation. Resolves to the raw completion
/// result; destroyed after exactly one completion is collected.
pub(crate) struct Op {
    handle: Handle,
    key: usize,
    done: bool,
}

impl Op {
    fn submit(handle: &Handle, entry: squeue::Entry, data: SideData) -> crate::Result<Op> {
        let key = with_uring(handle, |d| d.submit_op(entry, data))?;
        Ok(Op {
            handle: handle.clone(),
            key,
            done: false,
        })
    }
}

impl Future for Op {
    type Output = (i32, SideData);

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let key = self.key;
        let result = with_uring(&self.handle, |d| {
            let slot = d.ops.get_mut(key).expect("op slot missing");
            match slot.lifecycle {
                Lifecycle::Completed(res) => {
                    let slot = d.ops.remove(key);
                    Some((res, slot.data))
                }
                _ => {
                    slot.lifecycle = Lifecycle::Waiting(cx.waker().clone());
                    None
                }
            }
        });
        match result {
            Some(out) => {
                self.done = true;
                Poll::Ready(out)
            }
            None => Poll::Pending,
        }
    }
}

impl Drop for Op {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let key = self.key;
        with_uring(&self.handle, |d| d.orphan(key));
    }
}

/// Multishot accept: one submission, a stream of accepted sockets until
/// the kernel signals no-more. Falls back to re-issued single-shot
/// accepts on kernels that reject the multishot flag.
pub(crate) struct AcceptStream {
    handle: Handle,
    fd: RawFd,
    key: Option<usize>,
    multishot: bool,
}

impl AcceptStream {
    pub(crate) fn new(handle: &Handle, fd: RawFd) -> AcceptStream {
        AcceptStream {
            handle: handle.clone(),
            fd,
            key: None,
            multishot: true,
        }
    }

    fn entry(&self) -> squeue::Entry {
        if self.multishot {
            opcode::AcceptMulti::new(types::Fd(self.fd)).build()
        } else {
            opcode::Accept::new(types::Fd(self.fd), std::ptr::null_mut(), std::ptr::null_mut())
                .build()
        }
    }
}

impl futures_core::Stream for AcceptStream {
    type Item = crate::Result<RawFd>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let this = &mut *self;
            let key = match this.key {
                Some(key) => key,
                None => {
                    let entry = this.entry();
                    match with_uring(&this.handle, |d| d.submit_stream_op(entry)) {
                        Ok(key) => {
                            this.key = Some(key);
                            key
                        }
                        Err(e) => return Poll::Ready(Some(Err(e))),
                    }
                }
            };

            enum Next {
                Result(i32),
                Exhausted,
                Pending,
            }

            let next = with_uring(&this.handle, |d| {
                let slot = d.ops.get_mut(key).expect("accept slot missing");
                match slot.lifecycle {
                    Lifecycle::Stream {
                        ref mut results,
                        done,
                        ref mut waker,
                    } => {
                        if let Some(res) = results.pop_front() {
                            if done && results.is_empty() {
                                d.ops.remove(key);
                            }
                            Next::Result(res)
                        } else if done {
                            d.ops.remove(key);
                            Next::Exhausted
                        } else {
                            *waker = Some(cx.waker().clone());
                            Next::Pending
                        }
                    }
                    _ => unreachable!("accept slot is not a stream"),
                }
            });

            match next {
                Next::Result(res) if res >= 0 => {
                    if !this.multishot || !slot_live(&this.handle, key) {
                        this.key = None;
                    }
                    return Poll::Ready(Some(Ok(res)));
                }
                Next::Result(res) => {
                    let errno = -res;
                    this.key = None;
                    if errno == libc::EINVAL && this.multishot {
                        // Multishot accept predates this kernel; emulate
                        // with re-issued single-shot submissions.
                        debug!("multishot accept unsupported, re-issuing single-shot");
                        this.multishot = false;
                        continue;
                    }
                    if errno == libc::ECANCELED {
                        continue;
                    }
                    return Poll::Ready(Some(Err(Error::new_errno(errno))));
                }
                Next::Exhausted => {
                    this.key = None;
                    return Poll::Ready(None);
                }
                Next::Pending => return Poll::Pending,
            }
        }
    }
}

fn slot_live(handle: &Handle, key: usize) -> bool {
    with_uring(handle, |d| d.ops.contains(key))
}

impl Drop for AcceptStream {
    fn drop(&mut self) {
        if let Some(key) = self.key {
            with_uring(&self.handle, |d| d.orphan(key));
        }
    }
}

pub(crate) async fn recv(handle: &Handle, fd: RawFd, buf: &mut [u8]) -> crate::Result<usize> {
    let entry = opcode::Recv::new(types::Fd(fd), buf.as_mut_ptr(), buf.len() as u32).build();
    let (res, _) = Op::submit(handle, entry, SideData::None)?.await;
    match res {
        0 => Err(Error::new_eof()),
        n if n > 0 => Ok(n as usize),
        n => match -n {
            libc::ECONNRESET => Err(Error::new_eof()),
            errno => Err(Error::new_errno(errno)),
        },
    }
}

pub(crate) async fn send(handle: &Handle, fd: RawFd, buf: &[u8]) -> crate::Result<usize> {
    let entry = opcode::Send::new(types::Fd(fd), buf.as_ptr(), buf.len() as u32)
        .flags(libc::MSG_NOSIGNAL)
        .build();
    let (res, _) = Op::submit(handle, entry, SideData::None)?.await;
    match res {
        n if n >= 0 => Ok(n as usize),
        n => match -n {
            libc::ECONNRESET | libc::EPIPE => Err(Error::new_eof()),
            errno => Err(Error::new_errno(errno)),
        },
    }
}

pub(crate) async fn read_at(
    handle: &Handle,
    fd: RawFd,
    buf: &mut [u8],
    offset: u64,
) -> crate::Result<usize> {
    let entry = opcode::Read::new(types::Fd(fd), buf.as_mut_ptr(), buf.len() as u32)
        .offset(offset as _)
        .build();
    let (res, _) = Op::submit(handle, entry, SideData::None)?.await;
    match res {
        0 => Err(Error::new_eof()),
        n if n > 0 => Ok(n as usize),
        n => Err(Error::new_errno(-n)),
    }
}

pub(crate) async fn writev(
    handle: &Handle,
    fd: RawFd,
    iov: &[libc::iovec],
) -> crate::Result<usize> {
    let entry = opcode::Writev::new(types::Fd(fd), iov.as_ptr(), iov.len() as u32).build();
    let (res, _) = Op::submit(handle, entry, SideData::None)?.await;
    match res {
        n if n >= 0 => Ok(n as usize),
        n => match -n {
            libc::ECONNRESET | libc::EPIPE => Err(Error::new_eof()),
            errno => Err(Error::new_errno(errno)),
        },
    }
}

pub(crate) async fn open_under(
    handle: &Handle,
    dir: RawFd,
    path: &CStr,
    flags: i32,
) -> crate::Result<RawFd> {
    loop {
        let path = path.to_owned();
        let how = Box::new(
            types::OpenHow::new()
                .flags(flags as u64)
                .resolve(RESOLVE_BENEATH),
        );
        let entry =
            opcode::OpenAt2::new(types::Fd(dir), path.as_ptr(), &*how as *const types::OpenHow)
                .build();
        let (res, _) = Op::submit(handle, entry, SideData::Open { _path: path, _how: how })?.await;
        if res >= 0 {
            return Ok(res);
        }
        match -res {
            libc::EAGAIN => continue,
            libc::EACCES | libc::ENOENT | libc::ELOOP | libc::EXDEV => {
                return Err(Error::new_not_found())
            }
            errno => return Err(Error::new_errno(errno)),
        }
    }
}

pub(crate) async fn close(handle: &Handle, fd: RawFd) -> crate::Result<()> {
    let entry = opcode::Close::new(types::Fd(fd)).build();
    let (res, _) = Op::submit(handle, entry, SideData::None)?.await;
    if res < 0 {
        return Err(Error::new_errno(-res));
    }
    Ok(())
}

static EMPTY_PATH: &CStr = match CStr::from_bytes_with_nul(b"\0") {
    Ok(s) => s,
    Err(_) => panic!("empty path"),
};

pub(crate) async fn stat(handle: &Handle, fd: RawFd) -> crate::Result<Metadata> {
    let mut buf: Box<libc::statx> = Box::new(unsafe { mem::zeroed() });
    let entry = opcode::Statx::new(
        types::Fd(fd),
        EMPTY_PATH.as_ptr(),
        &mut *buf as *mut libc::statx as *mut _,
    )
    .flags(libc::AT_EMPTY_PATH)
    .mask(libc::STATX_TYPE | libc::STATX_SIZE | libc::STATX_MTIME | libc::STATX_INO)
    .build();

    let (res, data) = Op::submit(
        handle,
        entry,
        SideData::Statx {
            _path: EMPTY_PATH,
            buf,
        },
    )?
    .await;

    if res < 0 {
        return match -res {
            libc::EACCES | libc::ENOENT => Err(Error::new_not_found()),
            errno => Err(Error::new_errno(errno)),
        };
    }

    let buf = match data {
        SideData::Statx { buf, .. } => buf,
        _ => unreachable!("statx side data missing"),
    };
    Ok(Metadata {
        mode: buf.stx_mode as u32,
        size: buf.stx_size,
        mtime: buf.stx_mtime.tv_sec,
        ino: buf.stx_ino,
    })
}

fn kernel_check() -> crate::Result<()> {
    let mut info: libc::utsname = unsafe { mem::zeroed() };
    if unsafe { libc::uname(&mut info) } != 0 {
        return Err(Error::new_io(std::io::Error::last_os_error()));
    }

    let release = unsafe { CStr::from_ptr(info.release.as_ptr()) };
    let release = release.to_string_lossy();
    let mut parts = release.split(|c: char| !c.is_ascii_digit());
    let major: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let minor: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);

    if (major, minor) < MIN_KERNEL_VERSION {
        warn!(
            %release,
            "kernel too old for the ring back-end (need {}.{})",
            MIN_KERNEL_VERSION.0,
            MIN_KERNEL_VERSION.1
        );
        return Err(Error::new_unsupported("kernel too old for io_uring"));
    }
    Ok(())
}

/// Raises the given resource to its hard limit.
fn limit_maximize(resource: libc::__rlimit_resource_t) -> Option<libc::rlimit> {
    unsafe {
        let mut lim: libc::rlimit = mem::zeroed();
        if libc::getrlimit(resource, &mut lim) != 0 {
            return None;
        }
        lim.rlim_cur = lim.rlim_max;
        if libc::setrlimit(resource, &lim) != 0 {
            return None;
        }
        Some(lim)
    }
}

fn limits_init(config: &Config) {
    if let Some(lim) = limit_maximize(libc::RLIMIT_MEMLOCK) {
        if lim.rlim_cur <= 96 * config.uring_entries as u64 {
            warn!(
                limit = lim.rlim_cur,
                "memlock limit is low; opening the ring will probably fail"
            );
        }
    }
    if let Some(lim) = limit_maximize(libc::RLIMIT_NOFILE) {
        if lim.rlim_cur <= 3 * config.connection_pool_size {
            warn!(
                limit = lim.rlim_cur,
                "open file limit is low for the configured connection pool"
            );
        }
    }
}

fn open_ring(entries: u32) -> crate::Result<IoUring> {
    // Largest power of two at or below the configured count.
    let mut entries = if entries.is_power_of_two() {
        entries
    } else {
        entries.next_power_of_two() / 2
    };
    while entries >= URING_ENTRIES_MIN {
        match IoUring::new(entries) {
            Ok(ring) => return Ok(ring),
            Err(e) => {
                debug!(entries, "ring open failed: {}", e);
                entries /= 2;
            }
        }
    }
    Err(Error::new_unsupported(
        "unable to open the ring; the memlock limit is probably too low",
    ))
}

fn ops_check(probe: &Probe) -> crate::Result<()> {
    macro_rules! require_op {
        ($op:ty, $name:literal) => {
            if !probe.is_supported(<$op>::CODE) {
                return Err(Error::new_unsupported(concat!(
                    "required ring op ",
                    $name,
                    " is unsupported"
                )));
            }
        };
    }

    require_op!(opcode::Accept, "accept");
    require_op!(opcode::OpenAt2, "openat2");
    require_op!(opcode::Close, "close");
    require_op!(opcode::Recv, "recv");
    require_op!(opcode::Send, "send");
    require_op!(opcode::Read, "read");
    require_op!(opcode::Writev, "writev");
    require_op!(opcode::Statx, "statx");
    require_op!(opcode::Timeout, "timeout");
    require_op!(opcode::AsyncCancel, "async-cancel");

    if !probe.is_supported(opcode::Splice::CODE) {
        debug!("splice unsupported; file responses use read/send regardless");
    }

    Ok(())
}
