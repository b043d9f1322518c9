//! Scheduler surface, hosted on native threads.
//!
//! The kernel core only needs a handful of primitives from the scheduler:
//! a monitor lock, condition variables with `signal`/`broadcast`/timed
//! waits, a way to spawn a native thread on behalf of a process, the
//! "current thread" accessor, and terminal suspension of an exiting thread.
//! This module provides them on top of [`std::thread`] park/unpark, so the
//! rest of the crate stays free of host concerns.

use alloc::{collections::VecDeque, sync::Arc};
use core::{
    cell::RefCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use std::{
    panic::{self, AssertUnwindSafe},
    thread::{self, Thread as NativeThread},
    time::Instant,
};

use kspin::{SpinNoIrq, SpinNoIrqGuard};

use crate::{KResult, Kernel, KernelError, Process, Thread};

/// A lock whose guard can atomically release it while waiting on a
/// [`CondVar`].
pub(crate) struct Monitor<T> {
    lock: SpinNoIrq<T>,
}

impl<T> Monitor<T> {
    pub const fn new(data: T) -> Self {
        Self {
            lock: SpinNoIrq::new(data),
        }
    }

    pub fn lock(&self) -> MonitorGuard<'_, T> {
        MonitorGuard {
            monitor: self,
            guard: Some(self.lock.lock()),
        }
    }
}

pub(crate) struct MonitorGuard<'a, T> {
    monitor: &'a Monitor<T>,
    // `None` only while parked inside `wait_until`.
    guard: Option<SpinNoIrqGuard<'a, T>>,
}

impl<T> MonitorGuard<'_, T> {
    /// Releases the monitor, blocks until `cv` is signaled, and reacquires
    /// the monitor before returning.
    ///
    /// Wakeups may be spurious; callers re-check their predicate.
    pub fn wait(&mut self, cv: &CondVar) {
        self.wait_until(cv, Deadline::never());
    }

    /// Like [`wait`](Self::wait) but gives up at `deadline`.
    ///
    /// Returns `false` if the deadline passed without a wakeup.
    pub fn wait_until(&mut self, cv: &CondVar, deadline: Deadline) -> bool {
        let waiter = cv.enqueue();
        self.guard = None;
        waiter.park(deadline);
        self.guard = Some(self.monitor.lock.lock());
        // A waiter still queued was never picked by `signal`/`broadcast`.
        !cv.cancel(&waiter)
    }
}

impl<T> Deref for MonitorGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_deref().expect("monitor guard used while released")
    }
}

impl<T> DerefMut for MonitorGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard
            .as_deref_mut()
            .expect("monitor guard used while released")
    }
}

struct Waiter {
    thread: NativeThread,
    notified: AtomicBool,
}

impl Waiter {
    fn wake(&self) {
        self.notified.store(true, Ordering::Release);
        self.thread.unpark();
    }

    fn park(&self, deadline: Deadline) {
        while !self.notified.load(Ordering::Acquire) {
            match deadline.0 {
                None => thread::park(),
                Some(at) => {
                    let now = Instant::now();
                    if now >= at {
                        return;
                    }
                    thread::park_timeout(at - now);
                }
            }
        }
    }
}

/// A condition variable with a FIFO wait queue.
pub(crate) struct CondVar {
    waiters: SpinNoIrq<VecDeque<Arc<Waiter>>>,
}

impl CondVar {
    pub const fn new() -> Self {
        Self {
            waiters: SpinNoIrq::new(VecDeque::new()),
        }
    }

    /// Wakes the longest-waiting thread, if any.
    pub fn signal(&self) {
        if let Some(waiter) = self.waiters.lock().pop_front() {
            waiter.wake();
        }
    }

    /// Wakes every waiting thread.
    pub fn broadcast(&self) {
        let waiters = core::mem::take(&mut *self.waiters.lock());
        for waiter in waiters {
            waiter.wake();
        }
    }

    fn enqueue(&self) -> Arc<Waiter> {
        let waiter = Arc::new(Waiter {
            thread: thread::current(),
            notified: AtomicBool::new(false),
        });
        self.waiters.lock().push_back(waiter.clone());
        waiter
    }

    /// Removes `waiter` from the queue. Returns `true` if it was still there.
    fn cancel(&self, waiter: &Arc<Waiter>) -> bool {
        let mut waiters = self.waiters.lock();
        let before = waiters.len();
        waiters.retain(|w| !Arc::ptr_eq(w, waiter));
        waiters.len() != before
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

/// Point in time at which a timed wait gives up.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline(Option<Instant>);

impl Deadline {
    pub fn never() -> Self {
        Self(None)
    }

    /// `None` waits forever, and so does a timeout too large to represent.
    pub fn after(timeout: Option<Duration>) -> Self {
        Self(timeout.and_then(|t| Instant::now().checked_add(t)))
    }

    pub fn expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }
}

/// The kernel thread a native thread runs on behalf of.
#[derive(Clone)]
pub(crate) struct Context {
    pub kernel: Arc<Kernel>,
    pub thread: Arc<Thread>,
}

impl Context {
    pub fn process(&self) -> &Arc<Process> {
        self.thread.process()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

/// The calling thread's kernel context.
pub(crate) fn current() -> KResult<Context> {
    CURRENT
        .with(|current| current.borrow().clone())
        .ok_or(KernelError::NoContext)
}

/// Unwind payload used to leave task code once its thread has exited.
struct TaskExit;

/// Returns `true` if an unwind payload is the one raised by
/// [`exit_current`].
pub(crate) fn is_task_exit(payload: &(dyn core::any::Any + Send)) -> bool {
    payload.is::<TaskExit>()
}

/// Suspends the calling kernel thread for good.
///
/// Must be called without the monitor held. Control goes back to the
/// native thread's entry frame, which then ends the native thread.
pub(crate) fn exit_current() -> ! {
    panic::resume_unwind(alloc::boxed::Box::new(TaskExit))
}

/// Spawns a native thread running `entry` as kernel thread `ctx.thread`.
pub(crate) fn spawn<F>(ctx: Context, entry: F) -> KResult<NativeThread>
where
    F: FnOnce(&Context) + Send + 'static,
{
    let name = format!("p{}t{}", ctx.process().pid(), ctx.thread.tid());
    let handle = thread::Builder::new()
        .name(name)
        .spawn(move || {
            CURRENT.with(|current| current.replace(Some(ctx.clone())));
            let result = panic::catch_unwind(AssertUnwindSafe(|| entry(&ctx)));
            CURRENT.with(|current| current.take());
            drop(ctx);
            if let Err(payload) = result {
                if !is_task_exit(payload.as_ref()) {
                    panic::resume_unwind(payload);
                }
            }
        })
        .map_err(|_| KernelError::ResourceExhausted)?;
    Ok(handle.thread().clone())
}
