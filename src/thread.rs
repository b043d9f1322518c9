use alloc::{sync::Arc, vec::Vec};
use core::fmt;
use std::{
    panic::{self, AssertUnwindSafe},
    thread::Thread as NativeThread,
};

use kspin::SpinNoIrq;
use lazyinit::LazyInit;
use log::{debug, error};

use crate::{
    KResult, Kernel, KernelError, Process, Tid,
    kernel::KernelGuard,
    sched::{self, CondVar, Context},
};

/// Exit status of a task that panicked.
pub const TASK_PANICKED: i32 = -1;

/// Entry point of a process or thread.
///
/// The task receives the arguments captured when it was started and
/// returns its exit status.
#[derive(Clone)]
pub struct Task(Arc<dyn Fn(&[u8]) -> i32 + Send + Sync>);

impl Task {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[u8]) -> i32 + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    fn call(&self, args: &[u8]) -> i32 {
        (self.0)(args)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({:p})", Arc::as_ptr(&self.0))
    }
}

#[derive(Default)]
struct ThreadState {
    exit_code: i32,
    exited: bool,
    detached: bool,
    joiners: usize,
}

/// A thread.
pub struct Thread {
    tid: Tid,
    process: Arc<Process>,
    is_main: bool,
    task: Task,
    args: Vec<u8>,
    state: SpinNoIrq<ThreadState>,
    exit_cv: CondVar,
    native: LazyInit<NativeThread>,
}

impl Thread {
    /// The [`Thread`] ID.
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// The [`Process`] this thread belongs to.
    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    /// Returns `true` if the thread has exited.
    pub fn is_exited(&self) -> bool {
        self.state.lock().exited
    }

    /// Returns `true` if the thread has been detached.
    pub fn is_detached(&self) -> bool {
        self.state.lock().detached
    }

    /// Runs the task, turning a panic into [`TASK_PANICKED`].
    ///
    /// Returns `None` if the task left through an explicit exit call.
    fn run(&self) -> Option<i32> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.task.call(&self.args))) {
            Ok(status) => Some(status),
            Err(payload) if sched::is_task_exit(payload.as_ref()) => None,
            Err(_) => {
                error!("thread {} of process {} panicked", self.tid, self.process.pid());
                Some(TASK_PANICKED)
            }
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread({}, process={}", self.tid, self.process.pid())?;
        if let Some(native) = self.native.get() {
            write!(f, ", native={:?}", native.id())?;
        }
        write!(f, ")")
    }
}

/// Entry routine of every native thread spawned for a kernel thread.
fn start_thread(ctx: &Context) {
    let Some(status) = ctx.thread.run() else {
        return;
    };
    let mut g = ctx.kernel.lock();
    if ctx.thread.is_main {
        ctx.process().set_exit_code(status);
    }
    ctx.kernel.exit_thread(&mut g, &ctx.thread, status);
}

impl Kernel {
    /// Adds a thread running `task` to `process` and starts it.
    pub(crate) fn spawn_thread(
        self: &Arc<Self>,
        process: &Arc<Process>,
        task: Task,
        args: &[u8],
        is_main: bool,
    ) -> KResult<Tid> {
        let tid = self.alloc_tid();
        let thread = Arc::new(Thread {
            tid,
            process: process.clone(),
            is_main,
            task,
            args: args.to_vec(),
            state: SpinNoIrq::new(ThreadState::default()),
            exit_cv: CondVar::new(),
            native: LazyInit::new(),
        });

        {
            let mut tg = process.tg.lock();
            tg.count += 1;
            tg.threads.insert(tid, thread.clone());
        }

        let ctx = Context {
            kernel: self.clone(),
            thread: thread.clone(),
        };
        match sched::spawn(ctx, start_thread) {
            Ok(native) => {
                thread.native.init_once(native);
                debug!("thread {} started in process {}", tid, process.pid());
                Ok(tid)
            }
            Err(err) => {
                let mut tg = process.tg.lock();
                tg.count -= 1;
                tg.threads.remove(&tid);
                Err(err)
            }
        }
    }

    /// Waits for thread `tid` of the caller's process to exit and returns its
    /// exit status.
    ///
    /// Fails if the thread is the caller, is detached, or gets detached
    /// while waiting.
    pub(crate) fn join_thread(
        &self,
        g: &mut KernelGuard<'_>,
        caller: &Thread,
        tid: Tid,
    ) -> KResult<i32> {
        if tid == caller.tid {
            return Err(KernelError::InvalidArgument);
        }
        let process = caller.process();
        let target = process.thread(tid).ok_or(KernelError::NotFound)?;

        {
            let mut state = target.state.lock();
            if state.detached {
                return Err(KernelError::InvalidArgument);
            }
            state.joiners += 1;
        }

        loop {
            let state = target.state.lock();
            if state.detached {
                return Err(KernelError::InvalidArgument);
            }
            if state.exited {
                break;
            }
            drop(state);
            g.wait(&target.exit_cv);
        }

        let mut state = target.state.lock();
        let status = state.exit_code;
        state.joiners -= 1;
        let last = state.joiners == 0;
        drop(state);
        if last {
            process.tg.lock().threads.remove(&tid);
        }
        debug!("thread {} joined thread {}, status {}", caller.tid, tid, status);
        Ok(status)
    }

    /// Makes thread `tid` of the caller's process unjoinable.
    pub(crate) fn detach_thread(&self, caller: &Thread, tid: Tid) -> KResult<()> {
        let target = caller
            .process()
            .thread(tid)
            .ok_or(KernelError::NotFound)?;

        let mut state = target.state.lock();
        if state.exited {
            return Err(KernelError::InvalidArgument);
        }
        state.detached = true;
        state.joiners = 0;
        drop(state);

        target.exit_cv.broadcast();
        debug!("thread {} detached", tid);
        Ok(())
    }

    /// Records the exit of `thread`, tearing its process down if it was the
    /// last one.
    ///
    /// The init process reclaims all of its children before its last thread
    /// is allowed to go.
    pub(crate) fn exit_thread(&self, g: &mut KernelGuard<'_>, thread: &Arc<Thread>, status: i32) {
        let process = thread.process();
        if process.is_init() && process.thread_count() == 1 {
            while self.wait_child(g, process, None).is_ok() {}
        }

        let detached = {
            let mut state = thread.state.lock();
            state.exited = true;
            state.exit_code = status;
            state.detached
        };
        thread.exit_cv.broadcast();

        let last = {
            let mut tg = process.tg.lock();
            if detached {
                tg.threads.remove(&thread.tid);
            }
            tg.count -= 1;
            tg.count == 0
        };
        debug!(
            "thread {} of process {} exited with status {}",
            thread.tid,
            process.pid(),
            status
        );

        if last {
            self.teardown_process(g, process);
        }
    }
}
