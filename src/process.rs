use alloc::{
    collections::VecDeque,
    sync::{Arc, Weak},
    vec,
    vec::Vec,
};
use core::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use kspin::SpinNoIrq;
use log::{debug, info, warn};
use weak_map::StrongMap;

use crate::{
    INIT_PID, KResult, Kernel, KernelError, Pid, Task, Thread, Tid,
    file::{self, FidTable, empty_fid_table},
    kernel::KernelGuard,
    sched::CondVar,
};

pub(crate) struct ThreadGroup {
    /// Thread records not yet reclaimed.
    pub(crate) threads: StrongMap<Tid, Arc<Thread>>,
    /// Threads that have not exited yet.
    pub(crate) count: usize,
    pub(crate) exit_code: i32,
}

impl Default for ThreadGroup {
    fn default() -> Self {
        Self {
            threads: StrongMap::new(),
            count: 0,
            exit_code: 0,
        }
    }
}

/// A process.
pub struct Process {
    pid: Pid,
    is_zombie: AtomicBool,
    pub(crate) tg: SpinNoIrq<ThreadGroup>,

    main_task: Option<Task>,
    argl: usize,
    args: SpinNoIrq<Option<Vec<u8>>>,

    children: SpinNoIrq<StrongMap<Pid, Arc<Process>>>,
    /// Zombie children in the order they exited.
    exited: SpinNoIrq<VecDeque<Arc<Process>>>,
    parent: SpinNoIrq<Option<Weak<Process>>>,
    child_exit: CondVar,

    pub(crate) files: SpinNoIrq<FidTable>,
}

impl Process {
    /// The [`Process`] ID.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Returns `true` if the [`Process`] is the init process.
    pub fn is_init(&self) -> bool {
        self.pid == INIT_PID
    }

    /// The task run by the main thread, if the process has one.
    pub fn main_task(&self) -> Option<&Task> {
        self.main_task.as_ref()
    }

    /// Length of the arguments the process was created with.
    pub fn argl(&self) -> usize {
        self.argl
    }

    /// A copy of the captured arguments, until the process exits.
    pub fn args(&self) -> Option<Vec<u8>> {
        self.args.lock().clone()
    }
}

/// Parent & children
impl Process {
    /// The parent [`Process`].
    pub fn parent(&self) -> Option<Arc<Process>> {
        self.parent.lock().as_ref().and_then(|p| p.upgrade())
    }

    /// The parent's ID, `None` for the idle and init processes.
    pub fn ppid(&self) -> Option<Pid> {
        self.parent().map(|p| p.pid())
    }

    /// The child [`Process`]es, alive or zombie.
    pub fn children(&self) -> Vec<Arc<Process>> {
        self.children.lock().values().cloned().collect()
    }

    pub(crate) fn child(&self, pid: Pid) -> Option<Arc<Process>> {
        self.children.lock().get(&pid).cloned()
    }
}

/// Threads
impl Process {
    /// The [`Thread`] records that have not been reclaimed yet.
    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.tg.lock().threads.values().cloned().collect()
    }

    /// Number of threads that have not exited.
    pub fn thread_count(&self) -> usize {
        self.tg.lock().count
    }

    pub(crate) fn thread(&self, tid: Tid) -> Option<Arc<Thread>> {
        self.tg.lock().threads.get(&tid).cloned()
    }
}

/// Status & exit
impl Process {
    /// Returns `true` if the [`Process`] is a zombie process.
    pub fn is_zombie(&self) -> bool {
        self.is_zombie.load(Ordering::Acquire)
    }

    /// The exit code of the [`Process`].
    pub fn exit_code(&self) -> i32 {
        self.tg.lock().exit_code
    }

    pub(crate) fn set_exit_code(&self, exit_code: i32) {
        self.tg.lock().exit_code = exit_code;
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("Process");
        builder.field("pid", &self.pid);

        let tg = self.tg.lock();
        builder.field("threads", &tg.count);
        if self.is_zombie() {
            builder.field("exit_code", &tg.exit_code);
        }
        drop(tg);

        if let Some(ppid) = self.ppid() {
            builder.field("parent", &ppid);
        }
        builder.finish()
    }
}

/// Builder
impl Process {
    fn new(
        pid: Pid,
        parent: Option<&Arc<Process>>,
        main_task: Option<Task>,
        args: &[u8],
        files: FidTable,
    ) -> Self {
        Process {
            pid,
            is_zombie: AtomicBool::new(false),
            tg: SpinNoIrq::new(ThreadGroup::default()),
            main_task,
            argl: args.len(),
            args: SpinNoIrq::new((!args.is_empty()).then(|| args.to_vec())),
            children: SpinNoIrq::new(StrongMap::new()),
            exited: SpinNoIrq::new(VecDeque::new()),
            parent: SpinNoIrq::new(parent.map(Arc::downgrade)),
            child_exit: CondVar::new(),
            files: SpinNoIrq::new(files),
        }
    }
}

/// Process slots, indexed by [`Pid`].
pub(crate) struct ProcessTable {
    slots: Vec<Option<Arc<Process>>>,
    /// Free pids; the lowest is handed out first at boot and released pids
    /// are reused most-recent first.
    free: Vec<Pid>,
    count: usize,
}

impl ProcessTable {
    pub fn new(max_proc: usize) -> Self {
        Self {
            slots: vec![None; max_proc],
            free: (0..max_proc as Pid).rev().collect(),
            count: 0,
        }
    }

    fn acquire(&mut self) -> KResult<Pid> {
        let pid = self.free.pop().ok_or_else(|| {
            warn!("process table full");
            KernelError::ResourceExhausted
        })?;
        self.count += 1;
        Ok(pid)
    }

    fn install(&mut self, process: Arc<Process>) {
        let pid = process.pid() as usize;
        self.slots[pid] = Some(process);
    }

    fn release(&mut self, pid: Pid) {
        if self.slots[pid as usize].take().is_some() {
            self.free.push(pid);
            self.count -= 1;
        }
    }

    pub fn get(&self, pid: Pid) -> Option<Arc<Process>> {
        self.slots.get(pid as usize).cloned().flatten()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// The first allocated slot at or after `cursor`.
    pub fn next_from(&self, cursor: usize) -> Option<(usize, &Arc<Process>)> {
        self.slots
            .iter()
            .enumerate()
            .skip(cursor)
            .find_map(|(idx, slot)| slot.as_ref().map(|p| (idx, p)))
    }
}

impl Kernel {
    /// Allocates a process slot and starts `task` in a new main thread.
    ///
    /// Processes other than idle and init become children of `caller` and
    /// inherit its descriptor table.
    pub(crate) fn create_process(
        self: &Arc<Self>,
        g: &mut KernelGuard<'_>,
        caller: Option<&Arc<Process>>,
        task: Option<Task>,
        args: &[u8],
    ) -> KResult<Pid> {
        let pid = g.procs.acquire()?;

        let parent = if pid <= INIT_PID {
            None
        } else {
            caller.cloned()
        };
        let files = match &parent {
            Some(parent) => {
                let files = parent.files.lock().clone();
                for file in files.iter().flatten() {
                    file.incref();
                }
                files
            }
            None => empty_fid_table(self.config().max_fileid),
        };

        let process = Arc::new(Process::new(
            pid,
            parent.as_ref(),
            task.clone(),
            args,
            files,
        ));
        if let Some(parent) = &parent {
            parent.children.lock().insert(pid, process.clone());
        }
        g.procs.install(process.clone());
        info!(
            "process {} created, parent {:?}",
            pid,
            parent.as_ref().map(|p| p.pid())
        );

        if let Some(task) = task {
            if let Err(err) = self.spawn_thread(&process, task, args, true) {
                self.discard_process(g, &process);
                return Err(err);
            }
        }
        Ok(pid)
    }

    /// Undoes [`create_process`](Self::create_process) for a process whose
    /// main thread could not be started.
    fn discard_process(&self, g: &mut KernelGuard<'_>, process: &Arc<Process>) {
        if let Some(parent) = process.parent() {
            parent.children.lock().remove(&process.pid());
        }
        let files = core::mem::take(&mut *process.files.lock());
        for file in files.into_iter().flatten() {
            file::decref(g, file);
        }
        g.procs.release(process.pid());
        warn!("process {} discarded", process.pid());
    }

    /// Waits for a child of `parent` to exit and reclaims it.
    ///
    /// With `Some(pid)`, `pid` must be a child of `parent`. With `None`, the
    /// earliest exited child is reclaimed; fails with
    /// [`KernelError::NotFound`] once `parent` has no children at all.
    pub(crate) fn wait_child(
        &self,
        g: &mut KernelGuard<'_>,
        parent: &Arc<Process>,
        target: Option<Pid>,
    ) -> KResult<(Pid, i32)> {
        match target {
            Some(pid) => Self::wait_specific_child(g, parent, pid),
            None => Self::wait_any_child(g, parent),
        }
    }

    fn wait_specific_child(
        g: &mut KernelGuard<'_>,
        parent: &Arc<Process>,
        pid: Pid,
    ) -> KResult<(Pid, i32)> {
        let child = parent.child(pid).ok_or(KernelError::InvalidArgument)?;
        loop {
            // Another thread of `parent` may have reclaimed it meanwhile.
            match parent.child(pid) {
                Some(current) if Arc::ptr_eq(&current, &child) => {}
                _ => return Err(KernelError::InvalidArgument),
            }
            if child.is_zombie() {
                return Ok(Self::reap(g, parent, &child));
            }
            g.wait(&parent.child_exit);
        }
    }

    fn wait_any_child(g: &mut KernelGuard<'_>, parent: &Arc<Process>) -> KResult<(Pid, i32)> {
        loop {
            if parent.children.lock().is_empty() {
                return Err(KernelError::NotFound);
            }
            let first = parent.exited.lock().front().cloned();
            if let Some(child) = first {
                return Ok(Self::reap(g, parent, &child));
            }
            g.wait(&parent.child_exit);
        }
    }

    fn reap(g: &mut KernelGuard<'_>, parent: &Process, child: &Arc<Process>) -> (Pid, i32) {
        let pid = child.pid();
        let status = child.exit_code();
        parent.children.lock().remove(&pid);
        parent.exited.lock().retain(|c| !Arc::ptr_eq(c, child));
        g.procs.release(pid);
        debug!("process {} reaped child {}, status {}", parent.pid(), pid, status);
        (pid, status)
    }

    /// Turns `process` into a zombie once its last thread has exited.
    pub(crate) fn teardown_process(&self, g: &mut KernelGuard<'_>, process: &Arc<Process>) {
        process.args.lock().take();

        let files = core::mem::take(&mut *process.files.lock());
        for file in files.into_iter().flatten() {
            file::decref(g, file);
        }

        let leftover = core::mem::take(&mut process.tg.lock().threads);
        debug!(
            "process {} released {} unjoined thread records",
            process.pid(),
            leftover.len()
        );
        drop(leftover);

        if !process.is_init() {
            if let Some(init) = g.procs.get(INIT_PID) {
                Self::reparent_children(process, &init);
            }
        }

        if let Some(parent) = process.parent() {
            parent.exited.lock().push_back(process.clone());
            parent.child_exit.broadcast();
        }

        process.is_zombie.store(true, Ordering::Release);
        info!(
            "process {} exited with status {}",
            process.pid(),
            process.exit_code()
        );

        if process.is_init() {
            self.notify_halt();
        }
    }

    /// Hands every child of `process`, and its list of unwaited zombies, to
    /// `init`.
    fn reparent_children(process: &Process, init: &Arc<Process>) {
        let children = core::mem::take(&mut *process.children.lock());
        let exited = core::mem::take(&mut *process.exited.lock());
        if children.is_empty() {
            return;
        }

        let reaper = Arc::downgrade(init);
        let mut init_children = init.children.lock();
        for (pid, child) in children {
            *child.parent.lock() = Some(reaper.clone());
            init_children.insert(pid, child);
        }
        drop(init_children);

        init.exited.lock().extend(exited);
        init.child_exit.broadcast();
        debug!("process {} children reparented to init", process.pid());
    }
}
