use alloc::sync::{Arc, Weak};
use core::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};

use log::info;
use weak_map::WeakMap;

use crate::{
    INIT_PID, KResult, KernelConfig, Pid, Port, Process, Task, Tid,
    file::FileTable,
    process::ProcessTable,
    sched::{CondVar, Monitor, MonitorGuard},
    socket::Socket,
};

/// State guarded by the kernel monitor.
pub(crate) struct KernelState {
    pub(crate) procs: ProcessTable,
    pub(crate) files: FileTable,
    /// Registered listeners. Weak so that the table never keeps a socket
    /// alive on its own.
    pub(crate) ports: WeakMap<Port, Weak<Socket>>,
}

pub(crate) type KernelGuard<'a> = MonitorGuard<'a, KernelState>;

/// A kernel instance: process table, descriptor budget and port table, all
/// behind one monitor.
pub struct Kernel {
    config: KernelConfig,
    state: Monitor<KernelState>,
    next_tid: AtomicU32,
    halted: CondVar,
}

impl Kernel {
    /// Creates the idle process (pid 0) and the init process (pid 1), which
    /// starts running `init` right away.
    pub fn boot(config: KernelConfig, init: Task, args: &[u8]) -> KResult<Arc<Kernel>> {
        config.validate()?;
        let kernel = Arc::new(Kernel {
            state: Monitor::new(KernelState {
                procs: ProcessTable::new(config.max_proc),
                files: FileTable::new(config.max_files),
                ports: WeakMap::new(),
            }),
            config,
            next_tid: AtomicU32::new(1),
            halted: CondVar::new(),
        });

        let mut g = kernel.lock();
        let idle = kernel.create_process(&mut g, None, None, &[])?;
        let init = kernel.create_process(&mut g, None, Some(init), args)?;
        debug_assert_eq!((idle, init), (crate::IDLE_PID, INIT_PID));
        info!("kernel booted");
        drop(g);
        Ok(kernel)
    }

    /// Blocks the calling (host) thread until the init process has exited,
    /// and returns its exit status.
    pub fn wait_halt(&self) -> i32 {
        let mut g = self.lock();
        loop {
            if let Some(init) = g.procs.get(INIT_PID) {
                if init.is_zombie() {
                    info!("kernel halted with status {}", init.exit_code());
                    return init.exit_code();
                }
            }
            g.wait(&self.halted);
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// The process in slot `pid`, if the slot is not free.
    pub fn get_process(&self, pid: Pid) -> Option<Arc<Process>> {
        self.lock().procs.get(pid)
    }

    /// Number of allocated (alive or zombie) process slots.
    pub fn process_count(&self) -> usize {
        self.lock().procs.count()
    }

    pub(crate) fn lock(&self) -> KernelGuard<'_> {
        self.state.lock()
    }

    pub(crate) fn alloc_tid(&self) -> Tid {
        self.next_tid.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn notify_halt(&self) {
        self.halted.broadcast();
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("config", &self.config)
            .field("next_tid", &self.next_tid.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
