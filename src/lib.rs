//! Process, thread and IPC core of a small teaching kernel.
//!
//! All kernel state sits behind a single monitor: every operation runs with
//! it held, and releases it only while waiting on a condition variable.
//! Processes own threads and descriptors; pipes and sockets are reached
//! through descriptors. The upward interface is in [`syscall`].

extern crate alloc;

mod config;
mod error;
mod file;
mod info;
mod kernel;
mod pipe;
mod process;
mod sched;
mod socket;
pub mod syscall;
mod thread;

/// A process ID, the index of the process's slot in the process table.
pub type Pid = u32;
/// A thread ID, unique for the lifetime of a [`Kernel`].
pub type Tid = u32;
/// A descriptor ID, an index into the owning process's descriptor table.
pub type Fid = usize;
/// A socket port.
pub type Port = u16;

/// Pid of the idle process.
pub const IDLE_PID: Pid = 0;
/// Pid of the init process, which adopts every orphan.
pub const INIT_PID: Pid = 1;

pub use config::*;
pub use error::*;
pub use info::{PROCINFO_MAX_ARGS_SIZE, PROCINFO_SIZE, ProcInfo};
pub use kernel::Kernel;
pub use process::Process;
pub use socket::ShutdownMode;
pub use thread::{TASK_PANICKED, Task, Thread};
