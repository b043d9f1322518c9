//! System calls.
//!
//! Every call acts on behalf of the calling kernel thread and fails with
//! [`KernelError::NoContext`](crate::KernelError::NoContext) on a thread the
//! kernel did not spawn.

use core::time::Duration;

use crate::{
    Fid, KResult, Pid, Port, ShutdownMode, Task, Tid, file,
    sched::{self, Context},
};

/// Descriptor pair returned by [`pipe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeFids {
    pub read: Fid,
    pub write: Fid,
}

fn context() -> Context {
    sched::current().expect("system call issued outside of a kernel thread")
}

/// Creates a child process running `task` with a copy of `args`.
pub fn exec(task: Task, args: &[u8]) -> KResult<Pid> {
    let ctx = sched::current()?;
    let mut g = ctx.kernel.lock();
    ctx.kernel
        .create_process(&mut g, Some(ctx.process()), Some(task), args)
}

pub fn get_pid() -> KResult<Pid> {
    Ok(sched::current()?.process().pid())
}

/// The parent's pid, `None` for the idle and init processes.
pub fn get_ppid() -> KResult<Option<Pid>> {
    let ctx = sched::current()?;
    let _g = ctx.kernel.lock();
    Ok(ctx.process().ppid())
}

/// Waits for child `pid`, or for any child with `None`, and returns its pid
/// and exit status.
pub fn wait_child(pid: Option<Pid>) -> KResult<(Pid, i32)> {
    let ctx = sched::current()?;
    let mut g = ctx.kernel.lock();
    ctx.kernel.wait_child(&mut g, ctx.process(), pid)
}

/// Sets the process exit status and ends the calling thread.
///
/// # Panics
///
/// Panics if called from a thread the kernel did not spawn.
pub fn exit(status: i32) -> ! {
    let ctx = context();
    {
        let mut g = ctx.kernel.lock();
        ctx.process().set_exit_code(status);
        ctx.kernel.exit_thread(&mut g, &ctx.thread, status);
    }
    drop(ctx);
    sched::exit_current()
}

/// Starts a new thread of the calling process.
pub fn create_thread(task: Task, args: &[u8]) -> KResult<Tid> {
    let ctx = sched::current()?;
    let _g = ctx.kernel.lock();
    ctx.kernel.spawn_thread(ctx.process(), task, args, false)
}

pub fn thread_self() -> KResult<Tid> {
    Ok(sched::current()?.thread.tid())
}

/// Waits for thread `tid` to exit and returns its exit status.
pub fn thread_join(tid: Tid) -> KResult<i32> {
    let ctx = sched::current()?;
    let mut g = ctx.kernel.lock();
    ctx.kernel.join_thread(&mut g, &ctx.thread, tid)
}

pub fn thread_detach(tid: Tid) -> KResult<()> {
    let ctx = sched::current()?;
    let _g = ctx.kernel.lock();
    ctx.kernel.detach_thread(&ctx.thread, tid)
}

/// Ends the calling thread with `status`.
///
/// # Panics
///
/// Panics if called from a thread the kernel did not spawn.
pub fn thread_exit(status: i32) -> ! {
    let ctx = context();
    {
        let mut g = ctx.kernel.lock();
        ctx.kernel.exit_thread(&mut g, &ctx.thread, status);
    }
    drop(ctx);
    sched::exit_current()
}

pub fn pipe() -> KResult<PipeFids> {
    let ctx = sched::current()?;
    let mut g = ctx.kernel.lock();
    ctx.kernel.create_pipe(&mut g, ctx.process())
}

/// Creates an unbound socket on `port`, or a client-only one with `None`.
pub fn socket(port: Option<Port>) -> KResult<Fid> {
    let ctx = sched::current()?;
    let mut g = ctx.kernel.lock();
    ctx.kernel.create_socket(&mut g, ctx.process(), port)
}

pub fn listen(sock: Fid) -> KResult<()> {
    let ctx = sched::current()?;
    let mut g = ctx.kernel.lock();
    ctx.kernel.listen(&mut g, ctx.process(), sock)
}

pub fn accept(listener: Fid) -> KResult<Fid> {
    let ctx = sched::current()?;
    let mut g = ctx.kernel.lock();
    ctx.kernel.accept(&mut g, ctx.process(), listener)
}

/// Connects `sock` to the listener on `port`, waiting at most `timeout`
/// (`None` waits forever).
pub fn connect(sock: Fid, port: Port, timeout: Option<Duration>) -> KResult<()> {
    let ctx = sched::current()?;
    let mut g = ctx.kernel.lock();
    ctx.kernel.connect(&mut g, ctx.process(), sock, port, timeout)
}

pub fn shutdown(sock: Fid, mode: ShutdownMode) -> KResult<()> {
    let ctx = sched::current()?;
    let _g = ctx.kernel.lock();
    ctx.kernel.shutdown(ctx.process(), sock, mode)
}

/// Reads from a descriptor. `Ok(0)` means end of stream.
pub fn read(fid: Fid, buf: &mut [u8]) -> KResult<usize> {
    let ctx = sched::current()?;
    let mut g = ctx.kernel.lock();
    let file = file::lookup(ctx.process(), fid)?;
    file.incref();
    let result = file.read(&mut g, buf);
    file::decref(&mut g, file);
    result
}

pub fn write(fid: Fid, buf: &[u8]) -> KResult<usize> {
    let ctx = sched::current()?;
    let mut g = ctx.kernel.lock();
    let file = file::lookup(ctx.process(), fid)?;
    file.incref();
    let result = file.write(&mut g, buf);
    file::decref(&mut g, file);
    result
}

pub fn close(fid: Fid) -> KResult<()> {
    let ctx = sched::current()?;
    let mut g = ctx.kernel.lock();
    file::close(&mut g, ctx.process(), fid)
}

/// Opens a stream of [`ProcInfo`](crate::ProcInfo) records.
pub fn open_info() -> KResult<Fid> {
    let ctx = sched::current()?;
    let mut g = ctx.kernel.lock();
    ctx.kernel.open_info(&mut g, ctx.process())
}
