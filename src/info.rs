//! Process information stream.
//!
//! Reading the descriptor returned by [`open_info`](crate::syscall::open_info)
//! yields one fixed-size [`ProcInfo`] record per allocated process slot, in
//! pid order, and `0` once every slot has been visited.

use alloc::{sync::Arc, vec::Vec};
use core::any::Any;

use kspin::SpinNoIrq;

use crate::{
    Fid, KResult, Kernel, KernelError, Pid, Process,
    file::{self, Stream},
    kernel::KernelGuard,
};

/// Number of argument bytes carried in a record.
pub const PROCINFO_MAX_ARGS_SIZE: usize = 128;

/// Encoded size of a [`ProcInfo`] record.
///
/// Layout, little endian: pid `u32`, ppid `i32` (`-1` for none), alive
/// `u8`, thread count `u32`, argl `u32`, then
/// [`PROCINFO_MAX_ARGS_SIZE`] argument bytes, zero padded.
pub const PROCINFO_SIZE: usize = 4 + 4 + 1 + 4 + 4 + PROCINFO_MAX_ARGS_SIZE;

/// Snapshot of one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcInfo {
    pub pid: Pid,
    pub ppid: Option<Pid>,
    pub alive: bool,
    pub thread_count: usize,
    pub argl: usize,
    /// At most [`PROCINFO_MAX_ARGS_SIZE`] leading argument bytes.
    pub args: Vec<u8>,
}

impl ProcInfo {
    pub fn of(process: &Process) -> Self {
        let mut args = process.args().unwrap_or_default();
        args.truncate(PROCINFO_MAX_ARGS_SIZE);
        Self {
            pid: process.pid(),
            ppid: process.ppid(),
            alive: !process.is_zombie(),
            thread_count: process.thread_count(),
            argl: process.argl(),
            args,
        }
    }

    /// Writes the record into `buf`, which must hold [`PROCINFO_SIZE`]
    /// bytes.
    pub fn encode(&self, buf: &mut [u8]) -> KResult<usize> {
        let buf = buf
            .get_mut(..PROCINFO_SIZE)
            .ok_or(KernelError::InvalidArgument)?;
        buf.fill(0);
        let ppid = self.ppid.map_or(-1, |ppid| ppid as i32);
        buf[0..4].copy_from_slice(&self.pid.to_le_bytes());
        buf[4..8].copy_from_slice(&ppid.to_le_bytes());
        buf[8] = self.alive as u8;
        buf[9..13].copy_from_slice(&(self.thread_count as u32).to_le_bytes());
        buf[13..17].copy_from_slice(&(self.argl as u32).to_le_bytes());
        let args = &self.args[..self.args.len().min(PROCINFO_MAX_ARGS_SIZE)];
        buf[17..17 + args.len()].copy_from_slice(args);
        Ok(PROCINFO_SIZE)
    }

    /// Parses a record produced by [`encode`](Self::encode).
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let buf = buf.get(..PROCINFO_SIZE)?;
        let word = |at: usize| -> [u8; 4] { [buf[at], buf[at + 1], buf[at + 2], buf[at + 3]] };
        let ppid = i32::from_le_bytes(word(4));
        let argl = u32::from_le_bytes(word(13)) as usize;
        let carried = argl.min(PROCINFO_MAX_ARGS_SIZE);
        Some(Self {
            pid: u32::from_le_bytes(word(0)),
            ppid: (ppid >= 0).then_some(ppid as Pid),
            alive: buf[8] != 0,
            thread_count: u32::from_le_bytes(word(9)) as usize,
            argl,
            args: buf[17..17 + carried].to_vec(),
        })
    }
}

struct ProcInfoCursor {
    next: SpinNoIrq<usize>,
}

impl Stream for ProcInfoCursor {
    fn read(&self, g: &mut KernelGuard<'_>, buf: &mut [u8]) -> KResult<usize> {
        if buf.len() < PROCINFO_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        let mut next = self.next.lock();
        let Some((slot, process)) = g.procs.next_from(*next) else {
            *next = usize::MAX;
            return Ok(0);
        };
        *next = slot + 1;
        ProcInfo::of(process).encode(buf)
    }

    fn close(&self, _g: &mut KernelGuard<'_>) {}

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl Kernel {
    pub(crate) fn open_info(&self, g: &mut KernelGuard<'_>, process: &Process) -> KResult<Fid> {
        let reserved = file::reserve(g, process, 1)?;
        let (fid, file) = &reserved[0];
        file.install(Arc::new(ProcInfoCursor {
            next: SpinNoIrq::new(0),
        }));
        Ok(*fid)
    }
}
