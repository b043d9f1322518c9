//! Descriptor layer.
//!
//! A [`File`] is a reference-counted kernel object bound to a stream object
//! that implements [`Stream`]. Processes refer to files through small
//! integer ids ([`Fid`]) in their own fixed-capacity table; the kernel keeps
//! a global budget of open files.

use alloc::{sync::Arc, vec, vec::Vec};
use core::{
    any::Any,
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use lazyinit::LazyInit;
use log::{trace, warn};

use crate::{Fid, KResult, KernelError, Process, kernel::KernelGuard};

/// Operation table of a stream object.
///
/// Every operation runs with the kernel monitor held and may wait on it.
pub(crate) trait Stream: Send + Sync {
    fn read(&self, g: &mut KernelGuard<'_>, buf: &mut [u8]) -> KResult<usize> {
        let _ = (g, buf);
        Err(KernelError::InvalidArgument)
    }

    fn write(&self, g: &mut KernelGuard<'_>, buf: &[u8]) -> KResult<usize> {
        let _ = (g, buf);
        Err(KernelError::InvalidArgument)
    }

    /// Called once, when the last reference to the file goes away.
    fn close(&self, g: &mut KernelGuard<'_>);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A descriptor object.
pub(crate) struct File {
    refcount: AtomicUsize,
    stream: LazyInit<Arc<dyn Stream>>,
}

impl File {
    fn new() -> Self {
        Self {
            refcount: AtomicUsize::new(1),
            stream: LazyInit::new(),
        }
    }

    /// Binds the stream object. Must be called exactly once, right after
    /// [`reserve`].
    pub fn install(&self, stream: Arc<dyn Stream>) {
        self.stream.init_once(stream);
    }

    pub fn stream(&self) -> KResult<&Arc<dyn Stream>> {
        self.stream.get().ok_or(KernelError::NotFound)
    }

    pub fn incref(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    pub fn read(&self, g: &mut KernelGuard<'_>, buf: &mut [u8]) -> KResult<usize> {
        self.stream()?.read(g, buf)
    }

    pub fn write(&self, g: &mut KernelGuard<'_>, buf: &[u8]) -> KResult<usize> {
        self.stream()?.write(g, buf)
    }
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File")
            .field("refcount", &self.refcount.load(Ordering::Acquire))
            .field("installed", &self.stream.is_inited())
            .finish()
    }
}

/// Drops one reference to `file`, closing its stream when it was the last.
pub(crate) fn decref(g: &mut KernelGuard<'_>, file: Arc<File>) {
    if file.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
        if let Some(stream) = file.stream.get() {
            stream.close(g);
        }
        g.files.open -= 1;
        trace!("file closed, {} open", g.files.open);
    }
}

/// Kernel-wide open file budget.
pub(crate) struct FileTable {
    pub(crate) open: usize,
    max: usize,
}

impl FileTable {
    pub fn new(max: usize) -> Self {
        Self { open: 0, max }
    }
}

/// A process's descriptor table.
pub(crate) type FidTable = Vec<Option<Arc<File>>>;

pub(crate) fn empty_fid_table(size: usize) -> FidTable {
    vec![None; size]
}

/// Reserves `n` descriptors in `process`, each holding one reference.
///
/// Fails without side effects if the process has fewer than `n` free ids or
/// the kernel is out of files.
pub(crate) fn reserve(
    g: &mut KernelGuard<'_>,
    process: &Process,
    n: usize,
) -> KResult<Vec<(Fid, Arc<File>)>> {
    if g.files.open + n > g.files.max {
        warn!("file table full ({} open)", g.files.open);
        return Err(KernelError::ResourceExhausted);
    }

    let mut table = process.files.lock();
    let free: Vec<Fid> = table
        .iter()
        .enumerate()
        .filter(|(_, slot)| slot.is_none())
        .map(|(fid, _)| fid)
        .take(n)
        .collect();
    if free.len() < n {
        warn!("process {} out of fids", process.pid());
        return Err(KernelError::ResourceExhausted);
    }

    let reserved = free
        .into_iter()
        .map(|fid| {
            let file = Arc::new(File::new());
            table[fid] = Some(file.clone());
            (fid, file)
        })
        .collect();
    g.files.open += n;
    trace!("process {} reserved {} fids", process.pid(), n);
    Ok(reserved)
}

/// Looks up descriptor `fid` of `process`.
pub(crate) fn lookup(process: &Process, fid: Fid) -> KResult<Arc<File>> {
    process
        .files
        .lock()
        .get(fid)
        .and_then(Option::clone)
        .ok_or(KernelError::NotFound)
}

/// Unbinds `fid` from `process` and drops its reference.
pub(crate) fn close(g: &mut KernelGuard<'_>, process: &Process, fid: Fid) -> KResult<()> {
    let file = process
        .files
        .lock()
        .get_mut(fid)
        .and_then(Option::take)
        .ok_or(KernelError::NotFound)?;
    decref(g, file);
    Ok(())
}
