//! Bounded byte pipes.

use alloc::{boxed::Box, sync::Arc, vec};
use core::{any::Any, fmt};

use kspin::SpinNoIrq;
use log::trace;

use crate::{
    KResult, Kernel, KernelError, Process,
    file::{self, Stream},
    kernel::KernelGuard,
    sched::CondVar,
    syscall::PipeFids,
};

/// Circular byte buffer with open flags for both ends.
///
/// One slot is always kept free, so a buffer of capacity `C` holds at most
/// `C - 1` bytes.
struct Ring {
    buf: Box<[u8]>,
    r_pos: usize,
    w_pos: usize,
    reader_open: bool,
    writer_open: bool,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity].into_boxed_slice(),
            r_pos: 0,
            w_pos: 0,
            reader_open: true,
            writer_open: true,
        }
    }

    fn is_empty(&self) -> bool {
        self.r_pos == self.w_pos
    }

    fn is_full(&self) -> bool {
        (self.w_pos + 1) % self.buf.len() == self.r_pos
    }

    fn push(&mut self, byte: u8) -> bool {
        if self.is_full() {
            return false;
        }
        self.buf[self.w_pos] = byte;
        self.w_pos = (self.w_pos + 1) % self.buf.len();
        true
    }

    fn pop(&mut self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }
        let byte = self.buf[self.r_pos];
        self.r_pos = (self.r_pos + 1) % self.buf.len();
        Some(byte)
    }
}

/// A unidirectional byte stream between a reader and a writer.
pub(crate) struct Pipe {
    ring: SpinNoIrq<Ring>,
    has_data: CondVar,
    has_space: CondVar,
}

impl Pipe {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: SpinNoIrq::new(Ring::new(capacity)),
            has_data: CondVar::new(),
            has_space: CondVar::new(),
        }
    }

    /// Reads exactly `buf.len()` bytes, unless the writer goes away first.
    ///
    /// Returns `Ok(0)` at end of stream.
    pub fn read(&self, g: &mut KernelGuard<'_>, buf: &mut [u8]) -> KResult<usize> {
        {
            let ring = self.ring.lock();
            if !ring.reader_open {
                return Err(KernelError::BrokenPipe);
            }
            if ring.is_empty() && !ring.writer_open {
                return Ok(0);
            }
        }

        let mut count = 0;
        while count < buf.len() {
            let mut ring = self.ring.lock();
            while count < buf.len() {
                match ring.pop() {
                    Some(byte) => {
                        buf[count] = byte;
                        count += 1;
                    }
                    None => break,
                }
            }
            if count == buf.len() || !ring.writer_open || !ring.reader_open {
                break;
            }
            drop(ring);
            self.has_space.broadcast();
            g.wait(&self.has_data);
        }

        self.has_space.broadcast();
        Ok(count)
    }

    /// Writes all of `buf`, unless either end goes away first.
    pub fn write(&self, g: &mut KernelGuard<'_>, buf: &[u8]) -> KResult<usize> {
        {
            let ring = self.ring.lock();
            if !ring.reader_open || !ring.writer_open {
                return Err(KernelError::BrokenPipe);
            }
        }

        let mut count = 0;
        while count < buf.len() {
            let mut ring = self.ring.lock();
            while count < buf.len() && ring.push(buf[count]) {
                count += 1;
            }
            if count == buf.len() || !ring.writer_open || !ring.reader_open {
                break;
            }
            drop(ring);
            self.has_data.broadcast();
            g.wait(&self.has_space);
        }

        self.has_data.broadcast();
        Ok(count)
    }

    pub fn close_read(&self) {
        self.ring.lock().reader_open = false;
        trace!("pipe read end closed");
        self.has_space.broadcast();
    }

    pub fn close_write(&self) {
        self.ring.lock().writer_open = false;
        trace!("pipe write end closed");
        self.has_data.broadcast();
    }
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ring = self.ring.lock();
        f.debug_struct("Pipe")
            .field("r_pos", &ring.r_pos)
            .field("w_pos", &ring.w_pos)
            .field("reader_open", &ring.reader_open)
            .field("writer_open", &ring.writer_open)
            .finish()
    }
}

/// Read end of a pipe, as installed in a descriptor.
struct PipeReader(Arc<Pipe>);

impl Stream for PipeReader {
    fn read(&self, g: &mut KernelGuard<'_>, buf: &mut [u8]) -> KResult<usize> {
        self.0.read(g, buf)
    }

    fn close(&self, _g: &mut KernelGuard<'_>) {
        self.0.close_read();
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Write end of a pipe, as installed in a descriptor.
struct PipeWriter(Arc<Pipe>);

impl Stream for PipeWriter {
    fn write(&self, g: &mut KernelGuard<'_>, buf: &[u8]) -> KResult<usize> {
        self.0.write(g, buf)
    }

    fn close(&self, _g: &mut KernelGuard<'_>) {
        self.0.close_write();
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl Kernel {
    /// Creates a pipe and binds its two ends to new descriptors of
    /// `process`.
    pub(crate) fn create_pipe(
        &self,
        g: &mut KernelGuard<'_>,
        process: &Process,
    ) -> KResult<PipeFids> {
        let reserved = file::reserve(g, process, 2)?;
        let pipe = Arc::new(Pipe::new(self.config().pipe_capacity));
        let (read, reader) = &reserved[0];
        let (write, writer) = &reserved[1];
        reader.install(Arc::new(PipeReader(pipe.clone())));
        writer.install(Arc::new(PipeWriter(pipe)));
        trace!("pipe created, fids {} -> {}", write, read);
        Ok(PipeFids {
            read: *read,
            write: *write,
        })
    }
}
