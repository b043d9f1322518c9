//! Rendezvous sockets.
//!
//! A socket starts out unbound. It either becomes a listener registered on
//! its port, or a peer of a freshly minted socket once a listener accepts a
//! connection request from it. A connected pair talks through two pipes
//! wired crosswise.

use alloc::{
    collections::VecDeque,
    sync::{Arc, Weak},
};
use core::{any::Any, fmt, time::Duration};

use kspin::SpinNoIrq;
use log::{debug, info, trace};
use weak_map::WeakMap;

use crate::{
    Fid, KResult, Kernel, KernelError, Port, Process,
    file::{self, Stream},
    kernel::KernelGuard,
    pipe::Pipe,
    sched::{CondVar, Deadline},
};

/// Which directions [`shutdown`](crate::syscall::shutdown) closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    Read = 1,
    Write = 2,
    Both = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Pending,
    Admitted,
    Rejected,
}

/// A pending connect, queued on a listener.
struct ConnRequest {
    socket: Arc<Socket>,
    admission: SpinNoIrq<Admission>,
    connected: CondVar,
}

impl ConnRequest {
    fn settle(&self, admission: Admission) {
        *self.admission.lock() = admission;
        self.connected.broadcast();
    }
}

struct Listener {
    queue: VecDeque<Arc<ConnRequest>>,
    req_available: Arc<CondVar>,
}

struct Peer {
    partner: Weak<Socket>,
    read_pipe: Option<Arc<Pipe>>,
    write_pipe: Option<Arc<Pipe>>,
}

impl Peer {
    fn shutdown(&mut self, mode: ShutdownMode) {
        if matches!(mode, ShutdownMode::Read | ShutdownMode::Both) {
            if let Some(pipe) = self.read_pipe.take() {
                pipe.close_read();
            }
        }
        if matches!(mode, ShutdownMode::Write | ShutdownMode::Both) {
            if let Some(pipe) = self.write_pipe.take() {
                pipe.close_write();
            }
        }
        if mode == ShutdownMode::Both {
            self.partner = Weak::new();
        }
    }
}

enum SocketKind {
    Unbound,
    Listener(Listener),
    Peer(Peer),
    Closed,
}

impl SocketKind {
    fn name(&self) -> &'static str {
        match self {
            SocketKind::Unbound => "unbound",
            SocketKind::Listener(_) => "listener",
            SocketKind::Peer(_) => "peer",
            SocketKind::Closed => "closed",
        }
    }
}

pub(crate) struct Socket {
    port: Option<Port>,
    kind: SpinNoIrq<SocketKind>,
}

impl Socket {
    fn new(port: Option<Port>) -> Self {
        Self {
            port,
            kind: SpinNoIrq::new(SocketKind::Unbound),
        }
    }

    /// Returns `true` if `self` is the listener registered on its port.
    fn is_registered(self: &Arc<Self>, ports: &WeakMap<Port, Weak<Socket>>) -> bool {
        self.port
            .and_then(|port| ports.get(&port))
            .is_some_and(|listener| Arc::ptr_eq(&listener, self))
    }

    fn pipe(&self, read: bool) -> KResult<Arc<Pipe>> {
        match &*self.kind.lock() {
            SocketKind::Peer(peer) => {
                let pipe = if read { &peer.read_pipe } else { &peer.write_pipe };
                pipe.clone().ok_or(KernelError::BrokenPipe)
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.kind.lock();
        let mut builder = f.debug_struct("Socket");
        builder.field("port", &self.port).field("kind", &kind.name());
        match &*kind {
            SocketKind::Listener(listener) => {
                builder.field("pending", &listener.queue.len());
            }
            SocketKind::Peer(peer) => {
                builder.field("partner_alive", &(peer.partner.strong_count() > 0));
            }
            _ => {}
        }
        builder.finish()
    }
}

impl Stream for Socket {
    fn read(&self, g: &mut KernelGuard<'_>, buf: &mut [u8]) -> KResult<usize> {
        self.pipe(true)?.read(g, buf)
    }

    fn write(&self, g: &mut KernelGuard<'_>, buf: &[u8]) -> KResult<usize> {
        self.pipe(false)?.write(g, buf)
    }

    fn close(&self, g: &mut KernelGuard<'_>) {
        let kind = core::mem::replace(&mut *self.kind.lock(), SocketKind::Closed);
        match kind {
            SocketKind::Unbound | SocketKind::Closed => {}
            SocketKind::Listener(listener) => {
                if let Some(port) = self.port {
                    g.ports.remove(&port);
                    info!("port {} released", port);
                }
                for request in listener.queue {
                    request.settle(Admission::Rejected);
                }
                listener.req_available.broadcast();
            }
            SocketKind::Peer(mut peer) => {
                trace!(
                    "closing peer on port {:?}, partner alive: {}",
                    self.port,
                    peer.partner.strong_count() > 0
                );
                peer.shutdown(ShutdownMode::Both);
            }
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// The socket bound to descriptor `fid` of `process`.
fn socket_of(process: &Process, fid: Fid) -> KResult<Arc<Socket>> {
    let file = file::lookup(process, fid)?;
    file.stream()?
        .clone()
        .into_any()
        .downcast::<Socket>()
        .map_err(|_| KernelError::InvalidArgument)
}

impl Kernel {
    /// Creates an unbound socket. `None` makes a client-only socket.
    pub(crate) fn create_socket(
        &self,
        g: &mut KernelGuard<'_>,
        process: &Process,
        port: Option<Port>,
    ) -> KResult<Fid> {
        if port.is_some_and(|port| !self.config().port_in_range(port)) {
            return Err(KernelError::InvalidArgument);
        }
        let reserved = file::reserve(g, process, 1)?;
        let (fid, file) = &reserved[0];
        file.install(Arc::new(Socket::new(port)));
        trace!("socket {} created on port {:?}", fid, port);
        Ok(*fid)
    }

    /// Registers the socket as the listener of its port.
    pub(crate) fn listen(&self, g: &mut KernelGuard<'_>, process: &Process, fid: Fid) -> KResult<()> {
        let socket = socket_of(process, fid)?;
        let port = socket.port.ok_or(KernelError::InvalidArgument)?;
        let mut kind = socket.kind.lock();
        if !matches!(*kind, SocketKind::Unbound) {
            return Err(KernelError::InvalidArgument);
        }
        if g.ports.get(&port).is_some() {
            return Err(KernelError::ProtocolViolation);
        }

        g.ports.insert(port, &socket);
        *kind = SocketKind::Listener(Listener {
            queue: VecDeque::new(),
            req_available: Arc::new(CondVar::new()),
        });
        info!("listening on port {}", port);
        Ok(())
    }

    /// Admits the oldest pending connection request and returns the
    /// descriptor of a new socket connected to the requester.
    pub(crate) fn accept(
        &self,
        g: &mut KernelGuard<'_>,
        process: &Process,
        fid: Fid,
    ) -> KResult<Fid> {
        // Held across the waits below so a concurrent close cannot free it.
        let listener = socket_of(process, fid)?;
        if !matches!(*listener.kind.lock(), SocketKind::Listener(_))
            || !listener.is_registered(&g.ports)
        {
            return Err(KernelError::ProtocolViolation);
        }

        loop {
            let request = loop {
                let mut kind = listener.kind.lock();
                let SocketKind::Listener(state) = &mut *kind else {
                    return Err(KernelError::BrokenPipe);
                };
                if let Some(request) = state.queue.pop_front() {
                    break request;
                }
                let req_available = state.req_available.clone();
                drop(kind);
                if !listener.is_registered(&g.ports) {
                    return Err(KernelError::BrokenPipe);
                }
                g.wait(&req_available);
            };

            // The requester may have closed its socket while queued.
            if !matches!(*request.socket.kind.lock(), SocketKind::Unbound) {
                request.settle(Admission::Rejected);
                continue;
            }

            let reserved = match file::reserve(g, process, 1) {
                Ok(reserved) => reserved,
                Err(err) => {
                    // Put it back for another accepter.
                    if let SocketKind::Listener(state) = &mut *listener.kind.lock() {
                        state.queue.push_front(request);
                        state.req_available.broadcast();
                    }
                    return Err(err);
                }
            };
            let (peer_fid, file) = &reserved[0];

            let local = Arc::new(Socket::new(listener.port));
            self.connect_pair(&local, &request.socket);
            file.install(local);
            request.settle(Admission::Admitted);
            debug!("port {:?} accepted connection as fid {}", listener.port, peer_fid);
            return Ok(*peer_fid);
        }
    }

    /// Turns `local` and `remote` into peers of each other.
    fn connect_pair(&self, local: &Arc<Socket>, remote: &Arc<Socket>) {
        let capacity = self.config().pipe_capacity;
        let to_remote = Arc::new(Pipe::new(capacity));
        let to_local = Arc::new(Pipe::new(capacity));

        *local.kind.lock() = SocketKind::Peer(Peer {
            partner: Arc::downgrade(remote),
            read_pipe: Some(to_local.clone()),
            write_pipe: Some(to_remote.clone()),
        });
        *remote.kind.lock() = SocketKind::Peer(Peer {
            partner: Arc::downgrade(local),
            read_pipe: Some(to_remote),
            write_pipe: Some(to_local),
        });
    }

    /// Queues a connection request on the listener of `port` and waits for
    /// it to be accepted.
    ///
    /// `timeout` of `None` waits forever.
    pub(crate) fn connect(
        &self,
        g: &mut KernelGuard<'_>,
        process: &Process,
        fid: Fid,
        port: Port,
        timeout: Option<Duration>,
    ) -> KResult<()> {
        let socket = socket_of(process, fid)?;
        if !self.config().port_in_range(port)
            || !matches!(*socket.kind.lock(), SocketKind::Unbound)
        {
            return Err(KernelError::InvalidArgument);
        }
        let listener = g.ports.get(&port).ok_or(KernelError::ProtocolViolation)?;

        let deadline = Deadline::after(timeout);
        let request = Arc::new(ConnRequest {
            socket: socket.clone(),
            admission: SpinNoIrq::new(Admission::Pending),
            connected: CondVar::new(),
        });
        match &mut *listener.kind.lock() {
            SocketKind::Listener(state) => {
                state.queue.push_back(request.clone());
                state.req_available.signal();
            }
            _ => return Err(KernelError::ProtocolViolation),
        }
        trace!("connect request queued on port {}", port);

        while *request.admission.lock() == Admission::Pending && !deadline.expired() {
            g.wait_until(&request.connected, deadline);
        }

        let admission = *request.admission.lock();
        match admission {
            Admission::Admitted => {
                debug!("connected to port {}", port);
                Ok(())
            }
            Admission::Rejected => Err(KernelError::BrokenPipe),
            Admission::Pending => {
                if let SocketKind::Listener(state) = &mut *listener.kind.lock() {
                    state.queue.retain(|r| !Arc::ptr_eq(r, &request));
                }
                debug!("connect to port {} timed out", port);
                Err(KernelError::Timeout)
            }
        }
    }

    /// Closes one or both directions of a connected socket.
    pub(crate) fn shutdown(&self, process: &Process, fid: Fid, mode: ShutdownMode) -> KResult<()> {
        let socket = socket_of(process, fid)?;
        match &mut *socket.kind.lock() {
            SocketKind::Peer(peer) => {
                peer.shutdown(mode);
                trace!("socket {} shut down {:?}", fid, mode);
                Ok(())
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }
}

#[cfg(test)]
impl Kernel {
    /// Number of requests queued on the listener of `port`.
    pub(crate) fn pending_requests(&self, port: Port) -> Option<usize> {
        let g = self.lock();
        let listener = g.ports.get(&port)?;
        match &*listener.kind.lock() {
            SocketKind::Listener(state) => Some(state.queue.len()),
            _ => None,
        }
    }
}
