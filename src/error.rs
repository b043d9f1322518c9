use thiserror::Error;

/// Result type of every fallible kernel operation.
pub type KResult<T> = Result<T, KernelError>;

/// Recoverable kernel errors.
///
/// None of these abort the kernel; they are returned to the caller in place
/// of the identifier or value the operation would otherwise produce.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// No free process slot, descriptor or native thread.
    #[error("resource exhausted")]
    ResourceExhausted,
    /// Bad port, self-join, wrong socket variant, or a stream operation the
    /// descriptor does not support.
    #[error("invalid argument")]
    InvalidArgument,
    /// No such process, thread or descriptor.
    #[error("not found")]
    NotFound,
    /// Accept on a non-listener, connect to a port without a listener, or
    /// listen on an occupied port.
    #[error("protocol violation")]
    ProtocolViolation,
    /// A connect deadline elapsed before the request was admitted.
    #[error("timed out")]
    Timeout,
    /// The other end of a pipe or socket is closed.
    #[error("broken pipe")]
    BrokenPipe,
    /// A system call was issued from a thread the kernel did not spawn.
    #[error("not running on a kernel thread")]
    NoContext,
}
