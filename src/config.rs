use crate::{KResult, KernelError, Port};

/// Default number of process slots.
pub const MAX_PROC: usize = 65536;
/// Default size of every process's descriptor table.
pub const MAX_FILEID: usize = 16;
/// Default number of descriptors open across the whole kernel.
pub const MAX_FILES: usize = 512;
/// Default pipe buffer size, in bytes.
pub const PIPE_BUFFER_SIZE: usize = 8 * 1024;
/// Default highest valid port.
pub const MAX_PORT: Port = 1023;

/// Kernel sizing parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    pub max_proc: usize,
    pub max_fileid: usize,
    pub max_files: usize,
    pub pipe_capacity: usize,
    pub max_port: Port,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_proc: MAX_PROC,
            max_fileid: MAX_FILEID,
            max_files: MAX_FILES,
            pipe_capacity: PIPE_BUFFER_SIZE,
            max_port: MAX_PORT,
        }
    }
}

impl KernelConfig {
    pub fn with_max_proc(mut self, max_proc: usize) -> Self {
        self.max_proc = max_proc;
        self
    }

    pub fn with_max_fileid(mut self, max_fileid: usize) -> Self {
        self.max_fileid = max_fileid;
        self
    }

    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }

    pub fn with_pipe_capacity(mut self, pipe_capacity: usize) -> Self {
        self.pipe_capacity = pipe_capacity;
        self
    }

    pub fn with_max_port(mut self, max_port: Port) -> Self {
        self.max_port = max_port;
        self
    }

    /// Checks that the configuration can host the idle and init processes
    /// and that pipes can hold at least one byte.
    pub fn validate(&self) -> KResult<()> {
        if self.max_proc < 2
            || self.max_fileid == 0
            || self.max_files == 0
            || self.pipe_capacity < 2
            || self.max_port == 0
        {
            return Err(KernelError::InvalidArgument);
        }
        Ok(())
    }

    pub(crate) fn port_in_range(&self, port: Port) -> bool {
        port != 0 && port <= self.max_port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert_eq!(KernelConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_unusable_sizes() {
        let base = KernelConfig::default();
        assert!(base.clone().with_max_proc(1).validate().is_err());
        assert!(base.clone().with_pipe_capacity(1).validate().is_err());
        assert!(base.clone().with_max_fileid(0).validate().is_err());
        assert!(base.with_max_port(0).validate().is_err());
    }

    #[test]
    fn port_zero_is_never_in_range() {
        let config = KernelConfig::default().with_max_port(8);
        assert!(!config.port_in_range(0));
        assert!(config.port_in_range(8));
        assert!(!config.port_in_range(9));
    }
}
