//! Error types for lxdriver.

use thiserror::Error;

/// Result type alias using lxdriver's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in lxdriver operations.
#[derive(Error, Debug)]
pub enum Error {
    // Storage mapping errors
    /// A required host tool is missing.
    #[error("backend unavailable: {tool} not found on host")]
    BackendUnavailable {
        /// Name of the missing tool.
        tool: String,
    },

    /// No free loop/NBD slot is left on the host.
    #[error("device exhausted: no free {kind} device")]
    DeviceExhausted {
        /// Device kind (e.g. "loop", "nbd").
        kind: String,
    },

    /// No partition of a multi-partition disk yields a parseable fstab.
    #[error("no fstab found on any partition of {device}")]
    NoFstabFound {
        /// Device whose partitions were probed.
        device: String,
    },

    /// Filesystem kind not supported by the resize path.
    #[error("unsupported filesystem for resize: {kind}")]
    UnsupportedFilesystem {
        /// Filesystem kind as reported by the host.
        kind: String,
    },

    /// Disk type/driver combination with no mapper backend.
    #[error("unsupported disk backend: type {disk_type}, driver {driver}")]
    UnsupportedDisk {
        /// Descriptor TYPE field.
        disk_type: String,
        /// Descriptor DRIVER field.
        driver: String,
    },

    /// Generic mount failure.
    #[error("mount error: {0}")]
    Mount(String),

    // Container errors
    /// Override attempted on a running container.
    #[error("container conflict: {name} is already running")]
    ContainerConflict {
        /// Container name.
        name: String,
    },

    /// Container did not reach Running after start.
    #[error("container {name} failed to start: status {status}")]
    ContainerStartFailed {
        /// Container name.
        name: String,
        /// Status reported by the server after the start attempt.
        status: String,
    },

    /// Non-2xx or unexpected REST response.
    #[error("rest transport error ({code}): {message}")]
    RestTransport {
        /// Machine-readable error code from the server (HTTP-like).
        code: u16,
        /// Error message from the server.
        message: String,
    },

    /// Asynchronous server operation did not finish in time.
    #[error("operation timed out after {seconds}s")]
    WaitTimeout {
        /// Timeout that elapsed.
        seconds: u64,
    },

    // Descriptor errors
    /// Malformed or incomplete VM descriptor.
    #[error("descriptor error: {0}")]
    Descriptor(String),

    /// Disk id not present in the descriptor.
    #[error("disk not found in descriptor: disk.{0}")]
    DiskNotFound(u32),

    // Command execution errors
    /// External command failed.
    #[error("command failed: {command}: {message}")]
    CommandFailed {
        /// The command that failed.
        command: String,
        /// Error message.
        message: String,
    },

    // IO errors
    /// IO error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a backend-unavailable error for a missing tool.
    pub fn backend_unavailable(tool: impl Into<String>) -> Self {
        Self::BackendUnavailable { tool: tool.into() }
    }

    /// Create a device-exhausted error for a device kind.
    pub fn device_exhausted(kind: impl Into<String>) -> Self {
        Self::DeviceExhausted { kind: kind.into() }
    }

    /// Create a mount error with a message.
    pub fn mount(msg: impl Into<String>) -> Self {
        Self::Mount(msg.into())
    }

    /// Create a command failed error.
    pub fn command_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a REST transport error.
    pub fn rest(code: u16, message: impl Into<String>) -> Self {
        Self::RestTransport {
            code,
            message: message.into(),
        }
    }

    /// Create a descriptor error with a message.
    pub fn descriptor(msg: impl Into<String>) -> Self {
        Self::Descriptor(msg.into())
    }

    /// True if this is a not-found REST response.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::RestTransport { code: 404, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Error messages should identify the failing resource (container name,
    /// disk id, device path) so the driver's single diagnostic line is
    /// enough to act on.

    #[test]
    fn test_backend_unavailable_includes_tool() {
        let err = Error::backend_unavailable("qemu-nbd");
        assert!(err.to_string().contains("qemu-nbd"));
    }

    #[test]
    fn test_container_conflict_includes_name() {
        let err = Error::ContainerConflict {
            name: "one-42".to_string(),
        };
        assert!(err.to_string().contains("one-42"));
    }

    #[test]
    fn test_start_failed_includes_name_and_status() {
        let err = Error::ContainerStartFailed {
            name: "one-7".to_string(),
            status: "Stopped".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("one-7"), "message should name the container");
        assert!(msg.contains("Stopped"), "message should carry the status");
    }

    #[test]
    fn test_no_fstab_includes_device() {
        let err = Error::NoFstabFound {
            device: "/dev/loop3".to_string(),
        };
        assert!(err.to_string().contains("/dev/loop3"));
    }

    #[test]
    fn test_command_failed_includes_command_and_message() {
        let err = Error::command_failed("losetup", "no free loop device");
        let msg = err.to_string();
        assert!(msg.contains("losetup"));
        assert!(msg.contains("no free loop device"));
    }

    #[test]
    fn test_is_not_found_only_for_404() {
        assert!(Error::rest(404, "not found").is_not_found());
        assert!(!Error::rest(500, "boom").is_not_found());
        assert!(!Error::device_exhausted("nbd").is_not_found());
    }
}
