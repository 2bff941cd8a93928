//! Error types for keel
//!
//! Errors are structured with fields to aid debugging in production. Every
//! variant carries a stable kind code, the affected host(s) where one exists,
//! and enough context for a short remediation hint. Remote command stderr is
//! truncated before it is stored so a misbehaving host cannot flood logs.

use std::net::IpAddr;

use thiserror::Error;

/// Maximum bytes of remote stderr kept on an exec failure
pub const MAX_STDERR_BYTES: usize = 4096;

fn host_suffix(host: &Option<IpAddr>) -> String {
    host.map(|h| format!(" on {h}")).unwrap_or_default()
}

/// Main error type for keel operations
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid cluster description or request (missing fields, duplicate IPs,
    /// deleting master0, deleting the last master)
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with the invalid request
        cluster: String,
        /// Description of what's invalid
        message: String,
    },

    /// Host did not answer on TCP/SSH
    #[error("host {host} unreachable: {message}")]
    Unreachable {
        /// The host that could not be reached
        host: IpAddr,
        /// Underlying connection failure
        message: String,
    },

    /// SSH credentials rejected by the host
    #[error("authentication failed for {user}@{host}: {message}")]
    Auth {
        /// The host that rejected the credentials
        host: IpAddr,
        /// User the connection was attempted as
        user: String,
        /// Rejection detail from the SSH layer
        message: String,
    },

    /// Remote command exited nonzero on a must-succeed step
    #[error("command failed on {host} (exit {exit}): {command}")]
    Exec {
        /// The host the command ran on
        host: IpAddr,
        /// The command that failed
        command: String,
        /// Remote exit code
        exit: i32,
        /// Remote stderr, truncated to [`MAX_STDERR_BYTES`]
        stderr: String,
    },

    /// A remote command or a whole lifecycle operation exceeded its deadline
    #[error("{operation} timed out after {seconds}s{}", host_suffix(.host))]
    Timeout {
        /// The host involved, when the timeout was per-command
        host: Option<IpAddr>,
        /// What timed out (command or operation name)
        operation: String,
        /// The deadline that was exceeded
        seconds: u64,
    },

    /// The cluster image (or its manifest) is not present where expected
    #[error("cluster image missing: {image}: {message}")]
    ImageMissing {
        /// Image reference or path
        image: String,
        /// What exactly was not found
        message: String,
    },

    /// The image does not advertise the cluster's platform
    #[error("image {image} does not support platform {wanted} (advertises {advertised})")]
    PlatformMismatch {
        /// Image reference or path
        image: String,
        /// Platform the cluster requires
        wanted: String,
        /// Platforms the image manifest advertises
        advertised: String,
    },

    /// The in-cluster registry could not be deployed or is not reachable
    #[error("registry deploy failed on {host}: {message}")]
    RegistryDeploy {
        /// The host the registry was being deployed on
        host: IpAddr,
        /// What failed
        message: String,
    },

    /// Operation requires a previously initialized cluster
    #[error("cluster {cluster} is not initialized")]
    NotInitialized {
        /// The cluster that has no metadata on master0
        cluster: String,
    },

    /// Another lifecycle operation holds the cluster lock
    #[error("cluster {cluster} is busy: lock held by pid {holder}")]
    Busy {
        /// The locked cluster
        cluster: String,
        /// Pid recorded in the lock file
        holder: String,
    },

    /// The operation was cancelled; propagated unchanged, never wrapped
    #[error("operation cancelled")]
    Cancelled,

    /// Some hosts succeeded and some failed within one phase
    #[error("partial failure: {} host(s) failed, {} succeeded", .failed.len(), .succeeded.len())]
    Partial {
        /// Hosts that completed the phase
        succeeded: Vec<IpAddr>,
        /// Hosts that failed, with the failure message for each
        failed: Vec<(IpAddr, String)>,
    },

    /// Local filesystem failure on the controller
    #[error("io error [{context}]: {source}")]
    Io {
        /// What the controller was doing
        context: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// JSON/YAML processing failed
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a validation error with cluster context
    pub fn validation(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create an unreachable-host error
    pub fn unreachable(host: IpAddr, msg: impl Into<String>) -> Self {
        Self::Unreachable {
            host,
            message: msg.into(),
        }
    }

    /// Create an authentication error
    pub fn auth(host: IpAddr, user: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Auth {
            host,
            user: user.into(),
            message: msg.into(),
        }
    }

    /// Create an exec error, truncating stderr to [`MAX_STDERR_BYTES`]
    pub fn exec(host: IpAddr, command: impl Into<String>, exit: i32, stderr: &[u8]) -> Self {
        let kept = &stderr[..stderr.len().min(MAX_STDERR_BYTES)];
        Self::Exec {
            host,
            command: command.into(),
            exit,
            stderr: String::from_utf8_lossy(kept).into_owned(),
        }
    }

    /// Create a per-command timeout error
    pub fn command_timeout(host: IpAddr, command: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout {
            host: Some(host),
            operation: command.into(),
            seconds,
        }
    }

    /// Create an operation-level timeout error
    pub fn operation_timeout(operation: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout {
            host: None,
            operation: operation.into(),
            seconds,
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an io error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Stable kind code for this error, suitable for matching by callers
    /// and for structured log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "E_VALIDATION",
            Error::Unreachable { .. } => "E_UNREACHABLE",
            Error::Auth { .. } => "E_AUTH",
            Error::Exec { .. } => "E_EXEC",
            Error::Timeout { .. } => "E_TIMEOUT",
            Error::ImageMissing { .. } => "E_IMAGE_MISSING",
            Error::PlatformMismatch { .. } => "E_PLATFORM",
            Error::RegistryDeploy { .. } => "E_REGISTRY",
            Error::NotInitialized { .. } => "E_NOT_INITIALIZED",
            Error::Busy { .. } => "E_BUSY",
            Error::Cancelled => "E_CANCELLED",
            Error::Partial { .. } => "E_PARTIAL",
            Error::Io { .. } => "E_IO",
            Error::Serialization { .. } => "E_SERIALIZATION",
        }
    }

    /// Process exit code when this error terminates the CLI
    ///
    /// 1 validation/local, 2 partial (some hosts succeeded), 3 fatal
    /// (master0 or registry failure, bad image), 4 cancelled.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Partial { .. } => 2,
            Error::ImageMissing { .. }
            | Error::PlatformMismatch { .. }
            | Error::RegistryDeploy { .. } => 3,
            Error::Cancelled => 4,
            _ => 1,
        }
    }

    /// Whether a caller may reasonably retry the operation
    ///
    /// Validation, auth, and busy errors require the user to change
    /// something first; transient transport failures do not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Validation { .. }
            | Error::Auth { .. }
            | Error::ImageMissing { .. }
            | Error::PlatformMismatch { .. }
            | Error::NotInitialized { .. }
            | Error::Serialization { .. }
            | Error::Cancelled => false,
            Error::Unreachable { .. }
            | Error::Exec { .. }
            | Error::Timeout { .. }
            | Error::RegistryDeploy { .. }
            | Error::Busy { .. }
            | Error::Partial { .. }
            | Error::Io { .. } => true,
        }
    }

    /// Hosts this error is attributable to
    pub fn hosts(&self) -> Vec<IpAddr> {
        match self {
            Error::Unreachable { host, .. }
            | Error::Auth { host, .. }
            | Error::Exec { host, .. }
            | Error::RegistryDeploy { host, .. } => vec![*host],
            Error::Timeout { host: Some(h), .. } => vec![*h],
            Error::Partial { failed, .. } => failed.iter().map(|(h, _)| *h).collect(),
            _ => Vec::new(),
        }
    }

    /// One-line remediation hint shown to the user alongside the error
    pub fn remediation(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "fix the cluster manifest and retry",
            Error::Unreachable { .. } => {
                "check the host is powered on and the IP/port are correct"
            }
            Error::Auth { .. } => "check the SSH user, password, or key in the manifest",
            Error::Exec { .. } => "inspect the captured stderr on the failed host",
            Error::Timeout { .. } => "the host may be overloaded; raise the timeout and retry",
            Error::ImageMissing { .. } => "pull or rebuild the cluster image",
            Error::PlatformMismatch { .. } => "rebuild the image for the cluster's platform",
            Error::RegistryDeploy { .. } => {
                "check the registry host's container runtime, then retry"
            }
            Error::NotInitialized { .. } => "run init before join/delete/upgrade",
            Error::Busy { .. } => "wait for the running operation to finish",
            Error::Cancelled => "re-run the operation",
            Error::Partial { .. } => "retry the operation or reset the failed hosts",
            Error::Io { .. } | Error::Serialization { .. } => {
                "check controller disk space and permissions"
            }
        }
    }
}

/// Result type alias using the keel [`Error`]
pub type Result<T> = std::result::Result<T, Error>;
