//! Error types for otter-fs
//!
//! Callers see two families of failure: argument errors, raised before a
//! slot is acquired or anything reaches the engine, and native status
//! errors, delivered asynchronously through the dispatcher and translated by
//! [`ErrorMapper`].

use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Node-style code for an argument with an unacceptable value.
pub const ERR_INVALID_ARG_VALUE: &str = "ERR_INVALID_ARG_VALUE";
/// Node-style code for a numeric argument outside its allowed range.
pub const ERR_OUT_OF_RANGE: &str = "ERR_OUT_OF_RANGE";
/// Node-style code for an unsupported text encoding name.
pub const ERR_UNKNOWN_ENCODING: &str = "ERR_UNKNOWN_ENCODING";
/// Node-style code for files too large to read into one buffer.
pub const ERR_FS_FILE_TOO_LARGE: &str = "ERR_FS_FILE_TOO_LARGE";
/// Symbolic code reported for statuses missing from the engine's table.
pub const UNKNOWN_CODE: &str = "EUNKNOWN";

/// One row of an engine's status table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorEntry {
    /// Raw (negative) status as reported by the engine.
    pub errno: i32,
    /// POSIX-style symbolic name.
    pub code: &'static str,
    /// Human readable description.
    pub description: &'static str,
}

macro_rules! status_table {
    ($($name:ident => $description:literal),* $(,)?) => {
        &[$(ErrorEntry {
            errno: -libc::$name,
            code: stringify!($name),
            description: $description,
        }),*]
    };
}

/// Status table for engines that report negated host `errno` values.
pub static HOST_ERRORS: &[ErrorEntry] = status_table! {
    EPERM => "operation not permitted",
    ENOENT => "no such file or directory",
    EIO => "i/o error",
    EBADF => "bad file descriptor",
    EAGAIN => "resource temporarily unavailable",
    ENOMEM => "not enough memory",
    EACCES => "permission denied",
    EBUSY => "resource busy or locked",
    EEXIST => "file already exists",
    EXDEV => "cross-device link not permitted",
    ENOTDIR => "not a directory",
    EISDIR => "illegal operation on a directory",
    EINVAL => "invalid argument",
    ENFILE => "file table overflow",
    EMFILE => "too many open files",
    EFBIG => "file too large",
    ENOSPC => "no space left on device",
    ESPIPE => "invalid seek",
    EROFS => "read-only file system",
    EMLINK => "too many links",
    ENAMETOOLONG => "name too long",
    ENOTEMPTY => "directory not empty",
    ELOOP => "too many symbolic links encountered",
    ECANCELED => "operation canceled",
};

/// Translates engine statuses into [`StatusError`]s.
///
/// The table is supplied by the engine at initialization. Unknown statuses
/// fail closed to [`UNKNOWN_CODE`] instead of panicking.
#[derive(Debug, Clone, Copy)]
pub struct ErrorMapper {
    table: &'static [ErrorEntry],
}

impl ErrorMapper {
    pub fn new(table: &'static [ErrorEntry]) -> Self {
        Self { table }
    }

    /// Mapper over [`HOST_ERRORS`].
    pub fn host() -> Self {
        Self::new(HOST_ERRORS)
    }

    pub fn lookup(&self, status: i32) -> Option<&'static ErrorEntry> {
        self.table.iter().find(|entry| entry.errno == status)
    }

    /// Raw status for a symbolic code, if the table knows it.
    pub fn status_of(&self, code: &str) -> Option<i32> {
        self.table
            .iter()
            .find(|entry| entry.code == code)
            .map(|entry| entry.errno)
    }

    pub fn map(&self, status: i32) -> StatusError {
        match self.lookup(status) {
            Some(entry) => StatusError::new(entry.code, entry.description, status),
            None => StatusError::new(
                UNKNOWN_CODE,
                format!("filesystem operation failed with status {status}"),
                status,
            ),
        }
    }
}

impl Default for ErrorMapper {
    fn default() -> Self {
        Self::host()
    }
}

/// A failed native operation: `{code, message, errno}` plus the syscall and
/// path context the façade attaches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusError {
    pub code: &'static str,
    pub message: String,
    pub errno: i32,
    pub syscall: Option<&'static str>,
    pub path: Option<String>,
    pub dest: Option<String>,
}

impl StatusError {
    pub fn new(code: &'static str, message: impl Into<String>, errno: i32) -> Self {
        Self {
            code,
            message: message.into(),
            errno,
            syscall: None,
            path: None,
            dest: None,
        }
    }

    pub fn with_syscall(mut self, syscall: &'static str) -> Self {
        self.syscall = Some(syscall);
        self
    }

    pub fn with_path(mut self, path: &Path) -> Self {
        self.path = Some(path.display().to_string());
        self
    }

    pub fn with_dest(mut self, dest: &Path) -> Self {
        self.dest = Some(dest.display().to_string());
        self
    }
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(syscall) = self.syscall {
            write!(f, ", {syscall}")?;
        }
        match (&self.path, &self.dest) {
            (Some(path), Some(dest)) => write!(f, " '{path}' -> '{dest}'"),
            (Some(path), None) => write!(f, " '{path}'"),
            _ => Ok(()),
        }
    }
}

impl std::error::Error for StatusError {}

/// Errors surfaced by every otter-fs operation.
#[derive(Debug, Clone, Error)]
pub enum FsError {
    /// Synchronous argument error; nothing was issued.
    #[error("{code}: {message}")]
    InvalidArgument { code: &'static str, message: String },

    /// Native status error delivered through the dispatcher.
    #[error(transparent)]
    Status(#[from] StatusError),

    /// The engine dropped a request without completing it.
    #[error("engine dropped the request before completing it")]
    Abandoned,

    /// A stream was used after a fatal error or after being closed.
    #[error("ERR_STREAM_DESTROYED: cannot use a stream after it was destroyed")]
    StreamDestroyed,

    /// `Engine::init` was called twice.
    #[error("filesystem engine is already initialized")]
    AlreadyInitialized,

    /// The engine completed an operation without handing its buffers back.
    #[error("engine completed {op} without returning its buffers")]
    MissingPayload { op: &'static str },
}

impl FsError {
    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            code: ERR_INVALID_ARG_VALUE,
            message: message.into(),
        }
    }

    pub fn out_of_range(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            code: ERR_OUT_OF_RANGE,
            message: message.into(),
        }
    }

    pub fn unknown_encoding(name: &str) -> Self {
        Self::InvalidArgument {
            code: ERR_UNKNOWN_ENCODING,
            message: format!("Unknown encoding: {name}"),
        }
    }

    pub fn file_too_large(size: u64) -> Self {
        Self::InvalidArgument {
            code: ERR_FS_FILE_TOO_LARGE,
            message: format!("File size ({size}) is greater than 2 GiB"),
        }
    }

    /// Symbolic code (`ENOENT`, `ERR_OUT_OF_RANGE`, ...).
    pub fn code(&self) -> &str {
        match self {
            Self::InvalidArgument { code, .. } => *code,
            Self::Status(status) => status.code,
            Self::Abandoned => "ECANCELED",
            Self::StreamDestroyed => "ERR_STREAM_DESTROYED",
            Self::AlreadyInitialized => "ERR_INVALID_STATE",
            Self::MissingPayload { .. } => "ERR_INTERNAL_ASSERTION",
        }
    }

    /// Raw engine status for native errors.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Status(status) => Some(status.errno),
            _ => None,
        }
    }

    pub fn as_status(&self) -> Option<&StatusError> {
        match self {
            Self::Status(status) => Some(status),
            _ => None,
        }
    }

    pub(crate) fn syscall(self, syscall: &'static str) -> Self {
        match self {
            Self::Status(status) => Self::Status(status.with_syscall(syscall)),
            other => other,
        }
    }

    pub(crate) fn context(self, syscall: &'static str, path: &Path) -> Self {
        match self {
            Self::Status(status) => Self::Status(status.with_syscall(syscall).with_path(path)),
            other => other,
        }
    }
}

/// Result type using FsError
pub type FsResult<T> = Result<T, FsError>;
