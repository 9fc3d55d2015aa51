//! Native engine boundary.
//!
//! An [`Engine`] performs the actual I/O. The façade hands it a
//! [`Submission`] (operands plus a [`Completion`]) and the engine reports
//! the outcome exactly once through that completion, from whatever thread
//! and in whatever order it likes. Buffers travel with the operation and
//! come back in the completion [`Payload`].

use crate::constants::{Constants, Fd};
use crate::dispatch::{Completion, Dispatcher};
use crate::error::{ErrorEntry, FsResult, HOST_ERRORS};
use crate::position::WirePosition;
use bytes::{Bytes, BytesMut};
use std::path::PathBuf;

#[cfg(unix)]
pub mod blocking;
pub mod memory;

#[cfg(unix)]
pub use blocking::BlockingEngine;
pub use memory::{CompletionMode, MemoryEngine};

/// One native call with its operands.
#[derive(Debug)]
pub enum Op {
    Open {
        path: PathBuf,
        flags: i32,
        mode: u32,
    },
    Close {
        fd: Fd,
    },
    /// Read up to `len` bytes into `buf[offset..offset + len]`.
    Read {
        fd: Fd,
        buf: BytesMut,
        offset: usize,
        len: usize,
        position: WirePosition,
    },
    Readv {
        fd: Fd,
        bufs: Vec<BytesMut>,
        position: WirePosition,
    },
    /// Write `data[offset..offset + len]`.
    Write {
        fd: Fd,
        data: Bytes,
        offset: usize,
        len: usize,
        position: WirePosition,
    },
    Writev {
        fd: Fd,
        data: Vec<Bytes>,
        position: WirePosition,
    },
    Ftruncate {
        fd: Fd,
        len: WirePosition,
    },
    /// Fill a stat buffer (see [`crate::stats`]) for `path`, following links.
    Stat {
        path: PathBuf,
        buf: BytesMut,
    },
    Lstat {
        path: PathBuf,
        buf: BytesMut,
    },
    Fstat {
        fd: Fd,
        buf: BytesMut,
    },
    Mkdir {
        path: PathBuf,
        mode: u32,
    },
    Rmdir {
        path: PathBuf,
    },
    Unlink {
        path: PathBuf,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
    },
}

impl Op {
    /// Syscall name used in error context and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::Close { .. } => "close",
            Self::Read { .. } => "read",
            Self::Readv { .. } => "readv",
            Self::Write { .. } => "write",
            Self::Writev { .. } => "writev",
            Self::Ftruncate { .. } => "ftruncate",
            Self::Stat { .. } => "stat",
            Self::Lstat { .. } => "lstat",
            Self::Fstat { .. } => "fstat",
            Self::Mkdir { .. } => "mkdir",
            Self::Rmdir { .. } => "rmdir",
            Self::Unlink { .. } => "unlink",
            Self::Rename { .. } => "rename",
        }
    }

    /// Move the operation's buffers into a completion payload.
    pub fn into_payload(self) -> Payload {
        match self {
            Self::Read { buf, .. }
            | Self::Stat { buf, .. }
            | Self::Lstat { buf, .. }
            | Self::Fstat { buf, .. } => Payload::Buf(buf),
            Self::Readv { bufs, .. } => Payload::Bufs(bufs),
            Self::Write { data, .. } => Payload::Data(data),
            Self::Writev { data, .. } => Payload::DataVec(data),
            _ => Payload::None,
        }
    }
}

/// Buffers handed back to the caller on completion.
#[derive(Debug, Default)]
pub enum Payload {
    #[default]
    None,
    Buf(BytesMut),
    Bufs(Vec<BytesMut>),
    Data(Bytes),
    DataVec(Vec<Bytes>),
}

impl Payload {
    pub fn into_buf(self) -> Option<BytesMut> {
        match self {
            Self::Buf(buf) => Some(buf),
            _ => None,
        }
    }

    pub fn into_bufs(self) -> Option<Vec<BytesMut>> {
        match self {
            Self::Bufs(bufs) => Some(bufs),
            _ => None,
        }
    }

    pub fn into_data(self) -> Option<Bytes> {
        match self {
            Self::Data(data) => Some(data),
            _ => None,
        }
    }

    pub fn into_data_vec(self) -> Option<Vec<Bytes>> {
        match self {
            Self::DataVec(data) => Some(data),
            _ => None,
        }
    }
}

/// An issued operation: the call plus the completion it owes.
#[derive(Debug)]
pub struct Submission {
    pub op: Op,
    pub completion: Completion,
}

/// The native side of the filesystem.
///
/// Results follow the usual convention: non-negative values are success
/// (descriptor, byte count, zero), negative values are statuses looked up in
/// [`Engine::error_table`].
pub trait Engine: Send + Sync + 'static {
    /// Register the completion dispatcher. Engines accept exactly one.
    fn init(&self, dispatcher: Dispatcher) -> FsResult<()>;

    /// Start an operation. Must not block on the I/O itself. Finishing
    /// `submission.completion` reports the result; dropping it instead fails
    /// the caller as abandoned.
    fn submit(&self, submission: Submission);

    /// Perform an operation on the calling thread and return its result.
    fn run_sync(&self, op: Op) -> (i32, Payload);

    fn error_table(&self) -> &'static [ErrorEntry] {
        HOST_ERRORS
    }

    fn constants(&self) -> Constants {
        Constants::HOST
    }
}
