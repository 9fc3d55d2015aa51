//! Node.js-compatible filesystem layer for Otter
//!
//! Many concurrent logical operations are multiplexed onto one native
//! completion channel. Each call takes a request slot, the engine performs
//! the I/O and reports back by slot identity, and the dispatcher recycles
//! the slot and resolves the caller.
//!
//! # Modules
//!
//! - `slots` / `dispatch` - request slot pool and completion dispatcher
//! - `engine` - native engine boundary, host and in-memory engines
//! - `fs` - operation façade (`open`, `read`, `write`, `stat`, `mkdir`, ...)
//! - `stream` - `FileReadStream` / `FileWriteStream`
//! - `stats` - 128-byte stat buffer decoding
//! - `position` - 64-bit offsets as `(low, high)` word pairs
//!
//! # Usage
//!
//! ```rust,ignore
//! use otter_fs::{Fs, ReadFileOptions};
//!
//! let fs = Fs::host()?;
//! fs.write_file("LICENSE", "MIT", Default::default()).await?;
//! let data = fs.read_file("LICENSE", ReadFileOptions::default()).await?;
//! ```

pub mod config;
pub mod constants;
pub mod dispatch;
pub mod encoding;
pub mod engine;
pub mod error;
pub mod fs;
pub mod position;
pub mod slots;
pub mod stats;
pub mod stream;

pub use config::FsConfig;
pub use constants::{Constants, Fd, Mode, OpenFlags, string_to_flags};
pub use dispatch::{Completed, Completion, Dispatcher, Outcome};
pub use encoding::Encoding;
#[cfg(unix)]
pub use engine::BlockingEngine;
pub use engine::{CompletionMode, Engine, MemoryEngine, Op, Payload, Submission};
pub use error::{ErrorMapper, FsError, FsResult, StatusError};
pub use fs::{Fs, MkdirOptions, ReadFileOptions, WriteFileOptions};
pub use position::{Position, WirePosition};
pub use slots::{SlotHandle, SlotPool};
pub use stats::{ByteOrder, Stats};
pub use stream::{FileReadStream, FileWriteStream, ReadStreamOptions, WriteStreamOptions};
