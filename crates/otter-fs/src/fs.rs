//! Operation façade.
//!
//! Every operation validates its arguments, acquires a request slot, hands
//! the engine one [`Op`] and awaits the slot's completion. Argument errors
//! are returned before a slot is touched. Composite operations (recursive
//! mkdir, `read_file`, `write_file`) are sequences of these primitives.

use crate::config::FsConfig;
use crate::constants::{Constants, Fd, Mode, OpenFlags, resolve_mode};
use crate::dispatch::{Completed, Dispatcher};
use crate::encoding::Encoding;
use crate::engine::{Engine, Op, Payload, Submission};
use crate::error::{ErrorMapper, FsError, FsResult, StatusError};
use crate::position::{Position, WirePosition};
use crate::stats::{self, ByteOrder, STAT_BUFFER_LEN, Stats};
use crate::stream::{FileReadStream, FileWriteStream, ReadStreamOptions, WriteStreamOptions};
use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::path::Path;
use std::sync::Arc;

/// Largest byte count moved by a single read or write call.
pub const MAX_IO_LENGTH: usize = i32::MAX as usize;

/// Options for [`Fs::mkdir`].
#[derive(Debug, Clone, Default)]
pub struct MkdirOptions {
    /// Create missing ancestors and accept an existing directory.
    pub recursive: bool,
    pub mode: Option<Mode>,
}

impl MkdirOptions {
    pub fn recursive() -> Self {
        Self {
            recursive: true,
            mode: None,
        }
    }
}

/// Options for [`Fs::read_file`]. The flag defaults to `"r"`.
#[derive(Debug, Clone, Default)]
pub struct ReadFileOptions {
    pub flag: Option<OpenFlags>,
}

/// Options for [`Fs::write_file`]. The flag defaults to `"w"`.
#[derive(Debug, Clone, Default)]
pub struct WriteFileOptions {
    pub flag: Option<OpenFlags>,
    pub mode: Option<Mode>,
}

struct FsInner {
    engine: Arc<dyn Engine>,
    dispatcher: Dispatcher,
    constants: Constants,
    byte_order: ByteOrder,
    config: FsConfig,
}

/// Handle to a filesystem engine. Cheap to clone; clones share the slot
/// pool.
#[derive(Clone)]
pub struct Fs {
    inner: Arc<FsInner>,
}

impl std::fmt::Debug for Fs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fs")
            .field("in_flight", &self.inner.dispatcher.in_flight())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Fs {
    /// Initialize `engine` with a fresh dispatcher and default config.
    pub fn new(engine: Arc<dyn Engine>) -> FsResult<Self> {
        Self::with_config(engine, FsConfig::default())
    }

    pub fn with_config(engine: Arc<dyn Engine>, config: FsConfig) -> FsResult<Self> {
        let errors = ErrorMapper::new(engine.error_table());
        let dispatcher = Dispatcher::new(errors, config.initial_slots);
        engine.init(dispatcher.clone())?;

        Ok(Self {
            inner: Arc::new(FsInner {
                constants: engine.constants(),
                byte_order: config.resolved_byte_order(),
                engine,
                dispatcher,
                config,
            }),
        })
    }

    /// Filesystem over the host kernel.
    #[cfg(unix)]
    pub fn host() -> FsResult<Self> {
        Self::new(Arc::new(crate::engine::BlockingEngine::new()))
    }

    pub fn config(&self) -> &FsConfig {
        &self.inner.config
    }

    pub fn constants(&self) -> &Constants {
        &self.inner.constants
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Operations issued but not yet completed.
    pub fn in_flight(&self) -> usize {
        self.inner.dispatcher.in_flight()
    }

    async fn submit(&self, op: Op) -> FsResult<Completed> {
        let name = op.name();
        let (completion, rx) = self.inner.dispatcher.issue();
        self.inner.engine.submit(Submission { op, completion });
        let outcome = rx.await.map_err(|_| {
            tracing::debug!(op = name, "fs engine dropped request");
            FsError::Abandoned
        })?;
        Ok(outcome?)
    }

    pub async fn open(
        &self,
        path: impl AsRef<Path>,
        flags: impl Into<OpenFlags>,
        mode: Option<Mode>,
    ) -> FsResult<Fd> {
        let path = path.as_ref();
        check_path(path)?;
        let flags = flags.into().resolve(&self.inner.constants)?;
        let mode = resolve_mode(mode.as_ref(), self.inner.config.default_file_mode)?;

        let done = self
            .submit(Op::Open {
                path: path.to_path_buf(),
                flags,
                mode,
            })
            .await
            .map_err(|e| e.context("open", path))?;
        Fd::new(i64::from(done.result))
    }

    pub async fn close(&self, fd: Fd) -> FsResult<()> {
        self.submit(Op::Close { fd })
            .await
            .map_err(|e| e.syscall("close"))?;
        Ok(())
    }

    /// Close on the calling thread, bypassing the slot pool. Used from
    /// `Drop`, where nothing can be awaited.
    pub fn close_sync(&self, fd: Fd) -> FsResult<()> {
        let (result, _) = self.inner.engine.run_sync(Op::Close { fd });
        if result < 0 {
            return Err(FsError::from(self.inner.dispatcher.errors().map(result)).syscall("close"));
        }
        Ok(())
    }

    /// Read up to `len` bytes into `buf[offset..]`. Returns the byte count
    /// and the buffer; bytes past the count are left untouched.
    pub async fn read(
        &self,
        fd: Fd,
        buf: BytesMut,
        offset: usize,
        len: usize,
        position: impl Into<Position>,
    ) -> FsResult<(usize, BytesMut)> {
        check_span(buf.len(), offset, len)?;
        let position = position.into().encode()?;
        if len == 0 {
            return Ok((0, buf));
        }

        let done = self
            .submit(Op::Read {
                fd,
                buf,
                offset,
                len: len.min(MAX_IO_LENGTH),
                position,
            })
            .await
            .map_err(|e| e.syscall("read"))?;
        let count = done.result as usize;
        let buf = done
            .payload
            .into_buf()
            .ok_or(FsError::MissingPayload { op: "read" })?;
        Ok((count, buf))
    }

    /// Read into the whole buffer at the current position.
    pub async fn read_buf(&self, fd: Fd, buf: BytesMut) -> FsResult<(usize, BytesMut)> {
        let len = buf.len();
        self.read(fd, buf, 0, len, Position::Current).await
    }

    /// Write `data[offset..offset + len]`. Returns the byte count and the
    /// data.
    pub async fn write(
        &self,
        fd: Fd,
        data: Bytes,
        offset: usize,
        len: usize,
        position: impl Into<Position>,
    ) -> FsResult<(usize, Bytes)> {
        check_span(data.len(), offset, len)?;
        let position = position.into().encode()?;

        let done = self
            .submit(Op::Write {
                fd,
                data,
                offset,
                len: len.min(MAX_IO_LENGTH),
                position,
            })
            .await
            .map_err(|e| e.syscall("write"))?;
        let count = done.result as usize;
        let data = done
            .payload
            .into_data()
            .ok_or(FsError::MissingPayload { op: "write" })?;
        Ok((count, data))
    }

    /// Write all of `data` at the current position.
    pub async fn write_buf(&self, fd: Fd, data: impl Into<Bytes>) -> FsResult<(usize, Bytes)> {
        let data = data.into();
        let len = data.len();
        self.write(fd, data, 0, len, Position::Current).await
    }

    pub async fn readv(
        &self,
        fd: Fd,
        bufs: Vec<BytesMut>,
        position: impl Into<Position>,
    ) -> FsResult<(usize, Vec<BytesMut>)> {
        let position = position.into().encode()?;
        let done = self
            .submit(Op::Readv {
                fd,
                bufs,
                position,
            })
            .await
            .map_err(|e| e.syscall("readv"))?;
        let count = done.result as usize;
        let bufs = done
            .payload
            .into_bufs()
            .ok_or(FsError::MissingPayload { op: "readv" })?;
        Ok((count, bufs))
    }

    pub async fn writev(
        &self,
        fd: Fd,
        data: Vec<Bytes>,
        position: impl Into<Position>,
    ) -> FsResult<(usize, Vec<Bytes>)> {
        let position = position.into().encode()?;
        let done = self
            .submit(Op::Writev {
                fd,
                data,
                position,
            })
            .await
            .map_err(|e| e.syscall("writev"))?;
        let count = done.result as usize;
        let data = done
            .payload
            .into_data_vec()
            .ok_or(FsError::MissingPayload { op: "writev" })?;
        Ok((count, data))
    }

    pub async fn ftruncate(&self, fd: Fd, len: u64) -> FsResult<()> {
        let len = WirePosition::from_u64(len)?;
        self.submit(Op::Ftruncate { fd, len })
            .await
            .map_err(|e| e.syscall("ftruncate"))?;
        Ok(())
    }

    pub async fn stat(&self, path: impl AsRef<Path>) -> FsResult<Stats> {
        let path = path.as_ref();
        check_path(path)?;
        let op = Op::Stat {
            path: path.to_path_buf(),
            buf: BytesMut::zeroed(STAT_BUFFER_LEN),
        };
        let done = self.submit(op).await.map_err(|e| e.context("stat", path))?;
        self.decode_stats(done.payload, "stat")
    }

    /// Like [`Fs::stat`] but does not follow a final symbolic link.
    pub async fn lstat(&self, path: impl AsRef<Path>) -> FsResult<Stats> {
        let path = path.as_ref();
        check_path(path)?;
        let op = Op::Lstat {
            path: path.to_path_buf(),
            buf: BytesMut::zeroed(STAT_BUFFER_LEN),
        };
        let done = self.submit(op).await.map_err(|e| e.context("lstat", path))?;
        self.decode_stats(done.payload, "lstat")
    }

    pub async fn fstat(&self, fd: Fd) -> FsResult<Stats> {
        let op = Op::Fstat {
            fd,
            buf: BytesMut::zeroed(STAT_BUFFER_LEN),
        };
        let done = self.submit(op).await.map_err(|e| e.syscall("fstat"))?;
        self.decode_stats(done.payload, "fstat")
    }

    fn decode_stats(&self, payload: Payload, op: &'static str) -> FsResult<Stats> {
        let buf = payload.into_buf().ok_or(FsError::MissingPayload { op })?;
        Stats::decode(&buf, self.inner.byte_order)
    }

    pub async fn mkdir(&self, path: impl AsRef<Path>, options: MkdirOptions) -> FsResult<()> {
        let path = path.as_ref();
        check_path(path)?;
        let mode = resolve_mode(options.mode.as_ref(), self.inner.config.default_dir_mode)?;
        if options.recursive {
            self.mkdirp(path, mode).await
        } else {
            self.mkdir_once(path, mode).await
        }
    }

    async fn mkdir_once(&self, path: &Path, mode: u32) -> FsResult<()> {
        self.submit(Op::Mkdir {
            path: path.to_path_buf(),
            mode,
        })
        .await
        .map_err(|e| e.context("mkdir", path))?;
        Ok(())
    }

    /// A missing parent is created first and the mkdir retried. Any other
    /// failure is forgiven only if `path` turns out to be a directory.
    fn mkdirp<'a>(&'a self, path: &'a Path, mode: u32) -> BoxFuture<'a, FsResult<()>> {
        async move {
            match self.mkdir_once(path, mode).await {
                Ok(()) => Ok(()),
                Err(err) if err.code() == "ENOENT" => {
                    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
                        return Err(err);
                    };
                    self.mkdirp(parent, mode).await?;
                    match self.mkdir_once(path, mode).await {
                        Ok(()) => Ok(()),
                        Err(retry) => self.accept_existing_dir(path, retry).await,
                    }
                }
                Err(err) => self.accept_existing_dir(path, err).await,
            }
        }
        .boxed()
    }

    async fn accept_existing_dir(&self, path: &Path, err: FsError) -> FsResult<()> {
        match self.stat(path).await {
            Ok(stats) if stats::is_directory(&stats) => Ok(()),
            _ => Err(err),
        }
    }

    pub async fn rmdir(&self, path: impl AsRef<Path>) -> FsResult<()> {
        let path = path.as_ref();
        check_path(path)?;
        self.submit(Op::Rmdir {
            path: path.to_path_buf(),
        })
        .await
        .map_err(|e| e.context("rmdir", path))?;
        Ok(())
    }

    pub async fn unlink(&self, path: impl AsRef<Path>) -> FsResult<()> {
        let path = path.as_ref();
        check_path(path)?;
        self.submit(Op::Unlink {
            path: path.to_path_buf(),
        })
        .await
        .map_err(|e| e.context("unlink", path))?;
        Ok(())
    }

    pub async fn rename(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> FsResult<()> {
        let (from, to) = (from.as_ref(), to.as_ref());
        check_path(from)?;
        check_path(to)?;
        self.submit(Op::Rename {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
        })
        .await
        .map_err(|e| match e {
            FsError::Status(status) => {
                FsError::Status(status.with_syscall("rename").with_path(from).with_dest(to))
            }
            other => other,
        })?;
        Ok(())
    }

    /// Read a whole file.
    ///
    /// Regular files are read into one buffer sized from `fstat`; anything
    /// reporting size 0 (procfs entries, pipes) is read in chunks until a
    /// zero-byte read. The descriptor is closed on every path.
    pub async fn read_file(&self, path: impl AsRef<Path>, options: ReadFileOptions) -> FsResult<Bytes> {
        let flag = options.flag.unwrap_or_else(|| OpenFlags::from("r"));
        let fd = self.open(path, flag, None).await?;
        let result = self.read_to_end(fd).await;
        self.close_after(fd, result).await
    }

    pub async fn read_file_to_string(
        &self,
        path: impl AsRef<Path>,
        encoding: Encoding,
        options: ReadFileOptions,
    ) -> FsResult<String> {
        let bytes = self.read_file(path, options).await?;
        Ok(encoding.decode(&bytes))
    }

    async fn read_to_end(&self, fd: Fd) -> FsResult<Bytes> {
        let stats = self.fstat(fd).await?;
        let size = if stats::is_file(&stats) { stats.size } else { 0 };
        if size > MAX_IO_LENGTH as u64 {
            return Err(FsError::file_too_large(size));
        }

        if size == 0 {
            let chunk = self.inner.config.stream_chunk_size;
            let mut out = BytesMut::new();
            loop {
                let (n, buf) = self
                    .read(fd, BytesMut::zeroed(chunk), 0, chunk, Position::Current)
                    .await?;
                if n == 0 {
                    return Ok(out.freeze());
                }
                out.extend_from_slice(&buf[..n]);
            }
        }

        let size = size as usize;
        let mut buf = BytesMut::zeroed(size);
        let mut filled = 0;
        while filled < size {
            let (n, returned) = self
                .read(fd, buf, filled, size - filled, Position::Current)
                .await?;
            buf = returned;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf.freeze())
    }

    /// Write a whole file, creating it with mode 0o666 unless told otherwise.
    pub async fn write_file(
        &self,
        path: impl AsRef<Path>,
        data: impl Into<Bytes>,
        options: WriteFileOptions,
    ) -> FsResult<()> {
        let flag = options.flag.unwrap_or_else(|| OpenFlags::from("w"));
        let mode = options
            .mode
            .unwrap_or(Mode::Bits(self.inner.config.default_file_mode));
        let fd = self.open(path, flag, Some(mode)).await?;
        let result = self.write_all(fd, data.into()).await;
        self.close_after(fd, result).await
    }

    pub async fn write_file_str(
        &self,
        path: impl AsRef<Path>,
        text: &str,
        encoding: Encoding,
        options: WriteFileOptions,
    ) -> FsResult<()> {
        let data = encoding.encode(text)?;
        self.write_file(path, data, options).await
    }

    async fn write_all(&self, fd: Fd, mut data: Bytes) -> FsResult<()> {
        let total = data.len();
        let mut written = 0;
        while written < total {
            let (n, returned) = self
                .write(fd, data, written, total - written, Position::Current)
                .await?;
            data = returned;
            if n == 0 {
                return Err(zero_write());
            }
            written += n;
        }
        Ok(())
    }

    /// Close `fd` after a composite operation. A close failure after an
    /// earlier error is logged and dropped.
    async fn close_after<T>(&self, fd: Fd, result: FsResult<T>) -> FsResult<T> {
        match result {
            Ok(value) => {
                self.close(fd).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(close_err) = self.close(fd).await {
                    tracing::debug!(fd = %fd, error = %close_err, "close after failed fs operation");
                }
                Err(err)
            }
        }
    }

    pub async fn create_read_stream(
        &self,
        path: impl AsRef<Path>,
        options: ReadStreamOptions,
    ) -> FsResult<FileReadStream> {
        FileReadStream::open(self, path.as_ref(), options).await
    }

    pub async fn create_write_stream(
        &self,
        path: impl AsRef<Path>,
        options: WriteStreamOptions,
    ) -> FsResult<FileWriteStream> {
        FileWriteStream::open(self, path.as_ref(), options).await
    }
}

pub(crate) fn zero_write() -> FsError {
    FsError::Status(StatusError::new("EIO", "write made no progress", -libc::EIO).with_syscall("write"))
}

fn check_path(path: &Path) -> FsResult<()> {
    if path.as_os_str().as_encoded_bytes().contains(&0) {
        return Err(FsError::invalid_value(format!(
            "The argument 'path' must be a string, Uint8Array, or URL without null bytes. Received {}",
            path.display()
        )));
    }
    Ok(())
}

fn check_span(buf_len: usize, offset: usize, len: usize) -> FsResult<()> {
    if offset > buf_len {
        return Err(FsError::out_of_range(format!(
            "The value of \"offset\" is out of range. It must be >= 0 && <= {buf_len}. Received {offset}"
        )));
    }
    if len > buf_len - offset {
        return Err(FsError::out_of_range(format!(
            "The value of \"length\" is out of range. It must be >= 0 && <= {}. Received {len}",
            buf_len - offset
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use crate::error::{ERR_INVALID_ARG_VALUE, ERR_OUT_OF_RANGE};
    use std::sync::OnceLock;
    use std::time::Duration;

    fn memory_fs() -> (Arc<MemoryEngine>, Fs) {
        let engine = Arc::new(MemoryEngine::new());
        let fs = Fs::new(engine.clone()).unwrap();
        (engine, fs)
    }

    #[test]
    fn engine_accepts_one_dispatcher() {
        let engine = Arc::new(MemoryEngine::new());
        let _fs = Fs::new(engine.clone()).unwrap();
        assert!(matches!(Fs::new(engine), Err(FsError::AlreadyInitialized)));
    }

    #[tokio::test]
    async fn argument_errors_never_reach_a_slot() {
        let (engine, fs) = memory_fs();
        engine.insert_file("/f", "abc");

        let err = fs.open("/f", "rw", None).await.unwrap_err();
        assert_eq!(err.code(), ERR_INVALID_ARG_VALUE);
        let err = fs.open("/f", "r", Some(Mode::from("9"))).await.unwrap_err();
        assert_eq!(err.code(), ERR_INVALID_ARG_VALUE);
        let err = fs.stat("/f\0x").await.unwrap_err();
        assert_eq!(err.code(), ERR_INVALID_ARG_VALUE);

        let fd = fs.open("/f", "r", None).await.unwrap();
        let err = fs
            .read(fd, BytesMut::zeroed(4), 2, 3, Position::Current)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ERR_OUT_OF_RANGE);
        let err = fs
            .read(fd, BytesMut::zeroed(4), 0, 4, 1u64 << 53)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ERR_OUT_OF_RANGE);

        // Only the successful open took a slot.
        assert_eq!(fs.dispatcher().pool_len(), 1);
        assert_eq!(fs.in_flight(), 0);
    }

    #[tokio::test]
    async fn zero_length_read_short_circuits() {
        let (_engine, fs) = memory_fs();
        let fd = Fd::new(1234).unwrap();
        let (n, buf) = fs
            .read(fd, BytesMut::zeroed(8), 8, 0, Position::Current)
            .await
            .unwrap();
        assert_eq!((n, buf.len()), (0, 8));
        assert_eq!(fs.dispatcher().pool_len(), 0);
    }

    #[tokio::test]
    async fn status_errors_carry_syscall_and_path() {
        let (_engine, fs) = memory_fs();
        let err = fs.open("/missing", "r", None).await.unwrap_err();
        assert_eq!(err.code(), "ENOENT");
        assert_eq!(
            err.to_string(),
            "ENOENT: no such file or directory, open '/missing'"
        );

        let err = fs.rename("/missing", "/other").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "ENOENT: no such file or directory, rename '/missing' -> '/other'"
        );
    }

    #[tokio::test]
    async fn vectored_io_round_trips_buffers() {
        let (engine, fs) = memory_fs();
        let fd = fs.open("/v", "w+", None).await.unwrap();
        let (n, data) = fs
            .writev(
                fd,
                vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cde")],
                Position::Current,
            )
            .await
            .unwrap();
        assert_eq!(n, 5);
        assert_eq!(data.len(), 2);
        assert_eq!(engine.contents("/v").unwrap(), b"abcde");

        let (n, bufs) = fs
            .readv(fd, vec![BytesMut::zeroed(3), BytesMut::zeroed(3)], 0u64)
            .await
            .unwrap();
        assert_eq!(n, 5);
        assert_eq!(&bufs[0][..], b"abc");
        assert_eq!(&bufs[1][..2], b"de");

        fs.ftruncate(fd, 2).await.unwrap();
        assert_eq!(fs.fstat(fd).await.unwrap().size, 2);
        fs.close(fd).await.unwrap();
        assert_eq!(fs.close(fd).await.unwrap_err().code(), "EBADF");
    }

    #[tokio::test]
    async fn mkdir_without_recursion_reports_conflicts() {
        let (_engine, fs) = memory_fs();
        fs.mkdir("/d", MkdirOptions::default()).await.unwrap();
        let err = fs.mkdir("/d", MkdirOptions::default()).await.unwrap_err();
        assert_eq!(err.code(), "EEXIST");
        let err = fs.mkdir("/x/y", MkdirOptions::default()).await.unwrap_err();
        assert_eq!(err.code(), "ENOENT");
    }

    #[tokio::test]
    async fn recursive_mkdir_refuses_to_shadow_a_file() {
        let (engine, fs) = memory_fs();
        engine.insert_file("/a/file", "x");
        let err = fs
            .mkdir("/a/file", MkdirOptions::recursive())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "EEXIST");
        let err = fs
            .mkdir("/a/file/sub", MkdirOptions::recursive())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ENOTDIR");
    }

    #[tokio::test]
    async fn text_helpers_use_encodings() {
        let (engine, fs) = memory_fs();
        fs.write_file_str("/t", "4d4954", Encoding::Hex, WriteFileOptions::default())
            .await
            .unwrap();
        assert_eq!(engine.contents("/t").unwrap(), b"MIT");
        let text = fs
            .read_file_to_string("/t", Encoding::Base64, ReadFileOptions::default())
            .await
            .unwrap();
        assert_eq!(text, "TUlU");
    }

    #[tokio::test]
    async fn write_file_append_flag_keeps_existing_data() {
        let (engine, fs) = memory_fs();
        engine.insert_file("/log", "a");
        let options = WriteFileOptions {
            flag: Some(OpenFlags::from("a")),
            mode: None,
        };
        fs.write_file("/log", "b", options).await.unwrap();
        assert_eq!(engine.contents("/log").unwrap(), b"ab");
        assert_eq!(engine.open_descriptors(), 0);
    }

    #[tokio::test]
    async fn sync_close_maps_errors() {
        let (engine, fs) = memory_fs();
        engine.insert_file("/f", "");
        let fd = fs.open("/f", "r", None).await.unwrap();
        fs.close_sync(fd).unwrap();
        assert_eq!(fs.close_sync(fd).unwrap_err().code(), "EBADF");
    }

    /// Loses every submission without completing it.
    #[derive(Default)]
    struct LosingEngine {
        dispatcher: OnceLock<Dispatcher>,
    }

    impl Engine for LosingEngine {
        fn init(&self, dispatcher: Dispatcher) -> FsResult<()> {
            self.dispatcher
                .set(dispatcher)
                .map_err(|_| FsError::AlreadyInitialized)
        }

        fn submit(&self, submission: Submission) {
            drop(submission);
        }

        fn run_sync(&self, op: Op) -> (i32, Payload) {
            (-libc::ENOSYS, op.into_payload())
        }
    }

    #[tokio::test]
    async fn lost_submission_fails_as_abandoned() {
        let fs = Fs::new(Arc::new(LosingEngine::default())).unwrap();
        let err = tokio::time::timeout(Duration::from_secs(1), fs.stat("/x"))
            .await
            .expect("lost request must not hang")
            .unwrap_err();
        assert!(matches!(err, FsError::Abandoned));
        assert_eq!(err.code(), "ECANCELED");
        assert_eq!(fs.in_flight(), 0);

        // The recycled slot serves the next request.
        assert!(matches!(fs.unlink("/x").await, Err(FsError::Abandoned)));
        assert_eq!(fs.dispatcher().pool_len(), 1);
    }

    #[tokio::test]
    async fn far_positional_write_is_efbig() {
        let (engine, fs) = memory_fs();
        engine.insert_file("/f", "");
        let fd = fs.open("/f", "r+", None).await.unwrap();
        let err = fs
            .write(fd, Bytes::from_static(b"x"), 0, 1, 1u64 << 50)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "EFBIG");
        assert_eq!(err.as_status().unwrap().syscall, Some("write"));
        assert_eq!(fs.ftruncate(fd, 1 << 40).await.unwrap_err().code(), "EFBIG");
        fs.close(fd).await.unwrap();
        assert_eq!(engine.contents("/f").unwrap(), b"");
    }

    #[tokio::test]
    async fn read_file_to_string_honours_the_flag() {
        let (engine, fs) = memory_fs();
        let options = ReadFileOptions {
            flag: Some(OpenFlags::from("a+")),
        };
        let text = fs
            .read_file_to_string("/new", Encoding::Utf8, options)
            .await
            .unwrap();
        assert_eq!(text, "");
        assert!(engine.exists("/new"));
        assert_eq!(engine.open_descriptors(), 0);
    }
}
