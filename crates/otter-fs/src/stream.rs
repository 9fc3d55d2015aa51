//! File streams.
//!
//! [`FileReadStream`] pulls bounded chunks through [`Fs::read`] and
//! [`FileWriteStream`] pushes vectors of chunks through [`Fs::writev`]. Both
//! own their descriptor: it is closed when the stream ends, on error, on
//! `close`/`destroy`, or synchronously on drop.

use crate::constants::{Fd, Mode, OpenFlags};
use crate::error::{FsError, FsResult};
use crate::fs::{Fs, zero_write};
use crate::position::Position;
use crate::stats;
use bytes::{Bytes, BytesMut};
use futures::Stream;
use std::path::Path;

/// Options for [`Fs::create_read_stream`].
///
/// `end` is inclusive. With both `end` and `length`, the smaller window
/// wins.
#[derive(Debug, Clone, Default)]
pub struct ReadStreamOptions {
    pub flags: Option<OpenFlags>,
    pub mode: Option<Mode>,
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub length: Option<u64>,
    /// Overrides the configured stream chunk size.
    pub chunk_size: Option<usize>,
}

/// Sequential reader over a file window.
///
/// Dropping a reader that still holds its descriptor closes it through
/// [`Fs::close_sync`], which on the host engine is a blocking `close(2)` on
/// the current thread. Call [`FileReadStream::close`] to keep that off an
/// async worker.
#[derive(Debug)]
pub struct FileReadStream {
    fs: Fs,
    fd: Option<Fd>,
    offset: u64,
    /// `None` reads until a zero-byte read.
    remaining: Option<u64>,
    positional: bool,
    chunk_size: usize,
    destroyed: bool,
}

impl FileReadStream {
    pub(crate) async fn open(fs: &Fs, path: &Path, options: ReadStreamOptions) -> FsResult<Self> {
        let start = options.start.unwrap_or(0);
        if let Some(end) = options.end
            && end < start
        {
            return Err(FsError::out_of_range(format!(
                "The value of \"start\" is out of range. It must be <= \"end\" (here: {end}). Received {start}"
            )));
        }
        let chunk_size = options
            .chunk_size
            .unwrap_or(fs.config().stream_chunk_size)
            .max(1);
        let mut remaining = match (options.end, options.length) {
            (Some(end), Some(length)) => Some((end - start).saturating_add(1).min(length)),
            (Some(end), None) => Some((end - start).saturating_add(1)),
            (None, length) => length,
        };

        let flags = options.flags.unwrap_or_else(|| OpenFlags::from("r"));
        let fd = fs.open(path, flags, options.mode).await?;

        match fs.fstat(fd).await {
            Ok(stats) if stats::is_file(&stats) => {
                let available = stats.size.saturating_sub(start);
                remaining = Some(remaining.map_or(available, |budget| budget.min(available)));
            }
            Ok(_) => {}
            Err(err) => {
                if let Err(close_err) = fs.close(fd).await {
                    tracing::debug!(fd = %fd, error = %close_err, "close after failed fstat");
                }
                return Err(err);
            }
        }

        Ok(Self {
            fs: fs.clone(),
            fd: Some(fd),
            offset: start,
            remaining,
            positional: options.start.is_some(),
            chunk_size,
            destroyed: false,
        })
    }

    /// Absolute position of the next read.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes left in the window, if bounded.
    pub fn remaining(&self) -> Option<u64> {
        self.remaining
    }

    pub fn fd(&self) -> Option<Fd> {
        self.fd
    }

    /// Next chunk, or `None` once the window or the file is exhausted.
    pub async fn pull(&mut self) -> FsResult<Option<Bytes>> {
        if self.destroyed {
            return Err(FsError::StreamDestroyed);
        }
        let Some(fd) = self.fd else {
            return Ok(None);
        };

        let want = match self.remaining {
            Some(0) => {
                self.close().await?;
                return Ok(None);
            }
            Some(left) => usize::try_from(left).map_or(self.chunk_size, |left| left.min(self.chunk_size)),
            None => self.chunk_size,
        };
        let position = if self.positional {
            Position::At(self.offset)
        } else {
            Position::Current
        };

        match self.fs.read(fd, BytesMut::zeroed(want), 0, want, position).await {
            Ok((0, _)) => {
                self.close().await?;
                Ok(None)
            }
            Ok((n, mut buf)) => {
                buf.truncate(n);
                self.offset += n as u64;
                if let Some(left) = self.remaining.as_mut() {
                    *left = left.saturating_sub(n as u64);
                }
                Ok(Some(buf.freeze()))
            }
            Err(err) => {
                self.destroy().await;
                Err(err)
            }
        }
    }

    /// Close the descriptor early. Further pulls yield `None`.
    pub async fn close(&mut self) -> FsResult<()> {
        match self.fd.take() {
            Some(fd) => self.fs.close(fd).await,
            None => Ok(()),
        }
    }

    /// Close the descriptor, ignoring close errors. Further pulls fail.
    pub async fn destroy(&mut self) {
        self.destroyed = true;
        if let Some(fd) = self.fd.take()
            && let Err(err) = self.fs.close(fd).await
        {
            tracing::debug!(fd = %fd, error = %err, "close during read stream destroy");
        }
    }

    /// Consume the reader as a one-shot stream of chunks. A failed pull is
    /// yielded once and ends the stream.
    pub fn into_stream(self) -> impl Stream<Item = FsResult<Bytes>> + Send {
        futures::stream::unfold(Some(self), |state| async move {
            let mut reader = state?;
            match reader.pull().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(reader))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}

impl Drop for FileReadStream {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.take()
            && let Err(err) = self.fs.close_sync(fd)
        {
            tracing::debug!(fd = %fd, error = %err, "close on read stream drop");
        }
    }
}

/// Options for [`Fs::create_write_stream`]. Flags default to `"w"`.
#[derive(Debug, Clone, Default)]
pub struct WriteStreamOptions {
    pub flags: Option<OpenFlags>,
    pub mode: Option<Mode>,
    /// Write from this offset instead of the descriptor's position.
    pub start: Option<u64>,
}

/// Sequential writer.
///
/// Like [`FileReadStream`], a writer dropped while open closes its
/// descriptor with a blocking [`Fs::close_sync`]; prefer
/// [`FileWriteStream::close`] from async code.
#[derive(Debug)]
pub struct FileWriteStream {
    fs: Fs,
    fd: Option<Fd>,
    position: Option<u64>,
    bytes_written: u64,
    destroyed: bool,
}

impl FileWriteStream {
    pub(crate) async fn open(fs: &Fs, path: &Path, options: WriteStreamOptions) -> FsResult<Self> {
        if let Some(start) = options.start {
            Position::At(start).encode()?;
        }
        let flags = options.flags.unwrap_or_else(|| OpenFlags::from("w"));
        let fd = fs.open(path, flags, options.mode).await?;
        Ok(Self {
            fs: fs.clone(),
            fd: Some(fd),
            position: options.start,
            bytes_written: 0,
            destroyed: false,
        })
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn fd(&self) -> Option<Fd> {
        self.fd
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub async fn write(&mut self, data: impl Into<Bytes>) -> FsResult<()> {
        self.write_vectored(vec![data.into()]).await
    }

    /// Write every chunk, in order, as vectored writes. Partial writes are
    /// resumed from where they stopped. Any error destroys the stream.
    pub async fn write_vectored(&mut self, chunks: Vec<Bytes>) -> FsResult<()> {
        let fd = match (self.destroyed, self.fd) {
            (false, Some(fd)) => fd,
            _ => return Err(FsError::StreamDestroyed),
        };

        let mut pending: Vec<Bytes> = chunks.into_iter().filter(|c| !c.is_empty()).collect();
        while !pending.is_empty() {
            let position = self.position.map_or(Position::Current, Position::At);
            let (n, returned) = match self.fs.writev(fd, pending, position).await {
                Ok((0, _)) => {
                    self.destroy().await;
                    return Err(zero_write());
                }
                Ok(done) => done,
                Err(err) => {
                    self.destroy().await;
                    return Err(err);
                }
            };
            self.bytes_written += n as u64;
            if let Some(pos) = self.position.as_mut() {
                *pos += n as u64;
            }
            pending = skip_written(returned, n);
        }
        Ok(())
    }

    /// Close the descriptor, reporting close errors. Further writes fail.
    pub async fn close(&mut self) -> FsResult<()> {
        self.destroyed = true;
        match self.fd.take() {
            Some(fd) => self.fs.close(fd).await,
            None => Ok(()),
        }
    }

    /// Close the descriptor, ignoring close errors.
    pub async fn destroy(&mut self) {
        self.destroyed = true;
        if let Some(fd) = self.fd.take()
            && let Err(err) = self.fs.close(fd).await
        {
            tracing::debug!(fd = %fd, error = %err, "close during write stream destroy");
        }
    }
}

impl Drop for FileWriteStream {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.take()
            && let Err(err) = self.fs.close_sync(fd)
        {
            tracing::debug!(fd = %fd, error = %err, "close on write stream drop");
        }
    }
}

/// Drop the first `written` bytes from a chunk list.
fn skip_written(chunks: Vec<Bytes>, mut written: usize) -> Vec<Bytes> {
    chunks
        .into_iter()
        .filter_map(|chunk| {
            if written >= chunk.len() {
                written -= chunk.len();
                None
            } else {
                let rest = chunk.slice(written..);
                written = 0;
                Some(rest)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use futures::StreamExt;
    use std::sync::Arc;

    fn memory_fs(engine: MemoryEngine) -> (Arc<MemoryEngine>, Fs) {
        let engine = Arc::new(engine);
        let fs = Fs::new(engine.clone()).unwrap();
        (engine, fs)
    }

    #[test]
    fn skip_written_splits_chunks() {
        let chunks = vec![
            Bytes::from_static(b"ab"),
            Bytes::from_static(b"cde"),
            Bytes::from_static(b"f"),
        ];
        let rest = skip_written(chunks, 3);
        assert_eq!(rest, vec![Bytes::from_static(b"de"), Bytes::from_static(b"f")]);
    }

    #[tokio::test]
    async fn end_is_inclusive_and_smaller_window_wins() {
        let (engine, fs) = memory_fs(MemoryEngine::new());
        engine.insert_file("/f", "0123456789");

        let options = ReadStreamOptions {
            start: Some(2),
            end: Some(5),
            ..Default::default()
        };
        let reader = fs.create_read_stream("/f", options).await.unwrap();
        let chunks: Vec<_> = reader.into_stream().collect().await;
        let data: Vec<u8> = chunks.into_iter().flat_map(|c| c.unwrap().to_vec()).collect();
        assert_eq!(data, b"2345");

        let options = ReadStreamOptions {
            start: Some(2),
            end: Some(8),
            length: Some(3),
            ..Default::default()
        };
        let mut reader = fs.create_read_stream("/f", options).await.unwrap();
        assert_eq!(reader.remaining(), Some(3));
        assert_eq!(reader.pull().await.unwrap().unwrap(), Bytes::from_static(b"234"));
        assert_eq!(reader.pull().await.unwrap(), None);
        assert_eq!(reader.fd(), None);
        assert_eq!(engine.open_descriptors(), 0);
    }

    #[tokio::test]
    async fn start_past_eof_yields_nothing() {
        let (engine, fs) = memory_fs(MemoryEngine::new());
        engine.insert_file("/f", "abc");
        let options = ReadStreamOptions {
            start: Some(10),
            ..Default::default()
        };
        let mut reader = fs.create_read_stream("/f", options).await.unwrap();
        assert_eq!(reader.remaining(), Some(0));
        assert_eq!(reader.pull().await.unwrap(), None);
    }

    #[tokio::test]
    async fn end_before_start_is_rejected() {
        let (engine, fs) = memory_fs(MemoryEngine::new());
        engine.insert_file("/f", "abc");
        let options = ReadStreamOptions {
            start: Some(2),
            end: Some(1),
            ..Default::default()
        };
        let err = fs.create_read_stream("/f", options).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ERR_OUT_OF_RANGE);
        assert_eq!(engine.open_descriptors(), 0);
    }

    #[tokio::test]
    async fn chunks_respect_chunk_size() {
        let (engine, fs) = memory_fs(MemoryEngine::new());
        engine.insert_file("/f", vec![7u8; 10]);
        let options = ReadStreamOptions {
            chunk_size: Some(4),
            ..Default::default()
        };
        let reader = fs.create_read_stream("/f", options).await.unwrap();
        let sizes: Vec<usize> = reader
            .into_stream()
            .map(|chunk| chunk.unwrap().len())
            .collect()
            .await;
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[tokio::test]
    async fn dropping_a_stream_closes_its_descriptor() {
        let (engine, fs) = memory_fs(MemoryEngine::new());
        engine.insert_file("/f", "abc");
        let reader = fs
            .create_read_stream("/f", ReadStreamOptions::default())
            .await
            .unwrap();
        let writer = fs
            .create_write_stream("/g", WriteStreamOptions::default())
            .await
            .unwrap();
        assert_eq!(engine.open_descriptors(), 2);
        drop(reader);
        drop(writer);
        assert_eq!(engine.open_descriptors(), 0);
    }

    #[tokio::test]
    async fn write_stream_loops_over_partial_writes() {
        let (engine, fs) = memory_fs(MemoryEngine::new().with_max_transfer(3));
        let mut writer = fs
            .create_write_stream("/out", WriteStreamOptions::default())
            .await
            .unwrap();
        writer
            .write_vectored(vec![Bytes::from_static(b"hello "), Bytes::from_static(b"world")])
            .await
            .unwrap();
        writer.write("!").await.unwrap();
        assert_eq!(writer.bytes_written(), 12);
        writer.close().await.unwrap();
        assert_eq!(engine.contents("/out").unwrap(), b"hello world!");
        assert!(matches!(
            writer.write("late").await,
            Err(FsError::StreamDestroyed)
        ));
    }

    #[tokio::test]
    async fn write_stream_start_overwrites_in_place() {
        let (engine, fs) = memory_fs(MemoryEngine::new());
        engine.insert_file("/f", "abcdef");
        let options = WriteStreamOptions {
            flags: Some(OpenFlags::from("r+")),
            start: Some(2),
            ..Default::default()
        };
        let mut writer = fs.create_write_stream("/f", options).await.unwrap();
        writer.write("XY").await.unwrap();
        writer.write("Z").await.unwrap();
        writer.close().await.unwrap();
        assert_eq!(engine.contents("/f").unwrap(), b"abXYZf");
    }

    #[tokio::test]
    async fn write_error_destroys_the_stream() {
        let (engine, fs) = memory_fs(MemoryEngine::new());
        engine.insert_file("/ro", "data");
        let options = WriteStreamOptions {
            flags: Some(OpenFlags::from("r")),
            ..Default::default()
        };
        let mut writer = fs.create_write_stream("/ro", options).await.unwrap();
        let err = writer.write("x").await.unwrap_err();
        assert_eq!(err.code(), "EBADF");
        assert!(writer.is_destroyed());
        assert_eq!(writer.fd(), None);
        assert_eq!(engine.open_descriptors(), 0);
        assert!(matches!(
            writer.write("y").await,
            Err(FsError::StreamDestroyed)
        ));
    }
}
