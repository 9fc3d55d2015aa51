//! Host engine: plain libc syscalls run on tokio's blocking pool.
//!
//! Each submission becomes one `spawn_blocking` task which completes its
//! slot through the dispatcher when the syscall returns. Completions are
//! therefore delivered from pool threads in whatever order the kernel
//! finishes them.

use crate::constants::Fd;
use crate::dispatch::Dispatcher;
use crate::engine::{Engine, Op, Payload, Submission};
use crate::error::{FsError, FsResult};
use crate::position::WirePosition;
use crate::stats::{ByteOrder, STAT_BUFFER_LEN, Stats};
use bytes::{Bytes, BytesMut};
use libc::c_int;
use std::ffi::CString;
use std::io;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::OnceLock;

/// Engine backed by the host kernel.
#[derive(Debug, Default)]
pub struct BlockingEngine {
    dispatcher: OnceLock<Dispatcher>,
}

impl BlockingEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Engine for BlockingEngine {
    fn init(&self, dispatcher: Dispatcher) -> FsResult<()> {
        self.dispatcher
            .set(dispatcher)
            .map_err(|_| FsError::AlreadyInitialized)
    }

    fn submit(&self, submission: Submission) {
        let Submission { op, completion } = submission;
        if self.dispatcher.get().is_none() {
            // Dropping the completion fails the caller.
            tracing::warn!(op = op.name(), "fs engine used before init");
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || {
                    let (result, payload) = execute(op);
                    completion.complete(result, payload);
                });
            }
            // Outside a runtime there is no pool to defer to.
            Err(_) => {
                let (result, payload) = execute(op);
                completion.complete(result, payload);
            }
        }
    }

    fn run_sync(&self, op: Op) -> (i32, Payload) {
        execute(op)
    }
}

fn execute(op: Op) -> (i32, Payload) {
    match op {
        Op::Open { path, flags, mode } => {
            let result = with_cpath(&path, |p| unsafe {
                libc::open(p, flags | libc::O_CLOEXEC, mode as libc::c_uint)
            });
            (result, Payload::None)
        }
        Op::Close { fd } => (check(unsafe { libc::close(raw(fd)) }), Payload::None),
        Op::Read {
            fd,
            mut buf,
            offset,
            len,
            position,
        } => {
            let result = match span(offset, len).and_then(|r| buf.get_mut(r)) {
                Some(target) => check_len(sys_read(fd, target, at(position))),
                None => -libc::EINVAL,
            };
            (result, Payload::Buf(buf))
        }
        Op::Readv {
            fd,
            mut bufs,
            position,
        } => {
            let result = readv(fd, &mut bufs, position);
            (result, Payload::Bufs(bufs))
        }
        Op::Write {
            fd,
            data,
            offset,
            len,
            position,
        } => {
            let result = match span(offset, len).and_then(|r| data.get(r)) {
                Some(source) => check_len(sys_write(fd, source, at(position))),
                None => -libc::EINVAL,
            };
            (result, Payload::Data(data))
        }
        Op::Writev { fd, data, position } => {
            let result = writev(fd, &data, position);
            (result, Payload::DataVec(data))
        }
        Op::Ftruncate { fd, len } => {
            let result = check(unsafe { libc::ftruncate(raw(fd), len.to_u64() as libc::off_t) });
            (result, Payload::None)
        }
        Op::Stat { path, mut buf } => {
            let result = stat_path(&path, &mut buf, true);
            (result, Payload::Buf(buf))
        }
        Op::Lstat { path, mut buf } => {
            let result = stat_path(&path, &mut buf, false);
            (result, Payload::Buf(buf))
        }
        Op::Fstat { fd, mut buf } => {
            let mut st: libc::stat = unsafe { mem::zeroed() };
            let result = match check(unsafe { libc::fstat(raw(fd), &mut st) }) {
                0 => fill_stats(&st, &mut buf),
                status => status,
            };
            (result, Payload::Buf(buf))
        }
        Op::Mkdir { path, mode } => {
            let result = with_cpath(&path, |p| unsafe { libc::mkdir(p, mode as libc::mode_t) });
            (result, Payload::None)
        }
        Op::Rmdir { path } => (
            with_cpath(&path, |p| unsafe { libc::rmdir(p) }),
            Payload::None,
        ),
        Op::Unlink { path } => (
            with_cpath(&path, |p| unsafe { libc::unlink(p) }),
            Payload::None,
        ),
        Op::Rename { from, to } => {
            let result = match (cpath(&from), cpath(&to)) {
                (Ok(from), Ok(to)) => check(unsafe { libc::rename(from.as_ptr(), to.as_ptr()) }),
                (Err(status), _) | (_, Err(status)) => status,
            };
            (result, Payload::None)
        }
    }
}

fn raw(fd: Fd) -> c_int {
    fd.raw() as c_int
}

fn at(position: WirePosition) -> Option<u64> {
    (!position.is_auto()).then(|| position.to_u64())
}

fn span(offset: usize, len: usize) -> Option<std::ops::Range<usize>> {
    offset.checked_add(len).map(|end| offset..end)
}

fn last_status() -> i32 {
    -io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

fn check(ret: c_int) -> i32 {
    if ret < 0 { last_status() } else { ret }
}

fn check_len(ret: isize) -> i32 {
    if ret < 0 {
        last_status()
    } else {
        i32::try_from(ret).unwrap_or(i32::MAX)
    }
}

fn cpath(path: &Path) -> Result<CString, i32> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| -libc::EINVAL)
}

fn with_cpath(path: &Path, call: impl FnOnce(*const libc::c_char) -> c_int) -> i32 {
    match cpath(path) {
        Ok(path) => check(call(path.as_ptr())),
        Err(status) => status,
    }
}

fn sys_read(fd: Fd, target: &mut [u8], position: Option<u64>) -> isize {
    let ptr = target.as_mut_ptr().cast();
    unsafe {
        match position {
            None => libc::read(raw(fd), ptr, target.len()),
            Some(pos) => libc::pread(raw(fd), ptr, target.len(), pos as libc::off_t),
        }
    }
}

fn sys_write(fd: Fd, source: &[u8], position: Option<u64>) -> isize {
    let ptr = source.as_ptr().cast();
    unsafe {
        match position {
            None => libc::write(raw(fd), ptr, source.len()),
            Some(pos) => libc::pwrite(raw(fd), ptr, source.len(), pos as libc::off_t),
        }
    }
}

fn readv(fd: Fd, bufs: &mut [BytesMut], position: WirePosition) -> i32 {
    match at(position) {
        None => {
            let iov: Vec<libc::iovec> = bufs
                .iter_mut()
                .map(|buf| libc::iovec {
                    iov_base: buf.as_mut_ptr().cast(),
                    iov_len: buf.len(),
                })
                .collect();
            check_len(unsafe { libc::readv(raw(fd), iov.as_ptr(), iov.len() as c_int) })
        }
        // No portable preadv; emulate with consecutive preads.
        Some(mut pos) => {
            let mut total = 0usize;
            for buf in bufs.iter_mut() {
                let n = sys_read(fd, buf, Some(pos));
                if n < 0 {
                    return if total == 0 { last_status() } else { clamp(total) };
                }
                let n = n as usize;
                total += n;
                pos += n as u64;
                if n < buf.len() {
                    break;
                }
            }
            clamp(total)
        }
    }
}

fn writev(fd: Fd, data: &[Bytes], position: WirePosition) -> i32 {
    match at(position) {
        None => {
            let iov: Vec<libc::iovec> = data
                .iter()
                .map(|chunk| libc::iovec {
                    iov_base: chunk.as_ptr() as *mut libc::c_void,
                    iov_len: chunk.len(),
                })
                .collect();
            check_len(unsafe { libc::writev(raw(fd), iov.as_ptr(), iov.len() as c_int) })
        }
        Some(mut pos) => {
            let mut total = 0usize;
            for chunk in data {
                let n = sys_write(fd, chunk, Some(pos));
                if n < 0 {
                    return if total == 0 { last_status() } else { clamp(total) };
                }
                let n = n as usize;
                total += n;
                pos += n as u64;
                if n < chunk.len() {
                    break;
                }
            }
            clamp(total)
        }
    }
}

fn clamp(total: usize) -> i32 {
    i32::try_from(total).unwrap_or(i32::MAX)
}

fn stat_path(path: &Path, buf: &mut BytesMut, follow: bool) -> i32 {
    let path = match cpath(path) {
        Ok(path) => path,
        Err(status) => return status,
    };
    let mut st: libc::stat = unsafe { mem::zeroed() };
    let ret = unsafe {
        if follow {
            libc::stat(path.as_ptr(), &mut st)
        } else {
            libc::lstat(path.as_ptr(), &mut st)
        }
    };
    match check(ret) {
        0 => fill_stats(&st, buf),
        status => status,
    }
}

fn fill_stats(st: &libc::stat, buf: &mut BytesMut) -> i32 {
    if buf.len() < STAT_BUFFER_LEN {
        buf.resize(STAT_BUFFER_LEN, 0);
    }
    match stats_from(st).encode_into(buf, ByteOrder::native()) {
        Ok(()) => 0,
        Err(_) => -libc::EINVAL,
    }
}

#[allow(clippy::unnecessary_cast)]
fn stats_from(st: &libc::stat) -> Stats {
    let (flags, generation, birthtime_ms) = bsd_fields(st);
    Stats {
        dev: st.st_dev as u64,
        mode: st.st_mode as u64,
        nlink: st.st_nlink as u64,
        uid: st.st_uid as u64,
        gid: st.st_gid as u64,
        rdev: st.st_rdev as u64,
        ino: st.st_ino as u64,
        size: st.st_size.max(0) as u64,
        blksize: st.st_blksize.max(0) as u64,
        blocks: st.st_blocks.max(0) as u64,
        flags,
        generation,
        atime_ms: millis(st.st_atime as i64, st.st_atime_nsec as i64),
        mtime_ms: millis(st.st_mtime as i64, st.st_mtime_nsec as i64),
        ctime_ms: millis(st.st_ctime as i64, st.st_ctime_nsec as i64),
        birthtime_ms,
    }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
#[allow(clippy::unnecessary_cast)]
fn bsd_fields(st: &libc::stat) -> (u64, u64, u64) {
    (
        st.st_flags as u64,
        st.st_gen as u64,
        millis(st.st_birthtime as i64, st.st_birthtime_nsec as i64),
    )
}

// No flags, generation or birth time here; report ctime as birth time.
#[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "freebsd")))]
#[allow(clippy::unnecessary_cast)]
fn bsd_fields(st: &libc::stat) -> (u64, u64, u64) {
    (0, 0, millis(st.st_ctime as i64, st.st_ctime_nsec as i64))
}

fn millis(sec: i64, nsec: i64) -> u64 {
    if sec < 0 {
        return 0;
    }
    (sec as u64) * 1000 + (nsec.max(0) as u64) / 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn nul_in_path_is_einval() {
        let path = PathBuf::from(std::ffi::OsStr::from_bytes(b"bad\0path"));
        let (result, _) = execute(Op::Mkdir { path, mode: 0o777 });
        assert_eq!(result, -libc::EINVAL);
    }

    #[test]
    fn missing_file_reports_enoent() {
        let dir = tempfile::tempdir().unwrap();
        let (result, _) = execute(Op::Open {
            path: dir.path().join("missing"),
            flags: libc::O_RDONLY,
            mode: 0,
        });
        assert_eq!(result, -libc::ENOENT);
    }

    #[test]
    fn out_of_bounds_span_is_einval() {
        let (result, payload) = execute(Op::Read {
            fd: Fd::new(0).unwrap(),
            buf: BytesMut::zeroed(4),
            offset: 2,
            len: 8,
            position: WirePosition::AUTO,
        });
        assert_eq!(result, -libc::EINVAL);
        assert_eq!(payload.into_buf().unwrap().len(), 4);
    }

    #[test]
    fn millis_truncates_and_clamps() {
        assert_eq!(millis(2, 999_999_999), 2999);
        assert_eq!(millis(-5, 0), 0);
    }

    #[tokio::test]
    async fn submitted_stat_completes_through_dispatcher() {
        let dir = tempfile::tempdir().unwrap();
        let engine = BlockingEngine::new();
        let dispatcher = Dispatcher::new(crate::error::ErrorMapper::host(), 0);
        engine.init(dispatcher.clone()).unwrap();
        assert!(matches!(
            engine.init(dispatcher.clone()),
            Err(FsError::AlreadyInitialized)
        ));

        let (completion, rx) = dispatcher.issue();
        engine.submit(Submission {
            completion,
            op: Op::Stat {
                path: dir.path().to_path_buf(),
                buf: BytesMut::zeroed(STAT_BUFFER_LEN),
            },
        });
        let done = rx.await.unwrap().unwrap();
        let stats = Stats::decode(&done.payload.into_buf().unwrap(), ByteOrder::native()).unwrap();
        assert!(crate::stats::is_directory(&stats));
    }
}
