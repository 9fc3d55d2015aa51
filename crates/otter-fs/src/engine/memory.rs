//! In-memory engine.
//!
//! A small POSIX-flavoured namespace kept behind a mutex. Used by tests and
//! embedders that need a filesystem without touching the host:
//!
//! - `max_transfer` caps every read/write at N bytes, forcing callers
//!   through their partial-transfer loops.
//! - [`CompletionMode::Manual`] applies each operation on submit but holds
//!   its completion until the test releases it, in whatever order it likes.
//! - `max_file_size` turns growth past the ceiling into `EFBIG`.

use crate::constants::{Constants, Fd};
use crate::dispatch::{Completion, Dispatcher};
use crate::engine::{Engine, Op, Payload, Submission};
use crate::error::{FsError, FsResult};
use crate::position::WirePosition;
use crate::stats::{ByteOrder, STAT_BUFFER_LEN, Stats};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

const ROOT_INO: u64 = 1;
const FIRST_FD: u32 = 3;
const BLOCK_SIZE: u64 = 4096;
/// Largest file the engine will hold unless told otherwise.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 4 << 30;

/// When completions are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Complete inside `submit`.
    #[default]
    Immediate,
    /// Queue completions until released.
    Manual,
}

#[derive(Debug)]
enum NodeKind {
    File(Vec<u8>),
    Dir,
}

#[derive(Debug)]
struct Node {
    kind: NodeKind,
    perm: u32,
    nlink: u64,
    atime_ms: u64,
    mtime_ms: u64,
    ctime_ms: u64,
    birthtime_ms: u64,
}

impl Node {
    fn new(kind: NodeKind, perm: u32) -> Self {
        let now = now_ms();
        Self {
            kind,
            perm: perm & 0o7777,
            nlink: 1,
            atime_ms: now,
            mtime_ms: now,
            ctime_ms: now,
            birthtime_ms: now,
        }
    }

    fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Dir)
    }

    fn touch(&mut self) {
        let now = now_ms();
        self.mtime_ms = now;
        self.ctime_ms = now;
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenFile {
    ino: u64,
    readable: bool,
    writable: bool,
    append: bool,
    cursor: u64,
}

#[derive(Debug)]
struct Namespace {
    names: HashMap<PathBuf, u64>,
    nodes: HashMap<u64, Node>,
    fds: HashMap<u32, OpenFile>,
    next_ino: u64,
    next_fd: u32,
}

#[derive(Debug)]
struct Held {
    completion: Completion,
    result: i32,
    payload: Payload,
}

/// Engine keeping every file in memory.
#[derive(Debug)]
pub struct MemoryEngine {
    ns: Mutex<Namespace>,
    held: Mutex<VecDeque<Held>>,
    dispatcher: OnceLock<Dispatcher>,
    constants: Constants,
    max_transfer: Option<usize>,
    max_file_size: u64,
    mode: CompletionMode,
    byte_order: ByteOrder,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// Empty namespace containing only the root directory.
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_INO, Node::new(NodeKind::Dir, 0o755));
        let mut names = HashMap::new();
        names.insert(PathBuf::new(), ROOT_INO);

        Self {
            ns: Mutex::new(Namespace {
                names,
                nodes,
                fds: HashMap::new(),
                next_ino: ROOT_INO + 1,
                next_fd: FIRST_FD,
            }),
            held: Mutex::new(VecDeque::new()),
            dispatcher: OnceLock::new(),
            constants: Constants::HOST,
            max_transfer: None,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            mode: CompletionMode::Immediate,
            byte_order: ByteOrder::native(),
        }
    }

    /// Cap every read and write at `bytes` (minimum 1).
    pub fn with_max_transfer(mut self, bytes: usize) -> Self {
        self.max_transfer = Some(bytes.max(1));
        self
    }

    /// Writes and truncations that would grow a file past `bytes` fail
    /// with `EFBIG`.
    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn with_completion_mode(mut self, mode: CompletionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Byte order used when filling stat buffers.
    pub fn with_byte_order(mut self, order: ByteOrder) -> Self {
        self.byte_order = order;
        self
    }

    /// Create (or replace) a regular file, creating missing parents.
    pub fn insert_file(&self, path: impl AsRef<Path>, data: impl Into<Vec<u8>>) {
        let path = normalize(path.as_ref());
        let mut ns = self.ns.lock();
        ns.ensure_parents(&path);
        if let Some(old) = ns.names.remove(&path) {
            ns.release_node(old);
        }
        ns.link(path, Node::new(NodeKind::File(data.into()), 0o644));
    }

    /// Create a directory, creating missing parents.
    pub fn insert_dir(&self, path: impl AsRef<Path>) {
        let path = normalize(path.as_ref());
        let mut ns = self.ns.lock();
        ns.ensure_parents(&path);
        if !ns.names.contains_key(&path) {
            ns.link(path, Node::new(NodeKind::Dir, 0o755));
        }
    }

    /// Contents of a regular file.
    pub fn contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        let ns = self.ns.lock();
        let ino = ns.names.get(&normalize(path.as_ref()))?;
        match &ns.nodes.get(ino)?.kind {
            NodeKind::File(data) => Some(data.clone()),
            NodeKind::Dir => None,
        }
    }

    pub fn is_dir(&self, path: impl AsRef<Path>) -> bool {
        let ns = self.ns.lock();
        ns.names
            .get(&normalize(path.as_ref()))
            .and_then(|ino| ns.nodes.get(ino))
            .is_some_and(Node::is_dir)
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.ns.lock().names.contains_key(&normalize(path.as_ref()))
    }

    /// Number of descriptors currently open.
    pub fn open_descriptors(&self) -> usize {
        self.ns.lock().fds.len()
    }

    /// Completions held in manual mode.
    pub fn pending_count(&self) -> usize {
        self.held.lock().len()
    }

    /// Deliver the oldest held completion.
    pub fn release_next(&self) -> bool {
        let held = self.held.lock().pop_front();
        self.deliver(held)
    }

    /// Deliver the newest held completion.
    pub fn release_last(&self) -> bool {
        let held = self.held.lock().pop_back();
        self.deliver(held)
    }

    /// Deliver the held completion at `index` (0 = oldest).
    pub fn release_at(&self, index: usize) -> bool {
        let held = self.held.lock().remove(index);
        self.deliver(held)
    }

    /// Deliver everything held, oldest first. Returns how many were released.
    pub fn release_all(&self) -> usize {
        let mut released = 0;
        while self.release_next() {
            released += 1;
        }
        released
    }

    /// Deliver everything held, newest first.
    pub fn release_all_reversed(&self) -> usize {
        let mut released = 0;
        while self.release_last() {
            released += 1;
        }
        released
    }

    fn deliver(&self, held: Option<Held>) -> bool {
        let Some(held) = held else {
            return false;
        };
        held.completion.complete(held.result, held.payload);
        true
    }

    fn execute(&self, op: Op) -> (i32, Payload) {
        let mut ns = self.ns.lock();
        let limit = self.max_transfer.unwrap_or(usize::MAX);
        let max_size = self.max_file_size;
        let c = &self.constants;

        match op {
            Op::Open { path, flags, mode } => (status(ns.open(&path, flags, mode, c)), Payload::None),
            Op::Close { fd } => (status(ns.close(fd)), Payload::None),
            Op::Read {
                fd,
                mut buf,
                offset,
                len,
                position,
            } => {
                let result = match offset.checked_add(len).and_then(|end| buf.get_mut(offset..end)) {
                    Some(target) => ns.read(fd, &mut [target], position, limit),
                    None => Err(libc::EINVAL),
                };
                (status(result), Payload::Buf(buf))
            }
            Op::Readv {
                fd,
                mut bufs,
                position,
            } => {
                let mut targets: Vec<&mut [u8]> = bufs.iter_mut().map(|buf| &mut buf[..]).collect();
                let result = ns.read(fd, &mut targets, position, limit);
                (status(result), Payload::Bufs(bufs))
            }
            Op::Write {
                fd,
                data,
                offset,
                len,
                position,
            } => {
                let result = match offset.checked_add(len).and_then(|end| data.get(offset..end)) {
                    Some(source) => ns.write(fd, &[source], position, limit, max_size),
                    None => Err(libc::EINVAL),
                };
                (status(result), Payload::Data(data))
            }
            Op::Writev { fd, data, position } => {
                let sources: Vec<&[u8]> = data.iter().map(|chunk| &chunk[..]).collect();
                let result = ns.write(fd, &sources, position, limit, max_size);
                (status(result), Payload::DataVec(data))
            }
            Op::Ftruncate { fd, len } => (status(ns.ftruncate(fd, len, max_size)), Payload::None),
            Op::Stat { path, mut buf } | Op::Lstat { path, mut buf } => {
                let result = ns
                    .resolve(&path)
                    .and_then(|ino| ns.fill_stats(ino, &mut buf, self.byte_order, c));
                (status(result), Payload::Buf(buf))
            }
            Op::Fstat { fd, mut buf } => {
                let result = ns
                    .fd(fd)
                    .and_then(|file| ns.fill_stats(file.ino, &mut buf, self.byte_order, c));
                (status(result), Payload::Buf(buf))
            }
            Op::Mkdir { path, mode } => (status(ns.mkdir(&path, mode)), Payload::None),
            Op::Rmdir { path } => (status(ns.rmdir(&path)), Payload::None),
            Op::Unlink { path } => (status(ns.unlink(&path)), Payload::None),
            Op::Rename { from, to } => (status(ns.rename(&from, &to)), Payload::None),
        }
    }
}

impl Engine for MemoryEngine {
    fn init(&self, dispatcher: Dispatcher) -> FsResult<()> {
        self.dispatcher
            .set(dispatcher)
            .map_err(|_| FsError::AlreadyInitialized)
    }

    fn submit(&self, submission: Submission) {
        let Submission { op, completion } = submission;
        let (result, payload) = self.execute(op);
        match self.mode {
            CompletionMode::Immediate => completion.complete(result, payload),
            CompletionMode::Manual => self.held.lock().push_back(Held {
                completion,
                result,
                payload,
            }),
        }
    }

    fn run_sync(&self, op: Op) -> (i32, Payload) {
        self.execute(op)
    }

    fn constants(&self) -> Constants {
        self.constants
    }
}

/// Errors are positive errno values internally and negated on the way out.
type Sys<T> = Result<T, i32>;

fn status<T: TryInto<i32>>(result: Sys<T>) -> i32 {
    match result {
        Ok(value) => value.try_into().unwrap_or(i32::MAX),
        Err(errno) => -errno,
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Drop root and `.` components, fold `..`. The root itself is `""`.
fn normalize(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => result.push(part),
            Component::ParentDir => {
                result.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    result
}

impl Namespace {
    fn link(&mut self, path: PathBuf, node: Node) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        self.nodes.insert(ino, node);
        self.names.insert(path, ino);
        ino
    }

    fn ensure_parents(&mut self, path: &Path) {
        let mut current = PathBuf::new();
        for part in path.parent().into_iter().flat_map(Path::components) {
            current.push(part);
            if !self.names.contains_key(&current) {
                self.link(current.clone(), Node::new(NodeKind::Dir, 0o755));
            }
        }
    }

    fn node(&self, ino: u64) -> Sys<&Node> {
        self.nodes.get(&ino).ok_or(libc::ENOENT)
    }

    fn node_mut(&mut self, ino: u64) -> Sys<&mut Node> {
        self.nodes.get_mut(&ino).ok_or(libc::ENOENT)
    }

    fn fd(&self, fd: Fd) -> Sys<OpenFile> {
        self.fds.get(&fd.raw()).copied().ok_or(libc::EBADF)
    }

    /// Every ancestor must exist and be a directory.
    fn check_ancestors(&self, path: &Path) -> Sys<()> {
        let ancestors: Vec<&Path> = path.ancestors().skip(1).collect();
        for ancestor in ancestors.into_iter().rev() {
            let ino = self.names.get(ancestor).ok_or(libc::ENOENT)?;
            if !self.node(*ino)?.is_dir() {
                return Err(libc::ENOTDIR);
            }
        }
        Ok(())
    }

    fn resolve(&self, path: &Path) -> Sys<u64> {
        let path = normalize(path);
        self.check_ancestors(&path)?;
        self.names.get(&path).copied().ok_or(libc::ENOENT)
    }

    fn has_children(&self, dir: &Path) -> bool {
        self.names.keys().any(|name| name.parent() == Some(dir))
    }

    /// Forget a node once nothing names or holds it.
    fn release_node(&mut self, ino: u64) {
        if let Some(node) = self.nodes.get_mut(&ino) {
            node.nlink = 0;
        }
        if !self.fds.values().any(|file| file.ino == ino) {
            self.nodes.remove(&ino);
        }
    }

    fn open(&mut self, path: &Path, flags: i32, mode: u32, c: &Constants) -> Sys<u32> {
        let path = normalize(path);
        let access = flags & (c.o_wronly | c.o_rdwr);
        let readable = access != c.o_wronly;
        let writable = access == c.o_wronly || access == c.o_rdwr;
        let create = flags & c.o_creat != 0;

        self.check_ancestors(&path)?;
        let ino = match self.names.get(&path).copied() {
            Some(_) if create && flags & c.o_excl != 0 => return Err(libc::EEXIST),
            Some(ino) => {
                let node = self.node_mut(ino)?;
                let truncate = writable && flags & c.o_trunc != 0;
                match &mut node.kind {
                    NodeKind::Dir if writable => return Err(libc::EISDIR),
                    NodeKind::File(data) if truncate => data.clear(),
                    _ => {}
                }
                if truncate {
                    node.touch();
                }
                ino
            }
            None if create => self.link(path, Node::new(NodeKind::File(Vec::new()), mode)),
            None => return Err(libc::ENOENT),
        };

        let fd = self.next_fd;
        self.next_fd += 1;
        self.fds.insert(
            fd,
            OpenFile {
                ino,
                readable,
                writable,
                append: flags & c.o_append != 0,
                cursor: 0,
            },
        );
        Ok(fd)
    }

    fn close(&mut self, fd: Fd) -> Sys<u32> {
        let file = self.fds.remove(&fd.raw()).ok_or(libc::EBADF)?;
        let orphaned = self.nodes.get(&file.ino).is_some_and(|node| node.nlink == 0);
        if orphaned {
            self.release_node(file.ino);
        }
        Ok(0)
    }

    fn read(
        &mut self,
        fd: Fd,
        targets: &mut [&mut [u8]],
        position: WirePosition,
        limit: usize,
    ) -> Sys<usize> {
        let file = self.fd(fd)?;
        if !file.readable {
            return Err(libc::EBADF);
        }
        let node = self.node_mut(file.ino)?;
        let NodeKind::File(data) = &node.kind else {
            return Err(libc::EISDIR);
        };

        let start = if position.is_auto() {
            file.cursor
        } else {
            position.to_u64()
        };
        let mut at = usize::try_from(start).unwrap_or(usize::MAX);
        let mut budget = limit;
        let mut total = 0;
        for target in targets.iter_mut() {
            let available = data.len().saturating_sub(at);
            let n = target.len().min(available).min(budget);
            if n > 0 {
                target[..n].copy_from_slice(&data[at..at + n]);
            }
            at += n;
            total += n;
            budget -= n;
            if n < target.len() {
                break;
            }
        }
        node.atime_ms = now_ms();

        if position.is_auto() {
            self.advance(fd, start + total as u64);
        }
        Ok(total)
    }

    fn write(
        &mut self,
        fd: Fd,
        sources: &[&[u8]],
        position: WirePosition,
        limit: usize,
        max_size: u64,
    ) -> Sys<usize> {
        let file = self.fd(fd)?;
        if !file.writable {
            return Err(libc::EBADF);
        }
        let node = self.node_mut(file.ino)?;
        let NodeKind::File(data) = &mut node.kind else {
            return Err(libc::EISDIR);
        };

        let start = if file.append {
            data.len() as u64
        } else if position.is_auto() {
            file.cursor
        } else {
            position.to_u64()
        };
        let wanted = sources.iter().map(|source| source.len()).sum::<usize>().min(limit);
        if start.saturating_add(wanted as u64) > max_size {
            return Err(libc::EFBIG);
        }
        let mut at = usize::try_from(start).map_err(|_| libc::EFBIG)?;
        let mut budget = limit;
        let mut total = 0;
        for source in sources {
            let n = source.len().min(budget);
            if at + n > data.len() {
                data.resize(at + n, 0);
            }
            data[at..at + n].copy_from_slice(&source[..n]);
            at += n;
            total += n;
            budget -= n;
            if n < source.len() {
                break;
            }
        }
        node.touch();

        if position.is_auto() || file.append {
            self.advance(fd, start + total as u64);
        }
        Ok(total)
    }

    fn advance(&mut self, fd: Fd, cursor: u64) {
        if let Some(file) = self.fds.get_mut(&fd.raw()) {
            file.cursor = cursor;
        }
    }

    fn ftruncate(&mut self, fd: Fd, len: WirePosition, max_size: u64) -> Sys<u32> {
        let file = self.fd(fd)?;
        if !file.writable {
            return Err(libc::EINVAL);
        }
        let len = len.to_u64();
        if len > max_size {
            return Err(libc::EFBIG);
        }
        let len = usize::try_from(len).map_err(|_| libc::EFBIG)?;
        let node = self.node_mut(file.ino)?;
        let NodeKind::File(data) = &mut node.kind else {
            return Err(libc::EINVAL);
        };
        data.resize(len, 0);
        node.touch();
        Ok(0)
    }

    fn fill_stats(&self, ino: u64, buf: &mut BytesMut, order: ByteOrder, c: &Constants) -> Sys<u32> {
        let node = self.node(ino)?;
        let (kind, size) = match &node.kind {
            NodeKind::File(data) => (c.s_ifreg, data.len() as u64),
            NodeKind::Dir => (c.s_ifdir, BLOCK_SIZE),
        };
        let stats = Stats {
            dev: 1,
            mode: u64::from(kind | node.perm),
            nlink: node.nlink,
            uid: 0,
            gid: 0,
            rdev: 0,
            ino,
            size,
            blksize: BLOCK_SIZE,
            blocks: size.div_ceil(512),
            flags: 0,
            generation: 0,
            atime_ms: node.atime_ms,
            mtime_ms: node.mtime_ms,
            ctime_ms: node.ctime_ms,
            birthtime_ms: node.birthtime_ms,
        };
        if buf.len() < STAT_BUFFER_LEN {
            buf.resize(STAT_BUFFER_LEN, 0);
        }
        stats.encode_into(buf, order).map_err(|_| libc::EINVAL)?;
        Ok(0)
    }

    fn mkdir(&mut self, path: &Path, mode: u32) -> Sys<u32> {
        let path = normalize(path);
        self.check_ancestors(&path)?;
        if self.names.contains_key(&path) {
            return Err(libc::EEXIST);
        }
        self.link(path, Node::new(NodeKind::Dir, mode));
        Ok(0)
    }

    fn rmdir(&mut self, path: &Path) -> Sys<u32> {
        let ino = self.resolve(path)?;
        let path = normalize(path);
        if ino == ROOT_INO {
            return Err(libc::EBUSY);
        }
        if !self.node(ino)?.is_dir() {
            return Err(libc::ENOTDIR);
        }
        if self.has_children(&path) {
            return Err(libc::ENOTEMPTY);
        }
        self.names.remove(&path);
        self.release_node(ino);
        Ok(0)
    }

    fn unlink(&mut self, path: &Path) -> Sys<u32> {
        let ino = self.resolve(path)?;
        if self.node(ino)?.is_dir() {
            return Err(libc::EISDIR);
        }
        self.names.remove(&normalize(path));
        self.release_node(ino);
        Ok(0)
    }

    fn rename(&mut self, from: &Path, to: &Path) -> Sys<u32> {
        let source = self.resolve(from)?;
        let from = normalize(from);
        let to = normalize(to);
        self.check_ancestors(&to)?;
        if from == to {
            return Ok(0);
        }
        if source == ROOT_INO {
            return Err(libc::EBUSY);
        }
        let source_is_dir = self.node(source)?.is_dir();
        if source_is_dir && to.starts_with(&from) {
            return Err(libc::EINVAL);
        }

        if let Some(target) = self.names.get(&to).copied() {
            match (source_is_dir, self.node(target)?.is_dir()) {
                (true, false) => return Err(libc::ENOTDIR),
                (false, true) => return Err(libc::EISDIR),
                (true, true) if self.has_children(&to) => return Err(libc::ENOTEMPTY),
                _ => {}
            }
            self.names.remove(&to);
            self.release_node(target);
        }

        let moved: Vec<PathBuf> = self
            .names
            .keys()
            .filter(|name| name.starts_with(&from))
            .cloned()
            .collect();
        for old in moved {
            if let (Some(ino), Ok(rest)) = (self.names.remove(&old), old.strip_prefix(&from)) {
                let new = if rest.as_os_str().is_empty() {
                    to.clone()
                } else {
                    to.join(rest)
                };
                self.names.insert(new, ino);
            }
        }
        if let Ok(node) = self.node_mut(source) {
            node.ctime_ms = now_ms();
        }
        Ok(0)
    }
}
