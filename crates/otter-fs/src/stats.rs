//! Stats decoding.
//!
//! Engines fill a 128-byte buffer with sixteen 64-bit fields, each laid out
//! as two 32-bit words in the engine's byte order:
//!
//! ```text
//! dev mode nlink uid gid rdev ino size blksize blocks flags gen
//! atimeMs mtimeMs ctimeMs birthtimeMs
//! ```

use crate::constants::Constants;
use crate::error::{FsError, FsResult};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Size of a stat buffer in bytes.
pub const STAT_BUFFER_LEN: usize = 128;

const FIELD_COUNT: usize = STAT_BUFFER_LEN / 8;

/// How paired 32-bit words combine into one 64-bit field.
///
/// Little: the first word is the low half. Big: the first word is the high
/// half, and each word is itself big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    /// Byte order of the compilation target.
    pub const fn native() -> Self {
        if cfg!(target_endian = "little") {
            Self::Little
        } else {
            Self::Big
        }
    }

    fn word(self, bytes: [u8; 4]) -> u32 {
        match self {
            Self::Little => u32::from_le_bytes(bytes),
            Self::Big => u32::from_be_bytes(bytes),
        }
    }

    fn combine(self, first: u32, second: u32) -> u64 {
        let (low, high) = match self {
            Self::Little => (first, second),
            Self::Big => (second, first),
        };
        (u64::from(high) << 32) | u64::from(low)
    }

    fn field_bytes(self, value: u64) -> [u8; 8] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }
}

impl Default for ByteOrder {
    fn default() -> Self {
        Self::native()
    }
}

/// Decoded file metadata. Timestamps are milliseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    pub dev: u64,
    pub mode: u64,
    pub nlink: u64,
    pub uid: u64,
    pub gid: u64,
    pub rdev: u64,
    pub ino: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub flags: u64,
    pub generation: u64,
    pub atime_ms: u64,
    pub mtime_ms: u64,
    pub ctime_ms: u64,
    pub birthtime_ms: u64,
}

impl Stats {
    /// Decode a stat buffer written in `order`.
    pub fn decode(buf: &[u8], order: ByteOrder) -> FsResult<Self> {
        if buf.len() < STAT_BUFFER_LEN {
            return Err(FsError::out_of_range(format!(
                "stat buffer must be at least {STAT_BUFFER_LEN} bytes, got {}",
                buf.len()
            )));
        }

        let mut fields = [0u64; FIELD_COUNT];
        for (n, field) in fields.iter_mut().enumerate() {
            let at = n * 8;
            let first = order.word([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
            let second = order.word([buf[at + 4], buf[at + 5], buf[at + 6], buf[at + 7]]);
            *field = order.combine(first, second);
        }

        let [
            dev,
            mode,
            nlink,
            uid,
            gid,
            rdev,
            ino,
            size,
            blksize,
            blocks,
            flags,
            generation,
            atime_ms,
            mtime_ms,
            ctime_ms,
            birthtime_ms,
        ] = fields;

        Ok(Self {
            dev,
            mode,
            nlink,
            uid,
            gid,
            rdev,
            ino,
            size,
            blksize,
            blocks,
            flags,
            generation,
            atime_ms,
            mtime_ms,
            ctime_ms,
            birthtime_ms,
        })
    }

    /// Engine side of [`Stats::decode`]: write the fields into `buf`.
    pub fn encode_into(&self, buf: &mut [u8], order: ByteOrder) -> FsResult<()> {
        if buf.len() < STAT_BUFFER_LEN {
            return Err(FsError::out_of_range(format!(
                "stat buffer must be at least {STAT_BUFFER_LEN} bytes, got {}",
                buf.len()
            )));
        }
        let fields = [
            self.dev,
            self.mode,
            self.nlink,
            self.uid,
            self.gid,
            self.rdev,
            self.ino,
            self.size,
            self.blksize,
            self.blocks,
            self.flags,
            self.generation,
            self.atime_ms,
            self.mtime_ms,
            self.ctime_ms,
            self.birthtime_ms,
        ];
        for (chunk, value) in buf.chunks_exact_mut(8).zip(fields) {
            chunk.copy_from_slice(&order.field_bytes(value));
        }
        Ok(())
    }

    pub fn atime(&self) -> SystemTime {
        ms_to_time(self.atime_ms)
    }

    pub fn mtime(&self) -> SystemTime {
        ms_to_time(self.mtime_ms)
    }

    pub fn ctime(&self) -> SystemTime {
        ms_to_time(self.ctime_ms)
    }

    pub fn birthtime(&self) -> SystemTime {
        ms_to_time(self.birthtime_ms)
    }
}

fn ms_to_time(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

fn has_type(stats: &Stats, kind: u32) -> bool {
    let c = Constants::HOST;
    kind != 0 && (stats.mode & u64::from(c.s_ifmt)) == u64::from(kind)
}

pub fn is_file(stats: &Stats) -> bool {
    has_type(stats, Constants::HOST.s_ifreg)
}

pub fn is_directory(stats: &Stats) -> bool {
    has_type(stats, Constants::HOST.s_ifdir)
}

pub fn is_symbolic_link(stats: &Stats) -> bool {
    has_type(stats, Constants::HOST.s_iflnk)
}

pub fn is_character_device(stats: &Stats) -> bool {
    has_type(stats, Constants::HOST.s_ifchr)
}

pub fn is_block_device(stats: &Stats) -> bool {
    has_type(stats, Constants::HOST.s_ifblk)
}

pub fn is_fifo(stats: &Stats) -> bool {
    has_type(stats, Constants::HOST.s_ififo)
}

pub fn is_socket(stats: &Stats) -> bool {
    has_type(stats, Constants::HOST.s_ifsock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample(mode: u64) -> Stats {
        Stats {
            dev: 2049,
            mode,
            nlink: 1,
            uid: 1000,
            gid: 100,
            rdev: 0,
            ino: 0x1_0000_0003,
            size: 3,
            blksize: 4096,
            blocks: 8,
            flags: 0,
            generation: 7,
            atime_ms: 1_700_000_000_123,
            mtime_ms: 1_700_000_000_456,
            ctime_ms: 1_700_000_000_789,
            birthtime_ms: 1_600_000_000_000,
        }
    }

    #[test]
    fn little_endian_words_combine_low_first() {
        let mut buf = [0u8; STAT_BUFFER_LEN];
        // size field: low word 5, high word 1
        buf[56..60].copy_from_slice(&5u32.to_le_bytes());
        buf[60..64].copy_from_slice(&1u32.to_le_bytes());
        let stats = Stats::decode(&buf, ByteOrder::Little).unwrap();
        assert_eq!(stats.size, 0x1_0000_0005);
    }

    #[test]
    fn big_endian_words_combine_high_first() {
        let mut buf = [0u8; STAT_BUFFER_LEN];
        buf[56..60].copy_from_slice(&1u32.to_be_bytes());
        buf[60..64].copy_from_slice(&5u32.to_be_bytes());
        let stats = Stats::decode(&buf, ByteOrder::Big).unwrap();
        assert_eq!(stats.size, 0x1_0000_0005);
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert!(Stats::decode(&[0u8; 64], ByteOrder::native()).is_err());
    }

    #[test]
    fn predicates_follow_mode_bits() {
        let c = Constants::HOST;
        let file = sample(u64::from(c.s_ifreg) | 0o644);
        assert!(is_file(&file));
        assert!(!is_directory(&file));
        assert!(!is_symbolic_link(&file));

        let dir = sample(u64::from(c.s_ifdir) | 0o755);
        assert!(is_directory(&dir));
        assert!(!is_file(&dir));

        // S_IFLNK shares bits with S_IFREG; only the full type field decides.
        let link = sample(u64::from(c.s_iflnk) | 0o777);
        assert!(is_symbolic_link(&link));
        assert!(!is_file(&link));
    }

    #[test]
    fn timestamps_convert_to_system_time() {
        let stats = sample(0);
        let mtime = stats.mtime().duration_since(UNIX_EPOCH).unwrap();
        assert_eq!(mtime.as_millis(), 1_700_000_000_456);
    }

    proptest! {
        #[test]
        fn prop_encoded_stats_decode_identically(
            size in any::<u64>(),
            ino in any::<u64>(),
            mtime_ms in 0u64..(1 << 53),
            perm in 0u64..0o7777,
            big in any::<bool>(),
        ) {
            let order = if big { ByteOrder::Big } else { ByteOrder::Little };
            let c = Constants::HOST;
            let stats = Stats { size, ino, mtime_ms, ..sample(u64::from(c.s_ifdir) | perm) };
            let mut buf = [0u8; STAT_BUFFER_LEN];
            stats.encode_into(&mut buf, order).unwrap();
            let decoded = Stats::decode(&buf, order).unwrap();
            prop_assert_eq!(decoded, stats);
            prop_assert!(is_directory(&decoded));
            prop_assert!(!is_file(&decoded));
        }
    }
}
