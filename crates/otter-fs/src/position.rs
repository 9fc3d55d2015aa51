//! File positions on the engine wire.
//!
//! The engine takes 64-bit offsets as two 32-bit words. The pair
//! `(0xffffffff, 0xffffffff)` is reserved for "use the descriptor's current
//! position", so only positions up to 2^53 - 1 are accepted.

use crate::error::{FsError, FsResult};

/// Word value used in both halves of the automatic-position sentinel.
pub const AUTO_WORD: u32 = 0xffff_ffff;

/// Largest position the façade accepts (`Number.MAX_SAFE_INTEGER`).
pub const MAX_SAFE_POSITION: u64 = (1 << 53) - 1;

const WORD: u64 = 0x1_0000_0000;

/// Where a read or write happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Position {
    /// Use and advance the descriptor's own cursor.
    #[default]
    Current,
    /// Absolute byte offset; the cursor is left untouched.
    At(u64),
}

impl Position {
    /// Validate and split into wire words.
    pub fn encode(self) -> FsResult<WirePosition> {
        match self {
            Self::Current => Ok(WirePosition::AUTO),
            Self::At(pos) => WirePosition::from_u64(pos),
        }
    }
}

impl From<u64> for Position {
    fn from(value: u64) -> Self {
        Self::At(value)
    }
}

impl From<Option<u64>> for Position {
    fn from(value: Option<u64>) -> Self {
        value.map_or(Self::Current, Self::At)
    }
}

/// A position (or length) as the engine sees it: `(low, high)` words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WirePosition {
    pub low: u32,
    pub high: u32,
}

impl WirePosition {
    pub const AUTO: WirePosition = WirePosition {
        low: AUTO_WORD,
        high: AUTO_WORD,
    };

    /// Split a value into `low = value mod 2^32`, `high = (value - low) / 2^32`.
    pub fn from_u64(value: u64) -> FsResult<Self> {
        if value > MAX_SAFE_POSITION {
            return Err(FsError::out_of_range(format!(
                "The value of \"position\" is out of range. It must be >= 0 && <= {MAX_SAFE_POSITION}. Received {value}"
            )));
        }
        let low = value & 0xffff_ffff;
        let high = (value - low) / WORD;
        Ok(Self {
            low: low as u32,
            high: high as u32,
        })
    }

    pub fn is_auto(self) -> bool {
        self == Self::AUTO
    }

    /// Recombine as `high * 2^32 + low`, ignoring the sentinel.
    pub fn to_u64(self) -> u64 {
        u64::from(self.high) * WORD + u64::from(self.low)
    }

    pub fn decode(self) -> Position {
        if self.is_auto() {
            Position::Current
        } else {
            Position::At(self.to_u64())
        }
    }
}
