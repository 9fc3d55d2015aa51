//! Platform flag/mode constants and argument normalization.
//!
//! Everything here is stateless translation: Node flag strings to numeric
//! open flags, octal mode strings to numbers, raw integers to validated
//! descriptors. All failures are argument errors raised before a slot is
//! acquired.

use crate::error::{FsError, FsResult};
use std::fmt;

/// Open-flag and file-type constants reported by the engine.
///
/// POSIX-only file types are reported as 0 on platforms lacking them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constants {
    pub o_rdonly: i32,
    pub o_wronly: i32,
    pub o_rdwr: i32,
    pub o_creat: i32,
    pub o_trunc: i32,
    pub o_append: i32,
    pub o_excl: i32,
    pub o_sync: i32,
    pub s_ifmt: u32,
    pub s_ifreg: u32,
    pub s_ifdir: u32,
    pub s_ifchr: u32,
    pub s_iflnk: u32,
    pub s_ifblk: u32,
    pub s_ififo: u32,
    pub s_ifsock: u32,
}

impl Constants {
    /// Constants of the platform this crate was compiled for.
    pub const HOST: Constants = Constants::host();

    #[cfg(unix)]
    pub const fn host() -> Self {
        Self {
            o_rdonly: libc::O_RDONLY,
            o_wronly: libc::O_WRONLY,
            o_rdwr: libc::O_RDWR,
            o_creat: libc::O_CREAT,
            o_trunc: libc::O_TRUNC,
            o_append: libc::O_APPEND,
            o_excl: libc::O_EXCL,
            o_sync: libc::O_SYNC,
            s_ifmt: libc::S_IFMT as u32,
            s_ifreg: libc::S_IFREG as u32,
            s_ifdir: libc::S_IFDIR as u32,
            s_ifchr: libc::S_IFCHR as u32,
            s_iflnk: libc::S_IFLNK as u32,
            s_ifblk: libc::S_IFBLK as u32,
            s_ififo: libc::S_IFIFO as u32,
            s_ifsock: libc::S_IFSOCK as u32,
        }
    }

    // Values Node reports on Windows.
    #[cfg(not(unix))]
    pub const fn host() -> Self {
        Self {
            o_rdonly: 0,
            o_wronly: 0x1,
            o_rdwr: 0x2,
            o_creat: 0x100,
            o_trunc: 0x200,
            o_append: 0x8,
            o_excl: 0x400,
            o_sync: 0,
            s_ifmt: 0o170000,
            s_ifreg: 0o100000,
            s_ifdir: 0o040000,
            s_ifchr: 0o020000,
            s_iflnk: 0o120000,
            s_ifblk: 0,
            s_ififo: 0,
            s_ifsock: 0,
        }
    }
}

impl Default for Constants {
    fn default() -> Self {
        Self::HOST
    }
}

/// Translate a Node flag string (`"r"`, `"wx+"`, ...) into open flags.
pub fn string_to_flags(flags: &str, c: &Constants) -> FsResult<i32> {
    let bits = match flags {
        "r" => c.o_rdonly,
        "rs" | "sr" => c.o_rdonly | c.o_sync,
        "r+" => c.o_rdwr,
        "rs+" | "sr+" => c.o_rdwr | c.o_sync,

        "w" => c.o_trunc | c.o_creat | c.o_wronly,
        "wx" | "xw" => c.o_trunc | c.o_creat | c.o_wronly | c.o_excl,
        "w+" => c.o_trunc | c.o_creat | c.o_rdwr,
        "wx+" | "xw+" => c.o_trunc | c.o_creat | c.o_rdwr | c.o_excl,

        "a" => c.o_append | c.o_creat | c.o_wronly,
        "ax" | "xa" => c.o_append | c.o_creat | c.o_wronly | c.o_excl,
        "as" | "sa" => c.o_append | c.o_creat | c.o_wronly | c.o_sync,
        "a+" => c.o_append | c.o_creat | c.o_rdwr,
        "ax+" | "xa+" => c.o_append | c.o_creat | c.o_rdwr | c.o_excl,
        "as+" | "sa+" => c.o_append | c.o_creat | c.o_rdwr | c.o_sync,

        _ => {
            return Err(FsError::invalid_value(format!(
                "The argument 'flags' is invalid. Received '{flags}'"
            )));
        }
    };
    Ok(bits)
}

/// Open flags as accepted by `open`: a Node flag string or raw bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenFlags {
    Str(String),
    Bits(i32),
}

impl OpenFlags {
    pub fn resolve(&self, c: &Constants) -> FsResult<i32> {
        match self {
            Self::Str(s) => string_to_flags(s, c),
            Self::Bits(bits) => Ok(*bits),
        }
    }
}

impl From<&str> for OpenFlags {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for OpenFlags {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i32> for OpenFlags {
    fn from(value: i32) -> Self {
        Self::Bits(value)
    }
}

/// File mode as accepted by `open`/`mkdir`: a number or an octal string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Bits(u32),
    Octal(String),
}

impl Mode {
    pub fn resolve(&self) -> FsResult<u32> {
        match self {
            Self::Bits(bits) => Ok(*bits),
            Self::Octal(text) => parse_octal_mode(text),
        }
    }
}

impl From<u32> for Mode {
    fn from(value: u32) -> Self {
        Self::Bits(value)
    }
}

impl From<&str> for Mode {
    fn from(value: &str) -> Self {
        Self::Octal(value.to_string())
    }
}

impl From<String> for Mode {
    fn from(value: String) -> Self {
        Self::Octal(value)
    }
}

/// Resolve an optional mode argument, falling back to `default` when omitted.
pub fn resolve_mode(mode: Option<&Mode>, default: u32) -> FsResult<u32> {
    mode.map_or(Ok(default), Mode::resolve)
}

fn parse_octal_mode(text: &str) -> FsResult<u32> {
    let digits = text.strip_prefix("0o").unwrap_or(text);
    if digits.is_empty() || !digits.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
        return Err(FsError::invalid_value(format!(
            "The argument 'mode' must be a 32-bit unsigned integer or an octal string. Received '{text}'"
        )));
    }
    u32::from_str_radix(digits, 8).map_err(|_| {
        FsError::out_of_range(format!(
            "The value of \"mode\" is out of range. It must be >= 0 && <= 4294967295. Received {text}"
        ))
    })
}

/// Largest descriptor value accepted by the façade.
pub const MAX_FD: i64 = 0x7fff_ffff;

/// A validated file descriptor, opaque outside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fd(u32);

impl Fd {
    /// Validate a raw descriptor; must lie in `[0, 0x7fffffff]`.
    pub fn new(raw: i64) -> FsResult<Self> {
        if !(0..=MAX_FD).contains(&raw) {
            return Err(FsError::out_of_range(format!(
                "The value of \"fd\" is out of range. It must be >= 0 && <= {MAX_FD}. Received {raw}"
            )));
        }
        Ok(Self(raw as u32))
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl TryFrom<i32> for Fd {
    type Error = FsError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Self::new(i64::from(value))
    }
}

impl TryFrom<i64> for Fd {
    type Error = FsError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ERR_INVALID_ARG_VALUE, ERR_OUT_OF_RANGE};

    #[test]
    fn flag_strings_follow_node_table() {
        let c = Constants::HOST;
        assert_eq!(string_to_flags("r", &c).unwrap(), c.o_rdonly);
        assert_eq!(string_to_flags("r+", &c).unwrap(), c.o_rdwr);
        assert_eq!(
            string_to_flags("w", &c).unwrap(),
            c.o_trunc | c.o_creat | c.o_wronly
        );
        assert_eq!(
            string_to_flags("w+", &c).unwrap(),
            c.o_trunc | c.o_creat | c.o_rdwr
        );
        assert_eq!(
            string_to_flags("a", &c).unwrap(),
            c.o_append | c.o_creat | c.o_wronly
        );
        assert_eq!(
            string_to_flags("ax+", &c).unwrap(),
            c.o_append | c.o_creat | c.o_rdwr | c.o_excl
        );
    }

    #[test]
    fn flag_aliases_are_equivalent() {
        let c = Constants::HOST;
        for (a, b) in [
            ("rs", "sr"),
            ("rs+", "sr+"),
            ("wx", "xw"),
            ("wx+", "xw+"),
            ("ax", "xa"),
            ("as", "sa"),
            ("ax+", "xa+"),
            ("as+", "sa+"),
        ] {
            assert_eq!(
                string_to_flags(a, &c).unwrap(),
                string_to_flags(b, &c).unwrap(),
                "{a} vs {b}"
            );
        }
    }

    #[test]
    fn unknown_flag_string_is_rejected() {
        let err = string_to_flags("rw", &Constants::HOST).unwrap_err();
        assert_eq!(err.code(), ERR_INVALID_ARG_VALUE);
        assert!(err.to_string().contains("'rw'"));
    }

    #[test]
    fn numeric_flags_pass_through() {
        let flags = OpenFlags::from(0o1234);
        assert_eq!(flags.resolve(&Constants::HOST).unwrap(), 0o1234);
    }

    #[test]
    fn octal_modes_parse() {
        assert_eq!(Mode::from("644").resolve().unwrap(), 0o644);
        assert_eq!(Mode::from("0o755").resolve().unwrap(), 0o755);
        assert_eq!(Mode::from(0o600).resolve().unwrap(), 0o600);
        assert_eq!(resolve_mode(None, 0o666).unwrap(), 0o666);
    }

    #[test]
    fn bad_modes_are_rejected() {
        for bad in ["", "0o", "8", "rwx", "-1"] {
            let err = Mode::from(bad).resolve().unwrap_err();
            assert_eq!(err.code(), ERR_INVALID_ARG_VALUE, "{bad:?}");
        }
        let err = Mode::from("777777777777").resolve().unwrap_err();
        assert_eq!(err.code(), ERR_OUT_OF_RANGE);
    }

    #[test]
    fn descriptor_range_is_enforced() {
        assert_eq!(Fd::new(0).unwrap().raw(), 0);
        assert_eq!(Fd::new(MAX_FD).unwrap().raw(), 0x7fff_ffff);
        assert_eq!(Fd::new(-1).unwrap_err().code(), ERR_OUT_OF_RANGE);
        assert_eq!(Fd::new(MAX_FD + 1).unwrap_err().code(), ERR_OUT_OF_RANGE);
        assert!(Fd::try_from(-5_i32).is_err());
    }
}
