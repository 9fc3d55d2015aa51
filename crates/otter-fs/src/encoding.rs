//! Text encodings accepted by `read_file`/`write_file`.

use crate::error::{FsError, FsResult};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    /// One byte per code unit; `"binary"` is an alias.
    Latin1,
    Ascii,
    Hex,
    Base64,
    Base64Url,
}

impl Encoding {
    /// Bytes to text. Invalid UTF-8 is replaced, never an error.
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Self::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Self::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
            Self::Ascii => bytes.iter().map(|&b| char::from(b & 0x7f)).collect(),
            Self::Hex => hex::encode(bytes),
            Self::Base64 => STANDARD.encode(bytes),
            Self::Base64Url => URL_SAFE_NO_PAD.encode(bytes),
        }
    }

    /// Text to bytes.
    ///
    /// Hex input stops at the first character that is not a hex digit and
    /// drops a trailing odd nibble. Both base64 flavours accept either
    /// alphabet, with or without padding.
    pub fn encode(self, text: &str) -> FsResult<Vec<u8>> {
        match self {
            Self::Utf8 => Ok(text.as_bytes().to_vec()),
            // Code points above U+00FF keep their low byte.
            Self::Latin1 | Self::Ascii => Ok(text.chars().map(|ch| ch as u32 as u8).collect()),
            Self::Hex => {
                let digits = text
                    .bytes()
                    .take_while(u8::is_ascii_hexdigit)
                    .count();
                hex::decode(&text[..digits - digits % 2])
                    .map_err(|e| FsError::invalid_value(format!("invalid hex string: {e}")))
            }
            Self::Base64 | Self::Base64Url => {
                let normalized: String = text
                    .chars()
                    .filter(|ch| !ch.is_ascii_whitespace() && *ch != '=')
                    .map(|ch| match ch {
                        '-' => '+',
                        '_' => '/',
                        other => other,
                    })
                    .collect();
                base64::engine::general_purpose::STANDARD_NO_PAD
                    .decode(normalized)
                    .map_err(|e| FsError::invalid_value(format!("invalid base64 string: {e}")))
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Utf8 => "utf8",
            Self::Latin1 => "latin1",
            Self::Ascii => "ascii",
            Self::Hex => "hex",
            Self::Base64 => "base64",
            Self::Base64Url => "base64url",
        }
    }
}

impl FromStr for Encoding {
    type Err = FsError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Self::Utf8),
            "latin1" | "binary" => Ok(Self::Latin1),
            "ascii" => Ok(Self::Ascii),
            "hex" => Ok(Self::Hex),
            "base64" => Ok(Self::Base64),
            "base64url" => Ok(Self::Base64Url),
            _ => Err(FsError::unknown_encoding(name)),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ERR_UNKNOWN_ENCODING;

    #[test]
    fn names_parse_case_insensitively() {
        assert_eq!("UTF-8".parse::<Encoding>().unwrap(), Encoding::Utf8);
        assert_eq!("binary".parse::<Encoding>().unwrap(), Encoding::Latin1);
        assert_eq!("base64url".parse::<Encoding>().unwrap(), Encoding::Base64Url);
        let err = "utf16".parse::<Encoding>().unwrap_err();
        assert_eq!(err.code(), ERR_UNKNOWN_ENCODING);
    }

    #[test]
    fn lossy_utf8_and_latin1() {
        assert_eq!(Encoding::Utf8.decode(b"MIT"), "MIT");
        assert_eq!(Encoding::Utf8.decode(&[0x66, 0xff]), "f\u{fffd}");
        assert_eq!(Encoding::Latin1.decode(&[0xe9]), "é");
        assert_eq!(Encoding::Latin1.encode("é").unwrap(), vec![0xe9]);
        assert_eq!(Encoding::Ascii.decode(&[0xc1]), "A");
    }

    #[test]
    fn hex_is_lenient_about_trailing_garbage() {
        assert_eq!(Encoding::Hex.decode(b"\x01\xab"), "01ab");
        assert_eq!(Encoding::Hex.encode("01abz9").unwrap(), vec![0x01, 0xab]);
        assert_eq!(Encoding::Hex.encode("abc").unwrap(), vec![0xab]);
    }

    #[test]
    fn base64_accepts_both_alphabets() {
        let bytes = [0xfb, 0xff, 0x00];
        assert_eq!(Encoding::Base64.decode(&bytes), "+/8A");
        assert_eq!(Encoding::Base64Url.decode(&bytes), "-_8A");
        assert_eq!(Encoding::Base64.encode("-_8A").unwrap(), bytes);
        assert_eq!(Encoding::Base64Url.encode("+/8A").unwrap(), bytes);
        assert_eq!(Encoding::Base64.encode("SVND").unwrap(), b"ISC");
        assert_eq!(Encoding::Base64.encode("SQ==").unwrap(), b"I");
        assert!(Encoding::Base64.encode("*").is_err());
    }
}
