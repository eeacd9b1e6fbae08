//! Small helpers shared across modules.

use std::borrow::Cow;
use std::fmt;

use serde::Deserialize;
use thiserror::Error;

/// Expand a leading `~` to `$HOME`.
///
/// - `"~"` → `"/home/user"`
/// - `"~/public"` → `"/home/user/public"`
/// - Anything else passes through unchanged.
pub fn expand_tilde(path: &str) -> Cow<'_, str> {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            if path == "~" {
                return Cow::Owned(home);
            }
            return Cow::Owned(format!("{}{}", home, &path[1..]));
        }
    }
    Cow::Borrowed(path)
}

/// Errors produced by [`parse_byte_size`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ByteSizeError {
    #[error("byte size is empty")]
    Empty,
    #[error("byte size {0:?} has no leading number")]
    MissingNumber(String),
    #[error("byte size {0:?} has an unknown unit (expected k, m or g)")]
    UnknownUnit(String),
    #[error("byte size {0:?} overflows")]
    Overflow(String),
}

/// Parse a size such as `"8M"`, `"512k"`, `"1g"` or `"4096"` into bytes.
///
/// Units are binary and case-insensitive: `k` = 1024, `m` = 1024², `g` = 1024³.
/// A bare number is taken as bytes. Surrounding whitespace is ignored.
pub fn parse_byte_size(raw: &str) -> Result<u64, ByteSizeError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(ByteSizeError::Empty);
    }

    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    if digits.is_empty() {
        return Err(ByteSizeError::MissingNumber(raw.to_string()));
    }

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" => 1,
        "k" => 1024,
        "m" => 1024 * 1024,
        "g" => 1024 * 1024 * 1024,
        _ => return Err(ByteSizeError::UnknownUnit(raw.to_string())),
    };

    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| ByteSizeError::Overflow(raw.to_string()))
}

/// A byte count deserialized from a human-readable size string (see
/// [`parse_byte_size`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct ByteSize(pub u64);

impl ByteSize {
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Clamp to `usize` for APIs that take an in-memory length.
    #[must_use]
    pub fn as_usize(self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}

impl TryFrom<String> for ByteSize {
    type Error = ByteSizeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        parse_byte_size(&value).map(ByteSize)
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes", self.0)
    }
}

/// Escape text for inclusion in HTML element content or attribute values.
pub fn escape_html(input: &str) -> Cow<'_, str> {
    if !input.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(input);
    }
    let mut out = String::with_capacity(input.len() + 16);
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_byte_size_units() {
        assert_eq!(parse_byte_size("8M").unwrap(), 8 * 1024 * 1024);
        assert_eq!(parse_byte_size("512k").unwrap(), 512 * 1024);
        assert_eq!(parse_byte_size("1g").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_byte_size("2G").unwrap(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_parse_byte_size_bare_number_and_whitespace() {
        assert_eq!(parse_byte_size("512").unwrap(), 512);
        assert_eq!(parse_byte_size("  16m \n").unwrap(), 16 * 1024 * 1024);
    }

    #[test]
    fn test_parse_byte_size_errors() {
        assert_eq!(parse_byte_size("   "), Err(ByteSizeError::Empty));
        assert!(matches!(
            parse_byte_size("M"),
            Err(ByteSizeError::MissingNumber(_))
        ));
        assert!(matches!(
            parse_byte_size("10t"),
            Err(ByteSizeError::UnknownUnit(_))
        ));
        assert!(matches!(
            parse_byte_size("99999999999999999999g"),
            Err(ByteSizeError::Overflow(_))
        ));
    }

    #[test]
    fn test_byte_size_deserializes_from_string() {
        #[derive(Deserialize)]
        struct Wrapper {
            limit: ByteSize,
        }
        let w: Wrapper = toml::from_str("limit = \"4k\"").unwrap();
        assert_eq!(w.limit, ByteSize(4096));
        assert!(toml::from_str::<Wrapper>("limit = \"4x\"").is_err());
        assert_eq!(w.limit.to_string(), "4096 bytes");
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("Hello, World!"), "Hello, World!");
        assert_eq!(
            escape_html("<a href=\"x\">&'</a>"),
            "&lt;a href=&quot;x&quot;&gt;&amp;&#39;&lt;/a&gt;"
        );
    }

    #[test]
    fn test_expand_tilde_passthrough() {
        assert_eq!(expand_tilde("public"), "public");
        assert_eq!(expand_tilde("/srv/www"), "/srv/www");
    }
}
