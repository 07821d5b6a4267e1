//! Core scalar types: `Ttype` (validated type identifier), `Tref` (monotonic
//! tag handle) and `Rev` (monotonic commit revision).

use std::fmt;

use crate::error::{Error, Result};

/// Sentinel `delete_rev` for a tag or link that is still live.
pub const REV_LIVE: u64 = u64::MAX;

/// Monotonic commit revision. Wraps a `u64` so call sites can't confuse a
/// revision with an ordinary count or a `Tref`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Rev(pub u64);

impl Rev {
    pub fn zero() -> Rev {
        Rev(0)
    }

    pub fn next(self) -> Rev {
        Rev(self.0 + 1)
    }
}

impl fmt::Display for Rev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic 64-bit tag handle. Stable per tag, never reused. Not identity —
/// `(ttype, val)` is identity; `Tref` is a fast lookup key into `by_tref`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Tref(pub u64);

impl fmt::Display for Tref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A validated ttype identifier: `^[a-z][a-z0-9-]{0,63}$`, 1-64 chars.
#[derive(Clone, Debug, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Ttype(String);

impl Ttype {
    pub fn parse<S: AsRef<str>>(s: S, max_bytes: usize) -> Result<Ttype> {
        let s = s.as_ref();
        if s.is_empty() || s.len() > max_bytes {
            return Err(Error::ValidationError(format!(
                "ttype {:?} length must be 1..={}",
                s, max_bytes
            )));
        }
        let mut chars = s.chars();
        let first_ok = matches!(chars.next(), Some(c) if c.is_ascii_lowercase());
        let rest_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !first_ok || !rest_ok {
            return Err(Error::ValidationError(format!(
                "ttype {:?} must match ^[a-z][a-z0-9-]*$",
                s
            )));
        }
        Ok(Ttype(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ttype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Ttype {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Validate a tag value: 1..=max_bytes UTF-8 bytes.
pub fn validate_val(val: &str, max_bytes: usize) -> Result<()> {
    if val.is_empty() || val.len() > max_bytes {
        return Err(Error::ValidationError(format!(
            "value length {} must be 1..={}",
            val.len(),
            max_bytes
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttype_parse() {
        assert!(Ttype::parse("person", 64).is_ok());
        assert!(Ttype::parse("has-spoken-to", 64).is_ok());
        assert!(Ttype::parse("", 64).is_err());
        assert!(Ttype::parse("Person", 64).is_err());
        assert!(Ttype::parse("1person", 64).is_err());
        assert!(Ttype::parse("person_x", 64).is_err());
        assert!(Ttype::parse("a".repeat(65), 64).is_err());
    }

    #[test]
    fn test_validate_val() {
        assert!(validate_val("ada", 1024).is_ok());
        assert!(validate_val("", 1024).is_err());
        assert!(validate_val(&"x".repeat(1025), 1024).is_err());
    }

    #[test]
    fn test_rev_ordering() {
        assert!(Rev(1) < Rev(2));
        assert_eq!(Rev(5).next(), Rev(6));
    }
}
