//! Session identifiers attached to series via the `session_id` label.

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use thiserror::Error;

/// A session identifier.
///
/// Rendered as a lowercase hexadecimal integer; parsing and rendering must
/// agree so that label rewrites (e.g. reduction modulo a per-tenant maximum)
/// group stably downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

/// The `session_id` label value was not a hexadecimal integer.
#[derive(Debug, Error)]
#[error("invalid session_id: {0}")]
pub struct ParseSessionIdError(#[from] ParseIntError);

impl FromStr for SessionId {
    type Err = ParseSessionIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(u64::from_str_radix(s, 16)?))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_render_hex() {
        let id: SessionId = "42".parse().unwrap();
        assert_eq!(id, SessionId(0x42));
        assert_eq!(id.to_string(), "42");

        let id: SessionId = "deadbeef".parse().unwrap();
        assert_eq!(id.to_string(), "deadbeef");

        assert!("not-hex".parse::<SessionId>().is_err());
        assert!("".parse::<SessionId>().is_err());
    }

    #[test]
    fn test_reduction_keeps_textual_form() {
        // 0x42 mod 8 == 2, rendered back in the same hex form.
        let id: SessionId = "42".parse().unwrap();
        let reduced = SessionId(id.0 % 8);
        assert_eq!(reduced.to_string(), "2");
    }
}
