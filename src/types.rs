//! Memory-unit values used by transfer thresholds.

use core::fmt;
use core::str::FromStr;

use crate::error::FastCopyError;

/// A byte count that may also be "pick it for me" or "never".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemUnits {
    /// Derive the value from the detected processor.
    #[default]
    Auto,
    /// Unbounded; a threshold of `Inf` is never crossed.
    Inf,
    /// An explicit number of bytes.
    Bytes(usize),
}

impl MemUnits {
    /// Returns the explicit byte count, mapping `Inf` to `usize::MAX`.
    ///
    /// `Auto` has no byte value and yields `None`.
    pub const fn resolved(self) -> Option<usize> {
        match self {
            MemUnits::Auto => None,
            MemUnits::Inf => Some(usize::MAX),
            MemUnits::Bytes(n) => Some(n),
        }
    }
}

impl FromStr for MemUnits {
    type Err = FastCopyError;

    /// Accepts `auto`, `inf`, a plain byte count, or a count with a
    /// `b`/`k`/`m`/`g` suffix (binary multiples, case-insensitive).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        if text.eq_ignore_ascii_case("auto") {
            return Ok(MemUnits::Auto);
        }
        if text.eq_ignore_ascii_case("inf") {
            return Ok(MemUnits::Inf);
        }

        let (digits, shift) = match text.as_bytes().last() {
            Some(b'b' | b'B') => (&text[..text.len() - 1], 0),
            Some(b'k' | b'K') => (&text[..text.len() - 1], 10),
            Some(b'm' | b'M') => (&text[..text.len() - 1], 20),
            Some(b'g' | b'G') => (&text[..text.len() - 1], 30),
            _ => (text, 0),
        };

        let value: usize = digits
            .trim()
            .parse()
            .map_err(|_| FastCopyError::invalid_config("memunits", s, "expected a byte count"))?;

        value
            .checked_mul(1usize << shift)
            .map(MemUnits::Bytes)
            .ok_or_else(|| FastCopyError::invalid_config("memunits", s, "value overflows"))
    }
}

impl fmt::Display for MemUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemUnits::Auto => f.write_str("auto"),
            MemUnits::Inf => f.write_str("inf"),
            MemUnits::Bytes(n) => write!(f, "{n}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MemUnits;

    #[test]
    fn test_memunits_parse() {
        assert_eq!("auto".parse::<MemUnits>().unwrap(), MemUnits::Auto);
        assert_eq!("INF".parse::<MemUnits>().unwrap(), MemUnits::Inf);
        assert_eq!("4096".parse::<MemUnits>().unwrap(), MemUnits::Bytes(4096));
        assert_eq!("64b".parse::<MemUnits>().unwrap(), MemUnits::Bytes(64));
        assert_eq!("2k".parse::<MemUnits>().unwrap(), MemUnits::Bytes(2048));
        assert_eq!("8M".parse::<MemUnits>().unwrap(), MemUnits::Bytes(8 << 20));
        assert_eq!(" 1g ".parse::<MemUnits>().unwrap(), MemUnits::Bytes(1 << 30));
    }

    #[test]
    fn test_memunits_reject() {
        assert!("".parse::<MemUnits>().is_err());
        assert!("12q".parse::<MemUnits>().is_err());
        assert!("k".parse::<MemUnits>().is_err());
        assert!("-5".parse::<MemUnits>().is_err());
    }

    #[test]
    fn test_memunits_resolved() {
        assert_eq!(MemUnits::Auto.resolved(), None);
        assert_eq!(MemUnits::Inf.resolved(), Some(usize::MAX));
        assert_eq!(MemUnits::Bytes(7).resolved(), Some(7));
        assert_eq!(MemUnits::Inf.to_string(), "inf");
    }
}
