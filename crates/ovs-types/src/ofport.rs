//! OpenFlow port numbers.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// OpenFlow port number of an interface on a bridge.
///
/// OVSDB reports `-1` when the datapath failed to attach the interface and
/// an empty set before a number has been assigned. Both are modelled as
/// [`OfPort::Unattached`] so that callers never compare against a magic
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum OfPort {
    /// Interface is attached under this port number.
    Attached(u32),
    /// Interface has no usable port number yet.
    Unattached,
}

impl OfPort {
    /// Converts a raw OVSDB value.
    pub fn from_raw(raw: i64) -> Self {
        match u32::try_from(raw) {
            Ok(n) if n > 0 => OfPort::Attached(n),
            _ => OfPort::Unattached,
        }
    }

    /// Returns the port number if attached.
    pub const fn number(&self) -> Option<u32> {
        match self {
            OfPort::Attached(n) => Some(*n),
            OfPort::Unattached => None,
        }
    }

    pub const fn is_attached(&self) -> bool {
        matches!(self, OfPort::Attached(_))
    }
}

impl From<i64> for OfPort {
    fn from(raw: i64) -> Self {
        OfPort::from_raw(raw)
    }
}

impl From<OfPort> for i64 {
    fn from(port: OfPort) -> i64 {
        match port {
            OfPort::Attached(n) => i64::from(n),
            OfPort::Unattached => -1,
        }
    }
}

impl fmt::Display for OfPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OfPort::Attached(n) => write!(f, "{}", n),
            OfPort::Unattached => write!(f, "unattached"),
        }
    }
}

impl FromStr for OfPort {
    type Err = ParseError;

    /// Parses `ovs-vsctl get Interface <name> ofport` output.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == "[]" {
            return Ok(OfPort::Unattached);
        }
        s.parse::<i64>()
            .map(OfPort::from_raw)
            .map_err(|_| ParseError::InvalidOfPort(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_from_raw() {
        assert_eq!(OfPort::from_raw(7), OfPort::Attached(7));
        assert_eq!(OfPort::from_raw(-1), OfPort::Unattached);
        assert_eq!(OfPort::from_raw(0), OfPort::Unattached);
    }

    #[test]
    fn test_parse_vsctl_output() {
        assert_eq!("12\n".parse::<OfPort>().unwrap(), OfPort::Attached(12));
        assert_eq!("-1".parse::<OfPort>().unwrap(), OfPort::Unattached);
        assert_eq!("[]".parse::<OfPort>().unwrap(), OfPort::Unattached);
        assert!("abc".parse::<OfPort>().is_err());
    }

    #[test]
    fn test_number() {
        assert_eq!(OfPort::Attached(3).number(), Some(3));
        assert_eq!(OfPort::Unattached.number(), None);
    }
}
