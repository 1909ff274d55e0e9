//! Generation numbers and generation addressing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PolicyError;

/// Monotonically increasing number identifying an immutable policy snapshot.
///
/// Generation 0 is the empty policy every store starts with.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Generation(pub u64);

impl Generation {
    pub const INITIAL: Generation = Generation(0);

    pub fn next(self) -> Generation {
        Generation(self.0 + 1)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a caller addresses a policy: a specific generation or the latest one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GenerationRef {
    #[default]
    Last,
    Exact(Generation),
}

impl From<Generation> for GenerationRef {
    fn from(value: Generation) -> Self {
        GenerationRef::Exact(value)
    }
}

impl FromStr for GenerationRef {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("last") {
            return Ok(GenerationRef::Last);
        }
        s.parse::<u64>()
            .map(|n| GenerationRef::Exact(Generation(n)))
            .map_err(|_| PolicyError::InvalidGeneration(s.to_string()))
    }
}

impl fmt::Display for GenerationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationRef::Last => f.write_str("last"),
            GenerationRef::Exact(generation) => write!(f, "{}", generation),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_last_and_numbers() {
        assert_eq!("last".parse::<GenerationRef>().unwrap(), GenerationRef::Last);
        assert_eq!("".parse::<GenerationRef>().unwrap(), GenerationRef::Last);
        assert_eq!(
            "7".parse::<GenerationRef>().unwrap(),
            GenerationRef::Exact(Generation(7))
        );
        assert!("seven".parse::<GenerationRef>().is_err());
    }

    #[test]
    fn next_increments() {
        assert_eq!(Generation::INITIAL.next(), Generation(1));
    }
}
