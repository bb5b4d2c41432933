//! Shard operating mode

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operating mode of a shard and its components
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Full service
    #[default]
    ReadWrite,
    /// Reads only; every component is healthy
    ReadOnly,
    /// Reads only; the metabase is unusable and payloads are served by
    /// direct blob store lookups
    DegradedReadOnly,
    /// Shut down
    Disabled,
}

impl Mode {
    /// Whether mutations are refused
    #[must_use]
    pub const fn read_only(self) -> bool {
        !matches!(self, Self::ReadWrite)
    }

    /// Whether the metabase is unavailable
    #[must_use]
    pub const fn no_metabase(self) -> bool {
        matches!(self, Self::DegradedReadOnly | Self::Disabled)
    }

    /// Whether a `set_mode` request from `self` to `to` is allowed
    ///
    /// Leaving `DegradedReadOnly` requires the metabase to be reopened, which
    /// only `reload` does; `Disabled` is entered by `close` and never left.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        use Mode::{DegradedReadOnly, Disabled, ReadOnly, ReadWrite};
        match (self, to) {
            (Disabled, _) | (_, Disabled) => false,
            (DegradedReadOnly, ReadWrite | ReadOnly) => false,
            (ReadWrite | ReadOnly | DegradedReadOnly, _) => true,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ReadWrite => "READ_WRITE",
            Self::ReadOnly => "READ_ONLY",
            Self::DegradedReadOnly => "DEGRADED_READ_ONLY",
            Self::Disabled => "DISABLED",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_flags() {
        assert!(!Mode::ReadWrite.read_only());
        assert!(Mode::ReadOnly.read_only());
        assert!(Mode::DegradedReadOnly.read_only());
        assert!(Mode::DegradedReadOnly.no_metabase());
        assert!(!Mode::ReadOnly.no_metabase());
    }

    #[test]
    fn test_mode_transitions() {
        assert!(Mode::ReadWrite.can_transition_to(Mode::ReadOnly));
        assert!(Mode::ReadOnly.can_transition_to(Mode::ReadWrite));
        assert!(Mode::ReadWrite.can_transition_to(Mode::DegradedReadOnly));
        assert!(!Mode::DegradedReadOnly.can_transition_to(Mode::ReadWrite));
        assert!(!Mode::ReadWrite.can_transition_to(Mode::Disabled));
        assert!(!Mode::Disabled.can_transition_to(Mode::ReadWrite));
    }
}
