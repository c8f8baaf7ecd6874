//! Per-domain decision outcomes.
//!
//! A domain carries exactly one [`Decision`] for the lifetime of a proxy
//! run. `Allow`/`Deny` apply to this run only; `Always`/`Never` are the
//! outcomes a caller writes back into durable per-project policy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Outcome attached to a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// Permit for this run only
    Allow,
    /// Block for this run only
    Deny,
    /// Permit and persist
    Always,
    /// Block and persist
    Never,
}

impl Decision {
    /// Whether a connection to a domain with this decision may proceed.
    #[must_use]
    pub fn is_allowed(self) -> bool {
        matches!(self, Decision::Allow | Decision::Always)
    }

    /// Whether the caller should persist this decision as durable policy.
    #[must_use]
    pub fn is_persistent(self) -> bool {
        matches!(self, Decision::Always | Decision::Never)
    }

    /// The policy token for this decision (`allow`, `deny`, `always`, `never`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Deny => "deny",
            Decision::Always => "always",
            Decision::Never => "never",
        }
    }

    /// Parse a policy token, falling back to `Deny` for anything unrecognized.
    ///
    /// Matching is exact: `ALLOW` or ` allow` are not `allow`.
    #[must_use]
    pub fn from_token(token: &str) -> Self {
        token.parse().unwrap_or(Decision::Deny)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string is not one of the four policy tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownDecision(pub String);

impl fmt::Display for UnknownDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown decision token: {:?}", self.0)
    }
}

impl std::error::Error for UnknownDecision {}

impl FromStr for Decision {
    type Err = UnknownDecision;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Decision::Allow),
            "deny" => Ok(Decision::Deny),
            "always" => Ok(Decision::Always),
            "never" => Ok(Decision::Never),
            _ => Err(UnknownDecision(s.to_string())),
        }
    }
}
