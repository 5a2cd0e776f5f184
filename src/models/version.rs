use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One lifecycle of a feature: the original creation or a later reopening.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub number: u32,
    /// Branch created for this version; empty in trunk-based or shared-branch mode.
    #[serde(default)]
    pub branch: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
}

/// The derived lifecycle state of a version.
///
/// - `Open`: created, no work committed yet (`created_at == modified_at`)
/// - `InProgress`: at least one workflow commit landed
/// - `Closed`: merged or otherwise finished (`closed_at` set)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VersionState {
    Open,
    InProgress,
    Closed,
}

impl VersionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Closed => "closed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "in_progress" | "in-progress" => Some(Self::InProgress),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for VersionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Version {
    pub fn new(number: u32, branch: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            number,
            branch: branch.unwrap_or_default(),
            created_at: now,
            modified_at: now,
            closed_at: None,
        }
    }

    pub fn branch(&self) -> Option<&str> {
        (!self.branch.is_empty()).then_some(self.branch.as_str())
    }

    pub fn state(&self) -> VersionState {
        if self.closed_at.is_some() {
            VersionState::Closed
        } else if self.modified_at > self.created_at {
            VersionState::InProgress
        } else {
            VersionState::Open
        }
    }

    pub fn check(&self) -> Result<(), String> {
        if self.modified_at < self.created_at {
            return Err(format!(
                "version {} modified_at precedes created_at",
                self.number
            ));
        }
        if let Some(closed) = self.closed_at {
            if closed < self.modified_at {
                return Err(format!(
                    "version {} closed_at precedes modified_at",
                    self.number
                ));
            }
        }
        Ok(())
    }
}

/// `now`, unless the clock has not moved past `previous`; then one
/// microsecond after it. Keeps modification stamps strictly increasing.
pub(crate) fn later_than(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_is_derived_from_timestamps() {
        let now = Utc::now();
        let mut v = Version::new(1, None, now);
        assert_eq!(v.state(), VersionState::Open);
        assert_eq!(v.branch(), None);

        v.modified_at = now + Duration::seconds(1);
        assert_eq!(v.state(), VersionState::InProgress);

        v.closed_at = Some(v.modified_at);
        assert_eq!(v.state(), VersionState::Closed);
        assert!(v.check().is_ok());
    }

    #[test]
    fn check_rejects_close_before_modification() {
        let now = Utc::now();
        let mut v = Version::new(1, Some("feature/x".into()), now);
        v.modified_at = now + Duration::seconds(5);
        v.closed_at = Some(now);
        assert!(v.check().is_err());
    }

    #[test]
    fn state_names_round_trip() {
        for state in [VersionState::Open, VersionState::InProgress, VersionState::Closed] {
            assert_eq!(VersionState::from_str(state.as_str()), Some(state));
        }
        assert_eq!(VersionState::from_str("in-progress"), Some(VersionState::InProgress));
        assert_eq!(VersionState::from_str("done"), None);
    }
}
