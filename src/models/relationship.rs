use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// A typed, directed edge stored on the source feature's record.
///
/// `target_name` is a display cache only; `target_id` is authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    #[serde(rename = "type")]
    pub kind: String,
    pub target_id: Uuid,
    #[serde(default)]
    pub target_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version_constraint: Option<VersionConstraint>,
    pub created_at: DateTime<Utc>,
}

impl Relationship {
    pub fn new(
        kind: impl Into<String>,
        target_id: Uuid,
        target_name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: kind.into(),
            target_id,
            target_name: target_name.into(),
            description: None,
            version_constraint: None,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    fn holds(&self, actual: u32, required: u32) -> bool {
        match self {
            Self::Eq => actual == required,
            Self::Ne => actual != required,
            Self::Lt => actual < required,
            Self::Le => actual <= required,
            Self::Gt => actual > required,
            Self::Ge => actual >= required,
        }
    }
}

/// Requirement on the target's latest closed version number, e.g. `>=2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionConstraint {
    pub comparator: Comparator,
    pub version: u32,
}

/// Outcome of evaluating a [`VersionConstraint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintStatus {
    Satisfied,
    Violated,
    /// The target has no closed version yet.
    Indeterminate,
}

impl VersionConstraint {
    pub fn new(comparator: Comparator, version: u32) -> Self {
        Self {
            comparator,
            version,
        }
    }

    pub fn evaluate(&self, latest_closed: Option<u32>) -> ConstraintStatus {
        match latest_closed {
            None => ConstraintStatus::Indeterminate,
            Some(actual) if self.comparator.holds(actual, self.version) => {
                ConstraintStatus::Satisfied
            }
            Some(_) => ConstraintStatus::Violated,
        }
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.comparator.as_str(), self.version)
    }
}

impl FromStr for VersionConstraint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        // Two-character operators first so ">=" is not read as ">".
        let (comparator, rest) = [
            (">=", Comparator::Ge),
            ("<=", Comparator::Le),
            ("!=", Comparator::Ne),
            ("==", Comparator::Eq),
            (">", Comparator::Gt),
            ("<", Comparator::Lt),
            ("=", Comparator::Eq),
        ]
        .into_iter()
        .find_map(|(op, cmp)| trimmed.strip_prefix(op).map(|rest| (cmp, rest)))
        .unwrap_or((Comparator::Eq, trimmed));

        let rest = rest.trim();
        let rest = rest.strip_prefix('v').unwrap_or(rest);
        let version = rest
            .parse::<u32>()
            .map_err(|_| Error::InvalidConstraint(s.to_string()))?;
        if version == 0 {
            return Err(Error::InvalidConstraint(s.to_string()));
        }
        Ok(Self::new(comparator, version))
    }
}

impl TryFrom<String> for VersionConstraint {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VersionConstraint> for String {
    fn from(value: VersionConstraint) -> Self {
        value.to_string()
    }
}

/// How a category reacts to a relationship that would close a loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CycleDetection {
    Strict,
    Warn,
    None,
}

impl CycleDetection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Warn => "warn",
            Self::None => "none",
        }
    }
}

/// A policy grouping of relationship types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub allow_cycles: bool,
    pub cycle_detection: CycleDetection,
}

impl Category {
    /// Detection mode after applying `allow_cycles`: a category that allows
    /// cycles never rejects, it can at most warn.
    pub fn effective_detection(&self) -> CycleDetection {
        match (self.cycle_detection, self.allow_cycles) {
            (CycleDetection::Strict, true) => CycleDetection::Warn,
            (mode, _) => mode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipType {
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub inverse: Option<String>,
    #[serde(default)]
    pub bidirectional: bool,
    #[serde(default)]
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comparators() {
        let c: VersionConstraint = ">=2".parse().unwrap();
        assert_eq!(c, VersionConstraint::new(Comparator::Ge, 2));
        let c: VersionConstraint = "< 3".parse().unwrap();
        assert_eq!(c, VersionConstraint::new(Comparator::Lt, 3));
        let c: VersionConstraint = "v4".parse().unwrap();
        assert_eq!(c, VersionConstraint::new(Comparator::Eq, 4));
        assert_eq!(c.to_string(), "=4");
    }

    #[test]
    fn rejects_garbage() {
        assert!(">=two".parse::<VersionConstraint>().is_err());
        assert!(">=0".parse::<VersionConstraint>().is_err());
        assert!("".parse::<VersionConstraint>().is_err());
    }

    #[test]
    fn evaluates_against_latest_closed_version() {
        let c: VersionConstraint = ">=2".parse().unwrap();
        assert_eq!(c.evaluate(None), ConstraintStatus::Indeterminate);
        assert_eq!(c.evaluate(Some(1)), ConstraintStatus::Violated);
        assert_eq!(c.evaluate(Some(2)), ConstraintStatus::Satisfied);
        assert_eq!(c.evaluate(Some(3)), ConstraintStatus::Satisfied);
    }

    #[test]
    fn serializes_as_string() {
        let mut rel = Relationship::new("depends-on", Uuid::new_v4(), "B", Utc::now());
        rel.version_constraint = Some(">=2".parse().unwrap());
        let yaml = serde_yaml::to_string(&rel).unwrap();
        assert!(yaml.contains(">=2"));
        let back: Relationship = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, rel);
    }

    #[test]
    fn allow_cycles_downgrades_strict() {
        let category = Category {
            name: "structural".into(),
            description: String::new(),
            allow_cycles: true,
            cycle_detection: CycleDetection::Strict,
        };
        assert_eq!(category.effective_detection(), CycleDetection::Warn);
    }
}
