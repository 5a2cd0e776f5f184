//! Error types for `feature-graph`.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
    #[error("feature not found: {0}")]
    NotFound(String),

    #[error("branch not found: {0}")]
    BranchNotFound(String),

    #[error("name {name:?} matches {} features; use an id to disambiguate", candidates.len())]
    AmbiguousName { name: String, candidates: Vec<Uuid> },

    #[error("branch {branch} moved since it was read; re-read and retry the operation")]
    WriteConflict { branch: String },

    #[error("merge has unresolved conflicts: {}", paths.join(", "))]
    MergeConflict { paths: Vec<String> },

    #[error("no merge in progress")]
    NoMergeInProgress,

    #[error("a merge is already in progress; run merge --continue or merge --abort")]
    MergeInProgress,

    #[error("relationship would create a cycle in category {category}: {}", path.join(" -> "))]
    Cycle { category: String, path: Vec<String> },

    #[error("feature {0} cannot be related to itself")]
    SelfReference(Uuid),

    #[error("{source_name} already has a {kind} relationship to {target_name}")]
    DuplicateRelationship {
        source_name: String,
        target_name: String,
        kind: String,
    },

    #[error("unknown relationship type: {0}")]
    UnknownRelationshipType(String),

    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("working tree has uncommitted changes: {}", paths.join(", "))]
    DirtyWorkingTree { paths: Vec<String> },

    #[error("shared-branch features are disabled by configuration")]
    SharedBranchDisallowed,

    #[error("malformed record {path}: {reason}")]
    Malformed { path: String, reason: String },

    #[error("invalid version constraint: {0:?}")]
    InvalidConstraint(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("repository has no working directory")]
    BareRepository,

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification callers use to decide between prompting, retrying
/// and aborting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvariantViolation,
    Malformed,
    Other,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::BranchNotFound(_) | Self::AmbiguousName { .. } => {
                ErrorKind::NotFound
            }
            Self::WriteConflict { .. }
            | Self::MergeConflict { .. }
            | Self::MergeInProgress
            | Self::NoMergeInProgress
            | Self::DirtyWorkingTree { .. } => ErrorKind::Conflict,
            Self::Cycle { .. }
            | Self::SelfReference(_)
            | Self::DuplicateRelationship { .. }
            | Self::InvalidTransition(_)
            | Self::SharedBranchDisallowed => ErrorKind::InvariantViolation,
            Self::Malformed { .. } | Self::InvalidConstraint(_) | Self::Yaml(_) => {
                ErrorKind::Malformed
            }
            _ => ErrorKind::Other,
        }
    }

    /// Only ref races are retried; merge conflicts need an explicit
    /// continue or abort.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WriteConflict { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_conflict_is_retryable_conflict() {
        let err = Error::WriteConflict {
            branch: "main".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("re-read and retry"));
    }

    #[test]
    fn cycle_message_lists_full_path() {
        let err = Error::Cycle {
            category: "structural".to_string(),
            path: vec!["A".into(), "B".into(), "C".into(), "A".into()],
        };
        assert_eq!(err.kind(), ErrorKind::InvariantViolation);
        assert!(!err.is_retryable());
        assert!(err.to_string().ends_with("A -> B -> C -> A"));
    }

    #[test]
    fn merge_conflict_is_not_retryable() {
        let err = Error::MergeConflict {
            paths: vec!["src/lib.rs".to_string()],
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(!err.is_retryable());
    }
}
