//! Configuration snapshot.
//!
//! Loaded once per invocation and passed explicitly to the store, graph and
//! workflow. Nothing reloads it mid-operation.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::Catalog;
use crate::models::{Category, CycleDetection, RelationshipType};

const APP_NAME: &str = "fgraph";
const CONFIG_FILE: &str = "config.json";
/// Repository-level configuration, at the root of the working tree.
pub const REPO_CONFIG_FILE: &str = ".fgraph.json";

/// How `create` treats branches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CreationMode {
    /// Every version gets its own branch, created and checked out on create.
    BranchPerFeature,
    /// Features are recorded on the current branch; no branches are created.
    TrunkBased,
}

impl CreationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BranchPerFeature => "branch_per_feature",
            Self::TrunkBased => "trunk_based",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory (relative to the repository root) holding feature records.
    pub metadata_dir: String,
    /// Branch that versions merge into and shared-branch features live on.
    pub base_branch: String,
    /// Prefix for branches created per version.
    pub branch_prefix: String,
    pub creation_mode: CreationMode,
    /// Whether `create --shared` may record a feature on the base branch.
    pub allow_shared_branch: bool,
    /// Minimum fuzzy score for a name to count as a possible duplicate.
    pub similarity_threshold: i64,
    pub categories: Vec<Category>,
    pub relationship_types: Vec<RelationshipType>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            metadata_dir: ".features".to_string(),
            base_branch: "main".to_string(),
            branch_prefix: "feature/".to_string(),
            creation_mode: CreationMode::BranchPerFeature,
            allow_shared_branch: true,
            similarity_threshold: 60,
            categories: default_categories(),
            relationship_types: default_relationship_types(),
        }
    }
}

impl Config {
    /// Load the snapshot for the repository rooted at `workdir`.
    ///
    /// The repository file wins over the user file, which wins over the
    /// built-in defaults. A broken repository file is an error; a broken user
    /// file is logged and skipped.
    pub fn load(workdir: &Path) -> Result<Self> {
        let repo_path = workdir.join(REPO_CONFIG_FILE);
        if repo_path.exists() {
            let config = Self::read(&repo_path)?;
            tracing::debug!(path = %repo_path.display(), "loaded repository config");
            return Ok(config);
        }

        match user_config_path() {
            Some(path) if path.exists() => match Self::read(&path) {
                Ok(config) => {
                    tracing::debug!(path = %path.display(), "loaded user config");
                    Ok(config)
                }
                Err(e) => {
                    tracing::warn!("Failed to load user config, using defaults: {}", e);
                    Ok(Self::default())
                }
            },
            _ => Ok(Self::default()),
        }
    }

    fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write this configuration as the repository-level file.
    pub fn save(&self, workdir: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(workdir.join(REPO_CONFIG_FILE), content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.metadata_dir.trim_matches('/').is_empty() {
            return Err(Error::Config("metadata_dir must not be empty".to_string()));
        }
        if self.base_branch.is_empty() {
            return Err(Error::Config("base_branch must not be empty".to_string()));
        }
        self.catalog().map(|_| ())
    }

    /// Build the relationship catalog from this snapshot.
    pub fn catalog(&self) -> Result<Catalog> {
        Catalog::new(self.categories.clone(), self.relationship_types.clone())
    }

    /// Metadata directory without leading or trailing slashes.
    pub fn metadata_dir(&self) -> &str {
        self.metadata_dir.trim_matches('/')
    }
}

fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME)
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

fn category(name: &str, description: &str, allow_cycles: bool, mode: CycleDetection) -> Category {
    Category {
        name: name.to_string(),
        description: description.to_string(),
        allow_cycles,
        cycle_detection: mode,
    }
}

fn pair(name: &str, inverse: &str, category: &str, description: &str) -> [RelationshipType; 2] {
    [
        RelationshipType {
            name: name.to_string(),
            category: category.to_string(),
            inverse: Some(inverse.to_string()),
            bidirectional: false,
            description: description.to_string(),
        },
        RelationshipType {
            name: inverse.to_string(),
            category: category.to_string(),
            inverse: Some(name.to_string()),
            bidirectional: false,
            description: format!("inverse of {}", name),
        },
    ]
}

pub fn default_categories() -> Vec<Category> {
    vec![
        category(
            "structural",
            "Dependencies and containment; must form a DAG",
            false,
            CycleDetection::Strict,
        ),
        category(
            "workflow",
            "Ordering hints between features",
            false,
            CycleDetection::Warn,
        ),
        category(
            "informational",
            "References that carry no ordering",
            true,
            CycleDetection::None,
        ),
    ]
}

pub fn default_relationship_types() -> Vec<RelationshipType> {
    let mut types = Vec::new();
    types.extend(pair(
        "depends-on",
        "required-by",
        "structural",
        "source cannot ship without the target",
    ));
    types.extend(pair(
        "blocks",
        "blocked-by",
        "structural",
        "target cannot start until the source is done",
    ));
    types.extend(pair(
        "parent-of",
        "child-of",
        "structural",
        "target is a part of the source",
    ));
    types.extend(pair(
        "precedes",
        "follows",
        "workflow",
        "source is planned before the target",
    ));
    types.push(RelationshipType {
        name: "relates-to".to_string(),
        category: "informational".to_string(),
        inverse: None,
        bidirectional: true,
        description: "loosely related features".to_string(),
    });
    types.extend(pair(
        "duplicates",
        "duplicated-by",
        "informational",
        "source repeats the target",
    ));
    types
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.metadata_dir(), ".features");
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"base_branch": "trunk", "creation_mode": "trunk_based"}"#)
                .unwrap();
        assert_eq!(config.base_branch, "trunk");
        assert_eq!(config.creation_mode, CreationMode::TrunkBased);
        assert_eq!(config.branch_prefix, "feature/");
        assert!(!config.relationship_types.is_empty());
    }

    #[test]
    fn repository_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            base_branch: "develop".to_string(),
            ..Config::default()
        };
        config.save(dir.path()).unwrap();

        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.base_branch, "develop");
    }

    #[test]
    fn broken_repository_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(REPO_CONFIG_FILE), "{not json").unwrap();
        assert!(matches!(Config::load(dir.path()), Err(Error::Config(_))));
    }
}
