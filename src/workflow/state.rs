//! Pending-merge bookkeeping, kept in `.git/fgraph/MERGE_STATE.json` while a
//! workflow merge waits for `--continue` or `--abort`.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

const STATE_FILE: &str = "MERGE_STATE.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeState {
    pub feature_id: Uuid,
    pub feature_name: String,
    pub version: u32,
    pub branch: String,
    pub base_branch: String,
    /// Base tip before the merge started; abort resets to it.
    pub base_tip: String,
    pub branch_tip: String,
    /// Branch checked out when the merge was requested.
    pub original_branch: Option<String>,
    pub squash: bool,
    pub keep_branch: bool,
    pub started_at: DateTime<Utc>,
}

impl MergeState {
    pub fn path(state_dir: &Path) -> PathBuf {
        state_dir.join(STATE_FILE)
    }

    pub fn load(state_dir: &Path) -> Result<Option<Self>> {
        let path = Self::path(state_dir);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub fn save(&self, state_dir: &Path) -> Result<()> {
        fs::create_dir_all(state_dir)?;
        fs::write(Self::path(state_dir), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn clear(state_dir: &Path) -> Result<()> {
        let path = Self::path(state_dir);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        assert!(MergeState::load(dir.path()).unwrap().is_none());

        let state = MergeState {
            feature_id: Uuid::new_v4(),
            feature_name: "Login".into(),
            version: 1,
            branch: "feature/login".into(),
            base_branch: "main".into(),
            base_tip: "a".repeat(40),
            branch_tip: "b".repeat(40),
            original_branch: Some("feature/login".into()),
            squash: false,
            keep_branch: true,
            started_at: Utc::now(),
        };
        let nested = dir.path().join("fgraph");
        state.save(&nested).unwrap();
        assert_eq!(MergeState::load(&nested).unwrap(), Some(state));

        MergeState::clear(&nested).unwrap();
        assert!(MergeState::load(&nested).unwrap().is_none());
        MergeState::clear(&nested).unwrap();
    }
}
