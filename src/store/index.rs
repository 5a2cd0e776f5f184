//! The id -> path index file.
//!
//! Only ever a hint for the checked-out branch. It is regenerated from the
//! records on every write, so a stale or missing index costs a scan, never
//! a wrong answer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

pub const INDEX_FILE: &str = "index.yaml";

pub fn index_path(metadata_dir: &str) -> String {
    format!("{}/{}", metadata_dir, INDEX_FILE)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdIndex {
    #[serde(default)]
    pub features: BTreeMap<Uuid, String>,
}

impl IdIndex {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        Ok(serde_yaml::from_slice(bytes)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_yaml::to_string(self)?.into_bytes())
    }

    pub fn get(&self, id: &Uuid) -> Option<&str> {
        self.features.get(id).map(String::as_str)
    }

    pub fn insert(&mut self, id: Uuid, path: impl Into<String>) {
        self.features.insert(id, path.into());
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

impl FromIterator<(Uuid, String)> for IdIndex {
    fn from_iter<T: IntoIterator<Item = (Uuid, String)>>(iter: T) -> Self {
        Self {
            features: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_what_it_writes() {
        let id = Uuid::new_v4();
        let index: IdIndex = [(id, ".features/a.yaml".to_string())].into_iter().collect();
        let parsed = IdIndex::parse(&index.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.get(&id), Some(".features/a.yaml"));
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn empty_document_is_an_empty_index() {
        let parsed = IdIndex::parse(b"{}").unwrap();
        assert!(parsed.is_empty());
    }
}
