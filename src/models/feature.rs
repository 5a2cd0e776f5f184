use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::relationship::Relationship;
use super::version::{later_than, Version, VersionState};

/// A trackable unit of work, persisted as one YAML record in the metadata
/// directory of the branch that owns it.
///
/// The feature-level timestamps summarize the record: `modified_at` moves on
/// every edit (including relationship edits) and decides which copy wins when
/// the same id is found on several refs. `closed_at` mirrors the latest
/// version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    pub versions: Vec<Version>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

/// Input for creating a new feature.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateFeatureInput {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub category: Option<String>,
    pub priority: Option<String>,
    pub kind: Option<String>,
}

impl CreateFeatureInput {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Input for updating an existing feature. All fields are optional for partial updates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateFeatureInput {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub add_tags: Vec<String>,
    #[serde(default)]
    pub remove_tags: Vec<String>,
    pub category: Option<String>,
    pub priority: Option<String>,
    pub kind: Option<String>,
}

impl UpdateFeatureInput {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.add_tags.is_empty()
            && self.remove_tags.is_empty()
            && self.category.is_none()
            && self.priority.is_none()
            && self.kind.is_none()
    }
}

impl Feature {
    /// Build a fresh feature with its first, open version.
    pub fn new(input: CreateFeatureInput, branch: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: input.name,
            description: input.description,
            tags: input.tags,
            category: input.category,
            priority: input.priority,
            kind: input.kind,
            created_at: now,
            modified_at: now,
            closed_at: None,
            versions: vec![Version::new(1, branch, now)],
            relationships: Vec::new(),
        }
    }

    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }

    /// Lowercase, dash-separated form of the name used in file and branch names.
    pub fn slug(&self) -> String {
        slugify(&self.name)
    }

    pub fn latest_version(&self) -> Option<&Version> {
        self.versions.last()
    }

    fn latest_version_mut(&mut self) -> Option<&mut Version> {
        self.versions.last_mut()
    }

    /// State of the latest version; a record without versions reads as open.
    pub fn state(&self) -> VersionState {
        self.latest_version()
            .map(Version::state)
            .unwrap_or(VersionState::Open)
    }

    /// Branch of the latest version, if it was given one.
    pub fn active_branch(&self) -> Option<&str> {
        self.latest_version().and_then(Version::branch)
    }

    /// Record an edit that does not count as work on the active version.
    pub fn mark_modified(&mut self, now: DateTime<Utc>) {
        self.modified_at = later_than(self.modified_at, now);
    }

    /// Commit transition: work landed on the active version.
    pub fn touch(&mut self, now: DateTime<Utc>) -> Result<(), String> {
        let Some(version) = self.latest_version_mut() else {
            return Err("feature has no versions".to_string());
        };
        if version.closed_at.is_some() {
            return Err(format!("version {} is closed", version.number));
        }
        version.modified_at = later_than(version.modified_at, now);
        let stamp = version.modified_at;
        self.modified_at = later_than(self.modified_at, stamp);
        Ok(())
    }

    /// Close the active version. The close stamp never precedes the last
    /// modification.
    pub fn close(&mut self, now: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
        let Some(version) = self.latest_version_mut() else {
            return Err("feature has no versions".to_string());
        };
        if version.closed_at.is_some() {
            return Err(format!("version {} is already closed", version.number));
        }
        let closed = later_than(version.modified_at, now);
        version.closed_at = Some(closed);
        let closed = later_than(self.modified_at, closed);
        self.modified_at = closed;
        self.closed_at = Some(closed);
        Ok(closed)
    }

    /// Start version N+1. Only legal once the latest version is closed.
    pub fn reopen(&mut self, branch: Option<String>, now: DateTime<Utc>) -> Result<u32, String> {
        let next = match self.latest_version() {
            Some(v) if v.closed_at.is_none() => {
                return Err(format!("version {} is still {}", v.number, v.state()));
            }
            Some(v) => v.number + 1,
            None => 1,
        };
        let stamp = later_than(self.modified_at, now);
        self.versions.push(Version::new(next, branch, stamp));
        self.modified_at = stamp;
        self.closed_at = None;
        Ok(next)
    }

    /// Highest version number that has been closed.
    pub fn latest_closed_version(&self) -> Option<u32> {
        self.versions
            .iter()
            .filter(|v| v.closed_at.is_some())
            .map(|v| v.number)
            .max()
    }

    pub fn relationship(&self, kind: &str, target_id: Uuid) -> Option<&Relationship> {
        self.relationships
            .iter()
            .find(|r| r.kind == kind && r.target_id == target_id)
    }

    /// Returns `false` when an identical (type, target) edge already exists.
    pub fn add_relationship(&mut self, relationship: Relationship) -> bool {
        if self
            .relationship(&relationship.kind, relationship.target_id)
            .is_some()
        {
            return false;
        }
        self.relationships.push(relationship);
        true
    }

    /// Returns `true` if an edge was removed.
    pub fn remove_relationship(&mut self, kind: &str, target_id: Uuid) -> bool {
        let before = self.relationships.len();
        self.relationships
            .retain(|r| !(r.kind == kind && r.target_id == target_id));
        self.relationships.len() != before
    }

    pub fn apply_update(&mut self, input: UpdateFeatureInput, now: DateTime<Utc>) {
        if let Some(name) = input.name {
            self.name = name;
        }
        if let Some(description) = input.description {
            self.description = Some(description);
        }
        for tag in input.add_tags {
            self.tags.insert(tag);
        }
        for tag in &input.remove_tags {
            self.tags.remove(tag);
        }
        if let Some(category) = input.category {
            self.category = Some(category);
        }
        if let Some(priority) = input.priority {
            self.priority = Some(priority);
        }
        if let Some(kind) = input.kind {
            self.kind = Some(kind);
        }
        self.mark_modified(now);
    }

    /// True when `other` carries nothing this copy lacks: same name, every
    /// version and every relationship of `other` is also here, and this copy
    /// is at least as recent.
    pub fn subsumes(&self, other: &Feature) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.modified_at >= other.modified_at
            && other
                .versions
                .iter()
                .all(|v| self.versions.iter().any(|mine| mine.number == v.number))
            && other
                .relationships
                .iter()
                .all(|r| self.relationship(&r.kind, r.target_id).is_some())
    }

    /// Structural checks applied after parsing a record.
    pub fn check(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name is empty".to_string());
        }
        if self.versions.is_empty() {
            return Err("feature has no versions".to_string());
        }
        let mut expected = 1;
        for version in &self.versions {
            if version.number != expected {
                return Err(format!(
                    "version numbers must increase from 1, found {} where {} was expected",
                    version.number, expected
                ));
            }
            version.check()?;
            expected += 1;
        }
        Ok(())
    }
}

pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            dash = false;
        } else if !dash && !slug.is_empty() {
            slug.push('-');
            dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("feature");
    }
    slug
}

/// A feature with the relationships below it, used for tree reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureTreeNode {
    pub id: Uuid,
    pub name: String,
    pub state: VersionState,
    /// Relationship type that led from the parent node here; `None` at the root.
    pub via: Option<String>,
    pub children: Vec<FeatureTreeNode>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn feature(name: &str) -> Feature {
        Feature::new(CreateFeatureInput::named(name), None, Utc::now())
    }

    #[test]
    fn new_feature_is_open() {
        let f = feature("User Login");
        assert_eq!(f.state(), VersionState::Open);
        assert_eq!(f.versions.len(), 1);
        assert_eq!(f.created_at, f.modified_at);
        assert!(f.check().is_ok());
    }

    #[test]
    fn touch_moves_to_in_progress_even_within_the_same_instant() {
        let mut f = feature("Login");
        let created = f.created_at;
        f.touch(created).unwrap();
        assert_eq!(f.state(), VersionState::InProgress);
        assert!(f.versions[0].modified_at > f.versions[0].created_at);
    }

    #[test]
    fn close_and_reopen() {
        let mut f = feature("Login");
        f.touch(Utc::now()).unwrap();
        let closed = f.close(Utc::now() - Duration::hours(1)).unwrap();
        assert_eq!(f.state(), VersionState::Closed);
        assert!(closed >= f.versions[0].modified_at);
        assert!(f.close(Utc::now()).is_err());
        assert!(f.touch(Utc::now()).is_err());

        let next = f.reopen(Some("feature/login-v2".into()), Utc::now()).unwrap();
        assert_eq!(next, 2);
        assert_eq!(f.state(), VersionState::Open);
        assert!(f.closed_at.is_none());
        assert_eq!(f.latest_closed_version(), Some(1));
        assert_eq!(f.active_branch(), Some("feature/login-v2"));
    }

    #[test]
    fn reopen_requires_closed_version() {
        let mut f = feature("Login");
        assert!(f.reopen(None, Utc::now()).is_err());
    }

    #[test]
    fn slugify_collapses_punctuation() {
        assert_eq!(slugify("User Login / OAuth!"), "user-login-oauth");
        assert_eq!(slugify("  "), "feature");
    }

    #[test]
    fn subsumes_requires_every_edge() {
        let mut a = feature("A");
        let mut older = a.clone();
        let target = Uuid::new_v4();
        a.add_relationship(Relationship::new("depends-on", target, "B", Utc::now()));
        a.mark_modified(Utc::now());
        assert!(a.subsumes(&older));
        assert!(!older.subsumes(&a));

        older.add_relationship(Relationship::new("relates-to", Uuid::new_v4(), "C", Utc::now()));
        assert!(!a.subsumes(&older));
    }

    #[test]
    fn check_rejects_gaps_in_version_numbers() {
        let mut f = feature("Gap");
        f.versions[0].number = 2;
        assert!(f.check().is_err());
    }
}
