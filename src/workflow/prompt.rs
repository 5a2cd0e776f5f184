//! Decisions the workflow cannot take on its own.

use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;

/// An existing feature whose name resembles a requested one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NameMatch {
    pub id: Uuid,
    pub name: String,
    pub score: i64,
}

/// Answer to "a similar feature already exists".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    Reuse(Uuid),
    CreateNew,
    Cancel,
}

pub trait Prompter {
    fn duplicate_name(&self, requested: &str, matches: &[NameMatch]) -> Result<Choice>;
}

/// Never asks; always creates.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonInteractive;

impl Prompter for NonInteractive {
    fn duplicate_name(&self, requested: &str, matches: &[NameMatch]) -> Result<Choice> {
        tracing::debug!(requested, similar = matches.len(), "non-interactive: creating new feature");
        Ok(Choice::CreateNew)
    }
}

/// Ranks existing names against a requested one.
pub trait Similarity {
    /// Matches at or above the threshold, best first.
    fn rank(&self, requested: &str, candidates: &[(Uuid, &str)]) -> Vec<NameMatch>;
}

pub struct FuzzySimilarity {
    matcher: SkimMatcherV2,
    threshold: i64,
}

impl FuzzySimilarity {
    pub fn new(threshold: i64) -> Self {
        Self {
            matcher: SkimMatcherV2::default().ignore_case(),
            threshold,
        }
    }
}

impl Similarity for FuzzySimilarity {
    fn rank(&self, requested: &str, candidates: &[(Uuid, &str)]) -> Vec<NameMatch> {
        let requested = requested.trim();
        let mut matches: Vec<NameMatch> = candidates
            .iter()
            .filter_map(|&(id, name)| {
                // Score both ways so "Login" finds "User Login" and vice versa.
                let forward = self.matcher.fuzzy_match(name, requested);
                let backward = self.matcher.fuzzy_match(requested, name);
                let score = forward.max(backward)?;
                (score >= self.threshold).then(|| NameMatch {
                    id,
                    name: name.to_string(),
                    score,
                })
            })
            .collect();
        matches.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.name.cmp(&b.name)));
        matches
    }
}
