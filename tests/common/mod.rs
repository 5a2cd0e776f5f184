#![allow(dead_code)]

use std::fs;
use std::path::Path;

use git2::{Commit, Oid, Repository, RepositoryInitOptions};
use tempfile::TempDir;

use feature_graph::config::{Config, CreationMode};
use feature_graph::git::GitRepo;

/// Throwaway repository on `main` with one commit holding `README.md`.
pub struct TestRepo {
    pub dir: TempDir,
    pub git: GitRepo,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(dir.path(), &opts).expect("Failed to init repository");
        {
            let mut config = repo.config().expect("Failed to open repo config");
            config.set_str("user.name", "Test User").expect("Failed to set name");
            config
                .set_str("user.email", "test@example.com")
                .expect("Failed to set email");
        }
        let git = GitRepo::from_repository(repo).expect("Failed to wrap repository");
        let this = Self { dir, git };
        this.commit_file("README.md", "hello\n", "Initial commit");
        this
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn repo(&self) -> &Repository {
        self.git.raw()
    }

    pub fn write(&self, path: &str, content: &str) {
        let full = self.path().join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).expect("Failed to create dirs");
        }
        fs::write(full, content).expect("Failed to write file");
    }

    pub fn read(&self, path: &str) -> String {
        fs::read_to_string(self.path().join(path)).expect("Failed to read file")
    }

    pub fn stage(&self, path: &str) {
        let mut index = self.repo().index().expect("Failed to open index");
        index.add_path(Path::new(path)).expect("Failed to stage");
        index.write().expect("Failed to write index");
    }

    /// Write, stage and commit on HEAD with plain git.
    pub fn commit_file(&self, path: &str, content: &str, message: &str) -> Oid {
        self.write(path, content);
        self.stage(path);
        let repo = self.repo();
        let mut index = repo.index().expect("Failed to open index");
        let tree = repo
            .find_tree(index.write_tree().expect("Failed to write tree"))
            .expect("Failed to find tree");
        let sig = repo.signature().expect("Failed to build signature");
        let parents: Vec<Commit<'_>> = match repo.head() {
            Ok(head) => vec![head.peel_to_commit().expect("HEAD is not a commit")],
            Err(_) => Vec::new(),
        };
        let parent_refs: Vec<&Commit<'_>> = parents.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
            .expect("Failed to commit")
    }

    pub fn checkout(&self, branch: &str) {
        self.git.checkout_branch(branch).expect("Failed to check out");
    }

    pub fn current_branch(&self) -> String {
        self.git
            .current_branch()
            .expect("Failed to read HEAD")
            .expect("HEAD is detached")
    }

    pub fn tip(&self, branch: &str) -> Option<Oid> {
        self.git.branch_tip(branch).expect("Failed to read branch")
    }

    /// Pretend `branch` was fetched from `origin` and drop the local copy.
    pub fn move_to_remote(&self, branch: &str) {
        let tip = self.tip(branch).expect("branch has no tip");
        if self.repo().find_remote("origin").is_err() {
            self.repo()
                .remote("origin", "https://example.invalid/repo.git")
                .expect("Failed to add remote");
        }
        self.repo()
            .reference(&format!("refs/remotes/origin/{}", branch), tip, true, "fake fetch")
            .expect("Failed to create remote ref");
        self.git.delete_branch(branch).expect("Failed to delete branch");
    }
}

pub fn trunk_config() -> Config {
    Config {
        creation_mode: CreationMode::TrunkBased,
        ..Config::default()
    }
}
