mod common;

use common::{trunk_config, TestRepo};
use feature_graph::config::Config;
use feature_graph::models::{CreateFeatureInput, UpdateFeatureInput};
use feature_graph::store::{index_path, record_path, IdIndex, Scope};
use feature_graph::workflow::{CreateOptions, FuzzySimilarity, NonInteractive, Workflow};
use feature_graph::ErrorKind;
use speculate2::speculate;

speculate! {
    before {
        let repo = TestRepo::new();
        let config = Config::default();
        let catalog = config.catalog().expect("Failed to build catalog");
        let similarity = FuzzySimilarity::new(config.similarity_threshold);
        let workflow = Workflow::new(&repo.git, &config, &catalog, &NonInteractive, &similarity);
    }

    describe "load_all_branches" {
        it "finds features committed on other branches" {
            workflow.create(CreateFeatureInput::named("Login"), CreateOptions::default()).expect("create");
            repo.checkout("main");
            workflow.create(CreateFeatureInput::named("Search"), CreateOptions::default()).expect("create");
            repo.checkout("main");

            let current = workflow.store().load_current_branch().expect("load");
            assert!(current.is_empty());

            let all = workflow.store().load_all_branches().expect("load");
            assert_eq!(all.len(), 2);
            assert_eq!(all.find("login").expect("find").branch, "feature/login");
            assert_eq!(all.find("SEARCH").expect("find").branch, "feature/search");
        }

        it "deduplicates copies carried by several branches" {
            workflow.create(CreateFeatureInput::named("Login"), CreateOptions::default()).expect("create");
            // Search branches off feature/login and so carries Login's record too.
            workflow.create(CreateFeatureInput::named("Search"), CreateOptions::default()).expect("create");

            let all = workflow.store().load_all_branches().expect("load");
            assert_eq!(all.len(), 2);
            let login = all.find("Login").expect("find");
            assert_eq!(login.branch, "feature/login");
            assert_eq!(login.refs, vec!["feature/login".to_string(), "feature/search".to_string()]);
            assert!(all.divergences().is_empty());
        }

        it "reports malformed records without failing" {
            workflow.create(CreateFeatureInput::named("Login"), CreateOptions::default()).expect("create");
            repo.commit_file(".features/broken-00000000.yaml", "name: [unclosed\n", "Add broken record");

            let all = workflow.store().load_all_branches().expect("load");
            assert_eq!(all.len(), 1);
            assert_eq!(all.malformed().len(), 1);
            assert_eq!(all.malformed()[0].path, ".features/broken-00000000.yaml");
        }
    }

    describe "record files" {
        it "writes the record and the index on the feature branch" {
            let outcome = workflow.create(CreateFeatureInput::named("Login"), CreateOptions::default()).expect("create");
            let path = record_path(".features", &outcome.feature);

            assert!(repo.path().join(&path).exists());
            let index = IdIndex::parse(repo.read(&index_path(".features")).as_bytes()).expect("index");
            assert_eq!(index.get(&outcome.feature.id), Some(path.as_str()));
            assert!(repo.git.dirty_paths().expect("status").is_empty());
        }

        it "moves the record when the feature is renamed" {
            let outcome = workflow.create(CreateFeatureInput::named("Login"), CreateOptions::default()).expect("create");
            let old_path = record_path(".features", &outcome.feature);

            let renamed = workflow
                .update("Login", UpdateFeatureInput {
                    name: Some("Sign In".to_string()),
                    ..Default::default()
                })
                .expect("update");
            let new_path = record_path(".features", &renamed);

            assert_ne!(old_path, new_path);
            assert!(!repo.path().join(&old_path).exists());
            assert!(repo.path().join(&new_path).exists());
            let current = workflow.store().load_current_branch().expect("load");
            assert_eq!(current.len(), 1);
            assert_eq!(current.find("sign in").expect("find").path, new_path);
        }

        it "rejects an empty update" {
            workflow.create(CreateFeatureInput::named("Login"), CreateOptions::default()).expect("create");
            let err = workflow.update("Login", UpdateFeatureInput::default()).unwrap_err();
            assert!(err.to_string().contains("nothing to update"));
        }
    }

    describe "find_by_name_or_id" {
        it "accepts a unique id prefix" {
            let outcome = workflow.create(CreateFeatureInput::named("Login"), CreateOptions::default()).expect("create");
            let found = workflow
                .store()
                .find_by_name_or_id(&outcome.feature.short_id(), Scope::CrossBranch)
                .expect("find");
            assert_eq!(found.feature.id, outcome.feature.id);
        }

        it "reads a full id through the index on the current branch" {
            let outcome = workflow.create(CreateFeatureInput::named("Login"), CreateOptions::default()).expect("create");
            let found = workflow
                .store()
                .find_by_name_or_id(&outcome.feature.id.to_string(), Scope::CurrentBranch)
                .expect("find");
            assert_eq!(found.feature.name, "Login");
            assert_eq!(found.branch, "feature/login");
        }

        it "returns NotFound for unknown names" {
            let err = workflow
                .store()
                .find_by_name_or_id("Nothing Here", Scope::CrossBranch)
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NotFound);
        }
    }

    describe "remote-only features" {
        it "writes to a local branch created from the remote tip" {
            workflow.create(CreateFeatureInput::named("Remote Work"), CreateOptions::default()).expect("create");
            repo.checkout("main");
            repo.move_to_remote("feature/remote-work");

            let set = workflow.store().load_all_branches().expect("load");
            let stored = set.find("Remote Work").expect("find");
            assert!(stored.remote_only);
            assert_eq!(stored.branch, "feature/remote-work");
            assert_eq!(stored.source_ref, "origin/feature/remote-work");

            workflow
                .update("Remote Work", UpdateFeatureInput {
                    description: Some("picked up locally".to_string()),
                    ..Default::default()
                })
                .expect("update");

            assert!(repo.tip("feature/remote-work").is_some());
            let set = workflow.store().load_all_branches().expect("load");
            let stored = set.find("Remote Work").expect("find");
            assert!(!stored.remote_only);
            assert_eq!(stored.source_ref, "feature/remote-work");
            assert_eq!(stored.feature.description.as_deref(), Some("picked up locally"));
        }

        it "switch creates the tracking branch" {
            workflow.create(CreateFeatureInput::named("Remote Work"), CreateOptions::default()).expect("create");
            repo.checkout("main");
            repo.move_to_remote("feature/remote-work");

            let branch = workflow.switch("Remote Work").expect("switch");
            assert_eq!(branch, "feature/remote-work");
            assert_eq!(repo.current_branch(), "feature/remote-work");
        }
    }

    describe "trunk-based mode" {
        it "records features on the current branch" {
            let config = trunk_config();
            let workflow = Workflow::new(&repo.git, &config, &catalog, &NonInteractive, &similarity);
            let outcome = workflow.create(CreateFeatureInput::named("Login"), CreateOptions::default()).expect("create");

            assert_eq!(outcome.branch, "main");
            assert_eq!(repo.current_branch(), "main");
            assert!(outcome.feature.active_branch().is_none());
            assert_eq!(workflow.store().load_current_branch().expect("load").len(), 1);
        }
    }
}
