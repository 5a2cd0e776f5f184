use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use feature_graph::config::Config;
use feature_graph::git::GitRepo;
use feature_graph::graph::{Catalog, LinkOptions};
use feature_graph::models::{
    Category, CreateFeatureInput, RelationshipType, UpdateFeatureInput, VersionConstraint,
    VersionState,
};
use feature_graph::report::render_tree;
use feature_graph::store::Scope;
use feature_graph::validate::{Severity, Validator};
use feature_graph::workflow::{
    Choice, CommitOptions, CreateOptions, FuzzySimilarity, ListFilter, MergeOptions, NameMatch,
    NonInteractive, Prompter, Workflow,
};

#[derive(Parser)]
#[command(name = "fgraph")]
#[command(about = "Feature tracking stored in git, with a cross-branch relationship graph")]
struct Cli {
    /// Repository to operate on (defaults to the current directory)
    #[arg(short = 'C', long, global = true)]
    repo: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, value_enum)]
    format: Option<Format>,

    /// Never prompt; similar names do not stop `create`
    #[arg(short, long, global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Yaml,
    Json,
}

#[derive(Args)]
struct ScopeArgs {
    /// Only read the checked-out branch
    #[arg(long)]
    current_branch: bool,
}

impl ScopeArgs {
    fn scope(&self) -> Scope {
        if self.current_branch {
            Scope::CurrentBranch
        } else {
            Scope::CrossBranch
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration to the repository
    Init,
    /// Create a feature and its first version
    Create {
        name: String,
        #[arg(short, long)]
        description: Option<String>,
        #[arg(short, long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        priority: Option<String>,
        #[arg(long = "type")]
        kind: Option<String>,
        /// Record the feature on the base branch
        #[arg(long)]
        shared: bool,
    },
    /// List features across branches
    List {
        #[arg(long)]
        state: Option<String>,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        branch: Option<String>,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Show one feature by name, id or id prefix
    Show {
        feature: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Edit feature fields
    Update {
        feature: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(short, long)]
        description: Option<String>,
        #[arg(long = "add-tag")]
        add_tags: Vec<String>,
        #[arg(long = "remove-tag")]
        remove_tags: Vec<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        priority: Option<String>,
        #[arg(long = "type")]
        kind: Option<String>,
    },
    /// Check out the branch of a feature's active version
    Switch { feature: String },
    /// Commit staged work, attributed to the feature owning the branch
    Commit {
        #[arg(short, long)]
        message: String,
        /// Stage modified tracked files first
        #[arg(short, long)]
        all: bool,
        /// Attribute the commit to this feature
        #[arg(long)]
        feature: Option<String>,
    },
    /// Close a version by merging its branch into the base branch
    Merge {
        #[arg(required_unless_present_any = ["continue_merge", "abort"])]
        feature: Option<String>,
        #[arg(long)]
        squash: bool,
        #[arg(long)]
        keep_branch: bool,
        #[arg(long = "continue", conflicts_with = "abort")]
        continue_merge: bool,
        #[arg(long)]
        abort: bool,
    },
    /// Start the next version of a closed feature
    Reopen { feature: String },
    /// Add a typed relationship (and its inverse)
    Link {
        source: String,
        #[arg(value_name = "TYPE")]
        kind: String,
        target: String,
        #[arg(short, long)]
        description: Option<String>,
        /// Requirement on the target's latest closed version, e.g. ">=2"
        #[arg(long)]
        constraint: Option<String>,
    },
    /// Remove a relationship (and its inverse)
    Unlink {
        source: String,
        #[arg(value_name = "TYPE")]
        kind: String,
        target: String,
    },
    /// Render the relationships below a feature
    Tree {
        feature: String,
        /// Only follow these relationship types
        #[arg(short, long = "type")]
        types: Vec<String>,
        #[arg(long)]
        depth: Option<usize>,
    },
    /// List everything that transitively depends on a feature
    Impact {
        feature: String,
        #[arg(long)]
        depth: Option<usize>,
    },
    /// Check the graph for consistency
    Validate {
        /// Repair orphans, missing inverses and stale names
        #[arg(long)]
        fix: bool,
    },
    /// Show the current branch and its feature
    Status,
    /// Show configured categories and relationship types
    Types,
}

/// Initialize tracing to stderr so stdout stays clean for command output
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "feature_graph=info".into()),
    );

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Asks on stderr, answers from stdin.
struct StdinPrompter;

impl Prompter for StdinPrompter {
    fn duplicate_name(&self, requested: &str, matches: &[NameMatch]) -> feature_graph::Result<Choice> {
        let mut err = io::stderr();
        writeln!(err, "Features with names similar to {:?} already exist:", requested)?;
        for (i, m) in matches.iter().enumerate() {
            writeln!(err, "  {}) {} ({})", i + 1, m.name, m.id)?;
        }
        write!(err, "Reuse one [1-{}], create new [n], or cancel [c]: ", matches.len())?;
        err.flush()?;

        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        let answer = line.trim();
        if answer.eq_ignore_ascii_case("n") {
            return Ok(Choice::CreateNew);
        }
        Ok(answer
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| matches.get(i))
            .map_or(Choice::Cancel, |m| Choice::Reuse(m.id)))
    }
}

fn emit<T: Serialize>(format: Option<Format>, value: &T) -> anyhow::Result<()> {
    let out = match format.unwrap_or(Format::Yaml) {
        Format::Yaml => serde_yaml::to_string(value)?,
        Format::Json => serde_json::to_string_pretty(value)? + "\n",
    };
    print!("{}", out);
    Ok(())
}

#[derive(Serialize)]
struct ImpactEntry {
    id: Uuid,
    name: String,
    depth: usize,
    via: String,
    state: VersionState,
}

#[derive(Serialize)]
struct TypesReport<'a> {
    categories: &'a [Category],
    relationship_types: &'a [RelationshipType],
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let start = match &cli.repo {
        Some(path) => path.clone(),
        None => std::env::current_dir()?,
    };
    let git = GitRepo::open(&start)
        .with_context(|| format!("no git repository at {}", start.display()))?;
    let workdir = git.workdir()?.to_path_buf();

    if let Commands::Init = cli.command {
        let config = Config::default();
        config.save(&workdir)?;
        tracing::info!(path = %workdir.display(), "wrote default configuration");
        return emit(cli.format, &config);
    }

    let config = Config::load(&workdir).context("failed to load configuration")?;
    let catalog: Catalog = config.catalog().context("invalid relationship catalog")?;
    let similarity = FuzzySimilarity::new(config.similarity_threshold);
    let prompter: &dyn Prompter = if cli.yes { &NonInteractive } else { &StdinPrompter };
    let workflow = Workflow::new(&git, &config, &catalog, prompter, &similarity);
    let format = cli.format;

    match cli.command {
        Commands::Init => unreachable!("handled above"),
        Commands::Create {
            name,
            description,
            tags,
            category,
            priority,
            kind,
            shared,
        } => {
            let input = CreateFeatureInput {
                name,
                description,
                tags: tags.into_iter().collect(),
                category,
                priority,
                kind,
            };
            let outcome = workflow.create(input, CreateOptions { shared })?;
            emit(format, &outcome)?;
        }
        Commands::List {
            state,
            tag,
            category,
            branch,
            scope,
        } => {
            let state = state
                .map(|s| {
                    VersionState::from_str(&s)
                        .ok_or_else(|| anyhow::anyhow!("unknown state {:?}", s))
                })
                .transpose()?;
            let filter = ListFilter {
                state,
                tag,
                category,
                branch,
            };
            let features = workflow.list(&filter, scope.scope())?;
            emit(format, &features)?;
        }
        Commands::Show { feature, scope } => {
            let stored = workflow.show(&feature, scope.scope())?;
            emit(format, &stored)?;
        }
        Commands::Update {
            feature,
            name,
            description,
            add_tags,
            remove_tags,
            category,
            priority,
            kind,
        } => {
            let input = UpdateFeatureInput {
                name,
                description,
                add_tags,
                remove_tags,
                category,
                priority,
                kind,
            };
            let updated = workflow.update(&feature, input)?;
            emit(format, &updated)?;
        }
        Commands::Switch { feature } => {
            let branch = workflow.switch(&feature)?;
            println!("{}", branch);
        }
        Commands::Commit {
            message,
            all,
            feature,
        } => {
            let outcome = workflow.commit(&message, CommitOptions { all, feature })?;
            emit(format, &outcome)?;
        }
        Commands::Merge {
            feature,
            squash,
            keep_branch,
            continue_merge,
            abort,
        } => {
            if abort {
                let state = workflow.merge_abort()?;
                emit(format, &state)?;
            } else if continue_merge {
                let outcome = workflow.merge_continue()?;
                emit(format, &outcome)?;
            } else {
                let feature = feature.context("a feature is required")?;
                let outcome = workflow.merge(&feature, MergeOptions { squash, keep_branch })?;
                emit(format, &outcome)?;
            }
        }
        Commands::Reopen { feature } => {
            let reopened = workflow.reopen(&feature)?;
            emit(format, &reopened)?;
        }
        Commands::Link {
            source,
            kind,
            target,
            description,
            constraint,
        } => {
            let version_constraint = constraint
                .map(|c| c.parse::<VersionConstraint>())
                .transpose()?;
            let set = workflow.store().load_all_branches()?;
            let options = LinkOptions {
                description,
                version_constraint,
            };
            let outcome = workflow.graph().link(&set, &source, &target, &kind, options)?;
            for warning in &outcome.warnings {
                eprintln!("warning: {}", warning);
            }
            emit(format, &outcome)?;
        }
        Commands::Unlink {
            source,
            kind,
            target,
        } => {
            let set = workflow.store().load_all_branches()?;
            let removed = workflow.graph().unlink(&set, &source, &target, &kind)?;
            if !removed {
                eprintln!("nothing to remove");
            }
        }
        Commands::Tree {
            feature,
            types,
            depth,
        } => {
            let set = workflow.store().load_all_branches()?;
            let id = set.find(&feature)?.feature.id;
            let tree = workflow.graph().tree(&set, id, &types, depth);
            match (format, tree) {
                (None, Some(node)) => print!("{}", render_tree(&[node])),
                (Some(_), tree) => emit(format, &tree)?,
                (None, None) => {}
            }
        }
        Commands::Impact { feature, depth } => {
            let set = workflow.store().load_all_branches()?;
            let id = set.find(&feature)?.feature.id;
            let entries: Vec<ImpactEntry> = workflow
                .graph()
                .impacted(&set, id, depth)
                .map(|visit| ImpactEntry {
                    id: visit.feature.id,
                    name: visit.feature.name.clone(),
                    depth: visit.depth,
                    via: visit.via,
                    state: visit.feature.state(),
                })
                .collect();
            emit(format, &entries)?;
        }
        Commands::Validate { fix } => {
            let set = workflow.store().load_all_branches()?;
            let validator = Validator::new(&catalog);
            if fix {
                let report = validator.fix(workflow.store(), &set)?;
                emit(format, &report)?;
                return Ok(());
            }
            let issues = validator.validate(&set);
            emit(format, &issues)?;
            if issues.iter().any(|i| i.severity == Severity::Error) {
                std::process::exit(1);
            }
        }
        Commands::Status => {
            let status = workflow.status()?;
            emit(format, &status)?;
        }
        Commands::Types => {
            emit(
                format,
                &TypesReport {
                    categories: catalog.categories(),
                    relationship_types: catalog.types(),
                },
            )?;
        }
    }

    Ok(())
}
