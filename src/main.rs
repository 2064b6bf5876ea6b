//! usenet-indexer command-line entry point
//!
//! ```bash
//! usenet-indexer --config ./indexer.toml group add alt.binaries.test --backfill
//! usenet-indexer --config ./indexer.toml update
//! usenet-indexer --config ./indexer.toml backfill --days 30
//! usenet-indexer --config ./indexer.toml repair
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use usenet_indexer::classifier::{RuleField, RuleKind};
use usenet_indexer::db::{GroupRow, NewRule};
use usenet_indexer::{
    BackfillTarget, Config, Database, Error, Indexer, Result, RunSummary, run_with_shutdown,
};

/// Usenet header ingestion engine
#[derive(Parser, Debug)]
#[command(name = "usenet-indexer", version, about, long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(long, short, global = true, default_value = "./indexer.toml")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch new headers for every active group, or one group by name
    Update {
        /// Group name
        group: Option<String>,
    },

    /// Walk older headers for backfill-enabled groups, or one group by name.
    ///
    /// Without `--days` or `--articles` each group uses its own day target.
    Backfill {
        /// Group name
        group: Option<String>,

        /// Reach the article posted this many days ago
        #[arg(long, conflicts_with = "articles")]
        days: Option<u32>,

        /// Fetch this many articles below the oldest local article
        #[arg(long)]
        articles: Option<u64>,
    },

    /// Backfill the first group whose oldest post is newer than the safe date
    SafeBackfill {
        /// Articles to fetch (default from configuration)
        #[arg(long)]
        articles: Option<u64>,
    },

    /// Retry queued missing articles for every active group
    Repair,

    /// Manage the group registry
    Group {
        #[command(subcommand)]
        action: GroupAction,
    },

    /// Manage black/white list rules
    Rule {
        #[command(subcommand)]
        action: RuleAction,
    },

    /// Manage multigroup posters
    Poster {
        #[command(subcommand)]
        action: PosterAction,
    },
}

#[derive(Subcommand, Debug)]
enum GroupAction {
    /// Register a group (re-activates an existing one)
    Add {
        /// Group name
        name: String,
        /// Include the group in backfill runs
        #[arg(long)]
        backfill: bool,
        /// Days of history backfill should reach
        #[arg(long, default_value_t = 1)]
        backfill_days: u32,
    },
    /// List registered groups
    List,
    /// Include a group in update runs
    Enable {
        /// Group name
        name: String,
    },
    /// Exclude a group from update and backfill runs
    Disable {
        /// Group name
        name: String,
    },
    /// Clear a group's watermarks so the next update starts over
    Reset {
        /// Group name
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum RuleAction {
    /// Add a rule
    Add {
        /// Regex selecting the groups the rule applies to
        group_pattern: String,
        /// Regex matched against the header field
        regex: String,
        /// Header field to match
        #[arg(long, value_enum, default_value_t = FieldArg::Subject)]
        field: FieldArg,
        /// Black or white list
        #[arg(long, value_enum, default_value_t = KindArg::Blacklist)]
        kind: KindArg,
        /// Free-form description
        #[arg(long)]
        description: Option<String>,
    },
    /// List rules
    List,
    /// Enable a rule
    Enable {
        /// Rule id
        id: i64,
    },
    /// Disable a rule
    Disable {
        /// Rule id
        id: i64,
    },
    /// Delete a rule
    Delete {
        /// Rule id
        id: i64,
    },
}

#[derive(Subcommand, Debug)]
enum PosterAction {
    /// Treat a poster as a multigroup poster
    Add {
        /// Exact From header
        poster: String,
    },
    /// Stop treating a poster as a multigroup poster
    Remove {
        /// Exact From header
        poster: String,
    },
    /// List multigroup posters
    List,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FieldArg {
    Subject,
    From,
    MessageId,
}

impl From<FieldArg> for RuleField {
    fn from(arg: FieldArg) -> Self {
        match arg {
            FieldArg::Subject => RuleField::Subject,
            FieldArg::From => RuleField::From,
            FieldArg::MessageId => RuleField::MessageId,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    Blacklist,
    Whitelist,
}

impl From<KindArg> for RuleKind {
    fn from(arg: KindArg) -> Self {
        match arg {
            KindArg::Blacklist => RuleKind::Blacklist,
            KindArg::Whitelist => RuleKind::Whitelist,
        }
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    tracing::debug!(config = %cli.config.display(), "Loading configuration");
    let config = Config::from_toml_file(&cli.config).inspect_err(|e| {
        tracing::error!(error = %e, "Failed to load configuration");
    })?;

    match cli.command {
        Commands::Update { group } => {
            let indexer = Indexer::new(config).await?;
            let summary = match group {
                Some(name) => run_with_shutdown(&indexer, indexer.update_group(&name)).await?,
                None => run_with_shutdown(&indexer, indexer.update_all_groups()).await?,
            };
            print_summary(&summary);
        }
        Commands::Backfill {
            group,
            days,
            articles,
        } => {
            let target = match (days, articles) {
                (Some(days), _) => Some(BackfillTarget::Days { days }),
                (None, Some(count)) => Some(BackfillTarget::Articles { count }),
                (None, None) => None,
            };
            let indexer = Indexer::new(config).await?;
            let summary = match group {
                Some(name) => {
                    run_with_shutdown(&indexer, indexer.backfill_group(&name, target)).await?
                }
                None => run_with_shutdown(&indexer, indexer.backfill_all_groups(target)).await?,
            };
            print_summary(&summary);
        }
        Commands::SafeBackfill { articles } => {
            let indexer = Indexer::new(config).await?;
            let summary = run_with_shutdown(&indexer, indexer.safe_backfill(articles)).await?;
            print_summary(&summary);
        }
        Commands::Repair => {
            let indexer = Indexer::new(config).await?;
            let summary = run_with_shutdown(&indexer, indexer.repair_all()).await?;
            print_summary(&summary);
        }
        Commands::Group { action } => {
            let db = Database::new(&config.persistence.database_path).await?;
            handle_group(&db, action).await?;
            db.close().await;
        }
        Commands::Rule { action } => {
            let db = Database::new(&config.persistence.database_path).await?;
            handle_rule(&db, action).await?;
            db.close().await;
        }
        Commands::Poster { action } => {
            let db = Database::new(&config.persistence.database_path).await?;
            handle_poster(&db, action).await?;
            db.close().await;
        }
    }

    Ok(())
}

/// Map `-v` occurrences onto an env filter; `RUST_LOG` wins when set
fn setup_logging(verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
        0 => EnvFilter::new("usenet_indexer=info,warn"),
        1 => EnvFilter::new("usenet_indexer=debug,info"),
        2 => EnvFilter::new("usenet_indexer=trace,debug"),
        _ => EnvFilter::new("trace"),
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn handle_group(db: &Database, action: GroupAction) -> Result<()> {
    match action {
        GroupAction::Add {
            name,
            backfill,
            backfill_days,
        } => {
            let id = db.add_group(&name, backfill, backfill_days).await?;
            println!("Added {name} (id {id})");
        }
        GroupAction::List => {
            for group in db.list_groups().await? {
                print_group(&group);
            }
        }
        GroupAction::Enable { name } => {
            let group = find_group(db, &name).await?;
            db.set_group_active(group.id, true).await?;
            println!("Enabled {name}");
        }
        GroupAction::Disable { name } => {
            let group = find_group(db, &name).await?;
            db.disable_group(group.id).await?;
            println!("Disabled {name}");
        }
        GroupAction::Reset { name } => {
            let group = find_group(db, &name).await?;
            db.reset_group(group.id).await?;
            println!("Reset {name}");
        }
    }
    Ok(())
}

async fn handle_rule(db: &Database, action: RuleAction) -> Result<()> {
    match action {
        RuleAction::Add {
            group_pattern,
            regex,
            field,
            kind,
            description,
        } => {
            let id = db
                .add_rule(&NewRule {
                    group_pattern,
                    regex,
                    field: field.into(),
                    kind: kind.into(),
                    description,
                })
                .await?;
            println!("Added rule {id}");
        }
        RuleAction::List => {
            for rule in db.list_rules(false).await? {
                let kind = match RuleKind::from_tag(rule.kind) {
                    Some(RuleKind::Whitelist) => "white",
                    Some(RuleKind::Blacklist) => "black",
                    None => "?",
                };
                println!(
                    "{:>4} {} {:<5} {:<40} {} {}",
                    rule.id,
                    if rule.enabled { "on " } else { "off" },
                    kind,
                    rule.group_pattern,
                    rule.regex,
                    rule.description.as_deref().unwrap_or("")
                );
            }
        }
        RuleAction::Enable { id } => db.set_rule_enabled(id, true).await?,
        RuleAction::Disable { id } => db.set_rule_enabled(id, false).await?,
        RuleAction::Delete { id } => db.delete_rule(id).await?,
    }
    Ok(())
}

async fn handle_poster(db: &Database, action: PosterAction) -> Result<()> {
    match action {
        PosterAction::Add { poster } => db.add_multigroup_poster(&poster).await?,
        PosterAction::Remove { poster } => {
            if !db.remove_multigroup_poster(&poster).await? {
                println!("{poster} was not registered");
            }
        }
        PosterAction::List => {
            for poster in db.list_multigroup_posters().await? {
                println!("{poster}");
            }
        }
    }
    Ok(())
}

async fn find_group(db: &Database, name: &str) -> Result<GroupRow> {
    db.get_group(name)
        .await?
        .ok_or_else(|| Error::GroupNotFound(name.to_string()))
}

fn print_group(group: &GroupRow) {
    println!(
        "{:<50} {} {} first={} last={} backfill_target={}d",
        group.name,
        if group.active { "active  " } else { "inactive" },
        if group.backfill { "backfill" } else { "        " },
        group.first_record,
        group.last_record,
        group.backfill_target
    );
}

fn print_summary(summary: &RunSummary) {
    println!(
        "groups={} fetched={} not_inserted={} repaired={} abandoned={}",
        summary.groups_processed,
        summary.articles_fetched,
        summary.articles_not_inserted,
        summary.articles_repaired,
        summary.articles_abandoned
    );
    for (group, reason) in &summary.skipped {
        println!("skipped {group}: {reason}");
    }
}
