//! Steward CLI
//!
//! Command-line interface for initializing and inspecting a Steward store.

use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
use steward_core::migrations::{self, MigrationVersion};
use steward_core::EntityType;
use steward_services::{Steward, StewardConfig, TracingChangeLog, UserContext};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "steward")]
#[command(version, about = "Steward governance catalog CLI", long_about = None)]
struct Cli {
    /// Path to the store (overrides STEWARD_DB_PATH)
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new store with default roles
    Init {
        /// Overwrite an existing store
        #[arg(short, long)]
        force: bool,
    },

    /// Inspect or apply schema migrations
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },

    /// Manage roles
    Roles {
        #[command(subcommand)]
        action: RolesAction,
    },

    /// Search the catalog as a user
    Search {
        /// Search query
        query: String,

        /// Username to search as
        #[arg(short, long, default_value = "cli")]
        user: String,

        /// Group memberships of the user (repeatable)
        #[arg(short, long = "group")]
        groups: Vec<String>,
    },

    /// Cost reporting
    Costs {
        #[command(subcommand)]
        action: CostsAction,
    },
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Show schema version and migration history
    Status,
    /// Apply pending migrations
    Run,
}

#[derive(Subcommand)]
enum RolesAction {
    /// List roles and their permissions
    List,
    /// Create the default roles if none exist
    Seed,
}

#[derive(Subcommand)]
enum CostsAction {
    /// Per-currency totals for one entity and month
    Summary {
        /// e.g. data_product
        entity_type: String,
        entity_id: String,
        /// YYYY-MM
        month: String,
    },
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = StewardConfig::from_env();
    if let Some(db) = cli.db {
        config = config.with_db_path(db);
    }

    let result = match cli.command {
        Commands::Init { force } => init_store(config, force).await,
        Commands::Migrate { action } => match action {
            MigrateAction::Status => migrate_status(&config),
            MigrateAction::Run => migrate_run(&config),
        },
        Commands::Roles { action } => match action {
            RolesAction::List => list_roles(config).await,
            RolesAction::Seed => seed_roles(config).await,
        },
        Commands::Search {
            query,
            user,
            groups,
        } => search(config, &query, UserContext::new(user, groups)).await,
        Commands::Costs {
            action:
                CostsAction::Summary {
                    entity_type,
                    entity_id,
                    month,
                },
        } => cost_summary(config, &entity_type, &entity_id, &month).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn open(config: StewardConfig) -> Result<Steward, Box<dyn std::error::Error>> {
    if !Path::new(&config.db_path).exists() {
        return Err(format!(
            "No store at '{}'. Run `steward init` first.",
            config.db_path
        )
        .into());
    }
    tracing::debug!(db_path = %config.db_path, "Opening store");
    Ok(Steward::open(config, Arc::new(TracingChangeLog)).await?)
}

fn format_version(version: MigrationVersion) -> String {
    format!(
        "v{}.{}.{}",
        version / 1_000_000,
        (version / 1_000) % 1_000,
        version % 1_000
    )
}

async fn init_store(config: StewardConfig, force: bool) -> CliResult {
    let path = config.db_path.clone();
    if Path::new(&path).exists() {
        if !force {
            return Err(format!(
                "Store already exists at '{}'. Use --force to overwrite.",
                path
            )
            .into());
        }
        println!("Removing existing store at '{}'", path);
        std::fs::remove_file(&path)?;
    }

    let config = StewardConfig {
        run_migrations: true,
        ..config
    };
    let steward = Steward::open(config, Arc::new(TracingChangeLog)).await?;
    let roles = steward.authz.list_roles().await?;
    println!("Initialized store at '{}' with {} roles", path, roles.len());
    Ok(())
}

fn migrate_status(config: &StewardConfig) -> CliResult {
    let conn = steward_core::open_connection(&config.db_path)?;
    let current = migrations::get_schema_version(&conn)?;

    println!(
        "Schema version: {}",
        if current == 0 {
            "none".to_string()
        } else {
            format_version(current)
        }
    );

    for (version, description, applied_at) in migrations::get_migration_history(&conn)? {
        println!("  [applied] {}  {}  ({})", format_version(version), description, applied_at);
    }
    for migration in migrations::all_migrations()
        .into_iter()
        .filter(|m| m.version > current)
    {
        println!(
            "  [pending] {}  {}",
            format_version(migration.version),
            migration.description
        );
    }
    Ok(())
}

fn migrate_run(config: &StewardConfig) -> CliResult {
    let conn = steward_core::open_connection(&config.db_path)?;
    let applied = steward_core::init_store(&conn, true)?;
    if applied == 0 {
        println!("Schema is up to date");
    } else {
        println!(
            "Applied {} migration(s); schema version {}",
            applied,
            format_version(migrations::get_schema_version(&conn)?)
        );
    }
    Ok(())
}

async fn list_roles(config: StewardConfig) -> CliResult {
    let steward = open(config).await?;
    for role in steward.authz.list_roles().await? {
        println!("{} ({})", role.name, role.id);
        println!("  groups: {}", role.assigned_groups.join(", "));
        for (feature, level) in &role.feature_permissions {
            println!("  {:<16} {}", feature, level);
        }
    }
    Ok(())
}

async fn seed_roles(config: StewardConfig) -> CliResult {
    let steward = open(config).await?;
    // Opening already seeds an empty store; report what exists either way
    let created = steward.authz.ensure_default_roles().await?;
    let total = steward.authz.list_roles().await?.len();
    println!("{} role(s) created, {} total", created, total);
    Ok(())
}

async fn search(config: StewardConfig, query: &str, user: UserContext) -> CliResult {
    let steward = open(config).await?;
    steward.search.build_index().await?;

    let hits = steward.search.search(query, &user).await?;
    if hits.is_empty() {
        println!("No results for '{}'", query);
        return Ok(());
    }

    println!("Found {} result(s):\n", hits.len());
    for hit in hits {
        println!("  {:>3}  {:<18} {}", hit.score, hit.item.item_type, hit.item.title);
        println!("       {}", hit.item.link);
        if !hit.item.description.is_empty() {
            println!("       {}", hit.item.description);
        }
    }
    Ok(())
}

async fn cost_summary(
    config: StewardConfig,
    entity_type: &str,
    entity_id: &str,
    month: &str,
) -> CliResult {
    let entity_type: EntityType = entity_type.parse()?;
    let steward = open(config).await?;

    let summaries = steward.costs.summarize(entity_type, entity_id, month).await?;
    if summaries.is_empty() {
        println!("No costs for {} {} in {}", entity_type, entity_id, month);
        return Ok(());
    }

    for summary in summaries {
        println!(
            "{} {}: {}.{:02} ({} item(s))",
            summary.month,
            summary.currency,
            summary.total_cents / 100,
            summary.total_cents % 100,
            summary.items_count
        );
        for (center, cents) in &summary.by_center {
            println!("  {:<16} {}.{:02}", center, cents / 100, cents % 100);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_format_version() {
        assert_eq!(format_version(1_003_000), "v1.3.0");
        assert_eq!(format_version(2_010_004), "v2.10.4");
    }

    #[test]
    fn test_parse_search_with_groups() {
        let cli = Cli::parse_from([
            "steward", "--db", "x.db", "search", "orders", "--user", "alice", "-g", "a", "-g", "b",
        ]);
        assert_eq!(cli.db.as_deref(), Some("x.db"));
        match cli.command {
            Commands::Search { query, user, groups } => {
                assert_eq!(query, "orders");
                assert_eq!(user, "alice");
                assert_eq!(groups, vec!["a", "b"]);
            }
            _ => panic!("expected search"),
        }
    }
}
