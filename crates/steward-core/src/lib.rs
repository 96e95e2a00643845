//! Steward Core
//!
//! Core types, error handling, and SQLite schema for the Steward governance catalog.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub mod migrations;
pub mod validation;

// ============================================================================
// Entity Types
// ============================================================================

/// Kinds of governed entities. Comments, metadata, semantic links and cost
/// items attach to an `(EntityType, id)` pair; roles only appear in the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    DataDomain,
    DataProduct,
    DataContract,
    Project,
    OntologyConcept,
    AppRole,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::DataDomain => "data_domain",
            EntityType::DataProduct => "data_product",
            EntityType::DataContract => "data_contract",
            EntityType::Project => "project",
            EntityType::OntologyConcept => "ontology_concept",
            EntityType::AppRole => "app_role",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityType {
    type Err = StewardError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "data_domain" => Ok(EntityType::DataDomain),
            "data_product" => Ok(EntityType::DataProduct),
            "data_contract" => Ok(EntityType::DataContract),
            "project" => Ok(EntityType::Project),
            "ontology_concept" => Ok(EntityType::OntologyConcept),
            "app_role" => Ok(EntityType::AppRole),
            _ => Err(StewardError::ValidationError(format!(
                "Unknown entity type: {}",
                s
            ))),
        }
    }
}

// ============================================================================
// Feature Permissions
// ============================================================================

/// Access level a role grants on a feature.
///
/// Variants are declared in ascending order, so the derived `Ord` is the
/// privilege order used when merging roles.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum FeatureAccessLevel {
    #[default]
    None,
    ReadOnly,
    Filtered,
    ReadWrite,
    Full,
    Admin,
}

impl FeatureAccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureAccessLevel::None => "none",
            FeatureAccessLevel::ReadOnly => "read_only",
            FeatureAccessLevel::Filtered => "filtered",
            FeatureAccessLevel::ReadWrite => "read_write",
            FeatureAccessLevel::Full => "full",
            FeatureAccessLevel::Admin => "admin",
        }
    }
}

impl std::fmt::Display for FeatureAccessLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FeatureAccessLevel {
    type Err = StewardError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', ' '], "_").as_str() {
            "none" => Ok(FeatureAccessLevel::None),
            "read_only" => Ok(FeatureAccessLevel::ReadOnly),
            "filtered" => Ok(FeatureAccessLevel::Filtered),
            "read_write" => Ok(FeatureAccessLevel::ReadWrite),
            "full" => Ok(FeatureAccessLevel::Full),
            "admin" => Ok(FeatureAccessLevel::Admin),
            _ => Err(StewardError::ValidationError(format!(
                "Unknown access level: {}",
                s
            ))),
        }
    }
}

/// Feature identifiers that roles grant access to.
pub mod features {
    pub const DATA_DOMAINS: &str = "data-domains";
    pub const DATA_PRODUCTS: &str = "data-products";
    pub const DATA_CONTRACTS: &str = "data-contracts";
    pub const PROJECTS: &str = "projects";
    pub const COMMENTS: &str = "comments";
    pub const SEMANTIC_MODELS: &str = "semantic-models";
    pub const COSTS: &str = "costs";
    pub const SEARCH: &str = "search";
    pub const SETTINGS: &str = "settings";

    pub const ALL: &[&str] = &[
        DATA_DOMAINS,
        DATA_PRODUCTS,
        DATA_CONTRACTS,
        PROJECTS,
        COMMENTS,
        SEMANTIC_MODELS,
        COSTS,
        SEARCH,
        SETTINGS,
    ];

    /// Whether `id` names a known feature.
    pub fn is_known(id: &str) -> bool {
        ALL.contains(&id)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors that can occur in governance operations
#[derive(Debug, thiserror::Error)]
pub enum StewardError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict detected: {0}")]
    ConflictError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for StewardError {
    fn from(err: serde_json::Error) -> Self {
        StewardError::SerializationError(err.to_string())
    }
}

/// Result type for governance operations
pub type Result<T> = std::result::Result<T, StewardError>;

/// Map a unique-constraint violation to a conflict, passing other errors through.
pub fn conflict_on_unique(err: rusqlite::Error, message: impl Into<String>) -> StewardError {
    match err {
        rusqlite::Error::SqliteFailure(ref e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
        {
            StewardError::ConflictError(message.into())
        }
        other => StewardError::Sqlite(other),
    }
}

// ============================================================================
// JSON List Columns
// ============================================================================

/// Encode a list-valued field for storage in a TEXT column.
pub fn encode_list<T: Serialize>(items: &[T]) -> Result<String> {
    Ok(serde_json::to_string(items)?)
}

/// Decode a list-valued TEXT column.
///
/// NULL and malformed values decode to an empty list so a single bad row
/// never breaks a listing.
pub fn decode_list<T: DeserializeOwned>(raw: Option<String>) -> Vec<T> {
    match raw {
        Some(s) if !s.is_empty() => match serde_json::from_str(&s) {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed JSON list column, treating as empty");
                Vec::new()
            }
        },
        _ => Vec::new(),
    }
}

// ============================================================================
// Connections and Schema
// ============================================================================

/// Busy timeout applied to every connection.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a catalog connection with foreign keys enforced.
pub fn open_connection(path: impl AsRef<Path>) -> Result<rusqlite::Connection> {
    let conn = rusqlite::Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

/// Initialize the base SQLite schema
///
/// Creates the tables present since the first release:
/// - `data_domains`: Hierarchical business domains
/// - `projects`: Team and personal workspaces
/// - `data_contracts`: Versioned schema contracts
/// - `data_products`: Versioned data products with ports
/// - `app_roles`: Group-assigned roles with feature permissions
/// - `comments`: Audience-scoped comments on any entity
///
/// Metadata, semantic links and costs arrive through migrations.
pub fn init_sqlite_schema(conn: &rusqlite::Connection) -> Result<()> {
    let ddl = r#"
    CREATE TABLE IF NOT EXISTS data_domains (
      id TEXT PRIMARY KEY,
      name TEXT UNIQUE NOT NULL,
      description TEXT,
      parent_id TEXT,
      owners TEXT NOT NULL DEFAULT '[]',
      tags TEXT NOT NULL DEFAULT '[]',
      created_by TEXT NOT NULL,
      created_at TEXT NOT NULL,
      updated_at TEXT NOT NULL,
      FOREIGN KEY (parent_id) REFERENCES data_domains(id)
    );

    CREATE INDEX IF NOT EXISTS idx_data_domains_parent ON data_domains(parent_id);

    CREATE TABLE IF NOT EXISTS projects (
      id TEXT PRIMARY KEY,
      name TEXT UNIQUE NOT NULL,
      title TEXT,
      description TEXT,
      owner TEXT NOT NULL,
      team_members TEXT NOT NULL DEFAULT '[]',
      tags TEXT NOT NULL DEFAULT '[]',
      created_by TEXT NOT NULL,
      created_at TEXT NOT NULL,
      updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_projects_owner ON projects(owner);

    CREATE TABLE IF NOT EXISTS data_contracts (
      id TEXT PRIMARY KEY,
      name TEXT NOT NULL,
      version TEXT NOT NULL,
      status TEXT NOT NULL DEFAULT 'draft',
      owner TEXT NOT NULL,
      domain_id TEXT,
      description TEXT,
      schema_objects TEXT NOT NULL DEFAULT '[]',
      tags TEXT NOT NULL DEFAULT '[]',
      created_by TEXT NOT NULL,
      created_at TEXT NOT NULL,
      updated_at TEXT NOT NULL,
      FOREIGN KEY (domain_id) REFERENCES data_domains(id) ON DELETE SET NULL,
      UNIQUE(name, version)
    );

    CREATE INDEX IF NOT EXISTS idx_data_contracts_domain ON data_contracts(domain_id);
    CREATE INDEX IF NOT EXISTS idx_data_contracts_status ON data_contracts(status);

    CREATE TABLE IF NOT EXISTS data_products (
      id TEXT PRIMARY KEY,
      name TEXT NOT NULL,
      version TEXT NOT NULL,
      product_type TEXT NOT NULL,
      status TEXT NOT NULL DEFAULT 'draft',
      owner TEXT NOT NULL,
      domain_id TEXT,
      project_id TEXT,
      description TEXT,
      tags TEXT NOT NULL DEFAULT '[]',
      input_ports TEXT NOT NULL DEFAULT '[]',
      output_ports TEXT NOT NULL DEFAULT '[]',
      created_by TEXT NOT NULL,
      created_at TEXT NOT NULL,
      updated_at TEXT NOT NULL,
      FOREIGN KEY (domain_id) REFERENCES data_domains(id) ON DELETE SET NULL,
      FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE SET NULL,
      UNIQUE(name, version)
    );

    CREATE INDEX IF NOT EXISTS idx_data_products_domain ON data_products(domain_id);
    CREATE INDEX IF NOT EXISTS idx_data_products_status ON data_products(status);

    CREATE TABLE IF NOT EXISTS app_roles (
      id TEXT PRIMARY KEY,
      name TEXT UNIQUE NOT NULL,
      description TEXT,
      assigned_groups TEXT NOT NULL DEFAULT '[]',
      feature_permissions TEXT NOT NULL DEFAULT '{}',
      created_at TEXT NOT NULL,
      updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS comments (
      id TEXT PRIMARY KEY,
      entity_type TEXT NOT NULL,
      entity_id TEXT NOT NULL,
      title TEXT,
      comment TEXT NOT NULL,
      audience TEXT,
      status TEXT NOT NULL DEFAULT 'active',
      created_by TEXT NOT NULL,
      updated_by TEXT,
      created_at TEXT NOT NULL,
      updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_comments_entity ON comments(entity_type, entity_id);
    CREATE INDEX IF NOT EXISTS idx_comments_status ON comments(status);
    "#;

    conn.execute_batch(ddl)?;
    Ok(())
}

/// Initialize the store: base schema + migrations.
///
/// Idempotent. Returns the number of migrations applied (0 if already up to date).
pub fn init_store(conn: &rusqlite::Connection, run_migrations_flag: bool) -> Result<usize> {
    init_sqlite_schema(conn)?;

    if run_migrations_flag {
        migrations::run_migrations(conn)
    } else {
        Ok(0)
    }
}
