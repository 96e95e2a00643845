//! Steward Services
//!
//! Repositories, managers, authorization and search for the Steward
//! governance catalog.
//!
//! Every entity module follows the same layering:
//! - request/record types (serde)
//! - repository functions over a borrowed `rusqlite::Connection`
//! - an async manager that runs repository calls on the blocking pool and
//!   records change-log entries
//!
//! **Never hold a `rusqlite::Connection` across an `.await`.** Managers open a
//! connection inside `spawn_blocking` for every call.

use rusqlite::Connection;
use std::sync::Arc;
use steward_core::{Result, StewardError};
use tracing::info;

pub mod authorization;
pub mod change_log;
pub mod comments;
pub mod config;
pub mod contracts;
pub mod costs;
pub mod data_products;
pub mod domains;
pub mod metadata;
pub mod projects;
pub mod search;
pub mod semantic_links;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use authorization::{AuthorizationManager, UserContext};
pub use change_log::{ChangeLog, MemoryChangeLog, TracingChangeLog};
pub use config::StewardConfig;
pub use search::{SearchHit, SearchManager, Searchable};

/// Generate a new entity id.
pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Run `f` against a fresh connection on the blocking thread pool.
pub(crate) async fn with_connection<T, F>(db_path: &str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T> + Send + 'static,
{
    let db_path = db_path.to_string();
    tokio::task::spawn_blocking(move || {
        let conn = steward_core::open_connection(&db_path)?;
        f(&conn)
    })
    .await
    .map_err(|e| StewardError::Other(format!("Task join error: {}", e)))?
}

/// Like [`with_connection`], but runs `f` inside a transaction that commits on success.
pub(crate) async fn with_transaction<T, F>(db_path: &str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T> + Send + 'static,
{
    with_connection(db_path, move |conn| {
        let tx = conn.unchecked_transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    })
    .await
}

/// Every manager wired to one store and one change log.
pub struct Steward {
    pub config: StewardConfig,
    pub authz: Arc<AuthorizationManager>,
    pub domains: Arc<domains::DomainManager>,
    pub projects: Arc<projects::ProjectManager>,
    pub contracts: Arc<contracts::ContractManager>,
    pub products: Arc<data_products::DataProductManager>,
    pub comments: Arc<comments::CommentsManager>,
    pub metadata: Arc<metadata::MetadataManager>,
    pub semantic_links: Arc<semantic_links::SemanticLinksManager>,
    pub costs: Arc<costs::CostsManager>,
    pub search: Arc<SearchManager>,
}

impl Steward {
    /// Initialize the store and build all managers.
    ///
    /// Creates the base schema, applies migrations when `config.run_migrations`
    /// is set, seeds default roles into an empty store and registers every
    /// searchable source. The search index is not built; call
    /// [`SearchManager::build_index`].
    pub async fn open(config: StewardConfig, change_log: Arc<dyn ChangeLog>) -> Result<Self> {
        config.validate()?;

        let run_migrations = config.run_migrations;
        let applied = with_connection(&config.db_path, move |conn| {
            steward_core::init_store(conn, run_migrations)
        })
        .await?;
        info!(db_path = %config.db_path, migrations_applied = applied, "Store ready");

        let db_path = config.db_path.clone();
        let authz = Arc::new(AuthorizationManager::new(&config, change_log.clone()));
        authz.ensure_default_roles().await?;

        let ontology = Arc::new(semantic_links::Ontology::new());
        let domains = Arc::new(domains::DomainManager::new(db_path.clone(), change_log.clone()));
        let projects = Arc::new(projects::ProjectManager::new(db_path.clone(), change_log.clone()));
        let contracts = Arc::new(contracts::ContractManager::new(
            db_path.clone(),
            change_log.clone(),
        ));
        let products = Arc::new(data_products::DataProductManager::new(
            db_path.clone(),
            change_log.clone(),
        ));

        let search = Arc::new(SearchManager::new(
            db_path.clone(),
            authz.clone(),
            config.search_max_results,
        ));
        search.register(domains.clone());
        search.register(projects.clone());
        search.register(contracts.clone());
        search.register(products.clone());
        search.register(ontology.clone());

        Ok(Self {
            comments: Arc::new(comments::CommentsManager::new(
                db_path.clone(),
                authz.clone(),
                change_log.clone(),
            )),
            metadata: Arc::new(metadata::MetadataManager::new(
                db_path.clone(),
                change_log.clone(),
            )),
            semantic_links: Arc::new(semantic_links::SemanticLinksManager::new(
                db_path.clone(),
                ontology,
                change_log.clone(),
            )),
            costs: Arc::new(costs::CostsManager::new(db_path, change_log)),
            config,
            authz,
            domains,
            projects,
            contracts,
            products,
            search,
        })
    }

    pub fn ontology(&self) -> &Arc<semantic_links::Ontology> {
        self.semantic_links.ontology()
    }
}
