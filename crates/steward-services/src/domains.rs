//! Data Domains
//!
//! Business domains form a forest: each domain may name a parent. Names are
//! unique, parents must exist, and re-parenting may not introduce a cycle.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use steward_core::validation::{self, FieldError};
use steward_core::{
    conflict_on_unique, decode_list, encode_list, features, EntityType, Result, StewardError,
};
use tracing::info;

use crate::authorization::UserContext;
use crate::change_log::{ChangeLog, ChangeLogEntry};
use crate::search::{SearchIndexItem, Searchable};
use crate::{new_id, with_connection};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataDomain {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub parent_id: Option<String>,
    pub owners: Vec<String>,
    pub tags: Vec<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataDomainRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub owners: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

pub fn validate_domain(req: &DataDomainRequest) -> Vec<FieldError> {
    let mut errors = Vec::new();
    if let Err(e) = validation::validate_name(&req.name, "Domain name") {
        errors.push(FieldError::new("name", e.to_string()));
    }
    if let Err(e) = validation::validate_tags(&req.tags) {
        errors.push(FieldError::new("tags", e.to_string()));
    }
    if req.owners.iter().any(|o| o.trim().is_empty()) {
        errors.push(FieldError::new("owners", "Owner cannot be empty"));
    }
    errors
}

// =============================================================================
// Database Operations
// =============================================================================

const DOMAIN_COLUMNS: &str =
    "id, name, description, parent_id, owners, tags, created_by, created_at, updated_at";

fn domain_from_row(row: &Row<'_>) -> rusqlite::Result<DataDomain> {
    Ok(DataDomain {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        parent_id: row.get(3)?,
        owners: decode_list(row.get(4)?),
        tags: decode_list(row.get(5)?),
        created_by: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn require_parent(conn: &Connection, parent_id: Option<&str>) -> Result<()> {
    if let Some(parent_id) = parent_id {
        if get_domain(conn, parent_id)?.is_none() {
            return Err(StewardError::ValidationError(format!(
                "Parent domain {} does not exist",
                parent_id
            )));
        }
    }
    Ok(())
}

pub fn create_domain(
    conn: &Connection,
    req: &DataDomainRequest,
    created_by: &str,
) -> Result<DataDomain> {
    validation::into_result(validate_domain(req))?;
    require_parent(conn, req.parent_id.as_deref())?;

    let now = Utc::now();
    let domain = DataDomain {
        id: new_id(),
        name: req.name.clone(),
        description: req.description.clone(),
        parent_id: req.parent_id.clone(),
        owners: req.owners.clone(),
        tags: req.tags.clone(),
        created_by: created_by.to_string(),
        created_at: now,
        updated_at: now,
    };

    conn.execute(
        "INSERT INTO data_domains (id, name, description, parent_id, owners, tags, created_by, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        rusqlite::params![
            domain.id,
            domain.name,
            domain.description,
            domain.parent_id,
            encode_list(&domain.owners)?,
            encode_list(&domain.tags)?,
            domain.created_by,
            domain.created_at,
            domain.updated_at,
        ],
    )
    .map_err(|e| conflict_on_unique(e, format!("Domain '{}' already exists", domain.name)))?;

    Ok(domain)
}

pub fn get_domain(conn: &Connection, id: &str) -> Result<Option<DataDomain>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM data_domains WHERE id = ?1", DOMAIN_COLUMNS),
            [id],
            domain_from_row,
        )
        .optional()?)
}

pub fn get_domain_by_name(conn: &Connection, name: &str) -> Result<Option<DataDomain>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM data_domains WHERE name = ?1", DOMAIN_COLUMNS),
            [name],
            domain_from_row,
        )
        .optional()?)
}

pub fn list_domains(conn: &Connection) -> Result<Vec<DataDomain>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM data_domains ORDER BY name",
        DOMAIN_COLUMNS
    ))?;
    let domains = stmt
        .query_map([], domain_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(domains)
}

pub fn list_children(conn: &Connection, parent_id: &str) -> Result<Vec<DataDomain>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM data_domains WHERE parent_id = ?1 ORDER BY name",
        DOMAIN_COLUMNS
    ))?;
    let domains = stmt
        .query_map([parent_id], domain_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(domains)
}

/// Whether `candidate` is `id` itself or one of its descendants.
fn is_self_or_descendant(conn: &Connection, id: &str, candidate: &str) -> Result<bool> {
    let found: i64 = conn.query_row(
        "WITH RECURSIVE subtree(id) AS (
             SELECT ?1
             UNION
             SELECT d.id FROM data_domains d JOIN subtree s ON d.parent_id = s.id
         )
         SELECT COUNT(*) FROM subtree WHERE id = ?2",
        [id, candidate],
        |row| row.get(0),
    )?;
    Ok(found > 0)
}

pub fn update_domain(conn: &Connection, id: &str, req: &DataDomainRequest) -> Result<DataDomain> {
    validation::into_result(validate_domain(req))?;

    if get_domain(conn, id)?.is_none() {
        return Err(StewardError::NotFound(format!("Domain {}", id)));
    }

    if let Some(parent_id) = req.parent_id.as_deref() {
        require_parent(conn, Some(parent_id))?;
        if is_self_or_descendant(conn, id, parent_id)? {
            return Err(StewardError::ValidationError(format!(
                "Domain {} cannot be its own ancestor",
                id
            )));
        }
    }

    conn.execute(
        "UPDATE data_domains
         SET name = ?1, description = ?2, parent_id = ?3, owners = ?4, tags = ?5, updated_at = ?6
         WHERE id = ?7",
        rusqlite::params![
            req.name,
            req.description,
            req.parent_id,
            encode_list(&req.owners)?,
            encode_list(&req.tags)?,
            Utc::now(),
            id,
        ],
    )
    .map_err(|e| conflict_on_unique(e, format!("Domain '{}' already exists", req.name)))?;

    get_domain(conn, id)?.ok_or_else(|| StewardError::NotFound(format!("Domain {}", id)))
}

/// Delete a leaf domain. Domains with children are refused.
pub fn delete_domain(conn: &Connection, id: &str) -> Result<()> {
    let children: i64 = conn.query_row(
        "SELECT COUNT(*) FROM data_domains WHERE parent_id = ?1",
        [id],
        |row| row.get(0),
    )?;
    if children > 0 {
        return Err(StewardError::ConflictError(format!(
            "Domain {} has {} child domain(s)",
            id, children
        )));
    }

    let rows = conn.execute("DELETE FROM data_domains WHERE id = ?1", [id])?;
    if rows == 0 {
        return Err(StewardError::NotFound(format!("Domain {}", id)));
    }
    Ok(())
}

fn search_item(domain: &DataDomain) -> SearchIndexItem {
    SearchIndexItem {
        id: domain.id.clone(),
        item_type: "data-domain".to_string(),
        title: domain.name.clone(),
        description: domain.description.clone().unwrap_or_default(),
        link: format!("/data-domains/{}", domain.id),
        tags: domain.tags.clone(),
        feature_id: features::DATA_DOMAINS.to_string(),
    }
}

// =============================================================================
// Manager
// =============================================================================

pub struct DomainManager {
    db_path: String,
    change_log: Arc<dyn ChangeLog>,
}

impl DomainManager {
    pub fn new(db_path: impl Into<String>, change_log: Arc<dyn ChangeLog>) -> Self {
        Self {
            db_path: db_path.into(),
            change_log,
        }
    }

    pub async fn create(&self, req: DataDomainRequest, user: &UserContext) -> Result<DataDomain> {
        let username = user.username.clone();
        let domain =
            with_connection(&self.db_path, move |conn| create_domain(conn, &req, &username))
                .await?;

        self.change_log.record(
            ChangeLogEntry::new(EntityType::DataDomain, &domain.id, "create", &user.username)
                .with_details(serde_json::json!({ "name": domain.name })),
        );
        info!(domain = %domain.name, "Created data domain");
        Ok(domain)
    }

    pub async fn get(&self, id: &str) -> Result<Option<DataDomain>> {
        let id = id.to_string();
        with_connection(&self.db_path, move |conn| get_domain(conn, &id)).await
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<DataDomain>> {
        let name = name.to_string();
        with_connection(&self.db_path, move |conn| get_domain_by_name(conn, &name)).await
    }

    pub async fn list(&self) -> Result<Vec<DataDomain>> {
        with_connection(&self.db_path, list_domains).await
    }

    pub async fn list_children(&self, parent_id: &str) -> Result<Vec<DataDomain>> {
        let parent_id = parent_id.to_string();
        with_connection(&self.db_path, move |conn| list_children(conn, &parent_id)).await
    }

    pub async fn update(
        &self,
        id: &str,
        req: DataDomainRequest,
        user: &UserContext,
    ) -> Result<DataDomain> {
        let id_owned = id.to_string();
        let domain =
            with_connection(&self.db_path, move |conn| update_domain(conn, &id_owned, &req))
                .await?;

        self.change_log.record(ChangeLogEntry::new(
            EntityType::DataDomain,
            id,
            "update",
            &user.username,
        ));
        Ok(domain)
    }

    pub async fn delete(&self, id: &str, user: &UserContext) -> Result<()> {
        let id_owned = id.to_string();
        with_connection(&self.db_path, move |conn| delete_domain(conn, &id_owned)).await?;

        self.change_log.record(ChangeLogEntry::new(
            EntityType::DataDomain,
            id,
            "delete",
            &user.username,
        ));
        info!(domain_id = %id, "Deleted data domain");
        Ok(())
    }
}

impl Searchable for DomainManager {
    fn source_name(&self) -> &'static str {
        "data-domains"
    }

    fn search_index_items(&self, conn: &Connection) -> Result<Vec<SearchIndexItem>> {
        Ok(list_domains(conn)?.iter().map(search_item).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_log::MemoryChangeLog;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        steward_core::init_store(&conn, true).unwrap();
        conn
    }

    fn req(name: &str, parent: Option<&str>) -> DataDomainRequest {
        DataDomainRequest {
            name: name.to_string(),
            parent_id: parent.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_and_lookup() {
        let conn = test_conn();
        let mut r = req("Finance", None);
        r.owners = vec!["alice".into()];
        r.tags = vec!["core".into()];
        let finance = create_domain(&conn, &r, "alice").unwrap();

        let by_name = get_domain_by_name(&conn, "Finance").unwrap().unwrap();
        assert_eq!(by_name.id, finance.id);
        assert_eq!(by_name.owners, vec!["alice"]);
        assert_eq!(by_name.tags, vec!["core"]);

        assert!(matches!(
            create_domain(&conn, &r, "bob"),
            Err(StewardError::ConflictError(_))
        ));
    }

    #[test]
    fn test_parent_must_exist() {
        let conn = test_conn();
        assert!(matches!(
            create_domain(&conn, &req("Orphan", Some("missing")), "alice"),
            Err(StewardError::ValidationError(_))
        ));
    }

    #[test]
    fn test_children_and_delete_rules() {
        let conn = test_conn();
        let root = create_domain(&conn, &req("Sales", None), "alice").unwrap();
        let emea = create_domain(&conn, &req("Sales EMEA", Some(&root.id)), "alice").unwrap();
        create_domain(&conn, &req("Sales APAC", Some(&root.id)), "alice").unwrap();

        let children: Vec<String> = list_children(&conn, &root.id)
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(children, vec!["Sales APAC", "Sales EMEA"]);

        assert!(matches!(
            delete_domain(&conn, &root.id),
            Err(StewardError::ConflictError(_))
        ));
        delete_domain(&conn, &emea.id).unwrap();
        assert!(matches!(
            delete_domain(&conn, &emea.id),
            Err(StewardError::NotFound(_))
        ));
    }

    #[test]
    fn test_update_rejects_cycles() {
        let conn = test_conn();
        let a = create_domain(&conn, &req("A", None), "alice").unwrap();
        let b = create_domain(&conn, &req("B", Some(&a.id)), "alice").unwrap();
        let c = create_domain(&conn, &req("C", Some(&b.id)), "alice").unwrap();

        // Self-parent
        assert!(matches!(
            update_domain(&conn, &a.id, &req("A", Some(&a.id))),
            Err(StewardError::ValidationError(_))
        ));
        // Descendant as parent
        assert!(matches!(
            update_domain(&conn, &a.id, &req("A", Some(&c.id))),
            Err(StewardError::ValidationError(_))
        ));

        // Moving a leaf under the root is fine
        let moved = update_domain(&conn, &c.id, &req("C", Some(&a.id))).unwrap();
        assert_eq!(moved.parent_id.as_deref(), Some(a.id.as_str()));
    }

    #[test]
    fn test_validation_collects_errors() {
        let errors = validate_domain(&DataDomainRequest {
            name: " bad".into(),
            tags: vec!["no spaces".into()],
            owners: vec!["".into()],
            ..Default::default()
        });
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["name", "tags", "owners"]);
    }

    #[tokio::test]
    async fn test_manager_records_changes_and_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("domains.db").to_string_lossy().to_string();
        {
            let conn = steward_core::open_connection(&db_path).unwrap();
            steward_core::init_store(&conn, true).unwrap();
        }
        let log = Arc::new(MemoryChangeLog::new());
        let manager = DomainManager::new(db_path.clone(), log.clone());
        let user = UserContext::new("alice", ["data-stewards"]);

        let mut r = req("Marketing", None);
        r.description = Some("Campaign data".into());
        let domain = manager.create(r.clone(), &user).await.unwrap();
        r.tags = vec!["growth".into()];
        manager.update(&domain.id, r, &user).await.unwrap();

        let conn = steward_core::open_connection(&db_path).unwrap();
        let items = manager.search_index_items(&conn).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].link, format!("/data-domains/{}", domain.id));
        assert_eq!(items[0].tags, vec!["growth"]);

        manager.delete(&domain.id, &user).await.unwrap();
        assert_eq!(log.actions_for(&domain.id), vec!["create", "update", "delete"]);
        assert!(manager.get(&domain.id).await.unwrap().is_none());
    }
}
