//! Semantic Links
//!
//! Links from governed entities to ontology concepts identified by IRI, plus
//! an in-memory [`Ontology`] of known concepts. Links may point at IRIs the
//! registry does not know (external ontologies).

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rusqlite::{Connection, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use steward_core::{conflict_on_unique, features, validation, EntityType, Result, StewardError};
use tracing::{debug, info};

use crate::authorization::UserContext;
use crate::change_log::{ChangeLog, ChangeLogEntry};
use crate::search::{SearchIndexItem, Searchable};
use crate::{new_id, with_connection};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySemanticLink {
    pub id: String,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub iri: String,
    pub label: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Database Operations
// =============================================================================

const LINK_COLUMNS: &str = "id, entity_id, entity_type, iri, label, created_by, created_at";

fn link_from_row(row: &Row<'_>) -> rusqlite::Result<EntitySemanticLink> {
    let entity_type: String = row.get(2)?;
    Ok(EntitySemanticLink {
        id: row.get(0)?,
        entity_id: row.get(1)?,
        entity_type: entity_type.parse().map_err(|e: StewardError| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?,
        iri: row.get(3)?,
        label: row.get(4)?,
        created_by: row.get(5)?,
        created_at: row.get(6)?,
    })
}

pub fn add_link(
    conn: &Connection,
    entity_type: EntityType,
    entity_id: &str,
    iri: &str,
    label: Option<&str>,
    created_by: &str,
) -> Result<EntitySemanticLink> {
    validation::validate_iri(iri)?;
    if entity_id.trim().is_empty() {
        return Err(StewardError::ValidationError(
            "Entity id cannot be empty".to_string(),
        ));
    }

    let link = EntitySemanticLink {
        id: new_id(),
        entity_id: entity_id.to_string(),
        entity_type,
        iri: iri.to_string(),
        label: label.map(String::from),
        created_by: created_by.to_string(),
        created_at: Utc::now(),
    };

    conn.execute(
        "INSERT INTO semantic_links (id, entity_id, entity_type, iri, label, created_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            link.id,
            link.entity_id,
            link.entity_type.as_str(),
            link.iri,
            link.label,
            link.created_by,
            link.created_at,
        ],
    )
    .map_err(|e| {
        conflict_on_unique(
            e,
            format!("{} {} is already linked to {}", entity_type, entity_id, iri),
        )
    })?;

    Ok(link)
}

pub fn list_links_for_entity(
    conn: &Connection,
    entity_type: EntityType,
    entity_id: &str,
) -> Result<Vec<EntitySemanticLink>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM semantic_links WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY created_at, rowid",
        LINK_COLUMNS
    ))?;
    let links = stmt
        .query_map([entity_type.as_str(), entity_id], link_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(links)
}

pub fn list_links_for_iri(conn: &Connection, iri: &str) -> Result<Vec<EntitySemanticLink>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM semantic_links WHERE iri = ?1 ORDER BY created_at, rowid",
        LINK_COLUMNS
    ))?;
    let links = stmt
        .query_map([iri], link_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(links)
}

/// Remove a link. Returns the removed link.
pub fn remove_link(conn: &Connection, id: &str) -> Result<EntitySemanticLink> {
    let link = conn
        .query_row(
            &format!("SELECT {} FROM semantic_links WHERE id = ?1", LINK_COLUMNS),
            [id],
            link_from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                StewardError::NotFound(format!("Semantic link {}", id))
            }
            other => StewardError::Sqlite(other),
        })?;

    conn.execute("DELETE FROM semantic_links WHERE id = ?1", [id])?;
    Ok(link)
}

// =============================================================================
// Ontology
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OntologyConcept {
    pub iri: String,
    pub label: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parent_iris: Vec<String>,
}

/// In-memory registry of known concepts, keyed by IRI.
#[derive(Debug, Default)]
pub struct Ontology {
    concepts: RwLock<BTreeMap<String, OntologyConcept>>,
}

impl Ontology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a concept.
    pub fn insert(&self, concept: OntologyConcept) -> Result<()> {
        validation::validate_iri(&concept.iri)?;
        for parent in &concept.parent_iris {
            validation::validate_iri(parent)?;
        }
        if concept.label.trim().is_empty() {
            return Err(StewardError::ValidationError(format!(
                "Concept {} needs a label",
                concept.iri
            )));
        }
        self.concepts.write().insert(concept.iri.clone(), concept);
        Ok(())
    }

    pub fn get(&self, iri: &str) -> Option<OntologyConcept> {
        self.concepts.read().get(iri).cloned()
    }

    pub fn len(&self) -> usize {
        self.concepts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.concepts.read().is_empty()
    }

    /// Direct children of `iri`.
    pub fn children(&self, iri: &str) -> Vec<OntologyConcept> {
        self.concepts
            .read()
            .values()
            .filter(|c| c.parent_iris.iter().any(|p| p == iri))
            .cloned()
            .collect()
    }

    /// Concepts whose label (case-insensitive) or IRI starts with `prefix`.
    pub fn search_concepts(&self, prefix: &str) -> Vec<OntologyConcept> {
        let prefix = prefix.trim().to_lowercase();
        if prefix.is_empty() {
            return Vec::new();
        }
        let mut matches: Vec<OntologyConcept> = self
            .concepts
            .read()
            .values()
            .filter(|c| {
                c.label.to_lowercase().starts_with(&prefix)
                    || c.iri.to_lowercase().starts_with(&prefix)
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.label.cmp(&b.label));
        matches
    }
}

impl Searchable for Ontology {
    fn source_name(&self) -> &'static str {
        "ontology"
    }

    fn search_index_items(&self, _conn: &Connection) -> Result<Vec<SearchIndexItem>> {
        Ok(self
            .concepts
            .read()
            .values()
            .map(|c| SearchIndexItem {
                id: c.iri.clone(),
                item_type: "ontology-concept".to_string(),
                title: c.label.clone(),
                description: c.description.clone().unwrap_or_default(),
                link: format!("/semantic-models/concepts?iri={}", c.iri),
                tags: Vec::new(),
                feature_id: features::SEMANTIC_MODELS.to_string(),
            })
            .collect())
    }
}

// =============================================================================
// Manager
// =============================================================================

pub struct SemanticLinksManager {
    db_path: String,
    ontology: Arc<Ontology>,
    change_log: Arc<dyn ChangeLog>,
}

impl SemanticLinksManager {
    pub fn new(
        db_path: impl Into<String>,
        ontology: Arc<Ontology>,
        change_log: Arc<dyn ChangeLog>,
    ) -> Self {
        Self {
            db_path: db_path.into(),
            ontology,
            change_log,
        }
    }

    pub fn ontology(&self) -> &Arc<Ontology> {
        &self.ontology
    }

    /// Link an entity to a concept. A missing label is filled from the ontology.
    pub async fn add(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        iri: &str,
        label: Option<&str>,
        user: &UserContext,
    ) -> Result<EntitySemanticLink> {
        let label = label
            .map(String::from)
            .or_else(|| self.ontology.get(iri).map(|c| c.label));
        if self.ontology.get(iri).is_none() {
            debug!(iri, "Linking to IRI outside the local ontology");
        }

        let (entity_id_owned, iri_owned, username) =
            (entity_id.to_string(), iri.to_string(), user.username.clone());
        let link = with_connection(&self.db_path, move |conn| {
            add_link(
                conn,
                entity_type,
                &entity_id_owned,
                &iri_owned,
                label.as_deref(),
                &username,
            )
        })
        .await?;

        self.change_log.record(
            ChangeLogEntry::new(entity_type, entity_id, "semantic_link.add", &user.username)
                .with_details(serde_json::json!({ "iri": iri, "link_id": link.id })),
        );
        info!(%entity_type, entity_id, iri, "Added semantic link");
        Ok(link)
    }

    pub async fn list_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<EntitySemanticLink>> {
        let entity_id = entity_id.to_string();
        with_connection(&self.db_path, move |conn| {
            list_links_for_entity(conn, entity_type, &entity_id)
        })
        .await
    }

    pub async fn list_for_iri(&self, iri: &str) -> Result<Vec<EntitySemanticLink>> {
        let iri = iri.to_string();
        with_connection(&self.db_path, move |conn| list_links_for_iri(conn, &iri)).await
    }

    pub async fn remove(&self, id: &str, user: &UserContext) -> Result<()> {
        let id_owned = id.to_string();
        let link = with_connection(&self.db_path, move |conn| remove_link(conn, &id_owned)).await?;

        self.change_log.record(
            ChangeLogEntry::new(
                link.entity_type,
                &link.entity_id,
                "semantic_link.remove",
                &user.username,
            )
            .with_details(serde_json::json!({ "iri": link.iri, "link_id": id })),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_log::MemoryChangeLog;

    const CUSTOMER: &str = "https://ontology.example.com/Customer";
    const PARTY: &str = "https://ontology.example.com/Party";

    fn concept(iri: &str, label: &str, parents: &[&str]) -> OntologyConcept {
        OntologyConcept {
            iri: iri.to_string(),
            label: label.to_string(),
            description: None,
            parent_iris: parents.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        steward_core::init_store(&conn, true).unwrap();
        conn
    }

    #[test]
    fn test_add_and_query_links() {
        let conn = test_conn();
        add_link(&conn, EntityType::DataProduct, "p1", CUSTOMER, Some("Customer"), "alice").unwrap();
        add_link(&conn, EntityType::DataContract, "c1", CUSTOMER, None, "alice").unwrap();
        add_link(&conn, EntityType::DataProduct, "p1", PARTY, None, "alice").unwrap();

        assert_eq!(
            list_links_for_entity(&conn, EntityType::DataProduct, "p1").unwrap().len(),
            2
        );
        let for_iri = list_links_for_iri(&conn, CUSTOMER).unwrap();
        assert_eq!(for_iri.len(), 2);
        assert_eq!(for_iri[1].entity_type, EntityType::DataContract);
    }

    #[test]
    fn test_duplicate_link_conflicts() {
        let conn = test_conn();
        add_link(&conn, EntityType::Project, "x", CUSTOMER, None, "alice").unwrap();
        assert!(matches!(
            add_link(&conn, EntityType::Project, "x", CUSTOMER, None, "bob"),
            Err(StewardError::ConflictError(_))
        ));
    }

    #[test]
    fn test_invalid_iri_rejected() {
        let conn = test_conn();
        assert!(matches!(
            add_link(&conn, EntityType::Project, "x", "not an iri", None, "alice"),
            Err(StewardError::ValidationError(_))
        ));
    }

    #[test]
    fn test_remove_missing_is_not_found() {
        let conn = test_conn();
        let link = add_link(&conn, EntityType::Project, "x", PARTY, None, "alice").unwrap();
        assert_eq!(remove_link(&conn, &link.id).unwrap().iri, PARTY);
        assert!(matches!(
            remove_link(&conn, &link.id),
            Err(StewardError::NotFound(_))
        ));
    }

    #[test]
    fn test_ontology_registry() {
        let ontology = Ontology::new();
        ontology.insert(concept(PARTY, "Party", &[])).unwrap();
        ontology.insert(concept(CUSTOMER, "Customer", &[PARTY])).unwrap();
        ontology
            .insert(concept("https://ontology.example.com/Supplier", "Supplier", &[PARTY]))
            .unwrap();

        assert!(ontology.insert(concept("bad iri", "Bad", &[])).is_err());
        assert_eq!(ontology.len(), 3);

        let children: Vec<String> = ontology.children(PARTY).into_iter().map(|c| c.label).collect();
        assert_eq!(children, vec!["Customer", "Supplier"]);

        let found = ontology.search_concepts("cust");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].iri, CUSTOMER);
        assert!(ontology.search_concepts("  ").is_empty());

        let conn = test_conn();
        let items = ontology.search_index_items(&conn).unwrap();
        assert!(items
            .iter()
            .all(|i| i.feature_id == features::SEMANTIC_MODELS && i.item_type == "ontology-concept"));
    }

    #[tokio::test]
    async fn test_manager_fills_label_from_ontology() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("links.db").to_string_lossy().to_string();
        {
            let conn = steward_core::open_connection(&db_path).unwrap();
            steward_core::init_store(&conn, true).unwrap();
        }
        let ontology = Arc::new(Ontology::new());
        ontology.insert(concept(CUSTOMER, "Customer", &[])).unwrap();
        let log = Arc::new(MemoryChangeLog::new());
        let manager = SemanticLinksManager::new(db_path, ontology, log.clone());
        let user = UserContext::new("alice", ["data-stewards"]);

        let link = manager
            .add(EntityType::DataProduct, "p1", CUSTOMER, None, &user)
            .await
            .unwrap();
        assert_eq!(link.label.as_deref(), Some("Customer"));

        let external = manager
            .add(EntityType::DataProduct, "p1", "urn:isbn:0451450523", None, &user)
            .await
            .unwrap();
        assert!(external.label.is_none());

        manager.remove(&link.id, &user).await.unwrap();
        assert_eq!(manager.list_for_entity(EntityType::DataProduct, "p1").await.unwrap().len(), 1);
        assert_eq!(
            log.actions_for("p1"),
            vec!["semantic_link.add", "semantic_link.add", "semantic_link.remove"]
        );
    }
}
