//! Data Contracts
//!
//! Versioned schema agreements between data producers and consumers.
//!
//! # Lifecycle
//!
//! ```text
//! draft ──► proposed ──► active ──► deprecated ──► retired
//!   ▲          │
//!   └──────────┘
//! ```
//!
//! `(name, version)` is unique. [`new_version`] clones an existing contract
//! into a fresh draft that points back at its parent.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use steward_core::validation::{self, FieldError};
use steward_core::{
    conflict_on_unique, decode_list, encode_list, features, EntityType, Result, StewardError,
};
use tracing::{info, warn};

use crate::authorization::UserContext;
use crate::change_log::{ChangeLog, ChangeLogEntry};
use crate::data_products::list_products_by_contract;
use crate::domains::get_domain;
use crate::search::{SearchIndexItem, Searchable};
use crate::{new_id, with_connection, with_transaction};

pub const MAX_VERSION_LEN: usize = 64;

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContractStatus {
    #[default]
    Draft,
    Proposed,
    Active,
    Deprecated,
    Retired,
}

impl ContractStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractStatus::Draft => "draft",
            ContractStatus::Proposed => "proposed",
            ContractStatus::Active => "active",
            ContractStatus::Deprecated => "deprecated",
            ContractStatus::Retired => "retired",
        }
    }

    pub fn can_transition_to(&self, next: ContractStatus) -> bool {
        use ContractStatus::*;
        matches!(
            (self, next),
            (Draft, Proposed)
                | (Proposed, Draft)
                | (Proposed, Active)
                | (Active, Deprecated)
                | (Deprecated, Retired)
        )
    }
}

impl fmt::Display for ContractStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContractStatus {
    type Err = StewardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "draft" => Ok(ContractStatus::Draft),
            "proposed" => Ok(ContractStatus::Proposed),
            "active" => Ok(ContractStatus::Active),
            "deprecated" => Ok(ContractStatus::Deprecated),
            "retired" => Ok(ContractStatus::Retired),
            other => Err(StewardError::ValidationError(format!(
                "Unknown contract status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaProperty {
    pub name: String,
    pub logical_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaObject {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub properties: Vec<SchemaProperty>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataContract {
    pub id: String,
    pub name: String,
    pub version: String,
    pub status: ContractStatus,
    pub owner: String,
    pub domain_id: Option<String>,
    pub description: Option<String>,
    pub schema: Vec<SchemaObject>,
    pub tags: Vec<String>,
    pub parent_contract_id: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataContractRequest {
    pub name: String,
    pub version: String,
    /// Defaults to the creating user
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub domain_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub schema: Vec<SchemaObject>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ContractFilter {
    pub domain_id: Option<String>,
    pub status: Option<ContractStatus>,
}

// =============================================================================
// Input Validation
// =============================================================================

/// Canonical logical type for `raw`, accepting common aliases.
pub fn normalize_logical_type(raw: &str) -> Option<&'static str> {
    match raw.trim().to_lowercase().as_str() {
        "string" | "text" | "varchar" => Some("string"),
        "integer" | "int" | "bigint" | "long" => Some("integer"),
        "number" | "double" | "float" | "decimal" => Some("number"),
        "boolean" | "bool" => Some("boolean"),
        "date" => Some("date"),
        "timestamp" | "datetime" => Some("timestamp"),
        "object" => Some("object"),
        "array" => Some("array"),
        _ => None,
    }
}

/// Validate a contract before creation/update
///
/// Returns a list of validation errors (empty if valid).
pub fn validate_contract(req: &DataContractRequest) -> Vec<FieldError> {
    let mut errors = Vec::new();

    if let Err(e) = validation::validate_name(&req.name, "Contract name") {
        errors.push(FieldError::new("name", e.to_string()));
    }

    let version = req.version.trim();
    if version.is_empty() {
        errors.push(FieldError::new("version", "Version cannot be empty"));
    } else if version.len() > MAX_VERSION_LEN {
        errors.push(FieldError::new(
            "version",
            format!("Version cannot exceed {} characters", MAX_VERSION_LEN),
        ));
    }

    if let Err(e) = validation::validate_tags(&req.tags) {
        errors.push(FieldError::new("tags", e.to_string()));
    }

    let mut object_names = HashSet::new();
    for (i, object) in req.schema.iter().enumerate() {
        if object.name.trim().is_empty() {
            errors.push(FieldError::new(
                format!("schema[{}].name", i),
                "Schema object name cannot be empty",
            ));
        } else if !object_names.insert(object.name.as_str()) {
            errors.push(FieldError::new(
                format!("schema[{}].name", i),
                format!("Duplicate schema object '{}'", object.name),
            ));
        }

        let mut property_names = HashSet::new();
        for (j, property) in object.properties.iter().enumerate() {
            let path = format!("schema[{}].properties[{}]", i, j);
            if property.name.trim().is_empty() {
                errors.push(FieldError::new(
                    format!("{}.name", path),
                    "Property name cannot be empty",
                ));
            } else if !property_names.insert(property.name.as_str()) {
                errors.push(FieldError::new(
                    format!("{}.name", path),
                    format!("Duplicate property '{}'", property.name),
                ));
            }
            if normalize_logical_type(&property.logical_type).is_none() {
                errors.push(FieldError::new(
                    format!("{}.logical_type", path),
                    format!("Unknown logical type '{}'", property.logical_type),
                ));
            }
        }
    }

    errors
}

/// Schema with every logical type rewritten to its canonical form.
fn canonical_schema(schema: &[SchemaObject]) -> Vec<SchemaObject> {
    schema
        .iter()
        .map(|object| SchemaObject {
            properties: object
                .properties
                .iter()
                .map(|p| SchemaProperty {
                    logical_type: normalize_logical_type(&p.logical_type)
                        .map(String::from)
                        .unwrap_or_else(|| p.logical_type.clone()),
                    ..p.clone()
                })
                .collect(),
            ..object.clone()
        })
        .collect()
}

fn require_domain(conn: &Connection, domain_id: Option<&str>) -> Result<()> {
    if let Some(domain_id) = domain_id {
        if get_domain(conn, domain_id)?.is_none() {
            return Err(StewardError::ValidationError(format!(
                "Domain {} does not exist",
                domain_id
            )));
        }
    }
    Ok(())
}

// =============================================================================
// Database Operations
// =============================================================================

const CONTRACT_COLUMNS: &str = "id, name, version, status, owner, domain_id, description, schema_objects, tags, parent_contract_id, created_by, created_at, updated_at";

fn contract_from_row(row: &Row<'_>) -> rusqlite::Result<DataContract> {
    let status: String = row.get(3)?;
    let status = status.parse().unwrap_or_else(|_| {
        warn!(status = %status, "Unknown contract status in store, reading as draft");
        ContractStatus::Draft
    });

    Ok(DataContract {
        id: row.get(0)?,
        name: row.get(1)?,
        version: row.get(2)?,
        status,
        owner: row.get(4)?,
        domain_id: row.get(5)?,
        description: row.get(6)?,
        schema: decode_list(row.get(7)?),
        tags: decode_list(row.get(8)?),
        parent_contract_id: row.get(9)?,
        created_by: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn insert_contract(conn: &Connection, contract: &DataContract) -> Result<()> {
    conn.execute(
        "INSERT INTO data_contracts (id, name, version, status, owner, domain_id, description, schema_objects, tags, parent_contract_id, created_by, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        rusqlite::params![
            contract.id,
            contract.name,
            contract.version,
            contract.status.as_str(),
            contract.owner,
            contract.domain_id,
            contract.description,
            encode_list(&contract.schema)?,
            encode_list(&contract.tags)?,
            contract.parent_contract_id,
            contract.created_by,
            contract.created_at,
            contract.updated_at,
        ],
    )
    .map_err(|e| {
        conflict_on_unique(
            e,
            format!(
                "Contract '{}' version {} already exists",
                contract.name, contract.version
            ),
        )
    })?;
    Ok(())
}

pub fn create_contract(
    conn: &Connection,
    req: &DataContractRequest,
    created_by: &str,
) -> Result<DataContract> {
    validation::into_result(validate_contract(req))?;
    require_domain(conn, req.domain_id.as_deref())?;

    let now = Utc::now();
    let contract = DataContract {
        id: new_id(),
        name: req.name.clone(),
        version: req.version.trim().to_string(),
        status: ContractStatus::Draft,
        owner: req.owner.clone().unwrap_or_else(|| created_by.to_string()),
        domain_id: req.domain_id.clone(),
        description: req.description.clone(),
        schema: canonical_schema(&req.schema),
        tags: req.tags.clone(),
        parent_contract_id: None,
        created_by: created_by.to_string(),
        created_at: now,
        updated_at: now,
    };
    insert_contract(conn, &contract)?;
    Ok(contract)
}

pub fn get_contract(conn: &Connection, id: &str) -> Result<Option<DataContract>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM data_contracts WHERE id = ?1", CONTRACT_COLUMNS),
            [id],
            contract_from_row,
        )
        .optional()?)
}

fn require_contract(conn: &Connection, id: &str) -> Result<DataContract> {
    get_contract(conn, id)?.ok_or_else(|| StewardError::NotFound(format!("Contract {}", id)))
}

pub fn list_contracts(conn: &Connection, filter: &ContractFilter) -> Result<Vec<DataContract>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM data_contracts
         WHERE (?1 IS NULL OR domain_id = ?1) AND (?2 IS NULL OR status = ?2)
         ORDER BY name, version",
        CONTRACT_COLUMNS
    ))?;
    let contracts = stmt
        .query_map(
            rusqlite::params![filter.domain_id, filter.status.map(|s| s.as_str())],
            contract_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(contracts)
}

/// Replace the editable fields. Status is changed only through [`set_contract_status`].
pub fn update_contract(
    conn: &Connection,
    id: &str,
    req: &DataContractRequest,
) -> Result<DataContract> {
    validation::into_result(validate_contract(req))?;
    let existing = require_contract(conn, id)?;
    require_domain(conn, req.domain_id.as_deref())?;

    conn.execute(
        "UPDATE data_contracts
         SET name = ?1, version = ?2, owner = ?3, domain_id = ?4, description = ?5,
             schema_objects = ?6, tags = ?7, updated_at = ?8
         WHERE id = ?9",
        rusqlite::params![
            req.name,
            req.version.trim(),
            req.owner.clone().unwrap_or(existing.owner),
            req.domain_id,
            req.description,
            encode_list(&canonical_schema(&req.schema))?,
            encode_list(&req.tags)?,
            Utc::now(),
            id,
        ],
    )
    .map_err(|e| {
        conflict_on_unique(
            e,
            format!("Contract '{}' version {} already exists", req.name, req.version),
        )
    })?;

    require_contract(conn, id)
}

/// Delete a contract. Refused while a data product output port references it.
pub fn delete_contract(conn: &Connection, id: &str) -> Result<()> {
    require_contract(conn, id)?;

    let referencing = list_products_by_contract(conn, id)?;
    if !referencing.is_empty() {
        let names: Vec<String> = referencing.into_iter().map(|p| p.name).collect();
        return Err(StewardError::ConflictError(format!(
            "Contract {} is referenced by data product(s): {}",
            id,
            names.join(", ")
        )));
    }

    conn.execute("DELETE FROM data_contracts WHERE id = ?1", [id])?;
    Ok(())
}

pub fn set_contract_status(
    conn: &Connection,
    id: &str,
    status: ContractStatus,
) -> Result<DataContract> {
    let contract = require_contract(conn, id)?;
    if !contract.status.can_transition_to(status) {
        return Err(StewardError::ValidationError(format!(
            "Invalid contract status transition {} -> {}",
            contract.status, status
        )));
    }

    conn.execute(
        "UPDATE data_contracts SET status = ?1, updated_at = ?2 WHERE id = ?3",
        rusqlite::params![status.as_str(), Utc::now(), id],
    )?;
    require_contract(conn, id)
}

/// Clone a contract into a new draft `version` linked to its parent.
pub fn new_version(
    conn: &Connection,
    id: &str,
    version: &str,
    created_by: &str,
) -> Result<DataContract> {
    let parent = require_contract(conn, id)?;
    let version = version.trim();

    if version.is_empty() || version.len() > MAX_VERSION_LEN {
        return Err(StewardError::ValidationError(format!(
            "Version must be 1-{} characters",
            MAX_VERSION_LEN
        )));
    }
    if version == parent.version {
        return Err(StewardError::ValidationError(format!(
            "New version must differ from {}",
            parent.version
        )));
    }

    let now = Utc::now();
    let contract = DataContract {
        id: new_id(),
        version: version.to_string(),
        status: ContractStatus::Draft,
        parent_contract_id: Some(parent.id.clone()),
        created_by: created_by.to_string(),
        created_at: now,
        updated_at: now,
        ..parent
    };
    insert_contract(conn, &contract)?;
    Ok(contract)
}

fn search_item(contract: &DataContract) -> SearchIndexItem {
    let mut tags = contract.tags.clone();
    tags.push(contract.status.as_str().to_string());
    SearchIndexItem {
        id: contract.id.clone(),
        item_type: "data-contract".to_string(),
        title: contract.name.clone(),
        description: contract.description.clone().unwrap_or_default(),
        link: format!("/data-contracts/{}", contract.id),
        tags,
        feature_id: features::DATA_CONTRACTS.to_string(),
    }
}

// =============================================================================
// Manager
// =============================================================================

pub struct ContractManager {
    db_path: String,
    change_log: Arc<dyn ChangeLog>,
}

impl ContractManager {
    pub fn new(db_path: impl Into<String>, change_log: Arc<dyn ChangeLog>) -> Self {
        Self {
            db_path: db_path.into(),
            change_log,
        }
    }

    fn record(&self, entry: ChangeLogEntry) {
        self.change_log.record(entry);
    }

    pub async fn create(
        &self,
        req: DataContractRequest,
        user: &UserContext,
    ) -> Result<DataContract> {
        let username = user.username.clone();
        let contract =
            with_connection(&self.db_path, move |conn| create_contract(conn, &req, &username))
                .await?;

        self.record(
            ChangeLogEntry::new(EntityType::DataContract, &contract.id, "create", &user.username)
                .with_details(serde_json::json!({
                    "name": contract.name,
                    "version": contract.version,
                })),
        );
        info!(contract = %contract.name, version = %contract.version, "Created data contract");
        Ok(contract)
    }

    pub async fn get(&self, id: &str) -> Result<Option<DataContract>> {
        let id = id.to_string();
        with_connection(&self.db_path, move |conn| get_contract(conn, &id)).await
    }

    pub async fn list(&self, filter: ContractFilter) -> Result<Vec<DataContract>> {
        with_connection(&self.db_path, move |conn| list_contracts(conn, &filter)).await
    }

    pub async fn update(
        &self,
        id: &str,
        req: DataContractRequest,
        user: &UserContext,
    ) -> Result<DataContract> {
        let id_owned = id.to_string();
        let contract =
            with_connection(&self.db_path, move |conn| update_contract(conn, &id_owned, &req))
                .await?;
        self.record(ChangeLogEntry::new(
            EntityType::DataContract,
            id,
            "update",
            &user.username,
        ));
        Ok(contract)
    }

    pub async fn delete(&self, id: &str, user: &UserContext) -> Result<()> {
        let id_owned = id.to_string();
        with_transaction(&self.db_path, move |conn| delete_contract(conn, &id_owned)).await?;
        self.record(ChangeLogEntry::new(
            EntityType::DataContract,
            id,
            "delete",
            &user.username,
        ));
        info!(contract_id = %id, "Deleted data contract");
        Ok(())
    }

    pub async fn set_status(
        &self,
        id: &str,
        status: ContractStatus,
        user: &UserContext,
    ) -> Result<DataContract> {
        let id_owned = id.to_string();
        let contract = with_connection(&self.db_path, move |conn| {
            set_contract_status(conn, &id_owned, status)
        })
        .await?;
        self.record(ChangeLogEntry::new(
            EntityType::DataContract,
            id,
            format!("status.{}", status),
            &user.username,
        ));
        info!(contract = %contract.name, status = %status, "Contract status changed");
        Ok(contract)
    }

    pub async fn new_version(
        &self,
        id: &str,
        version: &str,
        user: &UserContext,
    ) -> Result<DataContract> {
        let (id_owned, version_owned, username) =
            (id.to_string(), version.to_string(), user.username.clone());
        let contract = with_connection(&self.db_path, move |conn| {
            new_version(conn, &id_owned, &version_owned, &username)
        })
        .await?;

        self.record(
            ChangeLogEntry::new(EntityType::DataContract, &contract.id, "create", &user.username)
                .with_details(serde_json::json!({ "parent_contract_id": id })),
        );
        info!(contract = %contract.name, version = %contract.version, "Created contract version");
        Ok(contract)
    }
}

impl Searchable for ContractManager {
    fn source_name(&self) -> &'static str {
        "data-contracts"
    }

    fn search_index_items(&self, conn: &Connection) -> Result<Vec<SearchIndexItem>> {
        Ok(list_contracts(conn, &ContractFilter::default())?
            .iter()
            .map(search_item)
            .collect())
    }
}
