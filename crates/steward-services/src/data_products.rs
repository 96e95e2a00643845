//! Data Products
//!
//! Versioned, owned data products with input and output ports. Output ports
//! may bind a data contract; a bound contract must exist.
//!
//! # Lifecycle
//!
//! ```text
//! draft ◄──► candidate ──► active ◄──► deprecated ──► retired
//! ```

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
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
use crate::contracts::get_contract;
use crate::domains::get_domain;
use crate::projects::get_project;
use crate::search::{SearchIndexItem, Searchable};
use crate::{new_id, with_connection};

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProductType {
    Source,
    #[default]
    SourceAligned,
    Aggregate,
    ConsumerAligned,
    Sink,
}

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::Source => "source",
            ProductType::SourceAligned => "source_aligned",
            ProductType::Aggregate => "aggregate",
            ProductType::ConsumerAligned => "consumer_aligned",
            ProductType::Sink => "sink",
        }
    }
}

impl fmt::Display for ProductType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProductType {
    type Err = StewardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "source" => Ok(ProductType::Source),
            "source_aligned" => Ok(ProductType::SourceAligned),
            "aggregate" => Ok(ProductType::Aggregate),
            "consumer_aligned" => Ok(ProductType::ConsumerAligned),
            "sink" => Ok(ProductType::Sink),
            other => Err(StewardError::ValidationError(format!(
                "Unknown product type '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProductStatus {
    #[default]
    Draft,
    Candidate,
    Active,
    Deprecated,
    Retired,
}

impl ProductStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductStatus::Draft => "draft",
            ProductStatus::Candidate => "candidate",
            ProductStatus::Active => "active",
            ProductStatus::Deprecated => "deprecated",
            ProductStatus::Retired => "retired",
        }
    }

    pub fn can_transition_to(&self, next: ProductStatus) -> bool {
        use ProductStatus::*;
        matches!(
            (self, next),
            (Draft, Candidate)
                | (Candidate, Draft)
                | (Candidate, Active)
                | (Active, Deprecated)
                | (Deprecated, Active)
                | (Deprecated, Retired)
        )
    }
}

impl fmt::Display for ProductStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProductStatus {
    type Err = StewardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "draft" => Ok(ProductStatus::Draft),
            "candidate" => Ok(ProductStatus::Candidate),
            "active" => Ok(ProductStatus::Active),
            "deprecated" => Ok(ProductStatus::Deprecated),
            "retired" => Ok(ProductStatus::Retired),
            other => Err(StewardError::ValidationError(format!(
                "Unknown product status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub contract_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataProduct {
    pub id: String,
    pub name: String,
    pub version: String,
    pub product_type: ProductType,
    pub status: ProductStatus,
    pub owner: String,
    pub domain_id: Option<String>,
    pub project_id: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub input_ports: Vec<Port>,
    pub output_ports: Vec<Port>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataProductRequest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub product_type: ProductType,
    /// Defaults to the creating user
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub domain_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub input_ports: Vec<Port>,
    #[serde(default)]
    pub output_ports: Vec<Port>,
}

#[derive(Debug, Clone, Default)]
pub struct ProductFilter {
    pub domain_id: Option<String>,
    pub status: Option<ProductStatus>,
}

pub fn validate_product(req: &DataProductRequest) -> Vec<FieldError> {
    let mut errors = Vec::new();

    if let Err(e) = validation::validate_name(&req.name, "Product name") {
        errors.push(FieldError::new("name", e.to_string()));
    }
    if req.version.trim().is_empty() {
        errors.push(FieldError::new("version", "Version cannot be empty"));
    }
    if let Err(e) = validation::validate_tags(&req.tags) {
        errors.push(FieldError::new("tags", e.to_string()));
    }

    for (field, ports) in [("input_ports", &req.input_ports), ("output_ports", &req.output_ports)] {
        for (i, port) in ports.iter().enumerate() {
            if port.name.trim().is_empty() {
                errors.push(FieldError::new(
                    format!("{}[{}].name", field, i),
                    "Port name cannot be empty",
                ));
            }
        }
    }

    errors
}

/// Referenced domain, project and output-port contracts must exist.
fn check_references(conn: &Connection, req: &DataProductRequest) -> Result<()> {
    let mut errors = Vec::new();

    if let Some(domain_id) = &req.domain_id {
        if get_domain(conn, domain_id)?.is_none() {
            errors.push(FieldError::new(
                "domain_id",
                format!("Domain {} does not exist", domain_id),
            ));
        }
    }
    if let Some(project_id) = &req.project_id {
        if get_project(conn, project_id)?.is_none() {
            errors.push(FieldError::new(
                "project_id",
                format!("Project {} does not exist", project_id),
            ));
        }
    }
    for (i, port) in req.output_ports.iter().enumerate() {
        if let Some(contract_id) = &port.contract_id {
            if get_contract(conn, contract_id)?.is_none() {
                errors.push(FieldError::new(
                    format!("output_ports[{}].contract_id", i),
                    format!("Contract {} does not exist", contract_id),
                ));
            }
        }
    }

    validation::into_result(errors)
}

// =============================================================================
// Database Operations
// =============================================================================

const PRODUCT_COLUMNS: &str = "id, name, version, product_type, status, owner, domain_id, project_id, description, tags, input_ports, output_ports, created_by, created_at, updated_at";

fn product_from_row(row: &Row<'_>) -> rusqlite::Result<DataProduct> {
    let product_type: String = row.get(3)?;
    let status: String = row.get(4)?;

    Ok(DataProduct {
        id: row.get(0)?,
        name: row.get(1)?,
        version: row.get(2)?,
        product_type: product_type.parse().unwrap_or_else(|_| {
            warn!(product_type = %product_type, "Unknown product type in store");
            ProductType::default()
        }),
        status: status.parse().unwrap_or_else(|_| {
            warn!(status = %status, "Unknown product status in store");
            ProductStatus::default()
        }),
        owner: row.get(5)?,
        domain_id: row.get(6)?,
        project_id: row.get(7)?,
        description: row.get(8)?,
        tags: decode_list(row.get(9)?),
        input_ports: decode_list(row.get(10)?),
        output_ports: decode_list(row.get(11)?),
        created_by: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

pub fn create_product(
    conn: &Connection,
    req: &DataProductRequest,
    created_by: &str,
) -> Result<DataProduct> {
    validation::into_result(validate_product(req))?;
    check_references(conn, req)?;

    let now = Utc::now();
    let product = DataProduct {
        id: new_id(),
        name: req.name.clone(),
        version: req.version.trim().to_string(),
        product_type: req.product_type,
        status: ProductStatus::Draft,
        owner: req.owner.clone().unwrap_or_else(|| created_by.to_string()),
        domain_id: req.domain_id.clone(),
        project_id: req.project_id.clone(),
        description: req.description.clone(),
        tags: req.tags.clone(),
        input_ports: req.input_ports.clone(),
        output_ports: req.output_ports.clone(),
        created_by: created_by.to_string(),
        created_at: now,
        updated_at: now,
    };

    conn.execute(
        "INSERT INTO data_products (id, name, version, product_type, status, owner, domain_id, project_id, description, tags, input_ports, output_ports, created_by, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        rusqlite::params![
            product.id,
            product.name,
            product.version,
            product.product_type.as_str(),
            product.status.as_str(),
            product.owner,
            product.domain_id,
            product.project_id,
            product.description,
            encode_list(&product.tags)?,
            encode_list(&product.input_ports)?,
            encode_list(&product.output_ports)?,
            product.created_by,
            product.created_at,
            product.updated_at,
        ],
    )
    .map_err(|e| {
        conflict_on_unique(
            e,
            format!(
                "Data product '{}' version {} already exists",
                product.name, product.version
            ),
        )
    })?;

    Ok(product)
}

pub fn get_product(conn: &Connection, id: &str) -> Result<Option<DataProduct>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM data_products WHERE id = ?1", PRODUCT_COLUMNS),
            [id],
            product_from_row,
        )
        .optional()?)
}

fn require_product(conn: &Connection, id: &str) -> Result<DataProduct> {
    get_product(conn, id)?.ok_or_else(|| StewardError::NotFound(format!("Data product {}", id)))
}

pub fn list_products(conn: &Connection, filter: &ProductFilter) -> Result<Vec<DataProduct>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM data_products
         WHERE (?1 IS NULL OR domain_id = ?1) AND (?2 IS NULL OR status = ?2)
         ORDER BY name, version",
        PRODUCT_COLUMNS
    ))?;
    let products = stmt
        .query_map(
            rusqlite::params![filter.domain_id, filter.status.map(|s| s.as_str())],
            product_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(products)
}

/// Products with an output port bound to `contract_id`.
pub fn list_products_by_contract(conn: &Connection, contract_id: &str) -> Result<Vec<DataProduct>> {
    Ok(list_products(conn, &ProductFilter::default())?
        .into_iter()
        .filter(|p| {
            p.output_ports
                .iter()
                .any(|port| port.contract_id.as_deref() == Some(contract_id))
        })
        .collect())
}

/// Replace the editable fields. Status is changed only through [`set_product_status`].
pub fn update_product(
    conn: &Connection,
    id: &str,
    req: &DataProductRequest,
) -> Result<DataProduct> {
    validation::into_result(validate_product(req))?;
    let existing = require_product(conn, id)?;
    check_references(conn, req)?;

    conn.execute(
        "UPDATE data_products
         SET name = ?1, version = ?2, product_type = ?3, owner = ?4, domain_id = ?5,
             project_id = ?6, description = ?7, tags = ?8, input_ports = ?9,
             output_ports = ?10, updated_at = ?11
         WHERE id = ?12",
        rusqlite::params![
            req.name,
            req.version.trim(),
            req.product_type.as_str(),
            req.owner.clone().unwrap_or(existing.owner),
            req.domain_id,
            req.project_id,
            req.description,
            encode_list(&req.tags)?,
            encode_list(&req.input_ports)?,
            encode_list(&req.output_ports)?,
            Utc::now(),
            id,
        ],
    )
    .map_err(|e| {
        conflict_on_unique(
            e,
            format!("Data product '{}' version {} already exists", req.name, req.version),
        )
    })?;

    require_product(conn, id)
}

pub fn delete_product(conn: &Connection, id: &str) -> Result<()> {
    let rows = conn.execute("DELETE FROM data_products WHERE id = ?1", [id])?;
    if rows == 0 {
        return Err(StewardError::NotFound(format!("Data product {}", id)));
    }
    Ok(())
}

pub fn set_product_status(
    conn: &Connection,
    id: &str,
    status: ProductStatus,
) -> Result<DataProduct> {
    let product = require_product(conn, id)?;
    if !product.status.can_transition_to(status) {
        return Err(StewardError::ValidationError(format!(
            "Invalid product status transition {} -> {}",
            product.status, status
        )));
    }

    conn.execute(
        "UPDATE data_products SET status = ?1, updated_at = ?2 WHERE id = ?3",
        rusqlite::params![status.as_str(), Utc::now(), id],
    )?;
    require_product(conn, id)
}

fn search_item(product: &DataProduct) -> SearchIndexItem {
    let mut tags = product.tags.clone();
    tags.push(product.status.as_str().to_string());
    SearchIndexItem {
        id: product.id.clone(),
        item_type: "data-product".to_string(),
        title: product.name.clone(),
        description: product.description.clone().unwrap_or_default(),
        link: format!("/data-products/{}", product.id),
        tags,
        feature_id: features::DATA_PRODUCTS.to_string(),
    }
}

// =============================================================================
// Manager
// =============================================================================

pub struct DataProductManager {
    db_path: String,
    change_log: Arc<dyn ChangeLog>,
}

impl DataProductManager {
    pub fn new(db_path: impl Into<String>, change_log: Arc<dyn ChangeLog>) -> Self {
        Self {
            db_path: db_path.into(),
            change_log,
        }
    }

    pub async fn create(&self, req: DataProductRequest, user: &UserContext) -> Result<DataProduct> {
        let username = user.username.clone();
        let product =
            with_connection(&self.db_path, move |conn| create_product(conn, &req, &username))
                .await?;

        self.change_log.record(
            ChangeLogEntry::new(EntityType::DataProduct, &product.id, "create", &user.username)
                .with_details(serde_json::json!({
                    "name": product.name,
                    "version": product.version,
                    "product_type": product.product_type,
                })),
        );
        info!(product = %product.name, version = %product.version, "Created data product");
        Ok(product)
    }

    pub async fn get(&self, id: &str) -> Result<Option<DataProduct>> {
        let id = id.to_string();
        with_connection(&self.db_path, move |conn| get_product(conn, &id)).await
    }

    pub async fn list(&self, filter: ProductFilter) -> Result<Vec<DataProduct>> {
        with_connection(&self.db_path, move |conn| list_products(conn, &filter)).await
    }

    pub async fn list_by_contract(&self, contract_id: &str) -> Result<Vec<DataProduct>> {
        let contract_id = contract_id.to_string();
        with_connection(&self.db_path, move |conn| {
            list_products_by_contract(conn, &contract_id)
        })
        .await
    }

    pub async fn update(
        &self,
        id: &str,
        req: DataProductRequest,
        user: &UserContext,
    ) -> Result<DataProduct> {
        let id_owned = id.to_string();
        let product =
            with_connection(&self.db_path, move |conn| update_product(conn, &id_owned, &req))
                .await?;
        self.change_log.record(ChangeLogEntry::new(
            EntityType::DataProduct,
            id,
            "update",
            &user.username,
        ));
        Ok(product)
    }

    pub async fn delete(&self, id: &str, user: &UserContext) -> Result<()> {
        let id_owned = id.to_string();
        with_connection(&self.db_path, move |conn| delete_product(conn, &id_owned)).await?;
        self.change_log.record(ChangeLogEntry::new(
            EntityType::DataProduct,
            id,
            "delete",
            &user.username,
        ));
        info!(product_id = %id, "Deleted data product");
        Ok(())
    }

    pub async fn set_status(
        &self,
        id: &str,
        status: ProductStatus,
        user: &UserContext,
    ) -> Result<DataProduct> {
        let id_owned = id.to_string();
        let product = with_connection(&self.db_path, move |conn| {
            set_product_status(conn, &id_owned, status)
        })
        .await?;
        self.change_log.record(ChangeLogEntry::new(
            EntityType::DataProduct,
            id,
            format!("status.{}", status),
            &user.username,
        ));
        info!(product = %product.name, status = %status, "Data product status changed");
        Ok(product)
    }
}

impl Searchable for DataProductManager {
    fn source_name(&self) -> &'static str {
        "data-products"
    }

    fn search_index_items(&self, conn: &Connection) -> Result<Vec<SearchIndexItem>> {
        Ok(list_products(conn, &ProductFilter::default())?
            .iter()
            .map(search_item)
            .collect())
    }
}
