//! Costs
//!
//! Monthly cost items attached to entities, and per-month summaries.
//!
//! An item with `start_month = 2024-01` and no `end_month` counts toward
//! every month from January 2024 on. Months are `YYYY-MM`, so plain string
//! comparison orders them.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use steward_core::validation::{self, FieldError};
use steward_core::{EntityType, Result, StewardError};
use tracing::{info, warn};

use crate::authorization::UserContext;
use crate::change_log::{ChangeLog, ChangeLogEntry};
use crate::{new_id, with_connection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostCenter {
    Infrastructure,
    Hr,
    Storage,
    Maintenance,
    License,
    Other,
}

impl CostCenter {
    pub fn as_str(&self) -> &'static str {
        match self {
            CostCenter::Infrastructure => "infrastructure",
            CostCenter::Hr => "hr",
            CostCenter::Storage => "storage",
            CostCenter::Maintenance => "maintenance",
            CostCenter::License => "license",
            CostCenter::Other => "other",
        }
    }
}

impl fmt::Display for CostCenter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CostCenter {
    type Err = StewardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "infrastructure" => Ok(CostCenter::Infrastructure),
            "hr" => Ok(CostCenter::Hr),
            "storage" => Ok(CostCenter::Storage),
            "maintenance" => Ok(CostCenter::Maintenance),
            "license" => Ok(CostCenter::License),
            "other" => Ok(CostCenter::Other),
            other => Err(StewardError::ValidationError(format!(
                "Unknown cost center '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostItem {
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub title: String,
    pub description: Option<String>,
    pub cost_center: CostCenter,
    pub custom_center_name: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub start_month: String,
    pub end_month: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CostItem {
    /// Whether the item counts toward `month`.
    pub fn is_active_in(&self, month: &str) -> bool {
        self.start_month.as_str() <= month
            && self.end_month.as_deref().map_or(true, |end| month <= end)
    }

    /// Key used in summaries: the custom name for `other`, else the center name.
    pub fn center_key(&self) -> String {
        match (&self.cost_center, &self.custom_center_name) {
            (CostCenter::Other, Some(name)) => name.clone(),
            (center, _) => center.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostItemRequest {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub cost_center: CostCenter,
    #[serde(default)]
    pub custom_center_name: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub start_month: String,
    #[serde(default)]
    pub end_month: Option<String>,
}

/// Totals for one currency in one month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CostSummary {
    pub month: String,
    pub currency: String,
    pub total_cents: i64,
    pub by_center: BTreeMap<String, i64>,
    pub items_count: usize,
}

pub fn validate_cost_item(req: &CostItemRequest) -> Vec<FieldError> {
    let mut errors = Vec::new();

    if req.title.trim().is_empty() {
        errors.push(FieldError::new("title", "Title cannot be empty"));
    }
    if req.amount_cents < 0 {
        errors.push(FieldError::new("amount_cents", "Amount cannot be negative"));
    }
    if let Err(e) = validation::validate_currency(&req.currency) {
        errors.push(FieldError::new("currency", e.to_string()));
    }

    let start_ok = match validation::validate_month(&req.start_month, "start_month") {
        Ok(()) => true,
        Err(e) => {
            errors.push(FieldError::new("start_month", e.to_string()));
            false
        }
    };
    if let Some(end) = &req.end_month {
        match validation::validate_month(end, "end_month") {
            Ok(()) if start_ok && end.as_str() < req.start_month.as_str() => {
                errors.push(FieldError::new(
                    "end_month",
                    "end_month cannot be before start_month",
                ));
            }
            Ok(()) => {}
            Err(e) => errors.push(FieldError::new("end_month", e.to_string())),
        }
    }

    let custom = req
        .custom_center_name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty());
    match (req.cost_center, custom) {
        (CostCenter::Other, None) => errors.push(FieldError::new(
            "custom_center_name",
            "custom_center_name is required when cost_center is other",
        )),
        (CostCenter::Other, Some(_)) | (_, None) => {}
        (_, Some(_)) => errors.push(FieldError::new(
            "custom_center_name",
            "custom_center_name is only allowed when cost_center is other",
        )),
    }

    errors
}

fn add_cents(total: i64, amount: i64, currency: &str) -> Result<i64> {
    total.checked_add(amount).ok_or_else(|| {
        StewardError::ValidationError(format!(
            "Cost total in {} exceeds the supported range",
            currency
        ))
    })
}

/// One summary per currency for items active in `month`, ordered by currency.
///
/// Fails when a per-currency or per-center total would overflow.
pub fn summarize_items(items: &[CostItem], month: &str) -> Result<Vec<CostSummary>> {
    let mut by_currency: BTreeMap<&str, CostSummary> = BTreeMap::new();

    for item in items.iter().filter(|i| i.is_active_in(month)) {
        let summary = by_currency
            .entry(item.currency.as_str())
            .or_insert_with(|| CostSummary {
                month: month.to_string(),
                currency: item.currency.clone(),
                total_cents: 0,
                by_center: BTreeMap::new(),
                items_count: 0,
            });
        summary.total_cents = add_cents(summary.total_cents, item.amount_cents, &item.currency)?;
        let center = summary.by_center.entry(item.center_key()).or_insert(0);
        *center = add_cents(*center, item.amount_cents, &item.currency)?;
        summary.items_count += 1;
    }

    Ok(by_currency.into_values().collect())
}

// =============================================================================
// Database Operations
// =============================================================================

const COST_COLUMNS: &str = "id, entity_type, entity_id, title, description, cost_center, custom_center_name, amount_cents, currency, start_month, end_month, created_by, created_at, updated_at";

fn cost_from_row(row: &Row<'_>) -> rusqlite::Result<CostItem> {
    let entity_type: String = row.get(1)?;
    let cost_center: String = row.get(5)?;
    Ok(CostItem {
        id: row.get(0)?,
        entity_type: entity_type.parse().map_err(|e: StewardError| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?,
        entity_id: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        cost_center: cost_center.parse().unwrap_or_else(|_| {
            warn!(cost_center = %cost_center, "Unknown cost center in store, reading as other");
            CostCenter::Other
        }),
        custom_center_name: row.get(6)?,
        amount_cents: row.get(7)?,
        currency: row.get(8)?,
        start_month: row.get(9)?,
        end_month: row.get(10)?,
        created_by: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn custom_name(req: &CostItemRequest) -> Option<String> {
    match req.cost_center {
        CostCenter::Other => req.custom_center_name.as_ref().map(|n| n.trim().to_string()),
        _ => None,
    }
}

pub fn create_cost_item(
    conn: &Connection,
    entity_type: EntityType,
    entity_id: &str,
    req: &CostItemRequest,
    created_by: &str,
) -> Result<CostItem> {
    validation::into_result(validate_cost_item(req))?;

    let now = Utc::now();
    let item = CostItem {
        id: new_id(),
        entity_type,
        entity_id: entity_id.to_string(),
        title: req.title.clone(),
        description: req.description.clone(),
        cost_center: req.cost_center,
        custom_center_name: custom_name(req),
        amount_cents: req.amount_cents,
        currency: req.currency.clone(),
        start_month: req.start_month.clone(),
        end_month: req.end_month.clone(),
        created_by: created_by.to_string(),
        created_at: now,
        updated_at: now,
    };

    conn.execute(
        "INSERT INTO cost_items (id, entity_type, entity_id, title, description, cost_center, custom_center_name, amount_cents, currency, start_month, end_month, created_by, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        rusqlite::params![
            item.id,
            item.entity_type.as_str(),
            item.entity_id,
            item.title,
            item.description,
            item.cost_center.as_str(),
            item.custom_center_name,
            item.amount_cents,
            item.currency,
            item.start_month,
            item.end_month,
            item.created_by,
            item.created_at,
            item.updated_at,
        ],
    )?;
    Ok(item)
}

pub fn get_cost_item(conn: &Connection, id: &str) -> Result<Option<CostItem>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM cost_items WHERE id = ?1", COST_COLUMNS),
            [id],
            cost_from_row,
        )
        .optional()?)
}

pub fn list_cost_items(
    conn: &Connection,
    entity_type: EntityType,
    entity_id: &str,
) -> Result<Vec<CostItem>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM cost_items WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY start_month, created_at",
        COST_COLUMNS
    ))?;
    let items = stmt
        .query_map([entity_type.as_str(), entity_id], cost_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(items)
}

pub fn update_cost_item(conn: &Connection, id: &str, req: &CostItemRequest) -> Result<CostItem> {
    validation::into_result(validate_cost_item(req))?;

    let rows = conn.execute(
        "UPDATE cost_items
         SET title = ?1, description = ?2, cost_center = ?3, custom_center_name = ?4,
             amount_cents = ?5, currency = ?6, start_month = ?7, end_month = ?8, updated_at = ?9
         WHERE id = ?10",
        rusqlite::params![
            req.title,
            req.description,
            req.cost_center.as_str(),
            custom_name(req),
            req.amount_cents,
            req.currency,
            req.start_month,
            req.end_month,
            Utc::now(),
            id,
        ],
    )?;
    if rows == 0 {
        return Err(StewardError::NotFound(format!("Cost item {}", id)));
    }
    get_cost_item(conn, id)?.ok_or_else(|| StewardError::NotFound(format!("Cost item {}", id)))
}

/// Delete a cost item. Returns the deleted item.
pub fn delete_cost_item(conn: &Connection, id: &str) -> Result<CostItem> {
    let item = get_cost_item(conn, id)?
        .ok_or_else(|| StewardError::NotFound(format!("Cost item {}", id)))?;
    conn.execute("DELETE FROM cost_items WHERE id = ?1", [id])?;
    Ok(item)
}

// =============================================================================
// Manager
// =============================================================================

pub struct CostsManager {
    db_path: String,
    change_log: Arc<dyn ChangeLog>,
}

impl CostsManager {
    pub fn new(db_path: impl Into<String>, change_log: Arc<dyn ChangeLog>) -> Self {
        Self {
            db_path: db_path.into(),
            change_log,
        }
    }

    fn record(&self, item: &CostItem, action: &str, user: &UserContext) {
        self.change_log.record(
            ChangeLogEntry::new(item.entity_type, &item.entity_id, action, &user.username)
                .with_details(serde_json::json!({
                    "cost_item_id": item.id,
                    "amount_cents": item.amount_cents,
                    "currency": item.currency,
                })),
        );
    }

    pub async fn create(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        req: CostItemRequest,
        user: &UserContext,
    ) -> Result<CostItem> {
        let (entity_id, username) = (entity_id.to_string(), user.username.clone());
        let item = with_connection(&self.db_path, move |conn| {
            create_cost_item(conn, entity_type, &entity_id, &req, &username)
        })
        .await?;
        self.record(&item, "cost.create", user);
        info!(cost_item_id = %item.id, center = %item.cost_center, "Created cost item");
        Ok(item)
    }

    pub async fn get(&self, id: &str) -> Result<Option<CostItem>> {
        let id = id.to_string();
        with_connection(&self.db_path, move |conn| get_cost_item(conn, &id)).await
    }

    pub async fn list_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<CostItem>> {
        let entity_id = entity_id.to_string();
        with_connection(&self.db_path, move |conn| {
            list_cost_items(conn, entity_type, &entity_id)
        })
        .await
    }

    pub async fn update(
        &self,
        id: &str,
        req: CostItemRequest,
        user: &UserContext,
    ) -> Result<CostItem> {
        let id = id.to_string();
        let item =
            with_connection(&self.db_path, move |conn| update_cost_item(conn, &id, &req)).await?;
        self.record(&item, "cost.update", user);
        Ok(item)
    }

    pub async fn delete(&self, id: &str, user: &UserContext) -> Result<()> {
        let id = id.to_string();
        let item = with_connection(&self.db_path, move |conn| delete_cost_item(conn, &id)).await?;
        self.record(&item, "cost.delete", user);
        Ok(())
    }

    /// Per-currency totals for items active in `month`.
    pub async fn summarize(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        month: &str,
    ) -> Result<Vec<CostSummary>> {
        validation::validate_month(month, "month")?;
        let items = self.list_for_entity(entity_type, entity_id).await?;
        summarize_items(&items, month)
    }
}
