//! Entity Metadata
//!
//! Rich text notes, links and document records attached to an entity via
//! `(entity_type, entity_id)`. Documents store only metadata; the bytes live
//! at `storage_path`, managed elsewhere.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use steward_core::validation::{self, FieldError, MAX_MARKDOWN_LEN, MAX_NAME_LEN};
use steward_core::{EntityType, Result, StewardError};
use tracing::debug;

use crate::authorization::UserContext;
use crate::change_log::{ChangeLog, ChangeLogEntry};
use crate::{new_id, with_connection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataKind {
    RichText,
    Link,
    Document,
}

impl MetadataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataKind::RichText => "rich_text",
            MetadataKind::Link => "link",
            MetadataKind::Document => "document",
        }
    }

    fn table(&self) -> &'static str {
        match self {
            MetadataKind::RichText => "rich_texts",
            MetadataKind::Link => "links",
            MetadataKind::Document => "documents",
        }
    }
}

impl fmt::Display for MetadataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RichText {
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub title: String,
    pub short_description: Option<String>,
    pub content_markdown: String,
    pub created_by: String,
    pub updated_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub title: String,
    pub short_description: Option<String>,
    pub url: String,
    pub created_by: String,
    pub updated_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub title: String,
    pub short_description: Option<String>,
    pub original_filename: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    pub storage_path: String,
    pub created_by: String,
    pub updated_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RichTextRequest {
    pub title: String,
    #[serde(default)]
    pub short_description: Option<String>,
    pub content_markdown: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkRequest {
    pub title: String,
    #[serde(default)]
    pub short_description: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentRequest {
    pub title: String,
    #[serde(default)]
    pub short_description: Option<String>,
    pub original_filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
    pub size_bytes: i64,
    pub storage_path: String,
}

// =============================================================================
// Input Validation
// =============================================================================

fn validate_title(title: &str, errors: &mut Vec<FieldError>) {
    if title.trim().is_empty() {
        errors.push(FieldError::new("title", "Title cannot be empty"));
    } else if title.len() > MAX_NAME_LEN {
        errors.push(FieldError::new(
            "title",
            format!("Title cannot exceed {} characters", MAX_NAME_LEN),
        ));
    }
}

pub fn validate_rich_text(req: &RichTextRequest) -> Vec<FieldError> {
    let mut errors = Vec::new();
    validate_title(&req.title, &mut errors);
    if req.content_markdown.len() > MAX_MARKDOWN_LEN {
        errors.push(FieldError::new(
            "content_markdown",
            format!("Content cannot exceed {} bytes", MAX_MARKDOWN_LEN),
        ));
    }
    errors
}

pub fn validate_link(req: &LinkRequest) -> Vec<FieldError> {
    let mut errors = Vec::new();
    validate_title(&req.title, &mut errors);
    if let Some(msg) = validation::check_url(&req.url) {
        errors.push(FieldError::new("url", msg));
    }
    errors
}

pub fn validate_document(req: &DocumentRequest) -> Vec<FieldError> {
    let mut errors = Vec::new();
    validate_title(&req.title, &mut errors);
    if req.original_filename.trim().is_empty() {
        errors.push(FieldError::new(
            "original_filename",
            "Filename cannot be empty",
        ));
    }
    if req.size_bytes <= 0 {
        errors.push(FieldError::new("size_bytes", "Size must be positive"));
    }
    if req.storage_path.trim().is_empty() {
        errors.push(FieldError::new(
            "storage_path",
            "Storage path cannot be empty",
        ));
    }
    errors
}

// =============================================================================
// Database Operations
// =============================================================================

fn entity_type_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<EntityType> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: StewardError| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Delete one metadata row of `kind`. Returns the owning entity.
pub fn delete_metadata(conn: &Connection, kind: MetadataKind, id: &str) -> Result<(EntityType, String)> {
    let owner = conn
        .query_row(
            &format!("SELECT entity_type, entity_id FROM {} WHERE id = ?1", kind.table()),
            [id],
            |row| Ok((entity_type_at(row, 0)?, row.get::<_, String>(1)?)),
        )
        .optional()?
        .ok_or_else(|| StewardError::NotFound(format!("{} {}", kind, id)))?;

    conn.execute(&format!("DELETE FROM {} WHERE id = ?1", kind.table()), [id])?;
    Ok(owner)
}

// -----------------------------------------------------------------------------
// Rich text
// -----------------------------------------------------------------------------

const RICH_TEXT_COLUMNS: &str = "id, entity_type, entity_id, title, short_description, content_markdown, created_by, updated_by, created_at, updated_at";

fn rich_text_from_row(row: &Row<'_>) -> rusqlite::Result<RichText> {
    Ok(RichText {
        id: row.get(0)?,
        entity_type: entity_type_at(row, 1)?,
        entity_id: row.get(2)?,
        title: row.get(3)?,
        short_description: row.get(4)?,
        content_markdown: row.get(5)?,
        created_by: row.get(6)?,
        updated_by: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

pub fn create_rich_text(
    conn: &Connection,
    entity_type: EntityType,
    entity_id: &str,
    req: &RichTextRequest,
    created_by: &str,
) -> Result<RichText> {
    validation::into_result(validate_rich_text(req))?;

    let now = Utc::now();
    let item = RichText {
        id: new_id(),
        entity_type,
        entity_id: entity_id.to_string(),
        title: req.title.clone(),
        short_description: req.short_description.clone(),
        content_markdown: req.content_markdown.clone(),
        created_by: created_by.to_string(),
        updated_by: None,
        created_at: now,
        updated_at: now,
    };

    conn.execute(
        "INSERT INTO rich_texts (id, entity_type, entity_id, title, short_description, content_markdown, created_by, updated_by, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            item.id,
            item.entity_type.as_str(),
            item.entity_id,
            item.title,
            item.short_description,
            item.content_markdown,
            item.created_by,
            item.updated_by,
            item.created_at,
            item.updated_at,
        ],
    )?;
    Ok(item)
}

pub fn get_rich_text(conn: &Connection, id: &str) -> Result<Option<RichText>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM rich_texts WHERE id = ?1", RICH_TEXT_COLUMNS),
            [id],
            rich_text_from_row,
        )
        .optional()?)
}

pub fn list_rich_texts(
    conn: &Connection,
    entity_type: EntityType,
    entity_id: &str,
) -> Result<Vec<RichText>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM rich_texts WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY created_at, rowid",
        RICH_TEXT_COLUMNS
    ))?;
    let items = stmt
        .query_map([entity_type.as_str(), entity_id], rich_text_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(items)
}

pub fn update_rich_text(
    conn: &Connection,
    id: &str,
    req: &RichTextRequest,
    updated_by: &str,
) -> Result<RichText> {
    validation::into_result(validate_rich_text(req))?;
    conn.execute(
        "UPDATE rich_texts SET title = ?1, short_description = ?2, content_markdown = ?3,
             updated_by = ?4, updated_at = ?5
         WHERE id = ?6",
        rusqlite::params![
            req.title,
            req.short_description,
            req.content_markdown,
            updated_by,
            Utc::now(),
            id,
        ],
    )?;
    get_rich_text(conn, id)?.ok_or_else(|| StewardError::NotFound(format!("rich_text {}", id)))
}

// -----------------------------------------------------------------------------
// Links
// -----------------------------------------------------------------------------

const LINK_COLUMNS: &str = "id, entity_type, entity_id, title, short_description, url, created_by, updated_by, created_at, updated_at";

fn link_from_row(row: &Row<'_>) -> rusqlite::Result<Link> {
    Ok(Link {
        id: row.get(0)?,
        entity_type: entity_type_at(row, 1)?,
        entity_id: row.get(2)?,
        title: row.get(3)?,
        short_description: row.get(4)?,
        url: row.get(5)?,
        created_by: row.get(6)?,
        updated_by: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

pub fn create_link(
    conn: &Connection,
    entity_type: EntityType,
    entity_id: &str,
    req: &LinkRequest,
    created_by: &str,
) -> Result<Link> {
    validation::into_result(validate_link(req))?;

    let now = Utc::now();
    let item = Link {
        id: new_id(),
        entity_type,
        entity_id: entity_id.to_string(),
        title: req.title.clone(),
        short_description: req.short_description.clone(),
        url: req.url.clone(),
        created_by: created_by.to_string(),
        updated_by: None,
        created_at: now,
        updated_at: now,
    };

    conn.execute(
        "INSERT INTO links (id, entity_type, entity_id, title, short_description, url, created_by, updated_by, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            item.id,
            item.entity_type.as_str(),
            item.entity_id,
            item.title,
            item.short_description,
            item.url,
            item.created_by,
            item.updated_by,
            item.created_at,
            item.updated_at,
        ],
    )?;
    Ok(item)
}

pub fn get_link(conn: &Connection, id: &str) -> Result<Option<Link>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM links WHERE id = ?1", LINK_COLUMNS),
            [id],
            link_from_row,
        )
        .optional()?)
}

pub fn list_links(conn: &Connection, entity_type: EntityType, entity_id: &str) -> Result<Vec<Link>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM links WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY created_at, rowid",
        LINK_COLUMNS
    ))?;
    let items = stmt
        .query_map([entity_type.as_str(), entity_id], link_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(items)
}

pub fn update_link(conn: &Connection, id: &str, req: &LinkRequest, updated_by: &str) -> Result<Link> {
    validation::into_result(validate_link(req))?;
    conn.execute(
        "UPDATE links SET title = ?1, short_description = ?2, url = ?3, updated_by = ?4, updated_at = ?5
         WHERE id = ?6",
        rusqlite::params![
            req.title,
            req.short_description,
            req.url,
            updated_by,
            Utc::now(),
            id,
        ],
    )?;
    get_link(conn, id)?.ok_or_else(|| StewardError::NotFound(format!("link {}", id)))
}

// -----------------------------------------------------------------------------
// Documents
// -----------------------------------------------------------------------------

const DOCUMENT_COLUMNS: &str = "id, entity_type, entity_id, title, short_description, original_filename, content_type, size_bytes, storage_path, created_by, updated_by, created_at, updated_at";

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<Document> {
    Ok(Document {
        id: row.get(0)?,
        entity_type: entity_type_at(row, 1)?,
        entity_id: row.get(2)?,
        title: row.get(3)?,
        short_description: row.get(4)?,
        original_filename: row.get(5)?,
        content_type: row.get(6)?,
        size_bytes: row.get(7)?,
        storage_path: row.get(8)?,
        created_by: row.get(9)?,
        updated_by: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

pub fn create_document(
    conn: &Connection,
    entity_type: EntityType,
    entity_id: &str,
    req: &DocumentRequest,
    created_by: &str,
) -> Result<Document> {
    validation::into_result(validate_document(req))?;

    let now = Utc::now();
    let item = Document {
        id: new_id(),
        entity_type,
        entity_id: entity_id.to_string(),
        title: req.title.clone(),
        short_description: req.short_description.clone(),
        original_filename: req.original_filename.clone(),
        content_type: req.content_type.clone(),
        size_bytes: req.size_bytes,
        storage_path: req.storage_path.clone(),
        created_by: created_by.to_string(),
        updated_by: None,
        created_at: now,
        updated_at: now,
    };

    conn.execute(
        "INSERT INTO documents (id, entity_type, entity_id, title, short_description, original_filename, content_type, size_bytes, storage_path, created_by, updated_by, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        rusqlite::params![
            item.id,
            item.entity_type.as_str(),
            item.entity_id,
            item.title,
            item.short_description,
            item.original_filename,
            item.content_type,
            item.size_bytes,
            item.storage_path,
            item.created_by,
            item.updated_by,
            item.created_at,
            item.updated_at,
        ],
    )?;
    Ok(item)
}

pub fn get_document(conn: &Connection, id: &str) -> Result<Option<Document>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM documents WHERE id = ?1", DOCUMENT_COLUMNS),
            [id],
            document_from_row,
        )
        .optional()?)
}

pub fn list_documents(
    conn: &Connection,
    entity_type: EntityType,
    entity_id: &str,
) -> Result<Vec<Document>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM documents WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY created_at, rowid",
        DOCUMENT_COLUMNS
    ))?;
    let items = stmt
        .query_map([entity_type.as_str(), entity_id], document_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(items)
}

pub fn update_document(
    conn: &Connection,
    id: &str,
    req: &DocumentRequest,
    updated_by: &str,
) -> Result<Document> {
    validation::into_result(validate_document(req))?;
    conn.execute(
        "UPDATE documents SET title = ?1, short_description = ?2, original_filename = ?3,
             content_type = ?4, size_bytes = ?5, storage_path = ?6, updated_by = ?7, updated_at = ?8
         WHERE id = ?9",
        rusqlite::params![
            req.title,
            req.short_description,
            req.original_filename,
            req.content_type,
            req.size_bytes,
            req.storage_path,
            updated_by,
            Utc::now(),
            id,
        ],
    )?;
    get_document(conn, id)?.ok_or_else(|| StewardError::NotFound(format!("document {}", id)))
}

// =============================================================================
// Manager
// =============================================================================

pub struct MetadataManager {
    db_path: String,
    change_log: Arc<dyn ChangeLog>,
}

impl MetadataManager {
    pub fn new(db_path: impl Into<String>, change_log: Arc<dyn ChangeLog>) -> Self {
        Self {
            db_path: db_path.into(),
            change_log,
        }
    }

    fn record(
        &self,
        kind: MetadataKind,
        op: &str,
        entity_type: EntityType,
        entity_id: &str,
        item_id: &str,
        user: &UserContext,
    ) {
        self.change_log.record(
            ChangeLogEntry::new(
                entity_type,
                entity_id,
                format!("metadata.{}.{}", kind, op),
                &user.username,
            )
            .with_details(serde_json::json!({ "id": item_id })),
        );
        debug!(%kind, op, %entity_type, entity_id, item_id, "Metadata changed");
    }

    /// Delete any metadata item, recording the change against its owner.
    pub async fn delete(&self, kind: MetadataKind, id: &str, user: &UserContext) -> Result<()> {
        let id_owned = id.to_string();
        let (entity_type, entity_id) =
            with_connection(&self.db_path, move |conn| delete_metadata(conn, kind, &id_owned))
                .await?;
        self.record(kind, "delete", entity_type, &entity_id, id, user);
        Ok(())
    }

    // Rich text

    pub async fn create_rich_text(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        req: RichTextRequest,
        user: &UserContext,
    ) -> Result<RichText> {
        let (entity_id_owned, username) = (entity_id.to_string(), user.username.clone());
        let item = with_connection(&self.db_path, move |conn| {
            create_rich_text(conn, entity_type, &entity_id_owned, &req, &username)
        })
        .await?;
        self.record(MetadataKind::RichText, "create", entity_type, entity_id, &item.id, user);
        Ok(item)
    }

    pub async fn get_rich_text(&self, id: &str) -> Result<Option<RichText>> {
        let id = id.to_string();
        with_connection(&self.db_path, move |conn| get_rich_text(conn, &id)).await
    }

    pub async fn list_rich_texts(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<RichText>> {
        let entity_id = entity_id.to_string();
        with_connection(&self.db_path, move |conn| {
            list_rich_texts(conn, entity_type, &entity_id)
        })
        .await
    }

    pub async fn update_rich_text(
        &self,
        id: &str,
        req: RichTextRequest,
        user: &UserContext,
    ) -> Result<RichText> {
        let (id_owned, username) = (id.to_string(), user.username.clone());
        let item = with_connection(&self.db_path, move |conn| {
            update_rich_text(conn, &id_owned, &req, &username)
        })
        .await?;
        self.record(
            MetadataKind::RichText,
            "update",
            item.entity_type,
            &item.entity_id,
            id,
            user,
        );
        Ok(item)
    }

    // Links

    pub async fn create_link(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        req: LinkRequest,
        user: &UserContext,
    ) -> Result<Link> {
        let (entity_id_owned, username) = (entity_id.to_string(), user.username.clone());
        let item = with_connection(&self.db_path, move |conn| {
            create_link(conn, entity_type, &entity_id_owned, &req, &username)
        })
        .await?;
        self.record(MetadataKind::Link, "create", entity_type, entity_id, &item.id, user);
        Ok(item)
    }

    pub async fn get_link(&self, id: &str) -> Result<Option<Link>> {
        let id = id.to_string();
        with_connection(&self.db_path, move |conn| get_link(conn, &id)).await
    }

    pub async fn list_links(&self, entity_type: EntityType, entity_id: &str) -> Result<Vec<Link>> {
        let entity_id = entity_id.to_string();
        with_connection(&self.db_path, move |conn| {
            list_links(conn, entity_type, &entity_id)
        })
        .await
    }

    pub async fn update_link(&self, id: &str, req: LinkRequest, user: &UserContext) -> Result<Link> {
        let (id_owned, username) = (id.to_string(), user.username.clone());
        let item = with_connection(&self.db_path, move |conn| {
            update_link(conn, &id_owned, &req, &username)
        })
        .await?;
        self.record(MetadataKind::Link, "update", item.entity_type, &item.entity_id, id, user);
        Ok(item)
    }

    // Documents

    pub async fn create_document(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        req: DocumentRequest,
        user: &UserContext,
    ) -> Result<Document> {
        let (entity_id_owned, username) = (entity_id.to_string(), user.username.clone());
        let item = with_connection(&self.db_path, move |conn| {
            create_document(conn, entity_type, &entity_id_owned, &req, &username)
        })
        .await?;
        self.record(MetadataKind::Document, "create", entity_type, entity_id, &item.id, user);
        Ok(item)
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let id = id.to_string();
        with_connection(&self.db_path, move |conn| get_document(conn, &id)).await
    }

    pub async fn list_documents(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<Document>> {
        let entity_id = entity_id.to_string();
        with_connection(&self.db_path, move |conn| {
            list_documents(conn, entity_type, &entity_id)
        })
        .await
    }

    pub async fn update_document(
        &self,
        id: &str,
        req: DocumentRequest,
        user: &UserContext,
    ) -> Result<Document> {
        let (id_owned, username) = (id.to_string(), user.username.clone());
        let item = with_connection(&self.db_path, move |conn| {
            update_document(conn, &id_owned, &req, &username)
        })
        .await?;
        self.record(
            MetadataKind::Document,
            "update",
            item.entity_type,
            &item.entity_id,
            id,
            user,
        );
        Ok(item)
    }
}
