//! Comments
//!
//! Comments attach to any entity through `(entity_type, entity_id)`. A
//! comment with an audience is visible only to its author, to members of an
//! audience group, and to comment admins (`comments` >= `admin`).
//!
//! Deleting is soft by default (`status = deleted`); soft-deleted comments
//! are listed only for admins who ask for them.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use steward_core::validation::{self, FieldError};
use steward_core::{features, EntityType, FeatureAccessLevel, Result, StewardError};
use tracing::{debug, info};

use crate::authorization::{AuthorizationManager, UserContext};
use crate::change_log::{ChangeLog, ChangeLogEntry};
use crate::{new_id, with_connection};

pub const MAX_COMMENT_LEN: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CommentStatus {
    #[default]
    Active,
    Deleted,
}

impl CommentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommentStatus::Active => "active",
            CommentStatus::Deleted => "deleted",
        }
    }

    fn from_db(s: &str) -> Self {
        if s == "deleted" {
            CommentStatus::Deleted
        } else {
            CommentStatus::Active
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub title: Option<String>,
    pub comment: String,
    /// Groups or usernames allowed to see the comment; `None` means everyone
    pub audience: Option<Vec<String>>,
    pub status: CommentStatus,
    pub created_by: String,
    pub updated_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Comment {
    /// Visibility ignoring admin rights and deletion.
    pub fn visible_to(&self, user: &UserContext) -> bool {
        match &self.audience {
            None => true,
            Some(groups) if groups.is_empty() => true,
            Some(audience) => {
                self.created_by == user.username
                    || audience.contains(&user.username)
                    || user.in_any_group(audience)
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommentRequest {
    #[serde(default)]
    pub title: Option<String>,
    pub comment: String,
    #[serde(default)]
    pub audience: Option<Vec<String>>,
}

pub fn validate_comment(req: &CommentRequest) -> Vec<FieldError> {
    let mut errors = Vec::new();

    if req.comment.trim().is_empty() {
        errors.push(FieldError::new("comment", "Comment cannot be empty"));
    } else if req.comment.len() > MAX_COMMENT_LEN {
        errors.push(FieldError::new(
            "comment",
            format!("Comment cannot exceed {} characters", MAX_COMMENT_LEN),
        ));
    }

    if let Some(audience) = &req.audience {
        for (i, group) in audience.iter().enumerate() {
            if group.trim().is_empty() {
                errors.push(FieldError::new(
                    format!("audience[{}]", i),
                    "Audience group cannot be empty",
                ));
            }
        }
    }

    errors
}

// =============================================================================
// Database Operations
// =============================================================================

const COMMENT_COLUMNS: &str = "id, entity_type, entity_id, title, comment, audience, status, created_by, updated_by, created_at, updated_at";

fn comment_from_row(row: &Row<'_>) -> rusqlite::Result<Comment> {
    let entity_type: String = row.get(1)?;
    let entity_type = entity_type.parse().map_err(|e: StewardError| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let audience: Option<String> = row.get(5)?;
    let status: String = row.get(6)?;

    Ok(Comment {
        id: row.get(0)?,
        entity_type,
        entity_id: row.get(2)?,
        title: row.get(3)?,
        comment: row.get(4)?,
        audience: audience.map(|a| steward_core::decode_list(Some(a))),
        status: CommentStatus::from_db(&status),
        created_by: row.get(7)?,
        updated_by: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn encode_audience(audience: &Option<Vec<String>>) -> Result<Option<String>> {
    audience
        .as_ref()
        .map(|groups| steward_core::encode_list(groups))
        .transpose()
}

pub fn create_comment(
    conn: &Connection,
    entity_type: EntityType,
    entity_id: &str,
    req: &CommentRequest,
    created_by: &str,
) -> Result<Comment> {
    validation::into_result(validate_comment(req))?;

    let now = Utc::now();
    let comment = Comment {
        id: new_id(),
        entity_type,
        entity_id: entity_id.to_string(),
        title: req.title.clone(),
        comment: req.comment.clone(),
        audience: req.audience.clone(),
        status: CommentStatus::Active,
        created_by: created_by.to_string(),
        updated_by: None,
        created_at: now,
        updated_at: now,
    };

    conn.execute(
        "INSERT INTO comments (id, entity_type, entity_id, title, comment, audience, status, created_by, updated_by, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        rusqlite::params![
            comment.id,
            comment.entity_type.as_str(),
            comment.entity_id,
            comment.title,
            comment.comment,
            encode_audience(&comment.audience)?,
            comment.status.as_str(),
            comment.created_by,
            comment.updated_by,
            comment.created_at,
            comment.updated_at,
        ],
    )?;

    Ok(comment)
}

pub fn get_comment(conn: &Connection, id: &str) -> Result<Option<Comment>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM comments WHERE id = ?1", COMMENT_COLUMNS),
            [id],
            comment_from_row,
        )
        .optional()?)
}

/// Every comment on an entity, newest first, deleted ones included.
pub fn list_comments_for_entity(
    conn: &Connection,
    entity_type: EntityType,
    entity_id: &str,
) -> Result<Vec<Comment>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM comments
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY created_at DESC, rowid DESC",
        COMMENT_COLUMNS
    ))?;
    let comments = stmt
        .query_map([entity_type.as_str(), entity_id], comment_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(comments)
}

pub fn update_comment(
    conn: &Connection,
    id: &str,
    req: &CommentRequest,
    updated_by: &str,
) -> Result<Comment> {
    validation::into_result(validate_comment(req))?;

    conn.execute(
        "UPDATE comments SET title = ?1, comment = ?2, audience = ?3, updated_by = ?4, updated_at = ?5
         WHERE id = ?6",
        rusqlite::params![
            req.title,
            req.comment,
            encode_audience(&req.audience)?,
            updated_by,
            Utc::now(),
            id,
        ],
    )?;

    get_comment(conn, id)?.ok_or_else(|| StewardError::NotFound(format!("Comment {}", id)))
}

pub fn soft_delete_comment(conn: &Connection, id: &str, deleted_by: &str) -> Result<()> {
    conn.execute(
        "UPDATE comments SET status = 'deleted', updated_by = ?1, updated_at = ?2 WHERE id = ?3",
        rusqlite::params![deleted_by, Utc::now(), id],
    )?;
    Ok(())
}

pub fn hard_delete_comment(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("DELETE FROM comments WHERE id = ?1", [id])?;
    Ok(())
}

/// Filter to what `user` may see, newest-first order preserved.
pub fn visible_comments(
    comments: Vec<Comment>,
    user: &UserContext,
    is_admin: bool,
    include_deleted: bool,
) -> Vec<Comment> {
    comments
        .into_iter()
        .filter(|c| c.status == CommentStatus::Active || (include_deleted && is_admin))
        .filter(|c| is_admin || c.visible_to(user))
        .collect()
}

// =============================================================================
// Manager
// =============================================================================

pub struct CommentsManager {
    db_path: String,
    authz: Arc<AuthorizationManager>,
    change_log: Arc<dyn ChangeLog>,
}

impl CommentsManager {
    pub fn new(
        db_path: impl Into<String>,
        authz: Arc<AuthorizationManager>,
        change_log: Arc<dyn ChangeLog>,
    ) -> Self {
        Self {
            db_path: db_path.into(),
            authz,
            change_log,
        }
    }

    async fn is_admin(&self, user: &UserContext) -> Result<bool> {
        Ok(self.authz.access_level(user, features::COMMENTS).await? >= FeatureAccessLevel::Admin)
    }

    /// Load a comment the caller may modify.
    async fn modifiable(&self, id: &str, user: &UserContext) -> Result<Comment> {
        let id_owned = id.to_string();
        let comment = with_connection(&self.db_path, move |conn| get_comment(conn, &id_owned))
            .await?
            .ok_or_else(|| StewardError::NotFound(format!("Comment {}", id)))?;

        if comment.created_by != user.username && !self.is_admin(user).await? {
            return Err(StewardError::Forbidden(format!(
                "{} may not modify comment {}",
                user.username, id
            )));
        }
        Ok(comment)
    }

    fn record(&self, comment: &Comment, action: &str, user: &UserContext) {
        self.change_log.record(
            ChangeLogEntry::new(comment.entity_type, &comment.entity_id, action, &user.username)
                .with_details(serde_json::json!({ "comment_id": comment.id })),
        );
    }

    pub async fn create_comment(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        req: CommentRequest,
        user: &UserContext,
    ) -> Result<Comment> {
        let (entity_id_owned, username) = (entity_id.to_string(), user.username.clone());
        let comment = with_connection(&self.db_path, move |conn| {
            create_comment(conn, entity_type, &entity_id_owned, &req, &username)
        })
        .await?;

        self.record(&comment, "comment.create", user);
        debug!(comment_id = %comment.id, %entity_type, entity_id, "Created comment");
        Ok(comment)
    }

    pub async fn list_comments(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        user: &UserContext,
        include_deleted: bool,
    ) -> Result<Vec<Comment>> {
        let entity_id = entity_id.to_string();
        let comments = with_connection(&self.db_path, move |conn| {
            list_comments_for_entity(conn, entity_type, &entity_id)
        })
        .await?;
        let is_admin = self.is_admin(user).await?;
        Ok(visible_comments(comments, user, is_admin, include_deleted))
    }

    pub async fn count_comments(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        user: &UserContext,
    ) -> Result<usize> {
        Ok(self
            .list_comments(entity_type, entity_id, user, false)
            .await?
            .len())
    }

    /// Author or admin only. Deleted comments cannot be edited.
    pub async fn update_comment(
        &self,
        id: &str,
        req: CommentRequest,
        user: &UserContext,
    ) -> Result<Comment> {
        let existing = self.modifiable(id, user).await?;
        if existing.status == CommentStatus::Deleted {
            return Err(StewardError::ValidationError(format!(
                "Comment {} is deleted",
                id
            )));
        }

        let (id_owned, username) = (id.to_string(), user.username.clone());
        let comment = with_connection(&self.db_path, move |conn| {
            update_comment(conn, &id_owned, &req, &username)
        })
        .await?;

        self.record(&comment, "comment.update", user);
        Ok(comment)
    }

    /// Author or admin only. `hard` removes the row instead of marking it deleted.
    pub async fn delete_comment(&self, id: &str, user: &UserContext, hard: bool) -> Result<()> {
        let existing = self.modifiable(id, user).await?;

        let (id_owned, username) = (id.to_string(), user.username.clone());
        with_connection(&self.db_path, move |conn| {
            if hard {
                hard_delete_comment(conn, &id_owned)
            } else {
                soft_delete_comment(conn, &id_owned, &username)
            }
        })
        .await?;

        self.record(&existing, "comment.delete", user);
        info!(comment_id = %id, hard, "Deleted comment");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_log::MemoryChangeLog;
    use crate::config::StewardConfig;

    fn comment(audience: Option<&[&str]>) -> CommentRequest {
        CommentRequest {
            title: None,
            comment: "Looks good".to_string(),
            audience: audience.map(|a| a.iter().map(|g| g.to_string()).collect()),
        }
    }

    async fn setup() -> (tempfile::TempDir, CommentsManager, Arc<MemoryChangeLog>) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("comments.db").to_string_lossy().to_string();
        {
            let conn = steward_core::open_connection(&db_path).unwrap();
            steward_core::init_store(&conn, true).unwrap();
        }
        let log = Arc::new(MemoryChangeLog::new());
        let config = StewardConfig::default().with_db_path(db_path.clone());
        let authz = Arc::new(AuthorizationManager::new(&config, log.clone()));
        authz.ensure_default_roles().await.unwrap();
        (dir, CommentsManager::new(db_path, authz, log.clone()), log)
    }

    #[test]
    fn test_validate_comment() {
        assert!(validate_comment(&comment(None)).is_empty());

        let errors = validate_comment(&CommentRequest {
            title: None,
            comment: "   ".to_string(),
            audience: Some(vec!["ok".to_string(), " ".to_string()]),
        });
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["comment", "audience[1]"]);
    }

    #[test]
    fn test_visibility_rules() {
        let conn = Connection::open_in_memory().unwrap();
        steward_core::init_store(&conn, true).unwrap();
        let restricted = create_comment(
            &conn,
            EntityType::DataProduct,
            "p1",
            &comment(Some(&["finance"])),
            "alice",
        )
        .unwrap();

        let author = UserContext::new("alice", Vec::<String>::new());
        let member = UserContext::new("bob", ["finance"]);
        let outsider = UserContext::new("eve", ["marketing"]);

        assert!(restricted.visible_to(&author));
        assert!(restricted.visible_to(&member));
        assert!(!restricted.visible_to(&outsider));

        let open = create_comment(&conn, EntityType::DataProduct, "p1", &comment(Some(&[])), "alice")
            .unwrap();
        assert!(open.visible_to(&outsider));

        let direct = create_comment(
            &conn,
            EntityType::DataProduct,
            "p1",
            &comment(Some(&["eve"])),
            "alice",
        )
        .unwrap();
        assert!(direct.visible_to(&outsider));
        assert!(!direct.visible_to(&member));
    }

    #[tokio::test]
    async fn test_list_filters_by_audience_and_orders_newest_first() {
        let (_dir, manager, _log) = setup().await;
        let alice = UserContext::new("alice", ["data-producers"]);

        let first = manager
            .create_comment(EntityType::DataContract, "c1", comment(None), &alice)
            .await
            .unwrap();
        let second = manager
            .create_comment(EntityType::DataContract, "c1", comment(Some(&["finance"])), &alice)
            .await
            .unwrap();
        manager
            .create_comment(EntityType::DataContract, "other", comment(None), &alice)
            .await
            .unwrap();

        let ids: Vec<String> = manager
            .list_comments(EntityType::DataContract, "c1", &alice, false)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![second.id.clone(), first.id.clone()]);

        let outsider = UserContext::new("eve", ["data-consumers"]);
        assert_eq!(
            manager
                .count_comments(EntityType::DataContract, "c1", &outsider)
                .await
                .unwrap(),
            1
        );

        let admin = UserContext::new("root", ["admins"]);
        assert_eq!(
            manager
                .count_comments(EntityType::DataContract, "c1", &admin)
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_only_author_or_admin_may_modify() {
        let (_dir, manager, log) = setup().await;
        let alice = UserContext::new("alice", ["data-producers"]);
        let bob = UserContext::new("bob", ["data-producers"]);
        let admin = UserContext::new("root", ["admins"]);

        let c = manager
            .create_comment(EntityType::Project, "proj", comment(None), &alice)
            .await
            .unwrap();

        let edit = CommentRequest {
            comment: "Edited".to_string(),
            ..comment(None)
        };
        assert!(matches!(
            manager.update_comment(&c.id, edit.clone(), &bob).await,
            Err(StewardError::Forbidden(_))
        ));

        let updated = manager.update_comment(&c.id, edit.clone(), &alice).await.unwrap();
        assert_eq!(updated.comment, "Edited");
        assert_eq!(updated.updated_by.as_deref(), Some("alice"));

        manager.update_comment(&c.id, edit, &admin).await.unwrap();
        assert_eq!(
            log.actions_for("proj"),
            vec!["comment.create", "comment.update", "comment.update"]
        );
    }

    #[tokio::test]
    async fn test_soft_delete_visible_only_to_admins_on_request() {
        let (_dir, manager, _log) = setup().await;
        let alice = UserContext::new("alice", ["data-producers"]);
        let admin = UserContext::new("root", ["admins"]);

        let c = manager
            .create_comment(EntityType::DataDomain, "d1", comment(None), &alice)
            .await
            .unwrap();
        manager.delete_comment(&c.id, &alice, false).await.unwrap();

        assert!(manager
            .list_comments(EntityType::DataDomain, "d1", &alice, true)
            .await
            .unwrap()
            .is_empty());
        assert!(manager
            .list_comments(EntityType::DataDomain, "d1", &admin, false)
            .await
            .unwrap()
            .is_empty());

        let deleted = manager
            .list_comments(EntityType::DataDomain, "d1", &admin, true)
            .await
            .unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].status, CommentStatus::Deleted);

        assert!(matches!(
            manager.update_comment(&c.id, comment(None), &alice).await,
            Err(StewardError::ValidationError(_))
        ));

        manager.delete_comment(&c.id, &admin, true).await.unwrap();
        assert!(matches!(
            manager.delete_comment(&c.id, &admin, true).await,
            Err(StewardError::NotFound(_))
        ));
    }
}
