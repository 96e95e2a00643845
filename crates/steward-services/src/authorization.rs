//! Authorization
//!
//! Group-based role resolution for feature permissions.
//!
//! # Model
//!
//! - An [`AppRole`] grants a [`FeatureAccessLevel`] per feature and is
//!   assigned to directory groups.
//! - A user's effective level on a feature is the maximum level over every
//!   role assigned to one of the user's groups. Features nobody grants are
//!   `none`.
//! - Members of a configured admin group get `admin` everywhere.
//! - A role override ("view as role") replaces all of the above with exactly
//!   the overriding role's permissions, admin membership included.
//!
//! # Caching
//!
//! Resolved permissions are cached per normalized group set for
//! `permission_cache_ttl_secs`. Any role write clears the whole cache, so a
//! changed role is visible on the next lookup.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use steward_core::validation::{self, FieldError};
use steward_core::{
    conflict_on_unique, decode_list, encode_list, features, EntityType, FeatureAccessLevel,
    Result, StewardError,
};
use tracing::{debug, info, warn};

use crate::change_log::{ChangeLog, ChangeLogEntry};
use crate::config::StewardConfig;
use crate::{new_id, with_connection, with_transaction};

/// Feature id → granted access level.
pub type FeaturePermissions = BTreeMap<String, FeatureAccessLevel>;

/// The caller of a manager operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl UserContext {
    pub fn new<I, S>(username: impl Into<String>, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            username: username.into(),
            email: None,
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Whether the user belongs to at least one of `groups`.
    pub fn in_any_group(&self, groups: &[String]) -> bool {
        groups.iter().any(|g| self.groups.contains(g))
    }
}

/// A role stored in `app_roles`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppRole {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub assigned_groups: Vec<String>,
    pub feature_permissions: FeaturePermissions,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AppRole {
    /// Level this role grants on `feature` (`none` when absent).
    pub fn level_for(&self, feature: &str) -> FeatureAccessLevel {
        self.feature_permissions
            .get(feature)
            .copied()
            .unwrap_or_default()
    }
}

/// Create/replace payload for a role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppRoleRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub assigned_groups: Vec<String>,
    #[serde(default)]
    pub feature_permissions: FeaturePermissions,
}

/// Validate a role payload. Returns every problem found (empty if valid).
pub fn validate_role(req: &AppRoleRequest) -> Vec<FieldError> {
    let mut errors = Vec::new();

    if let Err(e) = validation::validate_name(&req.name, "Role name") {
        errors.push(FieldError::new("name", e.to_string()));
    }

    for (i, group) in req.assigned_groups.iter().enumerate() {
        if group.trim().is_empty() {
            errors.push(FieldError::new(
                format!("assigned_groups[{}]", i),
                "Group name cannot be empty",
            ));
        }
    }

    for feature in req.feature_permissions.keys() {
        if !features::is_known(feature) {
            errors.push(FieldError::new(
                format!("feature_permissions.{}", feature),
                "Unknown feature",
            ));
        }
    }

    errors
}

// =============================================================================
// Permission Resolution
// =============================================================================

/// Every known feature set to `level`.
pub fn uniform_permissions(level: FeatureAccessLevel) -> FeaturePermissions {
    features::ALL
        .iter()
        .map(|f| (f.to_string(), level))
        .collect()
}

/// Permissions of a single role, with every known feature present.
pub fn role_permissions(role: &AppRole) -> FeaturePermissions {
    features::ALL
        .iter()
        .map(|f| (f.to_string(), role.level_for(f)))
        .collect()
}

/// Merge the permissions of every role assigned to one of `groups`,
/// keeping the highest level per feature.
pub fn merge_role_permissions(roles: &[AppRole], groups: &[String]) -> FeaturePermissions {
    let mut merged = uniform_permissions(FeatureAccessLevel::None);

    for role in roles
        .iter()
        .filter(|r| r.assigned_groups.iter().any(|g| groups.contains(g)))
    {
        for (feature, level) in &role.feature_permissions {
            let entry = merged.entry(feature.clone()).or_default();
            if *level > *entry {
                *entry = *level;
            }
        }
    }

    merged
}

/// Whether `permissions` grant at least `required` on `feature`.
pub fn has_permission(
    permissions: &FeaturePermissions,
    feature: &str,
    required: FeatureAccessLevel,
) -> bool {
    permissions.get(feature).copied().unwrap_or_default() >= required
}

/// Cache key for a group set: sorted, deduplicated, newline-joined.
fn group_cache_key(groups: &[String]) -> String {
    let mut sorted: Vec<&str> = groups.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    sorted.join("\n")
}

/// Roles seeded into an empty store.
pub fn default_roles(admin_groups: &[String]) -> Vec<AppRoleRequest> {
    use FeatureAccessLevel::{Admin, ReadOnly, ReadWrite};

    let grant = |pairs: &[(&str, FeatureAccessLevel)]| -> FeaturePermissions {
        pairs.iter().map(|(f, l)| (f.to_string(), *l)).collect()
    };

    vec![
        AppRoleRequest {
            name: "Admin".to_string(),
            description: Some("Full administrative access".to_string()),
            assigned_groups: admin_groups.to_vec(),
            feature_permissions: uniform_permissions(Admin),
        },
        AppRoleRequest {
            name: "Data Steward".to_string(),
            description: Some("Curates domains, products and contracts".to_string()),
            assigned_groups: vec!["data-stewards".to_string()],
            feature_permissions: grant(&[
                (features::DATA_DOMAINS, ReadWrite),
                (features::DATA_PRODUCTS, ReadWrite),
                (features::DATA_CONTRACTS, ReadWrite),
                (features::PROJECTS, ReadWrite),
                (features::COMMENTS, ReadWrite),
                (features::SEMANTIC_MODELS, ReadWrite),
                (features::COSTS, ReadWrite),
                (features::SEARCH, ReadOnly),
            ]),
        },
        AppRoleRequest {
            name: "Data Producer".to_string(),
            description: Some("Publishes data products and their contracts".to_string()),
            assigned_groups: vec!["data-producers".to_string()],
            feature_permissions: grant(&[
                (features::DATA_DOMAINS, ReadOnly),
                (features::DATA_PRODUCTS, ReadWrite),
                (features::DATA_CONTRACTS, ReadWrite),
                (features::PROJECTS, ReadWrite),
                (features::COMMENTS, ReadWrite),
                (features::SEMANTIC_MODELS, ReadOnly),
                (features::COSTS, ReadOnly),
                (features::SEARCH, ReadOnly),
            ]),
        },
        AppRoleRequest {
            name: "Data Consumer".to_string(),
            description: Some("Discovers and reads published data".to_string()),
            assigned_groups: vec!["data-consumers".to_string()],
            feature_permissions: grant(&[
                (features::DATA_DOMAINS, ReadOnly),
                (features::DATA_PRODUCTS, ReadOnly),
                (features::DATA_CONTRACTS, ReadOnly),
                (features::PROJECTS, ReadOnly),
                (features::COMMENTS, ReadOnly),
                (features::SEMANTIC_MODELS, ReadOnly),
                (features::SEARCH, ReadOnly),
            ]),
        },
    ]
}

// =============================================================================
// Database Operations
// =============================================================================

const ROLE_COLUMNS: &str =
    "id, name, description, assigned_groups, feature_permissions, created_at, updated_at";

fn role_from_row(row: &Row<'_>) -> rusqlite::Result<AppRole> {
    let permissions_json: Option<String> = row.get(4)?;
    let feature_permissions = permissions_json
        .and_then(|s| match serde_json::from_str::<FeaturePermissions>(&s) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(error = %e, "Malformed feature_permissions, treating as empty");
                None
            }
        })
        .unwrap_or_default();

    Ok(AppRole {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        assigned_groups: decode_list(row.get(3)?),
        feature_permissions,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

/// Insert a new role.
pub fn create_role(conn: &Connection, req: &AppRoleRequest) -> Result<AppRole> {
    validation::into_result(validate_role(req))?;

    let now = Utc::now();
    let role = AppRole {
        id: new_id(),
        name: req.name.clone(),
        description: req.description.clone(),
        assigned_groups: req.assigned_groups.clone(),
        feature_permissions: req.feature_permissions.clone(),
        created_at: now,
        updated_at: now,
    };

    conn.execute(
        "INSERT INTO app_roles (id, name, description, assigned_groups, feature_permissions, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            role.id,
            role.name,
            role.description,
            encode_list(&role.assigned_groups)?,
            serde_json::to_string(&role.feature_permissions)?,
            role.created_at,
            role.updated_at,
        ],
    )
    .map_err(|e| conflict_on_unique(e, format!("Role '{}' already exists", role.name)))?;

    Ok(role)
}

pub fn get_role(conn: &Connection, id: &str) -> Result<Option<AppRole>> {
    let role = conn
        .query_row(
            &format!("SELECT {} FROM app_roles WHERE id = ?1", ROLE_COLUMNS),
            [id],
            role_from_row,
        )
        .optional()?;
    Ok(role)
}

pub fn get_role_by_name(conn: &Connection, name: &str) -> Result<Option<AppRole>> {
    let role = conn
        .query_row(
            &format!("SELECT {} FROM app_roles WHERE name = ?1", ROLE_COLUMNS),
            [name],
            role_from_row,
        )
        .optional()?;
    Ok(role)
}

/// List all roles ordered by name.
pub fn list_roles(conn: &Connection) -> Result<Vec<AppRole>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM app_roles ORDER BY name",
        ROLE_COLUMNS
    ))?;
    let roles = stmt
        .query_map([], role_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(roles)
}

pub fn count_roles(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM app_roles", [], |row| row.get(0))?)
}

/// Replace every mutable field of a role.
pub fn update_role(conn: &Connection, id: &str, req: &AppRoleRequest) -> Result<AppRole> {
    validation::into_result(validate_role(req))?;

    let rows = conn
        .execute(
            "UPDATE app_roles
             SET name = ?1, description = ?2, assigned_groups = ?3, feature_permissions = ?4,
                 updated_at = ?5
             WHERE id = ?6",
            rusqlite::params![
                req.name,
                req.description,
                encode_list(&req.assigned_groups)?,
                serde_json::to_string(&req.feature_permissions)?,
                Utc::now(),
                id,
            ],
        )
        .map_err(|e| conflict_on_unique(e, format!("Role '{}' already exists", req.name)))?;

    if rows == 0 {
        return Err(StewardError::NotFound(format!("Role {}", id)));
    }

    get_role(conn, id)?.ok_or_else(|| StewardError::NotFound(format!("Role {}", id)))
}

/// Delete a role. Returns false if it did not exist.
pub fn delete_role(conn: &Connection, id: &str) -> Result<bool> {
    let rows = conn.execute("DELETE FROM app_roles WHERE id = ?1", [id])?;
    Ok(rows > 0)
}

// =============================================================================
// Manager
// =============================================================================

#[derive(Clone)]
struct CachedPermissions {
    permissions: FeaturePermissions,
    cached_at: Instant,
}

/// Resolves effective permissions and manages roles and role overrides.
pub struct AuthorizationManager {
    db_path: String,
    admin_groups: Vec<String>,
    cache_ttl: Duration,
    /// Keyed by normalized group set
    cache: DashMap<String, CachedPermissions>,
    /// Bumped on every invalidation; a lookup that straddles one is not cached
    cache_generation: AtomicU64,
    /// username → role id
    overrides: DashMap<String, String>,
    change_log: Arc<dyn ChangeLog>,
}

impl AuthorizationManager {
    pub fn new(config: &StewardConfig, change_log: Arc<dyn ChangeLog>) -> Self {
        Self {
            db_path: config.db_path.clone(),
            admin_groups: config.admin_groups.clone(),
            cache_ttl: Duration::from_secs(config.permission_cache_ttl_secs),
            cache: DashMap::new(),
            cache_generation: AtomicU64::new(0),
            overrides: DashMap::new(),
            change_log,
        }
    }

    /// Whether the user belongs to a configured admin group.
    pub fn is_admin_group_member(&self, user: &UserContext) -> bool {
        user.in_any_group(&self.admin_groups)
    }

    /// Seed the default roles when no roles exist. Returns how many were created.
    pub async fn ensure_default_roles(&self) -> Result<usize> {
        let defaults = default_roles(&self.admin_groups);

        let created = with_transaction(&self.db_path, move |conn| {
            if count_roles(conn)? > 0 {
                return Ok(Vec::new());
            }
            defaults
                .iter()
                .map(|req| create_role(conn, req))
                .collect::<Result<Vec<_>>>()
        })
        .await?;

        for role in &created {
            self.change_log.record(ChangeLogEntry::new(
                EntityType::AppRole,
                &role.id,
                "create",
                "system",
            ));
        }

        if !created.is_empty() {
            self.invalidate_cache();
            info!(count = created.len(), "Seeded default roles");
        }
        Ok(created.len())
    }

    pub async fn get_role(&self, id: &str) -> Result<Option<AppRole>> {
        let id = id.to_string();
        with_connection(&self.db_path, move |conn| get_role(conn, &id)).await
    }

    pub async fn list_roles(&self) -> Result<Vec<AppRole>> {
        with_connection(&self.db_path, list_roles).await
    }

    pub async fn create_role(&self, req: AppRoleRequest, user: &UserContext) -> Result<AppRole> {
        self.check_permission(user, features::SETTINGS, FeatureAccessLevel::ReadWrite)
            .await?;

        let role = with_connection(&self.db_path, move |conn| create_role(conn, &req)).await?;

        self.invalidate_cache();
        self.change_log.record(
            ChangeLogEntry::new(EntityType::AppRole, &role.id, "create", &user.username)
                .with_details(serde_json::json!({ "name": role.name })),
        );
        info!(role = %role.name, "Created role");
        Ok(role)
    }

    pub async fn update_role(
        &self,
        id: &str,
        req: AppRoleRequest,
        user: &UserContext,
    ) -> Result<AppRole> {
        self.check_permission(user, features::SETTINGS, FeatureAccessLevel::ReadWrite)
            .await?;

        let id_owned = id.to_string();
        let role =
            with_connection(&self.db_path, move |conn| update_role(conn, &id_owned, &req)).await?;

        self.invalidate_cache();
        self.change_log.record(ChangeLogEntry::new(
            EntityType::AppRole,
            id,
            "update",
            &user.username,
        ));
        info!(role = %role.name, "Updated role");
        Ok(role)
    }

    /// Delete a role. Overrides pointing at it are dropped.
    pub async fn delete_role(&self, id: &str, user: &UserContext) -> Result<()> {
        self.check_permission(user, features::SETTINGS, FeatureAccessLevel::Admin)
            .await?;

        let id_owned = id.to_string();
        let deleted = with_connection(&self.db_path, move |conn| delete_role(conn, &id_owned)).await?;
        if !deleted {
            return Err(StewardError::NotFound(format!("Role {}", id)));
        }

        self.overrides.retain(|_, role_id| role_id != id);
        self.invalidate_cache();
        self.change_log.record(ChangeLogEntry::new(
            EntityType::AppRole,
            id,
            "delete",
            &user.username,
        ));
        info!(role_id = %id, "Deleted role");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Role overrides
    // -------------------------------------------------------------------------

    /// Make `username` act with exactly the permissions of `role_id`.
    pub async fn set_role_override(&self, username: &str, role_id: &str) -> Result<()> {
        if self.get_role(role_id).await?.is_none() {
            return Err(StewardError::NotFound(format!("Role {}", role_id)));
        }
        self.overrides
            .insert(username.to_string(), role_id.to_string());
        info!(username, role_id, "Applied role override");
        Ok(())
    }

    /// Remove a user's override. Returns whether one was set.
    pub fn clear_role_override(&self, username: &str) -> bool {
        let removed = self.overrides.remove(username).is_some();
        if removed {
            info!(username, "Cleared role override");
        }
        removed
    }

    pub fn role_override(&self, username: &str) -> Option<String> {
        self.overrides.get(username).map(|r| r.value().clone())
    }

    // -------------------------------------------------------------------------
    // Resolution
    // -------------------------------------------------------------------------

    /// Effective permissions for `user`, with every known feature present.
    pub async fn effective_permissions(&self, user: &UserContext) -> Result<FeaturePermissions> {
        if let Some(role_id) = self.role_override(&user.username) {
            match self.get_role(&role_id).await? {
                Some(role) => {
                    debug!(username = %user.username, role = %role.name, "Using role override");
                    return Ok(role_permissions(&role));
                }
                None => {
                    warn!(username = %user.username, role_id = %role_id, "Override role vanished, clearing");
                    self.overrides.remove(&user.username);
                }
            }
        }

        if self.is_admin_group_member(user) {
            return Ok(uniform_permissions(FeatureAccessLevel::Admin));
        }

        let key = group_cache_key(&user.groups);
        let cached = self
            .cache
            .get(&key)
            .map(|c| (c.permissions.clone(), c.cached_at));
        if let Some((permissions, cached_at)) = cached {
            if cached_at.elapsed() < self.cache_ttl {
                debug!("Permission cache hit");
                return Ok(permissions);
            }
            self.cache.remove(&key);
        }

        let generation = self.cache_generation.load(Ordering::Acquire);
        let roles = self.list_roles().await?;
        let permissions = merge_role_permissions(&roles, &user.groups);

        self.store_cached(key, permissions.clone(), generation);
        Ok(permissions)
    }

    /// Cache `permissions` computed from roles read at `generation`. Dropped if
    /// the cache was invalidated since then.
    fn store_cached(&self, key: String, permissions: FeaturePermissions, generation: u64) {
        if self.cache_generation.load(Ordering::Acquire) != generation {
            debug!("Roles changed during lookup, not caching");
            return;
        }
        self.cache.insert(
            key.clone(),
            CachedPermissions {
                permissions,
                cached_at: Instant::now(),
            },
        );
        // An invalidation may have landed between the check and the insert
        if self.cache_generation.load(Ordering::Acquire) != generation {
            self.cache.remove(&key);
        }
    }

    /// Effective level on a single feature.
    pub async fn access_level(
        &self,
        user: &UserContext,
        feature: &str,
    ) -> Result<FeatureAccessLevel> {
        let permissions = self.effective_permissions(user).await?;
        Ok(permissions.get(feature).copied().unwrap_or_default())
    }

    /// `Forbidden` unless `user` has at least `required` on `feature`.
    pub async fn check_permission(
        &self,
        user: &UserContext,
        feature: &str,
        required: FeatureAccessLevel,
    ) -> Result<()> {
        let level = self.access_level(user, feature).await?;
        if level >= required {
            Ok(())
        } else {
            debug!(username = %user.username, feature, %level, %required, "Permission denied");
            Err(StewardError::Forbidden(format!(
                "{} requires {} on {} (has {})",
                user.username, required, feature, level
            )))
        }
    }

    pub fn invalidate_cache(&self) {
        self.cache_generation.fetch_add(1, Ordering::AcqRel);
        self.cache.clear();
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_log::MemoryChangeLog;
    use FeatureAccessLevel::{Admin, Full, ReadOnly, ReadWrite};

    fn role(name: &str, groups: &[&str], perms: &[(&str, FeatureAccessLevel)]) -> AppRole {
        AppRole {
            id: name.to_lowercase(),
            name: name.to_string(),
            description: None,
            assigned_groups: groups.iter().map(|g| g.to_string()).collect(),
            feature_permissions: perms.iter().map(|(f, l)| (f.to_string(), *l)).collect(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn groups(names: &[&str]) -> Vec<String> {
        names.iter().map(|g| g.to_string()).collect()
    }

    async fn setup() -> (tempfile::TempDir, AuthorizationManager, Arc<MemoryChangeLog>) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("authz.db");
        {
            let conn = steward_core::open_connection(&db_path).unwrap();
            steward_core::init_store(&conn, true).unwrap();
        }
        let config = StewardConfig::default().with_db_path(db_path.to_string_lossy());
        let log = Arc::new(MemoryChangeLog::new());
        let manager = AuthorizationManager::new(&config, log.clone());
        (dir, manager, log)
    }

    #[test]
    fn test_merge_takes_highest_level() {
        let roles = vec![
            role("Reader", &["analysts"], &[(features::DATA_PRODUCTS, ReadOnly)]),
            role(
                "Writer",
                &["engineers"],
                &[(features::DATA_PRODUCTS, ReadWrite), (features::COSTS, ReadOnly)],
            ),
            role("Unrelated", &["finance"], &[(features::COSTS, Admin)]),
        ];

        let merged = merge_role_permissions(&roles, &groups(&["analysts", "engineers"]));
        assert_eq!(merged[features::DATA_PRODUCTS], ReadWrite);
        assert_eq!(merged[features::COSTS], ReadOnly);
        assert_eq!(merged[features::SETTINGS], FeatureAccessLevel::None);
        assert_eq!(merged.len(), features::ALL.len());
    }

    #[test]
    fn test_merge_without_matching_groups_is_none() {
        let roles = vec![role("Reader", &["analysts"], &[(features::SEARCH, ReadOnly)])];
        let merged = merge_role_permissions(&roles, &groups(&["guests"]));
        assert!(merged.values().all(|l| *l == FeatureAccessLevel::None));
    }

    #[test]
    fn test_has_permission() {
        let perms = merge_role_permissions(
            &[role("R", &["g"], &[(features::COMMENTS, ReadWrite)])],
            &groups(&["g"]),
        );
        assert!(has_permission(&perms, features::COMMENTS, ReadOnly));
        assert!(has_permission(&perms, features::COMMENTS, ReadWrite));
        assert!(!has_permission(&perms, features::COMMENTS, Admin));
        assert!(!has_permission(&perms, "unknown-feature", ReadOnly));
    }

    #[test]
    fn test_group_cache_key_is_order_insensitive() {
        assert_eq!(
            group_cache_key(&groups(&["b", "a", "b"])),
            group_cache_key(&groups(&["a", "b"]))
        );
    }

    #[test]
    fn test_validate_role_rejects_unknown_feature() {
        let req = AppRoleRequest {
            name: "Bad".to_string(),
            description: None,
            assigned_groups: vec!["".to_string()],
            feature_permissions: [("time-travel".to_string(), Admin)].into_iter().collect(),
        };
        let errors = validate_role(&req);
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.field == "assigned_groups[0]"));
        assert!(errors.iter().any(|e| e.field == "feature_permissions.time-travel"));
    }

    #[test]
    fn test_role_repository_round_trip() {
        let conn = Connection::open_in_memory().unwrap();
        steward_core::init_store(&conn, true).unwrap();

        let req = AppRoleRequest {
            name: "Auditor".to_string(),
            description: Some("Reads costs".to_string()),
            assigned_groups: vec!["audit".to_string()],
            feature_permissions: [(features::COSTS.to_string(), ReadOnly)].into_iter().collect(),
        };
        let created = create_role(&conn, &req).unwrap();

        let fetched = get_role_by_name(&conn, "Auditor").unwrap().unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.level_for(features::COSTS), ReadOnly);
        assert_eq!(fetched.level_for(features::SETTINGS), FeatureAccessLevel::None);

        // Duplicate names conflict
        assert!(matches!(
            create_role(&conn, &req),
            Err(StewardError::ConflictError(_))
        ));

        let mut changed = req.clone();
        changed.feature_permissions.insert(features::COSTS.to_string(), Full);
        let updated = update_role(&conn, &created.id, &changed).unwrap();
        assert_eq!(updated.level_for(features::COSTS), Full);

        assert!(matches!(
            update_role(&conn, "missing", &changed),
            Err(StewardError::NotFound(_))
        ));

        assert!(delete_role(&conn, &created.id).unwrap());
        assert!(!delete_role(&conn, &created.id).unwrap());
    }

    #[tokio::test]
    async fn test_ensure_default_roles_is_idempotent() {
        let (_dir, manager, log) = setup().await;

        assert_eq!(manager.ensure_default_roles().await.unwrap(), 4);
        assert_eq!(manager.ensure_default_roles().await.unwrap(), 0);

        let roles = manager.list_roles().await.unwrap();
        assert_eq!(roles.len(), 4);
        assert_eq!(log.len(), 4);
    }

    #[tokio::test]
    async fn test_effective_permissions_from_groups() {
        let (_dir, manager, _log) = setup().await;
        manager.ensure_default_roles().await.unwrap();

        let consumer = UserContext::new("carol", ["data-consumers"]);
        let perms = manager.effective_permissions(&consumer).await.unwrap();
        assert_eq!(perms[features::DATA_PRODUCTS], ReadOnly);
        assert_eq!(perms[features::COSTS], FeatureAccessLevel::None);

        let both = UserContext::new("dave", ["data-consumers", "data-producers"]);
        let perms = manager.effective_permissions(&both).await.unwrap();
        assert_eq!(perms[features::DATA_PRODUCTS], ReadWrite);
        assert_eq!(perms[features::COSTS], ReadOnly);
    }

    #[tokio::test]
    async fn test_admin_group_gets_admin_everywhere() {
        let (_dir, manager, _log) = setup().await;

        let admin = UserContext::new("root", ["admins"]);
        let perms = manager.effective_permissions(&admin).await.unwrap();
        assert!(perms.values().all(|l| *l == Admin));
    }

    #[tokio::test]
    async fn test_role_override_replaces_group_permissions() {
        let (_dir, manager, _log) = setup().await;
        manager.ensure_default_roles().await.unwrap();

        let consumer_role = manager
            .list_roles()
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.name == "Data Consumer")
            .unwrap();

        let admin = UserContext::new("root", ["admins"]);
        manager
            .set_role_override("root", &consumer_role.id)
            .await
            .unwrap();

        let perms = manager.effective_permissions(&admin).await.unwrap();
        assert_eq!(perms[features::SETTINGS], FeatureAccessLevel::None);
        assert_eq!(perms[features::DATA_PRODUCTS], ReadOnly);

        assert!(manager.clear_role_override("root"));
        let perms = manager.effective_permissions(&admin).await.unwrap();
        assert_eq!(perms[features::SETTINGS], Admin);
    }

    #[tokio::test]
    async fn test_override_requires_existing_role() {
        let (_dir, manager, _log) = setup().await;
        assert!(matches!(
            manager.set_role_override("someone", "no-such-role").await,
            Err(StewardError::NotFound(_))
        ));
        assert!(manager.role_override("someone").is_none());
    }

    #[tokio::test]
    async fn test_role_write_invalidates_cache() {
        let (_dir, manager, _log) = setup().await;
        manager.ensure_default_roles().await.unwrap();

        let analyst = UserContext::new("erin", ["analysts"]);
        let perms = manager.effective_permissions(&analyst).await.unwrap();
        assert_eq!(perms[features::COSTS], FeatureAccessLevel::None);
        assert_eq!(manager.cache_len(), 1);

        let admin = UserContext::new("root", ["admins"]);
        manager
            .create_role(
                AppRoleRequest {
                    name: "Cost Analyst".to_string(),
                    description: None,
                    assigned_groups: vec!["analysts".to_string()],
                    feature_permissions: [(features::COSTS.to_string(), ReadOnly)]
                        .into_iter()
                        .collect(),
                },
                &admin,
            )
            .await
            .unwrap();

        assert_eq!(manager.cache_len(), 0);
        let perms = manager.effective_permissions(&analyst).await.unwrap();
        assert_eq!(perms[features::COSTS], ReadOnly);
    }

    #[tokio::test]
    async fn test_lookup_straddling_invalidation_is_not_cached() {
        let (_dir, manager, _log) = setup().await;
        manager.ensure_default_roles().await.unwrap();

        let analyst = UserContext::new("erin", ["analysts"]);
        let key = group_cache_key(&analyst.groups);

        // Roles read before a concurrent role write
        let generation = manager.cache_generation.load(Ordering::Acquire);
        let stale = merge_role_permissions(&manager.list_roles().await.unwrap(), &analyst.groups);
        manager.invalidate_cache();
        manager.store_cached(key.clone(), stale.clone(), generation);
        assert_eq!(manager.cache_len(), 0);

        // Current generation caches normally
        let generation = manager.cache_generation.load(Ordering::Acquire);
        manager.store_cached(key, stale, generation);
        assert_eq!(manager.cache_len(), 1);
    }

    #[tokio::test]
    async fn test_role_writes_require_settings_permission() {
        let (_dir, manager, _log) = setup().await;
        manager.ensure_default_roles().await.unwrap();

        let steward = UserContext::new("sam", ["data-stewards"]);
        let result = manager
            .create_role(
                AppRoleRequest {
                    name: "Sneaky".to_string(),
                    description: None,
                    assigned_groups: vec!["data-stewards".to_string()],
                    feature_permissions: uniform_permissions(Admin),
                },
                &steward,
            )
            .await;
        assert!(matches!(result, Err(StewardError::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_delete_role_drops_overrides() {
        let (_dir, manager, _log) = setup().await;
        manager.ensure_default_roles().await.unwrap();
        let admin = UserContext::new("root", ["admins"]);

        let role = manager
            .create_role(
                AppRoleRequest {
                    name: "Temp".to_string(),
                    description: None,
                    assigned_groups: vec![],
                    feature_permissions: FeaturePermissions::new(),
                },
                &admin,
            )
            .await
            .unwrap();
        manager.set_role_override("frank", &role.id).await.unwrap();

        manager.delete_role(&role.id, &admin).await.unwrap();
        assert!(manager.role_override("frank").is_none());
        assert!(matches!(
            manager.delete_role(&role.id, &admin).await,
            Err(StewardError::NotFound(_))
        ));
    }
}
