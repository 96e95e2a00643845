//! Projects
//!
//! Team and personal workspaces. A personal project belongs to its owner
//! alone; team projects carry a member list that always includes the owner.

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
use tracing::info;

use crate::authorization::UserContext;
use crate::change_log::{ChangeLog, ChangeLogEntry};
use crate::search::{SearchIndexItem, Searchable};
use crate::{new_id, with_connection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
    Personal,
    #[default]
    Team,
}

impl ProjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectType::Personal => "personal",
            ProjectType::Team => "team",
        }
    }
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectType {
    type Err = StewardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "personal" => Ok(ProjectType::Personal),
            "team" => Ok(ProjectType::Team),
            other => Err(StewardError::ValidationError(format!(
                "Unknown project type '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub project_type: ProjectType,
    pub owner: String,
    pub team_members: Vec<String>,
    pub tags: Vec<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn is_member(&self, username: &str) -> bool {
        self.owner == username || self.team_members.iter().any(|m| m == username)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectRequest {
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub project_type: ProjectType,
    /// Defaults to the creating user
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub team_members: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

pub fn validate_project(req: &ProjectRequest) -> Vec<FieldError> {
    let mut errors = Vec::new();
    if let Err(e) = validation::validate_name(&req.name, "Project name") {
        errors.push(FieldError::new("name", e.to_string()));
    }
    if let Err(e) = validation::validate_tags(&req.tags) {
        errors.push(FieldError::new("tags", e.to_string()));
    }
    if let Some(owner) = &req.owner {
        if owner.trim().is_empty() {
            errors.push(FieldError::new("owner", "Owner cannot be empty"));
        }
    }
    for (i, member) in req.team_members.iter().enumerate() {
        if member.trim().is_empty() {
            errors.push(FieldError::new(
                format!("team_members[{}]", i),
                "Member cannot be empty",
            ));
        }
    }
    errors
}

/// Personal projects accept no member other than their owner.
fn check_personal_members(project_type: ProjectType, owner: &str, members: &[String]) -> Result<()> {
    if project_type == ProjectType::Personal && members.iter().any(|m| m != owner) {
        return Err(StewardError::ValidationError(
            "Personal projects cannot have team members".to_string(),
        ));
    }
    Ok(())
}

/// Member list as stored: owner first, no duplicates; personal projects hold only the owner.
fn normalize_members(project_type: ProjectType, owner: &str, members: &[String]) -> Vec<String> {
    let mut normalized = vec![owner.to_string()];
    if project_type == ProjectType::Team {
        for m in members {
            if !normalized.contains(m) {
                normalized.push(m.clone());
            }
        }
    }
    normalized
}

// =============================================================================
// Database Operations
// =============================================================================

const PROJECT_COLUMNS: &str = "id, name, title, description, project_type, owner, team_members, tags, created_by, created_at, updated_at";

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    let project_type: String = row.get(4)?;
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        project_type: project_type.parse().unwrap_or_default(),
        owner: row.get(5)?,
        team_members: decode_list(row.get(6)?),
        tags: decode_list(row.get(7)?),
        created_by: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

pub fn create_project(conn: &Connection, req: &ProjectRequest, created_by: &str) -> Result<Project> {
    validation::into_result(validate_project(req))?;

    let owner = req.owner.clone().unwrap_or_else(|| created_by.to_string());
    check_personal_members(req.project_type, &owner, &req.team_members)?;

    let now = Utc::now();
    let project = Project {
        id: new_id(),
        name: req.name.clone(),
        title: req.title.clone(),
        description: req.description.clone(),
        project_type: req.project_type,
        team_members: normalize_members(req.project_type, &owner, &req.team_members),
        owner,
        tags: req.tags.clone(),
        created_by: created_by.to_string(),
        created_at: now,
        updated_at: now,
    };

    conn.execute(
        "INSERT INTO projects (id, name, title, description, project_type, owner, team_members, tags, created_by, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        rusqlite::params![
            project.id,
            project.name,
            project.title,
            project.description,
            project.project_type.as_str(),
            project.owner,
            encode_list(&project.team_members)?,
            encode_list(&project.tags)?,
            project.created_by,
            project.created_at,
            project.updated_at,
        ],
    )
    .map_err(|e| conflict_on_unique(e, format!("Project '{}' already exists", project.name)))?;

    Ok(project)
}

pub fn get_project(conn: &Connection, id: &str) -> Result<Option<Project>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS),
            [id],
            project_from_row,
        )
        .optional()?)
}

fn require_project(conn: &Connection, id: &str) -> Result<Project> {
    get_project(conn, id)?.ok_or_else(|| StewardError::NotFound(format!("Project {}", id)))
}

pub fn list_projects(conn: &Connection) -> Result<Vec<Project>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM projects ORDER BY name",
        PROJECT_COLUMNS
    ))?;
    let projects = stmt
        .query_map([], project_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(projects)
}

/// Projects the user owns or belongs to.
pub fn list_projects_for_user(conn: &Connection, username: &str) -> Result<Vec<Project>> {
    Ok(list_projects(conn)?
        .into_iter()
        .filter(|p| p.is_member(username))
        .collect())
}

pub fn update_project(conn: &Connection, id: &str, req: &ProjectRequest) -> Result<Project> {
    validation::into_result(validate_project(req))?;
    let existing = require_project(conn, id)?;

    let owner = req.owner.clone().unwrap_or(existing.owner);
    check_personal_members(req.project_type, &owner, &req.team_members)?;
    let members = normalize_members(req.project_type, &owner, &req.team_members);

    conn.execute(
        "UPDATE projects
         SET name = ?1, title = ?2, description = ?3, project_type = ?4, owner = ?5,
             team_members = ?6, tags = ?7, updated_at = ?8
         WHERE id = ?9",
        rusqlite::params![
            req.name,
            req.title,
            req.description,
            req.project_type.as_str(),
            owner,
            encode_list(&members)?,
            encode_list(&req.tags)?,
            Utc::now(),
            id,
        ],
    )
    .map_err(|e| conflict_on_unique(e, format!("Project '{}' already exists", req.name)))?;

    require_project(conn, id)
}

pub fn delete_project(conn: &Connection, id: &str) -> Result<()> {
    let rows = conn.execute("DELETE FROM projects WHERE id = ?1", [id])?;
    if rows == 0 {
        return Err(StewardError::NotFound(format!("Project {}", id)));
    }
    Ok(())
}

fn store_members(conn: &Connection, id: &str, members: &[String]) -> Result<()> {
    conn.execute(
        "UPDATE projects SET team_members = ?1, updated_at = ?2 WHERE id = ?3",
        rusqlite::params![encode_list(members)?, Utc::now(), id],
    )?;
    Ok(())
}

/// Add a member. Adding an existing member is a no-op.
pub fn add_member(conn: &Connection, id: &str, username: &str) -> Result<Project> {
    if username.trim().is_empty() {
        return Err(StewardError::ValidationError(
            "Member cannot be empty".to_string(),
        ));
    }
    let mut project = require_project(conn, id)?;
    if project.is_member(username) {
        return Ok(project);
    }
    if project.project_type == ProjectType::Personal {
        return Err(StewardError::ValidationError(
            "Personal projects cannot have team members".to_string(),
        ));
    }

    project.team_members.push(username.to_string());
    store_members(conn, id, &project.team_members)?;
    require_project(conn, id)
}

/// Remove a member. The owner cannot be removed.
pub fn remove_member(conn: &Connection, id: &str, username: &str) -> Result<Project> {
    let mut project = require_project(conn, id)?;
    if project.owner == username {
        return Err(StewardError::ValidationError(format!(
            "Cannot remove owner {} from project",
            username
        )));
    }
    let before = project.team_members.len();
    project.team_members.retain(|m| m != username);
    if project.team_members.len() == before {
        return Err(StewardError::NotFound(format!(
            "{} is not a member of project {}",
            username, id
        )));
    }
    store_members(conn, id, &project.team_members)?;
    require_project(conn, id)
}

fn search_item(project: &Project) -> SearchIndexItem {
    SearchIndexItem {
        id: project.id.clone(),
        item_type: "project".to_string(),
        title: project.title.clone().unwrap_or_else(|| project.name.clone()),
        description: project.description.clone().unwrap_or_default(),
        link: format!("/projects/{}", project.id),
        tags: project.tags.clone(),
        feature_id: features::PROJECTS.to_string(),
    }
}

// =============================================================================
// Manager
// =============================================================================

pub struct ProjectManager {
    db_path: String,
    change_log: Arc<dyn ChangeLog>,
}

impl ProjectManager {
    pub fn new(db_path: impl Into<String>, change_log: Arc<dyn ChangeLog>) -> Self {
        Self {
            db_path: db_path.into(),
            change_log,
        }
    }

    fn record(&self, id: &str, action: &str, user: &UserContext) {
        self.change_log
            .record(ChangeLogEntry::new(EntityType::Project, id, action, &user.username));
    }

    pub async fn create(&self, req: ProjectRequest, user: &UserContext) -> Result<Project> {
        let username = user.username.clone();
        let project =
            with_connection(&self.db_path, move |conn| create_project(conn, &req, &username))
                .await?;
        self.record(&project.id, "create", user);
        info!(project = %project.name, project_type = %project.project_type, "Created project");
        Ok(project)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Project>> {
        let id = id.to_string();
        with_connection(&self.db_path, move |conn| get_project(conn, &id)).await
    }

    pub async fn list(&self) -> Result<Vec<Project>> {
        with_connection(&self.db_path, list_projects).await
    }

    pub async fn list_for_user(&self, username: &str) -> Result<Vec<Project>> {
        let username = username.to_string();
        with_connection(&self.db_path, move |conn| {
            list_projects_for_user(conn, &username)
        })
        .await
    }

    pub async fn update(&self, id: &str, req: ProjectRequest, user: &UserContext) -> Result<Project> {
        let id_owned = id.to_string();
        let project =
            with_connection(&self.db_path, move |conn| update_project(conn, &id_owned, &req))
                .await?;
        self.record(id, "update", user);
        Ok(project)
    }

    pub async fn delete(&self, id: &str, user: &UserContext) -> Result<()> {
        let id_owned = id.to_string();
        with_connection(&self.db_path, move |conn| delete_project(conn, &id_owned)).await?;
        self.record(id, "delete", user);
        info!(project_id = %id, "Deleted project");
        Ok(())
    }

    pub async fn add_member(&self, id: &str, member: &str, user: &UserContext) -> Result<Project> {
        let (id_owned, member_owned) = (id.to_string(), member.to_string());
        let project = with_connection(&self.db_path, move |conn| {
            add_member(conn, &id_owned, &member_owned)
        })
        .await?;
        self.change_log.record(
            ChangeLogEntry::new(EntityType::Project, id, "member.add", &user.username)
                .with_details(serde_json::json!({ "member": member })),
        );
        Ok(project)
    }

    pub async fn remove_member(
        &self,
        id: &str,
        member: &str,
        user: &UserContext,
    ) -> Result<Project> {
        let (id_owned, member_owned) = (id.to_string(), member.to_string());
        let project = with_connection(&self.db_path, move |conn| {
            remove_member(conn, &id_owned, &member_owned)
        })
        .await?;
        self.change_log.record(
            ChangeLogEntry::new(EntityType::Project, id, "member.remove", &user.username)
                .with_details(serde_json::json!({ "member": member })),
        );
        Ok(project)
    }
}

impl Searchable for ProjectManager {
    fn source_name(&self) -> &'static str {
        "projects"
    }

    fn search_index_items(&self, conn: &Connection) -> Result<Vec<SearchIndexItem>> {
        Ok(list_projects(conn)?.iter().map(search_item).collect())
    }
}
