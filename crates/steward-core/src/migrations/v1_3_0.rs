//! Migration v1.3.0: Project types and contract versioning.
//!
//! - `projects.project_type`: personal or team (existing projects become team)
//! - `data_contracts.parent_contract_id`: the contract a new version was cut from

use super::Migration;

pub const VERSION: i64 = 1_003_000;

const ADD_COLUMNS: &[(&str, &str, &str)] = &[
    ("projects", "project_type", "TEXT NOT NULL DEFAULT 'team'"),
    ("data_contracts", "parent_contract_id", "TEXT"),
];

pub fn migration() -> Migration {
    Migration {
        version: VERSION,
        description: "v1.3.0: Project types and contract versioning",
        sql: SQL,
        add_columns: ADD_COLUMNS,
    }
}

const SQL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_data_contracts_name ON data_contracts(name);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::run_migrations;
    use rusqlite::Connection;

    #[test]
    fn test_existing_projects_default_to_team() {
        let conn = Connection::open_in_memory().unwrap();
        crate::init_sqlite_schema(&conn).unwrap();
        conn.execute(
            "INSERT INTO projects (id, name, owner, created_by, created_at, updated_at)
             VALUES ('p1', 'legacy', 'alice', 'alice', datetime('now'), datetime('now'))",
            [],
        )
        .unwrap();

        run_migrations(&conn).unwrap();

        let project_type: String = conn
            .query_row("SELECT project_type FROM projects WHERE id = 'p1'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(project_type, "team");
    }
}
