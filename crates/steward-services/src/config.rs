//! Service configuration.

use steward_core::{Result, StewardError};

const DEFAULT_DB_PATH: &str = "steward.db";
const DEFAULT_ADMIN_GROUP: &str = "admins";
const DEFAULT_SEARCH_MAX_RESULTS: usize = 50;
const DEFAULT_PERMISSION_CACHE_TTL_SECS: u64 = 300;

/// Runtime configuration for the governance services.
#[derive(Debug, Clone)]
pub struct StewardConfig {
    /// Path to the SQLite store
    pub db_path: String,
    /// Groups whose members get `admin` on every feature
    pub admin_groups: Vec<String>,
    /// Upper bound on search hits returned per query
    pub search_max_results: usize,
    /// How long computed effective permissions are cached
    pub permission_cache_ttl_secs: u64,
    /// Apply pending migrations on startup
    pub run_migrations: bool,
}

impl Default for StewardConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            admin_groups: vec![DEFAULT_ADMIN_GROUP.to_string()],
            search_max_results: DEFAULT_SEARCH_MAX_RESULTS,
            permission_cache_ttl_secs: DEFAULT_PERMISSION_CACHE_TTL_SECS,
            run_migrations: true,
        }
    }
}

impl StewardConfig {
    /// Create config from environment variables.
    ///
    /// Reads:
    /// - `STEWARD_DB_PATH`: store location (default: `steward.db`)
    /// - `STEWARD_ADMIN_GROUPS`: comma-separated admin groups (default: `admins`)
    /// - `STEWARD_SEARCH_MAX_RESULTS`: max hits per search (default: 50)
    /// - `STEWARD_PERMISSION_CACHE_TTL_SECS`: permission cache TTL (default: 300)
    /// - `STEWARD_RUN_MIGRATIONS`: "false" to skip migrations on startup
    pub fn from_env() -> Self {
        let db_path =
            std::env::var("STEWARD_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());

        let admin_groups = std::env::var("STEWARD_ADMIN_GROUPS")
            .map(|v| parse_group_list(&v))
            .unwrap_or_else(|_| vec![DEFAULT_ADMIN_GROUP.to_string()]);

        let search_max_results = std::env::var("STEWARD_SEARCH_MAX_RESULTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_SEARCH_MAX_RESULTS);

        let permission_cache_ttl_secs = std::env::var("STEWARD_PERMISSION_CACHE_TTL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PERMISSION_CACHE_TTL_SECS);

        let run_migrations = std::env::var("STEWARD_RUN_MIGRATIONS")
            .map(|v| v.to_lowercase() != "false")
            .unwrap_or(true);

        Self {
            db_path,
            admin_groups,
            search_max_results,
            permission_cache_ttl_secs,
            run_migrations,
        }
    }

    /// Override the store path (CLI `--db` flag).
    pub fn with_db_path(mut self, db_path: impl Into<String>) -> Self {
        self.db_path = db_path.into();
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(StewardError::ValidationError(
                "STEWARD_DB_PATH cannot be empty".into(),
            ));
        }
        if self.search_max_results == 0 {
            return Err(StewardError::ValidationError(
                "STEWARD_SEARCH_MAX_RESULTS must be positive".into(),
            ));
        }
        if self.admin_groups.is_empty() {
            return Err(StewardError::ValidationError(
                "STEWARD_ADMIN_GROUPS must name at least one group".into(),
            ));
        }
        Ok(())
    }
}

fn parse_group_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "STEWARD_DB_PATH",
        "STEWARD_ADMIN_GROUPS",
        "STEWARD_SEARCH_MAX_RESULTS",
        "STEWARD_PERMISSION_CACHE_TTL_SECS",
        "STEWARD_RUN_MIGRATIONS",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_from_empty_env() {
        clear_env();
        let config = StewardConfig::from_env();
        assert_eq!(config.db_path, "steward.db");
        assert_eq!(config.admin_groups, vec!["admins"]);
        assert_eq!(config.search_max_results, 50);
        assert_eq!(config.permission_cache_ttl_secs, 300);
        assert!(config.run_migrations);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_reads_env_overrides() {
        clear_env();
        std::env::set_var("STEWARD_DB_PATH", "/tmp/gov.db");
        std::env::set_var("STEWARD_ADMIN_GROUPS", "platform-admins, data-governance ,");
        std::env::set_var("STEWARD_SEARCH_MAX_RESULTS", "10");
        std::env::set_var("STEWARD_RUN_MIGRATIONS", "FALSE");

        let config = StewardConfig::from_env();
        assert_eq!(config.db_path, "/tmp/gov.db");
        assert_eq!(config.admin_groups, vec!["platform-admins", "data-governance"]);
        assert_eq!(config.search_max_results, 10);
        assert!(!config.run_migrations);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_unparseable_numbers_fall_back() {
        clear_env();
        std::env::set_var("STEWARD_SEARCH_MAX_RESULTS", "lots");
        assert_eq!(StewardConfig::from_env().search_max_results, 50);
        clear_env();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = StewardConfig::default();
        config.search_max_results = 0;
        assert!(config.validate().is_err());

        let config = StewardConfig {
            admin_groups: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = StewardConfig::default().with_db_path("  ");
        assert!(config.validate().is_err());
    }
}
