//! Test Utilities Module
//!
//! Shared infrastructure for integration tests. Enable via the `test-utils`
//! feature flag.
//!
//! # Usage
//!
//! ```rust,ignore
//! use steward_services::test_utils::{TestSteward, TestUser};
//!
//! #[tokio::test]
//! async fn test_domain_creation() {
//!     let env = TestSteward::new().await.unwrap();
//!     let steward = TestUser::new("sam").group("data-stewards").build();
//!     env.steward().domains.create(request, &steward).await.unwrap();
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

use crate::authorization::UserContext;
use crate::change_log::MemoryChangeLog;
use crate::config::StewardConfig;
use crate::Steward;
use steward_core::{Result, StewardError};

// ============================================================================
// Test Database Infrastructure
// ============================================================================

/// A temporary store that is removed when dropped.
pub struct TestDb {
    _temp_dir: TempDir,
    db_path: PathBuf,
}

impl TestDb {
    /// Create an empty temporary store location.
    pub fn new() -> Result<Self> {
        let temp_dir = tempdir()
            .map_err(|e| StewardError::Other(format!("Failed to create temp dir: {}", e)))?;
        let db_path = temp_dir.path().join("steward_test.db");
        Ok(Self {
            _temp_dir: temp_dir,
            db_path,
        })
    }

    /// Create a temporary store with the full schema applied.
    pub fn initialized() -> Result<Self> {
        let db = Self::new()?;
        let conn = steward_core::open_connection(&db.db_path)?;
        steward_core::init_store(&conn, true)?;
        Ok(db)
    }

    pub fn path(&self) -> &std::path::Path {
        &self.db_path
    }

    pub fn path_string(&self) -> String {
        self.db_path.to_string_lossy().to_string()
    }

    /// Default config pointing at this store.
    pub fn config(&self) -> StewardConfig {
        StewardConfig::default().with_db_path(self.path_string())
    }
}

// ============================================================================
// Test Steward
// ============================================================================

/// A fully wired [`Steward`] on a temporary store with an in-memory change log.
pub struct TestSteward {
    _test_db: TestDb,
    steward: Steward,
    change_log: Arc<MemoryChangeLog>,
}

impl TestSteward {
    pub async fn new() -> Result<Self> {
        Self::with_config(|config| config).await
    }

    /// Like [`new`](Self::new), with a hook to adjust the config.
    pub async fn with_config<F>(adjust: F) -> Result<Self>
    where
        F: FnOnce(StewardConfig) -> StewardConfig,
    {
        let test_db = TestDb::new()?;
        let change_log = Arc::new(MemoryChangeLog::new());
        let steward = Steward::open(adjust(test_db.config()), change_log.clone()).await?;
        Ok(Self {
            _test_db: test_db,
            steward,
            change_log,
        })
    }

    pub fn steward(&self) -> &Steward {
        &self.steward
    }

    pub fn change_log(&self) -> &MemoryChangeLog {
        &self.change_log
    }
}

// ============================================================================
// Users
// ============================================================================

/// Builder for test callers.
pub struct TestUser {
    username: String,
    email: Option<String>,
    groups: Vec<String>,
}

impl TestUser {
    pub fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            email: None,
            groups: Vec::new(),
        }
    }

    pub fn email(mut self, email: &str) -> Self {
        self.email = Some(email.to_string());
        self
    }

    pub fn group(mut self, group: &str) -> Self {
        self.groups.push(group.to_string());
        self
    }

    pub fn build(self) -> UserContext {
        UserContext {
            username: self.username,
            email: self.email,
            groups: self.groups,
        }
    }
}

/// Member of the default admin group.
pub fn admin_user() -> UserContext {
    TestUser::new("admin").group("admins").build()
}

pub fn steward_user() -> UserContext {
    TestUser::new("steward").group("data-stewards").build()
}

pub fn producer_user() -> UserContext {
    TestUser::new("producer").group("data-producers").build()
}

pub fn consumer_user() -> UserContext {
    TestUser::new("consumer").group("data-consumers").build()
}
