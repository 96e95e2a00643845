//! Search
//!
//! An in-memory index built from every registered [`Searchable`] source and
//! queried with simple prefix/substring scoring. Results are filtered per
//! user through the [`AuthorizationManager`]: an item is only returned when
//! the caller has at least `read_only` on the item's feature.

use parking_lot::RwLock;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use steward_core::{validation, FeatureAccessLevel, Result, StewardError};
use tracing::{debug, info, warn};

use crate::authorization::{AuthorizationManager, UserContext};

/// One searchable entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchIndexItem {
    pub id: String,
    /// e.g. `data-product`
    #[serde(rename = "type")]
    pub item_type: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub link: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Feature gating visibility of this item
    pub feature_id: String,
}

/// A scored search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub item: SearchIndexItem,
    pub score: u32,
}

/// A producer of index items.
pub trait Searchable: Send + Sync {
    /// Name used in logs.
    fn source_name(&self) -> &'static str;

    fn search_index_items(&self, conn: &Connection) -> Result<Vec<SearchIndexItem>>;
}

// Scores, highest match wins
pub const SCORE_EXACT_TITLE: u32 = 100;
pub const SCORE_TITLE_PREFIX: u32 = 80;
pub const SCORE_TITLE_WORD_PREFIX: u32 = 60;
pub const SCORE_TAG_PREFIX: u32 = 40;
pub const SCORE_DESCRIPTION: u32 = 20;
pub const SCORE_TITLE_SUBSTRING: u32 = 10;

/// Score `item` against an already-normalized (trimmed, lowercased) query.
///
/// Returns `None` when nothing matches.
pub fn score_item(item: &SearchIndexItem, query: &str) -> Option<u32> {
    if query.is_empty() {
        return None;
    }

    let title = item.title.to_lowercase();

    if title == query {
        return Some(SCORE_EXACT_TITLE);
    }
    if title.starts_with(query) {
        return Some(SCORE_TITLE_PREFIX);
    }
    if title
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| !word.is_empty() && word.starts_with(query))
    {
        return Some(SCORE_TITLE_WORD_PREFIX);
    }
    if item
        .tags
        .iter()
        .any(|tag| tag.to_lowercase().starts_with(query))
    {
        return Some(SCORE_TAG_PREFIX);
    }
    if item.description.to_lowercase().contains(query) {
        return Some(SCORE_DESCRIPTION);
    }
    if title.contains(query) {
        return Some(SCORE_TITLE_SUBSTRING);
    }
    None
}

/// Builds and queries the search index.
pub struct SearchManager {
    db_path: String,
    authz: Arc<AuthorizationManager>,
    max_results: usize,
    sources: RwLock<Vec<Arc<dyn Searchable>>>,
    index: RwLock<Vec<SearchIndexItem>>,
}

impl SearchManager {
    pub fn new(
        db_path: impl Into<String>,
        authz: Arc<AuthorizationManager>,
        max_results: usize,
    ) -> Self {
        Self {
            db_path: db_path.into(),
            authz,
            max_results,
            sources: RwLock::new(Vec::new()),
            index: RwLock::new(Vec::new()),
        }
    }

    /// Add a source. Takes effect on the next [`build_index`](Self::build_index).
    pub fn register(&self, source: Arc<dyn Searchable>) {
        debug!(source = source.source_name(), "Registered search source");
        self.sources.write().push(source);
    }

    /// Rebuild the index from every source, replacing the previous one.
    ///
    /// A failing source is logged and skipped. Returns the number of items indexed.
    pub async fn build_index(&self) -> Result<usize> {
        let sources = self.sources.read().clone();
        let db_path = self.db_path.clone();

        let items = tokio::task::spawn_blocking(move || -> Result<Vec<SearchIndexItem>> {
            let conn = steward_core::open_connection(&db_path)?;
            let mut items = Vec::new();
            for source in &sources {
                match source.search_index_items(&conn) {
                    Ok(mut batch) => {
                        debug!(source = source.source_name(), count = batch.len(), "Indexed source");
                        items.append(&mut batch);
                    }
                    Err(e) => {
                        warn!(source = source.source_name(), error = %e, "Search source failed, skipping");
                    }
                }
            }
            Ok(items)
        })
        .await
        .map_err(|e| StewardError::Other(format!("Task join error: {}", e)))??;

        let count = items.len();
        *self.index.write() = items;
        info!(items = count, "Search index rebuilt");
        Ok(count)
    }

    pub fn index_len(&self) -> usize {
        self.index.read().len()
    }

    /// Search the index as `user`.
    pub async fn search(&self, query: &str, user: &UserContext) -> Result<Vec<SearchHit>> {
        let query = validation::normalize_search_query(query)?;
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits: Vec<SearchHit> = self
            .index
            .read()
            .iter()
            .filter_map(|item| {
                score_item(item, &query).map(|score| SearchHit {
                    item: item.clone(),
                    score,
                })
            })
            .collect();

        let permissions = self.authz.effective_permissions(user).await?;
        let before = hits.len();
        hits.retain(|hit| {
            permissions
                .get(&hit.item.feature_id)
                .copied()
                .unwrap_or_default()
                >= FeatureAccessLevel::ReadOnly
        });
        debug!(
            query = %query,
            matched = before,
            permitted = hits.len(),
            "Search executed"
        );

        hits.sort_by(|a, b| match b.score.cmp(&a.score) {
            Ordering::Equal => a.item.title.cmp(&b.item.title),
            other => other,
        });
        hits.truncate(self.max_results);
        Ok(hits)
    }
}
