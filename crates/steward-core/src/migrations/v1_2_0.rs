//! Migration v1.2.0: Semantic Links and Cost Tracking.
//!
//! - `semantic_links` ties an entity to an ontology concept IRI
//! - `cost_items` records monthly cost lines per entity, in integer cents

use super::Migration;

pub const VERSION: i64 = 1_002_000;

const ADD_COLUMNS: &[(&str, &str, &str)] = &[];

pub fn migration() -> Migration {
    Migration {
        version: VERSION,
        description: "v1.2.0: Semantic links and cost items",
        sql: SQL,
        add_columns: ADD_COLUMNS,
    }
}

const SQL: &str = r#"
CREATE TABLE IF NOT EXISTS semantic_links (
    id TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    iri TEXT NOT NULL,
    label TEXT,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(entity_type, entity_id, iri)
);

CREATE INDEX IF NOT EXISTS idx_semantic_links_entity ON semantic_links(entity_type, entity_id);
CREATE INDEX IF NOT EXISTS idx_semantic_links_iri ON semantic_links(iri);

CREATE TABLE IF NOT EXISTS cost_items (
    id TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT,
    cost_center TEXT NOT NULL,
    custom_center_name TEXT,
    amount_cents INTEGER NOT NULL CHECK (amount_cents >= 0),
    currency TEXT NOT NULL,
    start_month TEXT NOT NULL,       -- YYYY-MM
    end_month TEXT,                  -- YYYY-MM, NULL = ongoing
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cost_items_entity ON cost_items(entity_type, entity_id);
"#;
