//! In-memory SQLite recon database behind the same `Any` pool the binary uses.
//!
//! SQLite has no stored procedures, so the eligible-bond and flag
//! statements are plain SQL over the same tables.

use bond_rate_sync::config::DatabaseConfig;
use bond_rate_sync::database::SqlRateStore;
use sqlx::Row;

const SCHEMA: &[&str] = &[
    "CREATE TABLE eligible_bonds (bond TEXT NOT NULL, as_of_date TEXT NOT NULL)",
    "CREATE TABLE rerate_recon (
        bond TEXT NOT NULL,
        as_of_date TEXT NOT NULL,
        book_rate REAL NOT NULL,
        api_rate REAL,
        cpn_effective_date TEXT,
        rerate_flag INTEGER NOT NULL DEFAULT 0
    )",
];

pub fn sqlite_config(write_chunk_size: usize) -> DatabaseConfig {
    DatabaseConfig {
        connection_profiles: "sqlite::memory:".to_string(),
        eligible_securities_statement:
            "SELECT bond FROM eligible_bonds WHERE as_of_date = ? ORDER BY bond".to_string(),
        rerate_flag_statement: "UPDATE rerate_recon SET rerate_flag = 1 \
             WHERE api_rate IS NOT NULL AND api_rate <> book_rate"
            .to_string(),
        recon_table: "rerate_recon".to_string(),
        acquire_timeout_secs: 5,
        write_chunk_size,
    }
}

/// Fresh store with an empty schema.
pub async fn init_test_store(write_chunk_size: usize) -> SqlRateStore {
    let store = SqlRateStore::connect(&sqlite_config(write_chunk_size))
        .await
        .expect("Failed to open in-memory database");
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(store.pool())
            .await
            .expect("Failed to create schema");
    }
    store
}

/// One eligible bond plus its recon row at `book_rate`.
pub async fn insert_recon_row(store: &SqlRateStore, bond: &str, as_of: &str, book_rate: f64) {
    sqlx::query("INSERT INTO eligible_bonds (bond, as_of_date) VALUES (?, ?)")
        .bind(bond)
        .bind(as_of)
        .execute(store.pool())
        .await
        .expect("Failed to insert eligible bond");
    sqlx::query("INSERT INTO rerate_recon (bond, as_of_date, book_rate) VALUES (?, ?, ?)")
        .bind(bond)
        .bind(as_of)
        .bind(book_rate)
        .execute(store.pool())
        .await
        .expect("Failed to insert recon row");
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconState {
    pub bond: String,
    pub api_rate: Option<f64>,
    pub cpn_effective_date: Option<String>,
    pub rerate_flag: i64,
}

pub async fn recon_rows(store: &SqlRateStore, as_of: &str) -> Vec<ReconState> {
    sqlx::query(
        "SELECT bond, api_rate, cpn_effective_date, rerate_flag FROM rerate_recon \
         WHERE as_of_date = ? ORDER BY bond",
    )
    .bind(as_of)
    .fetch_all(store.pool())
    .await
    .expect("Failed to read recon rows")
    .iter()
    .map(|row| ReconState {
        bond: row.get("bond"),
        api_rate: row.get("api_rate"),
        cpn_effective_date: row.get("cpn_effective_date"),
        rerate_flag: row.get("rerate_flag"),
    })
    .collect()
}
