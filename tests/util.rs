#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::sync::Mutex;

use cfg_migrate::bundle::{Bundle, ColumnValue, Record};
use cfg_migrate::config::rules_framework_manifest;
use cfg_migrate::migrate::apply_migrations;
use cfg_migrate::{CacheSignal, MigrationContext, SqliteStore};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

pub async fn temp_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("connect sqlite::memory:");
    sqlx::query("PRAGMA foreign_keys=ON;")
        .execute(&pool)
        .await
        .unwrap();
    pool
}

/// In-memory database with the engine schema applied.
pub async fn migrated_store() -> SqliteStore {
    let pool = temp_pool().await;
    apply_migrations(&pool).await.expect("apply migrations");
    SqliteStore::new(pool)
}

pub async fn count(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn id_of(pool: &SqlitePool, table: &str, code: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT id FROM {table} WHERE c_code = ?"))
        .bind(code)
        .fetch_one(pool)
        .await
        .unwrap()
}

pub fn workflow(code: &str) -> Record {
    Record::new("rf_workflow")
        .with("c_code", code)
        .with("c_name", "Approval")
        .with("c_start_state", ColumnValue::Null)
}

pub fn state(code: &str, parent: &str) -> Record {
    Record::new("rf_state")
        .with("c_code", code)
        .with("c_name", "Draft")
        .with("id_parent", parent)
}

/// A workflow plus one state whose parent is `parent`.
pub fn workflow_bundle(parent: &str) -> Bundle {
    Bundle::new(
        rules_framework_manifest(),
        vec![workflow("wf.approval"), state("wf.approval.draft", parent)],
        vec![],
    )
    .expect("valid bundle")
}

pub fn ctx() -> MigrationContext {
    MigrationContext::new("test-operator")
}

/// Cache collaborator that remembers every invalidated domain.
#[derive(Default)]
pub struct RecordingSignal {
    domains: Mutex<Vec<String>>,
}

impl RecordingSignal {
    pub fn domains(&self) -> Vec<String> {
        self.domains.lock().unwrap().clone()
    }
}

impl CacheSignal for RecordingSignal {
    fn invalidate(&self, domain: &str) {
        self.domains.lock().unwrap().push(domain.to_string());
    }
}
