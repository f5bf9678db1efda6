#![allow(clippy::unwrap_used, clippy::expect_used)]

mod util;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cfg_migrate::bundle::{ColumnValue, Values};
use cfg_migrate::codec;
use cfg_migrate::store::{SqliteTransaction, StoreError, StoreTransaction};
use cfg_migrate::{
    CacheSignal, ImportCoordinator, MigrationConfig, MigrationError, RulesFrameworkImport,
    SqliteStore, TargetStore, TransactionalStore,
};
use util::{count, ctx, migrated_store, workflow_bundle, RecordingSignal};

type Journal = Arc<Mutex<Vec<String>>>;

/// Store wrapper that journals transaction boundaries and can refuse inserts
/// into one table.
struct JournalStore {
    inner: SqliteStore,
    journal: Journal,
    fail_inserts_into: Option<&'static str>,
}

struct JournalTx {
    inner: SqliteTransaction,
    journal: Journal,
    fail_inserts_into: Option<&'static str>,
}

#[async_trait]
impl TransactionalStore for JournalStore {
    type Transaction = JournalTx;

    async fn begin(&self) -> Result<JournalTx, StoreError> {
        let inner = self.inner.begin().await?;
        self.journal.lock().unwrap().push("begin".into());
        Ok(JournalTx {
            inner,
            journal: Arc::clone(&self.journal),
            fail_inserts_into: self.fail_inserts_into,
        })
    }
}

#[async_trait]
impl TargetStore for JournalTx {
    async fn find_ids(
        &mut self,
        table: &str,
        column: &str,
        value: &ColumnValue,
    ) -> Result<Vec<i64>, StoreError> {
        self.inner.find_ids(table, column, value).await
    }

    async fn fetch_row(&mut self, table: &str, id: i64) -> Result<Option<Values>, StoreError> {
        self.inner.fetch_row(table, id).await
    }

    async fn fetch_all(&mut self, table: &str) -> Result<Vec<(i64, Values)>, StoreError> {
        self.inner.fetch_all(table).await
    }

    async fn insert(&mut self, table: &str, values: &Values) -> Result<i64, StoreError> {
        if self.fail_inserts_into == Some(table) {
            return Err(StoreError::Database(sqlx::Error::Protocol(format!(
                "insert into {table} refused"
            ))));
        }
        self.inner.insert(table, values).await
    }

    async fn update(&mut self, table: &str, id: i64, values: &Values) -> Result<(), StoreError> {
        self.inner.update(table, id, values).await
    }

    async fn delete(&mut self, table: &str, id: i64) -> Result<(), StoreError> {
        self.inner.delete(table, id).await
    }
}

#[async_trait]
impl StoreTransaction for JournalTx {
    async fn commit(self) -> Result<(), StoreError> {
        self.inner.commit().await?;
        self.journal.lock().unwrap().push("commit".into());
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.inner.rollback().await?;
        self.journal.lock().unwrap().push("rollback".into());
        Ok(())
    }
}

struct JournalSignal(Journal);

impl CacheSignal for JournalSignal {
    fn invalidate(&self, domain: &str) {
        self.0.lock().unwrap().push(format!("invalidate {domain}"));
    }
}

fn rules() -> RulesFrameworkImport {
    RulesFrameworkImport::from_config(&MigrationConfig::default())
}

async fn journal_store(fail_inserts_into: Option<&'static str>) -> (JournalStore, Journal) {
    let journal: Journal = Arc::default();
    let store = JournalStore {
        inner: migrated_store().await,
        journal: Arc::clone(&journal),
        fail_inserts_into,
    };
    (store, journal)
}

#[tokio::test]
async fn cache_is_invalidated_only_after_commit() {
    let (store, journal) = journal_store(None).await;
    let signal = JournalSignal(Arc::clone(&journal));
    let payload = codec::encode(&workflow_bundle("wf.approval")).unwrap();

    ImportCoordinator::new(&store, &signal)
        .import_bundle(&ctx(), &rules(), &payload)
        .await
        .unwrap();

    let events = journal.lock().unwrap().clone();
    assert_eq!(events[0], "begin");
    assert_eq!(events[1], "commit");
    let invalidated: Vec<&String> = events[2..].iter().collect();
    assert!(invalidated.iter().all(|e| e.starts_with("invalidate ")));
    assert!(invalidated.contains(&&"invalidate rf_state".to_string()));
    assert!(invalidated.contains(&&"invalidate rf_workflow".to_string()));
}

#[tokio::test]
async fn store_failure_mid_import_discards_earlier_writes() {
    let (store, journal) = journal_store(Some("rf_state")).await;
    let signal = JournalSignal(Arc::clone(&journal));
    let payload = codec::encode(&workflow_bundle("wf.approval")).unwrap();

    let failure = ImportCoordinator::new(&store, &signal)
        .import_bundle(&ctx(), &rules(), &payload)
        .await
        .unwrap_err();

    assert!(matches!(failure.error, MigrationError::Persistence { .. }));
    assert!(failure.report_text().contains("insert into rf_state refused"));
    assert_eq!(*journal.lock().unwrap(), vec!["begin", "rollback"]);
    // The workflow row was inserted before the failure and is gone again.
    assert_eq!(count(store.inner.pool(), "rf_workflow").await, 0);
}

#[tokio::test]
async fn corrupted_bundle_changes_nothing() {
    let store = migrated_store().await;
    let signal = RecordingSignal::default();
    let coordinator = ImportCoordinator::new(&store, &signal);
    let mut payload = codec::encode(&workflow_bundle("wf.approval")).unwrap();
    let middle = payload.len() / 2;
    payload.truncate(middle);

    let failure = coordinator
        .import_bundle(&ctx(), &rules(), &payload)
        .await
        .unwrap_err();
    assert!(matches!(failure.error, MigrationError::MalformedBundle { .. }));
    assert_eq!(count(store.pool(), "rf_workflow").await, 0);
    assert_eq!(count(store.pool(), "config_files").await, 0);
    assert!(signal.domains().is_empty());

    let failure = coordinator
        .import_bundle(&ctx(), &rules(), b"not a bundle at all")
        .await
        .unwrap_err();
    assert_eq!(failure.error.code(), "IMPORT/MALFORMED_BUNDLE");
}
