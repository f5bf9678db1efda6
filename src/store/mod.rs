//! Target store capability used by import and export.
//!
//! The engine only issues structured reads and writes keyed by table and
//! column names; identifier quoting, value binding and transaction handling
//! live behind these traits.

use async_trait::async_trait;
use thiserror::Error;

use crate::bundle::{ColumnValue, Values};

mod sqlite;

pub use sqlite::{SqliteStore, SqliteTransaction, DEFAULT_SURROGATE_COLUMN};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("unsupported column type {type_name} for {table}.{column}")]
    UnsupportedType {
        table: String,
        column: String,
        type_name: String,
    },
    #[error("row {id} not found in {table}")]
    RowNotFound { table: String, id: i64 },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        match self {
            StoreError::Database(sqlx::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }
}

/// Structured access to one target database, usually through an open
/// transaction.
#[async_trait]
pub trait TargetStore: Send {
    /// Surrogate ids of every row whose `column` equals `value`, ascending.
    async fn find_ids(
        &mut self,
        table: &str,
        column: &str,
        value: &ColumnValue,
    ) -> Result<Vec<i64>, StoreError>;

    /// All columns of one row except the surrogate id.
    async fn fetch_row(&mut self, table: &str, id: i64) -> Result<Option<Values>, StoreError>;

    async fn fetch_all(&mut self, table: &str) -> Result<Vec<(i64, Values)>, StoreError>;

    /// Inserts a row and returns the surrogate id the store assigned.
    async fn insert(&mut self, table: &str, values: &Values) -> Result<i64, StoreError>;

    async fn update(&mut self, table: &str, id: i64, values: &Values) -> Result<(), StoreError>;

    async fn delete(&mut self, table: &str, id: i64) -> Result<(), StoreError>;
}

#[async_trait]
pub trait StoreTransaction: TargetStore + Sized {
    async fn commit(self) -> Result<(), StoreError>;
    async fn rollback(self) -> Result<(), StoreError>;
}

/// A store that can open transactions. Dropping an open transaction must
/// discard its writes.
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    type Transaction: StoreTransaction;

    async fn begin(&self) -> Result<Self::Transaction, StoreError>;
}
