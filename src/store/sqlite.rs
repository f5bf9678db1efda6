use async_trait::async_trait;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Column, Row, Sqlite, SqlitePool, Transaction, TypeInfo, ValueRef};
use tracing::debug;

use super::{StoreError, StoreTransaction, TargetStore, TransactionalStore};
use crate::bundle::{valid_identifier, ColumnValue, Values};

pub const DEFAULT_SURROGATE_COLUMN: &str = "id";

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    surrogate_column: String,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            surrogate_column: DEFAULT_SURROGATE_COLUMN.to_string(),
        }
    }

    pub fn with_surrogate_column(mut self, column: impl Into<String>) -> Result<Self, StoreError> {
        let column = column.into();
        quote_ident(&column)?;
        self.surrogate_column = column;
        Ok(self)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl TransactionalStore for SqliteStore {
    type Transaction = SqliteTransaction;

    async fn begin(&self) -> Result<SqliteTransaction, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(SqliteTransaction {
            tx,
            surrogate_column: self.surrogate_column.clone(),
        })
    }
}

/// An open SQLite transaction. Dropping it without commit rolls back.
pub struct SqliteTransaction {
    tx: Transaction<'static, Sqlite>,
    surrogate_column: String,
}

#[async_trait]
impl TargetStore for SqliteTransaction {
    async fn find_ids(
        &mut self,
        table: &str,
        column: &str,
        value: &ColumnValue,
    ) -> Result<Vec<i64>, StoreError> {
        let id = quote_ident(&self.surrogate_column)?;
        let table_ident = quote_ident(table)?;
        let column_ident = quote_ident(column)?;
        let rows = if value.is_null() {
            let sql = format!(
                "SELECT {id} FROM {table_ident} WHERE {column_ident} IS NULL ORDER BY {id}"
            );
            sqlx::query(&sql).fetch_all(&mut *self.tx).await?
        } else {
            let sql =
                format!("SELECT {id} FROM {table_ident} WHERE {column_ident} = ? ORDER BY {id}");
            bind_value(sqlx::query(&sql), value)
                .fetch_all(&mut *self.tx)
                .await?
        };
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(row.try_get::<i64, _>(0)?);
        }
        Ok(ids)
    }

    async fn fetch_row(&mut self, table: &str, id: i64) -> Result<Option<Values>, StoreError> {
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ?",
            quote_ident(table)?,
            quote_ident(&self.surrogate_column)?
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        match row {
            Some(row) => Ok(Some(decode_row(table, &row, &self.surrogate_column)?.1)),
            None => Ok(None),
        }
    }

    async fn fetch_all(&mut self, table: &str) -> Result<Vec<(i64, Values)>, StoreError> {
        let sql = format!(
            "SELECT * FROM {} ORDER BY {}",
            quote_ident(table)?,
            quote_ident(&self.surrogate_column)?
        );
        let rows = sqlx::query(&sql).fetch_all(&mut *self.tx).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let (id, values) = decode_row(table, &row, &self.surrogate_column)?;
            let id = id.ok_or_else(|| StoreError::UnsupportedType {
                table: table.to_string(),
                column: self.surrogate_column.clone(),
                type_name: "NULL".into(),
            })?;
            out.push((id, values));
        }
        Ok(out)
    }

    async fn insert(&mut self, table: &str, values: &Values) -> Result<i64, StoreError> {
        let table_ident = quote_ident(table)?;
        let returning = quote_ident(&self.surrogate_column)?;
        let sql = if values.is_empty() {
            format!("INSERT INTO {table_ident} DEFAULT VALUES RETURNING {returning}")
        } else {
            let mut columns = Vec::with_capacity(values.len());
            for column in values.keys() {
                columns.push(quote_ident(column)?);
            }
            let placeholders = vec!["?"; values.len()].join(", ");
            format!(
                "INSERT INTO {table_ident} ({}) VALUES ({placeholders}) RETURNING {returning}",
                columns.join(", ")
            )
        };
        let mut query = sqlx::query(&sql);
        for value in values.values() {
            query = bind_value(query, value);
        }
        let row = query.fetch_one(&mut *self.tx).await?;
        let id: i64 = row.try_get(0)?;
        debug!(target: "cfg_migrate", event = "store_insert", table, id);
        Ok(id)
    }

    async fn update(&mut self, table: &str, id: i64, values: &Values) -> Result<(), StoreError> {
        if values.is_empty() {
            return Ok(());
        }
        let mut assignments = Vec::with_capacity(values.len());
        for column in values.keys() {
            assignments.push(format!("{} = ?", quote_ident(column)?));
        }
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            quote_ident(table)?,
            assignments.join(", "),
            quote_ident(&self.surrogate_column)?
        );
        let mut query = sqlx::query(&sql);
        for value in values.values() {
            query = bind_value(query, value);
        }
        let result = query.bind(id).execute(&mut *self.tx).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RowNotFound {
                table: table.to_string(),
                id,
            });
        }
        debug!(target: "cfg_migrate", event = "store_update", table, id);
        Ok(())
    }

    async fn delete(&mut self, table: &str, id: i64) -> Result<(), StoreError> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            quote_ident(table)?,
            quote_ident(&self.surrogate_column)?
        );
        sqlx::query(&sql).bind(id).execute(&mut *self.tx).await?;
        debug!(target: "cfg_migrate", event = "store_delete", table, id);
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for SqliteTransaction {
    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q ColumnValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        ColumnValue::Null => query.bind(None::<i64>),
        ColumnValue::Integer(v) => query.bind(*v),
        ColumnValue::Real(v) => query.bind(*v),
        ColumnValue::Text(v) => query.bind(v.as_str()),
        ColumnValue::Blob(v) => query.bind(v.as_slice()),
    }
}

fn decode_row(
    table: &str,
    row: &SqliteRow,
    surrogate_column: &str,
) -> Result<(Option<i64>, Values), StoreError> {
    let mut id = None;
    let mut values = Values::new();
    for column in row.columns() {
        let ordinal = column.ordinal();
        let raw = row.try_get_raw(ordinal)?;
        let value = if raw.is_null() {
            ColumnValue::Null
        } else {
            let type_name = raw.type_info().name().to_string();
            match type_name.as_str() {
                "INTEGER" => ColumnValue::Integer(row.try_get(ordinal)?),
                "REAL" => ColumnValue::Real(row.try_get(ordinal)?),
                "TEXT" => ColumnValue::Text(row.try_get(ordinal)?),
                "BLOB" => ColumnValue::Blob(row.try_get(ordinal)?),
                _ => {
                    return Err(StoreError::UnsupportedType {
                        table: table.to_string(),
                        column: column.name().to_string(),
                        type_name,
                    })
                }
            }
        };
        if column.name() == surrogate_column {
            id = value.as_integer();
        } else {
            values.insert(column.name().to_string(), value);
        }
    }
    Ok((id, values))
}

fn quote_ident(name: &str) -> Result<String, StoreError> {
    if !valid_identifier(name) {
        return Err(StoreError::InvalidIdentifier(name.to_string()));
    }
    Ok(format!("\"{name}\""))
}
