//! Builds bundles from a live source database.
//!
//! Surrogate ids never leave the source: foreign-key columns are exported as
//! the referenced row's business key and file columns become attachments.

use std::collections::HashMap;

use tracing::info;

use crate::bundle::{
    Attachment, Bundle, ColumnValue, CorrelationKey, Manifest, Record, TableManifest, Values,
};
use crate::error::{MigrationError, MigrationResult};
use crate::import::execute::FILES_TABLE;
use crate::store::TargetStore;

type KeyIndex = HashMap<String, HashMap<i64, String>>;

fn source_error(table: &str, detail: impl Into<String>) -> MigrationError {
    MigrationError::SourceData {
        table: table.to_string(),
        detail: detail.into(),
    }
}

pub async fn export_bundle<S: TargetStore>(
    store: &mut S,
    manifest: &Manifest,
) -> MigrationResult<Bundle> {
    let mut rows_by_table = Vec::with_capacity(manifest.tables.len());
    let mut keys: KeyIndex = HashMap::new();
    for table in &manifest.tables {
        let rows = store
            .fetch_all(&table.name)
            .await
            .map_err(|err| MigrationError::persistence(format!("read {}", table.name), err))?;
        let index = keys.entry(table.name.clone()).or_default();
        for (id, values) in &rows {
            let key = values
                .get(&table.business_key)
                .and_then(ColumnValue::as_text)
                .filter(|key| !key.is_empty())
                .ok_or_else(|| {
                    source_error(
                        &table.name,
                        format!("row {id} has no {} business key", table.business_key),
                    )
                })?;
            index.insert(*id, key.to_string());
        }
        info!(
            target: "cfg_migrate",
            event = "export_table",
            table = %table.name,
            rows = rows.len()
        );
        rows_by_table.push((table, rows));
    }

    let mut records = Vec::new();
    let mut attachments = Vec::new();
    for (table, rows) in rows_by_table {
        for (id, values) in rows {
            let (record, files) = export_row(store, table, &keys, id, values).await?;
            records.push(record);
            attachments.extend(files);
        }
    }
    info!(
        target: "cfg_migrate",
        event = "export_bundle",
        records = records.len(),
        attachments = attachments.len()
    );
    Bundle::new(manifest.clone(), records, attachments)
}

async fn export_row<S: TargetStore>(
    store: &mut S,
    table: &TableManifest,
    keys: &KeyIndex,
    id: i64,
    values: Values,
) -> MigrationResult<(Record, Vec<Attachment>)> {
    let business_key = keys
        .get(&table.name)
        .and_then(|index| index.get(&id))
        .cloned()
        .unwrap_or_default();
    let mut record = Record::new(table.name.clone());
    let mut attachments = Vec::new();

    for (column, value) in values {
        if table.is_file_column(&column) {
            if let Some(file_id) = value.as_integer() {
                let correlation = CorrelationKey {
                    table: table.name.clone(),
                    business_key: business_key.clone(),
                    column: column.clone(),
                };
                attachments.push(load_attachment(store, correlation, file_id).await?);
            }
            record.values.insert(column, ColumnValue::Null);
            continue;
        }
        let Some(fk) = table.foreign_key(&column) else {
            record.values.insert(column, value);
            continue;
        };
        let exported = match value {
            ColumnValue::Null => ColumnValue::Null,
            ColumnValue::Integer(target) => keys
                .get(&fk.references)
                .and_then(|index| index.get(&target))
                .map(|key| ColumnValue::Text(key.clone()))
                .ok_or_else(|| {
                    source_error(
                        &table.name,
                        format!(
                            "{business_key:?} column {column} points at missing {} id {target}",
                            fk.references
                        ),
                    )
                })?,
            other => {
                return Err(source_error(
                    &table.name,
                    format!("{business_key:?} column {column} holds {other:?}, not an id"),
                ))
            }
        };
        record.values.insert(column, exported);
    }
    Ok((record, attachments))
}

async fn load_attachment<S: TargetStore>(
    store: &mut S,
    correlation: CorrelationKey,
    file_id: i64,
) -> MigrationResult<Attachment> {
    let row = store
        .fetch_row(FILES_TABLE, file_id)
        .await
        .map_err(|err| MigrationError::persistence(format!("read file {file_id}"), err))?
        .ok_or_else(|| {
            source_error(
                &correlation.table,
                format!("{correlation} points at missing file {file_id}"),
            )
        })?;
    let text = |column: &str| {
        row.get(column)
            .and_then(ColumnValue::as_text)
            .unwrap_or_default()
            .to_string()
    };
    let file_name = text("file_name");
    let mut media_type = text("media_type");
    if media_type.is_empty() {
        media_type = mime_guess::from_path(&file_name)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
    }
    let bytes = match row.get("content") {
        Some(ColumnValue::Blob(bytes)) => bytes.clone(),
        _ => {
            return Err(source_error(
                FILES_TABLE,
                format!("file {file_id} has no content"),
            ))
        }
    };
    Ok(Attachment {
        correlation,
        file_name,
        media_type,
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SqliteStore, TransactionalStore};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store(sql: &[&str]) -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("connect sqlite::memory:");
        for statement in sql {
            sqlx::query(statement).execute(&pool).await.unwrap();
        }
        SqliteStore::new(pool)
    }

    const SCHEMA: [&str; 3] = [
        "CREATE TABLE config_files (id INTEGER PRIMARY KEY, file_name TEXT, media_type TEXT, size_bytes INTEGER, sha256 TEXT, content BLOB, created_at INTEGER)",
        "CREATE TABLE script (id INTEGER PRIMARY KEY, c_code TEXT, c_source_file INTEGER)",
        "CREATE TABLE param (id INTEGER PRIMARY KEY, c_code TEXT, id_parent INTEGER)",
    ];

    fn manifest() -> Manifest {
        Manifest::new(vec![
            TableManifest::new("script", "c_code").with_file_column("c_source_file"),
            TableManifest::new("param", "c_code").with_foreign_key("id_parent", "script", false),
        ])
    }

    #[tokio::test]
    async fn ids_become_business_keys_and_files_become_attachments() {
        let mut sql = SCHEMA.to_vec();
        sql.extend([
            "INSERT INTO config_files VALUES (9, 'rule.groovy', '', 4, 'x', X'74657374', 0)",
            "INSERT INTO script VALUES (31, 'sc.check', 9)",
            "INSERT INTO param VALUES (77, 'pa.limit', 31)",
        ]);
        let store = store(&sql).await;
        let mut tx = store.begin().await.unwrap();
        let bundle = export_bundle(&mut tx, &manifest()).await.unwrap();

        let param = bundle.records_for("param").next().unwrap();
        assert_eq!(param.values.get("id_parent"), Some(&ColumnValue::from("sc.check")));
        assert!(!param.values.contains_key("id"));
        let script = bundle.records_for("script").next().unwrap();
        assert_eq!(script.values.get("c_source_file"), Some(&ColumnValue::Null));

        let attachment = &bundle.attachments()[0];
        assert_eq!(attachment.correlation.business_key, "sc.check");
        assert_eq!(attachment.bytes, b"test");
        assert!(!attachment.media_type.is_empty());
    }

    #[tokio::test]
    async fn dangling_source_id_is_reported() {
        let mut sql = SCHEMA.to_vec();
        sql.push("INSERT INTO param VALUES (1, 'pa.orphan', 404)");
        let store = store(&sql).await;
        let mut tx = store.begin().await.unwrap();
        let err = export_bundle(&mut tx, &manifest()).await.unwrap_err();
        assert!(matches!(err, MigrationError::SourceData { .. }));
        assert!(err.to_string().contains("404"));
    }
}
