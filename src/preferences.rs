//! Flat name/value system preferences. No manifest, no foreign keys and no
//! attachments; the name is the business key.

use crate::bundle::{ColumnValue, Values};
use crate::codec::{Preference, PreferenceValue};
use crate::error::{DuplicateOrigin, MigrationError, MigrationResult};
use crate::import::{DuplicatePolicy, ImportLog, ImportSummary};
use crate::store::TargetStore;

pub const PREFERENCES_TABLE: &str = "system_preferences";
pub const NAME_COLUMN: &str = "name";
pub const VALUE_COLUMN: &str = "value";

async fn find_preference<S: TargetStore>(
    store: &mut S,
    name: &str,
    policy: DuplicatePolicy,
    log: &mut ImportLog,
) -> MigrationResult<Option<i64>> {
    let ids = store
        .find_ids(PREFERENCES_TABLE, NAME_COLUMN, &ColumnValue::from(name))
        .await
        .map_err(|err| MigrationError::persistence(format!("preference {name:?}"), err))?;
    match (ids.as_slice(), policy) {
        ([], _) => Ok(None),
        ([id], _) => Ok(Some(*id)),
        (_, DuplicatePolicy::Reject) => Err(MigrationError::DuplicateBusinessKey {
            table: PREFERENCES_TABLE.to_string(),
            business_key: name.to_string(),
            origin: DuplicateOrigin::Target,
        }),
        ([first, ..], DuplicatePolicy::FirstMatch) => {
            log.warn(format!(
                "preference {name:?} matches {} rows; using id {first}",
                ids.len()
            ));
            Ok(Some(*first))
        }
    }
}

/// Upserts every preference by name. A preference without a value was
/// absent in the source and is deleted from the target; a NULL value is
/// stored as NULL.
pub async fn apply_preferences<S: TargetStore>(
    store: &mut S,
    preferences: &[Preference],
    policy: DuplicatePolicy,
    log: &mut ImportLog,
) -> MigrationResult<ImportSummary> {
    let mut summary = ImportSummary::default();
    for preference in preferences {
        let name = preference.name.as_str();
        let existing = find_preference(store, name, policy, log).await?;
        let write_err = |err| MigrationError::from_write(PREFERENCES_TABLE, name, err);

        let value = match &preference.value {
            PreferenceValue::Absent => None,
            PreferenceValue::Null => Some(ColumnValue::Null),
            PreferenceValue::Text(text) => Some(ColumnValue::from(text.as_str())),
        };

        match (existing, value) {
            (None, None) => {
                log.info(format!("preference {name:?} absent in source and target"));
            }
            (Some(id), None) => {
                store.delete(PREFERENCES_TABLE, id).await.map_err(write_err)?;
                summary.note_deleted(PREFERENCES_TABLE);
                log.info(format!("deleted preference {name:?}"));
            }
            (None, Some(value)) => {
                let mut row = Values::new();
                row.insert(NAME_COLUMN.to_string(), ColumnValue::from(name));
                row.insert(VALUE_COLUMN.to_string(), value);
                let id = store.insert(PREFERENCES_TABLE, &row).await.map_err(write_err)?;
                summary.note_created(PREFERENCES_TABLE);
                log.info(format!("created preference {name:?} as id {id}"));
            }
            (Some(id), Some(value)) => {
                summary.note_matched(PREFERENCES_TABLE);
                let current = store
                    .fetch_row(PREFERENCES_TABLE, id)
                    .await
                    .map_err(write_err)?
                    .and_then(|row| row.get(VALUE_COLUMN).cloned())
                    .unwrap_or(ColumnValue::Null);
                if current == value {
                    continue;
                }
                let mut row = Values::new();
                row.insert(VALUE_COLUMN.to_string(), value);
                store
                    .update(PREFERENCES_TABLE, id, &row)
                    .await
                    .map_err(write_err)?;
                summary.note_updated(PREFERENCES_TABLE);
                log.info(format!("updated preference {name:?}"));
            }
        }
    }
    Ok(summary)
}

fn exported_value(name: &str, stored: Option<&ColumnValue>) -> MigrationResult<PreferenceValue> {
    match stored {
        None | Some(ColumnValue::Null) => Ok(PreferenceValue::Null),
        Some(ColumnValue::Text(text)) => Ok(PreferenceValue::Text(text.clone())),
        Some(ColumnValue::Integer(value)) => Ok(PreferenceValue::Text(value.to_string())),
        Some(ColumnValue::Real(value)) => Ok(PreferenceValue::Text(value.to_string())),
        Some(ColumnValue::Blob(_)) => Err(MigrationError::SourceData {
            table: PREFERENCES_TABLE.to_string(),
            detail: format!("preference {name:?} holds binary data"),
        }),
    }
}

/// Reads the named preferences; names with no row export as absent and a
/// NULL value exports as [`PreferenceValue::Null`]. An empty name list
/// exports every stored preference.
pub async fn export_preferences<S: TargetStore>(
    store: &mut S,
    names: &[String],
) -> MigrationResult<Vec<Preference>> {
    let read_err = |err| MigrationError::persistence(format!("read {PREFERENCES_TABLE}"), err);
    let rows = store.fetch_all(PREFERENCES_TABLE).await.map_err(read_err)?;
    let mut stored = Vec::with_capacity(rows.len());
    for (_, row) in rows {
        let Some(name) = row.get(NAME_COLUMN).and_then(ColumnValue::as_text) else {
            continue;
        };
        let value = exported_value(name, row.get(VALUE_COLUMN))?;
        stored.push(Preference {
            name: name.to_string(),
            value,
        });
    }

    if names.is_empty() {
        return Ok(stored);
    }
    Ok(names
        .iter()
        .map(|name| {
            stored
                .iter()
                .find(|p| &p.name == name)
                .cloned()
                .unwrap_or_else(|| Preference::absent(name.clone()))
        })
        .collect())
}
