use std::collections::HashSet;

use chrono::Utc;

use crate::bundle::{Attachment, Bundle, ColumnValue, Values};
use crate::error::{MigrationError, MigrationResult};
use crate::store::{StoreError, TargetStore};

use super::resolver::BusinessKeyResolver;
use super::rewrite::ForeignKeyRewriter;
use super::table_order::{forward_reference_warnings, materialization_order};
use super::{ImportLog, ImportPolicy, ImportSummary};

pub const FILES_TABLE: &str = "config_files";

/// Applies a structured bundle inside an open transaction:
/// reference check, identity materialization in manifest order (records with
/// non-nullable in-bundle references after their targets), foreign-key
/// rewrite and persist, then attachment linking.
pub async fn apply_structured<S: TargetStore>(
    store: &mut S,
    bundle: &Bundle,
    policy: &ImportPolicy,
    log: &mut ImportLog,
) -> MigrationResult<ImportSummary> {
    check_allowed_tables(bundle, policy)?;
    for warning in forward_reference_warnings(bundle.manifest()) {
        log.warn(warning);
    }

    let mut summary = ImportSummary::default();
    let mut resolver = BusinessKeyResolver::new(bundle.manifest(), policy);
    let rewriter = ForeignKeyRewriter::new(bundle);

    let missing = rewriter.unresolved(store, &mut resolver, log).await?;
    if !missing.is_empty() {
        return Err(MigrationError::UnresolvedReference { references: missing });
    }
    log.info(format!(
        "reference check passed for {} record(s) in {} table(s)",
        bundle.records().len(),
        bundle.manifest().tables.len()
    ));

    let mut present: HashSet<(&str, &str)> = HashSet::new();
    for record in bundle.records() {
        let key = bundle.key_of(record);
        if resolver.resolve(store, &record.table, key, log).await?.is_some() {
            present.insert((record.table.as_str(), key));
        }
    }
    let order = materialization_order(bundle, &present)?;

    // Identity materialization.
    let mut created: HashSet<(&str, &str)> = HashSet::new();
    for record in order {
        let key = bundle.key_of(record);
        if let Some(id) = resolver.resolve(store, &record.table, key, log).await? {
            summary.note_matched(&record.table);
            log.info(format!("matched {} {key:?} to id {id}", record.table));
            continue;
        }
        let (seed, placeholders) = rewriter
            .seed_values(store, &mut resolver, record, log)
            .await?;
        for table in &placeholders {
            summary.note_placeholder(table);
        }
        let id = store
            .insert(&record.table, &seed)
            .await
            .map_err(|err| MigrationError::from_write(&record.table, key, err))?;
        resolver.record(&record.table, key, id);
        created.insert((record.table.as_str(), key));
        summary.note_created(&record.table);
        log.info(format!("created {} {key:?} as id {id}", record.table));
    }

    // Rewrite and persist.
    for rewritten in rewriter.rewrite_all(store, &mut resolver, log).await? {
        for table in &rewritten.placeholders {
            summary.note_placeholder(table);
        }
        summary.foreign_keys_rewritten += rewritten.foreign_keys;
        let table = rewritten.table.as_str();
        let key = rewritten.business_key.as_str();
        // Every bundle record was materialized above.
        let Some(id) = resolver.cached(table, key) else {
            return Err(MigrationError::persistence(
                format!("{table} {key:?}"),
                StoreError::InvalidIdentifier(format!("{table} {key:?} has no materialized id")),
            ));
        };
        let current = store
            .fetch_row(table, id)
            .await
            .map_err(|err| MigrationError::persistence(format!("{table} {key:?}"), err))?
            .unwrap_or_default();
        let changes = changed_columns(&current, &rewritten.values);
        if changes.is_empty() {
            continue;
        }
        store
            .update(table, id, &changes)
            .await
            .map_err(|err| MigrationError::from_write(table, key, err))?;
        if !created.contains(&(table, key)) {
            summary.note_updated(table);
            log.info(format!(
                "updated {table} {key:?} (id {id}): {}",
                changes.keys().cloned().collect::<Vec<_>>().join(", ")
            ));
        }
    }

    for attachment in bundle.attachments() {
        link_attachment(store, bundle, &resolver, attachment, &mut summary, log).await?;
    }

    log.info(format!(
        "applied: {} created, {} matched, {} updated, {} attachment(s) stored",
        summary.created, summary.matched, summary.updated, summary.attachments_stored
    ));
    Ok(summary)
}

fn check_allowed_tables(bundle: &Bundle, policy: &ImportPolicy) -> MigrationResult<()> {
    let Some(allowed) = &policy.allowed_tables else {
        return Ok(());
    };
    match bundle.manifest().table_names().find(|t| !allowed.contains(*t)) {
        Some(table) => Err(MigrationError::TableNotAllowed {
            table: table.to_string(),
            flavor: policy.flavor.clone(),
        }),
        None => Ok(()),
    }
}

fn changed_columns(current: &Values, wanted: &Values) -> Values {
    wanted
        .iter()
        .filter(|(column, value)| current.get(*column) != Some(*value))
        .map(|(column, value)| (column.clone(), value.clone()))
        .collect()
}

async fn link_attachment<S: TargetStore>(
    store: &mut S,
    bundle: &Bundle,
    resolver: &BusinessKeyResolver<'_>,
    attachment: &Attachment,
    summary: &mut ImportSummary,
    log: &mut ImportLog,
) -> MigrationResult<()> {
    let c = &attachment.correlation;
    let link_error = |reason: &str| MigrationError::AttachmentLink {
        table: c.table.clone(),
        business_key: c.business_key.clone(),
        column: c.column.clone(),
        file_name: attachment.file_name.clone(),
        reason: reason.to_string(),
    };

    let is_file_column = bundle
        .manifest()
        .table(&c.table)
        .is_some_and(|t| t.is_file_column(&c.column));
    if !is_file_column {
        return Err(link_error("column is not a declared file column"));
    }
    let owner = resolver
        .cached(&c.table, &c.business_key)
        .ok_or_else(|| link_error("owning record was not materialized"))?;
    let subject = || format!("attachment {} for {c}", attachment.file_name);
    let row = store
        .fetch_row(&c.table, owner)
        .await
        .map_err(|err| MigrationError::persistence(subject(), err))?
        .ok_or_else(|| link_error("owning row is missing from the target"))?;

    let digest = attachment.sha256();
    let previous = row.get(&c.column).and_then(ColumnValue::as_integer);
    if let Some(file_id) = previous {
        let existing = store
            .fetch_row(FILES_TABLE, file_id)
            .await
            .map_err(|err| MigrationError::persistence(subject(), err))?;
        let same = existing
            .as_ref()
            .and_then(|file| file.get("sha256"))
            .and_then(ColumnValue::as_text)
            == Some(digest.as_str());
        if same {
            summary.attachments_unchanged += 1;
            log.info(format!("attachment {} for {c} unchanged", attachment.file_name));
            return Ok(());
        }
    }

    let mut file = Values::new();
    file.insert("file_name".into(), ColumnValue::from(attachment.file_name.as_str()));
    file.insert("media_type".into(), ColumnValue::from(attachment.media_type.as_str()));
    file.insert("size_bytes".into(), ColumnValue::Integer(attachment.bytes.len() as i64));
    file.insert("sha256".into(), ColumnValue::Text(digest));
    file.insert("content".into(), ColumnValue::Blob(attachment.bytes.clone()));
    file.insert("created_at".into(), ColumnValue::Integer(Utc::now().timestamp_millis()));
    let file_id = store
        .insert(FILES_TABLE, &file)
        .await
        .map_err(|err| MigrationError::persistence(subject(), err))?;

    let mut link = Values::new();
    link.insert(c.column.clone(), ColumnValue::Integer(file_id));
    store
        .update(&c.table, owner, &link)
        .await
        .map_err(|err| MigrationError::persistence(subject(), err))?;
    if let Some(old) = previous {
        store
            .delete(FILES_TABLE, old)
            .await
            .map_err(|err| MigrationError::persistence(subject(), err))?;
    }
    summary.attachments_stored += 1;
    log.info(format!(
        "stored attachment {} for {c} as file {file_id}",
        attachment.file_name
    ));
    Ok(())
}
