use std::collections::HashSet;

use crate::bundle::{Bundle, ColumnValue, Record, TableManifest, Values};
use crate::error::{BundleDefect, MigrationError, MigrationResult, Reference};
use crate::store::TargetStore;

use super::resolver::{BusinessKeyResolver, Resolved};
use super::ImportLog;

/// A record whose foreign-key columns now hold target surrogate ids. File
/// columns are left out; attachments set them.
#[derive(Debug, Clone, PartialEq)]
pub struct RewrittenRecord {
    pub table: String,
    pub business_key: String,
    pub values: Values,
    pub foreign_keys: u64,
    /// Tables in which a placeholder row was created for this record.
    pub placeholders: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    /// Identity materialization: references to bundle records that have no
    /// id yet are written as NULL.
    Seed,
    /// Every bundle record has an id.
    Final,
}

/// Replaces business-key foreign-key values with target surrogate ids.
pub struct ForeignKeyRewriter<'b> {
    bundle: &'b Bundle,
    bundle_keys: HashSet<(&'b str, &'b str)>,
}

impl<'b> ForeignKeyRewriter<'b> {
    pub fn new(bundle: &'b Bundle) -> Self {
        let bundle_keys = bundle
            .records()
            .iter()
            .map(|r| (r.table.as_str(), bundle.key_of(r)))
            .collect();
        Self {
            bundle,
            bundle_keys,
        }
    }

    fn in_bundle(&self, table: &str, business_key: &str) -> bool {
        self.bundle_keys.contains(&(table, business_key))
    }

    fn table_of(&self, record: &Record) -> MigrationResult<&'b TableManifest> {
        self.bundle.manifest().table(&record.table).ok_or_else(|| {
            MigrationError::malformed(BundleDefect::UndeclaredTable {
                table: record.table.clone(),
            })
        })
    }

    fn references(&self, record: &Record) -> MigrationResult<Vec<Reference>> {
        let table = self.table_of(record)?;
        let record_key = self.bundle.key_of(record);
        Ok(table
            .foreign_keys
            .iter()
            .filter_map(|fk| {
                let target = record.values.get(&fk.column)?.as_text()?;
                Some(Reference {
                    table: table.name.clone(),
                    record_key: record_key.to_string(),
                    column: fk.column.clone(),
                    target_table: fk.references.clone(),
                    business_key: target.to_string(),
                })
            })
            .collect())
    }

    /// Every reference that names a key found neither in the bundle, nor in
    /// the target, nor in a table where placeholders may be created. Runs
    /// before anything is written.
    pub async fn unresolved<S: TargetStore>(
        &self,
        store: &mut S,
        resolver: &mut BusinessKeyResolver<'_>,
        log: &mut ImportLog,
    ) -> MigrationResult<Vec<Reference>> {
        let mut missing = Vec::new();
        for record in self.bundle.records() {
            for site in self.references(record)? {
                if self.in_bundle(&site.target_table, &site.business_key)
                    || resolver.policy().allows_placeholder(&site.target_table)
                {
                    continue;
                }
                let found = resolver
                    .resolve(store, &site.target_table, &site.business_key, log)
                    .await?;
                if found.is_none() {
                    missing.push(site);
                }
            }
        }
        Ok(missing)
    }

    /// Column values for inserting a new record during identity
    /// materialization: plain columns plus every foreign key resolvable now.
    pub async fn seed_values<S: TargetStore>(
        &self,
        store: &mut S,
        resolver: &mut BusinessKeyResolver<'_>,
        record: &Record,
        log: &mut ImportLog,
    ) -> MigrationResult<(Values, Vec<String>)> {
        let rewritten = self.translate(store, resolver, record, Pass::Seed, log).await?;
        Ok((rewritten.values, rewritten.placeholders))
    }

    /// Rewrites one record with the complete resolution table.
    pub async fn rewrite<S: TargetStore>(
        &self,
        store: &mut S,
        resolver: &mut BusinessKeyResolver<'_>,
        record: &Record,
        log: &mut ImportLog,
    ) -> MigrationResult<RewrittenRecord> {
        self.translate(store, resolver, record, Pass::Final, log).await
    }

    /// Rewrites every bundle record, reporting all unresolved references
    /// together.
    pub async fn rewrite_all<S: TargetStore>(
        &self,
        store: &mut S,
        resolver: &mut BusinessKeyResolver<'_>,
        log: &mut ImportLog,
    ) -> MigrationResult<Vec<RewrittenRecord>> {
        let mut rewritten = Vec::with_capacity(self.bundle.records().len());
        let mut missing = Vec::new();
        for record in self.bundle.records() {
            match self.rewrite(store, resolver, record, log).await {
                Ok(record) => rewritten.push(record),
                Err(MigrationError::UnresolvedReference { references }) => {
                    missing.extend(references)
                }
                Err(err) => return Err(err),
            }
        }
        if !missing.is_empty() {
            return Err(MigrationError::UnresolvedReference {
                references: missing,
            });
        }
        Ok(rewritten)
    }

    async fn translate<S: TargetStore>(
        &self,
        store: &mut S,
        resolver: &mut BusinessKeyResolver<'_>,
        record: &Record,
        pass: Pass,
        log: &mut ImportLog,
    ) -> MigrationResult<RewrittenRecord> {
        let table = self.table_of(record)?;
        let record_key = self.bundle.key_of(record);
        let mut values = Values::new();
        let mut foreign_keys = 0;
        let mut placeholders = Vec::new();
        let mut missing = Vec::new();

        for (column, value) in &record.values {
            if table.is_file_column(column) {
                continue;
            }
            let (Some(fk), ColumnValue::Text(target)) = (table.foreign_key(column), value) else {
                values.insert(column.clone(), value.clone());
                continue;
            };
            let site = Reference {
                table: table.name.clone(),
                record_key: record_key.to_string(),
                column: column.clone(),
                target_table: fk.references.clone(),
                business_key: target.clone(),
            };

            let id = if self.in_bundle(&fk.references, target) {
                match (resolver.cached(&fk.references, target), pass) {
                    (Some(id), _) => Some(id),
                    (None, Pass::Seed) => None,
                    (None, Pass::Final) => {
                        missing.push(site);
                        continue;
                    }
                }
            } else {
                match resolver.resolve_or_create(store, &site, log).await {
                    Ok(Resolved::Placeholder(id)) => {
                        placeholders.push(fk.references.clone());
                        Some(id)
                    }
                    Ok(Resolved::Existing(id)) => {
                        if pass == Pass::Final && !resolver.is_placeholder(&fk.references, target) {
                            log.warn(format!(
                                "{} {record_key:?} column {column} resolved to existing {} {target:?} (id {id}) not carried in the bundle",
                                table.name, fk.references
                            ));
                        }
                        Some(id)
                    }
                    Err(MigrationError::UnresolvedReference { references }) => {
                        missing.extend(references);
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            };

            match id {
                Some(id) => {
                    values.insert(column.clone(), ColumnValue::Integer(id));
                    foreign_keys += 1;
                }
                None => {
                    values.insert(column.clone(), ColumnValue::Null);
                }
            }
        }

        if !missing.is_empty() {
            return Err(MigrationError::UnresolvedReference {
                references: missing,
            });
        }
        Ok(RewrittenRecord {
            table: table.name.clone(),
            business_key: record_key.to_string(),
            values,
            foreign_keys,
            placeholders,
        })
    }
}
