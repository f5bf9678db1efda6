use std::collections::{HashMap, HashSet};

use crate::bundle::{ColumnValue, Manifest, Values};
use crate::error::{BundleDefect, DuplicateOrigin, MigrationError, MigrationResult, Reference};
use crate::store::TargetStore;

use super::{DuplicatePolicy, ImportLog, ImportPolicy};

/// Import-scoped map from (table, business key) to the target surrogate id.
/// Only positive answers are kept; it is never persisted.
#[derive(Debug, Default, Clone)]
pub struct ResolutionTable {
    ids: HashMap<(String, String), i64>,
}

impl ResolutionTable {
    pub fn get(&self, table: &str, business_key: &str) -> Option<i64> {
        self.ids
            .get(&(table.to_string(), business_key.to_string()))
            .copied()
    }

    pub fn insert(&mut self, table: &str, business_key: &str, id: i64) {
        self.ids
            .insert((table.to_string(), business_key.to_string()), id);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    Existing(i64),
    Placeholder(i64),
}

impl Resolved {
    pub fn id(self) -> i64 {
        match self {
            Resolved::Existing(id) | Resolved::Placeholder(id) => id,
        }
    }
}

/// Translates business keys into target surrogate ids through the store's
/// value-matching query, caching hits for the rest of the run.
pub struct BusinessKeyResolver<'a> {
    manifest: &'a Manifest,
    policy: &'a ImportPolicy,
    table: ResolutionTable,
    placeholders: HashSet<(String, String)>,
}

impl<'a> BusinessKeyResolver<'a> {
    pub fn new(manifest: &'a Manifest, policy: &'a ImportPolicy) -> Self {
        Self {
            manifest,
            policy,
            table: ResolutionTable::default(),
            placeholders: HashSet::new(),
        }
    }

    pub fn policy(&self) -> &ImportPolicy {
        self.policy
    }

    /// Whether this run inserted `table`/`business_key` as a placeholder.
    pub fn is_placeholder(&self, table: &str, business_key: &str) -> bool {
        self.placeholders
            .contains(&(table.to_string(), business_key.to_string()))
    }

    pub fn cached(&self, table: &str, business_key: &str) -> Option<i64> {
        self.table.get(table, business_key)
    }

    /// Records the id a bundle record was materialized under.
    pub fn record(&mut self, table: &str, business_key: &str, id: i64) {
        self.table.insert(table, business_key, id);
    }

    pub fn resolution_table(&self) -> &ResolutionTable {
        &self.table
    }

    pub async fn resolve<S: TargetStore>(
        &mut self,
        store: &mut S,
        table: &str,
        business_key: &str,
        log: &mut ImportLog,
    ) -> MigrationResult<Option<i64>> {
        if let Some(id) = self.table.get(table, business_key) {
            return Ok(Some(id));
        }
        let column = self.business_key_column(table)?;
        let ids = store
            .find_ids(table, &column, &ColumnValue::from(business_key))
            .await
            .map_err(|err| MigrationError::persistence(format!("lookup {table} {business_key:?}"), err))?;
        let id = match ids.as_slice() {
            [] => return Ok(None),
            [id] => *id,
            [first, ..] => match self.policy.duplicate_policy {
                DuplicatePolicy::Reject => {
                    return Err(MigrationError::DuplicateBusinessKey {
                        table: table.to_string(),
                        business_key: business_key.to_string(),
                        origin: DuplicateOrigin::Target,
                    })
                }
                DuplicatePolicy::FirstMatch => {
                    log.warn(format!(
                        "{table} {business_key:?} matches {} target rows; using id {first}",
                        ids.len()
                    ));
                    *first
                }
            },
        };
        self.table.insert(table, business_key, id);
        Ok(Some(id))
    }

    /// Resolves the referenced key, inserting a minimal placeholder row when
    /// the policy allows it for the referenced table. `site` describes the
    /// reference and is reported when creation is not allowed.
    pub async fn resolve_or_create<S: TargetStore>(
        &mut self,
        store: &mut S,
        site: &Reference,
        log: &mut ImportLog,
    ) -> MigrationResult<Resolved> {
        let table = site.target_table.as_str();
        let key = site.business_key.as_str();
        if let Some(id) = self.resolve(store, table, key, log).await? {
            return Ok(Resolved::Existing(id));
        }
        if !self.policy.allows_placeholder(table) {
            return Err(MigrationError::UnresolvedReference {
                references: vec![site.clone()],
            });
        }
        let mut seed = Values::new();
        seed.insert(self.business_key_column(table)?, ColumnValue::from(key));
        let id = store
            .insert(table, &seed)
            .await
            .map_err(|err| MigrationError::from_write(table, key, err))?;
        self.table.insert(table, key, id);
        self.placeholders.insert((table.to_string(), key.to_string()));
        log.warn(format!(
            "created placeholder {table} {key:?} (id {id}) for {} {:?} column {}",
            site.table, site.record_key, site.column
        ));
        Ok(Resolved::Placeholder(id))
    }

    fn business_key_column(&self, table: &str) -> MigrationResult<String> {
        self.manifest
            .table(table)
            .map(|t| t.business_key.clone())
            .ok_or_else(|| {
                MigrationError::malformed(BundleDefect::UndeclaredTable {
                    table: table.to_string(),
                })
            })
    }
}
