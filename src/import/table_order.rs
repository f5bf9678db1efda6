use std::collections::{HashMap, HashSet};

use crate::bundle::{Bundle, Manifest, Record};
use crate::error::{MigrationError, MigrationResult};

/// Nullable foreign keys that point at a table declared later in the
/// manifest. Such columns are written NULL during materialization and filled
/// by the rewrite pass, so they only warrant a warning. Self references are
/// expected, and non-nullable ones are handled by [`materialization_order`].
pub(crate) fn forward_reference_warnings(manifest: &Manifest) -> Vec<String> {
    let mut warnings = Vec::new();
    for (position, table) in manifest.tables.iter().enumerate() {
        for fk in &table.foreign_keys {
            if !fk.nullable || fk.references == table.name {
                continue;
            }
            let Some(target) = manifest.position(&fk.references) else {
                continue;
            };
            if target > position {
                warnings.push(format!(
                    "{}.{} references {} which is declared later; filled after all records exist",
                    table.name, fk.column, fk.references
                ));
            }
        }
    }
    warnings
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnPath,
    Placed,
}

/// Order in which bundle records are inserted. A non-nullable foreign key
/// cannot be written NULL and filled later, so a record whose non-nullable
/// key names another bundle record still to be created is placed after it.
/// Otherwise bundle order is kept. Records listed in `present` already exist
/// in the target and impose no ordering.
///
/// Fails with [`MigrationError::ReferenceCycle`] when such keys form a
/// cycle, since no insert order can satisfy it.
pub(crate) fn materialization_order<'b>(
    bundle: &'b Bundle,
    present: &HashSet<(&str, &str)>,
) -> MigrationResult<Vec<&'b Record>> {
    let records = bundle.records();
    let identity = |i: usize| (records[i].table.as_str(), bundle.key_of(&records[i]));
    let index: HashMap<(&str, &str), usize> =
        (0..records.len()).map(|i| (identity(i), i)).collect();

    let dependencies: Vec<Vec<usize>> = (0..records.len())
        .map(|i| {
            let record = &records[i];
            let Some(table) = bundle.manifest().table(&record.table) else {
                return Vec::new();
            };
            if present.contains(&identity(i)) {
                return Vec::new();
            }
            table
                .foreign_keys
                .iter()
                .filter(|fk| !fk.nullable)
                .filter_map(|fk| {
                    let target = record.values.get(&fk.column)?.as_text()?;
                    index.get(&(fk.references.as_str(), target)).copied()
                })
                .filter(|&dep| !present.contains(&identity(dep)))
                .collect()
        })
        .collect();

    let describe = |i: usize| {
        let (table, key) = identity(i);
        format!("{table} {key:?}")
    };

    let mut marks = vec![Mark::Unvisited; records.len()];
    let mut order = Vec::with_capacity(records.len());
    for root in 0..records.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        marks[root] = Mark::OnPath;
        // (record, next dependency to visit)
        let mut path: Vec<(usize, usize)> = vec![(root, 0)];
        while let Some(top) = path.last_mut() {
            let (node, next) = *top;
            let Some(&dep) = dependencies[node].get(next) else {
                marks[node] = Mark::Placed;
                order.push(&records[node]);
                path.pop();
                continue;
            };
            top.1 += 1;
            match marks[dep] {
                Mark::Unvisited => {
                    marks[dep] = Mark::OnPath;
                    path.push((dep, 0));
                }
                Mark::OnPath => {
                    let start = path.iter().position(|&(n, _)| n == dep).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|&(n, _)| describe(n)).collect();
                    cycle.push(describe(dep));
                    return Err(MigrationError::ReferenceCycle { records: cycle });
                }
                Mark::Placed => {}
            }
        }
    }
    Ok(order)
}
