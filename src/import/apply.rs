use std::collections::BTreeSet;

use tracing::{error, info, info_span, warn, Instrument};

use crate::cache::CacheSignal;
use crate::error::MigrationError;
use crate::store::{StoreTransaction, TransactionalStore};

use super::{ImportFailure, ImportLog, ImportLogic, ImportSummary, MigrationContext};

/// Runs one import inside one transaction: begin, decode, apply, then commit
/// or roll back exactly once. Cache domains are invalidated only after a
/// successful commit.
pub struct ImportCoordinator<'a, T, C: ?Sized> {
    store: &'a T,
    cache: &'a C,
}

impl<'a, T, C> ImportCoordinator<'a, T, C>
where
    T: TransactionalStore,
    C: CacheSignal + ?Sized,
{
    pub fn new(store: &'a T, cache: &'a C) -> Self {
        Self { store, cache }
    }

    pub async fn import_bundle<L: ImportLogic>(
        &self,
        ctx: &MigrationContext,
        logic: &L,
        payload: &[u8],
    ) -> Result<ImportSummary, ImportFailure> {
        let span = info_span!(
            "import",
            run_id = %ctx.run_id,
            operator = %ctx.operator,
            flavor = logic.name()
        );
        self.run(ctx, logic, payload).instrument(span).await
    }

    async fn run<L: ImportLogic>(
        &self,
        ctx: &MigrationContext,
        logic: &L,
        payload: &[u8],
    ) -> Result<ImportSummary, ImportFailure> {
        let mut log = ImportLog::new();
        log.info(format!(
            "import {} started by {} at {} ({} bytes)",
            ctx.run_id,
            ctx.operator,
            ctx.started_at,
            payload.len()
        ));

        let mut tx = match self.store.begin().await {
            Ok(tx) => tx,
            Err(err) => {
                let err = MigrationError::persistence("begin transaction", err);
                return Err(ImportFailure::new(err, log));
            }
        };
        info!(target: "cfg_migrate", event = "import_tx_begin");

        let outcome = match logic.decode(payload) {
            Ok(bundle) => {
                log.info(format!("decoded {} payload", logic.name()));
                logic
                    .apply(&mut tx, &bundle, &mut log)
                    .await
                    .map(|summary| (summary, logic.affected_domains(&bundle)))
            }
            Err(err) => Err(err),
        };

        match outcome {
            Ok((mut summary, domains)) => {
                if let Err(err) = tx.commit().await {
                    let err = MigrationError::persistence("commit transaction", err);
                    error!(target: "cfg_migrate", event = "import_commit_failed", error = %err);
                    return Err(ImportFailure::new(err, log));
                }
                info!(
                    target: "cfg_migrate",
                    event = "import_tx_commit",
                    created = summary.created,
                    matched = summary.matched,
                    updated = summary.updated
                );
                let domains: BTreeSet<String> = domains.into_iter().collect();
                for domain in &domains {
                    self.cache.invalidate(domain);
                }
                log.info(format!(
                    "committed; invalidated {} cache domain(s)",
                    domains.len()
                ));
                let (lines, warnings) = log.into_parts();
                summary.log = lines;
                summary.warnings = warnings;
                Ok(summary)
            }
            Err(err) => {
                if let Err(rb) = tx.rollback().await {
                    error!(target: "cfg_migrate", event = "import_tx_rollback_failed", error = %rb);
                } else {
                    warn!(
                        target: "cfg_migrate",
                        event = "import_tx_rollback",
                        code = err.code(),
                        error = %err
                    );
                }
                Err(ImportFailure::new(err, log))
            }
        }
    }
}
