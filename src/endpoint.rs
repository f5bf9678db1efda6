//! Upload response contract: one binary payload in, a small JSON object
//! out. Request handling and authentication belong to the host service.

use serde::{Deserialize, Serialize};

use crate::cache::CacheSignal;
use crate::import::{
    ImportCoordinator, ImportFailure, ImportLogic, ImportSummary, MigrationContext,
};
use crate::store::TransactionalStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UploadResponse {
    #[serde(rename_all = "camelCase")]
    Completed {
        created: u64,
        matched: u64,
        updated: u64,
        attachments_stored: u64,
        warnings: Vec<String>,
    },
    Failed {
        /// The rollback report, one offender per line.
        error: String,
    },
}

impl UploadResponse {
    pub fn from_outcome(outcome: &Result<ImportSummary, ImportFailure>) -> Self {
        match outcome {
            Ok(summary) => UploadResponse::Completed {
                created: summary.created,
                matched: summary.matched,
                updated: summary.updated,
                attachments_stored: summary.attachments_stored,
                warnings: summary.warnings.clone(),
            },
            Err(failure) => UploadResponse::Failed {
                error: failure.report_text(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, UploadResponse::Completed { .. })
    }
}

/// Runs one upload through the coordinator and shapes the response.
pub async fn handle_upload<T, C, L>(
    store: &T,
    cache: &C,
    logic: &L,
    ctx: &MigrationContext,
    payload: &[u8],
) -> UploadResponse
where
    T: TransactionalStore,
    C: CacheSignal + ?Sized,
    L: ImportLogic,
{
    let outcome = ImportCoordinator::new(store, cache)
        .import_bundle(ctx, logic, payload)
        .await;
    UploadResponse::from_outcome(&outcome)
}
