use async_trait::async_trait;

use crate::bundle::Bundle;
use crate::codec::{self, Preference};
use crate::config::MigrationConfig;
use crate::error::MigrationError;
use crate::preferences::{apply_preferences, PREFERENCES_TABLE};
use crate::store::TargetStore;

use super::{apply_structured, DuplicatePolicy, ImportLog, ImportLogic, ImportPolicy, ImportSummary};

fn structured_domains(bundle: &Bundle) -> Vec<String> {
    bundle.manifest().table_names().map(str::to_string).collect()
}

/// Workflow and script definitions. Only Rules Framework tables are
/// accepted and every reference must resolve; no placeholders are created.
#[derive(Debug, Clone)]
pub struct RulesFrameworkImport {
    policy: ImportPolicy,
}

impl RulesFrameworkImport {
    pub const FLAVOR: &'static str = "rules_framework";

    pub fn new<I, S>(tables: I, duplicate_policy: DuplicatePolicy) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            policy: ImportPolicy {
                flavor: Self::FLAVOR.to_string(),
                allowed_tables: Some(tables.into_iter().map(Into::into).collect()),
                placeholder_tables: Default::default(),
                duplicate_policy,
            },
        }
    }

    pub fn from_config(config: &MigrationConfig) -> Self {
        Self::new(
            config.rules_framework.tables.iter().cloned(),
            config.import.duplicate_policy,
        )
    }

    pub fn policy(&self) -> &ImportPolicy {
        &self.policy
    }
}

#[async_trait]
impl ImportLogic for RulesFrameworkImport {
    type Bundle = Bundle;

    fn name(&self) -> &'static str {
        Self::FLAVOR
    }

    fn decode(&self, payload: &[u8]) -> Result<Bundle, MigrationError> {
        codec::decode(payload)
    }

    fn affected_domains(&self, bundle: &Bundle) -> Vec<String> {
        structured_domains(bundle)
    }

    async fn apply<S: TargetStore>(
        &self,
        store: &mut S,
        bundle: &Bundle,
        log: &mut ImportLog,
    ) -> Result<ImportSummary, MigrationError> {
        apply_structured(store, bundle, &self.policy, log).await
    }
}

/// Generic reference data: any declared table, with placeholder creation
/// for the configured tables.
#[derive(Debug, Clone)]
pub struct ReferenceDataImport {
    policy: ImportPolicy,
}

impl ReferenceDataImport {
    pub const FLAVOR: &'static str = "reference_data";

    pub fn new<I, S>(placeholder_tables: I, duplicate_policy: DuplicatePolicy) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            policy: ImportPolicy {
                flavor: Self::FLAVOR.to_string(),
                allowed_tables: None,
                placeholder_tables: placeholder_tables.into_iter().map(Into::into).collect(),
                duplicate_policy,
            },
        }
    }

    pub fn from_config(config: &MigrationConfig) -> Self {
        Self::new(
            config.import.placeholder_tables.iter().cloned(),
            config.import.duplicate_policy,
        )
    }

    pub fn policy(&self) -> &ImportPolicy {
        &self.policy
    }
}

#[async_trait]
impl ImportLogic for ReferenceDataImport {
    type Bundle = Bundle;

    fn name(&self) -> &'static str {
        Self::FLAVOR
    }

    fn decode(&self, payload: &[u8]) -> Result<Bundle, MigrationError> {
        codec::decode(payload)
    }

    fn affected_domains(&self, bundle: &Bundle) -> Vec<String> {
        structured_domains(bundle)
    }

    async fn apply<S: TargetStore>(
        &self,
        store: &mut S,
        bundle: &Bundle,
        log: &mut ImportLog,
    ) -> Result<ImportSummary, MigrationError> {
        apply_structured(store, bundle, &self.policy, log).await
    }
}

#[derive(Debug, Clone, Default)]
pub struct PreferenceImport {
    duplicate_policy: DuplicatePolicy,
}

impl PreferenceImport {
    pub const FLAVOR: &'static str = "preferences";

    pub fn new(duplicate_policy: DuplicatePolicy) -> Self {
        Self { duplicate_policy }
    }

    pub fn from_config(config: &MigrationConfig) -> Self {
        Self::new(config.import.duplicate_policy)
    }
}

#[async_trait]
impl ImportLogic for PreferenceImport {
    type Bundle = Vec<Preference>;

    fn name(&self) -> &'static str {
        Self::FLAVOR
    }

    fn decode(&self, payload: &[u8]) -> Result<Vec<Preference>, MigrationError> {
        codec::decode_preferences(payload)
    }

    fn affected_domains(&self, _bundle: &Vec<Preference>) -> Vec<String> {
        vec![PREFERENCES_TABLE.to_string()]
    }

    async fn apply<S: TargetStore>(
        &self,
        store: &mut S,
        bundle: &Vec<Preference>,
        log: &mut ImportLog,
    ) -> Result<ImportSummary, MigrationError> {
        apply_preferences(store, bundle, self.duplicate_policy, log).await
    }
}
