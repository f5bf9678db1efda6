#![allow(clippy::unwrap_used, clippy::expect_used)]

mod util;

use cfg_migrate::bundle::{Attachment, Bundle, ColumnValue, CorrelationKey, Manifest, Record};
use cfg_migrate::codec::{self, encode_preferences, Preference};
use cfg_migrate::config::rules_framework_manifest;
use cfg_migrate::export::export_bundle;
use cfg_migrate::store::TransactionalStore;
use cfg_migrate::{
    ImportCoordinator, MigrationConfig, MigrationError, PreferenceImport, ReferenceDataImport,
    RulesFrameworkImport,
};
use util::{count, ctx, id_of, migrated_store, state, workflow, workflow_bundle, RecordingSignal};

fn rules() -> RulesFrameworkImport {
    RulesFrameworkImport::from_config(&MigrationConfig::default())
}

#[tokio::test]
async fn parent_and_child_are_created_with_remapped_key() {
    let store = migrated_store().await;
    // Shift the id space so source ids could never line up by accident.
    sqlx::query("INSERT INTO rf_workflow (id, c_code) VALUES (500, 'wf.other')")
        .execute(store.pool())
        .await
        .unwrap();
    let signal = RecordingSignal::default();
    let payload = codec::encode(&workflow_bundle("wf.approval")).unwrap();

    let summary = ImportCoordinator::new(&store, &signal)
        .import_bundle(&ctx(), &rules(), &payload)
        .await
        .unwrap();

    assert_eq!(summary.created, 2);
    assert_eq!(summary.matched, 0);
    assert_eq!(summary.tables["rf_state"].created, 1);
    let parent = id_of(store.pool(), "rf_workflow", "wf.approval").await;
    let child_parent: i64 = sqlx::query_scalar("SELECT id_parent FROM rf_state WHERE c_code = ?")
        .bind("wf.approval.draft")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(child_parent, parent);
    assert!(signal.domains().contains(&"rf_state".to_string()));
    assert!(!summary.log.is_empty());
}

#[tokio::test]
async fn reimport_matches_instead_of_creating() {
    let store = migrated_store().await;
    let signal = RecordingSignal::default();
    let payload = codec::encode(&workflow_bundle("wf.approval")).unwrap();
    let coordinator = ImportCoordinator::new(&store, &signal);

    coordinator
        .import_bundle(&ctx(), &rules(), &payload)
        .await
        .unwrap();
    let again = coordinator
        .import_bundle(&ctx(), &rules(), &payload)
        .await
        .unwrap();

    assert_eq!(again.created, 0);
    assert_eq!(again.matched, 2);
    assert_eq!(again.updated, 0);
    assert_eq!(count(store.pool(), "rf_workflow").await, 1);
    assert_eq!(count(store.pool(), "rf_state").await, 1);
}

#[tokio::test]
async fn changed_values_are_updated_on_reimport() {
    let store = migrated_store().await;
    let signal = RecordingSignal::default();
    let coordinator = ImportCoordinator::new(&store, &signal);
    let first = codec::encode(&workflow_bundle("wf.approval")).unwrap();
    coordinator
        .import_bundle(&ctx(), &rules(), &first)
        .await
        .unwrap();

    let renamed = Bundle::new(
        rules_framework_manifest(),
        vec![
            workflow("wf.approval").with("c_name", "Approval v2"),
            state("wf.approval.draft", "wf.approval"),
        ],
        vec![],
    )
    .unwrap();
    let summary = coordinator
        .import_bundle(&ctx(), &rules(), &codec::encode(&renamed).unwrap())
        .await
        .unwrap();
    assert_eq!((summary.created, summary.matched, summary.updated), (0, 2, 1));
    let name: String = sqlx::query_scalar("SELECT c_name FROM rf_workflow")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(name, "Approval v2");
}

#[tokio::test]
async fn missing_parent_rolls_back_everything() {
    let store = migrated_store().await;
    let signal = RecordingSignal::default();
    let payload = codec::encode(&workflow_bundle("wf.missing")).unwrap();

    let failure = ImportCoordinator::new(&store, &signal)
        .import_bundle(&ctx(), &rules(), &payload)
        .await
        .unwrap_err();

    match &failure.error {
        MigrationError::UnresolvedReference { references } => {
            assert_eq!(references.len(), 1);
            assert_eq!(references[0].business_key, "wf.missing");
            assert_eq!(references[0].column, "id_parent");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(failure.report_text().contains("wf.missing"));
    assert!(failure
        .report
        .iter()
        .any(|line| line.starts_with("import failed, rolling back changes")));
    assert_eq!(count(store.pool(), "rf_workflow").await, 0);
    assert_eq!(count(store.pool(), "rf_state").await, 0);
    assert!(signal.domains().is_empty());
}

#[tokio::test]
async fn preference_document_creates_two_rows() {
    let store = migrated_store().await;
    let signal = RecordingSignal::default();
    let xml = encode_preferences(&[
        Preference::new("mail.host", "smtp.example.org"),
        Preference::new("ui.theme", "dark"),
    ])
    .unwrap();

    let summary = ImportCoordinator::new(&store, &signal)
        .import_bundle(&ctx(), &PreferenceImport::default(), &xml)
        .await
        .unwrap();

    assert_eq!(summary.created, 2);
    assert_eq!(summary.foreign_keys_rewritten, 0);
    assert_eq!(summary.attachments_stored, 0);
    assert_eq!(count(store.pool(), "system_preferences").await, 2);
    assert_eq!(count(store.pool(), "config_files").await, 0);
    assert_eq!(signal.domains(), vec!["system_preferences".to_string()]);
}

#[tokio::test]
async fn forward_reference_is_filled_after_materialization() {
    let store = migrated_store().await;
    let signal = RecordingSignal::default();
    let bundle = Bundle::new(
        rules_framework_manifest(),
        vec![
            workflow("wf.approval").with("c_start_state", "wf.approval.draft"),
            state("wf.approval.draft", "wf.approval"),
        ],
        vec![],
    )
    .unwrap();

    let summary = ImportCoordinator::new(&store, &signal)
        .import_bundle(&ctx(), &rules(), &codec::encode(&bundle).unwrap())
        .await
        .unwrap();

    assert_eq!(summary.created, 2);
    assert_eq!(summary.updated, 0);
    let start: i64 = sqlx::query_scalar("SELECT c_start_state FROM rf_workflow")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(start, id_of(store.pool(), "rf_state", "wf.approval.draft").await);
    assert!(summary
        .warnings
        .iter()
        .any(|w| w.contains("rf_workflow.c_start_state references rf_state")));
}

fn script_bundle(source: &[u8]) -> Bundle {
    Bundle::new(
        rules_framework_manifest(),
        vec![Record::new("rf_script")
            .with("c_code", "sc.check")
            .with("c_name", "Check limits")
            .with("c_source_file", ColumnValue::Null)],
        vec![Attachment {
            correlation: CorrelationKey {
                table: "rf_script".into(),
                business_key: "sc.check".into(),
                column: "c_source_file".into(),
            },
            file_name: "check.groovy".into(),
            media_type: "text/plain".into(),
            bytes: source.to_vec(),
        }],
    )
    .unwrap()
}

#[tokio::test]
async fn attachments_link_to_their_record_and_reimport_is_idempotent() {
    let store = migrated_store().await;
    let signal = RecordingSignal::default();
    let coordinator = ImportCoordinator::new(&store, &signal);
    let payload = codec::encode(&script_bundle(b"return limit < 10")).unwrap();

    let first = coordinator
        .import_bundle(&ctx(), &rules(), &payload)
        .await
        .unwrap();
    assert_eq!(first.attachments_stored, 1);
    let (file_id, name): (i64, String) =
        sqlx::query_as("SELECT c_source_file, c_code FROM rf_script")
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(name, "sc.check");
    let content: Vec<u8> = sqlx::query_scalar("SELECT content FROM config_files WHERE id = ?")
        .bind(file_id)
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(content, b"return limit < 10");

    let second = coordinator
        .import_bundle(&ctx(), &rules(), &payload)
        .await
        .unwrap();
    assert_eq!((second.created, second.matched), (0, 1));
    assert_eq!((second.attachments_stored, second.attachments_unchanged), (0, 1));
    assert_eq!(count(store.pool(), "config_files").await, 1);

    let changed = codec::encode(&script_bundle(b"return limit < 20")).unwrap();
    let third = coordinator
        .import_bundle(&ctx(), &rules(), &changed)
        .await
        .unwrap();
    assert_eq!(third.attachments_stored, 1);
    assert_eq!(count(store.pool(), "config_files").await, 1);
}

fn parameter_manifest() -> Manifest {
    rules_framework_manifest()
        .subset(&["rf_script_parameter"])
        .unwrap()
}

fn parameter(code: &str, lookup: &str) -> Record {
    Record::new("rf_script_parameter")
        .with("c_code", code)
        .with("c_order", 1i64)
        .with("id_parent", "sc.check")
        .with("c_type", ColumnValue::Null)
        .with("c_lookup", lookup)
}

fn script() -> Record {
    Record::new("rf_script")
        .with("c_code", "sc.check")
        .with("c_source_file", ColumnValue::Null)
}

#[tokio::test]
async fn placeholders_are_created_only_for_configured_tables() {
    let store = migrated_store().await;
    let signal = RecordingSignal::default();
    let bundle = Bundle::new(
        parameter_manifest(),
        vec![script(), parameter("pa.country", "lk.countries")],
        vec![],
    )
    .unwrap();
    let payload = codec::encode(&bundle).unwrap();
    let coordinator = ImportCoordinator::new(&store, &signal);

    let strict = coordinator
        .import_bundle(&ctx(), &rules(), &payload)
        .await
        .unwrap_err();
    assert!(matches!(strict.error, MigrationError::UnresolvedReference { .. }));

    let lenient = ReferenceDataImport::new(["rf_lookup"], Default::default());
    let summary = coordinator
        .import_bundle(&ctx(), &lenient, &payload)
        .await
        .unwrap();
    assert_eq!(summary.created, 2);
    assert_eq!(summary.placeholders, 1);
    assert!(summary.warnings.iter().any(|w| w.contains("placeholder rf_lookup")));
    let lookup = id_of(store.pool(), "rf_lookup", "lk.countries").await;
    let linked: i64 = sqlx::query_scalar("SELECT c_lookup FROM rf_script_parameter")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(linked, lookup);
}

#[tokio::test]
async fn reference_to_existing_target_row_is_reported() {
    let store = migrated_store().await;
    sqlx::query("INSERT INTO rf_lookup (id, c_code) VALUES (42, 'lk.currency')")
        .execute(store.pool())
        .await
        .unwrap();
    let signal = RecordingSignal::default();
    let bundle = Bundle::new(
        parameter_manifest(),
        vec![script(), parameter("pa.currency", "lk.currency")],
        vec![],
    )
    .unwrap();

    let summary = ImportCoordinator::new(&store, &signal)
        .import_bundle(&ctx(), &rules(), &codec::encode(&bundle).unwrap())
        .await
        .unwrap();
    let linked: i64 = sqlx::query_scalar("SELECT c_lookup FROM rf_script_parameter")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(linked, 42);
    assert!(summary
        .warnings
        .iter()
        .any(|w| w.contains("resolved to existing rf_lookup \"lk.currency\"")));
}

#[tokio::test]
async fn table_outside_the_flavor_is_refused() {
    let store = migrated_store().await;
    sqlx::query("CREATE TABLE country (id INTEGER PRIMARY KEY, iso TEXT)")
        .execute(store.pool())
        .await
        .unwrap();
    let bundle = Bundle::new(
        Manifest::new(vec![cfg_migrate::TableManifest::new("country", "iso")]),
        vec![Record::new("country").with("iso", "IE")],
        vec![],
    )
    .unwrap();
    let payload = codec::encode(&bundle).unwrap();
    let signal = RecordingSignal::default();
    let coordinator = ImportCoordinator::new(&store, &signal);

    let failure = coordinator
        .import_bundle(&ctx(), &rules(), &payload)
        .await
        .unwrap_err();
    assert!(matches!(failure.error, MigrationError::TableNotAllowed { .. }));

    let reference = ReferenceDataImport::new(Vec::<String>::new(), Default::default());
    let summary = coordinator
        .import_bundle(&ctx(), &reference, &payload)
        .await
        .unwrap();
    assert_eq!(summary.created, 1);
}

async fn node_store() -> cfg_migrate::SqliteStore {
    let store = migrated_store().await;
    for sql in [
        "CREATE TABLE node (id INTEGER PRIMARY KEY, c_code TEXT NOT NULL UNIQUE, \
         c_next INTEGER NOT NULL REFERENCES node(id))",
        "INSERT INTO node (id, c_code, c_next) VALUES (1, 'root', 1)",
    ] {
        sqlx::query(sql).execute(store.pool()).await.unwrap();
    }
    store
}

fn node_bundle(links: &[(&str, &str)]) -> Vec<u8> {
    let manifest = Manifest::new(vec![cfg_migrate::TableManifest::new("node", "c_code")
        .with_foreign_key("c_next", "node", false)]);
    let records = links
        .iter()
        .map(|(code, next)| Record::new("node").with("c_code", *code).with("c_next", *next))
        .collect();
    codec::encode(&Bundle::new(manifest, records, vec![]).unwrap()).unwrap()
}

#[tokio::test]
async fn required_reference_to_a_later_record_is_inserted_in_order() {
    let store = node_store().await;
    let signal = RecordingSignal::default();
    let reference = ReferenceDataImport::new(Vec::<String>::new(), Default::default());
    let payload = node_bundle(&[("a", "b"), ("b", "root")]);

    let summary = ImportCoordinator::new(&store, &signal)
        .import_bundle(&ctx(), &reference, &payload)
        .await
        .unwrap();

    assert_eq!(summary.created, 2);
    let b = id_of(store.pool(), "node", "b").await;
    let next_of = |code: &'static str| {
        sqlx::query_scalar::<_, i64>("SELECT c_next FROM node WHERE c_code = ?")
            .bind(code)
            .fetch_one(store.pool())
    };
    assert_eq!(next_of("a").await.unwrap(), b);
    assert_eq!(next_of("b").await.unwrap(), 1);

    // The root already exists, so a bundle that loops back through it is fine.
    let payload = node_bundle(&[("root", "c"), ("c", "root")]);
    let summary = ImportCoordinator::new(&store, &signal)
        .import_bundle(&ctx(), &reference, &payload)
        .await
        .unwrap();
    assert_eq!(summary.created, 1);
    assert_eq!(summary.matched, 1);
}

#[tokio::test]
async fn required_reference_cycle_is_refused_before_writing() {
    let store = node_store().await;
    let signal = RecordingSignal::default();
    let reference = ReferenceDataImport::new(Vec::<String>::new(), Default::default());
    let payload = node_bundle(&[("fresh", "root"), ("x", "y"), ("y", "x")]);

    let failure = ImportCoordinator::new(&store, &signal)
        .import_bundle(&ctx(), &reference, &payload)
        .await
        .unwrap_err();

    assert_eq!(failure.error.code(), "IMPORT/REFERENCE_CYCLE");
    let offenders = failure.error.offenders();
    assert!(offenders.iter().any(|o| o.contains("\"x\"")), "{offenders:?}");
    assert!(offenders.iter().any(|o| o.contains("\"y\"")), "{offenders:?}");
    assert_eq!(count(store.pool(), "node").await, 1);
    assert!(signal.domains().is_empty());
}

#[tokio::test]
async fn export_from_one_database_imports_into_another() {
    let source = migrated_store().await;
    for sql in [
        "INSERT INTO rf_workflow (id, c_code, c_name) VALUES (7, 'wf.approval', 'Approval')",
        "INSERT INTO rf_state (id, c_code, c_name, id_parent) VALUES (70, 'st.draft', 'Draft', 7)",
        "INSERT INTO rf_state (id, c_code, c_name, id_parent) VALUES (71, 'st.done', 'Done', 7)",
        "UPDATE rf_workflow SET c_start_state = 70 WHERE id = 7",
        "INSERT INTO rf_transition (id, c_code, id_parent, c_to_state) VALUES (700, 'tr.finish', 70, 71)",
    ] {
        sqlx::query(sql).execute(source.pool()).await.unwrap();
    }
    let mut tx = source.begin().await.unwrap();
    let bundle = export_bundle(&mut tx, &rules_framework_manifest()).await.unwrap();
    drop(tx);
    let payload = codec::encode(&bundle).unwrap();

    let target = migrated_store().await;
    sqlx::query("INSERT INTO rf_workflow (id, c_code) VALUES (1, 'wf.local')")
        .execute(target.pool())
        .await
        .unwrap();
    let signal = RecordingSignal::default();
    let summary = ImportCoordinator::new(&target, &signal)
        .import_bundle(&ctx(), &rules(), &payload)
        .await
        .unwrap();
    assert_eq!(summary.created, 4);

    let pool = target.pool();
    let workflow = id_of(pool, "rf_workflow", "wf.approval").await;
    let draft = id_of(pool, "rf_state", "st.draft").await;
    let done = id_of(pool, "rf_state", "st.done").await;
    assert_ne!(workflow, 7);
    let (start,): (i64,) = sqlx::query_as("SELECT c_start_state FROM rf_workflow WHERE id = ?")
        .bind(workflow)
        .fetch_one(pool)
        .await
        .unwrap();
    assert_eq!(start, draft);
    let (from, to): (i64, i64) =
        sqlx::query_as("SELECT id_parent, c_to_state FROM rf_transition WHERE c_code = 'tr.finish'")
            .fetch_one(pool)
            .await
            .unwrap();
    assert_eq!((from, to), (draft, done));

    let dangling: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM rf_state s LEFT JOIN rf_workflow w ON w.id = s.id_parent WHERE w.id IS NULL",
    )
    .fetch_one(pool)
    .await
    .unwrap();
    assert_eq!(dangling, 0);
}
