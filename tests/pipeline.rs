mod support;

use std::collections::BTreeSet;
use std::fs;

use assert_matches::assert_matches;

use focos_enricher::domain::{Category, Role};
use focos_enricher::error::{FocosError, Stage};
use focos_enricher::export::{StableAction, group_backups};
use focos_enricher::pipeline::Pipeline;
use focos_enricher::table::Value;

use support::{Call, MemoryStore, RecordingSink, RecordingWriter, WktLoader, feature, square};

const OBSERVATIONS: &[u8] = b"lat,lon,value\n-4.5,-44.5,1\n-3.0,-40.0,2\n-10.0,-50.0,3\n";

/// Observations and results folders with one observation file and one empty file.
fn base_store() -> (MemoryStore, String, String) {
    let store = MemoryStore::new();
    let observations = store.folder("1. Focos", None);
    let results = store.folder("3. Resultados", None);
    store.file(&observations, "focos_2024.csv", OBSERVATIONS);
    store.file(&observations, "focos_vazio.csv", b"");
    (store, observations, results)
}

fn municipios_loader() -> WktLoader {
    WktLoader::new().with_layer(
        "BR_Municipios_2022",
        &["NM_MUN", "AREA_KM2"],
        vec![feature(
            square(-45.0, -5.0, 1.0),
            &[("NM_MUN", "Caxias"), ("AREA_KM2", "5150")],
        )],
    )
}

#[test]
fn run_without_references_exports_plain_points() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _, _) = base_store();
    let writer = RecordingWriter::default();
    let pipeline = Pipeline::new(
        store,
        WktLoader::new(),
        writer.clone(),
        support::settings_in(dir.path()),
    );

    let report = pipeline.run(&RecordingSink::default()).unwrap();

    assert_eq!(report.tabular_files, 2);
    assert_eq!(report.records, 3);
    assert!(report.categories.is_empty());
    let columns: BTreeSet<String> = writer.last_workbook().unwrap().columns.into_iter().collect();
    let expected: BTreeSet<String> = ["value", "lat", "lon"].map(String::from).into();
    assert_eq!(columns, expected);

    let stages: Vec<Stage> = report.degradations.iter().map(|d| d.stage).collect();
    assert!(stages.contains(&Stage::Consolidate));
    assert!(stages.contains(&Stage::Resolve));
}

#[test]
fn municipality_join_fills_only_contained_points() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _, _) = base_store();
    let references = store.folder("2. Referências Espaciais", None);
    store.shapefile(&references, "BR_Municipios_2022");
    let writer = RecordingWriter::default();
    let pipeline = Pipeline::new(
        store,
        municipios_loader(),
        writer.clone(),
        support::settings_in(dir.path()),
    );

    let report = pipeline.run(&RecordingSink::default()).unwrap();

    assert_eq!(report.categories, vec![Category::Municipios]);
    let written = writer.last_workbook().unwrap();
    assert_eq!(written.rows, 3);
    assert!(!written.columns.contains(&"AREA_KM2".to_string()));
    assert!(!written.columns.contains(&"index_right".to_string()));
    assert_eq!(
        written.table.column("NM_MUN").unwrap(),
        &[Value::Text("Caxias".to_string()), Value::Null, Value::Null]
    );
}

#[test]
fn stable_workbook_is_updated_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _, results) = base_store();
    let existing = store.file(&results, "focos_qualificados_atual.xlsx", b"old");
    let pipeline = Pipeline::new(
        store,
        WktLoader::new(),
        RecordingWriter::default(),
        support::settings_in(dir.path()),
    );

    let report = pipeline.run(&RecordingSink::default()).unwrap();

    assert_eq!(report.publish.stable_id.as_deref(), Some(existing.as_str()));
    assert_eq!(report.publish.stable_action, Some(StableAction::Updated));
    let store = pipeline.store();
    let stable_copies = store
        .files_in(&results)
        .into_iter()
        .filter(|file| file.name == "focos_qualificados_atual.xlsx")
        .count();
    assert_eq!(stable_copies, 1);
    assert_ne!(store.content(&existing).unwrap(), b"old".to_vec());
    assert!(store.calls().contains(&Call::Update { id: existing.clone() }));
    assert!(store.calls().contains(&Call::Grant { id: existing }));
}

#[test]
fn stable_workbook_is_created_on_first_run() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _, results) = base_store();
    let pipeline = Pipeline::new(
        store,
        WktLoader::new(),
        RecordingWriter::default(),
        support::settings_in(dir.path()),
    );

    let report = pipeline.run(&RecordingSink::default()).unwrap();

    assert_eq!(report.publish.stable_action, Some(StableAction::Created));
    let names: Vec<String> = pipeline
        .store()
        .files_in(&results)
        .into_iter()
        .map(|file| file.name)
        .collect();
    assert!(names.contains(&"focos_qualificados_atual.xlsx".to_string()));
    assert!(names.iter().any(|name| name.ends_with(".shp")));
    assert!(report.publish.descriptor.is_some());

    let descriptor = fs::read_to_string(dir.path().join("data/current_data_link.json")).unwrap();
    let descriptor: serde_json::Value = serde_json::from_str(&descriptor).unwrap();
    assert_eq!(descriptor["total_records"], 3);
    assert_eq!(descriptor["filename"], "focos_qualificados_atual.xlsx");
}

#[test]
fn failed_essential_part_excludes_layer_but_run_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _, _) = base_store();
    let references = store.folder("2. Referências Espaciais", None);
    let parts = store.shapefile(&references, "BR_Municipios_2022");
    store.fail_download(&parts[".dbf"]);
    let writer = RecordingWriter::default();
    let pipeline = Pipeline::new(
        store,
        municipios_loader(),
        writer.clone(),
        support::settings_in(dir.path()),
    );

    let report = pipeline.run(&RecordingSink::default()).unwrap();

    assert!(report.is_degraded());
    assert!(report.categories.is_empty());
    assert!(report.degradations.iter().any(|d| d.stage == Stage::Fetch
        && d.item.as_deref() == Some("BR_Municipios_2022.shp")));
    assert!(!writer.last_workbook().unwrap().columns.contains(&"NM_MUN".to_string()));
}

#[test]
fn overlapping_conservation_units_are_aggregated() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _, _) = base_store();
    let references = store.folder("2. Referências Espaciais", None);
    let units = store.folder("Unidades de Conservação", Some(&references));
    store.shapefile(&units, "uc_estaduais");
    store.shapefile(&references, "BR_Municipios_2022");
    let loader = municipios_loader().with_layer(
        "uc_estaduais",
        &["NOME_UC1"],
        vec![
            feature(square(-46.0, -6.0, 2.0), &[("NOME_UC1", "APA A")]),
            feature(square(-45.0, -5.0, 2.0), &[("NOME_UC1", "Parque B")]),
        ],
    );
    let writer = RecordingWriter::default();
    let pipeline = Pipeline::new(store, loader, writer.clone(), support::settings_in(dir.path()));

    let report = pipeline.run(&RecordingSink::default()).unwrap();

    assert_eq!(report.categories, vec![Category::Municipios, Category::Ucs]);
    let written = writer.last_workbook().unwrap();
    assert_eq!(written.columns.last().map(String::as_str), Some("ucs"));
    assert_eq!(
        written.table.column("ucs").unwrap(),
        &[
            Value::Text("APA A, Parque B".to_string()),
            Value::Text(String::new()),
            Value::Text(String::new()),
        ]
    );
}

#[test]
fn only_five_backup_generations_survive() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _, results) = base_store();
    for day in 1..=7 {
        let stem = format!("focos_qualificados_202301{day:02}_000000");
        store.file(&results, &format!("{stem}.xlsx"), b"x");
        store.file(&results, &format!("{stem}.shp"), b"x");
    }
    let pipeline = Pipeline::new(
        store,
        WktLoader::new(),
        RecordingWriter::default(),
        support::settings_in(dir.path()),
    );

    let report = pipeline.run(&RecordingSink::default()).unwrap();

    let remaining = group_backups("focos_qualificados_", pipeline.store().files_in(&results)).unwrap();
    assert_eq!(remaining.len(), 5);
    // Seven old generations plus the new one, minus five kept.
    assert_eq!(report.publish.backups_deleted.len(), 3 * 2);
    assert!(
        report
            .publish
            .backups_deleted
            .iter()
            .all(|name| name.contains("2023010"))
    );
    assert!(
        pipeline
            .store()
            .files_in(&results)
            .iter()
            .any(|file| file.name == "focos_qualificados_atual.xlsx")
    );
}

#[test]
fn missing_results_folder_keeps_exports_local() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    let observations = store.folder("Focos de calor", None);
    store.file(&observations, "focos.csv", OBSERVATIONS);
    let pipeline = Pipeline::new(
        store,
        WktLoader::new(),
        RecordingWriter::default(),
        support::settings_in(dir.path()),
    );

    let report = pipeline.run(&RecordingSink::default()).unwrap();

    assert_eq!(report.roles.folder(Role::Observations).unwrap().name, "Focos de calor");
    assert!(report.publish.stable_id.is_none());
    assert!(report.degradations.iter().any(|d| d.stage == Stage::Publish));
    assert!(pipeline.store().calls().is_empty());

    // Exports outlive the run; only the staging directory is removed.
    let workbook = report.publish.local_workbook.unwrap();
    assert!(workbook.as_std_path().exists());
    assert!(workbook.starts_with(dir.path().join("data")));
    assert!(!report.publish.local_vector.is_empty());
    assert!(
        report
            .publish
            .local_vector
            .iter()
            .all(|part| part.as_std_path().exists())
    );
    let leftovers: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(leftovers, vec!["data".to_string()]);
}

#[test]
fn failed_vector_export_still_publishes_the_workbook() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _, results) = base_store();
    let pipeline = Pipeline::new(
        store,
        WktLoader::new(),
        RecordingWriter::failing_vector(),
        support::settings_in(dir.path()),
    );

    let report = pipeline.run(&RecordingSink::default()).unwrap();

    assert_eq!(report.publish.stable_action, Some(StableAction::Created));
    assert!(report.publish.local_vector.is_empty());
    assert!(report.degradations.iter().any(|d| d.stage == Stage::Export
        && d.reason.starts_with("vector export failed")));
    let names: Vec<String> = pipeline
        .store()
        .files_in(&results)
        .into_iter()
        .map(|file| file.name)
        .collect();
    assert!(names.iter().all(|name| !name.ends_with(".shp")));
    assert!(names.iter().any(|name| name.starts_with("focos_qualificados_2") && name.ends_with(".xlsx")));
}

#[test]
fn failed_permission_grant_is_degraded() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _, _) = base_store();
    store.fail_grants();
    let pipeline = Pipeline::new(
        store,
        WktLoader::new(),
        RecordingWriter::default(),
        support::settings_in(dir.path()),
    );

    let report = pipeline.run(&RecordingSink::default()).unwrap();

    assert!(report.publish.stable_id.is_some());
    assert!(report.publish.descriptor.is_some());
    assert!(
        report
            .degradations
            .iter()
            .any(|d| d.reason.contains("public read grant failed"))
    );
}

#[test]
fn missing_observations_folder_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    store.folder("3. Resultados", None);
    let pipeline = Pipeline::new(
        store,
        WktLoader::new(),
        RecordingWriter::default(),
        support::settings_in(dir.path()),
    );

    let err = pipeline.run(&RecordingSink::default()).unwrap_err();
    assert_matches!(err, FocosError::ObservationsFolderMissing);
    assert!(err.is_fatal_precondition());
}

#[test]
fn observations_without_tabular_files_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    let observations = store.folder("1. Focos", None);
    store.file(&observations, "leia-me.txt", b"nothing here");
    let pipeline = Pipeline::new(
        store,
        WktLoader::new(),
        RecordingWriter::default(),
        support::settings_in(dir.path()),
    );

    assert_matches!(
        pipeline.run(&RecordingSink::default()),
        Err(FocosError::NoTabularFiles)
    );
}

#[test]
fn missing_coordinates_is_fatal_and_staging_is_removed() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    let observations = store.folder("1. Focos", None);
    store.file(&observations, "focos.csv", b"latitude,value\n-4.5,1\n");
    let pipeline = Pipeline::new(
        store,
        WktLoader::new(),
        RecordingWriter::default(),
        support::settings_in(dir.path()),
    );

    assert_matches!(
        pipeline.run(&RecordingSink::default()),
        Err(FocosError::MissingCoordinateColumns(column)) if column == "lat"
    );
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn rows_without_coordinates_leave_nothing_to_export() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    let observations = store.folder("1. Focos", None);
    store.file(&observations, "focos.csv", b"lat,lon,value\n,,1\nNA,-44.0,2\n");
    let pipeline = Pipeline::new(
        store,
        WktLoader::new(),
        RecordingWriter::default(),
        support::settings_in(dir.path()),
    );

    assert_matches!(
        pipeline.run(&RecordingSink::default()),
        Err(FocosError::NoValidRows)
    );
}

#[test]
fn progress_reports_every_phase() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _, _) = base_store();
    let pipeline = Pipeline::new(
        store,
        WktLoader::new(),
        RecordingWriter::default(),
        support::settings_in(dir.path()),
    );
    let sink = RecordingSink::default();

    pipeline.run(&sink).unwrap();

    let messages = sink.messages.lock().unwrap();
    for phase in ["Resolve", "Fetch", "Consolidate", "Export", "Publish"] {
        assert!(
            messages
                .iter()
                .any(|message| message.starts_with(&format!("phase={phase};"))),
            "no {phase} event in {messages:?}"
        );
    }
}
