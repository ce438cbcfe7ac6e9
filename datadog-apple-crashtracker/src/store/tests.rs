// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::*;

const RUN_ID: &str = "0a1b2c3d-4e5f-6071-8293-a4b5c6d7e8f9";

fn make_store(dir: &Path) -> ReportStore {
    ReportStore::new(
        dir.to_path_buf(),
        dir.join("ReportSidecars"),
        dir.join("RunSidecars"),
        "myapp".to_string(),
        RUN_ID.to_string(),
        4,
    )
}

fn minimal_report(run_id: &str) -> String {
    format!(
        r#"{{"report_version_major": 1, "report_version_minor": 0,
            "crash_id": "1d6b97cb-968c-40c9-af6e-e4b4d71e8781",
            "run_id":"{run_id}", "timestamp": 1,
            "crash": {{"threads": [], "error": {{"signal": 11, "type": "signal"}},
                       "binary_images": []}}}}"#
    )
}

#[test]
fn test_initialize_creates_tree() {
    let dir = tempfile::tempdir().unwrap();
    let store = make_store(dir.path());
    store.initialize().unwrap();
    assert!(dir.path().join("ReportSidecars").is_dir());
    assert!(dir.path().join("RunSidecars").is_dir());
    assert_eq!(store.report_count(), 0);
}

#[test]
fn test_ids_are_monotonic_and_paths_resolve() {
    let dir = tempfile::tempdir().unwrap();
    let store = make_store(dir.path());
    store.initialize().unwrap();

    let (id1, path1) = store.next_report();
    let (id2, path2) = store.next_report();
    assert!(id2 > id1);
    assert_ne!(path1, path2);
    assert!(path1
        .file_name()
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("myapp-report-"));
    assert!(path1.to_str().unwrap().ends_with(".json"));
    assert_eq!(store.report_path_for_id(id1), path1);
}

#[test]
fn test_add_read_delete_user_report() {
    let dir = tempfile::tempdir().unwrap();
    let store = make_store(dir.path());
    store.initialize().unwrap();

    let id = store.add_user_report(minimal_report(RUN_ID).as_bytes()).unwrap();
    assert_eq!(store.report_count(), 1);
    assert_eq!(store.report_ids(), vec![id]);

    let report = store.read_report(id, &NoStitcher).unwrap();
    let value: serde_json::Value = serde_json::from_str(&report).unwrap();
    assert_eq!(value["run_id"], RUN_ID);

    store.delete_report(id);
    assert_eq!(store.report_count(), 0);
    assert!(store.read_report(id, &NoStitcher).is_err());
}

#[test]
fn test_prune_deletes_oldest_first() {
    let dir = tempfile::tempdir().unwrap();
    let store = make_store(dir.path());
    store.initialize().unwrap();

    // max_report_count is 4; create 7.
    let mut ids = Vec::new();
    for _ in 0..7 {
        ids.push(store.add_user_report(minimal_report(RUN_ID).as_bytes()).unwrap());
    }
    assert_eq!(store.report_count(), 7);

    // Re-initialization prunes.
    store.initialize().unwrap();
    assert_eq!(store.report_count(), 4);
    let surviving = store.report_ids();
    assert_eq!(surviving, ids[3..].to_vec());
    // The pruned ids no longer resolve.
    for &gone in &ids[..3] {
        assert!(store.read_report(gone, &NoStitcher).is_err());
    }
}

#[test]
fn test_report_sidecar_stitching() {
    struct MarkStitcher;
    impl SidecarStitcher for MarkStitcher {
        fn stitch(
            &self,
            monitor_id: &str,
            report: &str,
            sidecar_path: &Path,
            scope: SidecarScope,
        ) -> Option<String> {
            assert!(sidecar_path.exists());
            let mut value: serde_json::Value = serde_json::from_str(report).ok()?;
            value[format!("stitched_{monitor_id}")] =
                serde_json::Value::String(format!("{scope:?}"));
            Some(value.to_string())
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let store = make_store(dir.path());
    store.initialize().unwrap();

    let id = store.add_user_report(minimal_report(RUN_ID).as_bytes()).unwrap();
    let report_sidecar = store.report_sidecar_path("watchdog", id).unwrap();
    std::fs::write(&report_sidecar, b"sidecar-bytes").unwrap();
    let run_sidecar = store.run_sidecar_path("watchdog").unwrap();
    std::fs::write(&run_sidecar, b"run-bytes").unwrap();

    let report = store.read_report(id, &MarkStitcher).unwrap();
    let value: serde_json::Value = serde_json::from_str(&report).unwrap();
    // Both scopes stitched; report scope ran second.
    assert_eq!(value["stitched_watchdog"], "Report");
}

#[test]
fn test_orphan_run_sidecar_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let store = make_store(dir.path());
    store.initialize().unwrap();

    // A report from an older run keeps that run's sidecars alive.
    let old_run = "11111111-2222-3333-4444-555555555555";
    store.add_user_report(minimal_report(old_run).as_bytes()).unwrap();
    let old_dir = dir.path().join("RunSidecars").join(old_run);
    std::fs::create_dir_all(&old_dir).unwrap();
    std::fs::write(old_dir.join("watchdog.ksscr"), b"x").unwrap();

    // The current run's directory also survives.
    let current_dir = dir.path().join("RunSidecars").join(RUN_ID);
    std::fs::create_dir_all(&current_dir).unwrap();

    // An orphan with no matching report is deleted.
    let orphan_dir = dir
        .path()
        .join("RunSidecars")
        .join("99999999-8888-7777-6666-555555555555");
    std::fs::create_dir_all(&orphan_dir).unwrap();
    std::fs::write(orphan_dir.join("watchdog.ksscr"), b"y").unwrap();

    store.cleanup_orphaned_run_sidecars();
    assert!(old_dir.is_dir());
    assert!(current_dir.is_dir());
    assert!(!orphan_dir.exists());
}

#[test]
fn test_delete_all_reports() {
    let dir = tempfile::tempdir().unwrap();
    let store = make_store(dir.path());
    store.initialize().unwrap();

    let id = store.add_user_report(minimal_report(RUN_ID).as_bytes()).unwrap();
    store.report_sidecar_path("m", id).unwrap();
    store.run_sidecar_path("m").unwrap();
    // A non-report file in the install dir must survive.
    let state_file = dir.path().join("myapp-state.json");
    std::fs::write(&state_file, b"{}").unwrap();

    store.delete_all_reports();
    assert_eq!(store.report_count(), 0);
    assert!(state_file.exists());
}

#[test]
fn test_run_id_extraction() {
    let report = minimal_report(RUN_ID);
    assert_eq!(extract_run_id(report.as_bytes()), Some(RUN_ID));
    assert_eq!(extract_run_id(b"no id here"), None);
    // Invalid uuid is rejected.
    assert_eq!(
        extract_run_id(br#"{"run_id":"not-a-uuid-but-36-characters-long"}"#),
        None
    );
}

#[test]
fn test_filename_parsing_rejects_foreign_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = make_store(dir.path());
    store.initialize().unwrap();

    std::fs::write(dir.path().join("other-report-0000000000000001.json"), b"{}").unwrap();
    std::fs::write(dir.path().join("myapp-report-zzzz.json"), b"{}").unwrap();
    std::fs::write(dir.path().join("myapp-state.json"), b"{}").unwrap();
    assert_eq!(store.report_count(), 0);
}
