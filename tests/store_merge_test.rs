// ==========================================
// 存储合并语义测试
// ==========================================
// 测试目标: 按种类覆写、重复导入幂等、历史账本仅追加
// ==========================================


use health_import::importer::HealthImporter;
use health_import::repository::HealthStore;
use health_import::MetricKind;

#[tokio::test]
async fn test_reimport_is_idempotent() {
    let (_temp_file, importer) = test_helpers::setup();
    let path = test_helpers::fixture_path("export.xml");

    importer.import_file(&path).await.unwrap();
    let first = importer.store().read_all().await.unwrap();

    importer.import_file(&path).await.unwrap();
    let second = importer.store().read_all().await.unwrap();

    // 数据完全一致，只多一条历史
    assert_eq!(first.series, second.series);
    assert_eq!(first.history.len(), 1);
    assert_eq!(second.history.len(), 2);
    assert_ne!(second.history[0].import_id, second.history[1].import_id);
}

#[tokio::test]
async fn test_partial_import_keeps_other_kinds() {
    let (_temp_file, importer) = test_helpers::setup();

    importer
        .import_file(test_helpers::fixture_path("export.xml"))
        .await
        .unwrap();
    let heart_before = importer
        .store()
        .read_kind(MetricKind::HeartRate)
        .await
        .unwrap();
    assert!(heart_before.is_some());

    let result = importer
        .import_file(test_helpers::fixture_path("steps_only.csv"))
        .await
        .unwrap();
    assert_eq!(result.count(MetricKind::Steps), 3);
    assert_eq!(result.count(MetricKind::HeartRate), 0);

    let snapshot = importer.store().read_all().await.unwrap();
    // 心率保持原样，步数整体替换
    assert_eq!(snapshot.series.get(&MetricKind::HeartRate), heart_before.as_ref());
    assert_eq!(snapshot.count(MetricKind::Steps), 3);
    let steps = snapshot.series[&MetricKind::Steps].as_samples().unwrap();
    assert_eq!(steps[0].value, 5000.0);
    assert_eq!(snapshot.count(MetricKind::Weight), 1);
    assert_eq!(snapshot.count(MetricKind::Workout), 1);
}

#[tokio::test]
async fn test_clear_kind_then_reimport() {
    let (_temp_file, importer) = test_helpers::setup();
    importer
        .import_file(test_helpers::fixture_path("export.xml"))
        .await
        .unwrap();

    assert!(importer.store().clear_kind(MetricKind::Weight).await.unwrap());
    assert!(!importer.store().clear_kind(MetricKind::Weight).await.unwrap());
    assert!(importer
        .store()
        .read_kind(MetricKind::Weight)
        .await
        .unwrap()
        .is_none());

    // 删除不影响历史
    let history = importer.store().recent_history(5).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].per_kind_counts[&MetricKind::Weight], 1);
}

#[tokio::test]
async fn test_history_records_run_metadata() {
    let (_temp_file, importer) = test_helpers::setup();

    let first = importer
        .import_file(test_helpers::fixture_path("daily_wide.csv"))
        .await
        .unwrap();
    let second = importer
        .import_file(test_helpers::fixture_path("collections.json"))
        .await
        .unwrap();

    let snapshot = importer.store().read_all().await.unwrap();
    assert_eq!(snapshot.history.len(), 2);

    // 全量读取按导入先后
    let entry = &snapshot.history[0];
    assert_eq!(entry.import_id, first.import_id);
    assert_eq!(entry.source_file_name, "daily_wide.csv");
    assert!(entry.source_file_size_bytes > 0);
    assert_eq!(entry.skipped_records, 1);
    assert_eq!(entry.per_kind_counts, first.per_kind_counts);
    assert_eq!(entry.observed_date_range, first.observed_date_range);

    // 最近历史新的在前
    let recent = importer.store().recent_history(1).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].import_id, second.import_id);
}

#[tokio::test]
async fn test_history_is_append_only_at_storage_level() {
    let (_temp_file, db_path) = test_helpers::create_test_db().unwrap();
    let importer = test_helpers::create_test_importer(&db_path);
    importer
        .import_file(test_helpers::fixture_path("steps_only.csv"))
        .await
        .unwrap();

    let conn = health_import::db::open_sqlite_connection(&db_path).unwrap();
    assert!(conn
        .execute("DELETE FROM import_history", [])
        .is_err());
    assert!(conn
        .execute("UPDATE import_history SET skipped_records = 99", [])
        .is_err());

    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM import_history", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 1);
}
