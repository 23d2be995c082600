// ==========================================
// 导入流程集成测试
// ==========================================
// 测试目标: 三种格式从文件到存储的完整链路
// ==========================================


use health_import::importer::{
    CsvParser, FileParser, HealthImporter, HealthImporterImpl, ImportError, ImportSource,
    JsonParser, ProgressEvent, TabularDocument, TreeDocument, PROGRESS_COMPLETE,
};
use health_import::repository::HealthStore;
use health_import::config::config_keys;
use health_import::{logging, ConfigManager, HealthStoreImpl, MetricKind, SourceFormat};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_hierarchical_import_with_progress() {
    logging::init_test();
    let (_temp_file, importer) = test_helpers::setup();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let result = importer
        .import(
            test_helpers::fixture_source("export.xml"),
            Some(tx),
            CancellationToken::new(),
        )
        .await
        .expect("导入应该成功");

    assert_eq!(result.source_format, SourceFormat::Hierarchical);
    // 缺少日期的心率记录被跳过
    assert_eq!(result.count(MetricKind::HeartRate), 1);
    assert_eq!(result.count(MetricKind::Steps), 2);
    assert_eq!(result.count(MetricKind::Weight), 1);
    assert_eq!(result.count(MetricKind::Workout), 1);
    assert_eq!(result.count(MetricKind::Nutrition), 0);
    assert_eq!(result.skipped_records, 1);
    assert_eq!(result.per_kind_counts.len(), 7);

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert_eq!(
        events.last(),
        Some(&ProgressEvent::Status(PROGRESS_COMPLETE.to_string()))
    );
    let percents: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Percent(p) => Some(*p),
            _ => None,
        })
        .collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]), "进度必须单调");
    assert_eq!(percents.last(), Some(&100));

    let workouts = importer
        .store()
        .read_kind(MetricKind::Workout)
        .await
        .unwrap()
        .unwrap();
    let workout = &workouts.as_workouts().unwrap()[0];
    assert_eq!(workout.activity_type, "Cycling");
    assert_eq!(workout.calories, Some(380.0));

    let range = result.observed_date_range.unwrap();
    assert_eq!(range.start.to_rfc3339(), "2024-01-10T08:00:00+00:00");
    assert_eq!(range.end.to_rfc3339(), "2024-01-12T18:00:00+00:00");
}

#[tokio::test]
async fn test_wide_csv_import() {
    let (_temp_file, importer) = test_helpers::setup();

    let result = importer
        .import_file(test_helpers::fixture_path("daily_wide.csv"))
        .await
        .expect("导入应该成功");

    assert_eq!(result.source_format, SourceFormat::Tabular);
    assert_eq!(result.count(MetricKind::HeartRate), 2);
    assert_eq!(result.count(MetricKind::Steps), 3);
    assert_eq!(result.count(MetricKind::Weight), 2);
    assert_eq!(result.skipped_records, 1);
    assert_eq!(result.skip_reasons[0].location, "行 5");
}

#[tokio::test]
async fn test_long_format_csv_import() {
    let (_temp_file, importer) = test_helpers::setup();
    let csv = "\
timestamp,type,value,unit
2024-05-01T07:00:00Z,HeartRate,55,bpm
2024-05-01T07:00:00Z,BodyMass,68.2,kg
2024-05-01T07:00:00Z,Unknown,1,x
2024-05-02T07:00:00Z,Steps,12000,count
";

    let result = importer
        .import(
            ImportSource::new("long.csv", csv.as_bytes().to_vec()),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.count(MetricKind::HeartRate), 1);
    assert_eq!(result.count(MetricKind::Weight), 1);
    assert_eq!(result.count(MetricKind::Steps), 1);
    // 无法识别的类型静默忽略
    assert_eq!(result.skipped_records, 0);
}

#[tokio::test]
async fn test_tree_collections_import() {
    let (_temp_file, importer) = test_helpers::setup();

    let result = importer
        .import_file(test_helpers::fixture_path("collections.json"))
        .await
        .unwrap();

    assert_eq!(result.source_format, SourceFormat::Tree);
    assert_eq!(result.count(MetricKind::HeartRate), 2);
    assert_eq!(result.count(MetricKind::Workout), 1);
    assert_eq!(result.count(MetricKind::Nutrition), 1);

    let nutrition = importer
        .store()
        .read_kind(MetricKind::Nutrition)
        .await
        .unwrap()
        .unwrap();
    let item = &nutrition.as_nutrition().unwrap()[0];
    assert_eq!(item.item_name, "Rice bowl");
    assert_eq!(item.fat, 11.0);
}

#[tokio::test]
async fn test_single_steps_collection() {
    let (_temp_file, importer) = test_helpers::setup();
    let json = r#"{"steps":[{"date":"2024-01-01","value":9000}]}"#;

    let result = importer
        .import(
            ImportSource::new("steps.json", json.as_bytes().to_vec()),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.count(MetricKind::Steps), 1);
    let steps = importer
        .store()
        .read_kind(MetricKind::Steps)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(steps.as_samples().unwrap()[0].value, 9000.0);
}

#[tokio::test]
async fn test_header_only_csv_yields_zero_counts() {
    let (_temp_file, importer) = test_helpers::setup();

    let result = importer
        .import(
            ImportSource::new("empty.csv", b"date,heart_rate,steps\n".to_vec()),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(result.per_kind_counts.values().all(|c| *c == 0));
    assert!(result.observed_date_range.is_none());

    // 空运行也写入一条历史
    let snapshot = importer.store().read_all().await.unwrap();
    assert_eq!(snapshot.history.len(), 1);
    assert!(snapshot.series.is_empty());
}

#[tokio::test]
async fn test_missing_date_field_is_fatal() {
    let (_temp_file, importer) = test_helpers::setup();
    let json = r#"[{"steps": 100}, {"steps": 200}]"#;

    let err = importer
        .import(
            ImportSource::new("nodate.json", json.as_bytes().to_vec()),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ImportError::MissingTemporalField(_)));
    let snapshot = importer.store().read_all().await.unwrap();
    assert!(snapshot.history.is_empty());
}

#[tokio::test]
async fn test_structural_errors_leave_store_untouched() {
    let (_temp_file, importer) = test_helpers::setup();
    importer
        .import_file(test_helpers::fixture_path("steps_only.csv"))
        .await
        .unwrap();

    let broken_xml = "<HealthData><Record type=\"HKQuantityTypeIdentifierStepCount\" value=\"1\">";
    let err = importer
        .import(
            ImportSource::new("broken.xml", broken_xml.as_bytes().to_vec()),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ImportError::StructuralParseError { .. }));

    let err = importer
        .import(
            ImportSource::new("broken.json", b"{\"steps\": [".to_vec()),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ImportError::StructuralParseError { .. }));

    let snapshot = importer.store().read_all().await.unwrap();
    assert_eq!(snapshot.count(MetricKind::Steps), 3);
    assert_eq!(snapshot.history.len(), 1);
}

#[tokio::test]
async fn test_cancelled_hierarchical_import_is_noop() {
    let (_temp_file, importer) = test_helpers::setup();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = importer
        .import(test_helpers::fixture_source("export.xml"), None, cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, ImportError::Cancelled));
    let snapshot = importer.store().read_all().await.unwrap();
    assert!(snapshot.series.is_empty());
    assert!(snapshot.history.is_empty());
}

/// 生成含大量步数记录的层级导出
fn large_export(records: usize) -> Vec<u8> {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<HealthData>\n");
    for i in 0..records {
        xml.push_str(&format!(
            " <Record type=\"HKQuantityTypeIdentifierStepCount\" unit=\"count\" startDate=\"2024-01-01 {:02}:{:02}:{:02} +0000\" value=\"{}\"/>\n",
            (i / 3600) % 24,
            (i / 60) % 60,
            i % 60,
            i % 500 + 1
        ));
    }
    xml.push_str("</HealthData>\n");
    xml.into_bytes()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_during_hierarchical_worker_run() {
    let (_temp_file, db_path) = test_helpers::create_test_db().unwrap();
    let store = HealthStoreImpl::new(&db_path).unwrap();
    let config = ConfigManager::from_connection(store.connection());
    config
        .set_global_config_value(config_keys::PROGRESS_INTERVAL, "1")
        .unwrap();
    config
        .set_global_config_value(config_keys::WORKER_CHANNEL_CAPACITY, "1")
        .unwrap();
    let importer = Arc::new(HealthImporterImpl::new(store, config));

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let run = {
        let importer = importer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            importer
                .import(
                    ImportSource::new("large.xml", large_export(50_000)),
                    Some(tx),
                    cancel,
                )
                .await
        })
    };

    // 收到第一个百分比后取消
    let mut saw_percent = false;
    while let Some(event) = rx.recv().await {
        if matches!(event, ProgressEvent::Percent(_)) {
            saw_percent = true;
            cancel.cancel();
            break;
        }
    }
    assert!(saw_percent, "后台任务应已开始上报进度");

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(err, ImportError::Cancelled), "实际为 {:?}", err);

    let snapshot = importer.store().read_all().await.unwrap();
    assert!(snapshot.series.is_empty());
    assert!(snapshot.history.is_empty());

    // 门已释放，后续导入照常进行
    importer
        .import_file(test_helpers::fixture_path("steps_only.csv"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_sleep_hours_column_is_not_heart_rate() {
    let (_temp_file, importer) = test_helpers::setup();

    let result = importer
        .import(
            ImportSource::new("sleep.csv", b"date,sleep_hrs\n2024-01-01,7.5\n".to_vec()),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.count(MetricKind::Sleep), 1);
    assert_eq!(result.count(MetricKind::HeartRate), 0);
    let snapshot = importer.store().read_all().await.unwrap();
    assert!(snapshot.series.get(&MetricKind::HeartRate).is_none());
}

// ==========================================
// 不支持的格式: 不调用任何解析器
// ==========================================

struct CountingCsvParser(Arc<AtomicUsize>);

impl FileParser for CountingCsvParser {
    type Output = TabularDocument;

    fn parse(&self, raw: &str) -> Result<TabularDocument, ImportError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        CsvParser.parse(raw)
    }
}

struct CountingJsonParser(Arc<AtomicUsize>);

impl FileParser for CountingJsonParser {
    type Output = TreeDocument;

    fn parse(&self, raw: &str) -> Result<TreeDocument, ImportError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        JsonParser.parse(raw)
    }
}

#[tokio::test]
async fn test_unsupported_format_invokes_no_parser() {
    let (_temp_file, db_path) = test_helpers::create_test_db().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let store = HealthStoreImpl::new(&db_path).unwrap();
    let config = ConfigManager::from_connection(store.connection());
    let importer = HealthImporterImpl::with_parsers(
        store,
        config,
        Box::new(CountingCsvParser(calls.clone())),
        Box::new(CountingJsonParser(calls.clone())),
    );

    let err = importer
        .import(
            ImportSource::new("report.pdf", b"%PDF-1.7 date,steps".to_vec()),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ImportError::UnsupportedFormat(_)));

    // 扩展名与内容不符: 结构错误，同样不调用解析器
    let err = importer
        .import(
            ImportSource::new("bad.json", b"date,value\n1,2".to_vec()),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ImportError::StructuralParseError { .. }));

    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // 正常文件会调用解析器
    importer
        .import(
            ImportSource::new("ok.csv", b"date,steps\n2024-01-01,1\n".to_vec()),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_content_mismatch_is_structural_error() {
    let (_temp_file, importer) = test_helpers::setup();

    for (name, body, expected) in [
        ("bad.json", "date,value\n1,2", "json"),
        ("bad.xml", "not xml at all", "xml"),
    ] {
        let err = importer
            .import(
                ImportSource::new(name, body.as_bytes().to_vec()),
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        match err {
            ImportError::StructuralParseError { format, .. } => assert_eq!(format, expected),
            other => panic!("{} 应为结构错误，实际为 {:?}", name, other),
        }
    }

    let snapshot = importer.store().read_all().await.unwrap();
    assert!(snapshot.history.is_empty());
}

#[tokio::test]
async fn test_import_file_missing_path() {
    let (_temp_file, importer) = test_helpers::setup();

    let err = importer
        .import_file("/nonexistent/dir/export.csv")
        .await
        .unwrap_err();
    assert!(matches!(err, ImportError::FileReadError(_)));

    let err = importer.import_file("/nonexistent/notes.txt").await.unwrap_err();
    assert!(matches!(err, ImportError::UnsupportedFormat(_)));
}

#[tokio::test]
async fn test_batch_import_results_are_independent() {
    let (_temp_file, importer) = test_helpers::setup();
    let dir = tempfile::tempdir().unwrap();
    let bad = test_helpers::write_temp_input(&dir, "bad.json", "[1, 2");

    let results = importer
        .batch_import(vec![
            test_helpers::fixture_path("steps_only.csv"),
            bad,
            test_helpers::fixture_path("collections.json"),
        ])
        .await;

    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    assert!(results[1].is_err());
    assert!(results[2].is_ok());

    let history = importer.store().recent_history(10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].source_file_name, "collections.json");
}
