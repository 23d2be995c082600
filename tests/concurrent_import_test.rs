// ==========================================
// 并发导入测试
// ==========================================
// 测试目标: 同一时刻仅允许一个导入，后来者立即被拒绝
// ==========================================


use health_import::config::ConfigManager;
use health_import::importer::{
    CsvParser, FileParser, HealthImporter, HealthImporterImpl, ImportError, ImportSource,
    JsonParser, TabularDocument,
};
use health_import::repository::{HealthStore, HealthStoreImpl};
use health_import::{logging, MetricKind};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// 进入解析后阻塞，直到测试放行
struct BlockingCsvParser {
    entered: Mutex<Option<oneshot::Sender<()>>>,
    release: Mutex<std_mpsc::Receiver<()>>,
}

impl FileParser for BlockingCsvParser {
    type Output = TabularDocument;

    fn parse(&self, raw: &str) -> Result<TabularDocument, ImportError> {
        if let Some(tx) = self.entered.lock().unwrap().take() {
            let _ = tx.send(());
            let _ = self.release.lock().unwrap().recv();
        }
        CsvParser.parse(raw)
    }
}

fn csv_source(name: &str, steps: u32) -> ImportSource {
    ImportSource::new(name, format!("date,steps\n2024-01-01,{}\n", steps).into_bytes())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_import_rejected_while_first_runs() {
    logging::init_test();
    let (_temp_file, db_path) = test_helpers::create_test_db().unwrap();

    let (entered_tx, entered_rx) = oneshot::channel();
    let (release_tx, release_rx) = std_mpsc::channel();
    let parser = BlockingCsvParser {
        entered: Mutex::new(Some(entered_tx)),
        release: Mutex::new(release_rx),
    };

    let store = HealthStoreImpl::new(&db_path).unwrap();
    let config = ConfigManager::from_connection(store.connection());
    let importer = Arc::new(HealthImporterImpl::with_parsers(
        store,
        config,
        Box::new(parser),
        Box::new(JsonParser),
    ));

    let first = {
        let importer = importer.clone();
        tokio::spawn(async move {
            importer
                .import(csv_source("first.csv", 100), None, CancellationToken::new())
                .await
        })
    };

    // 第一个导入已进入解析阶段
    entered_rx.await.unwrap();

    let second = importer
        .import(csv_source("second.csv", 200), None, CancellationToken::new())
        .await;
    assert!(matches!(second, Err(ImportError::ImportInProgress)));

    release_tx.send(()).unwrap();
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.count(MetricKind::Steps), 1);

    // 闸门释放后可以再次导入
    let third = importer
        .import(csv_source("third.csv", 300), None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(third.count(MetricKind::Steps), 1);

    let snapshot = importer.store().read_all().await.unwrap();
    assert_eq!(snapshot.history.len(), 2);
    let steps = snapshot.series[&MetricKind::Steps].as_samples().unwrap();
    assert_eq!(steps[0].value, 300.0);
}

#[tokio::test]
async fn test_rejected_import_leaves_no_history() {
    let (_temp_file, importer) = test_helpers::setup();

    let results = futures::future::join_all((0..3).map(|i| {
        importer.import(
            csv_source(&format!("f{}.csv", i), i * 10 + 1),
            None,
            CancellationToken::new(),
        )
    }))
    .await;

    let ok = results.iter().filter(|r| r.is_ok()).count();
    let busy = results
        .iter()
        .filter(|r| matches!(r, Err(ImportError::ImportInProgress)))
        .count();
    assert!(ok >= 1);
    assert_eq!(ok + busy, 3);

    let history = importer.store().recent_history(10).await.unwrap();
    assert_eq!(history.len(), ok);
}
