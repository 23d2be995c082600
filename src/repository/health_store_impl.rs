// ==========================================
// 健康数据导入引擎 - 健康数据存储实现
// ==========================================
// 职责: 实现 HealthStore（使用 rusqlite）
// 存储: metric_series（每种类一行，整段 JSON）+ import_history
// 红线: 覆写是单行 INSERT OR REPLACE，读者不会看到写了一半的序列
// ==========================================

use crate::db::{configure_sqlite_connection, init_schema, open_sqlite_connection};
use crate::domain::health::{
    empty_counts, DateRange, HealthDataSet, ImportHistoryEntry, KindCounts, KindSeries,
};
use crate::domain::types::{MetricKind, SourceFormat};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::health_store::{HealthStore, StoreSnapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

fn parse_instant(field: &str, raw: &str) -> RepositoryResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::CorruptValue {
            field: field.to_string(),
            message: format!("{}: {}", raw, e),
        })
}

/// 序列形态必须与种类一致
fn check_series_shape(kind: MetricKind, series: &KindSeries) -> RepositoryResult<()> {
    let ok = matches!(
        (kind, series),
        (MetricKind::Workout, KindSeries::Workouts(_))
            | (MetricKind::Nutrition, KindSeries::Nutrition(_))
    ) || (kind.is_sample_kind() && matches!(series, KindSeries::Samples(_)));

    if ok {
        Ok(())
    } else {
        Err(RepositoryError::SerializationError {
            slot: kind.slot_key().to_string(),
            message: "序列类型与种类不匹配".to_string(),
        })
    }
}

// import_history 的原始行
struct HistoryRow {
    import_id: String,
    imported_at: String,
    source_file_name: String,
    source_file_size_bytes: i64,
    source_format: String,
    per_kind_counts_json: String,
    range_start: Option<String>,
    range_end: Option<String>,
    skipped_records: i64,
    elapsed_ms: i64,
}

impl HistoryRow {
    const COLUMNS: &'static str = "import_id, imported_at, source_file_name, source_file_size_bytes, \
         source_format, per_kind_counts_json, range_start, range_end, skipped_records, elapsed_ms";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            import_id: row.get(0)?,
            imported_at: row.get(1)?,
            source_file_name: row.get(2)?,
            source_file_size_bytes: row.get(3)?,
            source_format: row.get(4)?,
            per_kind_counts_json: row.get(5)?,
            range_start: row.get(6)?,
            range_end: row.get(7)?,
            skipped_records: row.get(8)?,
            elapsed_ms: row.get(9)?,
        })
    }

    fn into_entry(self) -> RepositoryResult<ImportHistoryEntry> {
        let stored: KindCounts = serde_json::from_str(&self.per_kind_counts_json).map_err(|e| {
            RepositoryError::CorruptValue {
                field: "per_kind_counts_json".to_string(),
                message: e.to_string(),
            }
        })?;
        let mut per_kind_counts = empty_counts();
        per_kind_counts.extend(stored);

        let observed_date_range = match (self.range_start, self.range_end) {
            (Some(start), Some(end)) => Some(DateRange {
                start: parse_instant("range_start", &start)?,
                end: parse_instant("range_end", &end)?,
            }),
            _ => None,
        };

        Ok(ImportHistoryEntry {
            import_id: self.import_id,
            imported_at: parse_instant("imported_at", &self.imported_at)?,
            source_file_name: self.source_file_name,
            source_file_size_bytes: self.source_file_size_bytes.max(0) as u64,
            source_format: SourceFormat::from_str(&self.source_format),
            per_kind_counts,
            observed_date_range,
            skipped_records: self.skipped_records.max(0) as usize,
            elapsed_ms: self.elapsed_ms.max(0) as u64,
        })
    }
}

// ==========================================
// HealthStoreImpl
// ==========================================
pub struct HealthStoreImpl {
    conn: Arc<Mutex<Connection>>,
}

impl HealthStoreImpl {
    /// 创建新的 Store 实例（建表幂等）
    ///
    /// # 参数
    /// - db_path: 数据库文件路径
    pub fn new(db_path: &str) -> RepositoryResult<Self> {
        let conn = open_sqlite_connection(db_path)
            .map_err(|e| RepositoryError::DatabaseConnectionError(format!("{}: {}", db_path, e)))?;
        init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 从已有连接创建（与 ConfigManager 共用连接）
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> RepositoryResult<Self> {
        {
            let guard = conn.lock().map_err(RepositoryError::lock)?;
            configure_sqlite_connection(&guard)?;
            init_schema(&guard)?;
        }
        Ok(Self { conn })
    }

    /// 共享底层连接
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// 覆写槽位（调用方已在事务中）
    fn replace_kind_tx(
        conn: &Connection,
        kind: MetricKind,
        series: &KindSeries,
    ) -> RepositoryResult<bool> {
        if series.is_empty() {
            return Ok(false);
        }
        check_series_shape(kind, series)?;

        let payload = series
            .to_json()
            .map_err(|e| RepositoryError::SerializationError {
                slot: kind.slot_key().to_string(),
                message: e.to_string(),
            })?;

        conn.execute(
            r#"
            INSERT OR REPLACE INTO metric_series (slot_key, payload_json, sample_count, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                kind.slot_key(),
                payload,
                series.len() as i64,
                Utc::now().to_rfc3339()
            ],
        )?;

        debug!(slot = kind.slot_key(), count = series.len(), "序列已覆写");
        Ok(true)
    }

    fn append_history_tx(conn: &Connection, entry: &ImportHistoryEntry) -> RepositoryResult<()> {
        let counts_json = serde_json::to_string(&entry.per_kind_counts).map_err(|e| {
            RepositoryError::SerializationError {
                slot: "import_history".to_string(),
                message: e.to_string(),
            }
        })?;

        conn.execute(
            &format!(
                "INSERT INTO import_history ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                HistoryRow::COLUMNS
            ),
            params![
                entry.import_id,
                entry.imported_at.to_rfc3339(),
                entry.source_file_name,
                entry.source_file_size_bytes as i64,
                entry.source_format.as_str(),
                counts_json,
                entry.observed_date_range.map(|r| r.start.to_rfc3339()),
                entry.observed_date_range.map(|r| r.end.to_rfc3339()),
                entry.skipped_records as i64,
                entry.elapsed_ms as i64,
            ],
        )?;
        Ok(())
    }

    fn read_kind_conn(conn: &Connection, kind: MetricKind) -> RepositoryResult<Option<KindSeries>> {
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload_json FROM metric_series WHERE slot_key = ?1",
                params![kind.slot_key()],
                |row| row.get(0),
            )
            .optional()?;

        payload
            .map(|raw| {
                KindSeries::from_json(kind, &raw).map_err(|e| RepositoryError::CorruptValue {
                    field: kind.slot_key().to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()
    }

    fn read_history_conn(
        conn: &Connection,
        newest_first: bool,
        limit: Option<usize>,
    ) -> RepositoryResult<Vec<ImportHistoryEntry>> {
        let sql = format!(
            "SELECT {} FROM import_history ORDER BY seq {} LIMIT ?1",
            HistoryRow::COLUMNS,
            if newest_first { "DESC" } else { "ASC" }
        );
        // LIMIT -1 表示不限
        let limit = limit.map_or(-1, |l| l as i64);

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit], HistoryRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(HistoryRow::into_entry).collect()
    }
}

#[async_trait]
impl HealthStore for HealthStoreImpl {
    async fn replace_kind_if_non_empty(
        &self,
        kind: MetricKind,
        series: KindSeries,
    ) -> RepositoryResult<bool> {
        let conn = self.conn.lock().map_err(RepositoryError::lock)?;
        Self::replace_kind_tx(&conn, kind, &series)
    }

    async fn append_history(&self, entry: ImportHistoryEntry) -> RepositoryResult<()> {
        let conn = self.conn.lock().map_err(RepositoryError::lock)?;
        Self::append_history_tx(&conn, &entry)
    }

    async fn read_all(&self) -> RepositoryResult<StoreSnapshot> {
        let conn = self.conn.lock().map_err(RepositoryError::lock)?;

        let mut stmt = conn.prepare("SELECT slot_key, payload_json FROM metric_series")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut series = BTreeMap::new();
        for (slot, raw) in rows {
            let Some(kind) = MetricKind::from_slot_key(&slot) else {
                warn!(slot = %slot, "未知槽位，已忽略");
                continue;
            };
            let parsed =
                KindSeries::from_json(kind, &raw).map_err(|e| RepositoryError::CorruptValue {
                    field: slot.clone(),
                    message: e.to_string(),
                })?;
            series.insert(kind, parsed);
        }

        let history = Self::read_history_conn(&conn, false, None)?;
        Ok(StoreSnapshot { series, history })
    }

    async fn read_kind(&self, kind: MetricKind) -> RepositoryResult<Option<KindSeries>> {
        let conn = self.conn.lock().map_err(RepositoryError::lock)?;
        Self::read_kind_conn(&conn, kind)
    }

    async fn recent_history(&self, limit: usize) -> RepositoryResult<Vec<ImportHistoryEntry>> {
        let conn = self.conn.lock().map_err(RepositoryError::lock)?;
        Self::read_history_conn(&conn, true, Some(limit))
    }

    async fn clear_kind(&self, kind: MetricKind) -> RepositoryResult<bool> {
        let conn = self.conn.lock().map_err(RepositoryError::lock)?;
        let affected = conn.execute(
            "DELETE FROM metric_series WHERE slot_key = ?1",
            params![kind.slot_key()],
        )?;
        Ok(affected > 0)
    }

    async fn commit_import(
        &self,
        dataset: &HealthDataSet,
        entry: ImportHistoryEntry,
    ) -> RepositoryResult<Vec<MetricKind>> {
        let conn = self.conn.lock().map_err(RepositoryError::lock)?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;

        let mut replaced = Vec::new();
        for (kind, series) in dataset.non_empty() {
            if Self::replace_kind_tx(&tx, *kind, series)? {
                replaced.push(*kind);
            }
        }
        Self::append_history_tx(&tx, &entry)?;

        tx.commit()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;
        Ok(replaced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::health::{MetricSample, WorkoutRecord};
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    fn setup_store() -> (NamedTempFile, HealthStoreImpl) {
        let temp_file = NamedTempFile::new().unwrap();
        let store = HealthStoreImpl::new(temp_file.path().to_str().unwrap()).unwrap();
        (temp_file, store)
    }

    fn samples(values: &[f64]) -> KindSeries {
        KindSeries::Samples(
            values
                .iter()
                .enumerate()
                .map(|(i, v)| MetricSample {
                    date: Utc.with_ymd_and_hms(2024, 1, 1 + i as u32, 0, 0, 0).unwrap(),
                    value: *v,
                    unit: "count".to_string(),
                    category: None,
                })
                .collect(),
        )
    }

    fn entry(id: &str) -> ImportHistoryEntry {
        ImportHistoryEntry {
            import_id: id.to_string(),
            imported_at: Utc::now(),
            source_file_name: format!("{}.csv", id),
            source_file_size_bytes: 42,
            source_format: SourceFormat::Tabular,
            per_kind_counts: empty_counts(),
            observed_date_range: None,
            skipped_records: 0,
            elapsed_ms: 3,
        }
    }

    #[tokio::test]
    async fn test_replace_only_when_non_empty() {
        let (_f, store) = setup_store();

        assert!(store
            .replace_kind_if_non_empty(MetricKind::Steps, samples(&[100.0, 200.0]))
            .await
            .unwrap());
        assert!(!store
            .replace_kind_if_non_empty(MetricKind::Steps, samples(&[]))
            .await
            .unwrap());

        let stored = store.read_kind(MetricKind::Steps).await.unwrap().unwrap();
        assert_eq!(stored.len(), 2);
        assert!(store.read_kind(MetricKind::Weight).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replace_rejects_mismatched_series() {
        let (_f, store) = setup_store();
        let workouts = KindSeries::Workouts(vec![WorkoutRecord {
            date: Utc::now(),
            activity_type: "Running".to_string(),
            duration: 30.0,
            duration_unit: "min".to_string(),
            calories: None,
            distance: None,
        }]);

        let result = store
            .replace_kind_if_non_empty(MetricKind::HeartRate, workouts)
            .await;
        assert!(matches!(result, Err(RepositoryError::SerializationError { .. })));
    }

    #[tokio::test]
    async fn test_history_order_and_roundtrip() {
        let (_f, store) = setup_store();

        let mut first = entry("first");
        first.per_kind_counts.insert(MetricKind::Steps, 2);
        first.observed_date_range = Some(DateRange {
            start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        });
        store.append_history(first.clone()).await.unwrap();
        store.append_history(entry("second")).await.unwrap();

        let snapshot = store.read_all().await.unwrap();
        assert_eq!(snapshot.history.len(), 2);
        assert_eq!(snapshot.history[0].import_id, "first");
        assert_eq!(snapshot.history[0].per_kind_counts[&MetricKind::Steps], 2);
        assert_eq!(snapshot.history[0].observed_date_range, first.observed_date_range);

        let recent = store.recent_history(1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].import_id, "second");
    }

    #[tokio::test]
    async fn test_commit_import_and_clear_kind() {
        let (_f, store) = setup_store();
        store
            .replace_kind_if_non_empty(MetricKind::HeartRate, samples(&[60.0]))
            .await
            .unwrap();

        let mut dataset = HealthDataSet::new();
        if let KindSeries::Samples(v) = samples(&[1.0, 2.0, 3.0]) {
            for s in v {
                dataset.push_sample(MetricKind::Steps, s);
            }
        }

        let replaced = store.commit_import(&dataset, entry("run")).await.unwrap();
        assert_eq!(replaced, vec![MetricKind::Steps]);

        let snapshot = store.read_all().await.unwrap();
        assert_eq!(snapshot.count(MetricKind::Steps), 3);
        assert_eq!(snapshot.count(MetricKind::HeartRate), 1);
        assert_eq!(snapshot.history.len(), 1);

        assert!(store.clear_kind(MetricKind::HeartRate).await.unwrap());
        assert!(!store.clear_kind(MetricKind::HeartRate).await.unwrap());
        assert_eq!(store.read_all().await.unwrap().count(MetricKind::HeartRate), 0);
    }

    #[tokio::test]
    async fn test_commit_import_rolls_back_on_duplicate_id() {
        let (_f, store) = setup_store();
        store.append_history(entry("dup")).await.unwrap();

        let mut dataset = HealthDataSet::new();
        if let KindSeries::Samples(v) = samples(&[70.0]) {
            dataset.push_sample(MetricKind::Weight, v[0].clone());
        }

        let result = store.commit_import(&dataset, entry("dup")).await;
        assert!(matches!(result, Err(RepositoryError::UniqueConstraintViolation(_))));
        assert!(store.read_kind(MetricKind::Weight).await.unwrap().is_none());
    }
}
