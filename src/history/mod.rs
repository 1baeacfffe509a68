//! 予測履歴の保存先
//!
//! 予測結果にID・ファイル名・時刻を付けて記録します。
//! 保存に失敗しても予測自体は成功として扱います（`record_prediction`）。

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::error::{FreshError, Result};
use crate::ml::inference::Prediction;
use crate::model::model_storage::write_atomic;

/// 履歴レコード
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub filename: String,
    #[serde(flatten)]
    pub prediction: Prediction,
    /// RFC 3339
    pub timestamp: String,
}

impl HistoryRecord {
    pub fn new(filename: &str, prediction: Prediction) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            filename: filename.to_string(),
            prediction,
            timestamp: chrono::Local::now().to_rfc3339(),
        }
    }
}

/// 履歴ストア
pub trait HistoryStore: Send + Sync {
    fn insert(&self, record: HistoryRecord) -> Result<()>;

    /// 新しい順
    fn list(&self) -> Result<Vec<HistoryRecord>>;

    /// 見つかって削除できたら true
    fn delete(&self, id: &str) -> Result<bool>;

    /// 削除した件数
    fn delete_all(&self) -> Result<usize>;
}

fn sort_newest_first(records: &mut [HistoryRecord]) {
    records.sort_by(|a, b| {
        match (
            DateTime::parse_from_rfc3339(&a.timestamp),
            DateTime::parse_from_rfc3339(&b.timestamp),
        ) {
            (Ok(ta), Ok(tb)) => tb.cmp(&ta),
            _ => b.timestamp.cmp(&a.timestamp),
        }
    });
}

fn poisoned() -> FreshError {
    FreshError::PersistenceUnavailable("history lock poisoned".to_string())
}

/// メモリ上の履歴（プロセス終了で消える）
#[derive(Default)]
pub struct MemoryHistoryStore {
    records: Mutex<Vec<HistoryRecord>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn insert(&self, record: HistoryRecord) -> Result<()> {
        self.records.lock().map_err(|_| poisoned())?.push(record);
        Ok(())
    }

    fn list(&self) -> Result<Vec<HistoryRecord>> {
        let mut records = self.records.lock().map_err(|_| poisoned())?.clone();
        sort_newest_first(&mut records);
        Ok(records)
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let mut records = self.records.lock().map_err(|_| poisoned())?;
        let before = records.len();
        records.retain(|r| r.id != id);
        Ok(records.len() != before)
    }

    fn delete_all(&self) -> Result<usize> {
        let mut records = self.records.lock().map_err(|_| poisoned())?;
        let count = records.len();
        records.clear();
        Ok(count)
    }
}

/// JSONファイルに保存する履歴
///
/// 書き込みは毎回ファイル全体を一時ファイル経由で置き換えます。
pub struct JsonFileHistoryStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileHistoryStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<Vec<HistoryRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let json = std::fs::read_to_string(&self.path).map_err(|e| {
            FreshError::PersistenceUnavailable(format!("{}: {}", self.path.display(), e))
        })?;
        if json.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&json).map_err(|e| {
            FreshError::PersistenceUnavailable(format!("{}: {}", self.path.display(), e))
        })
    }

    fn write_all(&self, records: &[HistoryRecord]) -> Result<()> {
        let json = serde_json::to_string_pretty(records)?;
        write_atomic(&self.path, json.as_bytes()).map_err(|e| {
            FreshError::PersistenceUnavailable(format!("{}: {}", self.path.display(), e))
        })
    }
}

impl HistoryStore for JsonFileHistoryStore {
    fn insert(&self, record: HistoryRecord) -> Result<()> {
        let _guard = self.lock.lock().map_err(|_| poisoned())?;
        let mut records = self.read_all()?;
        records.push(record);
        self.write_all(&records)
    }

    fn list(&self) -> Result<Vec<HistoryRecord>> {
        let _guard = self.lock.lock().map_err(|_| poisoned())?;
        let mut records = self.read_all()?;
        sort_newest_first(&mut records);
        Ok(records)
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let _guard = self.lock.lock().map_err(|_| poisoned())?;
        let mut records = self.read_all()?;
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Ok(false);
        }
        self.write_all(&records)?;
        Ok(true)
    }

    fn delete_all(&self) -> Result<usize> {
        let _guard = self.lock.lock().map_err(|_| poisoned())?;
        let count = self.read_all()?.len();
        self.write_all(&[])?;
        Ok(count)
    }
}

/// 予測結果を履歴に記録する
///
/// 保存に失敗した場合は警告を出して `None` を返し、呼び出し元には伝播しません。
pub fn record_prediction(
    store: &dyn HistoryStore,
    filename: &str,
    prediction: &Prediction,
) -> Option<HistoryRecord> {
    let record = HistoryRecord::new(filename, prediction.clone());
    match store.insert(record.clone()) {
        Ok(()) => {
            tracing::debug!("履歴を保存しました: {}", record.id);
            Some(record)
        }
        Err(e) => {
            tracing::warn!("履歴の保存に失敗しました（予測結果は返します）: {}", e);
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// 常に到達不能な履歴ストア
    pub(crate) struct UnreachableHistoryStore;

    impl HistoryStore for UnreachableHistoryStore {
        fn insert(&self, _record: HistoryRecord) -> Result<()> {
            Err(FreshError::PersistenceUnavailable("connection refused".to_string()))
        }
        fn list(&self) -> Result<Vec<HistoryRecord>> {
            Err(FreshError::PersistenceUnavailable("connection refused".to_string()))
        }
        fn delete(&self, _id: &str) -> Result<bool> {
            Err(FreshError::PersistenceUnavailable("connection refused".to_string()))
        }
        fn delete_all(&self) -> Result<usize> {
            Err(FreshError::PersistenceUnavailable("connection refused".to_string()))
        }
    }

    fn prediction(label: &str) -> Prediction {
        Prediction {
            label: label.to_string(),
            confidence: 91.5,
            is_fresh: label.starts_with("Fresh"),
            model_used: "fruit".to_string(),
        }
    }

    fn record_at(id: &str, timestamp: &str) -> HistoryRecord {
        HistoryRecord {
            id: id.to_string(),
            filename: format!("{}.jpg", id),
            prediction: prediction("Fresh Apples"),
            timestamp: timestamp.to_string(),
        }
    }

    fn exercise(store: &dyn HistoryStore) {
        store.insert(record_at("a", "2024-01-01T10:00:00+00:00")).unwrap();
        store.insert(record_at("c", "2024-03-01T10:00:00+09:00")).unwrap();
        store.insert(record_at("b", "2024-02-01T10:00:00+00:00")).unwrap();

        let ids: Vec<String> = store.list().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);

        assert!(store.delete("b").unwrap());
        assert!(!store.delete("b").unwrap());
        assert_eq!(store.list().unwrap().len(), 2);

        assert_eq!(store.delete_all().unwrap(), 2);
        assert!(store.list().unwrap().is_empty());
        assert_eq!(store.delete_all().unwrap(), 0);
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryHistoryStore::new());
    }

    #[test]
    fn test_json_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileHistoryStore::new(dir.path().join("history.json"));
        exercise(&store);
        assert!(store.path().exists());
    }

    #[test]
    fn test_json_file_store_persists_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let record = record_prediction(
            &JsonFileHistoryStore::new(&path),
            "apple.png",
            &prediction("Rotten Apples"),
        )
        .unwrap();

        let reopened = JsonFileHistoryStore::new(&path).list().unwrap();
        assert_eq!(reopened, vec![record]);
    }

    #[test]
    fn test_record_shape() {
        let record = HistoryRecord::new("banana.jpg", prediction("Fresh Bananas"));
        let value = serde_json::to_value(&record).unwrap();
        for key in ["_id", "filename", "label", "confidence", "is_fresh", "model_used", "timestamp"] {
            assert!(value.get(key).is_some(), "missing {}", key);
        }
        assert!(DateTime::parse_from_rfc3339(&record.timestamp).is_ok());
    }

    #[test]
    fn test_corrupt_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = JsonFileHistoryStore::new(&path).list().unwrap_err();
        assert!(matches!(err, FreshError::PersistenceUnavailable(_)));
    }

    #[test]
    fn test_record_prediction_swallows_failures() {
        assert!(record_prediction(&UnreachableHistoryStore, "x.png", &prediction("Fresh Apples")).is_none());
    }
}
