//! Result records and the shared, lock-guarded result store.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One unit of captured output. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// Id of the task that produced the record.
    pub task_id: String,
    /// Domain payload, opaque to the pool.
    pub payload: serde_json::Value,
    /// When the record was captured.
    pub captured_at: DateTime<Utc>,
}

impl ResultRecord {
    /// Create a record stamped with the current time.
    pub fn new(task_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_id: task_id.into(),
            payload,
            captured_at: Utc::now(),
        }
    }
}

/// Ordered, append-only collection shared by every worker of a run.
///
/// Every read and write goes through one mutex, held only for a single push
/// or copy.
#[derive(Debug, Default)]
pub struct ResultStore {
    records: Mutex<Vec<ResultRecord>>,
}

impl ResultStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    // Append-only data stays consistent even if a holder panicked.
    fn lock(&self) -> MutexGuard<'_, Vec<ResultRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append one record at the end.
    pub fn append(&self, record: ResultRecord) {
        self.lock().push(record);
    }

    /// Append a batch under a single lock acquisition, keeping it contiguous.
    pub fn extend(&self, records: impl IntoIterator<Item = ResultRecord>) {
        let records: Vec<ResultRecord> = records.into_iter().collect();
        if records.is_empty() {
            return;
        }
        self.lock().extend(records);
    }

    /// Independent point-in-time copy. Later appends never show up in it.
    pub fn snapshot(&self) -> Vec<ResultRecord> {
        self.lock().clone()
    }

    /// Number of records, without copying them.
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use rand::Rng;
    use serde_json::json;

    use super::*;

    #[test]
    fn append_preserves_order() {
        let store = ResultStore::new();
        for i in 0..5 {
            store.append(ResultRecord::new(format!("t{i}"), json!(i)));
        }
        let ids: Vec<String> = store.snapshot().into_iter().map(|r| r.task_id).collect();
        assert_eq!(ids, vec!["t0", "t1", "t2", "t3", "t4"]);
    }

    #[test]
    fn snapshot_is_isolated_from_later_appends() {
        let store = ResultStore::new();
        store.append(ResultRecord::new("a", json!(1)));
        let snap = store.snapshot();
        store.append(ResultRecord::new("b", json!(2)));

        assert_eq!(snap.len(), 1);
        assert_eq!(store.count(), 2);
    }

    #[test]
    fn extend_empty_is_noop() {
        let store = ResultStore::new();
        store.extend(Vec::new());
        assert!(store.is_empty());
    }

    #[test]
    fn extend_keeps_batch_contiguous() {
        let store = Arc::new(ResultStore::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let batch = (0..10).map(|i| ResultRecord::new(format!("t{t}"), json!(i)));
                    store.extend(batch);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snap = store.snapshot();
        assert_eq!(snap.len(), 80);
        for chunk in snap.chunks(10) {
            assert!(chunk.iter().all(|r| r.task_id == chunk[0].task_id));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_appends_are_never_lost() {
        let store = Arc::new(ResultStore::new());
        let producers = 32;
        let per_producer = 50;

        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    for i in 0..per_producer {
                        let jitter = rand::thread_rng().gen_range(0..200);
                        tokio::time::sleep(Duration::from_micros(jitter)).await;
                        store.append(ResultRecord::new(format!("p{p}"), json!(i)));
                    }
                })
            })
            .collect();

        // Snapshots taken mid-flight never exceed what has been appended.
        let mut last = 0;
        for _ in 0..20 {
            let len = store.snapshot().len();
            assert!(len >= last);
            assert!(len <= producers * per_producer);
            last = len;
            tokio::task::yield_now().await;
        }

        for h in handles {
            h.await.unwrap();
        }

        let snap = store.snapshot();
        assert_eq!(snap.len(), producers * per_producer);
        assert_eq!(store.count(), producers * per_producer);

        // Each producer's records appear in its own append order.
        for p in 0..producers {
            let id = format!("p{p}");
            let seq: Vec<i64> = snap
                .iter()
                .filter(|r| r.task_id == id)
                .filter_map(|r| r.payload.as_i64())
                .collect();
            assert_eq!(seq, (0..per_producer as i64).collect::<Vec<_>>());
        }
    }
}
