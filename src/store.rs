use std::{path::PathBuf, sync::Arc, time::Duration};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{SubmissionRecord, SubmissionStatus};

const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_BACKOFF_MS: u64 = 100;

/// In-memory submission records with append-only JSONL persistence of
/// terminal states. Status transitions are monotonic: a terminal record
/// never changes again.
#[derive(Clone)]
pub struct SubmissionStore {
    records: Arc<DashMap<Uuid, SubmissionRecord>>,
    persistence_path: Option<PathBuf>,
    write_lock: Arc<Mutex<()>>,
}

impl SubmissionStore {
    pub fn new(persistence_path: Option<PathBuf>) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            persistence_path,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn create_record(&self, id: Uuid, user: String, maze_id: String) -> SubmissionRecord {
        SubmissionRecord {
            id,
            user,
            maze_id,
            status: SubmissionStatus::Pending,
            score: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn insert(&self, record: SubmissionRecord) {
        self.records.insert(record.id, record);
    }

    pub fn remove(&self, id: &Uuid) {
        self.records.remove(id);
    }

    pub fn get(&self, id: &Uuid) -> Option<SubmissionRecord> {
        self.records.get(id).map(|e| e.value().clone())
    }

    pub fn list_for_user(&self, user: &str, limit: usize) -> Vec<SubmissionRecord> {
        let mut records: Vec<SubmissionRecord> = self
            .records
            .iter()
            .filter(|e| e.value().user == user)
            .map(|e| e.value().clone())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        records
    }

    pub fn mark_running(&self, id: Uuid) {
        if let Some(mut entry) = self.records.get_mut(&id) {
            if entry.status == SubmissionStatus::Pending {
                entry.status = SubmissionStatus::Running;
                entry.started_at = Some(Utc::now());
            }
        }
    }

    /// Record a terminal outcome and persist it. Persistence failures
    /// are retried with backoff and logged; they never drop the
    /// in-memory record and never re-trigger execution.
    pub async fn mark_finished(
        &self,
        id: Uuid,
        status: SubmissionStatus,
        score: Option<u32>,
        error: Option<String>,
    ) {
        debug_assert!(status.is_terminal());
        let snapshot = if let Some(mut entry) = self.records.get_mut(&id) {
            if entry.status.is_terminal() {
                tracing::warn!(submission_id = %id, "ignoring transition on terminal submission");
                return;
            }
            entry.status = status;
            entry.score = score;
            entry.error = error;
            entry.finished_at = Some(Utc::now());
            Some(entry.clone())
        } else {
            None
        };

        if let (Some(path), Some(record)) = (&self.persistence_path, snapshot) {
            let _guard = self.write_lock.lock().await;
            let line = match serde_json::to_string(&record) {
                Ok(line) => line,
                Err(err) => {
                    tracing::error!(submission_id = %id, error = %err, "record not serializable");
                    return;
                }
            };

            for attempt in 0..PERSIST_ATTEMPTS {
                match append_line(path, &line).await {
                    Ok(()) => return,
                    Err(err) if attempt + 1 < PERSIST_ATTEMPTS => {
                        let backoff = PERSIST_BACKOFF_MS << attempt;
                        tracing::warn!(
                            submission_id = %id,
                            error = %err,
                            backoff_ms = backoff,
                            "persist failed, retrying"
                        );
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                    Err(err) => {
                        tracing::error!(
                            submission_id = %id,
                            error = %err,
                            "persist failed after retries; record kept in memory only"
                        );
                    }
                }
            }
        }
    }
}

async fn append_line(path: &std::path::Path, line: &str) -> std::io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.create(true).append(true);
    let mut file = options.open(path).await?;
    tokio::io::AsyncWriteExt::write_all(&mut file, line.as_bytes()).await?;
    tokio::io::AsyncWriteExt::write_all(&mut file, b"\n").await
}
