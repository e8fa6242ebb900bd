use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Movement directions accepted on the session API. Unknown values are
/// rejected at deserialization, not coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    North,
    South,
    East,
    West,
}

impl Direction {
    pub fn delta(self) -> (i32, i32) {
        match self {
            Direction::North => (0, -1),
            Direction::South => (0, 1),
            Direction::East => (1, 0),
            Direction::West => (-1, 0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub fn step(self, direction: Direction) -> Self {
        let (dx, dy) = direction.delta();
        Self {
            x: self.x + dx,
            y: self.y + dy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveStatus {
    Moved,
    Blocked,
    Mud,
    Stuck,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl SubmissionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SubmissionStatus::Completed | SubmissionStatus::Failed | SubmissionStatus::Timeout
        )
    }
}

/// Resource ceilings applied to one sandbox run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLimits {
    pub cpu_cores: f32,
    pub memory_mb: u64,
    pub timeout_ms: u64,
    pub max_pids: u64,
    pub max_output_bytes: usize,
}

impl ExecutionLimits {
    pub fn normalized(mut self) -> Self {
        self.cpu_cores = self.cpu_cores.clamp(0.1, 4.0);
        self.memory_mb = self.memory_mb.clamp(32, 4096);
        self.timeout_ms = self.timeout_ms.clamp(1000, 600_000);
        self.max_pids = self.max_pids.clamp(1, 128);
        self.max_output_bytes = self.max_output_bytes.clamp(1024, 4 * 1024 * 1024);
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionRequest {
    pub maze_id: String,
    pub code: String,
}

/// One code run, tracked from submit to a terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub id: Uuid,
    pub user: String,
    pub maze_id: String,
    pub status: SubmissionStatus,
    pub score: Option<u32>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateSubmissionResponse {
    pub id: Uuid,
    pub status: SubmissionStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionStatusResponse {
    pub id: Uuid,
    pub status: SubmissionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<SubmissionRecord> for SubmissionStatusResponse {
    fn from(record: SubmissionRecord) -> Self {
        Self {
            id: record.id,
            status: record.status,
            score: record.score,
            error: record.error,
            created_at: record.created_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Direction, ExecutionLimits};

    #[test]
    fn normalizes_limits_to_safe_bounds() {
        let normalized = ExecutionLimits {
            cpu_cores: 0.01,
            memory_mb: 1,
            timeout_ms: 1,
            max_pids: 999,
            max_output_bytes: 99_000_000,
        }
        .normalized();

        assert_eq!(normalized.cpu_cores, 0.1);
        assert_eq!(normalized.memory_mb, 32);
        assert_eq!(normalized.timeout_ms, 1000);
        assert_eq!(normalized.max_pids, 128);
        assert_eq!(normalized.max_output_bytes, 4 * 1024 * 1024);
    }

    #[test]
    fn rejects_unknown_direction() {
        let parsed: Result<Direction, _> = serde_json::from_str("\"up\"");
        assert!(parsed.is_err());
        let parsed: Direction = serde_json::from_str("\"north\"").unwrap();
        assert_eq!(parsed, Direction::North);
    }
}
