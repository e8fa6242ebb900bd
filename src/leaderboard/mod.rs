pub mod in_memory;
pub mod redis_backend;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::metrics::MetricsRegistry;

/// Best known score for one (user, maze) pair.
#[derive(Debug, Clone, Serialize)]
pub struct BestScore {
    pub user: String,
    pub maze_id: String,
    pub score: u32,
    pub achieved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedEntry {
    pub rank: usize,
    pub user: String,
    pub score: u32,
    pub achieved_at: DateTime<Utc>,
}

/// Pushed to subscribers once per accepted replacement. Delivery is
/// at-least-once; subscribers must tolerate duplicates and lag.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreEvent {
    pub user: String,
    pub maze_id: String,
    pub score: u32,
}

/// Atomic per-(user, maze) best-score store. `compare_and_replace` must
/// be a single compare-and-swap on the key: strictly lower scores win,
/// ties keep the stored (earlier) entry.
#[async_trait]
pub trait LeaderboardBackend: Send + Sync {
    async fn compare_and_replace(&self, candidate: BestScore) -> anyhow::Result<bool>;
    async fn top(&self, maze_id: &str, n: usize) -> anyhow::Result<Vec<BestScore>>;
}

#[derive(Clone)]
pub struct Leaderboard {
    backend: Arc<dyn LeaderboardBackend>,
    events: broadcast::Sender<ScoreEvent>,
    metrics: Arc<MetricsRegistry>,
}

impl Leaderboard {
    pub fn new(backend: Arc<dyn LeaderboardBackend>, metrics: Arc<MetricsRegistry>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            backend,
            events,
            metrics,
        }
    }

    /// Offer a completed score. Emits exactly one event when the stored
    /// value was actually improved or created, none otherwise.
    pub async fn submit(&self, user: &str, maze_id: &str, score: u32) -> anyhow::Result<bool> {
        let candidate = BestScore {
            user: user.to_string(),
            maze_id: maze_id.to_string(),
            score,
            achieved_at: Utc::now(),
        };
        let accepted = self.backend.compare_and_replace(candidate).await?;
        if accepted {
            self.metrics.leaderboard_updated();
            let _ = self.events.send(ScoreEvent {
                user: user.to_string(),
                maze_id: maze_id.to_string(),
                score,
            });
        }
        Ok(accepted)
    }

    /// Top `n` for a maze, ascending score, ties broken by earliest
    /// achievement.
    pub async fn top(&self, maze_id: &str, n: usize) -> anyhow::Result<Vec<RankedEntry>> {
        let entries = self.backend.top(maze_id, n).await?;
        Ok(entries
            .into_iter()
            .enumerate()
            .map(|(i, entry)| RankedEntry {
                rank: i + 1,
                user: entry.user,
                score: entry.score,
                achieved_at: entry.achieved_at,
            })
            .collect())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScoreEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{Leaderboard, in_memory::InMemoryLeaderboard};
    use crate::metrics::MetricsRegistry;

    #[tokio::test]
    async fn emits_one_event_per_accepted_replacement() {
        let board = Leaderboard::new(
            Arc::new(InMemoryLeaderboard::new()),
            Arc::new(MetricsRegistry::new()),
        );
        let mut events = board.subscribe();

        assert!(board.submit("alice", "tutorial", 80).await.unwrap());
        assert!(board.submit("alice", "tutorial", 50).await.unwrap());
        // worse and equal scores are rejected and emit nothing
        assert!(!board.submit("alice", "tutorial", 50).await.unwrap());
        assert!(!board.submit("alice", "tutorial", 90).await.unwrap());

        assert_eq!(events.recv().await.unwrap().score, 80);
        assert_eq!(events.recv().await.unwrap().score, 50);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn ranks_ascending_by_score() {
        let board = Leaderboard::new(
            Arc::new(InMemoryLeaderboard::new()),
            Arc::new(MetricsRegistry::new()),
        );
        board.submit("alice", "tutorial", 50).await.unwrap();
        board.submit("bob", "tutorial", 30).await.unwrap();
        board.submit("carol", "other", 10).await.unwrap();

        let top = board.top("tutorial", 10).await.unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].user, "bob");
        assert_eq!(top[0].rank, 1);
        assert_eq!(top[1].user, "alice");
        assert_eq!(top[1].rank, 2);
    }
}
