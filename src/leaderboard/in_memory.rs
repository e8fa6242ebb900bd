use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};

use crate::leaderboard::{BestScore, LeaderboardBackend};

/// Dashmap-backed store. The `Entry` API holds the shard lock for the
/// whole read-compare-write, which is the per-key compare-and-swap the
/// update rule needs; there is no global lock.
pub struct InMemoryLeaderboard {
    entries: DashMap<(String, String), BestScore>,
}

impl InMemoryLeaderboard {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl Default for InMemoryLeaderboard {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaderboardBackend for InMemoryLeaderboard {
    async fn compare_and_replace(&self, candidate: BestScore) -> anyhow::Result<bool> {
        let key = (candidate.maze_id.clone(), candidate.user.clone());
        match self.entries.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(candidate);
                Ok(true)
            }
            Entry::Occupied(mut slot) => {
                if candidate.score < slot.get().score {
                    slot.insert(candidate);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn top(&self, maze_id: &str, n: usize) -> anyhow::Result<Vec<BestScore>> {
        let mut entries: Vec<BestScore> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == maze_id)
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by(|a, b| {
            a.score
                .cmp(&b.score)
                .then_with(|| a.achieved_at.cmp(&b.achieved_at))
        });
        entries.truncate(n);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::InMemoryLeaderboard;
    use crate::leaderboard::{BestScore, LeaderboardBackend};

    fn entry(user: &str, score: u32) -> BestScore {
        BestScore {
            user: user.to_string(),
            maze_id: "tutorial".to_string(),
            score,
            achieved_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn stored_score_is_monotonically_non_increasing() {
        let board = InMemoryLeaderboard::new();
        for (score, accepted) in [(80, true), (90, false), (80, false), (79, true)] {
            let got = board.compare_and_replace(entry("alice", score)).await.unwrap();
            assert_eq!(got, accepted, "score {score}");
        }
        let top = board.top("tutorial", 1).await.unwrap();
        assert_eq!(top[0].score, 79);
    }

    #[tokio::test]
    async fn concurrent_completions_stabilize_at_the_best() {
        let board = std::sync::Arc::new(InMemoryLeaderboard::new());
        let mut tasks = Vec::new();
        for score in [80u32, 50, 65, 50, 71] {
            let board = board.clone();
            tasks.push(tokio::spawn(async move {
                board.compare_and_replace(entry("alice", score)).await.unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        let top = board.top("tutorial", 10).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].score, 50);
    }

    #[tokio::test]
    async fn ties_keep_the_earlier_entry() {
        let board = InMemoryLeaderboard::new();
        let first = entry("alice", 50);
        let first_time = first.achieved_at;
        board.compare_and_replace(first).await.unwrap();
        assert!(!board.compare_and_replace(entry("alice", 50)).await.unwrap());
        let top = board.top("tutorial", 1).await.unwrap();
        assert_eq!(top[0].achieved_at, first_time);
    }
}
