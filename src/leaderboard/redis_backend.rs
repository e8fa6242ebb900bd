use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Script, aio::ConnectionManager};

use crate::leaderboard::{BestScore, LeaderboardBackend};

/// Compare-and-swap per (user, maze) key: replace only when no score is
/// stored or the candidate is strictly lower. Runs server-side so two
/// simultaneous completions cannot interleave between read and write.
const COMPARE_AND_REPLACE_LUA: &str = r#"
local entry_key = KEYS[1]
local board_key = KEYS[2]
local user = ARGV[1]
local score = tonumber(ARGV[2])
local achieved_at = ARGV[3]

local current = redis.call('HGET', entry_key, 'score')
if current and tonumber(current) <= score then
  return 0
end

redis.call('HSET', entry_key, 'score', score, 'achieved_at', achieved_at)
redis.call('ZADD', board_key, score, user)
return 1
"#;

pub struct RedisLeaderboard {
    manager: ConnectionManager,
    key_prefix: String,
}

impl RedisLeaderboard {
    pub async fn new(url: String, key_prefix: String) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            manager,
            key_prefix,
        })
    }

    fn entry_key(&self, maze_id: &str, user: &str) -> String {
        format!("{}:entry:{}:{}", self.key_prefix, maze_id, user)
    }

    fn board_key(&self, maze_id: &str) -> String {
        format!("{}:board:{}", self.key_prefix, maze_id)
    }
}

#[async_trait]
impl LeaderboardBackend for RedisLeaderboard {
    async fn compare_and_replace(&self, candidate: BestScore) -> anyhow::Result<bool> {
        let mut conn = self.manager.clone();
        let script = Script::new(COMPARE_AND_REPLACE_LUA);
        let accepted: i64 = script
            .key(self.entry_key(&candidate.maze_id, &candidate.user))
            .key(self.board_key(&candidate.maze_id))
            .arg(&candidate.user)
            .arg(candidate.score)
            .arg(candidate.achieved_at.to_rfc3339())
            .invoke_async(&mut conn)
            .await?;
        Ok(accepted == 1)
    }

    async fn top(&self, maze_id: &str, n: usize) -> anyhow::Result<Vec<BestScore>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.manager.clone();
        let board_key = self.board_key(maze_id);
        let ranked: Vec<(String, f64)> = conn
            .zrange_withscores(&board_key, 0, n.saturating_sub(1) as isize)
            .await?;

        let mut entries = Vec::with_capacity(ranked.len());
        for (user, score) in ranked {
            let achieved_at: Option<String> = conn
                .hget(self.entry_key(maze_id, &user), "achieved_at")
                .await?;
            let achieved_at = achieved_at
                .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);
            entries.push(BestScore {
                user,
                maze_id: maze_id.to_string(),
                score: score as u32,
                achieved_at,
            });
        }

        // zset ties order lexically by member; the contract wants
        // earliest achievement first
        entries.sort_by(|a, b| {
            a.score
                .cmp(&b.score)
                .then_with(|| a.achieved_at.cmp(&b.achieved_at))
        });
        Ok(entries)
    }
}
