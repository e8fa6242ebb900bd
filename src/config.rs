use std::{collections::HashMap, env, net::SocketAddr, path::PathBuf, str::FromStr};

use crate::models::ExecutionLimits;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    /// Upper bound on concurrently running sandboxes; one worker per slot.
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub sandbox_backend: SandboxBackendKind,
    pub sandbox_image: String,
    pub sandbox_interpreter: String,
    pub default_limits: ExecutionLimits,
    pub max_code_bytes: usize,
    /// api key -> user name
    pub api_keys: HashMap<String, String>,
    pub submit_rate_per_minute: u32,
    pub submit_rate_burst: u32,
    pub session_idle_secs: u64,
    pub leaderboard_backend: LeaderboardBackendKind,
    pub mazes_dir: Option<PathBuf>,
    pub persistence_path: Option<PathBuf>,
    /// Base URL sandboxed code uses to reach the session API.
    pub session_api_url: String,
    pub log_level: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let bind_addr: SocketAddr = env_parse("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)));
        Self {
            bind_addr,
            worker_count: env_parse("WORKER_COUNT", 4usize),
            queue_capacity: env_parse("QUEUE_CAPACITY", 256usize),
            sandbox_backend: env_parse("SANDBOX_BACKEND", SandboxBackendKind::Docker),
            sandbox_image: env::var("SANDBOX_IMAGE")
                .unwrap_or_else(|_| "labyrinth-sandbox".to_string()),
            sandbox_interpreter: env::var("SANDBOX_INTERPRETER")
                .unwrap_or_else(|_| "python3".to_string()),
            default_limits: ExecutionLimits {
                cpu_cores: env_parse("DEFAULT_CPU_CORES", 0.5),
                memory_mb: env_parse("DEFAULT_MEMORY_MB", 256),
                timeout_ms: env_parse("DEFAULT_TIMEOUT_MS", 300_000),
                max_pids: env_parse("DEFAULT_MAX_PIDS", 50),
                max_output_bytes: env_parse("DEFAULT_MAX_OUTPUT_BYTES", 64 * 1024),
            },
            max_code_bytes: env_parse("MAX_CODE_BYTES", 100_000usize),
            api_keys: parse_api_keys(
                &env::var("API_KEYS").unwrap_or_else(|_| "default:dev-key".to_string()),
            ),
            submit_rate_per_minute: env_parse("SUBMIT_RATE_PER_MINUTE", 6u32),
            submit_rate_burst: env_parse("SUBMIT_RATE_BURST", 3u32),
            session_idle_secs: env_parse("SESSION_IDLE_SECS", 1800u64),
            leaderboard_backend: leaderboard_backend_from_env(),
            mazes_dir: env::var("MAZES_DIR").ok().map(PathBuf::from),
            persistence_path: env::var("PERSIST_RESULTS_PATH").ok().map(PathBuf::from),
            session_api_url: env::var("SESSION_API_URL")
                .unwrap_or_else(|_| format!("http://host.docker.internal:{}", bind_addr.port())),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub enum SandboxBackendKind {
    #[default]
    Docker,
    Process,
}

impl FromStr for SandboxBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "process" => Ok(Self::Process),
            _ => Err(format!("unsupported sandbox backend: {s}")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub enum LeaderboardBackendKind {
    #[default]
    InMemory,
    Redis {
        url: String,
    },
}

fn leaderboard_backend_from_env() -> LeaderboardBackendKind {
    match env::var("LEADERBOARD_REDIS_URL") {
        Ok(url) if !url.trim().is_empty() => LeaderboardBackendKind::Redis { url },
        _ => LeaderboardBackendKind::InMemory,
    }
}

fn parse_api_keys(input: &str) -> HashMap<String, String> {
    let mut keys = HashMap::new();
    for raw in input.split(',') {
        let entry = raw.trim();
        if entry.is_empty() {
            continue;
        }
        if let Some((user, key)) = entry.split_once(':') {
            keys.insert(key.to_string(), user.to_string());
        }
    }
    if keys.is_empty() {
        keys.insert("dev-key".to_string(), "default".to_string());
    }
    keys
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
