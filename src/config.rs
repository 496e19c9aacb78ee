use std::path::PathBuf;

/// Process-wide tunables, resolved once from the environment at startup.
///
/// Mirrors the shape of a trading bot's `Config::from_env` pattern: every
/// field has a hard-coded fallback so the process never refuses to start
/// because of a missing variable.
#[derive(Clone, Debug)]
pub struct Config {
    pub data_dir: PathBuf,
    pub lock_ttl_seconds: u64,
    pub webhook_timeout_seconds: u64,
    pub run_id: String,
    pub worker_id: String,
    pub automation_max_tasks: u32,
    pub automation_poll_ms: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("LEDGERFLOW_DATA_DIR")
                .ok()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            lock_ttl_seconds: env_parse("LEDGERFLOW_LOCK_TTL_SECONDS", 300),
            webhook_timeout_seconds: env_parse("LEDGERFLOW_WEBHOOK_TIMEOUT_SECONDS", 10),
            run_id: std::env::var("LEDGERFLOW_RUN_ID").unwrap_or_else(|_| crate::ids::ulid()),
            worker_id: std::env::var("LEDGERFLOW_WORKER_ID").unwrap_or_else(|_| "worker".to_string()),
            automation_max_tasks: env_parse("LEDGERFLOW_AUTOMATION_MAX_TASKS", 10),
            automation_poll_ms: env_parse("LEDGERFLOW_AUTOMATION_POLL_MS", 200),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
