// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The DB pool reads its own `DOCLOCK_RELAY_DB_*` variables in
// `db::pool`.

use std::net::SocketAddr;
use std::time::Duration;

use crate::lock::{StealTimings, DEFAULT_STEAL_CLEANUP, DEFAULT_STEAL_COUNTDOWN};

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1_000;
const DEFAULT_LOCK_STALE_AFTER_SECS: u64 = 90;

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    /// PostgreSQL connection string. Unset runs a single relay on the
    /// in-memory store.
    pub database_url: Option<String>,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `doclock_relay=debug`).
    pub log_filter: String,
    /// Emit JSON log lines instead of the human-readable format.
    pub log_json: bool,
    pub steal_timings: StealTimings,
    pub sweep_interval: Duration,
    /// `None` disables stale-holder reclaim.
    pub lock_stale_after: Option<Duration>,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `DOCLOCK_RELAY_HOST` | `0.0.0.0` |
    /// | `DOCLOCK_RELAY_PORT` | `8080` |
    /// | `DOCLOCK_RELAY_DATABASE_URL` | *(none)* |
    /// | `DOCLOCK_RELAY_CORS_ORIGINS` | *(none, cors.rs uses dev defaults)* |
    /// | `DOCLOCK_RELAY_LOG_FILTER` | `info` |
    /// | `DOCLOCK_RELAY_LOG_FORMAT` | `text` (`json` for JSON lines) |
    /// | `DOCLOCK_RELAY_STEAL_COUNTDOWN_SECS` | `30` |
    /// | `DOCLOCK_RELAY_STEAL_CLEANUP_SECS` | `10` |
    /// | `DOCLOCK_RELAY_SWEEP_INTERVAL_MS` | `1000` |
    /// | `DOCLOCK_RELAY_LOCK_STALE_AFTER_SECS` | `90`, `0` disables |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    pub fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("DOCLOCK_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 =
            env("DOCLOCK_RELAY_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let database_url =
            env("DOCLOCK_RELAY_DATABASE_URL").ok().filter(|value| !value.trim().is_empty());
        let cors_origins = env("DOCLOCK_RELAY_CORS_ORIGINS").ok();
        let log_filter = env("DOCLOCK_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_json = env("DOCLOCK_RELAY_LOG_FORMAT")
            .is_ok_and(|format| format.trim().eq_ignore_ascii_case("json"));

        let positive_u64 = |key: &str| {
            env(key).ok().and_then(|v| v.trim().parse::<u64>().ok()).filter(|value| *value > 0)
        };

        let steal_timings = StealTimings {
            countdown: positive_u64("DOCLOCK_RELAY_STEAL_COUNTDOWN_SECS")
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_STEAL_COUNTDOWN),
            cleanup: positive_u64("DOCLOCK_RELAY_STEAL_CLEANUP_SECS")
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_STEAL_CLEANUP),
        };
        let sweep_interval = Duration::from_millis(
            positive_u64("DOCLOCK_RELAY_SWEEP_INTERVAL_MS").unwrap_or(DEFAULT_SWEEP_INTERVAL_MS),
        );

        let lock_stale_after = match env("DOCLOCK_RELAY_LOCK_STALE_AFTER_SECS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(Duration::from_secs(DEFAULT_LOCK_STALE_AFTER_SECS)),
        };

        Self {
            listen_addr,
            database_url,
            cors_origins,
            log_filter,
            log_json,
            steal_timings,
            sweep_interval,
            lock_stale_after,
        }
    }
}
