use std::{env, fs, path::Path, path::PathBuf, time::Duration};

use crate::{engine::EngineConfig, errors::Error, Result};

/// Typed configuration, read from the environment (optionally seeded from `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    // Telegram
    pub telegram_bot_token: String,
    pub telegram_api_url: Option<String>,

    // Deletion loop
    pub delete_delay: Duration,
    pub failure_backoff: Duration,
    pub max_consecutive_failures: u32,
    pub progress_every: u64,
    pub delete_timeout: Option<Duration>,

    // Sessions
    pub session_idle_timeout: Option<Duration>,

    // Audit
    pub audit_log_path: PathBuf,
    pub audit_log_json: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source (the process env in production).
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env_str = |key: &str| var(key).and_then(non_empty);
        let env_u64 = |key: &str| -> Result<Option<u64>> {
            env_str(key)
                .map(|s| {
                    s.trim()
                        .parse::<u64>()
                        .map_err(|_| Error::Config(format!("{key} must be a non-negative integer")))
                })
                .transpose()
        };

        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN").ok_or_else(|| {
            Error::Config("TELEGRAM_BOT_TOKEN environment variable is required".to_string())
        })?;
        let telegram_api_url = env_str("TELEGRAM_API_URL").or_else(|| env_str("API_SERVER_URL"));

        let delete_delay = Duration::from_millis(env_u64("DELETE_DELAY_MS")?.unwrap_or(100));
        let failure_backoff =
            Duration::from_millis(env_u64("FAILURE_BACKOFF_MS")?.unwrap_or(1000));

        let max_consecutive_failures = env_u64("MAX_CONSECUTIVE_FAILURES")?.unwrap_or(10);
        if max_consecutive_failures == 0 || max_consecutive_failures > u32::MAX as u64 {
            return Err(Error::Config(
                "MAX_CONSECUTIVE_FAILURES must be between 1 and 4294967295".to_string(),
            ));
        }

        let progress_every = env_u64("PROGRESS_EVERY")?.unwrap_or(20);
        if progress_every == 0 {
            return Err(Error::Config("PROGRESS_EVERY must be at least 1".to_string()));
        }

        // 0 disables.
        let delete_timeout = match env_u64("DELETE_TIMEOUT_MS")?.unwrap_or(30_000) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        let session_idle_timeout = match env_u64("SESSION_IDLE_TIMEOUT_SECS")?.unwrap_or(1800) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let audit_log_path = PathBuf::from(
            env_str("AUDIT_LOG_PATH").unwrap_or("/tmp/channel-clear-audit.log".to_string()),
        );
        let audit_log_json = env_str("AUDIT_LOG_JSON")
            .map(|s| parse_bool(&s))
            .unwrap_or(false);

        Ok(Self {
            telegram_bot_token,
            telegram_api_url,
            delete_delay,
            failure_backoff,
            max_consecutive_failures: max_consecutive_failures as u32,
            progress_every,
            delete_timeout,
            session_idle_timeout,
            audit_log_path,
            audit_log_json,
        })
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            request_delay: self.delete_delay,
            failure_backoff: self.failure_backoff,
            max_consecutive_failures: self.max_consecutive_failures,
            progress_every: self.progress_every,
            delete_timeout: self.delete_timeout,
        }
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        env::set_var(key, unquote(v.trim()));
    }
}

/// Strip optional surrounding quotes.
fn unquote(val: &str) -> &str {
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        return &val[1..val.len() - 1];
    }
    val
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
