//! Runner configuration loaded from environment variables.

use std::time::Duration;

use crate::dag::parse_duration;

/// Process-wide defaults injected into the [`Runner`](crate::Runner).
/// Task code never reads the environment directly; everything flows
/// through this handle.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL; only required by the Postgres store.
    pub database_url: Option<String>,

    /// Default for HTTP tasks that leave `allowUnrestrictedNetworkAccess`
    /// unset. When false, loopback and private addresses are refused.
    pub default_http_allow_unrestricted_network_access: bool,

    /// Node-level ceiling on a single task's execution time, applied when
    /// the job does not carry its own `max_task_duration`.
    pub job_pipeline_max_task_duration: Duration,

    /// Socket-level timeout for one HTTP attempt.
    pub default_http_timeout: Duration,

    /// Retries on transient network errors, bounded by the task deadline.
    pub http_max_retries: u32,

    /// Cap on HTTP response bodies.
    pub http_max_response_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            default_http_allow_unrestricted_network_access: false,
            job_pipeline_max_task_duration: Duration::from_secs(10 * 60),
            default_http_timeout: Duration::from_secs(15),
            http_max_retries: 5,
            http_max_response_bytes: 32 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Load configuration from the environment (and a `.env` file when
    /// present), falling back to defaults field by field.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let database_url = std::env::var("DATABASE_URL").ok();

        let default_http_allow_unrestricted_network_access =
            match std::env::var("DEFAULT_HTTP_ALLOW_UNRESTRICTED_NETWORK_ACCESS") {
                Ok(raw) => raw.parse().map_err(|_| {
                    anyhow::anyhow!(
                        "DEFAULT_HTTP_ALLOW_UNRESTRICTED_NETWORK_ACCESS must be true or false"
                    )
                })?,
                Err(_) => defaults.default_http_allow_unrestricted_network_access,
            };

        let job_pipeline_max_task_duration =
            duration_env("JOB_PIPELINE_MAX_TASK_DURATION", defaults.job_pipeline_max_task_duration)?;
        let default_http_timeout =
            duration_env("DEFAULT_HTTP_TIMEOUT", defaults.default_http_timeout)?;

        let http_max_retries = match std::env::var("HTTP_MAX_RETRIES") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| anyhow::anyhow!("HTTP_MAX_RETRIES must be an integer"))?,
            Err(_) => defaults.http_max_retries,
        };

        let http_max_response_bytes = match std::env::var("HTTP_MAX_RESPONSE_BYTES") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| anyhow::anyhow!("HTTP_MAX_RESPONSE_BYTES must be an integer"))?,
            Err(_) => defaults.http_max_response_bytes,
        };

        Ok(Self {
            database_url,
            default_http_allow_unrestricted_network_access,
            job_pipeline_max_task_duration,
            default_http_timeout,
            http_max_retries,
            http_max_response_bytes,
        })
    }
}

fn duration_env(key: &str, default: Duration) -> anyhow::Result<Duration> {
    match std::env::var(key) {
        Ok(raw) => parse_duration(&raw)
            .map_err(|err| anyhow::anyhow!("{key} is not a valid duration: {err}")),
        Err(_) => Ok(default),
    }
}
