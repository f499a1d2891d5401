use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use portal_reconcile::{
    DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, DEFAULT_MAX_ATTEMPTS, DEFAULT_METRICS_INTERVAL,
    DEFAULT_RECONCILE_INTERVAL,
};

use crate::adapter::DEFAULT_CALL_TIMEOUT;
use crate::metrics::DEFAULT_RING_CAPACITY;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    /// Use the in-process simulated provider instead of the HTTP one.
    pub dev_mode: bool,
    pub provider: ProviderConfig,
    pub reconcile_interval: Duration,
    pub metrics_interval: Duration,
    pub metrics_capacity: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// How long a mutation waits for a busy resource lock before conflicting.
    pub lock_timeout: Duration,
    /// How long finished operations, and the tombstones they keep, are retained.
    pub operation_retention: Duration,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub url: Option<String>,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            log_level: "info".to_string(),
            dev_mode: false,
            provider: ProviderConfig {
                url: None,
                token: None,
                timeout: DEFAULT_CALL_TIMEOUT,
            },
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            metrics_interval: DEFAULT_METRICS_INTERVAL,
            metrics_capacity: DEFAULT_RING_CAPACITY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            lock_timeout: Duration::from_millis(2000),
            operation_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let listen_addr = parse_or(&lookup, "PORTAL_LISTEN_ADDR", defaults.listen_addr)?;
        let log_level = lookup("PORTAL_LOG_LEVEL").unwrap_or(defaults.log_level);

        let dev_mode = lookup("PORTAL_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let provider = ProviderConfig {
            url: lookup("PORTAL_PROVIDER_URL").filter(|v| !v.is_empty()),
            token: lookup("PORTAL_PROVIDER_TOKEN").filter(|v| !v.is_empty()),
            timeout: secs(&lookup, "PORTAL_ADAPTER_TIMEOUT_SECS", defaults.provider.timeout)?,
        };
        if !dev_mode && provider.url.is_none() {
            bail!("PORTAL_PROVIDER_URL is required unless PORTAL_DEV is set");
        }

        let reconcile_interval = secs(
            &lookup,
            "PORTAL_RECONCILE_INTERVAL_SECS",
            defaults.reconcile_interval,
        )?;
        if reconcile_interval > Duration::from_secs(300) {
            bail!("PORTAL_RECONCILE_INTERVAL_SECS must be between 1 and 300");
        }

        let metrics_interval = secs(
            &lookup,
            "PORTAL_METRICS_INTERVAL_SECS",
            defaults.metrics_interval,
        )?;

        let metrics_capacity: usize =
            parse_or(&lookup, "PORTAL_METRICS_CAPACITY", defaults.metrics_capacity)?;
        if metrics_capacity == 0 {
            bail!("PORTAL_METRICS_CAPACITY must be positive");
        }

        let max_attempts: u32 = parse_or(&lookup, "PORTAL_MAX_ATTEMPTS", defaults.max_attempts)?;
        if max_attempts == 0 {
            bail!("PORTAL_MAX_ATTEMPTS must be positive");
        }

        let backoff_base = Duration::from_millis(parse_or(
            &lookup,
            "PORTAL_BACKOFF_BASE_MS",
            defaults.backoff_base.as_millis() as u64,
        )?);
        let backoff_max = secs(&lookup, "PORTAL_BACKOFF_MAX_SECS", defaults.backoff_max)?;
        if backoff_base > backoff_max {
            bail!("PORTAL_BACKOFF_BASE_MS must not exceed PORTAL_BACKOFF_MAX_SECS");
        }

        let lock_timeout = Duration::from_millis(parse_or(
            &lookup,
            "PORTAL_LOCK_TIMEOUT_MS",
            defaults.lock_timeout.as_millis() as u64,
        )?);

        let operation_retention = secs(
            &lookup,
            "PORTAL_OPERATION_RETENTION_SECS",
            defaults.operation_retention,
        )?;

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            provider,
            reconcile_interval,
            metrics_interval,
            metrics_capacity,
            max_attempts,
            backoff_base,
            backoff_max,
            lock_timeout,
            operation_retention,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("{e}"))
            .with_context(|| format!("invalid {key}: {raw:?}")),
    }
}

/// A positive whole number of seconds.
fn secs<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let value: u64 = parse_or(lookup, key, default.as_secs())?;
    if value == 0 {
        bail!("{key} must be positive");
    }
    Ok(Duration::from_secs(value))
}
