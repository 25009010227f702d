//! Process-wide network settings, read from the environment.

use std::{env, sync::OnceLock, time::Duration};
use tracing::warn;

pub const DEFAULT_MAX_CONCURRENT_REQUESTS: u32 = 20;

const MAX_CONCURRENT_REQUESTS_ENV: &str = "RUNLOOP_MAX_CONCURRENT_REQUESTS";
const USER_AGENT_ENV: &str = "RUNLOOP_USER_AGENT";
const CONNECT_TIMEOUT_ENV: &str = "RUNLOOP_CONNECT_TIMEOUT_SECS";
const TIMEOUT_ENV: &str = "RUNLOOP_TIMEOUT_SECS";

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Ceiling on in-flight HTTP transfers per file source.
///
/// Read once per process; later changes to the environment are not seen.
pub fn maximum_concurrent_requests() -> u32 {
    static MAX: OnceLock<u32> = OnceLock::new();
    *MAX.get_or_init(|| parse_limit(env::var(MAX_CONCURRENT_REQUESTS_ENV).ok().as_deref()))
}

fn parse_limit(raw: Option<&str>) -> u32 {
    let Some(raw) = raw else {
        return DEFAULT_MAX_CONCURRENT_REQUESTS;
    };
    match raw.trim().parse::<u32>() {
        Ok(limit) if limit > 0 => limit,
        _ => {
            warn!(
                value = raw,
                "ignoring invalid {MAX_CONCURRENT_REQUESTS_ENV}, using {DEFAULT_MAX_CONCURRENT_REQUESTS}"
            );
            DEFAULT_MAX_CONCURRENT_REQUESTS
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    pub user_agent: String,
    pub connect_timeout: Duration,
    /// Whole-transfer timeout. `None` leaves it to the OS.
    pub timeout: Option<Duration>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            timeout: Some(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
        }
    }
}

impl HttpConfig {
    /// Defaults overridden by `RUNLOOP_USER_AGENT`, `RUNLOOP_CONNECT_TIMEOUT_SECS`
    /// and `RUNLOOP_TIMEOUT_SECS` (`0` disables the transfer timeout).
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(agent) = lookup(USER_AGENT_ENV).filter(|agent| !agent.trim().is_empty()) {
            config.user_agent = agent;
        }
        if let Some(secs) = lookup_secs(&lookup, CONNECT_TIMEOUT_ENV) {
            if secs > 0 {
                config.connect_timeout = Duration::from_secs(secs);
            }
        }
        if let Some(secs) = lookup_secs(&lookup, TIMEOUT_ENV) {
            config.timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        config
    }
}

fn lookup_secs(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(secs) => Some(secs),
        Err(_) => {
            warn!(value = %raw, "ignoring invalid {name}");
            None
        }
    }
}
