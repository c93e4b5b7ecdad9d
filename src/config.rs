use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

// =============================================================================
// Defaults
// =============================================================================

/// Default check interval in seconds (24 hours). `0` disables the loop.
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Default timeout for the manifest fetch in seconds.
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 60;

/// Default release feed endpoint. Self-hosted sites point
/// `UPDATE_CHECK_URL` at their own mirror.
pub const DEFAULT_UPDATE_URL: &str = "https://updates.example.com/runtime";

/// Days before an EOM/EOBS date at which warnings start showing.
pub const DEFAULT_WARNING_THRESHOLD_DAYS: i64 = 30;

/// Days a dismissed warning stays hidden.
pub const DEFAULT_DISMISSAL_PERIOD_DAYS: i64 = 7;

/// Fixed retry delay after a cycle fails unexpectedly.
pub const FAILURE_RETRY_SECS: u64 = 3600;

/// Process-wide update-check configuration, read once at startup.
///
/// Every field has a default; `from_env` overlays `UPDATE_CHECK_*`
/// environment variables on top of them.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct UpdateCheckConfig {
    /// Seconds between checks; `0` disables the coordinator entirely.
    pub check_interval_secs: u64,
    pub fetch_timeout_secs: u64,
    pub update_url: String,
    /// Identifies the calling site in the feed request query string.
    pub site: String,
    /// Configured executor type of the host scheduler, reported in the
    /// anonymized user-agent blob.
    pub executor: Option<String>,
    pub eom_warning_opt_out: bool,
    pub eobs_warning_opt_out: bool,
    pub eom_warning_threshold_days: i64,
    pub eobs_warning_threshold_days: i64,
    pub eom_dismissal_period_days: i64,
    pub eobs_dismissal_period_days: i64,
    /// Serve a synthetic manifest instead of hitting the network.
    pub fake_check: bool,
}

impl Default for UpdateCheckConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: DEFAULT_CHECK_INTERVAL_SECS,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            update_url: DEFAULT_UPDATE_URL.to_string(),
            site: "/".to_string(),
            executor: None,
            eom_warning_opt_out: false,
            eobs_warning_opt_out: false,
            eom_warning_threshold_days: DEFAULT_WARNING_THRESHOLD_DAYS,
            eobs_warning_threshold_days: DEFAULT_WARNING_THRESHOLD_DAYS,
            eom_dismissal_period_days: DEFAULT_DISMISSAL_PERIOD_DAYS,
            eobs_dismissal_period_days: DEFAULT_DISMISSAL_PERIOD_DAYS,
            fake_check: false,
        }
    }
}

impl UpdateCheckConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(v) = parse_var(&lookup, "UPDATE_CHECK_INTERVAL") {
            config.check_interval_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "UPDATE_CHECK_TIMEOUT") {
            config.fetch_timeout_secs = v;
        }
        if let Some(v) = lookup("UPDATE_CHECK_URL") {
            config.update_url = v;
        }
        if let Some(v) = lookup("UPDATE_CHECK_SITE") {
            config.site = v;
        }
        if let Some(v) = lookup("UPDATE_CHECK_EXECUTOR") {
            config.executor = Some(v);
        }
        if let Some(v) = flag_var(&lookup, "UPDATE_CHECK_EOM_OPT_OUT") {
            config.eom_warning_opt_out = v;
        }
        if let Some(v) = flag_var(&lookup, "UPDATE_CHECK_EOBS_OPT_OUT") {
            config.eobs_warning_opt_out = v;
        }
        if let Some(v) = parse_var(&lookup, "UPDATE_CHECK_EOM_THRESHOLD_DAYS") {
            config.eom_warning_threshold_days = v;
        }
        if let Some(v) = parse_var(&lookup, "UPDATE_CHECK_EOBS_THRESHOLD_DAYS") {
            config.eobs_warning_threshold_days = v;
        }
        if let Some(v) = parse_var(&lookup, "UPDATE_CHECK_EOM_DISMISSAL_DAYS") {
            config.eom_dismissal_period_days = v;
        }
        if let Some(v) = parse_var(&lookup, "UPDATE_CHECK_EOBS_DISMISSAL_DAYS") {
            config.eobs_dismissal_period_days = v;
        }
        if let Some(v) = flag_var(&lookup, "UPDATE_CHECK_FAKE") {
            config.fake_check = v;
        }
        config
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("ignoring unparseable {key}={raw:?}");
            None
        }
    }
}

fn flag_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let raw = lookup(key)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => {
            warn!("ignoring unparseable {key}={raw:?}");
            None
        }
    }
}

/// The version string of the running runtime, if the host exported one.
pub fn runtime_version() -> Option<String> {
    std::env::var("RUNTIME_VERSION")
        .ok()
        .filter(|v| !v.is_empty())
}

/// Database location: `$UPDATE_CHECK_DB`, else
/// `<platform data dir>/update-check/releases.db`.
pub fn db_path() -> PathBuf {
    db_path_with_env(std::env::var("UPDATE_CHECK_DB").ok(), dirs::data_dir())
}

fn db_path_with_env(override_path: Option<String>, data_dir: Option<PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return PathBuf::from(path);
    }
    data_dir
        .unwrap_or_else(|| PathBuf::from("."))
        .join("update-check")
        .join("releases.db")
}
