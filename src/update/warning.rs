//! User-facing notices computed from stored release data.
//!
//! Everything here is read-only against the release store and never touches
//! the check lock; a status query may observe data from before an in-flight
//! check cycle, never a partial write.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::UpdateCheckConfig;
use crate::update::error::StoreError;
use crate::update::store::{ReleaseRecord, ReleaseStore};
use crate::update::version::RuntimeVersion;

/// Display name used in operator-facing messages.
pub const APP_NAME: &str = "Runtime";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningKind {
    Eom,
    Eobs,
    Yanked,
}

impl WarningKind {
    /// Short form used in dismissal messages.
    pub fn label(self) -> &'static str {
        match self {
            WarningKind::Eom => "EOM",
            WarningKind::Eobs => "EOBS",
            WarningKind::Yanked => "Yanked",
        }
    }

    fn phase(self) -> &'static str {
        match self {
            WarningKind::Eom => "end of maintenance",
            WarningKind::Eobs => "end of basic support",
            WarningKind::Yanked => "yanked",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningLevel {
    Warning,
    Critical,
}

/// A single active warning for the running version.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionWarning {
    #[serde(rename = "type")]
    pub kind: WarningKind,
    pub level: WarningLevel,
    pub message: String,
    pub days_remaining: Option<i64>,
    pub dismissed_until: Option<DateTime<Utc>>,
    pub can_dismiss: bool,
}

/// An available newer release worth surfacing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateInfo {
    pub version: String,
    pub level: String,
    pub date_released: DateTime<Utc>,
    pub description: Option<String>,
    pub url: Option<String>,
}

pub struct WarningEngine {
    store: Arc<ReleaseStore>,
    config: UpdateCheckConfig,
}

impl WarningEngine {
    pub fn new(store: Arc<ReleaseStore>, config: UpdateCheckConfig) -> Self {
        Self { store, config }
    }

    /// The stored record for the running version, if a check has seen it.
    pub async fn current_record(
        &self,
        version: &str,
    ) -> Result<Option<ReleaseRecord>, StoreError> {
        self.store.find_release(version).await
    }

    /// The best visible release strictly newer than `current`: the highest
    /// one in the running release line, or failing that the overall highest.
    ///
    /// On 5.0-6 with 5.0-8 and 6.0-1 both available, this surfaces 5.0-8.
    pub async fn available_update(
        &self,
        current: &RuntimeVersion,
    ) -> Result<Option<UpdateInfo>, StoreError> {
        let releases = self.store.list_visible_releases().await?;

        let mut newer = Vec::new();
        for record in releases {
            let version = RuntimeVersion::parse(&record.version)?;
            if version > *current {
                newer.push((version, record));
            }
        }
        newer.sort_by(|(a, _), (b, _)| b.cmp(a));

        let best = newer
            .iter()
            .find(|(version, _)| version.major() == current.major())
            .or_else(|| newer.first());

        Ok(best.map(|(_, record)| UpdateInfo {
            version: record.version.clone(),
            level: record.level.clone(),
            date_released: record.date_released,
            description: record.description.clone(),
            url: record.url.clone(),
        }))
    }

    /// The first applicable warning in strict priority order: yanked beats
    /// EOBS beats EOM. `None` when nothing applies or no record exists yet.
    pub fn priority_warning(&self, current: Option<&ReleaseRecord>) -> Option<VersionWarning> {
        let current = current?;
        let now = Utc::now();

        if current.yanked == Some(true) {
            return Some(VersionWarning {
                kind: WarningKind::Yanked,
                level: WarningLevel::Critical,
                message: format!(
                    "This version of {APP_NAME}, {}, has been yanked. We strongly recommend \
                     upgrading to a more recent supported version.",
                    current.version
                ),
                days_remaining: None,
                dismissed_until: None,
                can_dismiss: false,
            });
        }

        if !self.config.eobs_warning_opt_out {
            if let Some(warning) = support_warning(
                WarningKind::Eobs,
                current.end_of_basic_support,
                current.eobs_dismissed_until,
                self.config.eobs_warning_threshold_days,
                &current.version,
                now,
            ) {
                return Some(warning);
            }
        }

        if !self.config.eom_warning_opt_out {
            if let Some(warning) = support_warning(
                WarningKind::Eom,
                current.end_of_maintenance,
                current.eom_dismissed_until,
                self.config.eom_warning_threshold_days,
                &current.version,
                now,
            ) {
                return Some(warning);
            }
        }

        None
    }

    /// Dismiss an EOM/EOBS warning for the configured period. Returns the
    /// new `dismissed_until`, or `None` when the record does not exist or the
    /// kind cannot be dismissed. Last write wins on repeated calls.
    pub async fn dismiss(
        &self,
        kind: WarningKind,
        version: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let now = Utc::now();
        let (until, updated) = match kind {
            WarningKind::Yanked => return Ok(None),
            WarningKind::Eom => {
                let until = now + Duration::days(self.config.eom_dismissal_period_days);
                (
                    until,
                    self.store.set_eom_dismissed_until(version, until).await?,
                )
            }
            WarningKind::Eobs => {
                let until = now + Duration::days(self.config.eobs_dismissal_period_days);
                (
                    until,
                    self.store.set_eobs_dismissed_until(version, until).await?,
                )
            }
        };
        Ok(updated.then_some(until))
    }
}

fn support_warning(
    kind: WarningKind,
    target: Option<DateTime<Utc>>,
    dismissed_until: Option<DateTime<Utc>>,
    threshold_days: i64,
    version: &str,
    now: DateTime<Utc>,
) -> Option<VersionWarning> {
    let target = target?;
    let days_remaining = (target - now).num_days();
    if days_remaining > threshold_days {
        return None;
    }
    if let Some(until) = dismissed_until {
        if now <= until {
            return None;
        }
    }

    let phase = kind.phase();
    let (level, message) = if days_remaining <= 0 {
        (
            WarningLevel::Critical,
            format!("{APP_NAME} version {version} has reached its {phase}."),
        )
    } else {
        (
            WarningLevel::Warning,
            format!(
                "{APP_NAME} version {version} will reach its {phase} in {days_remaining} days."
            ),
        )
    };

    Some(VersionWarning {
        kind,
        level,
        message,
        days_remaining: Some(days_remaining),
        dismissed_until,
        can_dismiss: true,
    })
}
