//! The operator-facing status surface.
//!
//! Plain functions and serializable results; mapping them onto transport is
//! the host's concern. "No data yet" is an empty response, never an error.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::update::error::StoreError;
use crate::update::warning::{VersionWarning, WarningEngine, WarningKind};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionStatus {
    pub current_version: Option<String>,
    pub warning: Option<VersionWarning>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusResponse {
    pub status: VersionStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DismissResponse {
    pub success: bool,
    pub dismissed_until: Option<DateTime<Utc>>,
    pub message: String,
}

/// Current version plus any active warning.
pub async fn get_status(
    engine: &WarningEngine,
    runtime_version: Option<&str>,
) -> Result<StatusResponse, StoreError> {
    let Some(version) = runtime_version else {
        return Ok(StatusResponse {
            status: VersionStatus {
                current_version: None,
                warning: None,
            },
        });
    };

    let record = engine.current_record(version).await?;
    let warning = engine.priority_warning(record.as_ref());

    Ok(StatusResponse {
        status: VersionStatus {
            current_version: Some(version.to_string()),
            warning,
        },
    })
}

/// Dismiss the EOM or EOBS warning for the running version.
pub async fn dismiss_warning(
    engine: &WarningEngine,
    kind: WarningKind,
    runtime_version: Option<&str>,
) -> Result<DismissResponse, StoreError> {
    let Some(version) = runtime_version else {
        return Ok(DismissResponse {
            success: false,
            dismissed_until: None,
            message: "No runtime version found.".to_string(),
        });
    };

    if kind == WarningKind::Yanked {
        return Ok(DismissResponse {
            success: false,
            dismissed_until: None,
            message: "Yanked warnings cannot be dismissed.".to_string(),
        });
    }

    match engine.dismiss(kind, version).await? {
        Some(until) => Ok(DismissResponse {
            success: true,
            dismissed_until: Some(until),
            message: format!(
                "{} warning dismissed until {}.",
                kind.label(),
                until.format("%Y-%m-%d")
            ),
        }),
        None => Ok(DismissResponse {
            success: false,
            dismissed_until: None,
            message: format!("Version {version} not found in database."),
        }),
    }
}
