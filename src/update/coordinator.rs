//! The periodic update-check loop and its cluster-wide lock protocol.
//!
//! Every scheduler replica runs one coordinator; the database row lock in
//! [`ReleaseStore::acquire_due_lock`] guarantees that at most one of them
//! performs a check per interval. The lock transaction stays open across the
//! manifest fetch and is released by the commit that publishes the cycle's
//! writes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::config::{FAILURE_RETRY_SECS, UpdateCheckConfig};
use crate::update::error::{CheckError, StoreError, VersionParseError};
use crate::update::fetcher::{ReleaseCandidate, UpdateFetcher, normalize};
use crate::update::store::{ReleaseRecord, ReleaseStore};
use crate::update::version::RuntimeVersion;

/// Outcome of a single check cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    Failure,
    NotDue,
    SuccessNoUpdate,
    SuccessUpdateAvail,
}

pub struct CheckCoordinator {
    store: Arc<ReleaseStore>,
    fetcher: Box<dyn UpdateFetcher>,
    config: UpdateCheckConfig,
    running: RuntimeVersion,
}

impl CheckCoordinator {
    pub fn new(
        store: Arc<ReleaseStore>,
        fetcher: Box<dyn UpdateFetcher>,
        config: UpdateCheckConfig,
        running: RuntimeVersion,
    ) -> Self {
        Self {
            store,
            fetcher,
            config,
            running,
        }
    }

    /// Run the check loop forever. Invoked exactly once per process by the
    /// lifecycle owner after storage has been confirmed present.
    pub async fn run(self) {
        if self.config.check_interval_secs == 0 {
            info!("update checks disabled");
            return;
        }

        if let Err(e) = self.hide_old_versions().await {
            error!("failed to hide superseded releases: {e}");
        }

        // Give the host scheduler time to finish booting first.
        let delay = rand::rng().random_range(5.0..20.0);
        debug!("waiting {delay:.0} seconds before doing first check");
        sleep(Duration::from_secs_f64(delay)).await;

        loop {
            let (result, wake_up_in) = match self.check_for_update().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("update check died with an exception, trying again in one hour: {e}");
                    (
                        UpdateResult::Failure,
                        Duration::from_secs(FAILURE_RETRY_SECS),
                    )
                }
            };

            if result == UpdateResult::SuccessUpdateAvail {
                info!("a new version of the runtime is available");
            }
            info!(
                "check finished, next check in {} seconds",
                wake_up_in.as_secs()
            );
            sleep(wake_up_in).await;
        }
    }

    /// One-time cleanup at process start: releases the running version
    /// supersedes have no business showing in the UI.
    async fn hide_old_versions(&self) -> Result<(), StoreError> {
        let hidden = self
            .store
            .hide_versions_not_newer_than(&self.running)
            .await?;
        if hidden > 0 {
            debug!("hid {hidden} release(s) at or below {}", self.running);
        }
        Ok(())
    }

    /// Perform one cycle if due. Returns the outcome and how long to sleep
    /// before the next attempt.
    pub async fn check_for_update(&self) -> Result<(UpdateResult, Duration), CheckError> {
        let interval = self.config.check_interval();

        let mut lease = match self.store.acquire_due_lock(interval).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                let state = self.store.get_singleton().await?;
                let wake_up_in = state
                    .last_checked
                    .map(|checked| {
                        checked + chrono::Duration::seconds(interval.as_secs() as i64) - Utc::now()
                    })
                    .and_then(|remaining| remaining.to_std().ok())
                    .unwrap_or(interval);
                debug!(
                    "next check not due for another {} seconds",
                    wake_up_in.as_secs()
                );
                return Ok((UpdateResult::NotDue, wake_up_in));
            }
            Err(StoreError::LockUnavailable) => {
                debug!("could not acquire lock, or check not due, sleeping for 60s +/- 10s");
                let wake_up_in = Duration::from_secs_f64(rand::rng().random_range(50.0..70.0));
                return Ok((UpdateResult::Failure, wake_up_in));
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            "checking for a new runtime release, previous check was performed at {:?}",
            lease.state().last_checked
        );
        lease.touch(Utc::now(), &host_identifier())?;

        let manifest = self.fetcher.fetch().await;
        let releases = self.releases_from(normalize(manifest))?;

        let mut result = UpdateResult::SuccessNoUpdate;
        for release in &releases {
            if lease.upsert_release(release)? {
                info!("found {} in update document", release.version);
                result = UpdateResult::SuccessUpdateAvail;
            } else {
                debug!("updating existing record for {}", release.version);
            }
        }

        lease.commit()?;
        Ok((result, interval))
    }

    /// Turn manifest candidates into the records worth storing: alpha/beta
    /// channels are dropped, the walk over the descending-sorted rest stops
    /// at the first release older than the running version, and the running
    /// version itself is recorded but hidden.
    fn releases_from(
        &self,
        candidates: Vec<ReleaseCandidate>,
    ) -> Result<Vec<ReleaseRecord>, CheckError> {
        let mut parsed = candidates
            .into_iter()
            .filter(|c| !matches!(c.channel.as_deref(), Some("alpha") | Some("beta")))
            .map(|c| Ok((RuntimeVersion::parse(&c.version)?, c)))
            .collect::<Result<Vec<_>, VersionParseError>>()?;

        parsed.sort_by(|(a, _), (b, _)| b.cmp(a));

        let mut records = Vec::new();
        for (version, candidate) in parsed {
            if version < self.running {
                debug!(
                    "got to a release ({version}) that is older than the running version ({}) -- \
                     stopping looking for more",
                    self.running
                );
                break;
            }
            records.push(ReleaseRecord {
                version: candidate.version,
                level: String::new(),
                date_released: candidate.release_date.unwrap_or_else(Utc::now),
                description: None,
                url: None,
                hidden_from_ui: version == self.running,
                end_of_maintenance: candidate.end_of_maintenance,
                end_of_basic_support: candidate.end_of_basic_support,
                eom_dismissed_until: None,
                eobs_dismissed_until: None,
                yanked: Some(candidate.yanked),
            });
        }
        Ok(records)
    }
}

/// `<hostname>-<pid>#<thread-id>`, recorded for the audit column.
fn host_identifier() -> String {
    format!(
        "{}-{}#{:?}",
        hostname(),
        std::process::id(),
        std::thread::current().id()
    )
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "unknown".into())
}
