//! Release manifest retrieval and normalization.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use tracing::warn;

use crate::config::UpdateCheckConfig;
use crate::update::version::RuntimeVersion;

/// Wire shape of the release feed: a mapping from version string to entry.
/// Only the current keyed-map, split EOM/EOBS shape is understood.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawManifest {
    #[serde(default, rename = "runtimeVersions")]
    pub versions: HashMap<String, ManifestEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManifestEntry {
    #[serde(default)]
    pub metadata: ManifestMetadata,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ManifestMetadata {
    pub channel: Option<String>,
    pub release_date: Option<String>,
    pub end_of_maintenance: Option<String>,
    pub end_of_basic_support: Option<String>,
    pub yanked: Option<bool>,
}

/// A manifest entry flattened into the fields the coordinator stores.
/// Fields absent in the feed stay `None`/`false`, never fabricated.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseCandidate {
    pub version: String,
    pub channel: Option<String>,
    pub release_date: Option<DateTime<Utc>>,
    pub end_of_maintenance: Option<DateTime<Utc>>,
    pub end_of_basic_support: Option<DateTime<Utc>>,
    pub yanked: bool,
}

pub fn normalize(manifest: RawManifest) -> Vec<ReleaseCandidate> {
    manifest
        .versions
        .into_iter()
        .map(|(version, entry)| {
            let metadata = entry.metadata;
            ReleaseCandidate {
                version,
                channel: metadata.channel,
                release_date: metadata.release_date.as_deref().and_then(parse_manifest_date),
                end_of_maintenance: metadata
                    .end_of_maintenance
                    .as_deref()
                    .and_then(parse_manifest_date),
                end_of_basic_support: metadata
                    .end_of_basic_support
                    .as_deref()
                    .and_then(parse_manifest_date),
                yanked: metadata.yanked.unwrap_or(false),
            }
        })
        .collect()
}

/// The feed carries both RFC 3339 timestamps and bare `YYYY-MM-DD` dates;
/// bare dates mean midnight UTC.
fn parse_manifest_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
        return Some(timestamp.with_timezone(&Utc));
    }
    if let Ok(date) = raw.parse::<NaiveDate>() {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }
    warn!("unparseable date in update document: {raw:?}");
    None
}

/// Retrieves the raw release manifest from the update endpoint.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait UpdateFetcher: Send + Sync {
    /// A failed fetch is not an error, it is an empty manifest; the cycle
    /// proceeds as "no releases reported".
    async fn fetch(&self) -> RawManifest;
}

pub struct HttpUpdateFetcher {
    client: reqwest::Client,
    update_url: String,
    site: String,
}

impl HttpUpdateFetcher {
    pub fn new(config: &UpdateCheckConfig, running: &RuntimeVersion) -> Self {
        let user_agent = format!(
            "runtime/{running} {}",
            environment_facts(config.executor.as_deref())
        );
        Self {
            client: reqwest::Client::builder()
                .user_agent(user_agent)
                .timeout(config.fetch_timeout())
                .build()
                .expect("Failed to create HTTP client"),
            update_url: config.update_url.clone(),
            site: config.site.clone(),
        }
    }
}

#[async_trait::async_trait]
impl UpdateFetcher for HttpUpdateFetcher {
    async fn fetch(&self) -> RawManifest {
        let response = match self
            .client
            .get(&self.update_url)
            .query(&[("site", self.site.as_str())])
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(response) => response,
            Err(e) => {
                warn!("error fetching update document: {e}");
                return RawManifest::default();
            }
        };

        match response.json::<RawManifest>().await {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("malformed update document: {e}");
                RawManifest::default()
            }
        }
    }
}

/// Anonymized environment facts embedded in the user-agent: coarse platform
/// data only, never hostnames, paths or user identifiers.
fn environment_facts(executor: Option<&str>) -> String {
    let mut data = serde_json::json!({
        "cpu": std::env::consts::ARCH,
        "os": {
            "family": std::env::consts::FAMILY,
            "name": std::env::consts::OS,
        },
        "ci": is_ci(),
    });
    if let Some(version) = os_version() {
        data["os"]["version"] = version.into();
    }
    if let Some(executor) = executor {
        data["executor"] = executor.into();
    }
    data.to_string()
}

fn is_ci() -> bool {
    ["BUILD_BUILDID", "BUILD_ID", "CI"]
        .iter()
        .any(|name| std::env::var_os(name).is_some())
}

/// Best-effort OS version: VERSION_ID from os-release where present.
fn os_version() -> Option<String> {
    let contents = std::fs::read_to_string("/etc/os-release").ok()?;
    contents.lines().find_map(|line| {
        line.strip_prefix("VERSION_ID=")
            .map(|v| v.trim_matches('"').to_string())
    })
}

/// Synthetic single-entry manifest advertising the running version, used by
/// the `fake_check` escape hatch to exercise the pipeline without network.
pub fn fake_manifest(running: &RuntimeVersion) -> RawManifest {
    let version = format!(
        "{}.{}-{}",
        running.major(),
        running.minor(),
        running.patch()
    );
    let metadata = ManifestMetadata {
        channel: Some("deprecated".to_string()),
        release_date: Some("2021-07-20".to_string()),
        end_of_maintenance: Some("2022-02-28".to_string()),
        end_of_basic_support: None,
        yanked: Some(false),
    };
    RawManifest {
        versions: HashMap::from([(version, ManifestEntry { metadata })]),
    }
}

pub struct FakeUpdateFetcher {
    running: RuntimeVersion,
}

impl FakeUpdateFetcher {
    pub fn new(running: RuntimeVersion) -> Self {
        Self { running }
    }
}

#[async_trait::async_trait]
impl UpdateFetcher for FakeUpdateFetcher {
    async fn fetch(&self) -> RawManifest {
        fake_manifest(&self.running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use rstest::rstest;

    fn entry(channel: Option<&str>, release_date: Option<&str>) -> ManifestEntry {
        ManifestEntry {
            metadata: ManifestMetadata {
                channel: channel.map(str::to_string),
                release_date: release_date.map(str::to_string),
                ..ManifestMetadata::default()
            },
        }
    }

    #[test]
    fn normalize_flattens_the_version_map() {
        let manifest = RawManifest {
            versions: HashMap::from([
                ("3.0-1".to_string(), entry(Some("deprecated"), Some("2021-07-20"))),
                ("3.0-2".to_string(), entry(None, None)),
            ]),
        };

        let mut candidates = normalize(manifest);
        candidates.sort_by(|a, b| a.version.cmp(&b.version));

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].version, "3.0-1");
        assert_eq!(candidates[0].channel.as_deref(), Some("deprecated"));
        assert!(candidates[0].release_date.is_some());
        assert!(!candidates[0].yanked);

        // Absent fields stay absent.
        assert_eq!(candidates[1].channel, None);
        assert_eq!(candidates[1].release_date, None);
        assert_eq!(candidates[1].end_of_maintenance, None);
    }

    #[rstest]
    #[case("2021-07-20", true)]
    #[case("2022-02-28T12:30:00Z", true)]
    #[case("2022-02-28T12:30:00+02:00", true)]
    #[case("next tuesday", false)]
    #[case("", false)]
    fn parse_manifest_date_accepts_both_shapes(#[case] raw: &str, #[case] ok: bool) {
        assert_eq!(parse_manifest_date(raw).is_some(), ok);
    }

    #[test]
    fn parse_manifest_date_reads_bare_dates_as_midnight_utc() {
        let parsed = parse_manifest_date("2021-07-20").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2021-07-20T00:00:00+00:00");
    }

    #[test]
    fn environment_facts_is_json_without_identifying_data() {
        let blob = environment_facts(Some("LocalExecutor"));
        let value: serde_json::Value = serde_json::from_str(&blob).unwrap();

        assert_eq!(value["executor"], "LocalExecutor");
        assert!(value["os"]["name"].is_string());
        assert!(value["cpu"].is_string());
        assert!(value.get("hostname").is_none());
        assert!(value.get("user").is_none());
    }

    #[test]
    fn fake_manifest_advertises_the_running_version() {
        let running = RuntimeVersion::parse("3.0-1-nightly20241216").unwrap();
        let manifest = fake_manifest(&running);
        assert!(manifest.versions.contains_key("3.0-1"));
    }

    #[tokio::test]
    async fn fetch_returns_manifest_with_site_and_user_agent() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/runtime")
            .match_query(Matcher::UrlEncoded("site".into(), "/".into()))
            .match_header("user-agent", Matcher::Regex(r"^runtime/3\.0-1 \{".to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "runtimeVersions": {
                        "3.0-2": {
                            "metadata": {
                                "channel": "deprecated",
                                "releaseDate": "2021-08-20",
                                "endOfMaintenance": "2022-02-28",
                                "endOfBasicSupport": "2022-08-28",
                                "yanked": false
                            }
                        }
                    }
                }"#,
            )
            .create_async()
            .await;

        let config = UpdateCheckConfig {
            update_url: format!("{}/runtime", server.url()),
            ..UpdateCheckConfig::default()
        };
        let running = RuntimeVersion::parse("3.0-1").unwrap();
        let fetcher = HttpUpdateFetcher::new(&config, &running);

        let manifest = fetcher.fetch().await;

        mock.assert_async().await;
        let entry = &manifest.versions["3.0-2"];
        assert_eq!(entry.metadata.channel.as_deref(), Some("deprecated"));
        assert_eq!(entry.metadata.yanked, Some(false));
    }

    #[tokio::test]
    async fn fetch_degrades_to_empty_manifest_on_http_error() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/runtime")
            .match_query(Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let config = UpdateCheckConfig {
            update_url: format!("{}/runtime", server.url()),
            ..UpdateCheckConfig::default()
        };
        let running = RuntimeVersion::parse("3.0-1").unwrap();
        let fetcher = HttpUpdateFetcher::new(&config, &running);

        let manifest = fetcher.fetch().await;

        mock.assert_async().await;
        assert!(manifest.versions.is_empty());
    }

    #[tokio::test]
    async fn fetch_degrades_to_empty_manifest_on_malformed_body() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/runtime")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("not json at all")
            .create_async()
            .await;

        let config = UpdateCheckConfig {
            update_url: format!("{}/runtime", server.url()),
            ..UpdateCheckConfig::default()
        };
        let running = RuntimeVersion::parse("3.0-1").unwrap();
        let fetcher = HttpUpdateFetcher::new(&config, &running);

        let manifest = fetcher.fetch().await;

        mock.assert_async().await;
        assert!(manifest.versions.is_empty());
    }
}
