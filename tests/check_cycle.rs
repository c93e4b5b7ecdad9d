//! End-to-end check cycles against a mock release feed.

use std::sync::Arc;
use std::time::Duration;

use mockito::Matcher;
use tempfile::TempDir;
use update_check::config::UpdateCheckConfig;
use update_check::update::coordinator::{CheckCoordinator, UpdateResult};
use update_check::update::fetcher::HttpUpdateFetcher;
use update_check::update::status::get_status;
use update_check::update::store::ReleaseStore;
use update_check::update::version::RuntimeVersion;
use update_check::update::warning::WarningEngine;

async fn store_at(dir: &TempDir) -> Arc<ReleaseStore> {
    let store = Arc::new(ReleaseStore::open(&dir.path().join("releases.db")).unwrap());
    store.create_schema().await.unwrap();
    store.ensure_singleton().await.unwrap();
    store
}

#[tokio::test]
async fn full_cycle_records_releases_and_surfaces_the_update() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/runtime")
        .match_query(Matcher::UrlEncoded("site".into(), "/".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{
                "runtimeVersions": {
                    "3.0-1": {
                        "metadata": {
                            "channel": "deprecated",
                            "releaseDate": "2021-07-20",
                            "endOfMaintenance": "2022-02-28"
                        }
                    },
                    "3.0-2": {
                        "metadata": {
                            "channel": "deprecated",
                            "releaseDate": "2021-08-20"
                        }
                    },
                    "4.0-1-nightly20241216": {
                        "metadata": {
                            "channel": "alpha",
                            "releaseDate": "2024-12-16"
                        }
                    }
                }
            }"#,
        )
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let store = store_at(&dir).await;

    let config = UpdateCheckConfig {
        update_url: format!("{}/runtime", server.url()),
        ..UpdateCheckConfig::default()
    };
    let interval = config.check_interval();
    let running = RuntimeVersion::parse("3.0-1").unwrap();
    let fetcher = Box::new(HttpUpdateFetcher::new(&config, &running));
    let coordinator = CheckCoordinator::new(
        Arc::clone(&store),
        fetcher,
        config.clone(),
        running.clone(),
    );

    let (result, wake_up_in) = coordinator.check_for_update().await.unwrap();
    mock.assert_async().await;
    assert_eq!(result, UpdateResult::SuccessUpdateAvail);
    assert_eq!(wake_up_in, interval);

    // The running release was recorded but hidden; the alpha build was not
    // recorded at all.
    let current = store.find_release("3.0-1").await.unwrap().unwrap();
    assert!(current.hidden_from_ui);
    assert!(
        store
            .find_release("4.0-1-nightly20241216")
            .await
            .unwrap()
            .is_none()
    );

    let engine = WarningEngine::new(Arc::clone(&store), config);
    let update = engine.available_update(&running).await.unwrap().unwrap();
    assert_eq!(update.version, "3.0-2");

    // No warning: the stored EOM date for 3.0-1 is long past... which makes
    // it critical, so check the status shape instead of its absence.
    let status = get_status(&engine, Some("3.0-1")).await.unwrap();
    assert_eq!(status.status.current_version.as_deref(), Some("3.0-1"));

    // A second cycle straight away is not due.
    let (result, wake_up_in) = coordinator.check_for_update().await.unwrap();
    assert_eq!(result, UpdateResult::NotDue);
    assert!(wake_up_in <= interval);
}

#[tokio::test]
async fn transport_failure_degrades_to_an_empty_cycle() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/runtime")
        .match_query(Matcher::Any)
        .with_status(502)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let store = store_at(&dir).await;

    let config = UpdateCheckConfig {
        update_url: format!("{}/runtime", server.url()),
        ..UpdateCheckConfig::default()
    };
    let running = RuntimeVersion::parse("3.0-1").unwrap();
    let fetcher = Box::new(HttpUpdateFetcher::new(&config, &running));
    let coordinator = CheckCoordinator::new(Arc::clone(&store), fetcher, config, running);

    let (result, _) = coordinator.check_for_update().await.unwrap();
    mock.assert_async().await;
    assert_eq!(result, UpdateResult::SuccessNoUpdate);

    // The cycle committed its bookkeeping even though the fetch failed.
    assert!(store.get_singleton().await.unwrap().last_checked.is_some());
    assert!(store.list_visible_releases().await.unwrap().is_empty());
}
