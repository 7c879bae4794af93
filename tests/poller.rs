//! Settings poller integration tests against a loopback endpoint

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;

use hark::poller::ConfigPoller;
use hark::{Error, ListenerConfig, Settings, SharedSettings};

mod common;

use common::{SettingsServer, eventually};

fn poller(server: &SettingsServer, settings: &SharedSettings) -> ConfigPoller {
    ConfigPoller::new(
        server.url.clone(),
        Duration::from_millis(50),
        Duration::from_millis(500),
        Arc::clone(settings),
    )
    .unwrap()
}

fn shared(config: ListenerConfig) -> SharedSettings {
    Arc::new(Settings::new(config))
}

#[tokio::test]
async fn test_poll_applies_all_keys() {
    let server = SettingsServer::start(json!({
        "wakeword_enabled": false,
        "wakeword_keyword": "  OK   Computer ",
        "wakeword_sensitivity": 0.8,
        "wakeword_device_index": 3,
        "wakeword_cooldown_ms": 500,
        "unrelated": "ignored"
    }))
    .await;
    let settings = shared(ListenerConfig::default());
    let poller = poller(&server, &settings);

    assert!(poller.poll_once().await);

    let snapshot = settings.snapshot();
    assert!(!snapshot.enabled);
    assert_eq!(snapshot.keyword, "ok computer");
    assert!((snapshot.sensitivity - 0.8).abs() < f32::EPSILON);
    assert_eq!(snapshot.device_index, Some(3));
    assert_eq!(snapshot.cooldown_ms, 500);
    assert_eq!(poller.stats().successes(), 1);
}

#[tokio::test]
async fn test_unchanged_response_is_not_a_change() {
    let server = SettingsServer::start(json!({ "wakeword_keyword": "hey steve" })).await;
    let settings = shared(ListenerConfig::default());
    let poller = poller(&server, &settings);

    assert!(poller.poll_once().await);
    let revision = settings.revision();

    assert!(!poller.poll_once().await);
    assert_eq!(settings.revision(), revision);
}

#[tokio::test]
async fn test_malformed_json_keeps_last_config() {
    let server = SettingsServer::start(json!({ "wakeword_keyword": "hey steve" })).await;
    let settings = shared(ListenerConfig::default());
    let poller = poller(&server, &settings);
    assert!(poller.poll_once().await);

    server.set_raw(200, "{\"wakeword_keyword\": ");
    for expected in 1..=3 {
        assert!(!poller.poll_once().await);
        assert_eq!(poller.stats().failures(), expected);
    }

    assert_eq!(settings.snapshot().keyword, "hey steve");
    assert!(matches!(poller.fetch().await, Err(Error::ConfigFetch(_))));
}

#[tokio::test]
async fn test_non_object_body_is_a_failure() {
    let server = SettingsServer::start(json!(["wakeword_enabled", false])).await;
    let settings = shared(ListenerConfig::default());
    let poller = poller(&server, &settings);

    assert!(!poller.poll_once().await);
    assert_eq!(poller.stats().failures(), 1);
    assert!(settings.snapshot().enabled);
}

#[tokio::test]
async fn test_error_status_is_a_failure() {
    let server = SettingsServer::start(json!({})).await;
    server.set_raw(503, "{\"wakeword_enabled\": false}");
    let settings = shared(ListenerConfig::default());
    let poller = poller(&server, &settings);

    assert!(!poller.poll_once().await);
    assert_eq!(poller.stats().failures(), 1);
    assert_eq!(poller.stats().successes(), 0);
    assert!(settings.snapshot().enabled);
}

#[tokio::test]
async fn test_wrong_typed_keys_are_skipped_individually() {
    let server = SettingsServer::start(json!({
        "wakeword_enabled": "no",
        "wakeword_keyword": 42,
        "wakeword_sensitivity": "high",
        "wakeword_device_index": 1.5,
        "wakeword_cooldown_ms": 750
    }))
    .await;
    let settings = shared(ListenerConfig::default());
    let poller = poller(&server, &settings);

    assert!(poller.poll_once().await);

    let snapshot = settings.snapshot();
    let defaults = ListenerConfig::default();
    assert_eq!(snapshot.enabled, defaults.enabled);
    assert_eq!(snapshot.keyword, defaults.keyword);
    assert!((snapshot.sensitivity - defaults.sensitivity).abs() < f32::EPSILON);
    assert_eq!(snapshot.device_index, defaults.device_index);
    assert_eq!(snapshot.cooldown_ms, 750);
}

#[tokio::test]
async fn test_out_of_range_sensitivity_is_clamped() {
    let server = SettingsServer::start(json!({ "wakeword_sensitivity": 7.5 })).await;
    let settings = shared(ListenerConfig::default());
    let poller = poller(&server, &settings);

    poller.poll_once().await;
    assert!((settings.snapshot().sensitivity - 1.0).abs() < f32::EPSILON);

    server.set_json(json!({ "wakeword_sensitivity": -2 }));
    poller.poll_once().await;
    assert!(settings.snapshot().sensitivity.abs() < f32::EPSILON);
}

#[tokio::test]
async fn test_null_or_negative_device_selects_default() {
    let server = SettingsServer::start(json!({ "wakeword_device_index": null })).await;
    let settings = shared(ListenerConfig {
        device_index: Some(4),
        ..ListenerConfig::default()
    });
    let poller = poller(&server, &settings);

    poller.poll_once().await;
    assert_eq!(settings.snapshot().device_index, None);

    server.set_json(json!({ "wakeword_device_index": 2 }));
    poller.poll_once().await;
    assert_eq!(settings.snapshot().device_index, Some(2));

    server.set_json(json!({ "wakeword_device_index": -1 }));
    poller.poll_once().await;
    assert_eq!(settings.snapshot().device_index, None);
}

#[tokio::test]
async fn test_run_polls_until_shutdown() {
    let server = SettingsServer::start(json!({ "wakeword_keyword": "hey steve" })).await;
    let settings = shared(ListenerConfig::default());
    let poller = poller(&server, &settings);
    let stats = poller.stats();

    let (stop, stop_rx) = watch::channel(false);
    let task = tokio::spawn(poller.run(stop_rx));

    assert!(eventually(Duration::from_secs(5), || stats.successes() >= 3).await);
    assert_eq!(settings.snapshot().keyword, "hey steve");

    stop.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("poller did not stop")
        .unwrap();

    let hits = server.hits();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.hits(), hits);
}
