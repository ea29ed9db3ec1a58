use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::Client;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::{
    DeliveryOutcome, DeliveryTarget, Dispatcher, Envelope, RELAY_USER_AGENT, Registry,
    WebhookDefinition, WebhookRequest, deliver,
};
use crate::broker::message::{InboundMessage, QoS};
use crate::config::WebhookSettings;
use crate::persistence::{SqliteStore, Store};
use crate::stats::RelayStats;
use crate::utils::RelayError;

fn request(url: &str, filter: &str) -> WebhookRequest {
    WebhookRequest {
        url: Some(url.to_string()),
        topic_filter: Some(filter.to_string()),
        ..Default::default()
    }
}

fn registry() -> Registry {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
    Registry::new(store)
}

fn message(topic: &str, payload: &[u8]) -> InboundMessage {
    InboundMessage {
        broker: "local".to_string(),
        topic: topic.to_string(),
        payload: payload.to_vec(),
        qos: QoS::AtLeastOnce,
        retained: false,
        received_at: Utc::now(),
    }
}

fn target(url: String, retry_count: u32, retry_delay: Duration) -> DeliveryTarget {
    let mut webhook = WebhookDefinition::create(request(&url, "#")).unwrap();
    webhook.retry_count = retry_count;
    let mut target = DeliveryTarget::from_definition(&webhook).unwrap();
    target.retry_delay = retry_delay;
    target
}

async fn wait_for_requests(server: &MockServer, count: usize) -> bool {
    for _ in 0..300 {
        let received = server.received_requests().await.unwrap_or_default();
        if received.len() >= count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[test]
fn test_create_applies_defaults() {
    let webhook =
        WebhookDefinition::create(request("http://example.com/hook", "sensors/#")).unwrap();
    assert_eq!(webhook.method, "POST");
    assert!(webhook.enabled);
    assert_eq!(webhook.timeout, 10);
    assert_eq!(webhook.retry_count, 3);
    assert_eq!(webhook.retry_delay, 5);
    assert_eq!(webhook.created_at, webhook.updated_at);
    assert!(!webhook.id.is_empty());
}

#[test]
fn test_create_requires_url_and_filter() {
    let missing_url = WebhookRequest {
        topic_filter: Some("a".into()),
        ..Default::default()
    };
    assert!(matches!(
        WebhookDefinition::create(missing_url),
        Err(RelayError::Validation(_))
    ));

    let missing_filter = WebhookRequest {
        url: Some("http://example.com".into()),
        ..Default::default()
    };
    assert!(matches!(
        WebhookDefinition::create(missing_filter),
        Err(RelayError::Validation(_))
    ));
}

#[test]
fn test_create_rejects_bad_input() {
    let cases = [
        request("not a url", "a"),
        request("ftp://example.com/x", "a"),
        request("http://example.com", "a/#/b"),
        request("http://example.com", "a/b+"),
        WebhookRequest {
            timeout: Some(0),
            ..request("http://example.com", "a")
        },
        WebhookRequest {
            retry_delay: Some(-1),
            ..request("http://example.com", "a")
        },
        WebhookRequest {
            retry_count: Some(-1),
            ..request("http://example.com", "a")
        },
        WebhookRequest {
            method: Some("BAD METHOD".into()),
            ..request("http://example.com", "a")
        },
    ];
    for case in cases {
        let result = WebhookDefinition::create(case.clone());
        assert!(
            matches!(result, Err(RelayError::Validation(_))),
            "accepted {case:?}"
        );
    }
}

#[test]
fn test_method_is_uppercased_and_zero_retries_allowed() {
    let webhook = WebhookDefinition::create(WebhookRequest {
        method: Some("put".into()),
        retry_count: Some(0),
        ..request("https://example.com/hook", "a/+")
    })
    .unwrap();
    assert_eq!(webhook.method, "PUT");
    assert_eq!(webhook.retry_count, 0);
}

#[test]
fn test_update_overlays_present_fields() {
    let webhook = WebhookDefinition::create(WebhookRequest {
        name: Some("first".into()),
        ..request("http://example.com/a", "a/#")
    })
    .unwrap();

    let updated = webhook
        .updated(WebhookRequest {
            enabled: Some(false),
            retry_count: Some(1),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(updated.id, webhook.id);
    assert_eq!(updated.name, "first");
    assert_eq!(updated.url, webhook.url);
    assert!(!updated.enabled);
    assert_eq!(updated.retry_count, 1);
    assert_eq!(updated.created_at, webhook.created_at);
    assert!(updated.updated_at >= webhook.updated_at);
}

#[test]
fn test_update_rejects_invalid_result() {
    let webhook = WebhookDefinition::create(request("http://example.com/a", "a")).unwrap();
    let result = webhook.updated(WebhookRequest {
        url: Some("".into()),
        ..Default::default()
    });
    assert!(matches!(result, Err(RelayError::Validation(_))));
}

#[test]
fn test_envelope_parses_json_or_falls_back_to_text() {
    let json_msg = message("a", br#"{"t":21.5}"#);
    let envelope = Envelope::from_message(&json_msg);
    assert_eq!(envelope.payload, json!({"t": 21.5}));
    assert_eq!(envelope.broker, "local");

    let text = Envelope::from_message(&message("a", b"plain text"));
    assert_eq!(text.payload, Value::String("plain text".into()));

    let encoded = serde_json::to_value(&text).unwrap();
    assert_eq!(encoded["qos"], json!(1));
    assert_eq!(encoded["topic"], json!("a"));
}

#[test]
fn test_reserved_headers_cannot_be_overridden() {
    let mut headers = HashMap::new();
    headers.insert("Content-Type".to_string(), "text/plain".to_string());
    headers.insert("user-agent".to_string(), "other".to_string());
    headers.insert("X-Token".to_string(), "secret".to_string());
    let webhook = WebhookDefinition::create(WebhookRequest {
        headers: Some(headers),
        ..request("http://example.com", "a")
    })
    .unwrap();

    let target = DeliveryTarget::from_definition(&webhook).unwrap();
    assert_eq!(target.headers["content-type"], "application/json");
    assert_eq!(target.headers["user-agent"], RELAY_USER_AGENT);
    assert_eq!(target.headers["x-token"], "secret");
}

#[test]
fn test_global_target_only_when_enabled() {
    let disabled = WebhookSettings::default();
    assert!(DeliveryTarget::global(&disabled).unwrap().is_none());

    let enabled = WebhookSettings {
        enabled: true,
        url: "http://example.com/all".into(),
        method: "put".into(),
        ..WebhookSettings::default()
    };
    let target = DeliveryTarget::global(&enabled).unwrap().unwrap();
    assert_eq!(target.method, reqwest::Method::PUT);
    assert_eq!(target.retry_count, 3);
    assert_eq!(target.retry_delay, Duration::from_secs(5));
}

#[tokio::test]
async fn test_registry_crud_and_matching() {
    let registry = registry();

    let sensors = registry
        .create(request("http://example.com/s", "sensors/+/temp"))
        .await
        .unwrap();
    let all = registry
        .create(request("http://example.com/all", "#"))
        .await
        .unwrap();
    let disabled = registry
        .create(WebhookRequest {
            enabled: Some(false),
            ..request("http://example.com/off", "sensors/#")
        })
        .await
        .unwrap();

    let mut ids: Vec<String> = registry
        .get_matching("sensors/kitchen/temp")
        .await
        .unwrap()
        .into_iter()
        .map(|w| w.id)
        .collect();
    ids.sort();
    let mut expected = vec![sensors.id.clone(), all.id.clone()];
    expected.sort();
    assert_eq!(ids, expected);

    let only_all = registry.get_matching("lights/on").await.unwrap();
    assert_eq!(only_all.len(), 1);
    assert_eq!(only_all[0].id, all.id);

    registry
        .update(
            &disabled.id,
            WebhookRequest {
                enabled: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(registry.get_matching("sensors/x").await.unwrap().len(), 2);

    registry.delete(&sensors.id).await.unwrap();
    assert!(registry.get(&sensors.id).await.unwrap_err().is_not_found());
    assert!(registry.delete(&sensors.id).await.unwrap_err().is_not_found());
    assert_eq!(registry.list(0).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_multi_level_filter_matches_deeper_topic_only() {
    let registry = registry();
    let deep = registry
        .create(request("http://example.com/deep", "a/#"))
        .await
        .unwrap();
    registry
        .create(request("http://example.com/exact", "a/b"))
        .await
        .unwrap();

    let matching = registry.get_matching("a/b/c").await.unwrap();
    assert_eq!(matching.len(), 1);
    assert_eq!(matching[0].id, deep.id);
}

#[tokio::test]
async fn test_registry_rejects_invalid_without_persisting() {
    let registry = registry();
    let err = registry
        .create(request("http://example.com", "a/#/b"))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Validation(_)));
    assert!(registry.list(0).await.unwrap().is_empty());

    let missing = registry
        .update("nope", WebhookRequest::default())
        .await
        .unwrap_err();
    assert!(missing.is_not_found());
}

#[tokio::test]
async fn test_deliver_retries_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let webhook = WebhookDefinition::create(WebhookRequest {
        retry_count: Some(3),
        retry_delay: Some(1),
        ..request(&format!("{}/hook", server.uri()), "#")
    })
    .unwrap();
    let target = DeliveryTarget::from_definition(&webhook).unwrap();

    let started = Instant::now();
    let outcome = deliver(
        &Client::new(),
        &target,
        br#"{"topic":"a"}"#,
        &CancellationToken::new(),
    )
    .await;

    assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 3 });
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(2800), "{elapsed:?}");
    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 3);
    assert_eq!(received[0].headers["content-type"], "application/json");
    assert_eq!(received[0].headers["user-agent"], RELAY_USER_AGENT);
    assert_eq!(received[2].body, br#"{"topic":"a"}"#.to_vec());
}

#[tokio::test]
async fn test_deliver_gives_up_after_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let target = target(server.uri(), 2, Duration::from_millis(20));
    let outcome = deliver(&Client::new(), &target, b"{}", &CancellationToken::new()).await;

    match outcome {
        DeliveryOutcome::Failed {
            attempts,
            last_error,
        } => {
            assert_eq!(attempts, 3);
            assert!(last_error.contains("503"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_deliver_without_retries_makes_one_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let target = target(server.uri(), 0, Duration::from_secs(5));
    let outcome = deliver(&Client::new(), &target, b"{}", &CancellationToken::new()).await;
    assert!(matches!(outcome, DeliveryOutcome::Failed { attempts: 1, .. }));
}

#[tokio::test]
async fn test_cancel_interrupts_retry_wait() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let target = target(server.uri(), 3, Duration::from_secs(30));
    let cancel = CancellationToken::new();
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { deliver(&Client::new(), &target, b"{}", &cancel).await })
    };

    assert!(wait_for_requests(&server, 1).await);
    cancel.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, DeliveryOutcome::Cancelled { attempts: 1 });
}

#[tokio::test]
async fn test_dispatcher_fans_out_to_matching_and_global() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let registry = registry();
    registry
        .create(request(&format!("{}/sensors", server.uri()), "sensors/#"))
        .await
        .unwrap();
    registry
        .create(request(&format!("{}/lights", server.uri()), "lights/#"))
        .await
        .unwrap();

    let global = DeliveryTarget::global(&WebhookSettings {
        enabled: true,
        url: format!("{}/global", server.uri()),
        ..WebhookSettings::default()
    })
    .unwrap();
    let stats = Arc::new(RelayStats::new());
    let dispatcher = Dispatcher::start(registry, global, stats.clone()).unwrap();

    let handler = dispatcher.handler();
    handler(message("sensors/kitchen/temp", br#"{"t":20}"#));

    assert!(wait_for_requests(&server, 2).await);
    assert!(dispatcher.shutdown(Some(Duration::from_secs(5))).await);

    let received = server.received_requests().await.unwrap();
    let mut paths: Vec<String> = received.iter().map(|r| r.url.path().to_string()).collect();
    paths.sort();
    assert_eq!(paths, vec!["/global", "/sensors"]);

    let body: Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(body["topic"], json!("sensors/kitchen/temp"));
    assert_eq!(body["payload"], json!({"t": 20}));
    assert_eq!(body["broker"], json!("local"));

    assert_eq!(stats.snapshot().webhook_deliveries, 2);
    assert!(!dispatcher.dispatch(message("sensors/x", b"late")));
}

#[tokio::test]
async fn test_dispatcher_records_failed_delivery() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let registry = registry();
    registry
        .create(WebhookRequest {
            retry_count: Some(0),
            ..request(&server.uri(), "alerts/#")
        })
        .await
        .unwrap();
    let stats = Arc::new(RelayStats::new());
    let dispatcher = Dispatcher::start(registry, None, stats.clone()).unwrap();

    assert!(dispatcher.dispatch(message("alerts/fire", b"!")));
    assert!(wait_for_requests(&server, 1).await);
    for _ in 0..200 {
        if stats.snapshot().webhook_failures == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(stats.snapshot().webhook_failures, 1);
    assert!(dispatcher.shutdown(None).await);
}

#[tokio::test]
async fn test_shutdown_cancels_pending_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let registry = registry();
    registry
        .create(WebhookRequest {
            retry_delay: Some(60),
            ..request(&server.uri(), "#")
        })
        .await
        .unwrap();
    let stats = Arc::new(RelayStats::new());
    let dispatcher = Dispatcher::start(registry, None, stats.clone()).unwrap();

    dispatcher.dispatch(message("a/b", b"x"));
    assert!(wait_for_requests(&server, 1).await);

    let started = Instant::now();
    assert!(dispatcher.shutdown(Some(Duration::from_secs(5))).await);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    assert_eq!(stats.snapshot().webhook_failures, 0);
}
