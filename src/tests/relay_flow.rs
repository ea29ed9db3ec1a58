use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::broker::{OverallStatus, QoS, Supervisor};
use crate::config::{BrokerEndpoint, Settings};
use crate::persistence::{SledStore, SqliteStore, Store};
use crate::stats::RelayStats;
use crate::transport::mock::MockFactory;
use crate::webhook::{DeliveryTarget, Dispatcher, Registry, WebhookRequest};

fn relay(store: Arc<dyn Store>) -> (Supervisor, Arc<MockFactory>, Arc<RelayStats>) {
    relay_with(&Settings::default(), store)
}

fn relay_with(
    settings: &Settings,
    store: Arc<dyn Store>,
) -> (Supervisor, Arc<MockFactory>, Arc<RelayStats>) {
    let factory = Arc::new(MockFactory::default());
    let stats = Arc::new(RelayStats::new());
    let supervisor = Supervisor::new(
        settings,
        factory.clone(),
        Some(store),
        stats.clone(),
    );
    (supervisor, factory, stats)
}

async fn wait_until<F, Fut>(check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn publish_confirm_purge(store: Arc<dyn Store>) {
    let mut settings = Settings::default();
    settings.brokers.insert("x".to_string(), BrokerEndpoint::new("x"));
    let (supervisor, factory, stats) = relay_with(&settings, store.clone());

    supervisor
        .publish("x", "t", QoS::AtLeastOnce, false, json!({"v": 1}))
        .await
        .unwrap();

    assert_eq!(factory.builds.load(Ordering::SeqCst), 1);
    assert_eq!(supervisor.sessions().await.len(), 1);
    let sent = factory.transport("x").published.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].payload, br#"{"v":1}"#.to_vec());

    let recorded = {
        let store = store.clone();
        move || {
            let store = store.clone();
            async move { store.list(false, 0).await.unwrap().len() == 1 }
        }
    };
    assert!(wait_until(recorded).await);

    let pending = store.list(false, 0).await.unwrap();
    let record = &pending[0];
    assert_eq!(record.topic, "t");
    assert_eq!(record.qos, QoS::AtLeastOnce);
    assert!(!record.confirmed);

    store.confirm(&record.id).await.unwrap();
    assert!(store.list(false, 0).await.unwrap().is_empty());
    assert_eq!(store.list(true, 0).await.unwrap().len(), 1);

    assert_eq!(store.purge_confirmed().await.unwrap(), 1);
    assert!(store.get(&record.id).await.unwrap_err().is_not_found());
    assert_eq!(stats.snapshot().messages_published, 1);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_publish_is_recorded_confirmed_and_purged_sqlite() {
    publish_confirm_purge(Arc::new(SqliteStore::in_memory().unwrap())).await;
}

#[tokio::test]
async fn test_publish_is_recorded_confirmed_and_purged_sled() {
    publish_confirm_purge(Arc::new(SledStore::temporary().unwrap())).await;
}

#[tokio::test]
async fn test_inbound_message_reaches_matching_webhook() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/kitchen"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/garage"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
    let registry = Registry::new(store.clone());
    registry
        .create(WebhookRequest {
            url: Some(format!("{}/kitchen", server.uri())),
            topic_filter: Some("home/kitchen/+".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    registry
        .create(WebhookRequest {
            url: Some(format!("{}/garage", server.uri())),
            topic_filter: Some("home/garage/#".into()),
            ..Default::default()
        })
        .await
        .unwrap();

    let (supervisor, factory, stats) = relay(store);
    let global = DeliveryTarget::global(&Settings::default().webhook).unwrap();
    assert!(global.is_none());
    let dispatcher = Dispatcher::start(registry, global, stats.clone()).unwrap();

    supervisor
        .subscribe("", "home/#", QoS::AtMostOnce, dispatcher.handler())
        .await
        .unwrap();
    factory
        .transport("local")
        .inject("home/kitchen/temp", b"21.5");

    let delivered = {
        let server = &server;
        move || async move {
            server.received_requests().await.unwrap_or_default().len() == 1
        }
    };
    assert!(wait_until(delivered).await);
    assert!(dispatcher.shutdown(Some(Duration::from_secs(5))).await);

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].url.path(), "/kitchen");
    let body: Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(body["topic"], json!("home/kitchen/temp"));
    assert_eq!(body["payload"], json!(21.5));
    assert_eq!(body["broker"], json!("local"));

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.messages_received, 1);
    assert_eq!(snapshot.webhook_deliveries, 1);
    assert_eq!(snapshot.active_subscriptions, 1);

    let status = supervisor.status().await;
    assert_eq!(status.status, OverallStatus::Ok);
    assert_eq!(status.brokers["local"].subscriptions, vec!["home/#"]);

    supervisor.shutdown().await;
    assert_eq!(supervisor.status().await.status, OverallStatus::Partial);
}
