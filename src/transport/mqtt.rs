use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet,
};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{EventSender, InboundPublish, Transport, TransportEvent, TransportFactory, tls};
use crate::broker::message::QoS;
use crate::config::BrokerEndpoint;
use crate::utils::{Result, TransportError};

/// Capacity of the rumqttc request queue.
const REQUEST_CAPACITY: usize = 64;
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);
/// Time allowed for the DISCONNECT packet to go out before the loop is cut.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Builds rumqttc options from an endpoint: keep-alive, clean session,
/// credentials and TLS.
pub fn mqtt_options(endpoint: &BrokerEndpoint) -> Result<MqttOptions> {
    let mut options = MqttOptions::new(&endpoint.client_id, &endpoint.host, endpoint.port);
    options
        .set_keep_alive(endpoint.keep_alive())
        .set_clean_session(endpoint.clean_session);
    if let Some(credentials) = &endpoint.credentials {
        options.set_credentials(&credentials.username, &credentials.password);
    }
    if let Some(tls_options) = &endpoint.tls {
        options.set_transport(tls::transport(tls_options)?);
    }
    Ok(options)
}

/// Exponential back-off: 100ms doubling per consecutive failure, capped at 60s.
pub fn retry_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(10);
    (INITIAL_RETRY_DELAY * 2_u32.pow(exponent)).min(MAX_RETRY_DELAY)
}

fn connection_error(err: ConnectionError) -> TransportError {
    match err {
        ConnectionError::ConnectionRefused(code) => TransportError::Rejected(format!("{code:?}")),
        other => TransportError::Connection(other),
    }
}

struct Driver {
    client: AsyncClient,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

struct DriverContext {
    broker: String,
    connected: Arc<AtomicBool>,
    events: EventSender,
    stop: CancellationToken,
}

/// `rumqttc`-backed transport.
///
/// Each successful [`connect`](Transport::connect) spawns a task that owns the
/// event loop. After the first CONNACK that task keeps reconnecting on its
/// own with exponential back-off until [`disconnect`](Transport::disconnect)
/// is called.
///
/// Publish, subscribe and unsubscribe complete when rumqttc accepts the
/// request into its queue; the broker's acknowledgement is not awaited.
pub struct MqttTransport {
    broker: String,
    options: MqttOptions,
    connect_timeout: Duration,
    events: EventSender,
    connected: Arc<AtomicBool>,
    client: RwLock<Option<AsyncClient>>,
    driver: Mutex<Option<Driver>>,
}

impl MqttTransport {
    pub fn new(endpoint: &BrokerEndpoint, events: EventSender) -> Result<Self> {
        Ok(Self {
            broker: endpoint.name.clone(),
            options: mqtt_options(endpoint)?,
            connect_timeout: endpoint.connect_timeout(),
            events,
            connected: Arc::new(AtomicBool::new(false)),
            client: RwLock::new(None),
            driver: Mutex::new(None),
        })
    }

    fn client(&self) -> Result<AsyncClient> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected.into());
        }
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| TransportError::NotConnected.into())
    }

    fn set_client(&self, client: Option<AsyncClient>) {
        *self.client.write().unwrap_or_else(PoisonError::into_inner) = client;
    }
}

impl std::fmt::Debug for MqttTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttTransport")
            .field("broker", &self.broker)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self) -> Result<()> {
        let mut driver = self.driver.lock().await;
        if let Some(running) = driver.as_ref() {
            if !running.handle.is_finished() {
                // The loop is alive and reconnects by itself.
                return if self.is_connected() {
                    Ok(())
                } else {
                    Err(TransportError::NotConnected.into())
                };
            }
        }

        let (client, event_loop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);
        let stop = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let context = DriverContext {
            broker: self.broker.clone(),
            connected: self.connected.clone(),
            events: self.events.clone(),
            stop: stop.clone(),
        };
        self.set_client(Some(client.clone()));
        let handle = tokio::spawn(drive(event_loop, context, ready_tx));

        let outcome = match tokio::time::timeout(self.connect_timeout, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed.into()),
            Err(_) => {
                stop.cancel();
                handle.abort();
                Err(TransportError::ConnectTimeout(self.connect_timeout).into())
            }
        };

        match outcome {
            Ok(()) => {
                info!(broker = %self.broker, "connected to broker");
                *driver = Some(Driver {
                    client,
                    stop,
                    handle,
                });
                Ok(())
            }
            Err(err) => {
                self.set_client(None);
                warn!(broker = %self.broker, error = %err, "connect failed");
                Err(err)
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let mut driver = self.driver.lock().await;
        let Some(mut running) = driver.take() else {
            return Ok(());
        };
        self.set_client(None);

        if self.connected.load(Ordering::SeqCst) {
            if let Err(err) = running.client.disconnect().await {
                debug!(broker = %self.broker, error = %err, "disconnect request not queued");
            }
        }
        if tokio::time::timeout(DISCONNECT_GRACE, &mut running.handle)
            .await
            .is_err()
        {
            running.stop.cancel();
            let _ = running.handle.await;
        }
        self.connected.store(false, Ordering::SeqCst);
        info!(broker = %self.broker, "disconnected from broker");
        Ok(())
    }

    async fn publish(&self, topic: &str, qos: QoS, retained: bool, payload: Vec<u8>) -> Result<()> {
        self.client()?
            .publish(topic, qos.into(), retained, payload)
            .await
            .map_err(TransportError::from)?;
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        self.client()?
            .subscribe(filter, qos.into())
            .await
            .map_err(TransportError::from)?;
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.client()?
            .unsubscribe(filter)
            .await
            .map_err(TransportError::from)?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Owns the event loop. Reports the first connection outcome through `ready`
/// and exits on a failed first attempt, a client-initiated DISCONNECT or
/// cancellation.
async fn drive(
    mut event_loop: EventLoop,
    ctx: DriverContext,
    ready: oneshot::Sender<Result<()>>,
) {
    let mut ready = Some(ready);
    let mut failures: u32 = 0;

    loop {
        let polled = tokio::select! {
            _ = ctx.stop.cancelled() => break,
            polled = event_loop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    let err = TransportError::Rejected(format!("{:?}", ack.code));
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(err.into()));
                        break;
                    }
                    warn!(broker = %ctx.broker, error = %err, "reconnect rejected");
                    continue;
                }
                if ctx.stop.is_cancelled() {
                    break;
                }
                failures = 0;
                ctx.connected.store(true, Ordering::SeqCst);
                let _ = ctx.events.send(TransportEvent::Connected {
                    session_present: ack.session_present,
                });
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(broker = %ctx.broker, topic = %publish.topic, "message received");
                let _ = ctx.events.send(TransportEvent::Message(InboundPublish {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                    qos: publish.qos.into(),
                    retained: publish.retain,
                }));
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                if ctx.connected.swap(false, Ordering::SeqCst) {
                    let _ = ctx
                        .events
                        .send(TransportEvent::ConnectionLost("broker sent DISCONNECT".into()));
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!(broker = %ctx.broker, "DISCONNECT sent");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(connection_error(err).into()));
                    break;
                }
                if ctx.connected.swap(false, Ordering::SeqCst) {
                    warn!(broker = %ctx.broker, error = %err, "connection lost");
                    let _ = ctx
                        .events
                        .send(TransportEvent::ConnectionLost(err.to_string()));
                }

                failures = failures.saturating_add(1);
                let delay = retry_delay(failures);
                debug!(broker = %ctx.broker, ?delay, failures, "reconnecting");
                let _ = ctx.events.send(TransportEvent::Reconnecting);
                tokio::select! {
                    _ = ctx.stop.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    ctx.connected.store(false, Ordering::SeqCst);
}

/// Builds [`MqttTransport`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct MqttTransportFactory;

impl TransportFactory for MqttTransportFactory {
    fn build(&self, endpoint: &BrokerEndpoint, events: EventSender) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(MqttTransport::new(endpoint, events)?))
    }
}
