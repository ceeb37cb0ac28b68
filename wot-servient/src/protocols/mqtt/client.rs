//! MQTT binding client
//!
//! Correlated request/response over a reference-counted broker connection
//! pool. Observation subscriptions bypass the pool: each one opens a
//! dedicated connection so that unsubscription is a clean disconnect.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Packet, QoS};
use serde_json::{json, Value};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{broker_options, parse_href, ACK_SUFFIX, READ_SUFFIX, RESULT_SUFFIX};
use crate::error::{Error, Result};
use crate::events::{finalize, EmittedEvent, EventKind, Observer, Subscription};
use crate::protocols::refs::ConnRefCounter;
use crate::protocols::{pick_href, supports_interaction, InteractionVerb, Protocol, ProtocolClient};
use crate::td::{Form, SecurityScheme, Thing};

/// Pause before the delivery loop retries after a broker error
const SLEEP_SECS_DELIVER_ERR: Duration = Duration::from_secs(1);

/// Default wait on a topic condition between cache scans
pub const DEFAULT_MSG_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time-to-live of cached messages
pub const DEFAULT_MSG_TTL: Duration = Duration::from_secs(15);

/// Bound on waiting for a delivery loop to stop
const STOP_LOOP_TIMEOUT: Duration = Duration::from_secs(60);

/// One message delivered by the broker and cached per topic
#[derive(Debug, Clone)]
struct CachedMessage {
    id: String,
    data: Value,
    received_at: Instant,
}

/// Cache and condition state of one pooled broker connection. Mutated by
/// the delivery loop, scanned by requesters under notifier semantics.
#[derive(Default)]
struct BrokerState {
    topics: HashSet<(String, u8)>,
    conditions: HashMap<String, Arc<Notify>>,
    messages: HashMap<String, Vec<CachedMessage>>,
}

struct BrokerShared {
    state: StdMutex<BrokerState>,
    msg_ttl: Duration,
}

impl BrokerShared {
    fn new(msg_ttl: Duration) -> Self {
        Self {
            state: StdMutex::new(BrokerState::default()),
            msg_ttl,
        }
    }

    fn condition(&self, topic: &str) -> Arc<Notify> {
        let mut state = self.state.lock().expect("broker state poisoned");
        state
            .conditions
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn record_topic(&self, topic: &str, qos: u8) {
        let mut state = self.state.lock().expect("broker state poisoned");
        state.topics.insert((topic.to_string(), qos));
        state
            .conditions
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(Notify::new()));
    }

    fn subscribed_topics(&self) -> Vec<(String, u8)> {
        let state = self.state.lock().expect("broker state poisoned");
        state.topics.iter().cloned().collect()
    }

    /// Appends a delivered message, notifies all topic waiters and evicts
    /// entries older than the TTL.
    fn push_message(&self, topic: &str, data: Value) {
        let notify = {
            let mut state = self.state.lock().expect("broker state poisoned");

            state
                .messages
                .entry(topic.to_string())
                .or_default()
                .push(CachedMessage {
                    id: Uuid::new_v4().simple().to_string(),
                    data,
                    received_at: Instant::now(),
                });

            let ttl = self.msg_ttl;
            for queue in state.messages.values_mut() {
                queue.retain(|message| message.received_at.elapsed() < ttl);
            }

            state
                .conditions
                .entry(topic.to_string())
                .or_insert_with(|| Arc::new(Notify::new()))
                .clone()
        };

        notify.notify_waiters();
    }

    /// First cached message on the topic matching the predicate, in
    /// broker arrival order.
    fn next_match(
        &self,
        topic: &str,
        predicate: impl Fn(&CachedMessage) -> bool,
    ) -> Option<(String, Value, Instant)> {
        let state = self.state.lock().expect("broker state poisoned");
        state.messages.get(topic).and_then(|queue| {
            queue
                .iter()
                .find(|message| predicate(message))
                .map(|message| (message.id.clone(), message.data.clone(), message.received_at))
        })
    }
}

struct PoolEntry {
    client: AsyncClient,
    shared: Arc<BrokerShared>,
    stop: CancellationToken,
    loop_handle: JoinHandle<()>,
}

/// Implementation of the protocol client contract for MQTT
pub struct MqttClient {
    pool: Mutex<HashMap<String, PoolEntry>>,
    refs: Mutex<ConnRefCounter>,
    msg_wait_timeout: Duration,
    msg_ttl: Duration,
    ca_file: Option<PathBuf>,
    credentials: StdMutex<Option<(String, String)>>,
}

impl MqttClient {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_MSG_TTL)
    }

    pub fn with_ttl(msg_ttl: Duration) -> Self {
        Self {
            pool: Mutex::new(HashMap::new()),
            refs: Mutex::new(ConnRefCounter::new()),
            msg_wait_timeout: DEFAULT_MSG_WAIT_TIMEOUT,
            msg_ttl,
            ca_file: None,
            credentials: StdMutex::new(None),
        }
    }

    pub fn ca_file(mut self, ca_file: Option<PathBuf>) -> Self {
        self.ca_file = ca_file;
        self
    }

    fn options_for(&self, broker_url: &str) -> Result<rumqttc::MqttOptions> {
        let client_id = format!("wot-client-{}", Uuid::new_v4().simple());
        let mut options = broker_options(broker_url, &client_id, self.ca_file.as_deref())?;

        // Credentials in the URL authority win over stored ones
        let url_has_credentials = url::Url::parse(broker_url)
            .map(|url| !url.username().is_empty())
            .unwrap_or(false);
        if !url_has_credentials {
            let stored = self.credentials.lock().expect("credentials poisoned");
            if let Some((username, password)) = stored.as_ref() {
                options.set_credentials(username.clone(), password.clone());
            }
        }

        Ok(options)
    }

    /// Increments the reference counter for the broker, opening the
    /// connection and starting its delivery loop on first use.
    async fn acquire(
        &self,
        broker_url: &str,
        ref_id: &str,
    ) -> Result<(AsyncClient, Arc<BrokerShared>)> {
        let mut pool = self.pool.lock().await;
        self.refs.lock().await.increase(broker_url, ref_id);

        if let Some(entry) = pool.get(broker_url) {
            return Ok((entry.client.clone(), entry.shared.clone()));
        }

        let options = self.options_for(broker_url)?;
        let (client, event_loop) = AsyncClient::new(options, 100);
        let shared = Arc::new(BrokerShared::new(self.msg_ttl));
        let stop = CancellationToken::new();

        tracing::debug!(broker = broker_url, "Connecting pooled MQTT client");

        let loop_handle = tokio::spawn(delivery_loop(
            event_loop,
            client.clone(),
            shared.clone(),
            stop.clone(),
            broker_url.to_string(),
        ));

        pool.insert(
            broker_url.to_string(),
            PoolEntry {
                client: client.clone(),
                shared: shared.clone(),
                stop,
                loop_handle,
            },
        );

        Ok((client, shared))
    }

    /// Decrements the reference counter and, at zero, stops the delivery
    /// loop, disconnects and discards every cached message for the broker.
    async fn release(&self, broker_url: &str, ref_id: &str) {
        let mut pool = self.pool.lock().await;

        {
            let mut refs = self.refs.lock().await;
            refs.decrease(broker_url, ref_id);
            if refs.has_any(broker_url) {
                return;
            }
        }

        let Some(entry) = pool.remove(broker_url) else {
            return;
        };

        tracing::debug!(broker = broker_url, "Stopping pooled MQTT client");

        // Disconnect while the delivery loop still polls, so the request
        // is actually flushed; then stop the loop.
        if let Err(err) = entry.client.disconnect().await {
            tracing::debug!(broker = broker_url, "Error disconnecting: {}", err);
        }

        entry.stop.cancel();
        if tokio::time::timeout(STOP_LOOP_TIMEOUT, entry.loop_handle)
            .await
            .is_err()
        {
            tracing::warn!(broker = broker_url, "Timeout stopping delivery loop");
        }
    }

    async fn subscribe(
        &self,
        client: &AsyncClient,
        shared: &BrokerShared,
        topic: &str,
        qos: QoS,
    ) -> Result<()> {
        shared.record_topic(topic, qos as u8);
        client.subscribe(topic, qos).await?;
        Ok(())
    }

    /// Waits for the arrival of a message on the topic, bounded by the
    /// per-wait timeout. Spurious wakeups are fine: callers rescan.
    async fn wait_on_message(&self, shared: &BrokerShared, topic: &str) {
        let condition = shared.condition(topic);
        let _ = tokio::time::timeout(self.msg_wait_timeout, condition.notified()).await;
    }

    fn pick(&self, td: &Thing, forms: Vec<&Form>, op: Option<InteractionVerb>) -> Result<String> {
        let forms: Vec<Form> = forms.into_iter().cloned().collect();
        pick_href(td, &forms, Protocol::Mqtt, op)
            .ok_or_else(|| Error::NotSupported("No MQTT form found".to_string()))
    }

    fn check_deadline(deadline: Option<Instant>, what: &str) -> Result<()> {
        if let Some(deadline) = deadline {
            if Instant::now() > deadline {
                return Err(Error::Timeout(format!("MQTT request on {}", what)));
            }
        }
        Ok(())
    }

    /// Builds a dedicated-connection subscription delivering parsed topic
    /// payloads to the observer until disposed.
    fn subscribe_dedicated(
        &self,
        broker_url: String,
        topic: String,
        qos: QoS,
        observer: Observer,
        next_item: impl Fn(Value) -> Option<EmittedEvent> + Send + 'static,
    ) -> Result<Subscription> {
        let options = self.options_for(&broker_url)?;
        let subscription = Subscription::new();
        let token = subscription.token();

        let task_observer = observer.clone();
        tokio::spawn(finalize(observer, async move {
            let (client, mut event_loop) = AsyncClient::new(options, 64);
            client.subscribe(topic.to_string(), qos).await?;

            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => {
                        let _ = client.disconnect().await;
                        return Ok(());
                    }
                    event = event_loop.poll() => event,
                };

                match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        match serde_json::from_slice::<Value>(&publish.payload) {
                            Ok(data) => {
                                if let Some(item) = next_item(data) {
                                    task_observer.next(item);
                                }
                            }
                            Err(err) => {
                                tracing::warn!(topic = %publish.topic, "Subscription message error: {}", err);
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        // The library does not resubscribe after reconnects
                        if let Err(err) = client.subscribe(topic.clone(), qos).await {
                            tracing::warn!("Resubscribe failed: {}", err);
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(broker = %broker_url, "Subscription delivery error: {}", err);
                        tokio::time::sleep(SLEEP_SECS_DELIVER_ERR).await;
                    }
                }
            }
        }));

        Ok(subscription)
    }
}

impl Default for MqttClient {
    fn default() -> Self {
        Self::new()
    }
}

/// One delivery loop per pooled broker connection: caches every received
/// message, notifies topic waiters, and rides out broker errors by
/// sleeping and letting the next poll reconnect. The persisted topic set
/// is replayed after every reconnect.
async fn delivery_loop(
    mut event_loop: rumqttc::EventLoop,
    client: AsyncClient,
    shared: Arc<BrokerShared>,
    stop: CancellationToken,
    broker_url: String,
) {
    tracing::debug!(broker = %broker_url, "Entering message delivery loop");

    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => break,
            event = event_loop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                match serde_json::from_slice::<Value>(&publish.payload) {
                    Ok(data) => shared.push_message(&publish.topic, data),
                    Err(err) => {
                        tracing::warn!(topic = %publish.topic, "Error processing message: {}", err);
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                let topics = shared.subscribed_topics();
                if !topics.is_empty() {
                    tracing::info!(broker = %broker_url, count = topics.len(), "Resubscribing after reconnect");
                    for (topic, qos) in topics {
                        let qos = match qos {
                            2 => QoS::ExactlyOnce,
                            1 => QoS::AtLeastOnce,
                            _ => QoS::AtMostOnce,
                        };
                        if let Err(err) = client.subscribe(topic.clone(), qos).await {
                            tracing::warn!(topic = %topic, "Resubscribe failed: {}", err);
                        }
                    }
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(broker = %broker_url, "Error delivering message: {}", err);
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(SLEEP_SECS_DELIVER_ERR) => {}
                }
            }
        }
    }

    tracing::debug!(broker = %broker_url, "Exiting message delivery loop");
}

#[async_trait]
impl ProtocolClient for MqttClient {
    fn protocol(&self) -> Protocol {
        Protocol::Mqtt
    }

    fn is_supported_interaction(&self, td: &Thing, name: &str) -> bool {
        supports_interaction(td, name, Protocol::Mqtt)
    }

    /// Publishes a read request and consumes the first message on the
    /// observation topic received after the publish.
    async fn read_property(
        &self,
        td: &Thing,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let forms = td.get_property_forms(name);
        let href_read = self.pick(td, forms.clone(), Some(InteractionVerb::ReadProperty))?;
        let href_obsv = self.pick(td, forms, Some(InteractionVerb::ObserveProperty))?;

        let (broker_read, topic_read) = parse_href(&href_read)?;
        let (broker_obsv, topic_obsv) = parse_href(&href_obsv)?;

        // Acquire is reentrant per ref id, so equal broker URLs share one
        // pool entry here.
        let ref_id = Uuid::new_v4().simple().to_string();
        let (client_read, _shared_read) = self.acquire(&broker_read, &ref_id).await?;
        let (client_obsv, shared_obsv) = self.acquire(&broker_obsv, &ref_id).await?;

        let deadline = timeout.map(|t| Instant::now() + t);

        let result = async {
            self.subscribe(
                &client_obsv,
                &shared_obsv,
                &topic_obsv,
                QoS::AtLeastOnce,
            )
            .await?;

            let read_time = Instant::now();
            let payload = serde_json::to_vec(&json!({"action": "read"}))?;
            client_read
                .publish(topic_read.clone(), QoS::AtLeastOnce, false, payload)
                .await?;

            loop {
                Self::check_deadline(deadline, &topic_obsv)?;

                let matched =
                    shared_obsv.next_match(&topic_obsv, |message| message.received_at >= read_time);

                match matched {
                    Some((_, data, _)) => {
                        return Ok(data.get("value").cloned().unwrap_or(Value::Null));
                    }
                    None => self.wait_on_message(&shared_obsv, &topic_obsv).await,
                }
            }
        }
        .await;

        self.release(&broker_read, &ref_id).await;
        if broker_obsv != broker_read {
            self.release(&broker_obsv, &ref_id).await;
        }

        result
    }

    /// Publishes a write request and waits for the matching ack
    async fn write_property(
        &self,
        td: &Thing,
        name: &str,
        value: Value,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let href = self.pick(
            td,
            td.get_property_forms(name),
            Some(InteractionVerb::WriteProperty),
        )?;
        let (broker_url, topic_write) = parse_href(&href)?;
        let topic_ack = format!("{}{}", topic_write, ACK_SUFFIX);

        let ref_id = Uuid::new_v4().simple().to_string();
        let (client, shared) = self.acquire(&broker_url, &ref_id).await?;

        let deadline = timeout.map(|t| Instant::now() + t);

        let result = async {
            self.subscribe(&client, &shared, &topic_ack, QoS::AtLeastOnce)
                .await?;

            let ack_id = Uuid::new_v4().simple().to_string();
            let payload = serde_json::to_vec(&json!({
                "action": "write",
                "value": value,
                "ack": ack_id,
            }))?;
            client
                .publish(topic_write.clone(), QoS::ExactlyOnce, false, payload)
                .await?;

            loop {
                Self::check_deadline(deadline, &topic_ack)?;

                let matched = shared.next_match(&topic_ack, |message| {
                    message.data.get("ack").and_then(Value::as_str) == Some(ack_id.as_str())
                });

                if matched.is_some() {
                    return Ok(());
                }
                self.wait_on_message(&shared, &topic_ack).await;
            }
        }
        .await;

        self.release(&broker_url, &ref_id).await;
        result
    }

    /// Correlated invocation: publish with a fresh correlation id and scan
    /// the result topic cache until the id echoes back.
    async fn invoke_action(
        &self,
        td: &Thing,
        name: &str,
        input: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let href = self.pick(td, td.get_action_forms(name), None)?;
        let (broker_url, topic_invoke) = parse_href(&href)?;
        let topic_result = format!("{}{}", topic_invoke, RESULT_SUFFIX);

        let ref_id = Uuid::new_v4().simple().to_string();
        let (client, shared) = self.acquire(&broker_url, &ref_id).await?;

        let deadline = timeout.map(|t| Instant::now() + t);

        let result = async {
            self.subscribe(&client, &shared, &topic_result, QoS::AtLeastOnce)
                .await?;

            let correlation_id = Uuid::new_v4().simple().to_string();
            let payload = serde_json::to_vec(&json!({
                "id": correlation_id,
                "input": input,
            }))?;
            client
                .publish(topic_invoke.clone(), QoS::ExactlyOnce, false, payload)
                .await?;

            loop {
                Self::check_deadline(deadline, &topic_result)?;

                let matched = shared.next_match(&topic_result, |message| {
                    message.data.get("id").and_then(Value::as_str)
                        == Some(correlation_id.as_str())
                });

                match matched {
                    Some((_, data, _)) => {
                        if let Some(error) = data.get("error").filter(|e| !e.is_null()) {
                            return Err(Error::Handler(
                                error
                                    .as_str()
                                    .map(str::to_string)
                                    .unwrap_or_else(|| error.to_string()),
                            ));
                        }
                        return Ok(data.get("result").cloned().unwrap_or(Value::Null));
                    }
                    None => self.wait_on_message(&shared, &topic_result).await,
                }
            }
        }
        .await;

        self.release(&broker_url, &ref_id).await;
        result
    }

    fn on_property_change(
        &self,
        td: &Thing,
        name: &str,
        observer: Observer,
    ) -> Result<Subscription> {
        let href = self.pick(
            td,
            td.get_property_forms(name),
            Some(InteractionVerb::ObserveProperty),
        )?;
        let (broker_url, topic) = parse_href(&href)?;

        let property = name.to_string();
        self.subscribe_dedicated(
            broker_url,
            topic,
            QoS::AtMostOnce,
            observer,
            move |data| {
                Some(EmittedEvent::new(EventKind::PropertyChange {
                    name: property.clone(),
                    value: data.get("value").cloned().unwrap_or(Value::Null),
                }))
            },
        )
    }

    fn on_event(&self, td: &Thing, name: &str, observer: Observer) -> Result<Subscription> {
        let href = self.pick(
            td,
            td.get_event_forms(name),
            Some(InteractionVerb::SubscribeEvent),
        )?;
        let (broker_url, topic) = parse_href(&href)?;

        let event_name = name.to_string();
        self.subscribe_dedicated(
            broker_url,
            topic,
            QoS::AtMostOnce,
            observer,
            move |data| {
                Some(EmittedEvent::new(EventKind::Custom {
                    name: event_name.clone(),
                    payload: data.get("data").cloned(),
                }))
            },
        )
    }

    /// Stores broker credentials applied to every new connection whose
    /// URL carries no authority of its own.
    fn set_security(&self, scheme: &SecurityScheme, credentials: &Value) -> Result<()> {
        match scheme {
            SecurityScheme::Nosec => Ok(()),
            SecurityScheme::Basic { .. } => {
                let username = credentials
                    .get("username")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::NotSupported("Missing username credential".into()))?;
                let password = credentials
                    .get("password")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::NotSupported("Missing password credential".into()))?;

                *self.credentials.lock().expect("credentials poisoned") =
                    Some((username.to_string(), password.to_string()));
                Ok(())
            }
            other => Err(Error::NotSupported(format!(
                "MQTT security scheme not supported: {}",
                other.scheme_name()
            ))),
        }
    }
}
