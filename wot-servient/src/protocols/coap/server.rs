//! CoAP binding server

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coap_lite::{CoapOption, MessageClass, MessageType, Packet, RequestType, ResponseType};
use serde_json::{json, Value};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{auth_option, encode_observe, observe_value, query_params};
use crate::auth::Authenticator;
use crate::error::{Error, Result};
use crate::events::EventKind;
use crate::exposed::{ExposedThing, ExposedThingSet};
use crate::protocols::{InteractionVerb, Protocol, ProtocolServer};
use crate::servient::Servient;
use crate::td::{Form, Interaction, InteractionKind, SecurityScheme, Thing};

/// Default CoAP binding port
pub const DEFAULT_PORT: u16 = 5683;

/// Time completed invocations stay queryable before they are purged
const DEFAULT_ACTION_CLEAR: Duration = Duration::from_secs(60);

/// Key of one observe registration: peer address + token
type ObserveKey = (SocketAddr, Vec<u8>);

/// Status stream of one tracked action invocation. The watch channel
/// retains the latest status, so a completion that lands between a status
/// read and the wait for the next change is never lost.
struct InvocationEntry {
    status: watch::Receiver<Value>,
}

struct RunningServer {
    token: CancellationToken,
    task: JoinHandle<()>,
}

struct CoapState {
    port: u16,
    security_scheme: SecurityScheme,
    /// OSCORE credentials map handed through to the transport layer
    oscore_credentials_map: Option<PathBuf>,
    action_clear: Duration,
    things: ExposedThingSet,
    servient: tokio::sync::RwLock<Option<Servient>>,
    running: Mutex<Option<RunningServer>>,
    /// Active observe registrations, tagged with a per-registration id so
    /// a refresh under the same token cannot untrack its replacement
    observers: Mutex<HashMap<ObserveKey, (Uuid, CancellationToken)>>,
    invocations: Mutex<HashMap<String, InvocationEntry>>,
}

/// CoAP binding server implementation
pub struct CoapServer {
    state: Arc<CoapState>,
}

impl CoapServer {
    pub fn new(
        port: u16,
        security_scheme: SecurityScheme,
        oscore_credentials_map: Option<PathBuf>,
    ) -> Self {
        Self {
            state: Arc::new(CoapState {
                port,
                security_scheme,
                oscore_credentials_map,
                action_clear: DEFAULT_ACTION_CLEAR,
                things: ExposedThingSet::new(),
                servient: tokio::sync::RwLock::new(None),
                running: Mutex::new(None),
                observers: Mutex::new(HashMap::new()),
                invocations: Mutex::new(HashMap::new()),
            }),
        }
    }
}

fn response_packet(request: &Packet, code: ResponseType, payload: Vec<u8>) -> Packet {
    let mut response = Packet::new();
    response.header.message_id = request.header.message_id;
    response.header.code = MessageClass::Response(code);
    response.header.set_type(match request.header.get_type() {
        MessageType::Confirmable => MessageType::Acknowledgement,
        _ => MessageType::NonConfirmable,
    });
    response.set_token(request.get_token().to_vec());
    response.payload = payload;
    response
}

/// Builds a notification packet for an active observation
fn notification_packet(token: &[u8], sequence: u32, payload: Vec<u8>) -> Packet {
    let mut packet = Packet::new();
    packet.header.message_id = rand::random::<u16>();
    packet.header.code = MessageClass::Response(ResponseType::Content);
    packet.header.set_type(MessageType::NonConfirmable);
    packet.set_token(token.to_vec());
    packet.add_option(CoapOption::Observe, encode_observe(sequence));
    packet.payload = payload;
    packet
}

async fn send_packet(socket: &UdpSocket, packet: &Packet, peer: SocketAddr) {
    match packet.to_bytes() {
        Ok(bytes) => {
            if let Err(err) = socket.send_to(&bytes, peer).await {
                tracing::debug!(peer = %peer, "CoAP send error: {}", err);
            }
        }
        Err(err) => tracing::warn!("CoAP encode error: {:?}", err),
    }
}

async fn error_reply(socket: &UdpSocket, request: &Packet, peer: SocketAddr, code: ResponseType, message: &str) {
    let payload = serde_json::to_vec(&json!({"error": message})).unwrap_or_default();
    let response = response_packet(request, code, payload);
    send_packet(socket, &response, peer).await;
}

impl CoapState {
    /// Tracks a new observe registration, cancelling any previous one
    /// under the same peer and token.
    async fn track_observer(&self, key: ObserveKey) -> (Uuid, CancellationToken) {
        let registration_id = Uuid::new_v4();
        let cancel = CancellationToken::new();

        if let Some((_, previous)) = self
            .observers
            .lock()
            .await
            .insert(key, (registration_id, cancel.clone()))
        {
            previous.cancel();
        }

        (registration_id, cancel)
    }

    /// Drops the tracking entry, but only while it still belongs to this
    /// registration: a refresh may have replaced it under the same key.
    async fn untrack_observer(&self, key: &ObserveKey, registration_id: Uuid) {
        let mut observers = self.observers.lock().await;
        if observers.get(key).map(|(owner, _)| *owner) == Some(registration_id) {
            observers.remove(key);
        }
    }

    async fn check_credentials(&self, exposed: &ExposedThing, packet: &Packet) -> bool {
        let authenticator = Authenticator::from_scheme(&self.security_scheme);

        let credentials = match self.servient.read().await.as_ref() {
            Some(servient) => servient.retrieve_credentials(exposed.title()).await,
            None => None,
        };

        let authorization = auth_option(packet);
        authenticator
            .authenticate(credentials.as_ref(), authorization.as_deref())
            .await
            .unwrap_or(false)
    }

    /// Registers a property observation: replies with the current value
    /// and forwards subsequent changes as notifications.
    async fn register_property_observer(
        self: &Arc<Self>,
        socket: Arc<UdpSocket>,
        request: &Packet,
        peer: SocketAddr,
        exposed: ExposedThing,
        property: String,
    ) {
        let current = exposed.read_property(&property).await.unwrap_or(Value::Null);
        let mut response = response_packet(
            request,
            ResponseType::Content,
            serde_json::to_vec(&json!({"value": current})).unwrap_or_default(),
        );
        response.add_option(CoapOption::Observe, encode_observe(0));
        send_packet(&socket, &response, peer).await;

        let key: ObserveKey = (peer, request.get_token().to_vec());
        let (registration_id, cancel) = self.track_observer(key.clone()).await;

        let token = key.1.clone();
        let mut receiver = exposed.events().receiver();
        let state = self.clone();
        tokio::spawn(async move {
            let mut sequence: u32 = 1;
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = receiver.recv() => event,
                };

                match event {
                    Ok(event) => {
                        if let EventKind::PropertyChange { name, value } = &event.kind {
                            if crate::td::url_name(name) == crate::td::url_name(&property) {
                                let payload = serde_json::to_vec(&json!({"value": value}))
                                    .unwrap_or_default();
                                let packet = notification_packet(&token, sequence, payload);
                                send_packet(&socket, &packet, peer).await;
                                sequence = sequence.wrapping_add(1);
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            state.untrack_observer(&key, registration_id).await;
        });
    }

    /// Registers an event observation
    async fn register_event_observer(
        self: &Arc<Self>,
        socket: Arc<UdpSocket>,
        request: &Packet,
        peer: SocketAddr,
        exposed: ExposedThing,
        event_name: String,
    ) {
        let mut response = response_packet(request, ResponseType::Content, Vec::new());
        response.add_option(CoapOption::Observe, encode_observe(0));
        send_packet(&socket, &response, peer).await;

        let key: ObserveKey = (peer, request.get_token().to_vec());
        let (registration_id, cancel) = self.track_observer(key.clone()).await;

        let token = key.1.clone();
        let mut receiver = exposed.events().receiver();
        let state = self.clone();
        tokio::spawn(async move {
            let mut sequence: u32 = 1;
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = receiver.recv() => event,
                };

                match event {
                    Ok(event) => {
                        if let EventKind::Custom { name, payload } = &event.kind {
                            if crate::td::url_name(name) == crate::td::url_name(&event_name) {
                                let body = serde_json::to_vec(&json!({
                                    "name": name,
                                    "data": payload,
                                    "timestamp": event.timestamp.timestamp_millis(),
                                }))
                                .unwrap_or_default();
                                let packet = notification_packet(&token, sequence, body);
                                send_packet(&socket, &packet, peer).await;
                                sequence = sequence.wrapping_add(1);
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            state.untrack_observer(&key, registration_id).await;
        });
    }

    async fn deregister_observer(&self, request: &Packet, peer: SocketAddr) {
        let key: ObserveKey = (peer, request.get_token().to_vec());
        if let Some((_, cancel)) = self.observers.lock().await.remove(&key) {
            cancel.cancel();
        }
    }

    /// Creates an invocation entry and runs the handler in the background
    async fn create_invocation(
        self: &Arc<Self>,
        exposed: ExposedThing,
        action: String,
        input: Option<Value>,
    ) -> String {
        let invocation_id = Uuid::new_v4().simple().to_string();
        let (status_tx, status_rx) = watch::channel(json!({
            "id": invocation_id,
            "done": false,
        }));

        self.invocations
            .lock()
            .await
            .insert(invocation_id.clone(), InvocationEntry { status: status_rx });

        let state = self.clone();
        let id = invocation_id.clone();
        let clear_after = self.action_clear;
        tokio::spawn(async move {
            let outcome = exposed.invoke_action(&action, input).await;

            let final_status = match outcome {
                Ok(result) => json!({"id": id, "done": true, "result": result}),
                Err(err) => json!({"id": id, "done": true, "error": err.to_string()}),
            };
            let _ = status_tx.send(final_status);

            // Completed invocations stay queryable for a bounded time
            tokio::time::sleep(clear_after).await;
            state.invocations.lock().await.remove(&id);
        });

        invocation_id
    }

    /// Replies with the invocation status and pushes updates until `done`
    async fn observe_invocation(
        &self,
        socket: Arc<UdpSocket>,
        request: &Packet,
        peer: SocketAddr,
        invocation_id: &str,
    ) -> bool {
        let Some(mut status) = self
            .invocations
            .lock()
            .await
            .get(invocation_id)
            .map(|entry| entry.status.clone())
        else {
            return false;
        };

        // Mark the current status as seen before replying: a completion
        // landing after this point wakes `changed` below.
        let current = status.borrow_and_update().clone();
        let done = current.get("done").and_then(Value::as_bool).unwrap_or(false);

        let mut response = response_packet(
            request,
            ResponseType::Content,
            serde_json::to_vec(&current).unwrap_or_default(),
        );
        response.add_option(CoapOption::Observe, encode_observe(0));
        send_packet(&socket, &response, peer).await;

        if !done {
            let token = request.get_token().to_vec();
            tokio::spawn(async move {
                if status.changed().await.is_err() {
                    return;
                }
                let final_status = status.borrow().clone();
                let payload = serde_json::to_vec(&final_status).unwrap_or_default();
                let packet = notification_packet(&token, 1, payload);
                send_packet(&socket, &packet, peer).await;
            });
        }

        true
    }
}

/// Joins the Uri-Path options into the resource path
fn packet_path(packet: &Packet) -> String {
    packet
        .get_option(CoapOption::UriPath)
        .map(|segments| {
            segments
                .iter()
                .map(|segment| String::from_utf8_lossy(segment).to_string())
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_default()
}

/// Dispatches one parsed request
async fn handle_request(
    state: Arc<CoapState>,
    socket: Arc<UdpSocket>,
    packet: Packet,
    peer: SocketAddr,
) {
    let packet = &packet;
    let params = query_params(packet);

    let path = packet_path(packet);
    let resource = path.trim_matches('/');

    let (Some(thing_name), Some(name)) = (params.get("thing"), params.get("name")) else {
        error_reply(&socket, packet, peer, ResponseType::BadRequest, "Missing thing or name query").await;
        return;
    };

    let Some(exposed) = state.things.find(thing_name).await else {
        error_reply(&socket, packet, peer, ResponseType::NotFound, "Unknown Thing").await;
        return;
    };

    if !state.check_credentials(&exposed, packet).await {
        error_reply(&socket, packet, peer, ResponseType::Unauthorized, "Unauthorized").await;
        return;
    }

    let MessageClass::Request(method) = packet.header.code else {
        return;
    };
    let body: Option<Value> = if packet.payload.is_empty() {
        None
    } else {
        serde_json::from_slice(&packet.payload).ok()
    };

    match (resource, method) {
        ("property", RequestType::Get) => match observe_value(packet) {
            Some(0) => {
                state
                    .register_property_observer(socket, packet, peer, exposed, name.clone())
                    .await;
            }
            Some(1) => {
                state.deregister_observer(packet, peer).await;
                match exposed.read_property(name).await {
                    Ok(value) => {
                        let payload =
                            serde_json::to_vec(&json!({"value": value})).unwrap_or_default();
                        let response =
                            response_packet(packet, ResponseType::Content, payload);
                        send_packet(&socket, &response, peer).await;
                    }
                    Err(err) => {
                        error_reply(&socket, packet, peer, ResponseType::NotFound, &err.to_string())
                            .await;
                    }
                }
            }
            _ => match exposed.read_property(name).await {
                Ok(value) => {
                    let payload = serde_json::to_vec(&json!({"value": value})).unwrap_or_default();
                    let response = response_packet(packet, ResponseType::Content, payload);
                    send_packet(&socket, &response, peer).await;
                }
                Err(err) => {
                    error_reply(&socket, packet, peer, ResponseType::NotFound, &err.to_string())
                        .await;
                }
            },
        },

        ("property", RequestType::Put) => {
            let value = body
                .as_ref()
                .and_then(|b| b.get("value").cloned())
                .or(body.clone())
                .unwrap_or(Value::Null);

            match exposed.handle_write_property(name, value).await {
                Ok(()) => {
                    let response = response_packet(packet, ResponseType::Changed, Vec::new());
                    send_packet(&socket, &response, peer).await;
                }
                Err(err) => {
                    error_reply(&socket, packet, peer, ResponseType::BadRequest, &err.to_string())
                        .await;
                }
            }
        }

        ("action", RequestType::Post) => {
            let input = body.as_ref().and_then(|b| b.get("input").cloned());
            let invocation_id = state
                .create_invocation(exposed, name.clone(), input)
                .await;

            let payload =
                serde_json::to_vec(&json!({"id": invocation_id})).unwrap_or_default();
            let response = response_packet(packet, ResponseType::Created, payload);
            send_packet(&socket, &response, peer).await;
        }

        ("action", RequestType::Get) => {
            let Some(invocation_id) = body
                .as_ref()
                .and_then(|b| b.get("id"))
                .and_then(Value::as_str)
            else {
                error_reply(&socket, packet, peer, ResponseType::BadRequest, "Missing invocation id")
                    .await;
                return;
            };

            if !state
                .observe_invocation(socket.clone(), packet, peer, invocation_id)
                .await
            {
                error_reply(&socket, packet, peer, ResponseType::NotFound, "Unknown invocation")
                    .await;
            }
        }

        ("event", RequestType::Get) => match observe_value(packet) {
            Some(1) => state.deregister_observer(packet, peer).await,
            _ => {
                state
                    .register_event_observer(socket, packet, peer, exposed, name.clone())
                    .await;
            }
        },

        _ => {
            error_reply(&socket, packet, peer, ResponseType::MethodNotAllowed, "Unsupported verb")
                .await;
        }
    }
}

#[async_trait]
impl ProtocolServer for CoapServer {
    fn protocol(&self) -> Protocol {
        Protocol::Coap
    }

    fn port(&self) -> Option<u16> {
        Some(self.state.port)
    }

    async fn start(&self, servient: &Servient) -> Result<()> {
        let mut running = self.state.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        *self.state.servient.write().await = Some(servient.clone());

        if let Some(map) = &self.state.oscore_credentials_map {
            tracing::info!(map = %map.display(), "OSCORE credentials map configured");
        }

        let socket = UdpSocket::bind(("0.0.0.0", self.state.port))
            .await
            .map_err(|e| {
                Error::State(format!(
                    "Cannot bind CoAP server on port {}: {}",
                    self.state.port, e
                ))
            })?;
        let socket = Arc::new(socket);

        let token = CancellationToken::new();
        let loop_token = token.clone();
        let state = self.state.clone();
        let loop_socket = socket.clone();

        let task = tokio::spawn(async move {
            let mut buffer = vec![0u8; 65_536];
            loop {
                let received = tokio::select! {
                    _ = loop_token.cancelled() => break,
                    received = loop_socket.recv_from(&mut buffer) => received,
                };

                let (length, peer) = match received {
                    Ok(received) => received,
                    Err(err) => {
                        tracing::warn!("CoAP receive error: {}", err);
                        continue;
                    }
                };

                let packet = match Packet::from_bytes(&buffer[..length]) {
                    Ok(packet) => packet,
                    Err(err) => {
                        tracing::debug!(peer = %peer, "Discarding malformed CoAP packet: {:?}", err);
                        continue;
                    }
                };

                if !matches!(packet.header.code, MessageClass::Request(_)) {
                    continue;
                }

                tokio::spawn(handle_request(
                    state.clone(),
                    loop_socket.clone(),
                    packet,
                    peer,
                ));
            }
        });

        tracing::info!(port = self.state.port, "CoAP binding listening");

        *running = Some(RunningServer { token, task });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut running = self.state.running.lock().await;
        let Some(server) = running.take() else {
            return Ok(());
        };

        server.token.cancel();
        let _ = server.task.await;

        let mut observers = self.state.observers.lock().await;
        for (_, cancel) in observers.values() {
            cancel.cancel();
        }
        observers.clear();
        self.state.invocations.lock().await.clear();

        Ok(())
    }

    fn build_forms(
        &self,
        hostname: &str,
        thing: &Thing,
        interaction: Interaction<'_>,
    ) -> Vec<Form> {
        let hostname = hostname.trim_matches('/');
        let query = format!(
            "thing={}&name={}",
            thing.url_name(),
            interaction.url_name()
        );

        match interaction.kind() {
            InteractionKind::Property => {
                let href = format!(
                    "coap://{}:{}/property?{}",
                    hostname, self.state.port, query
                );
                vec![
                    Form::generated(
                        Protocol::Coap,
                        href.clone(),
                        vec![InteractionVerb::ReadProperty],
                    ),
                    Form::generated(
                        Protocol::Coap,
                        href.clone(),
                        vec![InteractionVerb::WriteProperty],
                    ),
                    Form::generated(Protocol::Coap, href, vec![InteractionVerb::ObserveProperty]),
                ]
            }
            InteractionKind::Action => vec![Form::generated(
                Protocol::Coap,
                format!("coap://{}:{}/action?{}", hostname, self.state.port, query),
                vec![InteractionVerb::InvokeAction],
            )],
            InteractionKind::Event => vec![Form::generated(
                Protocol::Coap,
                format!("coap://{}:{}/event?{}", hostname, self.state.port, query),
                vec![InteractionVerb::SubscribeEvent],
            )],
        }
    }

    fn build_base_url(&self, hostname: &str, _thing: &Thing) -> Result<String> {
        Ok(format!(
            "coap://{}:{}",
            hostname.trim_matches('/'),
            self.state.port
        ))
    }

    async fn add_exposed_thing(&self, exposed_thing: ExposedThing) {
        let _ = self.state.things.add(exposed_thing).await;
    }

    async fn remove_exposed_thing(&self, name: &str) {
        self.state.things.remove(name).await;
    }

    async fn contains_thing(&self, name: &str) -> bool {
        self.state.things.contains(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::td::{DataSchema, Property};

    fn server() -> CoapServer {
        CoapServer::new(5683, SecurityScheme::Nosec, None)
    }

    fn thing() -> Thing {
        let mut thing = Thing::new("Coffee Machine");
        thing
            .add_property("waterLevel", Property::new(DataSchema::default(), true))
            .unwrap();
        thing
            .add_action("makeDrink", crate::td::Action::default())
            .unwrap();
        thing
    }

    #[test]
    fn test_forms_are_query_parameterized() {
        let server = server();
        let thing = thing();

        let forms = server.build_forms(
            "myhost",
            &thing,
            thing.find_interaction("waterLevel").unwrap(),
        );
        assert_eq!(forms.len(), 3);
        for form in &forms {
            assert_eq!(
                form.href,
                "coap://myhost:5683/property?thing=coffee-machine&name=waterlevel"
            );
        }

        let verbs: Vec<_> = forms.iter().flat_map(|f| f.op.clone()).collect();
        assert!(verbs.contains(&InteractionVerb::ReadProperty));
        assert!(verbs.contains(&InteractionVerb::WriteProperty));
        assert!(verbs.contains(&InteractionVerb::ObserveProperty));
    }

    #[test]
    fn test_action_form() {
        let server = server();
        let thing = thing();

        let forms = server.build_forms(
            "myhost",
            &thing,
            thing.find_interaction("makeDrink").unwrap(),
        );
        assert_eq!(
            forms[0].href,
            "coap://myhost:5683/action?thing=coffee-machine&name=makedrink"
        );
    }

    #[test]
    fn test_response_packet_echoes_token_and_id() {
        let mut request = Packet::new();
        request.header.message_id = 42;
        request.header.set_type(MessageType::Confirmable);
        request.set_token(vec![1, 2, 3]);

        let response = response_packet(&request, ResponseType::Content, b"{}".to_vec());
        assert_eq!(response.header.message_id, 42);
        assert_eq!(response.get_token(), &[1, 2, 3]);
        assert_eq!(
            response.header.get_type(),
            MessageType::Acknowledgement
        );
    }

    #[tokio::test]
    async fn test_invocation_lifecycle() {
        let server = server();
        let exposed = ExposedThing::new(
            std::sync::Weak::new(),
            Arc::new(crate::persistence::NopWriter),
            thing(),
        );
        exposed
            .set_action_handler(
                "makeDrink",
                Arc::new(|_, _, _| Box::pin(async { Ok(json!("done")) })),
            )
            .await
            .unwrap();

        let id = server
            .state
            .create_invocation(exposed, "makeDrink".to_string(), None)
            .await;

        // The handler runs in the background; the status flips to done
        tokio::time::sleep(Duration::from_millis(100)).await;
        let invocations = server.state.invocations.lock().await;
        let entry = invocations.get(&id).unwrap();
        let status = entry.status.borrow().clone();
        assert_eq!(status["done"], json!(true));
        assert_eq!(status["result"], json!("done"));
    }

    #[tokio::test]
    async fn test_invocation_completion_wakes_late_watcher() {
        let server = server();
        let exposed = ExposedThing::new(
            std::sync::Weak::new(),
            Arc::new(crate::persistence::NopWriter),
            thing(),
        );
        exposed
            .set_action_handler(
                "makeDrink",
                Arc::new(|_, _, _| Box::pin(async { Ok(json!("done")) })),
            )
            .await
            .unwrap();

        let id = server
            .state
            .create_invocation(exposed, "makeDrink".to_string(), None)
            .await;

        let mut status = {
            let invocations = server.state.invocations.lock().await;
            invocations.get(&id).unwrap().status.clone()
        };

        // Observe the not-done status, let the completion land, then wait:
        // the retained terminal state must still wake the watcher.
        let seen = status.borrow_and_update().clone();
        tokio::time::sleep(Duration::from_millis(100)).await;

        if seen["done"] != json!(true) {
            tokio::time::timeout(Duration::from_secs(1), status.changed())
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(status.borrow()["done"], json!(true));
    }

    #[tokio::test]
    async fn test_observer_refresh_keeps_new_registration_tracked() {
        let server = server();
        let peer: SocketAddr = "127.0.0.1:5683".parse().unwrap();
        let key: ObserveKey = (peer, vec![1, 2, 3]);

        let (first_id, first_cancel) = server.state.track_observer(key.clone()).await;
        let (second_id, _second_cancel) = server.state.track_observer(key.clone()).await;
        assert!(first_cancel.is_cancelled());

        // The replaced registration's cleanup must not drop the refresh
        server.state.untrack_observer(&key, first_id).await;
        assert!(server.state.observers.lock().await.contains_key(&key));

        server.state.untrack_observer(&key, second_id).await;
        assert!(!server.state.observers.lock().await.contains_key(&key));
    }
}
