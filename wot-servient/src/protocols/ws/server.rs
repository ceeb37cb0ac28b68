//! WebSocket binding server

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::messages::{
    JsonRpcRequest, JsonRpcResponse, ERR_APPLICATION, ERR_INVALID_REQUEST, ERR_METHOD_NOT_FOUND,
};
use crate::error::{Error, Result};
use crate::events::{EventKind, Observer, Subscription};
use crate::exposed::{ExposedThing, ExposedThingSet};
use crate::protocols::{InteractionVerb, Protocol, ProtocolServer};
use crate::servient::Servient;
use crate::td::{Form, Interaction, InteractionKind, Thing};

/// Default WebSocket binding port
pub const DEFAULT_PORT: u16 = 8081;

struct RunningServer {
    token: CancellationToken,
    task: JoinHandle<()>,
}

struct WsState {
    port: u16,
    things: ExposedThingSet,
    running: Mutex<Option<RunningServer>>,
}

/// WebSocket binding server: one endpoint per Thing, JSON-RPC 2.0 payloads
pub struct WsServer {
    state: Arc<WsState>,
}

impl WsServer {
    pub fn new(port: u16) -> Self {
        Self {
            state: Arc::new(WsState {
                port,
                things: ExposedThingSet::new(),
                running: Mutex::new(None),
            }),
        }
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/{thing_url_name}", any(upgrade_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }
}

async fn upgrade_handler(
    State(state): State<Arc<WsState>>,
    Path(thing_url_name): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(exposed) = state.things.find(&thing_url_name).await else {
        return Error::NotFound(format!("Unknown Thing: {}", thing_url_name)).into_response();
    };

    ws.on_upgrade(move |socket| handle_socket(socket, exposed))
}

/// Serves one socket: dispatches JSON-RPC requests and forwards
/// subscription notifications until the peer disconnects.
async fn handle_socket(mut socket: WebSocket, exposed: ExposedThing) {
    let (push_tx, mut push_rx) = mpsc::channel::<String>(64);
    let mut subscriptions: HashMap<String, Subscription> = HashMap::new();

    loop {
        tokio::select! {
            pushed = push_rx.recv() => match pushed {
                Some(text) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let reply = dispatch_request(
                        &exposed,
                        text.as_str(),
                        &push_tx,
                        &mut subscriptions,
                    )
                    .await;

                    if let Some(reply) = reply {
                        let serialized = serde_json::to_string(&reply)
                            .unwrap_or_else(|_| "{}".to_string());
                        if socket.send(Message::Text(serialized.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!("WebSocket receive error: {}", err);
                    break;
                }
            },
        }
    }

    // Socket gone: every subscription bound to it is disposed
    for subscription in subscriptions.values() {
        subscription.dispose();
    }
}

fn notification_observer(
    method: &'static str,
    subscription_id: String,
    name: String,
    push_tx: mpsc::Sender<String>,
) -> Observer {
    Observer::new(move |event| {
        let params = match &event.kind {
            EventKind::PropertyChange { value, .. } => json!({
                "subscription": subscription_id,
                "name": name,
                "value": value,
            }),
            EventKind::Custom { payload, .. } => json!({
                "subscription": subscription_id,
                "name": name,
                "payload": payload,
            }),
            _ => return,
        };

        let notification = super::messages::JsonRpcNotification::new(method, params);
        if let Ok(text) = serde_json::to_string(&notification) {
            let _ = push_tx.try_send(text);
        }
    })
}

async fn dispatch_request(
    exposed: &ExposedThing,
    text: &str,
    push_tx: &mpsc::Sender<String>,
    subscriptions: &mut HashMap<String, Subscription>,
) -> Option<JsonRpcResponse> {
    let request: JsonRpcRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(err) => {
            return Some(JsonRpcResponse::error(
                Value::Null,
                ERR_INVALID_REQUEST,
                format!("Invalid JSON-RPC request: {}", err),
            ));
        }
    };

    let id = request.id.clone().unwrap_or(Value::Null);

    let outcome = match request.method.as_str() {
        "readproperty" => match request.param_str("name") {
            Some(name) => exposed
                .read_property(name)
                .await
                .map(|value| json!({"value": value})),
            None => Err(Error::Protocol("Missing property name".into())),
        },

        "writeproperty" => match request.param_str("name") {
            Some(name) => {
                let value = request.param("value").cloned().unwrap_or(Value::Null);
                exposed
                    .handle_write_property(name, value)
                    .await
                    .map(|()| Value::Null)
            }
            None => Err(Error::Protocol("Missing property name".into())),
        },

        "invokeaction" => match request.param_str("name") {
            Some(name) => {
                let input = request.param("input").cloned();
                exposed
                    .invoke_action(name, input)
                    .await
                    .map(|result| json!({"result": result}))
            }
            None => Err(Error::Protocol("Missing action name".into())),
        },

        "observeproperty" => match request.param_str("name") {
            Some(name) => {
                let subscription_id = Uuid::new_v4().to_string();
                let observer = notification_observer(
                    "observeproperty",
                    subscription_id.clone(),
                    name.to_string(),
                    push_tx.clone(),
                );
                match exposed.on_property_change(name, observer).await {
                    Ok(subscription) => {
                        subscriptions.insert(subscription_id.clone(), subscription);
                        Ok(json!({"subscription": subscription_id}))
                    }
                    Err(err) => Err(err),
                }
            }
            None => Err(Error::Protocol("Missing property name".into())),
        },

        "subscribeevent" => match request.param_str("name") {
            Some(name) => {
                let subscription_id = Uuid::new_v4().to_string();
                let observer = notification_observer(
                    "subscribeevent",
                    subscription_id.clone(),
                    name.to_string(),
                    push_tx.clone(),
                );
                match exposed.on_event(name, observer).await {
                    Ok(subscription) => {
                        subscriptions.insert(subscription_id.clone(), subscription);
                        Ok(json!({"subscription": subscription_id}))
                    }
                    Err(err) => Err(err),
                }
            }
            None => Err(Error::Protocol("Missing event name".into())),
        },

        "unsubscribe" => match request.param_str("subscription") {
            Some(subscription_id) => match subscriptions.remove(subscription_id) {
                Some(subscription) => {
                    subscription.dispose();
                    Ok(Value::Bool(true))
                }
                None => Err(Error::NotFound(format!(
                    "Unknown subscription: {}",
                    subscription_id
                ))),
            },
            None => Err(Error::Protocol("Missing subscription id".into())),
        },

        other => {
            return Some(JsonRpcResponse::error(
                id,
                ERR_METHOD_NOT_FOUND,
                format!("Unknown method: {}", other),
            ));
        }
    };

    // Requests without an id are notifications: no response
    request.id.as_ref()?;

    Some(match outcome {
        Ok(result) => JsonRpcResponse::result(id, result),
        Err(err) => JsonRpcResponse::error(id, ERR_APPLICATION, err.to_string()),
    })
}

#[async_trait]
impl ProtocolServer for WsServer {
    fn protocol(&self) -> Protocol {
        Protocol::Websockets
    }

    fn port(&self) -> Option<u16> {
        Some(self.state.port)
    }

    async fn start(&self, _servient: &Servient) -> Result<()> {
        let mut running = self.state.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let listener = TcpListener::bind(("0.0.0.0", self.state.port))
            .await
            .map_err(|e| {
                Error::State(format!(
                    "Cannot bind WebSocket server on port {}: {}",
                    self.state.port, e
                ))
            })?;

        let token = CancellationToken::new();
        let shutdown = token.clone();
        let app = self.router();

        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(err) = result {
                tracing::error!("WebSocket binding server error: {}", err);
            }
        });

        tracing::info!(port = self.state.port, "WebSocket binding listening");

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
        Ok(())
    }

    fn build_forms(
        &self,
        hostname: &str,
        thing: &Thing,
        interaction: Interaction<'_>,
    ) -> Vec<Form> {
        let href = format!(
            "ws://{}:{}/{}",
            hostname.trim_matches('/'),
            self.state.port,
            thing.url_name()
        );

        let ops = match interaction.kind() {
            InteractionKind::Property => vec![
                InteractionVerb::ReadProperty,
                InteractionVerb::WriteProperty,
                InteractionVerb::ObserveProperty,
            ],
            InteractionKind::Action => vec![InteractionVerb::InvokeAction],
            InteractionKind::Event => vec![
                InteractionVerb::SubscribeEvent,
                InteractionVerb::UnsubscribeEvent,
            ],
        };

        vec![Form::generated(Protocol::Websockets, href, ops)]
    }

    fn build_base_url(&self, hostname: &str, thing: &Thing) -> Result<String> {
        Ok(format!(
            "ws://{}:{}/{}",
            hostname.trim_matches('/'),
            self.state.port,
            thing.url_name()
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
