//! HTTP binding server

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::{
    extract::{Path as AxumPath, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::error::{Error, Result};
use crate::events::EventKind;
use crate::exposed::{ExposedThing, ExposedThingSet};
use crate::protocols::{InteractionVerb, Protocol, ProtocolServer};
use crate::servient::Servient;
use crate::td::{Form, Interaction, InteractionKind, SecurityScheme, Thing};

/// Default HTTP binding port
pub const DEFAULT_PORT: u16 = 8080;

/// Default time-to-live for pending action invocations
pub const DEFAULT_ACTION_TTL: Duration = Duration::from_secs(300);

/// Pause before retrying a failed TCP accept on the TLS listener
const TLS_ACCEPT_RETRY: Duration = Duration::from_secs(1);

/// Listener terminating TLS before connections reach the binding router
struct TlsListener {
    inner: TcpListener,
    acceptor: TlsAcceptor,
}

impl axum::serve::Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    // The contract is infallible: keep accepting until some connection
    // completes its handshake.
    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            let (stream, peer) = match self.inner.accept().await {
                Ok(connection) => connection,
                Err(err) => {
                    tracing::warn!("TCP accept failed: {}", err);
                    tokio::time::sleep(TLS_ACCEPT_RETRY).await;
                    continue;
                }
            };

            match self.acceptor.accept(stream).await {
                Ok(tls_stream) => return (tls_stream, peer),
                Err(err) => tracing::debug!(peer = %peer, "TLS handshake rejected: {}", err),
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// Loads the rustls server configuration from the PEM certificate chain
/// and private key named by the binding configuration.
fn tls_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    use rustls_pemfile::{certs, private_key};

    fn open(path: &Path) -> Result<std::io::BufReader<std::fs::File>> {
        let file = std::fs::File::open(path).map_err(|e| {
            Error::Protocol(format!("Cannot open TLS file '{}': {}", path.display(), e))
        })?;
        Ok(std::io::BufReader::new(file))
    }

    let cert_chain: Vec<_> = certs(&mut open(cert_path)?)
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::Protocol(format!("Invalid TLS certificate chain: {}", e)))?;
    if cert_chain.is_empty() {
        return Err(Error::Protocol(format!(
            "No certificates in {}",
            cert_path.display()
        )));
    }

    let key = private_key(&mut open(key_path)?)
        .map_err(|e| Error::Protocol(format!("Invalid TLS private key: {}", e)))?
        .ok_or_else(|| {
            Error::Protocol(format!("No private key in {}", key_path.display()))
        })?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| Error::Protocol(format!("TLS configuration rejected: {}", e)))?;

    Ok(Arc::new(config))
}

struct RunningServer {
    token: CancellationToken,
    server_task: JoinHandle<()>,
    sweep_task: JoinHandle<()>,
}

struct HttpState {
    port: u16,
    form_port: u16,
    tls: Option<(PathBuf, PathBuf)>,
    security_scheme: SecurityScheme,
    action_ttl: Duration,
    things: ExposedThingSet,
    servient: RwLock<Option<Servient>>,
    running: Mutex<Option<RunningServer>>,
    pending_invocations: Mutex<HashMap<Uuid, Instant>>,
}

impl HttpState {
    fn scheme(&self) -> &'static str {
        if self.tls.is_some() {
            "https"
        } else {
            "http"
        }
    }
}

/// HTTP binding server implementation
pub struct HttpServer {
    state: Arc<HttpState>,
}

/// Builder for [`HttpServer`]
pub struct HttpServerBuilder {
    port: u16,
    form_port: Option<u16>,
    tls: Option<(PathBuf, PathBuf)>,
    security_scheme: SecurityScheme,
    action_ttl: Duration,
}

impl HttpServerBuilder {
    pub fn new() -> Self {
        Self {
            port: DEFAULT_PORT,
            form_port: None,
            tls: None,
            security_scheme: SecurityScheme::Nosec,
            action_ttl: DEFAULT_ACTION_TTL,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Port advertised in generated forms, for reverse-proxy deployments
    pub fn form_port(mut self, port: u16) -> Self {
        self.form_port = Some(port);
        self
    }

    pub fn tls(mut self, cert: PathBuf, key: PathBuf) -> Self {
        self.tls = Some((cert, key));
        self
    }

    pub fn security_scheme(mut self, scheme: SecurityScheme) -> Self {
        self.security_scheme = scheme;
        self
    }

    pub fn action_ttl(mut self, ttl: Duration) -> Self {
        self.action_ttl = ttl;
        self
    }

    pub fn build(self) -> HttpServer {
        HttpServer {
            state: Arc::new(HttpState {
                port: self.port,
                form_port: self.form_port.unwrap_or(self.port),
                tls: self.tls,
                security_scheme: self.security_scheme,
                action_ttl: self.action_ttl,
                things: ExposedThingSet::new(),
                servient: RwLock::new(None),
                running: Mutex::new(None),
                pending_invocations: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl Default for HttpServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpServer {
    pub fn builder() -> HttpServerBuilder {
        HttpServerBuilder::new()
    }

    pub fn new(port: u16) -> Self {
        Self::builder().port(port).build()
    }

    fn router(&self) -> Router {
        Router::new()
            .route(
                "/{thing_name}/property/{name}",
                get(read_property).put(write_property),
            )
            .route(
                "/{thing_name}/property/{name}/subscription",
                get(observe_property),
            )
            .route("/{thing_name}/action/{name}", post(invoke_action))
            .route(
                "/{thing_name}/event/{name}/subscription",
                get(observe_event),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }
}

#[async_trait]
impl ProtocolServer for HttpServer {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    fn port(&self) -> Option<u16> {
        Some(self.state.port)
    }

    fn form_port(&self) -> Option<u16> {
        Some(self.state.form_port)
    }

    async fn start(&self, servient: &Servient) -> Result<()> {
        let mut running = self.state.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        *self.state.servient.write().await = Some(servient.clone());

        let listener = TcpListener::bind(("0.0.0.0", self.state.port))
            .await
            .map_err(|e| {
                Error::State(format!(
                    "Cannot bind HTTP server on port {}: {}",
                    self.state.port, e
                ))
            })?;

        let token = CancellationToken::new();
        let app = self.router();

        let shutdown = token.clone();
        let server_task = match &self.state.tls {
            Some((cert, key)) => {
                let config = tls_server_config(cert, key)?;
                let tls_listener = TlsListener {
                    inner: listener,
                    acceptor: TlsAcceptor::from(config),
                };
                tokio::spawn(async move {
                    let result = axum::serve(tls_listener, app)
                        .with_graceful_shutdown(async move { shutdown.cancelled().await })
                        .await;
                    if let Err(err) = result {
                        tracing::error!("HTTP binding server error: {}", err);
                    }
                })
            }
            None => tokio::spawn(async move {
                let result = axum::serve(listener, app)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await;
                if let Err(err) = result {
                    tracing::error!("HTTP binding server error: {}", err);
                }
            }),
        };

        // Periodic purge of pending invocations that outlived their TTL
        let sweep_state = self.state.clone();
        let sweep_token = token.clone();
        let sweep_task = tokio::spawn(async move {
            let interval = sweep_state.action_ttl.min(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = sweep_token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }

                let ttl = sweep_state.action_ttl;
                let mut pending = sweep_state.pending_invocations.lock().await;
                let before = pending.len();
                pending.retain(|_, created| created.elapsed() < ttl);
                let purged = before - pending.len();
                if purged > 0 {
                    tracing::debug!(purged, "Purged expired action invocations");
                }
            }
        });

        tracing::info!(port = self.state.port, scheme = self.state.scheme(), "HTTP binding listening");

        *running = Some(RunningServer {
            token,
            server_task,
            sweep_task,
        });

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut running = self.state.running.lock().await;
        let Some(server) = running.take() else {
            return Ok(());
        };

        server.token.cancel();
        let _ = server.server_task.await;
        let _ = server.sweep_task.await;
        self.state.pending_invocations.lock().await.clear();

        Ok(())
    }

    fn build_forms(
        &self,
        hostname: &str,
        thing: &Thing,
        interaction: Interaction<'_>,
    ) -> Vec<Form> {
        let hostname = hostname.trim_matches('/');
        let base = format!(
            "{}://{}:{}/{}",
            self.state.scheme(),
            hostname,
            self.state.form_port,
            thing.url_name()
        );

        match interaction.kind() {
            InteractionKind::Property => {
                let href = format!("{}/property/{}", base, interaction.url_name());
                vec![
                    Form::generated(
                        Protocol::Http,
                        href.clone(),
                        vec![
                            InteractionVerb::ReadProperty,
                            InteractionVerb::WriteProperty,
                        ],
                    ),
                    Form::generated(
                        Protocol::Http,
                        format!("{}/subscription", href),
                        vec![InteractionVerb::ObserveProperty],
                    ),
                ]
            }
            InteractionKind::Action => vec![Form::generated(
                Protocol::Http,
                format!("{}/action/{}", base, interaction.url_name()),
                vec![InteractionVerb::InvokeAction],
            )],
            InteractionKind::Event => vec![Form::generated(
                Protocol::Http,
                format!("{}/event/{}/subscription", base, interaction.url_name()),
                vec![InteractionVerb::SubscribeEvent],
            )],
        }
    }

    fn build_base_url(&self, hostname: &str, thing: &Thing) -> Result<String> {
        Ok(format!(
            "{}://{}:{}/{}",
            self.state.scheme(),
            hostname.trim_matches('/'),
            self.state.form_port,
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

/// Looks up the target Thing or answers 404
async fn target_thing(state: &HttpState, thing_name: &str) -> std::result::Result<ExposedThing, Response> {
    state.things.find(thing_name).await.ok_or_else(|| {
        Error::NotFound(format!("Unknown Thing: {}", thing_name)).into_response()
    })
}

/// Runs the configured authenticator against the request. The interaction
/// handler is never reached on failure.
async fn check_auth(
    state: &HttpState,
    exposed: &ExposedThing,
    headers: &HeaderMap,
) -> std::result::Result<(), Response> {
    let authenticator = Authenticator::from_scheme(&state.security_scheme);

    let credentials = match state.servient.read().await.as_ref() {
        Some(servient) => servient.retrieve_credentials(exposed.title()).await,
        None => None,
    };

    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    let accepted = authenticator
        .authenticate(credentials.as_ref(), authorization)
        .await
        .unwrap_or(false);

    if accepted {
        return Ok(());
    }

    let mut response = (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "Unauthorized"})),
    )
        .into_response();
    if let Some(challenge) = authenticator.challenge() {
        if let Ok(value) = challenge.parse() {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, value);
        }
    }
    Err(response)
}

async fn read_property(
    State(state): State<Arc<HttpState>>,
    AxumPath((thing_name, name)): AxumPath<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let exposed = match target_thing(&state, &thing_name).await {
        Ok(exposed) => exposed,
        Err(response) => return response,
    };
    if let Err(response) = check_auth(&state, &exposed, &headers).await {
        return response;
    }

    match exposed.read_property(&name).await {
        Ok(value) => Json(json!({"value": value})).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn write_property(
    State(state): State<Arc<HttpState>>,
    AxumPath((thing_name, name)): AxumPath<(String, String)>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let exposed = match target_thing(&state, &thing_name).await {
        Ok(exposed) => exposed,
        Err(response) => return response,
    };
    if let Err(response) = check_auth(&state, &exposed, &headers).await {
        return response;
    }

    // The body is either {"value": v} or a raw JSON value
    let value = match serde_json::from_str::<Value>(&body) {
        Ok(Value::Object(mut obj)) if obj.contains_key("value") => {
            obj.remove("value").unwrap_or(Value::Null)
        }
        Ok(other) => other,
        Err(_) => Value::String(body),
    };

    match exposed.handle_write_property(&name, value).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    }
}

/// Long-poll: subscribe, await the first update, reply and dispose
async fn observe_property(
    State(state): State<Arc<HttpState>>,
    AxumPath((thing_name, name)): AxumPath<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let exposed = match target_thing(&state, &thing_name).await {
        Ok(exposed) => exposed,
        Err(response) => return response,
    };
    if let Err(response) = check_auth(&state, &exposed, &headers).await {
        return response;
    }

    let thing = exposed.thing().await;
    let Some(Interaction::Property(key, _)) = thing.find_interaction(&name) else {
        return Error::NotFound(format!("Unknown property: {}", name)).into_response();
    };
    let key = key.to_string();

    let mut receiver = exposed.events().receiver();
    loop {
        match receiver.recv().await {
            Ok(event) => {
                if let EventKind::PropertyChange { name: prop, value } = &event.kind {
                    if *prop == key {
                        return Json(json!({"value": value})).into_response();
                    }
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                return Error::Protocol("Event stream closed".into()).into_response();
            }
        }
    }
}

async fn invoke_action(
    State(state): State<Arc<HttpState>>,
    AxumPath((thing_name, name)): AxumPath<(String, String)>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let exposed = match target_thing(&state, &thing_name).await {
        Ok(exposed) => exposed,
        Err(response) => return response,
    };
    if let Err(response) = check_auth(&state, &exposed, &headers).await {
        return response;
    }

    let input = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|parsed| match parsed {
            Value::Object(mut obj) => obj.remove("input"),
            other => Some(other),
        });

    // Track the invocation so abandoned ones can be purged after the TTL
    let invocation_id = Uuid::new_v4();
    state
        .pending_invocations
        .lock()
        .await
        .insert(invocation_id, Instant::now());

    let outcome = tokio::time::timeout(
        state.action_ttl,
        exposed.invoke_action(&name, input),
    )
    .await;

    state
        .pending_invocations
        .lock()
        .await
        .remove(&invocation_id);

    match outcome {
        Ok(Ok(result)) => Json(json!({"result": result})).into_response(),
        Ok(Err(err)) => Json(json!({"error": err.to_string()})).into_response(),
        Err(_) => Json(json!({"error": "Action invocation expired"})).into_response(),
    }
}

/// Long-poll: await the next emission of the event
async fn observe_event(
    State(state): State<Arc<HttpState>>,
    AxumPath((thing_name, name)): AxumPath<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let exposed = match target_thing(&state, &thing_name).await {
        Ok(exposed) => exposed,
        Err(response) => return response,
    };
    if let Err(response) = check_auth(&state, &exposed, &headers).await {
        return response;
    }

    let thing = exposed.thing().await;
    let Some(Interaction::Event(key, _)) = thing.find_interaction(&name) else {
        return Error::NotFound(format!("Unknown event: {}", name)).into_response();
    };
    let key = key.to_string();

    let mut receiver = exposed.events().receiver();
    loop {
        match receiver.recv().await {
            Ok(event) => {
                if let EventKind::Custom { name: event_name, payload } = &event.kind {
                    if *event_name == key {
                        return Json(json!({"payload": payload})).into_response();
                    }
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                return Error::Protocol("Event stream closed".into()).into_response();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::td::{DataSchema, Property};

    fn server() -> HttpServer {
        HttpServer::builder().port(8080).build()
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
            .add_event("outOfWater", crate::td::Event::default())
            .unwrap();
        thing
    }

    #[test]
    fn test_property_forms() {
        let server = server();
        let thing = thing();
        let interaction = thing.find_interaction("waterLevel").unwrap();

        let forms = server.build_forms("myhost", &thing, interaction);
        assert_eq!(forms.len(), 2);
        assert_eq!(
            forms[0].href,
            "http://myhost:8080/coffee-machine/property/waterlevel"
        );
        assert!(forms[0].supports(InteractionVerb::ReadProperty));
        assert!(forms[0].supports(InteractionVerb::WriteProperty));
        assert_eq!(
            forms[1].href,
            "http://myhost:8080/coffee-machine/property/waterlevel/subscription"
        );
        assert!(forms[1].supports(InteractionVerb::ObserveProperty));
    }

    #[test]
    fn test_action_and_event_forms() {
        let server = server();
        let thing = thing();

        let action_forms =
            server.build_forms("myhost", &thing, thing.find_interaction("makeDrink").unwrap());
        assert_eq!(action_forms.len(), 1);
        assert_eq!(
            action_forms[0].href,
            "http://myhost:8080/coffee-machine/action/makedrink"
        );

        let event_forms =
            server.build_forms("myhost", &thing, thing.find_interaction("outOfWater").unwrap());
        assert_eq!(event_forms.len(), 1);
        assert_eq!(
            event_forms[0].href,
            "http://myhost:8080/coffee-machine/event/outofwater/subscription"
        );
    }

    #[test]
    fn test_form_port_differs_behind_proxy() {
        let server = HttpServer::builder().port(8080).form_port(443).build();
        let thing = thing();

        let url = server.build_base_url("myhost", &thing).unwrap();
        assert_eq!(url, "http://myhost:443/coffee-machine");
        assert_eq!(server.port(), Some(8080));
        assert_eq!(server.form_port(), Some(443));
    }

    #[tokio::test]
    async fn test_auth_gate_with_bearer_scheme() {
        let server = HttpServer::builder()
            .port(8080)
            .security_scheme(SecurityScheme::from_name("bearer").unwrap())
            .build();

        let servient = crate::servient::Servient::builder()
            .catalogue_port(None)
            .build();
        let mut creds = std::collections::HashMap::new();
        creds.insert(
            "Coffee Machine".to_string(),
            serde_json::json!({"token": "T"}),
        );
        servient.add_credentials(creds).await;
        *server.state.servient.write().await = Some(servient.clone());

        let exposed = servient.add_exposed_thing(thing()).await.unwrap();

        // No header: rejected with a Bearer challenge
        let rejected = check_auth(&server.state, &exposed, &HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            rejected
                .headers()
                .get(header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok()),
            Some("Bearer")
        );

        // Wrong token: rejected
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer X".parse().unwrap());
        assert!(check_auth(&server.state, &exposed, &headers).await.is_err());

        // Matching token: accepted
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer T".parse().unwrap());
        assert!(check_auth(&server.state, &exposed, &headers).await.is_ok());
    }

    #[tokio::test]
    async fn test_thing_routing_registry() {
        let server = server();
        let exposed = ExposedThing::new(
            std::sync::Weak::new(),
            Arc::new(crate::persistence::NopWriter),
            thing(),
        );

        server.add_exposed_thing(exposed).await;
        assert!(server.contains_thing("coffee-machine").await);

        server.remove_exposed_thing("Coffee Machine").await;
        assert!(!server.contains_thing("coffee-machine").await);
    }
}
