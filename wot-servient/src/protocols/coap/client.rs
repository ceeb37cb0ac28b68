//! CoAP binding client

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use coap_lite::{
    CoapOption, MessageClass, MessageType, Packet, RequestType, ResponseType,
};
use serde_json::{json, Value};
use tokio::net::UdpSocket;
use url::Url;

use super::{encode_observe, AUTH_OPTION};
use crate::auth::Credential;
use crate::error::{Error, Result};
use crate::events::{finalize, EmittedEvent, EventKind, Observer, Subscription};
use crate::protocols::{pick_href, supports_interaction, InteractionVerb, Protocol, ProtocolClient};
use crate::td::{Form, SecurityScheme, Thing};

/// Default request timeout when the caller does not pass one
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Implementation of the protocol client contract for CoAP
pub struct CoapClient {
    /// OSCORE credentials handed through to the transport layer
    oscore_credentials: Option<PathBuf>,
    credential: RwLock<Option<Arc<Credential>>>,
    request_timeout: Duration,
}

/// Decomposed CoAP href
struct CoapTarget {
    address: String,
    path: Vec<String>,
    queries: Vec<String>,
    href: String,
}

fn parse_target(href: &str) -> Result<CoapTarget> {
    let url = Url::parse(href)?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::Protocol(format!("CoAP href without host: {}", href)))?;
    let port = url.port().unwrap_or(5683);

    let path = url
        .path()
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect();

    let queries = url
        .query()
        .map(|query| query.split('&').map(str::to_string).collect())
        .unwrap_or_default();

    Ok(CoapTarget {
        address: format!("{}:{}", host, port),
        path,
        queries,
        href: href.to_string(),
    })
}

fn is_success(code: &MessageClass) -> bool {
    matches!(
        code,
        MessageClass::Response(
            ResponseType::Created
                | ResponseType::Deleted
                | ResponseType::Valid
                | ResponseType::Changed
                | ResponseType::Content
                | ResponseType::Continue
        )
    )
}

fn build_request(
    method: RequestType,
    target: &CoapTarget,
    payload: Vec<u8>,
    observe: Option<u32>,
    auth: Option<&str>,
) -> Packet {
    let mut packet = Packet::new();
    packet.header.message_id = rand::random::<u16>();
    packet.header.code = MessageClass::Request(method);
    packet.header.set_type(MessageType::Confirmable);
    packet.set_token(rand::random::<u32>().to_be_bytes().to_vec());

    for segment in &target.path {
        packet.add_option(CoapOption::UriPath, segment.clone().into_bytes());
    }
    for query in &target.queries {
        packet.add_option(CoapOption::UriQuery, query.clone().into_bytes());
    }
    if let Some(observe) = observe {
        packet.add_option(CoapOption::Observe, encode_observe(observe));
    }
    if let Some(auth) = auth {
        packet.add_option(CoapOption::Unknown(AUTH_OPTION), auth.as_bytes().to_vec());
    }

    packet.payload = payload;
    packet
}

/// Receives packets until one carries the expected token
async fn receive_matching(
    socket: &UdpSocket,
    token: &[u8],
    timeout: Duration,
) -> Result<Packet> {
    let mut buffer = vec![0u8; 65_536];
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let received = tokio::time::timeout_at(deadline, socket.recv_from(&mut buffer)).await;
        let (length, _) = match received {
            Ok(Ok(received)) => received,
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => return Err(Error::Timeout("CoAP request".to_string())),
        };

        let Ok(packet) = Packet::from_bytes(&buffer[..length]) else {
            continue;
        };
        if packet.get_token() == token {
            return Ok(packet);
        }
    }
}

fn assert_success(packet: &Packet, what: &str) -> Result<()> {
    if !is_success(&packet.header.code) {
        return Err(Error::Protocol(format!(
            "Unsuccessful CoAP response on {}: {:?}",
            what, packet.header.code
        )));
    }
    Ok(())
}

impl CoapClient {
    pub fn new() -> Self {
        Self::with_credentials(None)
    }

    /// A client whose transport is wrapped with the given OSCORE
    /// credentials map
    pub fn with_credentials(oscore_credentials: Option<PathBuf>) -> Self {
        Self {
            oscore_credentials,
            credential: RwLock::new(None),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn oscore_credentials(&self) -> Option<&PathBuf> {
        self.oscore_credentials.as_ref()
    }

    fn credential(&self) -> Option<Arc<Credential>> {
        self.credential.read().ok().and_then(|guard| guard.clone())
    }

    /// Authorization material for the auth option, from the installed
    /// credential
    async fn auth_material(&self, method: &str, href: &str) -> Result<Option<String>> {
        let Some(credential) = self.credential() else {
            return Ok(None);
        };

        let headers = credential.sign(method, href).await?;
        Ok(headers.into_iter().next().map(|(_, value)| value))
    }

    fn pick(&self, td: &Thing, forms: Vec<&Form>, op: Option<InteractionVerb>) -> Result<String> {
        let forms: Vec<Form> = forms.into_iter().cloned().collect();
        pick_href(td, &forms, Protocol::Coap, op)
            .ok_or_else(|| Error::NotSupported("No CoAP form found".to_string()))
    }

    fn timeout(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or(self.request_timeout)
    }

    /// One request/response round trip over an ephemeral socket
    async fn round_trip(
        &self,
        method: RequestType,
        method_name: &str,
        href: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Packet> {
        let target = parse_target(href)?;
        let auth = self.auth_material(method_name, &target.href).await?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let request = build_request(method, &target, payload, None, auth.as_deref());
        let token = request.get_token().to_vec();

        let bytes = request
            .to_bytes()
            .map_err(|e| Error::Protocol(format!("CoAP encode error: {:?}", e)))?;
        socket.send_to(&bytes, target.address.as_str()).await?;

        receive_matching(&socket, &token, timeout).await
    }
}

impl Default for CoapClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolClient for CoapClient {
    fn protocol(&self) -> Protocol {
        Protocol::Coap
    }

    fn is_supported_interaction(&self, td: &Thing, name: &str) -> bool {
        supports_interaction(td, name, Protocol::Coap)
    }

    async fn read_property(
        &self,
        td: &Thing,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let href = self.pick(
            td,
            td.get_property_forms(name),
            Some(InteractionVerb::ReadProperty),
        )?;

        let response = self
            .round_trip(
                RequestType::Get,
                "GET",
                &href,
                Vec::new(),
                self.timeout(timeout),
            )
            .await?;
        assert_success(&response, name)?;

        let body: Value = serde_json::from_slice(&response.payload)?;
        Ok(body.get("value").cloned().unwrap_or(Value::Null))
    }

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

        let payload = serde_json::to_vec(&json!({"value": value}))?;
        let response = self
            .round_trip(
                RequestType::Put,
                "PUT",
                &href,
                payload,
                self.timeout(timeout),
            )
            .await?;
        assert_success(&response, name)
    }

    /// Invocation flow: POST creates the invocation, then an observing GET
    /// on the invocation id polls the status until `done`.
    async fn invoke_action(
        &self,
        td: &Thing,
        name: &str,
        input: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let href = self.pick(
            td,
            td.get_action_forms(name),
            Some(InteractionVerb::InvokeAction),
        )?;
        let timeout = self.timeout(timeout);
        let deadline = tokio::time::Instant::now() + timeout;

        // Create the invocation
        let payload = serde_json::to_vec(&json!({"input": input}))?;
        let created = self
            .round_trip(RequestType::Post, "POST", &href, payload, timeout)
            .await?;
        assert_success(&created, name)?;

        let invocation_id = serde_json::from_slice::<Value>(&created.payload)?
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Protocol("Invocation response without id".to_string()))?;

        // Observe the invocation status until done
        let target = parse_target(&href)?;
        let auth = self.auth_material("GET", &target.href).await?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let status_payload = serde_json::to_vec(&json!({"id": invocation_id}))?;
        let request = build_request(
            RequestType::Get,
            &target,
            status_payload,
            Some(0),
            auth.as_deref(),
        );
        let token = request.get_token().to_vec();

        let bytes = request
            .to_bytes()
            .map_err(|e| Error::Protocol(format!("CoAP encode error: {:?}", e)))?;
        socket.send_to(&bytes, target.address.as_str()).await?;

        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| Error::Timeout(format!("CoAP invocation of {}", name)))?;

            let response = receive_matching(&socket, &token, remaining).await?;
            assert_success(&response, name)?;

            let status: Value = serde_json::from_slice(&response.payload)?;
            if !status.get("done").and_then(Value::as_bool).unwrap_or(false) {
                continue;
            }

            // Deregister the observation before returning
            let deregister = build_request(
                RequestType::Get,
                &target,
                Vec::new(),
                Some(1),
                auth.as_deref(),
            );
            if let Ok(bytes) = deregister.to_bytes() {
                let _ = socket.send_to(&bytes, target.address.as_str()).await;
            }

            if let Some(error) = status.get("error").filter(|e| !e.is_null()) {
                return Err(Error::Handler(
                    error
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| error.to_string()),
                ));
            }
            return Ok(status.get("result").cloned().unwrap_or(Value::Null));
        }
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

        let property = name.to_string();
        self.observe(href, observer, move |body| {
            body.get("value").map(|value| {
                EmittedEvent::new(EventKind::PropertyChange {
                    name: property.clone(),
                    value: value.clone(),
                })
            })
        })
    }

    fn on_event(&self, td: &Thing, name: &str, observer: Observer) -> Result<Subscription> {
        let href = self.pick(
            td,
            td.get_event_forms(name),
            Some(InteractionVerb::SubscribeEvent),
        )?;

        let event_name = name.to_string();
        self.observe(href, observer, move |body| {
            Some(EmittedEvent::new(EventKind::Custom {
                name: event_name.clone(),
                payload: body.get("data").cloned(),
            }))
        })
    }

    fn set_security(&self, scheme: &SecurityScheme, credentials: &Value) -> Result<()> {
        let credential = Credential::build(scheme, credentials)?;
        if let Ok(mut guard) = self.credential.write() {
            *guard = Some(Arc::new(credential));
        }
        Ok(())
    }
}

impl CoapClient {
    /// Registers an observation and forwards notifications until the
    /// subscription is disposed; disposal deregisters and drops the
    /// socket, cancelling any in-flight exchange.
    fn observe(
        &self,
        href: String,
        observer: Observer,
        next_item: impl Fn(&Value) -> Option<EmittedEvent> + Send + 'static,
    ) -> Result<Subscription> {
        let subscription = Subscription::new();
        let token = subscription.token();
        let credential = self.credential();

        let task_observer = observer.clone();
        tokio::spawn(finalize(observer, async move {
            let target = parse_target(&href)?;

            let auth = match &credential {
                Some(credential) => credential
                    .sign("GET", &target.href)
                    .await?
                    .into_iter()
                    .next()
                    .map(|(_, value)| value),
                None => None,
            };

            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            let request =
                build_request(RequestType::Get, &target, Vec::new(), Some(0), auth.as_deref());
            let observe_token = request.get_token().to_vec();

            let bytes = request
                .to_bytes()
                .map_err(|e| Error::Protocol(format!("CoAP encode error: {:?}", e)))?;
            socket.send_to(&bytes, target.address.as_str()).await?;

            let mut buffer = vec![0u8; 65_536];
            loop {
                let received = tokio::select! {
                    _ = token.cancelled() => {
                        let deregister = build_request(
                            RequestType::Get,
                            &target,
                            Vec::new(),
                            Some(1),
                            auth.as_deref(),
                        );
                        if let Ok(bytes) = deregister.to_bytes() {
                            let _ = socket.send_to(&bytes, target.address.as_str()).await;
                        }
                        return Ok(());
                    }
                    received = socket.recv_from(&mut buffer) => received,
                };

                let (length, _peer): (usize, SocketAddr) = received?;
                let Ok(packet) = Packet::from_bytes(&buffer[..length]) else {
                    continue;
                };
                if packet.get_token() != observe_token {
                    continue;
                }

                assert_success(&packet, &target.href)?;

                if packet.payload.is_empty() {
                    continue;
                }
                match serde_json::from_slice::<Value>(&packet.payload) {
                    Ok(body) => {
                        if let Some(item) = next_item(&body) {
                            task_observer.next(item);
                        }
                    }
                    Err(err) => {
                        tracing::warn!("Discarding malformed observation payload: {}", err);
                    }
                }
            }
        }));

        Ok(subscription)
    }
}
