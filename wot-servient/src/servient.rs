//! The servient: a WoT runtime that is client and server at once
//!
//! Owns the protocol servers and clients, the registry of exposed Things,
//! the credential store and the catalogue. Regenerates TD forms whenever
//! the set of running servers or enabled Things changes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use crate::catalogue::CatalogueHandle;
use crate::config::{BindingMode, Config};
use crate::error::{Error, Result};
use crate::exposed::{ExposedThing, ExposedThingSet};
use crate::persistence::{MemoryWriter, NopWriter, PersistenceWriter};
use crate::protocols::coap::{CoapClient, CoapServer};
use crate::protocols::http::{HttpClient, HttpServer};
use crate::protocols::mqtt::{MqttClient, MqttServer};
use crate::protocols::ws::{WsClient, WsServer};
use crate::protocols::{Protocol, SharedClient, SharedServer};
use crate::td::{url_name, SecurityScheme, Thing};
use crate::wot::Wot;

/// Guesses the hostname to advertise in generated forms: the primary IPv4
/// address of the machine, falling back to loopback.
fn default_hostname() -> String {
    let guess = std::net::UdpSocket::bind("0.0.0.0:0").and_then(|socket| {
        socket.connect(("10.255.255.255", 1))?;
        socket.local_addr()
    });

    match guess {
        Ok(addr) => addr.ip().to_string(),
        Err(_) => "127.0.0.1".to_string(),
    }
}

pub(crate) struct ServientInner {
    hostname: String,
    servers: RwLock<BTreeMap<Protocol, SharedServer>>,
    clients: RwLock<BTreeMap<Protocol, SharedClient>>,
    things: ExposedThingSet,
    enabled: RwLock<HashSet<String>>,
    credentials: RwLock<HashMap<String, Value>>,
    catalogue_port: RwLock<Option<u16>>,
    catalogue: Mutex<Option<CatalogueHandle>>,
    running: AtomicBool,
    lifecycle: Mutex<()>,
    writer: Arc<dyn PersistenceWriter>,
    create_default_forms: bool,
    request_timeout: Duration,
}

/// Runtime object binding protocol servers, protocol clients, exposed
/// Things, the credential store and the catalogue. Cheap to clone.
#[derive(Clone)]
pub struct Servient {
    pub(crate) inner: Arc<ServientInner>,
}

/// Builder for a [`Servient`]
pub struct ServientBuilder {
    hostname: Option<String>,
    catalogue_port: Option<u16>,
    servers: Vec<SharedServer>,
    clients: Vec<SharedClient>,
    writer: Option<Arc<dyn PersistenceWriter>>,
    create_default_forms: bool,
    request_timeout: Duration,
}

impl ServientBuilder {
    pub fn new() -> Self {
        Self {
            hostname: None,
            catalogue_port: Some(9090),
            servers: Vec::new(),
            clients: Vec::new(),
            writer: None,
            create_default_forms: true,
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Catalogue port; `None` disables the catalogue
    pub fn catalogue_port(mut self, port: Option<u16>) -> Self {
        self.catalogue_port = port;
        self
    }

    pub fn server(mut self, server: SharedServer) -> Self {
        self.servers.push(server);
        self
    }

    pub fn client(mut self, client: SharedClient) -> Self {
        self.clients.push(client);
        self
    }

    pub fn writer(mut self, writer: Arc<dyn PersistenceWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Disables automatic form generation on start
    pub fn create_default_forms(mut self, create: bool) -> Self {
        self.create_default_forms = create;
        self
    }

    /// Default soft timeout for consumed interactions
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn build(self) -> Servient {
        let mut clients: BTreeMap<Protocol, SharedClient> = BTreeMap::new();

        if self.clients.is_empty() {
            // Default client set: one per supported binding
            clients.insert(Protocol::Http, Arc::new(HttpClient::new()));
            clients.insert(Protocol::Websockets, Arc::new(WsClient::new()));
            clients.insert(Protocol::Coap, Arc::new(CoapClient::new()));
            clients.insert(Protocol::Mqtt, Arc::new(MqttClient::new()));
        } else {
            for client in self.clients {
                clients.insert(client.protocol(), client);
            }
        }

        let mut servers = BTreeMap::new();
        for server in self.servers {
            servers.insert(server.protocol(), server);
        }

        Servient {
            inner: Arc::new(ServientInner {
                hostname: self.hostname.unwrap_or_else(default_hostname),
                servers: RwLock::new(servers),
                clients: RwLock::new(clients),
                things: ExposedThingSet::new(),
                enabled: RwLock::new(HashSet::new()),
                credentials: RwLock::new(HashMap::new()),
                catalogue_port: RwLock::new(self.catalogue_port),
                catalogue: Mutex::new(None),
                running: AtomicBool::new(false),
                lifecycle: Mutex::new(()),
                writer: self.writer.unwrap_or_else(|| Arc::new(NopWriter)),
                create_default_forms: self.create_default_forms,
                request_timeout: self.request_timeout,
            }),
        }
    }
}

impl Default for ServientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Servient {
    pub fn builder() -> ServientBuilder {
        ServientBuilder::new()
    }

    /// Assembles a servient from the loaded configuration: north-bound
    /// servers, south-bound client security, credentials and persistence.
    pub fn from_config(config: &Config) -> Result<Servient> {
        let mut builder = Servient::builder()
            .catalogue_port(config.servient.catalogue)
            .request_timeout(Duration::from_secs(config.servient.request_timeout_secs));

        if let Some(hostname) = &config.servient.hostname {
            builder = builder.hostname(hostname.clone());
        }

        if config.database.enabled {
            builder = builder.writer(Arc::new(MemoryWriter::new()));
        }

        let nb = &config.binding_nb;
        let scheme = SecurityScheme::from_name(&nb.security.scheme).ok_or_else(|| {
            Error::NotSupported(format!("Unknown security scheme: {}", nb.security.scheme))
        })?;

        for mode in &nb.modes {
            match mode {
                BindingMode::H => {
                    let mut server = HttpServer::builder()
                        .port(nb.http_port)
                        .security_scheme(scheme.clone())
                        .action_ttl(Duration::from_secs(nb.action_ttl_secs));
                    if let Some(proxy_port) = nb.http_proxy_port {
                        server = server.form_port(proxy_port);
                    }
                    if let (Some(cert), Some(key)) = (&nb.server_cert, &nb.server_key) {
                        server = server.tls(cert.clone(), key.clone());
                    }
                    builder = builder.server(Arc::new(server.build()));
                }
                BindingMode::U => {
                    builder = builder.server(Arc::new(CoapServer::new(
                        nb.coap_port,
                        scheme.clone(),
                        nb.oscore_credentials_map.clone(),
                    )));
                }
                BindingMode::M => {
                    let broker_url = nb.broker_url.clone().ok_or_else(|| {
                        Error::NotSupported("MQTT binding enabled without broker URL".into())
                    })?;
                    let broker_url = merge_broker_credentials(
                        &broker_url,
                        nb.security.username.as_deref(),
                        nb.security.password.as_deref(),
                    )?;
                    builder = builder.server(Arc::new(
                        MqttServer::new(broker_url)
                            .servient_id(url_name(&config.servient.name))
                            .ca_file(nb.mqtt_ca_file.clone()),
                    ));
                }
                BindingMode::W => {
                    builder = builder.server(Arc::new(WsServer::new(
                        nb.ws_port.unwrap_or(nb.http_port + 1),
                    )));
                }
            }
        }

        let servient = builder.build();

        // North-bound server credentials keyed by the servient name
        let mut creds = serde_json::Map::new();
        if let (Some(username), Some(password)) =
            (&nb.security.username, &nb.security.password)
        {
            creds.insert("username".into(), Value::String(username.clone()));
            creds.insert("password".into(), Value::String(password.clone()));
        }
        if let Some(token) = &nb.security.token {
            creds.insert("token".into(), Value::String(token.clone()));
        }
        if !creds.is_empty() {
            let mut store = HashMap::new();
            store.insert(config.servient.name.clone(), Value::Object(creds));
            servient.add_credentials_blocking(store);
        }

        // South-bound client security
        let sb = &config.binding_sb;
        for (protocol, security) in [
            (Protocol::Http, &sb.http),
            (Protocol::Coap, &sb.coap),
            (Protocol::Mqtt, &sb.mqtt),
        ] {
            if security.scheme == "nosec" {
                continue;
            }
            let scheme = SecurityScheme::from_name(&security.scheme).ok_or_else(|| {
                Error::NotSupported(format!("Unknown security scheme: {}", security.scheme))
            })?;

            let mut creds = serde_json::Map::new();
            for (key, value) in [
                ("username", &security.username),
                ("password", &security.password),
                ("token", &security.token),
                ("clientId", &security.client_id),
                ("clientSecret", &security.client_secret),
                ("holder_url", &security.holder_url),
                ("requester", &security.requester),
            ] {
                if let Some(value) = value {
                    creds.insert(key.into(), Value::String(value.clone()));
                }
            }

            if let Some(client) = servient.client_blocking(protocol) {
                client.set_security(&scheme, &Value::Object(creds))?;
            }
        }

        Ok(servient)
    }

    pub(crate) fn downgrade(&self) -> Weak<ServientInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<ServientInner>) -> Option<Servient> {
        weak.upgrade().map(|inner| Servient { inner })
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    pub(crate) fn writer(&self) -> Arc<dyn PersistenceWriter> {
        self.inner.writer.clone()
    }

    /// Default soft timeout used by consumed interactions
    pub fn request_timeout(&self) -> Duration {
        self.inner.request_timeout
    }

    fn assert_stopped(&self) -> Result<()> {
        if self.is_running() {
            return Err(Error::State(
                "Attempted to modify the servient while it was running".to_string(),
            ));
        }
        Ok(())
    }

    /// Adds a protocol binding server; only while stopped
    pub async fn add_server(&self, server: SharedServer) -> Result<()> {
        self.assert_stopped()?;
        self.inner.servers.write().await.insert(server.protocol(), server);
        Ok(())
    }

    /// Removes a protocol binding server; only while stopped
    pub async fn remove_server(&self, protocol: Protocol) -> Result<()> {
        self.assert_stopped()?;
        self.inner.servers.write().await.remove(&protocol);
        Ok(())
    }

    /// Adds a protocol binding client; only while stopped
    pub async fn add_client(&self, client: SharedClient) -> Result<()> {
        self.assert_stopped()?;
        self.inner.clients.write().await.insert(client.protocol(), client);
        Ok(())
    }

    /// Removes a protocol binding client; only while stopped
    pub async fn remove_client(&self, protocol: Protocol) -> Result<()> {
        self.assert_stopped()?;
        self.inner.clients.write().await.remove(&protocol);
        Ok(())
    }

    pub async fn servers(&self) -> BTreeMap<Protocol, SharedServer> {
        self.inner.servers.read().await.clone()
    }

    pub async fn clients(&self) -> BTreeMap<Protocol, SharedClient> {
        self.inner.clients.read().await.clone()
    }

    fn client_blocking(&self, protocol: Protocol) -> Option<SharedClient> {
        self.inner
            .clients
            .try_read()
            .ok()
            .and_then(|clients| clients.get(&protocol).cloned())
    }

    fn add_credentials_blocking(&self, credentials: HashMap<String, Value>) {
        if let Ok(mut store) = self.inner.credentials.try_write() {
            for (title, creds) in credentials {
                merge_credentials(&mut store, title, creds);
            }
        }
    }

    /// Sets the catalogue port; only while stopped
    pub async fn set_catalogue_port(&self, port: Option<u16>) -> Result<()> {
        self.assert_stopped()?;
        *self.inner.catalogue_port.write().await = port;
        Ok(())
    }

    pub async fn catalogue_port(&self) -> Option<u16> {
        *self.inner.catalogue_port.read().await
    }

    /// Builds an ExposedThing from the given Thing and registers it.
    /// Things start disabled.
    pub async fn add_exposed_thing(&self, thing: Thing) -> Result<ExposedThing> {
        thing.validate()?;
        let exposed = ExposedThing::new(self.downgrade(), self.inner.writer.clone(), thing);
        self.inner.things.add(exposed.clone()).await?;
        Ok(exposed)
    }

    /// Disables and removes an ExposedThing
    pub async fn remove_exposed_thing(&self, name: &str) -> Result<()> {
        let exposed = self.get_exposed_thing(name).await?;
        let title = exposed.title().to_string();

        if self.inner.enabled.read().await.contains(&title) {
            self.disable_exposed_thing(&title).await?;
        }

        self.inner.things.remove(&title).await;
        Ok(())
    }

    /// Finds an ExposedThing by title or URL-safe name
    pub async fn get_exposed_thing(&self, name: &str) -> Result<ExposedThing> {
        self.inner
            .things
            .find(name)
            .await
            .ok_or_else(|| Error::NotFound(format!("Unknown ExposedThing: {}", name)))
    }

    pub async fn exposed_things(&self) -> Vec<ExposedThing> {
        self.inner.things.all().await
    }

    /// Things currently routed by the servers
    pub async fn enabled_exposed_things(&self) -> Vec<ExposedThing> {
        let enabled = self.inner.enabled.read().await;
        let mut things: Vec<ExposedThing> = self
            .inner
            .things
            .all()
            .await
            .into_iter()
            .filter(|thing| enabled.contains(thing.title()))
            .collect();
        things.sort_by(|a, b| a.title().cmp(b.title()));
        things
    }

    /// Enables a Thing: every server starts routing it and regenerates
    /// its forms.
    pub async fn enable_exposed_thing(&self, name: &str) -> Result<()> {
        let exposed = self.get_exposed_thing(name).await?;

        let servers = self.servers().await;
        for server in servers.values() {
            server.add_exposed_thing(exposed.clone()).await;
            self.regenerate_server_forms(server).await;
        }

        self.inner
            .enabled
            .write()
            .await
            .insert(exposed.title().to_string());
        Ok(())
    }

    /// Disables a Thing: servers stop routing it and drop its forms.
    pub async fn disable_exposed_thing(&self, name: &str) -> Result<()> {
        let exposed = self.get_exposed_thing(name).await?;
        let title = exposed.title().to_string();

        if !self.inner.enabled.read().await.contains(&title) {
            return Err(Error::State(format!(
                "ExposedThing {} is already disabled",
                title
            )));
        }

        let servers = self.servers().await;
        for server in servers.values() {
            server.remove_exposed_thing(&title).await;
            self.regenerate_server_forms(server).await;
        }

        self.inner.enabled.write().await.remove(&title);
        Ok(())
    }

    /// Removes and rebuilds the generated forms of one server across all
    /// Things. TD-declared forms are never touched.
    async fn regenerate_server_forms(&self, server: &SharedServer) {
        let protocol = server.protocol();

        for exposed in self.inner.things.all().await {
            let routed = server.contains_thing(exposed.title()).await;
            let snapshot = exposed.thing().await;

            let mut new_forms: Vec<(String, Vec<crate::td::Form>)> = Vec::new();
            if routed {
                for interaction in snapshot.interactions() {
                    let forms =
                        server.build_forms(&self.inner.hostname, &snapshot, interaction);
                    new_forms.push((interaction.name().to_string(), forms));
                }
            }

            exposed
                .with_thing_mut(|thing| {
                    thing.remove_protocol_forms(protocol);
                    for (name, forms) in new_forms {
                        for form in forms {
                            // Duplicate ids converge to a single form
                            let _ = thing.add_generated_form(&name, form);
                        }
                    }
                })
                .await;
        }
    }

    /// Cleans and regenerates every generated form. Idempotent: repeated
    /// refreshes converge to the same form set.
    pub async fn refresh_forms(&self) {
        for exposed in self.inner.things.all().await {
            exposed
                .with_thing_mut(|thing| thing.clean_generated_forms())
                .await;
        }

        let servers = self.servers().await;
        for server in servers.values() {
            self.regenerate_server_forms(server).await;
        }
    }

    /// Base URL of a Thing on one of the currently attached servers. The
    /// TD-declared base wins; otherwise HTTP is preferred, then the
    /// lowest-ordered protocol.
    pub async fn get_thing_base_url(&self, exposed: &ExposedThing) -> Result<Option<String>> {
        let thing = exposed.thing().await;

        if let Some(base) = &thing.base {
            return Ok(Some(base.clone()));
        }

        if !self.inner.things.contains(exposed.title()).await {
            return Err(Error::NotFound(format!(
                "Unknown ExposedThing: {}",
                exposed.title()
            )));
        }

        let servers = self.servers().await;
        if servers.is_empty() {
            return Ok(None);
        }

        let server = servers
            .get(&Protocol::Http)
            .or_else(|| servers.values().next())
            .expect("servers is non-empty");

        server
            .build_base_url(&self.inner.hostname, &thing)
            .map(Some)
    }

    /// Merges per-Thing credential maps into the store
    pub async fn add_credentials(&self, credentials: HashMap<String, Value>) {
        let mut store = self.inner.credentials.write().await;
        for (title, creds) in credentials {
            merge_credentials(&mut store, title, creds);
        }
    }

    /// Snapshot of the credentials stored for a Thing title
    pub async fn retrieve_credentials(&self, title: &str) -> Option<Value> {
        self.inner.credentials.read().await.get(title).cloned()
    }

    /// Selects the binding client for an interaction. Pure function of the
    /// TD content and the attached client set.
    pub async fn select_client(&self, td: &Thing, name: &str) -> Result<SharedClient> {
        let clients = self.clients().await;
        select_client_from(clients.values().cloned().collect(), td, name)
    }

    /// Starts the servers and the catalogue and returns the WoT entry point
    pub async fn start(&self) -> Result<Wot> {
        let _guard = self.inner.lifecycle.lock().await;

        if self.inner.running.load(Ordering::Acquire) {
            return Ok(Wot::new(self.clone()));
        }

        if self.inner.create_default_forms {
            self.refresh_forms().await;
        }

        let servers = self.servers().await;
        let mut started: Vec<SharedServer> = Vec::new();
        for server in servers.values() {
            if let Err(err) = server.start(self).await {
                // A failed start leaves the servient unmodified
                for started_server in started {
                    let _ = started_server.stop().await;
                }
                return Err(err);
            }
            started.push(server.clone());
        }

        let catalogue_port = *self.inner.catalogue_port.read().await;
        if let Some(port) = catalogue_port {
            match crate::catalogue::serve(self.clone(), port).await {
                Ok(handle) => {
                    *self.inner.catalogue.lock().await = Some(handle);
                }
                Err(err) => {
                    for started_server in started {
                        let _ = started_server.stop().await;
                    }
                    return Err(err);
                }
            }
        }

        self.inner.running.store(true, Ordering::Release);
        tracing::info!(hostname = %self.inner.hostname, "Servient started");

        Ok(Wot::new(self.clone()))
    }

    /// Stops the catalogue and all servers, in reverse start order. Server
    /// stops run concurrently but are awaited.
    pub async fn shutdown(&self) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;

        if let Some(handle) = self.inner.catalogue.lock().await.take() {
            handle.stop().await;
        }

        let servers = self.servers().await;
        let stops = servers.values().map(|server| server.stop());
        for result in futures::future::join_all(stops).await {
            if let Err(err) = result {
                tracing::warn!("Error stopping server: {}", err);
            }
        }

        self.inner.running.store(false, Ordering::Release);
        tracing::info!("Servient stopped");

        Ok(())
    }
}

fn merge_credentials(store: &mut HashMap<String, Value>, title: String, creds: Value) {
    match (store.get_mut(&title), creds) {
        (Some(Value::Object(existing)), Value::Object(new)) => {
            for (key, value) in new {
                existing.insert(key, value);
            }
        }
        (_, creds) => {
            store.insert(title, creds);
        }
    }
}

/// Inserts `user:pass` into the authority of a broker URL
fn merge_broker_credentials(
    broker_url: &str,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<String> {
    let (Some(username), Some(password)) = (username, password) else {
        return Ok(broker_url.to_string());
    };

    let mut url = url::Url::parse(broker_url)?;
    url.set_username(username)
        .map_err(|_| Error::Protocol(format!("Cannot set credentials on {}", broker_url)))?;
    url.set_password(Some(password))
        .map_err(|_| Error::Protocol(format!("Cannot set credentials on {}", broker_url)))?;
    Ok(url.to_string())
}

/// Default client selection policy: per-verb protocol preference lists,
/// intersected with the clients that actually support the interaction.
pub(crate) fn select_client_from(
    clients: Vec<SharedClient>,
    td: &Thing,
    name: &str,
) -> Result<SharedClient> {
    use crate::td::InteractionKind;

    let kind = td
        .find_interaction(name)
        .map(|intrct| intrct.kind())
        .ok_or_else(|| Error::NotFound(format!("Unknown interaction: {}", name)))?;

    let preferences: &[Protocol] = match kind {
        InteractionKind::Property => &[
            Protocol::Mqtt,
            Protocol::Http,
            Protocol::Coap,
            Protocol::Websockets,
        ],
        InteractionKind::Action => &[
            Protocol::Http,
            Protocol::Websockets,
            Protocol::Mqtt,
            Protocol::Coap,
        ],
        InteractionKind::Event => &[
            Protocol::Websockets,
            Protocol::Mqtt,
            Protocol::Coap,
            Protocol::Http,
        ],
    };

    let supported: Vec<SharedClient> = clients
        .into_iter()
        .filter(|client| client.is_supported_interaction(td, name))
        .collect();

    for protocol in preferences {
        if let Some(client) = supported
            .iter()
            .find(|client| client.protocol() == *protocol)
        {
            return Ok(client.clone());
        }
    }

    supported.into_iter().next().ok_or_else(|| {
        Error::NotSupported(format!("No client supports interaction: {}", name))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::InteractionVerb;
    use crate::td::{DataSchema, Form, Property};

    fn td_with_forms(schemes: &[&str]) -> Thing {
        let mut thing = Thing::new("remote");
        let mut property = Property::new(DataSchema::default(), true);
        for scheme in schemes {
            property.td_forms.push(Form::declared(
                format!("{}://host/x/property/p", scheme),
                vec![
                    InteractionVerb::ReadProperty,
                    InteractionVerb::WriteProperty,
                    InteractionVerb::ObserveProperty,
                ],
            ));
        }
        thing.properties.insert("p".into(), property);

        let mut action = crate::td::Action::default();
        for scheme in schemes {
            action.td_forms.push(Form::declared(
                format!("{}://host/x/action/a", scheme),
                vec![InteractionVerb::InvokeAction],
            ));
        }
        thing.actions.insert("a".into(), action);
        thing
    }

    fn default_servient() -> Servient {
        Servient::builder().catalogue_port(None).build()
    }

    #[tokio::test]
    async fn test_property_prefers_mqtt() {
        let servient = default_servient();
        let td = td_with_forms(&["http", "mqtt", "coap"]);

        let client = servient.select_client(&td, "p").await.unwrap();
        assert_eq!(client.protocol(), Protocol::Mqtt);
    }

    #[tokio::test]
    async fn test_action_prefers_http() {
        let servient = default_servient();
        let td = td_with_forms(&["mqtt", "http", "coap"]);

        let client = servient.select_client(&td, "a").await.unwrap();
        assert_eq!(client.protocol(), Protocol::Http);
    }

    #[tokio::test]
    async fn test_selection_is_deterministic() {
        let servient = default_servient();
        let td = td_with_forms(&["coap", "mqtt"]);

        let first = servient.select_client(&td, "p").await.unwrap().protocol();
        for _ in 0..10 {
            assert_eq!(
                servient.select_client(&td, "p").await.unwrap().protocol(),
                first
            );
        }
    }

    #[tokio::test]
    async fn test_no_supported_client_fails() {
        let servient = default_servient();
        // Scheme nobody owns
        let td = td_with_forms(&["ftp"]);

        let err = servient.select_client(&td, "p").await.unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[tokio::test]
    async fn test_unknown_interaction_fails() {
        let servient = default_servient();
        let td = td_with_forms(&["http"]);

        let err = servient.select_client(&td, "missing").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_things_start_disabled() {
        let servient = default_servient();
        let exposed = servient.add_exposed_thing(Thing::new("t")).await.unwrap();

        assert!(servient.enabled_exposed_things().await.is_empty());
        assert_eq!(servient.exposed_things().await.len(), 1);
        assert_eq!(exposed.title(), "t");
    }

    #[tokio::test]
    async fn test_disable_requires_enabled() {
        let servient = default_servient();
        servient.add_exposed_thing(Thing::new("t")).await.unwrap();

        let err = servient.disable_exposed_thing("t").await.unwrap_err();
        assert!(matches!(err, Error::State(_)));
    }

    #[tokio::test]
    async fn test_credential_merge_by_title() {
        let servient = default_servient();

        let mut first = HashMap::new();
        first.insert("t".to_string(), serde_json::json!({"username": "ada"}));
        servient.add_credentials(first).await;

        let mut second = HashMap::new();
        second.insert("t".to_string(), serde_json::json!({"password": "pw"}));
        servient.add_credentials(second).await;

        let creds = servient.retrieve_credentials("t").await.unwrap();
        assert_eq!(creds["username"], "ada");
        assert_eq!(creds["password"], "pw");
    }

    #[tokio::test]
    async fn test_topology_frozen_while_running() {
        let servient = default_servient();
        // Mark as running without opening sockets
        servient.inner.running.store(true, Ordering::Release);

        let err = servient
            .add_client(Arc::new(HttpClient::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::State(_)));

        let err = servient.remove_server(Protocol::Http).await.unwrap_err();
        assert!(matches!(err, Error::State(_)));
    }

    #[tokio::test]
    async fn test_enable_generates_forms_and_disable_drops_them() {
        let servient = Servient::builder()
            .hostname("testhost")
            .catalogue_port(None)
            .build();
        servient
            .add_server(Arc::new(HttpServer::new(8080)))
            .await
            .unwrap();

        let mut thing = Thing::new("Sensor");
        thing
            .add_property(
                "temp",
                Property::new(DataSchema::default(), true),
            )
            .unwrap();
        let exposed = servient.add_exposed_thing(thing).await.unwrap();

        // Disabled Things carry no generated forms
        servient.refresh_forms().await;
        assert!(exposed.thing().await.get_forms("temp").is_empty());

        servient.enable_exposed_thing("Sensor").await.unwrap();
        let forms: Vec<String> = exposed
            .thing()
            .await
            .get_forms("temp")
            .iter()
            .map(|form| form.href.clone())
            .collect();
        assert!(!forms.is_empty());
        assert!(forms.iter().all(|href| href.starts_with("http://testhost:8080/")));

        // Refresh is idempotent: the same form set results
        servient.refresh_forms().await;
        servient.refresh_forms().await;
        let after: Vec<String> = exposed
            .thing()
            .await
            .get_forms("temp")
            .iter()
            .map(|form| form.href.clone())
            .collect();
        assert_eq!(forms, after);

        servient.disable_exposed_thing("Sensor").await.unwrap();
        assert!(exposed.thing().await.get_forms("temp").is_empty());
        assert!(servient.enabled_exposed_things().await.is_empty());
    }

    #[tokio::test]
    async fn test_expose_destroy_expose_converges() {
        let servient = Servient::builder()
            .hostname("testhost")
            .catalogue_port(None)
            .build();
        servient
            .add_server(Arc::new(HttpServer::new(8080)))
            .await
            .unwrap();

        let mut thing = Thing::new("Sensor");
        thing
            .add_property("temp", Property::new(DataSchema::default(), true))
            .unwrap();
        servient.add_exposed_thing(thing.clone()).await.unwrap();

        servient.enable_exposed_thing("Sensor").await.unwrap();
        let exposed = servient.get_exposed_thing("Sensor").await.unwrap();
        let first: Vec<String> = exposed
            .thing()
            .await
            .get_forms("temp")
            .iter()
            .map(|form| form.href.clone())
            .collect();

        // Destroy removes the Thing entirely; re-adding and exposing
        // again restores the same routing state
        servient.remove_exposed_thing("Sensor").await.unwrap();
        assert!(servient.exposed_things().await.is_empty());

        servient.add_exposed_thing(thing).await.unwrap();
        servient.enable_exposed_thing("Sensor").await.unwrap();
        let exposed = servient.get_exposed_thing("Sensor").await.unwrap();
        let second: Vec<String> = exposed
            .thing()
            .await
            .get_forms("temp")
            .iter()
            .map(|form| form.href.clone())
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_merge_broker_credentials() {
        let merged =
            merge_broker_credentials("mqtt://broker:1883", Some("u"), Some("p")).unwrap();
        assert_eq!(merged, "mqtt://u:p@broker:1883");

        let unchanged = merge_broker_credentials("mqtt://broker:1883", None, None).unwrap();
        assert_eq!(unchanged, "mqtt://broker:1883");
    }
}
