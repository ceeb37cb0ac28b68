//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following
//! precedence (highest to lowest):
//! 1. Environment variables (prefix: WOT_)
//! 2. An explicit YAML or JSON file passed by the caller
//! 3. ./servient.yml in the current working directory
//! 4. Default values

use figment::{
    providers::{Env, Format, Json, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;

fn default_catalogue_port() -> Option<u16> {
    Some(9090)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_coap_port() -> u16 {
    5683
}

fn default_scheme() -> String {
    "nosec".to_string()
}

fn default_action_ttl_secs() -> u64 {
    300
}

fn default_msg_ttl_secs() -> u64 {
    15
}

fn default_request_timeout_secs() -> u64 {
    60
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Servient-level configuration
    #[serde(default)]
    pub servient: ServientConfig,

    /// North-bound bindings: the servers this servient exposes
    #[serde(default)]
    pub binding_nb: NorthboundConfig,

    /// South-bound bindings: the clients this servient consumes with
    #[serde(default)]
    pub binding_sb: SouthboundConfig,

    /// Remote Things to consume at startup
    #[serde(default)]
    pub remote_things: Vec<RemoteThingConfig>,

    /// Persistence configuration
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Servient-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServientConfig {
    /// Servient name; also the default credential key for the exposed Things
    #[serde(default)]
    pub name: String,

    /// Hostname advertised in generated forms; guessed when absent
    #[serde(default)]
    pub hostname: Option<String>,

    /// TD catalogue port; `null` disables the catalogue
    #[serde(default = "default_catalogue_port")]
    pub catalogue: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Default soft timeout for consumed interactions, seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServientConfig {
    fn default() -> Self {
        Self {
            name: "wot-servient".to_string(),
            hostname: None,
            catalogue: default_catalogue_port(),
            log_level: default_log_level(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Security material for one binding side
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Security scheme tag (nosec, basic, bearer, oauth2, oidc4vp, ...)
    #[serde(default = "default_scheme")]
    pub scheme: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub token: Option<String>,

    /// OAuth2 token introspection endpoint (inbound) or token endpoint
    /// (outbound client flow)
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default)]
    pub client_secret: Option<String>,

    /// OIDC4VP holder that issues per-request tokens
    #[serde(default)]
    pub holder_url: Option<String>,

    /// Requester identity presented to the OIDC4VP holder
    #[serde(default)]
    pub requester: Option<String>,
}

/// North-bound binding modes: H = HTTP, U = CoAP over UDP, M = MQTT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindingMode {
    H,
    U,
    M,
    W,
}

/// Configuration of the servers this servient runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NorthboundConfig {
    /// Enabled server bindings
    #[serde(default)]
    pub modes: Vec<BindingMode>,

    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Port advertised in HTTP forms when behind a proxy
    #[serde(default)]
    pub http_proxy_port: Option<u16>,

    #[serde(default = "default_coap_port")]
    pub coap_port: u16,

    /// WebSocket port; defaults to the HTTP port + 1 when absent
    #[serde(default)]
    pub ws_port: Option<u16>,

    /// MQTT broker URL, possibly carrying user:pass authority
    #[serde(default)]
    pub broker_url: Option<String>,

    /// PEM certificate chain enabling TLS on the HTTP binding
    #[serde(default)]
    pub server_cert: Option<PathBuf>,

    /// PEM private key enabling TLS on the HTTP binding
    #[serde(default)]
    pub server_key: Option<PathBuf>,

    /// CA file for TLS towards the MQTT broker
    #[serde(default)]
    pub mqtt_ca_file: Option<PathBuf>,

    /// OSCORE credentials map for the CoAP binding
    #[serde(default)]
    pub oscore_credentials_map: Option<PathBuf>,

    /// Inbound security scheme + server-side credentials
    #[serde(default)]
    pub security: SecurityConfig,

    /// Action invocation time-to-live, seconds
    #[serde(default = "default_action_ttl_secs")]
    pub action_ttl_secs: u64,
}

impl Default for NorthboundConfig {
    fn default() -> Self {
        Self {
            modes: Vec::new(),
            http_port: default_http_port(),
            http_proxy_port: None,
            coap_port: default_coap_port(),
            ws_port: None,
            broker_url: None,
            server_cert: None,
            server_key: None,
            mqtt_ca_file: None,
            oscore_credentials_map: None,
            security: SecurityConfig::default(),
            action_ttl_secs: default_action_ttl_secs(),
        }
    }
}

/// Configuration of the clients this servient consumes with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SouthboundConfig {
    /// Enabled client bindings; empty keeps the default client set
    #[serde(default)]
    pub modes: Vec<BindingMode>,

    #[serde(default)]
    pub http: SecurityConfig,

    #[serde(default)]
    pub coap: SecurityConfig,

    #[serde(default)]
    pub mqtt: SecurityConfig,

    /// CA file for TLS towards south-bound MQTT brokers
    #[serde(default)]
    pub mqtt_ca_file: Option<PathBuf>,

    /// OSCORE credentials map for the CoAP client
    #[serde(default)]
    pub oscore_credentials_map: Option<PathBuf>,

    /// Cache TTL for correlated MQTT responses, seconds
    #[serde(default = "default_msg_ttl_secs")]
    pub mqtt_msg_ttl_secs: u64,
}

impl Default for SouthboundConfig {
    fn default() -> Self {
        Self {
            modes: Vec::new(),
            http: SecurityConfig::default(),
            coap: SecurityConfig::default(),
            mqtt: SecurityConfig::default(),
            mqtt_ca_file: None,
            oscore_credentials_map: None,
            mqtt_msg_ttl_secs: default_msg_ttl_secs(),
        }
    }
}

/// A remote Thing consumed at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteThingConfig {
    pub name: String,
    pub url: String,
}

/// Persistence configuration. The engines themselves are external
/// collaborators; this only selects and parameterizes the writer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Record reads/writes/events through the configured writer
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub token: Option<String>,

    #[serde(default)]
    pub org: Option<String>,
}

impl Config {
    /// Load configuration from default locations and the environment
    pub fn load() -> Result<Self> {
        Self::figment(None).extract().map_err(Into::into)
    }

    /// Load configuration from an explicit YAML or JSON file plus the
    /// environment
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::figment(Some(path.as_ref())).extract().map_err(Into::into)
    }

    fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::file("servient.yml"));

        if let Some(path) = path {
            figment = match path.extension().and_then(|ext| ext.to_str()) {
                Some("json") => figment.merge(Json::file(path)),
                _ => figment.merge(Yaml::file(path)),
            };
        }

        figment.merge(Env::prefixed("WOT_").split("__"))
    }
}
