//! Protocol binding layer
//!
//! Abstract server and client contracts plus the per-transport
//! implementations. Every binding maps the same interaction verbs onto its
//! wire semantics.

pub mod coap;
pub mod http;
pub mod mqtt;
pub mod refs;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use crate::error::Result;
use crate::events::{Observer, Subscription};
use crate::exposed::ExposedThing;
use crate::servient::Servient;
use crate::td::{Form, Interaction, SecurityScheme, Thing};

/// Transport protocols supported by the runtime.
///
/// The ordering matches the lexicographic ordering of the protocol names,
/// which the servient relies on when choosing a default server for base
/// URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Coap,
    Http,
    Mqtt,
    Websockets,
}

impl Protocol {
    /// The URL schemes owned by this protocol, secure variant first.
    pub fn schemes(&self) -> &'static [&'static str] {
        match self {
            Protocol::Coap => &["coaps", "coap"],
            Protocol::Http => &["https", "http"],
            Protocol::Mqtt => &["mqtts", "mqtt"],
            Protocol::Websockets => &["wss", "ws"],
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Protocol::Coap => "coap",
            Protocol::Http => "http",
            Protocol::Mqtt => "mqtt",
            Protocol::Websockets => "websockets",
        };
        write!(f, "{}", name)
    }
}

/// Abstract interaction verbs shared by all bindings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum InteractionVerb {
    #[serde(rename = "readproperty")]
    ReadProperty,
    #[serde(rename = "writeproperty")]
    WriteProperty,
    #[serde(rename = "observeproperty")]
    ObserveProperty,
    #[serde(rename = "invokeaction")]
    InvokeAction,
    #[serde(rename = "subscribeevent")]
    SubscribeEvent,
    #[serde(rename = "unsubscribeevent")]
    UnsubscribeEvent,
}

impl InteractionVerb {
    /// The wire name of the verb as used in TD forms and JSON-RPC methods
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionVerb::ReadProperty => "readproperty",
            InteractionVerb::WriteProperty => "writeproperty",
            InteractionVerb::ObserveProperty => "observeproperty",
            InteractionVerb::InvokeAction => "invokeaction",
            InteractionVerb::SubscribeEvent => "subscribeevent",
            InteractionVerb::UnsubscribeEvent => "unsubscribeevent",
        }
    }
}

/// Server contract implemented by every protocol binding.
///
/// A server registered with the servient is authoritative only for the
/// Things currently exposed on it; the servient mirrors this when it
/// regenerates forms.
#[async_trait]
pub trait ProtocolServer: Send + Sync {
    /// Protocol tag of this server
    fn protocol(&self) -> Protocol;

    /// Bind port, when the transport listens on one
    fn port(&self) -> Option<u16>;

    /// Port advertised in generated forms; differs from `port` behind a
    /// reverse proxy
    fn form_port(&self) -> Option<u16> {
        self.port()
    }

    /// Starts the server. Idempotent under the server's own lock.
    async fn start(&self, servient: &Servient) -> Result<()>;

    /// Stops the server. Idempotent under the server's own lock.
    async fn stop(&self) -> Result<()>;

    /// Builds the per-verb form list for the given interaction
    fn build_forms(&self, hostname: &str, thing: &Thing, interaction: Interaction<'_>)
        -> Vec<Form>;

    /// Returns the base URL for the given Thing on this server
    fn build_base_url(&self, hostname: &str, thing: &Thing) -> Result<String>;

    /// Starts routing requests for the given Thing
    async fn add_exposed_thing(&self, exposed_thing: ExposedThing);

    /// Stops routing requests for the named Thing
    async fn remove_exposed_thing(&self, name: &str);

    /// Returns true if the named Thing is currently exposed on this server
    async fn contains_thing(&self, name: &str) -> bool;
}

/// Client contract implemented by every protocol binding
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Protocol tag of this client
    fn protocol(&self) -> Protocol;

    /// Returns true if any form of the named interaction is reachable
    /// through this client
    fn is_supported_interaction(&self, td: &Thing, name: &str) -> bool;

    /// Reads the value of a Property on a remote Thing
    async fn read_property(&self, td: &Thing, name: &str, timeout: Option<Duration>)
        -> Result<Value>;

    /// Updates the value of a Property on a remote Thing
    async fn write_property(
        &self,
        td: &Thing,
        name: &str,
        value: Value,
        timeout: Option<Duration>,
    ) -> Result<()>;

    /// Invokes an Action on a remote Thing and returns its result
    async fn invoke_action(
        &self,
        td: &Thing,
        name: &str,
        input: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value>;

    /// Subscribes to property changes on a remote Thing
    fn on_property_change(&self, td: &Thing, name: &str, observer: Observer)
        -> Result<Subscription>;

    /// Subscribes to an event on a remote Thing
    fn on_event(&self, td: &Thing, name: &str, observer: Observer) -> Result<Subscription>;

    /// Installs the outbound credential for the given security scheme
    fn set_security(&self, scheme: &SecurityScheme, credentials: &Value) -> Result<()>;
}

impl std::fmt::Debug for dyn ProtocolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dyn ProtocolClient({:?})", self.protocol())
    }
}

/// Shared handle type for binding clients
pub type SharedClient = Arc<dyn ProtocolClient>;

/// Shared handle type for binding servers
pub type SharedServer = Arc<dyn ProtocolServer>;

/// Resolves a form href against an optional TD base URL.
pub fn resolve_href(form: &Form, base: Option<&str>) -> Option<Url> {
    if let Ok(url) = Url::parse(&form.href) {
        return Some(url);
    }

    let base = Url::parse(base?).ok()?;
    base.join(&form.href).ok()
}

/// Returns true if the form, resolved against `base`, uses one of the
/// given URL schemes.
pub fn is_scheme_form(form: &Form, base: Option<&str>, schemes: &[&str]) -> bool {
    resolve_href(form, base)
        .map(|url| schemes.contains(&url.scheme()))
        .unwrap_or(false)
}

/// Picks the most appropriate href for a protocol from a form list.
///
/// The secure scheme wins over the plain one; within a scheme the first
/// form whose `op` includes the requested verb is chosen.
pub fn pick_href(
    td: &Thing,
    forms: &[Form],
    protocol: Protocol,
    op: Option<InteractionVerb>,
) -> Option<String> {
    let base = td.base.as_deref();

    for scheme in protocol.schemes() {
        let found = forms.iter().find(|form| {
            is_scheme_form(form, base, &[scheme])
                && op.map(|verb| form.supports(verb)).unwrap_or(true)
        });

        if let Some(form) = found {
            return resolve_href(form, base).map(|url| url.to_string());
        }
    }

    None
}

/// Returns true if any form of the named interaction is reachable under
/// one of the protocol's schemes. Used by `is_supported_interaction`.
pub fn supports_interaction(td: &Thing, name: &str, protocol: Protocol) -> bool {
    td.get_forms(name)
        .iter()
        .any(|form| is_scheme_form(form, td.base.as_deref(), protocol.schemes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::td::Form;

    fn form(href: &str, op: &[InteractionVerb]) -> Form {
        Form::declared(href, op.to_vec())
    }

    #[test]
    fn test_protocol_ordering_matches_name_ordering() {
        let mut protocols = vec![
            Protocol::Websockets,
            Protocol::Http,
            Protocol::Mqtt,
            Protocol::Coap,
        ];
        protocols.sort();
        assert_eq!(
            protocols,
            vec![
                Protocol::Coap,
                Protocol::Http,
                Protocol::Mqtt,
                Protocol::Websockets
            ]
        );
    }

    #[test]
    fn test_is_scheme_form_with_absolute_href() {
        let f = form("http://host:8080/t/property/temp", &[InteractionVerb::ReadProperty]);
        assert!(is_scheme_form(&f, None, &["http"]));
        assert!(!is_scheme_form(&f, None, &["coap"]));
    }

    #[test]
    fn test_is_scheme_form_with_relative_href() {
        let f = form("/t/property/temp", &[InteractionVerb::ReadProperty]);
        assert!(is_scheme_form(&f, Some("https://host:8443"), &["https"]));
        assert!(!is_scheme_form(&f, None, &["https"]));
    }

    #[test]
    fn test_pick_href_prefers_secure_scheme() {
        let mut td = Thing::new("picker");
        td.properties.insert(
            "temp".into(),
            crate::td::Property::new(crate::td::DataSchema::default(), true),
        );
        let prop = td.properties.get_mut("temp").unwrap();
        prop.td_forms = vec![
            form("http://host:8080/t/property/temp", &[InteractionVerb::ReadProperty]),
            form("https://host:8443/t/property/temp", &[InteractionVerb::ReadProperty]),
        ];

        let forms = td.get_forms("temp");
        let forms: Vec<Form> = forms.into_iter().cloned().collect();
        let href = pick_href(&td, &forms, Protocol::Http, Some(InteractionVerb::ReadProperty));
        assert_eq!(href.as_deref(), Some("https://host:8443/t/property/temp"));
    }

    #[test]
    fn test_pick_href_filters_by_verb() {
        let td = Thing::new("picker");
        let forms = vec![
            form("mqtt://broker/x/prop/write", &[InteractionVerb::WriteProperty]),
            form("mqtt://broker/x/prop", &[InteractionVerb::ObserveProperty]),
        ];

        let href = pick_href(&td, &forms, Protocol::Mqtt, Some(InteractionVerb::ObserveProperty));
        assert_eq!(href.as_deref(), Some("mqtt://broker/x/prop"));
    }

    #[test]
    fn test_verb_wire_names() {
        assert_eq!(InteractionVerb::ReadProperty.as_str(), "readproperty");
        assert_eq!(
            serde_json::to_value(InteractionVerb::SubscribeEvent).unwrap(),
            serde_json::json!("subscribeevent")
        );
    }
}
