//! Forms: transport endpoints for interactions

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::protocols::{InteractionVerb, Protocol};

/// Default content type for form payloads
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

fn default_content_type() -> String {
    DEFAULT_CONTENT_TYPE.to_string()
}

fn is_default_content_type(val: &String) -> bool {
    val == DEFAULT_CONTENT_TYPE
}

/// TDs allow `op` to be a single verb or a list of verbs.
fn one_or_many_verbs<'de, D>(deserializer: D) -> Result<Vec<InteractionVerb>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(InteractionVerb),
        Many(Vec<InteractionVerb>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(verb)) => vec![verb],
        Some(OneOrMany::Many(verbs)) => verbs,
    })
}

/// A transport endpoint + operation verbs + content type through which an
/// interaction can be reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Form {
    /// Absolute or base-relative URL of the endpoint
    pub href: String,

    /// Media type of request and response payloads
    #[serde(
        rename = "contentType",
        default = "default_content_type",
        skip_serializing_if = "is_default_content_type"
    )]
    pub content_type: String,

    /// Verbs available through this form
    #[serde(default, deserialize_with = "one_or_many_verbs", skip_serializing_if = "Vec::is_empty")]
    pub op: Vec<InteractionVerb>,

    /// Transport subprotocol, e.g. `longpoll`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subprotocol: Option<String>,

    /// Security scheme names overriding the Thing-level selection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<Vec<String>>,

    /// Expected response metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,

    /// Additional expected response metadata
    #[serde(rename = "additionalResponses", skip_serializing_if = "Option::is_none")]
    pub additional_responses: Option<Value>,

    /// Protocol that generated this form; `None` on TD-declared forms
    #[serde(skip)]
    pub protocol: Option<Protocol>,
}

impl Form {
    /// A form as declared in a TD document
    pub fn declared(href: impl Into<String>, op: Vec<InteractionVerb>) -> Self {
        Self {
            href: href.into(),
            content_type: default_content_type(),
            op,
            subprotocol: None,
            security: None,
            response: None,
            additional_responses: None,
            protocol: None,
        }
    }

    /// A form generated by a binding server for the given protocol
    pub fn generated(protocol: Protocol, href: impl Into<String>, op: Vec<InteractionVerb>) -> Self {
        Self {
            protocol: Some(protocol),
            ..Self::declared(href, op)
        }
    }

    /// Returns true if the form offers the given verb
    pub fn supports(&self, verb: InteractionVerb) -> bool {
        self.op.contains(&verb)
    }

    /// Stable identity of the form, used to de-duplicate generated forms
    pub fn id(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.href.as_bytes());
        for verb in &self.op {
            hasher.update(verb.as_str().as_bytes());
        }
        hasher.update(self.content_type.as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_single_op() {
        let form: Form = serde_json::from_value(json!({
            "href": "coap://host/property?thing=t&name=p",
            "op": "readproperty"
        }))
        .unwrap();
        assert_eq!(form.op, vec![InteractionVerb::ReadProperty]);
        assert_eq!(form.content_type, DEFAULT_CONTENT_TYPE);
    }

    #[test]
    fn test_parse_op_list() {
        let form: Form = serde_json::from_value(json!({
            "href": "http://host/t/property/p",
            "op": ["readproperty", "writeproperty"]
        }))
        .unwrap();
        assert!(form.supports(InteractionVerb::ReadProperty));
        assert!(form.supports(InteractionVerb::WriteProperty));
        assert!(!form.supports(InteractionVerb::InvokeAction));
    }

    #[test]
    fn test_form_identity_is_stable() {
        let a = Form::generated(
            Protocol::Http,
            "http://host/t/property/p",
            vec![InteractionVerb::ReadProperty, InteractionVerb::WriteProperty],
        );
        let b = Form::generated(
            Protocol::Http,
            "http://host/t/property/p",
            vec![InteractionVerb::ReadProperty, InteractionVerb::WriteProperty],
        );
        assert_eq!(a.id(), b.id());

        let c = Form::generated(
            Protocol::Http,
            "http://host/t/property/p",
            vec![InteractionVerb::ObserveProperty],
        );
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn test_default_content_type_omitted_on_emit() {
        let form = Form::declared("http://host/x", vec![InteractionVerb::InvokeAction]);
        let emitted = serde_json::to_value(&form).unwrap();
        assert_eq!(
            emitted,
            json!({"href": "http://host/x", "op": ["invokeaction"]})
        );
    }
}
