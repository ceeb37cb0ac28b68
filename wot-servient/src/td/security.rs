//! Security scheme variants
//!
//! One tagged variant per scheme defined by the TD vocabulary. Each variant
//! carries only the fields it needs; dispatch happens at construction from
//! the `scheme` tag and unknown schemes fail during deserialization.

use serde::{Deserialize, Serialize};

fn default_in_header() -> String {
    "header".to_string()
}

fn default_in_query() -> String {
    "query".to_string()
}

fn default_qop() -> String {
    "auth".to_string()
}

fn default_alg() -> String {
    "ES256".to_string()
}

fn default_format() -> String {
    "jwt".to_string()
}

fn default_flow() -> String {
    "implicit".to_string()
}

fn is_header(val: &String) -> bool {
    val == "header"
}

fn is_query(val: &String) -> bool {
    val == "query"
}

/// Security configuration for a Thing or a Form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "lowercase")]
pub enum SecurityScheme {
    /// No authentication required
    Nosec,

    /// Security negotiated by the underlying protocols at runtime
    Auto,

    /// Combination of other named schemes
    Combo {
        #[serde(rename = "oneOf", skip_serializing_if = "Option::is_none")]
        one_of: Option<Vec<String>>,
        #[serde(rename = "allOf", skip_serializing_if = "Option::is_none")]
        all_of: Option<Vec<String>>,
    },

    /// Unencrypted username and password
    Basic {
        #[serde(rename = "in", default = "default_in_header", skip_serializing_if = "is_header")]
        location: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },

    /// Digest authentication
    Digest {
        #[serde(default = "default_qop")]
        qop: String,
        #[serde(rename = "in", default = "default_in_header", skip_serializing_if = "is_header")]
        location: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },

    /// Opaque API key
    Apikey {
        #[serde(rename = "in", default = "default_in_query", skip_serializing_if = "is_query")]
        location: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },

    /// Bearer token used independently of OAuth2
    Bearer {
        #[serde(skip_serializing_if = "Option::is_none")]
        authorization: Option<String>,
        #[serde(default = "default_alg")]
        alg: String,
        #[serde(default = "default_format")]
        format: String,
        #[serde(rename = "in", default = "default_in_header", skip_serializing_if = "is_header")]
        location: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },

    /// Pre-shared key
    Psk {
        #[serde(skip_serializing_if = "Option::is_none")]
        identity: Option<String>,
    },

    /// OAuth2 flow
    Oauth2 {
        #[serde(skip_serializing_if = "Option::is_none")]
        authorization: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        refresh: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        scopes: Option<Vec<String>>,
        #[serde(default = "default_flow")]
        flow: String,
    },

    /// OpenID Connect for Verifiable Presentations; validation is
    /// delegated to an external verifier
    Oidc4vp {
        #[serde(skip_serializing_if = "Option::is_none")]
        verifier: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },
}

impl SecurityScheme {
    /// The TD `scheme` tag value of this variant
    pub fn scheme_name(&self) -> &'static str {
        match self {
            SecurityScheme::Nosec => "nosec",
            SecurityScheme::Auto => "auto",
            SecurityScheme::Combo { .. } => "combo",
            SecurityScheme::Basic { .. } => "basic",
            SecurityScheme::Digest { .. } => "digest",
            SecurityScheme::Apikey { .. } => "apikey",
            SecurityScheme::Bearer { .. } => "bearer",
            SecurityScheme::Psk { .. } => "psk",
            SecurityScheme::Oauth2 { .. } => "oauth2",
            SecurityScheme::Oidc4vp { .. } => "oidc4vp",
        }
    }

    /// Build a scheme from its tag name and optional endpoint material,
    /// as used by the binding configuration.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "nosec" => Some(SecurityScheme::Nosec),
            "auto" => Some(SecurityScheme::Auto),
            "combo" => Some(SecurityScheme::Combo {
                one_of: None,
                all_of: None,
            }),
            "basic" => Some(SecurityScheme::Basic {
                location: default_in_header(),
                name: None,
            }),
            "digest" => Some(SecurityScheme::Digest {
                qop: default_qop(),
                location: default_in_header(),
                name: None,
            }),
            "apikey" => Some(SecurityScheme::Apikey {
                location: default_in_query(),
                name: None,
            }),
            "bearer" => Some(SecurityScheme::Bearer {
                authorization: None,
                alg: default_alg(),
                format: default_format(),
                location: default_in_header(),
                name: None,
            }),
            "psk" => Some(SecurityScheme::Psk { identity: None }),
            "oauth2" => Some(SecurityScheme::Oauth2 {
                authorization: None,
                token: None,
                refresh: None,
                scopes: None,
                flow: default_flow(),
            }),
            "oidc4vp" => Some(SecurityScheme::Oidc4vp {
                verifier: None,
                endpoint: None,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nosec_round_trip() {
        let scheme: SecurityScheme = serde_json::from_value(json!({"scheme": "nosec"})).unwrap();
        assert_eq!(scheme, SecurityScheme::Nosec);
        assert_eq!(scheme.scheme_name(), "nosec");
        assert_eq!(serde_json::to_value(&scheme).unwrap(), json!({"scheme": "nosec"}));
    }

    #[test]
    fn test_basic_defaults() {
        let scheme: SecurityScheme = serde_json::from_value(json!({"scheme": "basic"})).unwrap();
        match &scheme {
            SecurityScheme::Basic { location, name } => {
                assert_eq!(location, "header");
                assert!(name.is_none());
            }
            other => panic!("unexpected scheme: {:?}", other),
        }
    }

    #[test]
    fn test_bearer_defaults() {
        let scheme: SecurityScheme = serde_json::from_value(json!({"scheme": "bearer"})).unwrap();
        match scheme {
            SecurityScheme::Bearer { alg, format, .. } => {
                assert_eq!(alg, "ES256");
                assert_eq!(format, "jwt");
            }
            other => panic!("unexpected scheme: {:?}", other),
        }
    }

    #[test]
    fn test_oauth2_fields() {
        let scheme: SecurityScheme = serde_json::from_value(json!({
            "scheme": "oauth2",
            "flow": "client",
            "token": "https://issuer.example/token",
            "scopes": ["read", "write"]
        }))
        .unwrap();
        match scheme {
            SecurityScheme::Oauth2 { flow, token, scopes, .. } => {
                assert_eq!(flow, "client");
                assert_eq!(token.as_deref(), Some("https://issuer.example/token"));
                assert_eq!(scopes.unwrap().len(), 2);
            }
            other => panic!("unexpected scheme: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        let parsed = serde_json::from_value::<SecurityScheme>(json!({"scheme": "voodoo"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_from_name_covers_all_schemes() {
        for name in [
            "nosec", "auto", "combo", "basic", "digest", "apikey", "bearer", "psk", "oauth2",
            "oidc4vp",
        ] {
            let scheme = SecurityScheme::from_name(name).unwrap();
            assert_eq!(scheme.scheme_name(), name);
        }
        assert!(SecurityScheme::from_name("voodoo").is_none());
    }
}
