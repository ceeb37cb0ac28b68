//! Outbound request signing

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use url::Url;

use super::OIDC4VP_TOKEN_HEADER;
use crate::error::{Error, Result};
use crate::td::SecurityScheme;

/// Signs outgoing requests for one security scheme.
///
/// `sign` returns the headers to attach; the HTTP client adds them as
/// headers, the CoAP client maps them onto its auth option.
#[derive(Debug)]
pub enum Credential {
    /// No signing
    Nosec,

    /// Base64-encoded username/password header
    Basic { username: String, password: String },

    /// Static bearer token header
    Bearer { token: String },

    /// OAuth2 client-credentials flow: fetches a token from the configured
    /// token endpoint on first use and reuses it afterwards
    Oauth2 {
        token_url: String,
        client_id: String,
        client_secret: String,
        scopes: Vec<String>,
        cached_token: Mutex<Option<String>>,
    },

    /// Per-request token issued by an OIDC4VP holder
    Oidc4vp { holder_url: String, requester: String },
}

impl Credential {
    /// Builds the credential variant for the given scheme and credential
    /// material. Unknown or unimplemented schemes fail with NotSupported.
    pub fn build(scheme: &SecurityScheme, credentials: &Value) -> Result<Self> {
        let field = |name: &str| -> Result<String> {
            credentials
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    Error::NotSupported(format!(
                        "Missing {} credential for scheme {}",
                        name,
                        scheme.scheme_name()
                    ))
                })
        };

        match scheme {
            SecurityScheme::Nosec => Ok(Credential::Nosec),

            SecurityScheme::Basic { .. } => Ok(Credential::Basic {
                username: field("username")?,
                password: field("password")?,
            }),

            SecurityScheme::Bearer { .. } => Ok(Credential::Bearer {
                token: field("token")?,
            }),

            SecurityScheme::Oauth2 { flow, token, scopes, .. } => {
                if flow != "client" {
                    return Err(Error::NotSupported(format!(
                        "OAuth2 flow not implemented: {}",
                        flow
                    )));
                }

                let token_url = token.clone().ok_or_else(|| {
                    Error::NotSupported("OAuth2 client flow without token endpoint".into())
                })?;

                Ok(Credential::Oauth2 {
                    token_url,
                    client_id: field("clientId")?,
                    client_secret: field("clientSecret")?,
                    scopes: scopes.clone().unwrap_or_default(),
                    cached_token: Mutex::new(None),
                })
            }

            SecurityScheme::Oidc4vp { .. } => Ok(Credential::Oidc4vp {
                holder_url: field("holder_url")?,
                requester: field("requester")?,
            }),

            other => Err(Error::NotSupported(format!(
                "Outbound credential not implemented for scheme: {}",
                other.scheme_name()
            ))),
        }
    }

    /// Returns the headers that authenticate a request for the given
    /// method and target URL.
    pub async fn sign(&self, method: &str, target_url: &str) -> Result<Vec<(String, String)>> {
        match self {
            Credential::Nosec => Ok(Vec::new()),

            Credential::Basic { username, password } => {
                let encoded = BASE64.encode(format!("{}:{}", username, password));
                Ok(vec![(
                    "Authorization".to_string(),
                    format!("Basic {}", encoded),
                )])
            }

            Credential::Bearer { token } => Ok(vec![(
                "Authorization".to_string(),
                format!("Bearer {}", token),
            )]),

            Credential::Oauth2 {
                token_url,
                client_id,
                client_secret,
                scopes,
                cached_token,
            } => {
                let mut cached = cached_token.lock().await;

                if cached.is_none() {
                    let mut params = vec![
                        ("grant_type".to_string(), "client_credentials".to_string()),
                        ("client_id".to_string(), client_id.clone()),
                        ("client_secret".to_string(), client_secret.clone()),
                    ];
                    if !scopes.is_empty() {
                        params.push(("scope".to_string(), scopes.join(" ")));
                    }

                    let response = reqwest::Client::new()
                        .post(token_url)
                        .form(&params)
                        .send()
                        .await?;

                    if !response.status().is_success() {
                        return Err(Error::Unauthorized(format!(
                            "Token endpoint returned {}",
                            response.status()
                        )));
                    }

                    let body: Value = response.json().await?;
                    let access_token = body
                        .get("access_token")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            Error::Protocol("Token endpoint response without access_token".into())
                        })?;

                    *cached = Some(access_token.to_string());
                }

                Ok(vec![(
                    "Authorization".to_string(),
                    format!("Bearer {}", cached.as_deref().unwrap_or_default()),
                )])
            }

            Credential::Oidc4vp {
                holder_url,
                requester,
            } => {
                let token =
                    holder_token_request(holder_url, target_url, method, requester).await?;
                Ok(vec![(OIDC4VP_TOKEN_HEADER.to_string(), token)])
            }
        }
    }
}

/// Requests a per-request token from the OIDC4VP holder.
///
/// The holder receives the target device, method, resource and requester
/// identity and answers with an opaque token string.
pub async fn holder_token_request(
    holder_url: &str,
    target_url: &str,
    method: &str,
    requester: &str,
) -> Result<String> {
    let url = Url::parse(target_url)?;
    let device = format!(
        "{}://{}",
        url.scheme(),
        url.authority()
    );
    let resource = &target_url[device.len()..];

    let body = json!({
        "device": device,
        "method": method,
        "resource": resource,
        "requester": requester,
    });

    let response = reqwest::Client::new()
        .post(holder_url)
        .json(&body)
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(Error::Unauthorized(format!(
            "Holder returned {}",
            response.status()
        )));
    }

    let token = response.text().await?;
    Ok(token.replace('\n', ""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_basic_signature() {
        let cred = Credential::build(
            &SecurityScheme::from_name("basic").unwrap(),
            &json!({"username": "ada", "password": "s3cret"}),
        )
        .unwrap();

        let headers = cred.sign("GET", "http://host/x").await.unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].0, "Authorization");
        assert_eq!(
            headers[0].1,
            format!("Basic {}", BASE64.encode("ada:s3cret"))
        );
    }

    #[tokio::test]
    async fn test_bearer_signature() {
        let cred = Credential::build(
            &SecurityScheme::from_name("bearer").unwrap(),
            &json!({"token": "T"}),
        )
        .unwrap();

        let headers = cred.sign("GET", "http://host/x").await.unwrap();
        assert_eq!(headers[0].1, "Bearer T");
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let err = Credential::build(
            &SecurityScheme::from_name("basic").unwrap(),
            &json!({"username": "ada"}),
        )
        .unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn test_unimplemented_scheme_rejected() {
        let err =
            Credential::build(&SecurityScheme::from_name("psk").unwrap(), &json!({})).unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn test_oauth2_requires_client_flow() {
        let scheme = SecurityScheme::Oauth2 {
            authorization: None,
            token: Some("https://issuer/token".into()),
            refresh: None,
            scopes: None,
            flow: "implicit".into(),
        };
        let err = Credential::build(&scheme, &json!({})).unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[tokio::test]
    async fn test_nosec_signs_nothing() {
        let cred = Credential::Nosec;
        assert!(cred.sign("GET", "http://host/x").await.unwrap().is_empty());
    }
}
