//! HTTP binding client

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::auth::Credential;
use crate::error::{Error, Result};
use crate::events::{finalize, EmittedEvent, EventKind, Observer, Subscription};
use crate::protocols::{pick_href, supports_interaction, InteractionVerb, Protocol, ProtocolClient};
use crate::td::{Form, SecurityScheme, Thing};

/// Default request timeout when the caller does not pass one
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Implementation of the protocol client contract for HTTP
pub struct HttpClient {
    http: reqwest::Client,
    credential: RwLock<Option<Arc<Credential>>>,
    request_timeout: Duration,
}

impl HttpClient {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(request_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            credential: RwLock::new(None),
            request_timeout,
        }
    }

    fn credential(&self) -> Option<Arc<Credential>> {
        self.credential.read().ok().and_then(|guard| guard.clone())
    }

    /// Signs a request through the installed credential, when any
    async fn sign(
        &self,
        method: &str,
        url: &str,
        mut request: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder> {
        if let Some(credential) = self.credential() {
            for (name, value) in credential.sign(method, url).await? {
                request = request.header(name, value);
            }
        }
        Ok(request)
    }

    fn pick(&self, td: &Thing, forms: Vec<&Form>, op: Option<InteractionVerb>) -> Result<String> {
        let forms: Vec<Form> = forms.into_iter().cloned().collect();
        pick_href(td, &forms, Protocol::Http, op)
            .ok_or_else(|| Error::NotSupported("No HTTP form found".to_string()))
    }

    fn timeout(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or(self.request_timeout)
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolClient for HttpClient {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    fn is_supported_interaction(&self, td: &Thing, name: &str) -> bool {
        supports_interaction(td, name, Protocol::Http)
    }

    async fn read_property(
        &self,
        td: &Thing,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let href = self.pick(td, td.get_property_forms(name), None)?;

        let request = self
            .http
            .get(&href)
            .timeout(self.timeout(timeout));
        let request = self.sign("GET", &href, request).await?;

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::Protocol(format!(
                "Property read returned {}",
                response.status()
            )));
        }

        let body: Value = response.json().await?;
        Ok(body.get("value").cloned().unwrap_or(body))
    }

    async fn write_property(
        &self,
        td: &Thing,
        name: &str,
        value: Value,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let href = self.pick(td, td.get_property_forms(name), None)?;

        let request = self
            .http
            .put(&href)
            .json(&json!({"value": value}))
            .timeout(self.timeout(timeout));
        let request = self.sign("PUT", &href, request).await?;

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::Protocol(format!(
                "Property write returned {}",
                response.status()
            )));
        }

        Ok(())
    }

    async fn invoke_action(
        &self,
        td: &Thing,
        name: &str,
        input: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let href = self.pick(td, td.get_action_forms(name), None)?;

        let request = self
            .http
            .post(&href)
            .json(&json!({"input": input}))
            .timeout(self.timeout(timeout));
        let request = self.sign("POST", &href, request).await?;

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::Protocol(format!(
                "Action invocation returned {}",
                response.status()
            )));
        }

        let body: Value = response.json().await?;
        if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
            return Err(Error::Handler(
                error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string()),
            ));
        }

        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Long-poll observation: re-issues the subscription request until the
    /// handle is disposed. Poll timeouts re-arm silently; other transport
    /// errors finalize the subscription (the consuming proxy recreates it).
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

        let subscription = Subscription::new();
        let token = subscription.token();
        let http = self.http.clone();
        let credential = self.credential();
        let name = name.to_string();
        let poll_timeout = self.request_timeout;

        let task_observer = observer.clone();
        tokio::spawn(finalize(observer, async move {
            loop {
                let mut request = http.get(&href).timeout(poll_timeout);
                if let Some(credential) = &credential {
                    for (header, value) in credential.sign("GET", &href).await? {
                        request = request.header(header, value);
                    }
                }

                let response = tokio::select! {
                    _ = token.cancelled() => return Ok(()),
                    response = request.send() => response,
                };

                match response {
                    Ok(response) if response.status().is_success() => {
                        let body: Value = response.json().await?;
                        let value = body.get("value").cloned().unwrap_or(body);
                        task_observer.next(EmittedEvent::new(EventKind::PropertyChange {
                            name: name.clone(),
                            value,
                        }));
                    }
                    Ok(response) => {
                        return Err(Error::Protocol(format!(
                            "Observation returned {}",
                            response.status()
                        )));
                    }
                    // Long-poll timeout: re-issue the request
                    Err(err) if err.is_timeout() => continue,
                    Err(err) => return Err(err.into()),
                }
            }
        }));

        Ok(subscription)
    }

    fn on_event(&self, td: &Thing, name: &str, observer: Observer) -> Result<Subscription> {
        let href = self.pick(td, td.get_event_forms(name), None)?;

        let subscription = Subscription::new();
        let token = subscription.token();
        let http = self.http.clone();
        let credential = self.credential();
        let name = name.to_string();
        let poll_timeout = self.request_timeout;

        let task_observer = observer.clone();
        tokio::spawn(finalize(observer, async move {
            loop {
                let mut request = http.get(&href).timeout(poll_timeout);
                if let Some(credential) = &credential {
                    for (header, value) in credential.sign("GET", &href).await? {
                        request = request.header(header, value);
                    }
                }

                let response = tokio::select! {
                    _ = token.cancelled() => return Ok(()),
                    response = request.send() => response,
                };

                match response {
                    Ok(response) if response.status().is_success() => {
                        let body: Value = response.json().await?;
                        let payload = body.get("payload").cloned();
                        task_observer.next(EmittedEvent::new(EventKind::Custom {
                            name: name.clone(),
                            payload,
                        }));
                    }
                    Ok(response) => {
                        return Err(Error::Protocol(format!(
                            "Event subscription returned {}",
                            response.status()
                        )));
                    }
                    Err(err) if err.is_timeout() => continue,
                    Err(err) => return Err(err.into()),
                }
            }
        }));

        Ok(subscription)
    }

    fn set_security(&self, scheme: &SecurityScheme, credentials: &Value) -> Result<()> {
        let credential = Credential::build(scheme, credentials)?;
        if let Ok(mut guard) = self.credential.write() {
            *guard = Some(Arc::new(credential));
        }
        Ok(())
    }
}
