//! WebSocket binding client

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::messages::{JsonRpcIncoming, JsonRpcRequest, JsonRpcResponse};
use crate::error::{Error, Result};
use crate::events::{finalize, EmittedEvent, EventKind, Observer, Subscription};
use crate::protocols::{pick_href, supports_interaction, InteractionVerb, Protocol, ProtocolClient};
use crate::td::{Form, SecurityScheme, Thing};

/// Default timeout for one request/response exchange
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Implementation of the protocol client contract for WebSockets
pub struct WsClient {
    request_timeout: Duration,
}

impl WsClient {
    pub fn new() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    fn pick(&self, td: &Thing, forms: Vec<&Form>, op: Option<InteractionVerb>) -> Result<String> {
        let forms: Vec<Form> = forms.into_iter().cloned().collect();
        pick_href(td, &forms, Protocol::Websockets, op)
            .ok_or_else(|| Error::NotSupported("No WebSocket form found".to_string()))
    }

    /// Opens a socket, performs one request/response exchange and closes.
    async fn request(
        &self,
        href: &str,
        request: JsonRpcRequest,
        timeout: Option<Duration>,
    ) -> Result<JsonRpcResponse> {
        let timeout = timeout.unwrap_or(self.request_timeout);

        let exchange = async {
            let (mut socket, _) = connect_async(href)
                .await
                .map_err(|e| Error::Protocol(format!("WebSocket connect failed: {}", e)))?;

            let expected_id = request.id.clone().unwrap_or(Value::Null);
            let text = serde_json::to_string(&request)?;
            socket
                .send(Message::Text(text.into()))
                .await
                .map_err(|e| Error::Protocol(format!("WebSocket send failed: {}", e)))?;

            while let Some(message) = socket.next().await {
                let message =
                    message.map_err(|e| Error::Protocol(format!("WebSocket error: {}", e)))?;
                let Message::Text(text) = message else {
                    continue;
                };

                if let Ok(JsonRpcIncoming::Response(response)) =
                    serde_json::from_str::<JsonRpcIncoming>(text.as_str())
                {
                    if response.id == expected_id {
                        let _ = socket.close(None).await;
                        return Ok(response);
                    }
                }
            }

            Err(Error::Protocol(
                "WebSocket closed before the response arrived".to_string(),
            ))
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!("WebSocket request to {}", href))),
        }
    }

    fn result_or_error(response: JsonRpcResponse) -> Result<Value> {
        match response.error {
            None => Ok(response.result.unwrap_or(Value::Null)),
            Some(error) => Err(Error::Handler(error.message)),
        }
    }

    /// Dedicated socket held open for a server-push subscription
    fn subscribe(
        &self,
        href: String,
        method: &'static str,
        name: String,
        observer: Observer,
    ) -> Subscription {
        let subscription = Subscription::new();
        let token = subscription.token();

        let task_observer = observer.clone();
        tokio::spawn(finalize(observer, async move {
            let (mut socket, _) = connect_async(&href)
                .await
                .map_err(|e| Error::Protocol(format!("WebSocket connect failed: {}", e)))?;

            let request = JsonRpcRequest::new(method, json!({"name": name}), 1);
            let text = serde_json::to_string(&request)?;
            socket
                .send(Message::Text(text.into()))
                .await
                .map_err(|e| Error::Protocol(format!("WebSocket send failed: {}", e)))?;

            let mut subscription_id: Option<String> = None;

            loop {
                let message = tokio::select! {
                    _ = token.cancelled() => {
                        // Explicit unsubscribe, then a clean close
                        if let Some(id) = &subscription_id {
                            let unsubscribe = JsonRpcRequest::new(
                                "unsubscribe",
                                json!({"subscription": id}),
                                2,
                            );
                            if let Ok(text) = serde_json::to_string(&unsubscribe) {
                                let _ = socket.send(Message::Text(text.into())).await;
                            }
                        }
                        let _ = socket.close(None).await;
                        return Ok(());
                    }
                    message = socket.next() => message,
                };

                let Some(message) = message else {
                    return Err(Error::Protocol("WebSocket closed by peer".to_string()));
                };
                let message =
                    message.map_err(|e| Error::Protocol(format!("WebSocket error: {}", e)))?;
                let Message::Text(text) = message else {
                    continue;
                };

                match serde_json::from_str::<JsonRpcIncoming>(text.as_str()) {
                    Ok(JsonRpcIncoming::Response(response)) => {
                        if !response.is_success() {
                            let message = response
                                .error
                                .map(|e| e.message)
                                .unwrap_or_else(|| "Subscription rejected".to_string());
                            return Err(Error::Handler(message));
                        }
                        subscription_id = response
                            .result
                            .as_ref()
                            .and_then(|r| r.get("subscription"))
                            .and_then(Value::as_str)
                            .map(str::to_string);
                    }
                    Ok(JsonRpcIncoming::Notification(notification)) => {
                        let params = &notification.params;
                        let event = match notification.method.as_str() {
                            "observeproperty" => EventKind::PropertyChange {
                                name: name.clone(),
                                value: params.get("value").cloned().unwrap_or(Value::Null),
                            },
                            "subscribeevent" => EventKind::Custom {
                                name: name.clone(),
                                payload: params.get("payload").cloned(),
                            },
                            _ => continue,
                        };
                        task_observer.next(EmittedEvent::new(event));
                    }
                    Err(err) => {
                        tracing::debug!("Discarding unparseable WebSocket message: {}", err);
                    }
                }
            }
        }));

        subscription
    }
}

impl Default for WsClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolClient for WsClient {
    fn protocol(&self) -> Protocol {
        Protocol::Websockets
    }

    fn is_supported_interaction(&self, td: &Thing, name: &str) -> bool {
        supports_interaction(td, name, Protocol::Websockets)
    }

    async fn read_property(
        &self,
        td: &Thing,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let href = self.pick(td, td.get_property_forms(name), None)?;
        let request = JsonRpcRequest::new("readproperty", json!({"name": name}), 1);
        let response = self.request(&href, request, timeout).await?;
        let result = Self::result_or_error(response)?;
        Ok(result.get("value").cloned().unwrap_or(result))
    }

    async fn write_property(
        &self,
        td: &Thing,
        name: &str,
        value: Value,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let href = self.pick(td, td.get_property_forms(name), None)?;
        let request =
            JsonRpcRequest::new("writeproperty", json!({"name": name, "value": value}), 1);
        let response = self.request(&href, request, timeout).await?;
        Self::result_or_error(response).map(|_| ())
    }

    async fn invoke_action(
        &self,
        td: &Thing,
        name: &str,
        input: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let href = self.pick(td, td.get_action_forms(name), None)?;
        let request =
            JsonRpcRequest::new("invokeaction", json!({"name": name, "input": input}), 1);
        let response = self.request(&href, request, timeout).await?;
        let result = Self::result_or_error(response)?;
        Ok(result.get("result").cloned().unwrap_or(result))
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
        Ok(self.subscribe(href, "observeproperty", name.to_string(), observer))
    }

    fn on_event(&self, td: &Thing, name: &str, observer: Observer) -> Result<Subscription> {
        let href = self.pick(
            td,
            td.get_event_forms(name),
            Some(InteractionVerb::SubscribeEvent),
        )?;
        Ok(self.subscribe(href, "subscribeevent", name.to_string(), observer))
    }

    /// The WebSocket binding carries no outbound credential; security for
    /// socket endpoints is expected at the transport layer (wss).
    fn set_security(&self, _scheme: &SecurityScheme, _credentials: &Value) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::td::{DataSchema, Property};

    fn td_with_ws_forms() -> Thing {
        let mut thing = Thing::new("remote");
        let mut property = Property::new(DataSchema::default(), true);
        property.td_forms.push(Form::declared(
            "ws://host:8081/remote",
            vec![
                InteractionVerb::ReadProperty,
                InteractionVerb::WriteProperty,
                InteractionVerb::ObserveProperty,
            ],
        ));
        thing.properties.insert("p".into(), property);
        thing
    }

    #[test]
    fn test_supported_interaction_detection() {
        let client = WsClient::new();
        let td = td_with_ws_forms();
        assert!(client.is_supported_interaction(&td, "p"));
        assert!(!client.is_supported_interaction(&td, "missing"));
    }

    #[tokio::test]
    async fn test_missing_form_is_not_supported() {
        let client = WsClient::new();
        let td = Thing::new("empty");
        let err = client.read_property(&td, "p", None).await.unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn test_error_response_maps_to_handler_error() {
        let response = JsonRpcResponse::error(json!(1), -32000, "boom");
        let err = WsClient::result_or_error(response).unwrap_err();
        assert!(matches!(err, Error::Handler(_)));
    }
}
