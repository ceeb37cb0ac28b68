//! Things consumed from remote servients
//!
//! The client-side facade resolves a binding client anew on every call so
//! that topology changes take effect immediately. Each call carries a soft
//! timeout handed to the binding and a hard timeout guarding against
//! bindings that fail to honor it.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::events::{finalize, Observer, Subscription};
use crate::servient::Servient;
use crate::td::Thing;

/// Factor applied to the soft timeout to derive the hard timeout
const HARD_TIMEOUT_FACTOR: f64 = 1.2;

/// Delay before a failed subscription is recreated
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);

/// Client-side facade over a remote Thing
#[derive(Clone)]
pub struct ConsumedThing {
    servient: Servient,
    td: Arc<Thing>,
}

impl ConsumedThing {
    pub(crate) fn new(servient: Servient, td: Thing) -> Self {
        Self {
            servient,
            td: Arc::new(td),
        }
    }

    /// The TD this facade was built from
    pub fn td(&self) -> &Thing {
        &self.td
    }

    pub fn title(&self) -> &str {
        &self.td.title
    }

    fn soft_timeout(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or_else(|| self.servient.request_timeout())
    }

    fn hard_timeout(soft: Duration) -> Duration {
        soft.mul_f64(HARD_TIMEOUT_FACTOR)
    }

    async fn bounded<T>(
        &self,
        soft: Duration,
        what: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(Self::hard_timeout(soft), fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "Hard timeout exceeded on {}",
                what
            ))),
        }
    }

    /// Reads a property, selecting the binding client at call time
    pub async fn read_property(&self, name: &str, timeout: Option<Duration>) -> Result<Value> {
        let soft = self.soft_timeout(timeout);
        let client = self.servient.select_client(&self.td, name).await?;
        self.bounded(soft, name, client.read_property(&self.td, name, Some(soft)))
            .await
    }

    /// Writes a property, selecting the binding client at call time
    pub async fn write_property(
        &self,
        name: &str,
        value: Value,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let soft = self.soft_timeout(timeout);
        let client = self.servient.select_client(&self.td, name).await?;
        self.bounded(
            soft,
            name,
            client.write_property(&self.td, name, value, Some(soft)),
        )
        .await
    }

    /// Invokes an action, selecting the binding client at call time
    pub async fn invoke_action(
        &self,
        name: &str,
        input: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let soft = self.soft_timeout(timeout);
        let client = self.servient.select_client(&self.td, name).await?;
        self.bounded(
            soft,
            name,
            client.invoke_action(&self.td, name, input, Some(soft)),
        )
        .await
    }

    /// Subscribes to property change notifications. The returned handle
    /// transparently recreates the binding subscription after transport
    /// errors.
    pub async fn on_property_change(&self, name: &str, observer: Observer) -> Result<Subscription> {
        self.subscribe_with_retry(name, observer, SubscriptionKind::PropertyChange)
            .await
    }

    /// Subscribes to event notifications with the same retry behavior
    pub async fn on_event(&self, name: &str, observer: Observer) -> Result<Subscription> {
        self.subscribe_with_retry(name, observer, SubscriptionKind::Event)
            .await
    }

    async fn subscribe_with_retry(
        &self,
        name: &str,
        observer: Observer,
        kind: SubscriptionKind,
    ) -> Result<Subscription> {
        // Fail fast when nothing can serve the subscription at all
        self.servient.select_client(&self.td, name).await?;

        let handle = Subscription::new();
        let token = handle.token();
        let this = self.clone();
        let name = name.to_string();

        let user_observer = observer.clone();
        tokio::spawn(finalize(observer, async move {
            loop {
                let client = this.servient.select_client(&this.td, &name).await?;

                // Channel carrying the inner subscription's terminal state:
                // `Some(err)` asks for a recreate, `None` ends the proxy
                let (terminal_tx, mut terminal_rx) = mpsc::unbounded_channel::<Option<Error>>();
                let complete_tx = terminal_tx.clone();
                let forward = user_observer.clone();
                let inner_observer = Observer::with_callbacks(
                    move |event| forward.next(event),
                    move || {
                        let _ = complete_tx.send(None);
                    },
                    move |err| {
                        let _ = terminal_tx.send(Some(err));
                    },
                );

                let inner = match kind {
                    SubscriptionKind::PropertyChange => {
                        client.on_property_change(&this.td, &name, inner_observer)
                    }
                    SubscriptionKind::Event => client.on_event(&this.td, &name, inner_observer),
                };

                let inner = match inner {
                    Ok(subscription) => subscription,
                    Err(err) => {
                        tracing::warn!(name = %name, "Subscription failed: {}; retrying", err);
                        tokio::select! {
                            _ = token.cancelled() => return Ok(()),
                            _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => continue,
                        }
                    }
                };

                tokio::select! {
                    _ = token.cancelled() => {
                        inner.dispose();
                        return Ok(());
                    }
                    terminal = terminal_rx.recv() => {
                        inner.dispose();
                        match terminal {
                            Some(Some(err)) => {
                                tracing::warn!(
                                    name = %name,
                                    "Subscription errored: {}; recreating", err
                                );
                            }
                            // Clean completion of the transport ends the proxy
                            Some(None) | None => return Ok(()),
                        }
                        tokio::select! {
                            _ = token.cancelled() => return Ok(()),
                            _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                        }
                    }
                }
            }
        }));

        Ok(handle)
    }
}

#[derive(Clone, Copy)]
enum SubscriptionKind {
    PropertyChange,
    Event,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::td::{DataSchema, Form, Property};

    fn td_without_forms() -> Thing {
        let mut thing = Thing::new("remote");
        thing
            .properties
            .insert("p".into(), Property::new(DataSchema::default(), true));
        thing
    }

    #[tokio::test]
    async fn test_read_without_forms_is_not_supported() {
        let servient = Servient::builder().catalogue_port(None).build();
        let consumed = ConsumedThing::new(servient, td_without_forms());

        let err = consumed.read_property("p", None).await.unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[tokio::test]
    async fn test_subscription_without_forms_fails_fast() {
        let servient = Servient::builder().catalogue_port(None).build();
        let consumed = ConsumedThing::new(servient, td_without_forms());

        let err = consumed
            .on_property_change("p", Observer::new(|_| {}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[tokio::test]
    async fn test_hard_timeout_derivation() {
        assert_eq!(
            ConsumedThing::hard_timeout(Duration::from_secs(10)),
            Duration::from_secs(12)
        );
    }

    #[tokio::test]
    async fn test_unknown_interaction_is_reported() {
        let servient = Servient::builder().catalogue_port(None).build();
        let mut td = td_without_forms();
        td.properties.get_mut("p").unwrap().td_forms.push(Form::declared(
            "http://host/x/property/p",
            vec![crate::protocols::InteractionVerb::ReadProperty],
        ));
        let consumed = ConsumedThing::new(servient, td);

        let err = consumed.read_property("missing", None).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
