//! Things exposed by a servient
//!
//! An [`ExposedThing`] wraps a [`Thing`] with per-property values, handler
//! tables for reads/writes/invocations, and the event bus that backs every
//! observation mechanism of the protocol bindings.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::events::{
    event_name_filter, property_change_filter, EventBus, EventKind, Observer, Subscription,
    TdChangeMethod, TdChangeType, EVENT_DESCRIPTION_CHANGE,
};
use crate::persistence::{record_point, PersistenceWriter};
use crate::servient::{Servient, ServientInner};
use crate::td::{Action, Event, Property, Thing, ThingDescription};

/// Handler resolving a property read to a value
pub type PropertyReadHandler =
    Arc<dyn Fn(ExposedThing, String) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Handler applying a property write
pub type PropertyWriteHandler =
    Arc<dyn Fn(ExposedThing, String, Value) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Handler running an action invocation
pub type ActionHandler = Arc<
    dyn Fn(ExposedThing, String, Option<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync,
>;

struct HandlerTable<H> {
    per_interaction: HashMap<String, H>,
    global: Option<H>,
}

impl<H> Default for HandlerTable<H> {
    fn default() -> Self {
        Self {
            per_interaction: HashMap::new(),
            global: None,
        }
    }
}

impl<H: Clone> HandlerTable<H> {
    /// Per-interaction handler if present, else the global fallback.
    fn resolve(&self, name: &str) -> Option<H> {
        self.per_interaction
            .get(name)
            .cloned()
            .or_else(|| self.global.clone())
    }
}

struct ExposedThingInner {
    title: String,
    url_name: String,
    thing: RwLock<Thing>,
    servient: Weak<ServientInner>,
    writer: Arc<dyn PersistenceWriter>,
    property_values: RwLock<HashMap<String, Value>>,
    read_handlers: RwLock<HandlerTable<PropertyReadHandler>>,
    write_handlers: RwLock<HandlerTable<PropertyWriteHandler>>,
    action_handlers: RwLock<HandlerTable<ActionHandler>>,
    bus: EventBus,
}

/// Server-side facade over a Thing.
///
/// Cheap to clone; all clones share the same state. The title is fixed at
/// construction since it keys the servient registries.
#[derive(Clone)]
pub struct ExposedThing {
    inner: Arc<ExposedThingInner>,
}

impl PartialEq for ExposedThing {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for ExposedThing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExposedThing")
            .field("title", &self.inner.title)
            .finish()
    }
}

impl ExposedThing {
    pub(crate) fn new(
        servient: Weak<ServientInner>,
        writer: Arc<dyn PersistenceWriter>,
        thing: Thing,
    ) -> Self {
        Self {
            inner: Arc::new(ExposedThingInner {
                title: thing.title.clone(),
                url_name: thing.url_name(),
                thing: RwLock::new(thing),
                servient,
                writer,
                property_values: RwLock::new(HashMap::new()),
                read_handlers: RwLock::new(HandlerTable::default()),
                write_handlers: RwLock::new(HandlerTable::default()),
                action_handlers: RwLock::new(HandlerTable::default()),
                bus: EventBus::new(),
            }),
        }
    }

    pub fn title(&self) -> &str {
        &self.inner.title
    }

    pub fn url_name(&self) -> &str {
        &self.inner.url_name
    }

    /// Snapshot of the underlying Thing, including generated forms
    pub async fn thing(&self) -> Thing {
        self.inner.thing.read().await.clone()
    }

    /// Event bus backing all subscriptions on this Thing
    pub fn events(&self) -> EventBus {
        self.inner.bus.clone()
    }

    pub(crate) async fn with_thing_mut<R>(&self, f: impl FnOnce(&mut Thing) -> R) -> R {
        let mut thing = self.inner.thing.write().await;
        f(&mut thing)
    }

    fn servient(&self) -> Result<Servient> {
        Servient::upgrade(&self.inner.servient)
            .ok_or_else(|| Error::State("Servient no longer exists".to_string()))
    }

    /// Canonical map key of a property, resolving URL-safe names
    async fn property_key(&self, name: &str) -> Result<String> {
        let thing = self.inner.thing.read().await;
        thing
            .properties
            .keys()
            .find(|key| key.as_str() == name || crate::td::url_name(key) == name)
            .cloned()
            .ok_or_else(|| Error::NotSupported(format!("Unknown property: {}", name)))
    }

    async fn action_key(&self, name: &str) -> Result<String> {
        let thing = self.inner.thing.read().await;
        thing
            .actions
            .keys()
            .find(|key| key.as_str() == name || crate::td::url_name(key) == name)
            .cloned()
            .ok_or_else(|| Error::NotSupported(format!("Unknown action: {}", name)))
    }

    async fn event_key(&self, name: &str) -> Result<String> {
        let thing = self.inner.thing.read().await;
        thing
            .events
            .keys()
            .find(|key| key.as_str() == name || crate::td::url_name(key) == name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Unknown event: {}", name)))
    }

    /// Reads a property through the configured handler chain: the
    /// per-interaction handler, else the global read handler, else the
    /// stored value.
    pub async fn read_property(&self, name: &str) -> Result<Value> {
        let key = self.property_key(name).await?;

        let handler = self.inner.read_handlers.read().await.resolve(&key);

        let value = match handler {
            Some(handler) => handler(self.clone(), key.clone()).await?,
            None => self
                .inner
                .property_values
                .read()
                .await
                .get(&key)
                .cloned()
                .unwrap_or(Value::Null),
        };

        record_point(&self.inner.writer, "property", &key, &value).await;

        Ok(value)
    }

    /// Writes a property: dispatches the handler chain, stores the value
    /// and emits a property change event.
    pub async fn write_property(&self, name: &str, value: Value) -> Result<()> {
        let key = self.property_key(name).await?;

        let handler = self.inner.write_handlers.read().await.resolve(&key);
        if let Some(handler) = handler {
            handler(self.clone(), key.clone(), value.clone()).await?;
        }

        self.inner
            .property_values
            .write()
            .await
            .insert(key.clone(), value.clone());

        record_point(&self.inner.writer, "property", &key, &value).await;

        self.inner.bus.emit(EventKind::PropertyChange {
            name: key,
            value,
        });

        Ok(())
    }

    /// External write path used by protocol servers. Unlike internal
    /// writes, writes to read-only properties are rejected.
    pub async fn handle_write_property(&self, name: &str, value: Value) -> Result<()> {
        let key = self.property_key(name).await?;

        let writable = {
            let thing = self.inner.thing.read().await;
            thing
                .properties
                .get(&key)
                .map(Property::is_writable)
                .unwrap_or(false)
        };

        if !writable {
            return Err(Error::Handler(format!(
                "Property is non-writable: {}",
                key
            )));
        }

        self.write_property(&key, value).await
    }

    /// Invokes an action through the handler chain. The invocation event
    /// is emitted after the handler returns, carrying the result or the
    /// raised error.
    pub async fn invoke_action(&self, name: &str, input: Option<Value>) -> Result<Value> {
        let key = self.action_key(name).await?;

        let handler = self.inner.action_handlers.read().await.resolve(&key);

        let outcome = match handler {
            Some(handler) => handler(self.clone(), key.clone(), input).await,
            None => Err(Error::Handler("Undefined action handler".to_string())),
        };

        let event = match &outcome {
            Ok(result) => EventKind::ActionInvocation {
                action_name: key.clone(),
                return_value: Some(result.clone()),
                error: None,
            },
            Err(err) => EventKind::ActionInvocation {
                action_name: key.clone(),
                return_value: None,
                error: Some(err.to_string()),
            },
        };

        let emitted = self.inner.bus.emit(event);
        record_point(&self.inner.writer, "action", &key, &emitted.data_json()).await;

        outcome.map_err(|err| match err {
            Error::Handler(msg) => Error::Handler(msg),
            other => Error::Handler(other.to_string()),
        })
    }

    /// Emits a declared event with the given payload
    pub async fn emit_event(&self, name: &str, payload: Option<Value>) -> Result<()> {
        let key = self.event_key(name).await?;

        let emitted = self.inner.bus.emit(EventKind::Custom {
            name: key.clone(),
            payload,
        });
        record_point(&self.inner.writer, "event", &key, &emitted.data_json()).await;

        Ok(())
    }

    async fn emit_td_change(
        &self,
        change_type: TdChangeType,
        method: TdChangeMethod,
        name: &str,
        data: Option<Value>,
    ) {
        let description = match method {
            TdChangeMethod::Remove => None,
            _ => Some(ThingDescription::from_thing(&self.thing().await)),
        };

        let emitted = self.inner.bus.emit(EventKind::ThingDescriptionChange {
            change_type,
            method,
            name: name.to_string(),
            data,
            description,
        });
        record_point(
            &self.inner.writer,
            "event",
            EVENT_DESCRIPTION_CHANGE,
            &emitted.data_json(),
        )
        .await;
    }

    /// Adds a Property, optionally seeding its stored value, and emits a
    /// TD change event carrying the new TD snapshot.
    pub async fn add_property(
        &self,
        name: &str,
        property: Property,
        initial_value: Option<Value>,
    ) -> Result<()> {
        let data = serde_json::to_value(&property).ok();

        self.with_thing_mut(|thing| thing.add_property(name, property))
            .await?;

        if let Some(value) = initial_value {
            self.inner
                .property_values
                .write()
                .await
                .insert(name.to_string(), value);
        }

        self.emit_td_change(TdChangeType::Property, TdChangeMethod::Add, name, data)
            .await;

        Ok(())
    }

    /// Removes a Property and its stored value and handlers
    pub async fn remove_property(&self, name: &str) -> Result<()> {
        let key = self.property_key(name).await?;

        self.with_thing_mut(|thing| thing.remove_interaction(&key))
            .await;
        self.inner.property_values.write().await.remove(&key);
        self.inner
            .read_handlers
            .write()
            .await
            .per_interaction
            .remove(&key);
        self.inner
            .write_handlers
            .write()
            .await
            .per_interaction
            .remove(&key);

        self.emit_td_change(TdChangeType::Property, TdChangeMethod::Remove, &key, None)
            .await;

        Ok(())
    }

    /// Adds an Action, optionally registering its handler in one step
    pub async fn add_action(
        &self,
        name: &str,
        action: Action,
        handler: Option<ActionHandler>,
    ) -> Result<()> {
        let data = serde_json::to_value(&action).ok();

        self.with_thing_mut(|thing| thing.add_action(name, action))
            .await?;

        if let Some(handler) = handler {
            self.inner
                .action_handlers
                .write()
                .await
                .per_interaction
                .insert(name.to_string(), handler);
        }

        self.emit_td_change(TdChangeType::Action, TdChangeMethod::Add, name, data)
            .await;

        Ok(())
    }

    pub async fn remove_action(&self, name: &str) -> Result<()> {
        let key = self.action_key(name).await?;

        self.with_thing_mut(|thing| thing.remove_interaction(&key))
            .await;
        self.inner
            .action_handlers
            .write()
            .await
            .per_interaction
            .remove(&key);

        self.emit_td_change(TdChangeType::Action, TdChangeMethod::Remove, &key, None)
            .await;

        Ok(())
    }

    pub async fn add_event(&self, name: &str, event: Event) -> Result<()> {
        let data = serde_json::to_value(&event).ok();

        self.with_thing_mut(|thing| thing.add_event(name, event))
            .await?;

        self.emit_td_change(TdChangeType::Event, TdChangeMethod::Add, name, data)
            .await;

        Ok(())
    }

    pub async fn remove_event(&self, name: &str) -> Result<()> {
        let key = self.event_key(name).await?;

        self.with_thing_mut(|thing| thing.remove_interaction(&key))
            .await;

        self.emit_td_change(TdChangeType::Event, TdChangeMethod::Remove, &key, None)
            .await;

        Ok(())
    }

    /// Registers the handler for one action
    pub async fn set_action_handler(&self, name: &str, handler: ActionHandler) -> Result<()> {
        let key = self.action_key(name).await?;
        self.inner
            .action_handlers
            .write()
            .await
            .per_interaction
            .insert(key, handler);
        Ok(())
    }

    /// Registers the read handler for one property
    pub async fn set_property_read_handler(
        &self,
        name: &str,
        handler: PropertyReadHandler,
    ) -> Result<()> {
        let key = self.property_key(name).await?;
        self.inner
            .read_handlers
            .write()
            .await
            .per_interaction
            .insert(key, handler);
        Ok(())
    }

    /// Registers the write handler for one property
    pub async fn set_property_write_handler(
        &self,
        name: &str,
        handler: PropertyWriteHandler,
    ) -> Result<()> {
        let key = self.property_key(name).await?;
        self.inner
            .write_handlers
            .write()
            .await
            .per_interaction
            .insert(key, handler);
        Ok(())
    }

    /// Installs the global fallback action handler
    pub async fn set_default_action_handler(&self, handler: ActionHandler) {
        self.inner.action_handlers.write().await.global = Some(handler);
    }

    /// Installs the global fallback read handler
    pub async fn set_default_property_read_handler(&self, handler: PropertyReadHandler) {
        self.inner.read_handlers.write().await.global = Some(handler);
    }

    /// Installs the global fallback write handler
    pub async fn set_default_property_write_handler(&self, handler: PropertyWriteHandler) {
        self.inner.write_handlers.write().await.global = Some(handler);
    }

    /// Subscribes to change notifications of one observable property
    pub async fn on_property_change(
        &self,
        name: &str,
        observer: Observer,
    ) -> Result<Subscription> {
        let key = self.property_key(name).await?;

        let observable = {
            let thing = self.inner.thing.read().await;
            thing
                .properties
                .get(&key)
                .map(|p| p.observable)
                .unwrap_or(false)
        };

        if !observable {
            return Err(Error::NotSupported(format!(
                "Property is not observable: {}",
                key
            )));
        }

        Ok(self
            .inner
            .bus
            .subscribe_filtered(property_change_filter(key), observer))
    }

    /// Subscribes to emissions of one declared event
    pub async fn on_event(&self, name: &str, observer: Observer) -> Result<Subscription> {
        let key = self.event_key(name).await?;
        Ok(self
            .inner
            .bus
            .subscribe_filtered(event_name_filter(key), observer))
    }

    /// Subscribes to TD change notifications
    pub fn on_td_change(&self, observer: Observer) -> Subscription {
        self.inner
            .bus
            .subscribe_filtered(event_name_filter(EVENT_DESCRIPTION_CHANGE), observer)
    }

    /// Start serving external requests for this Thing
    pub async fn expose(&self) -> Result<()> {
        self.servient()?.enable_exposed_thing(&self.inner.title).await
    }

    /// Stop serving external requests for this Thing
    pub async fn destroy(&self) -> Result<()> {
        self.servient()?.remove_exposed_thing(&self.inner.title).await
    }
}

/// Registry of ExposedThings keyed by Thing title, shared between the
/// servient and its servers.
#[derive(Clone, Default)]
pub struct ExposedThingSet {
    things: Arc<RwLock<HashMap<String, ExposedThing>>>,
}

impl ExposedThingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a Thing, rejecting duplicate titles and URL-safe names
    pub async fn add(&self, exposed_thing: ExposedThing) -> Result<()> {
        let mut things = self.things.write().await;

        let duplicate = things.values().any(|existing| {
            existing.title() == exposed_thing.title()
                || existing.url_name() == exposed_thing.url_name()
        });
        if duplicate {
            return Err(Error::State(format!(
                "Duplicate Thing: {}",
                exposed_thing.title()
            )));
        }

        things.insert(exposed_thing.title().to_string(), exposed_thing);
        Ok(())
    }

    /// Removes a Thing by title or URL-safe name
    pub async fn remove(&self, name: &str) -> Option<ExposedThing> {
        let mut things = self.things.write().await;
        let key = things
            .values()
            .find(|thing| thing.title() == name || thing.url_name() == name)
            .map(|thing| thing.title().to_string())?;
        things.remove(&key)
    }

    /// Finds a Thing by title or URL-safe name
    pub async fn find(&self, name: &str) -> Option<ExposedThing> {
        self.things
            .read()
            .await
            .values()
            .find(|thing| thing.title() == name || thing.url_name() == name)
            .cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.find(name).await.is_some()
    }

    /// Snapshot of all registered Things
    pub async fn all(&self) -> Vec<ExposedThing> {
        self.things.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryWriter;
    use crate::td::{DataSchema, DataType};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn standalone(thing: Thing) -> ExposedThing {
        ExposedThing::new(Weak::new(), Arc::new(crate::persistence::NopWriter), thing)
    }

    fn thing_with_property(name: &str, observable: bool) -> Thing {
        let mut thing = Thing::new("test-thing");
        thing
            .add_property(
                name,
                Property::new(DataSchema::of_type(DataType::Number), observable),
            )
            .unwrap();
        thing
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let exposed = standalone(thing_with_property("temperature", true));

        exposed
            .write_property("temperature", json!(21.5))
            .await
            .unwrap();
        let value = exposed.read_property("temperature").await.unwrap();
        assert_eq!(value, json!(21.5));
    }

    #[tokio::test]
    async fn test_unknown_property_is_not_supported() {
        let exposed = standalone(Thing::new("empty"));
        let err = exposed.read_property("missing").await.unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));

        // Nothing must reach the bus for unknown properties
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        exposed.events().subscribe_filtered(
            |_| true,
            Observer::new(move |_| {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let _ = exposed.write_property("missing", json!(1)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_read_resolves_url_safe_name() {
        let exposed = standalone(thing_with_property("waterLevel", false));
        exposed
            .write_property("waterlevel", json!(80))
            .await
            .unwrap();
        assert_eq!(
            exposed.read_property("waterLevel").await.unwrap(),
            json!(80)
        );
    }

    #[tokio::test]
    async fn test_custom_read_handler_overrides_storage() {
        let exposed = standalone(thing_with_property("temperature", false));
        exposed
            .write_property("temperature", json!(10))
            .await
            .unwrap();

        exposed
            .set_property_read_handler(
                "temperature",
                Arc::new(|_, _| Box::pin(async { Ok(json!(42)) })),
            )
            .await
            .unwrap();

        assert_eq!(
            exposed.read_property("temperature").await.unwrap(),
            json!(42)
        );
    }

    #[tokio::test]
    async fn test_global_handler_is_fallback() {
        let exposed = standalone(thing_with_property("temperature", false));

        exposed
            .set_default_property_read_handler(Arc::new(|_, _| Box::pin(async { Ok(json!(7)) })))
            .await;
        assert_eq!(exposed.read_property("temperature").await.unwrap(), json!(7));

        // The per-interaction handler takes precedence over the global one
        exposed
            .set_property_read_handler(
                "temperature",
                Arc::new(|_, _| Box::pin(async { Ok(json!(8)) })),
            )
            .await
            .unwrap();
        assert_eq!(exposed.read_property("temperature").await.unwrap(), json!(8));
    }

    #[tokio::test]
    async fn test_external_write_rejected_on_read_only() {
        let mut thing = Thing::new("t");
        let mut schema = DataSchema::of_type(DataType::Number);
        schema.read_only = true;
        thing
            .add_property("level", Property::new(schema, false))
            .unwrap();
        let exposed = standalone(thing);

        let err = exposed
            .handle_write_property("level", json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Handler(_)));

        // The internal write path is still allowed
        exposed.write_property("level", json!(2)).await.unwrap();
        assert_eq!(exposed.read_property("level").await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_invoke_action_without_handler_fails() {
        let mut thing = Thing::new("t");
        thing.add_action("brew", Action::default()).unwrap();
        let exposed = standalone(thing);

        let err = exposed.invoke_action("brew", None).await.unwrap_err();
        assert!(err.to_string().contains("Undefined action handler"));
    }

    #[tokio::test]
    async fn test_invoke_action_emits_after_return() {
        let mut thing = Thing::new("t");
        thing.add_action("makeDrink", Action::default()).unwrap();
        let exposed = standalone(thing);

        exposed
            .set_action_handler(
                "makeDrink",
                Arc::new(|_, _, input| {
                    Box::pin(async move {
                        let drink = input
                            .and_then(|v| v.as_str().map(str::to_string))
                            .unwrap_or_default();
                        Ok(json!(format!("Your {} is in progress!", drink)))
                    })
                }),
            )
            .await
            .unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        exposed.events().subscribe_filtered(
            event_name_filter(crate::events::EVENT_ACTION_INVOCATION),
            Observer::new(move |event| {
                if let EventKind::ActionInvocation { return_value, error, .. } = &event.kind {
                    assert!(error.is_none());
                    assert_eq!(
                        return_value.as_ref().unwrap(),
                        &json!("Your latte is in progress!")
                    );
                }
                seen_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = exposed
            .invoke_action("makeDrink", Some(json!("latte")))
            .await
            .unwrap();
        assert_eq!(result, json!("Your latte is in progress!"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_invocation_event_captures_error() {
        let mut thing = Thing::new("t");
        thing.add_action("explode", Action::default()).unwrap();
        let exposed = standalone(thing);

        exposed
            .set_action_handler(
                "explode",
                Arc::new(|_, _, _| {
                    Box::pin(async { Err(Error::Handler("kaboom".to_string())) })
                }),
            )
            .await
            .unwrap();

        let seen_error = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen_error.clone();
        exposed.events().subscribe_filtered(
            event_name_filter(crate::events::EVENT_ACTION_INVOCATION),
            Observer::new(move |event| {
                if let EventKind::ActionInvocation { error, .. } = &event.kind {
                    if error.as_deref().map(|e| e.contains("kaboom")).unwrap_or(false) {
                        seen_clone.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(exposed.invoke_action("explode", None).await.is_err());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen_error.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_emit_event_requires_declaration() {
        let mut thing = Thing::new("t");
        thing.add_event("lowWater", Event::default()).unwrap();
        let exposed = standalone(thing);

        exposed
            .emit_event("lowWater", Some(json!("20%")))
            .await
            .unwrap();
        let err = exposed.emit_event("undeclared", None).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_add_property_emits_td_change() {
        let exposed = standalone(Thing::new("t"));

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        exposed.on_td_change(Observer::new(move |event| {
            if let EventKind::ThingDescriptionChange { method, description, .. } = &event.kind {
                assert_eq!(*method, TdChangeMethod::Add);
                assert!(description.is_some());
            }
            seen_clone.fetch_add(1, Ordering::SeqCst);
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;

        exposed
            .add_property(
                "temp",
                Property::new(DataSchema::of_type(DataType::Number), true),
                Some(json!(20)),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(exposed.read_property("temp").await.unwrap(), json!(20));
    }

    #[tokio::test]
    async fn test_observe_requires_observable_flag() {
        let exposed = standalone(thing_with_property("silent", false));

        let err = exposed
            .on_property_change("silent", Observer::new(|_| {}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[tokio::test]
    async fn test_property_values_recorded_through_writer() {
        let writer = Arc::new(MemoryWriter::new());
        let exposed = ExposedThing::new(
            Weak::new(),
            writer.clone(),
            thing_with_property("status", false),
        );

        exposed
            .write_property("status", json!({"water": {"level": 80}}))
            .await
            .unwrap();

        let points = writer.points().await;
        assert!(points
            .iter()
            .any(|(bucket, key, _)| bucket == "property" && key == "status.water.level"));
    }

    #[tokio::test]
    async fn test_thing_set_rejects_duplicates() {
        let set = ExposedThingSet::new();
        set.add(standalone(Thing::new("My Thing"))).await.unwrap();

        // Same slug, different title
        let err = set.add(standalone(Thing::new("my thing"))).await.unwrap_err();
        assert!(matches!(err, Error::State(_)));

        assert!(set.find("my-thing").await.is_some());
        assert!(set.contains("My Thing").await);

        set.remove("my-thing").await.unwrap();
        assert!(!set.contains("My Thing").await);
    }
}
