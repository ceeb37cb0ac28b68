//! Event bus and observers
//!
//! In-process multicast of emitted events with filtered subscriptions and
//! a finalization contract: every subscription receives exactly one
//! terminal callback (`complete` or `error`) and no `next` after it.

mod bus;
mod observer;

pub use bus::{event_name_filter, property_change_filter, EventBus};
pub use observer::{finalize, Observer, Subscription};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

/// Default event name for property change notifications
pub const EVENT_PROPERTY_CHANGE: &str = "propertychange";
/// Default event name for action invocation notifications
pub const EVENT_ACTION_INVOCATION: &str = "actioninvocation";
/// Default event name for TD change notifications
pub const EVENT_DESCRIPTION_CHANGE: &str = "descriptionchange";

/// Section of the TD a description change applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TdChangeType {
    Property,
    Action,
    Event,
}

impl TdChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TdChangeType::Property => "property",
            TdChangeType::Action => "action",
            TdChangeType::Event => "event",
        }
    }
}

/// Operation applied to the TD
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TdChangeMethod {
    Add,
    Remove,
    Change,
}

impl TdChangeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            TdChangeMethod::Add => "add",
            TdChangeMethod::Remove => "remove",
            TdChangeMethod::Change => "change",
        }
    }
}

/// Payload variants carried on the event bus
#[derive(Debug, Clone)]
pub enum EventKind {
    /// A property value was written
    PropertyChange { name: String, value: Value },

    /// An action handler returned (or failed)
    ActionInvocation {
        action_name: String,
        return_value: Option<Value>,
        error: Option<String>,
    },

    /// The Thing Description was edited
    ThingDescriptionChange {
        change_type: TdChangeType,
        method: TdChangeMethod,
        name: String,
        data: Option<Value>,
        description: Option<Value>,
    },

    /// A user-declared event emission
    Custom { name: String, payload: Option<Value> },
}

/// An event observed on a Thing's bus. The timestamp is assigned at emit.
#[derive(Debug, Clone)]
pub struct EmittedEvent {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

impl EmittedEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
        }
    }

    /// The event name used by name-based subscription filters
    pub fn name(&self) -> &str {
        match &self.kind {
            EventKind::PropertyChange { .. } => EVENT_PROPERTY_CHANGE,
            EventKind::ActionInvocation { .. } => EVENT_ACTION_INVOCATION,
            EventKind::ThingDescriptionChange { .. } => EVENT_DESCRIPTION_CHANGE,
            EventKind::Custom { name, .. } => name,
        }
    }

    /// JSON rendering of the event data, as published by bindings
    pub fn data_json(&self) -> Value {
        match &self.kind {
            EventKind::PropertyChange { name, value } => json!({
                "name": name,
                "value": value,
            }),
            EventKind::ActionInvocation {
                action_name,
                return_value,
                error,
            } => json!({
                "actionName": action_name,
                "returnValue": return_value,
                "error": error,
            }),
            EventKind::ThingDescriptionChange {
                change_type,
                method,
                name,
                data,
                description,
            } => json!({
                "tdChangeType": change_type.as_str(),
                "method": method.as_str(),
                "name": name,
                "data": data,
                "description": description,
            }),
            EventKind::Custom { payload, .. } => payload.clone().unwrap_or(Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        let change = EmittedEvent::new(EventKind::PropertyChange {
            name: "temp".into(),
            value: json!(21.5),
        });
        assert_eq!(change.name(), EVENT_PROPERTY_CHANGE);

        let custom = EmittedEvent::new(EventKind::Custom {
            name: "outOfWater".into(),
            payload: None,
        });
        assert_eq!(custom.name(), "outOfWater");
    }

    #[test]
    fn test_property_change_data_json() {
        let event = EmittedEvent::new(EventKind::PropertyChange {
            name: "temp".into(),
            value: json!(21.5),
        });
        assert_eq!(event.data_json(), json!({"name": "temp", "value": 21.5}));
    }

    #[test]
    fn test_invocation_error_is_captured() {
        let event = EmittedEvent::new(EventKind::ActionInvocation {
            action_name: "makeDrink".into(),
            return_value: None,
            error: Some("out of water".into()),
        });
        let data = event.data_json();
        assert_eq!(data["error"], json!("out of water"));
        assert_eq!(data["returnValue"], Value::Null);
    }
}
