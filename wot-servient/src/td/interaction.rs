//! Interaction patterns: Properties, Actions and Events

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::form::Form;
use super::schema::DataSchema;
use super::url_name;
use crate::protocols::Protocol;

fn is_false(val: &bool) -> bool {
    !*val
}

/// The three interaction types of the TD interaction model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InteractionKind {
    Property,
    Action,
    Event,
}

impl std::fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InteractionKind::Property => "property",
            InteractionKind::Action => "action",
            InteractionKind::Event => "event",
        };
        write!(f, "{}", name)
    }
}

/// Internal state of a Thing that can be read and optionally written
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Property {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Schema of the property value
    #[serde(flatten)]
    pub schema: DataSchema,

    /// Whether change observation is offered
    #[serde(default, skip_serializing_if = "is_false")]
    pub observable: bool,

    /// Forms declared in the TD document; immutable for the life of the Thing
    #[serde(rename = "forms", default, skip_serializing_if = "Vec::is_empty")]
    pub td_forms: Vec<Form>,

    /// Forms generated by the servient; rebuilt on topology changes
    #[serde(skip)]
    pub generated_forms: Vec<Form>,

    /// Declared fields this runtime does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Property {
    pub fn new(schema: DataSchema, observable: bool) -> Self {
        Self {
            schema,
            observable,
            ..Self::default()
        }
    }

    pub fn is_writable(&self) -> bool {
        self.schema.is_writable()
    }
}

/// A function of the Thing, possibly manipulating state that is not
/// reachable through properties
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Action {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Input schema
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<DataSchema>,

    /// Output schema
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<DataSchema>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub safe: bool,

    #[serde(default, skip_serializing_if = "is_false")]
    pub idempotent: bool,

    #[serde(rename = "forms", default, skip_serializing_if = "Vec::is_empty")]
    pub td_forms: Vec<Form>,

    #[serde(skip)]
    pub generated_forms: Vec<Form>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An asynchronous message source pushed by the Thing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Event {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Schema of the pushed messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<DataSchema>,

    /// Data passed upon subscription
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<DataSchema>,

    /// Data passed to cancel a subscription
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancellation: Option<DataSchema>,

    #[serde(rename = "forms", default, skip_serializing_if = "Vec::is_empty")]
    pub td_forms: Vec<Form>,

    #[serde(skip)]
    pub generated_forms: Vec<Form>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Borrowed view over one interaction of a Thing, carrying its map key
#[derive(Debug, Clone, Copy)]
pub enum Interaction<'a> {
    Property(&'a str, &'a Property),
    Action(&'a str, &'a Action),
    Event(&'a str, &'a Event),
}

impl<'a> Interaction<'a> {
    /// Interaction name as declared in the TD
    pub fn name(&self) -> &'a str {
        match self {
            Interaction::Property(name, _)
            | Interaction::Action(name, _)
            | Interaction::Event(name, _) => name,
        }
    }

    /// URL-safe version of the name
    pub fn url_name(&self) -> String {
        url_name(self.name())
    }

    pub fn kind(&self) -> InteractionKind {
        match self {
            Interaction::Property(..) => InteractionKind::Property,
            Interaction::Action(..) => InteractionKind::Action,
            Interaction::Event(..) => InteractionKind::Event,
        }
    }

    /// All forms of the interaction: TD-declared first, generated after
    pub fn forms(&self) -> Vec<&'a Form> {
        let (td_forms, generated) = match self {
            Interaction::Property(_, p) => (&p.td_forms, &p.generated_forms),
            Interaction::Action(_, a) => (&a.td_forms, &a.generated_forms),
            Interaction::Event(_, e) => (&e.td_forms, &e.generated_forms),
        };
        td_forms.iter().chain(generated.iter()).collect()
    }
}

/// Mutable access to the form lists of one interaction
pub(crate) enum InteractionFormsMut<'a> {
    Property(&'a mut Property),
    Action(&'a mut Action),
    Event(&'a mut Event),
}

impl InteractionFormsMut<'_> {
    pub(crate) fn generated_forms_mut(&mut self) -> &mut Vec<Form> {
        match self {
            InteractionFormsMut::Property(p) => &mut p.generated_forms,
            InteractionFormsMut::Action(a) => &mut a.generated_forms,
            InteractionFormsMut::Event(e) => &mut e.generated_forms,
        }
    }

    /// Adds a generated form, rejecting duplicates by stable form identity.
    pub(crate) fn add_generated_form(&mut self, form: Form) -> bool {
        let forms = self.generated_forms_mut();
        if forms.iter().any(|existing| existing.id() == form.id()) {
            return false;
        }
        forms.push(form);
        true
    }

    pub(crate) fn clean_generated_forms(&mut self) {
        self.generated_forms_mut().clear();
    }

    pub(crate) fn remove_protocol_forms(&mut self, protocol: Protocol) {
        self.generated_forms_mut()
            .retain(|form| form.protocol != Some(protocol));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::InteractionVerb;
    use serde_json::json;

    #[test]
    fn test_property_parses_flattened_schema() {
        let prop: Property = serde_json::from_value(json!({
            "type": "number",
            "unit": "celsius",
            "observable": true,
            "forms": [{"href": "http://host/t/property/temp", "op": "readproperty"}]
        }))
        .unwrap();

        assert_eq!(prop.schema.data_type, Some(super::super::DataType::Number));
        assert!(prop.observable);
        assert_eq!(prop.td_forms.len(), 1);
        assert!(prop.generated_forms.is_empty());
    }

    #[test]
    fn test_property_preserves_unknown_fields() {
        let prop: Property = serde_json::from_value(json!({
            "type": "string",
            "customAnnotation": {"nested": true}
        }))
        .unwrap();
        assert!(prop.extra.contains_key("customAnnotation"));
    }

    #[test]
    fn test_action_flags_default_false() {
        let action: Action = serde_json::from_value(json!({
            "input": {"type": "string"},
            "output": {"type": "string"}
        }))
        .unwrap();
        assert!(!action.safe);
        assert!(!action.idempotent);
    }

    #[test]
    fn test_generated_form_dedup() {
        let mut prop = Property::new(DataSchema::default(), true);
        let form = Form::generated(
            Protocol::Http,
            "http://host/t/property/p",
            vec![InteractionVerb::ReadProperty],
        );

        let mut access = InteractionFormsMut::Property(&mut prop);
        assert!(access.add_generated_form(form.clone()));
        assert!(!access.add_generated_form(form));
        assert_eq!(prop.generated_forms.len(), 1);
    }

    #[test]
    fn test_remove_protocol_forms() {
        let mut prop = Property::new(DataSchema::default(), true);
        {
            let mut access = InteractionFormsMut::Property(&mut prop);
            access.add_generated_form(Form::generated(
                Protocol::Http,
                "http://host/p",
                vec![InteractionVerb::ReadProperty],
            ));
            access.add_generated_form(Form::generated(
                Protocol::Mqtt,
                "mqtt://broker/p",
                vec![InteractionVerb::ObserveProperty],
            ));
            access.remove_protocol_forms(Protocol::Http);
        }

        assert_eq!(prop.generated_forms.len(), 1);
        assert_eq!(prop.generated_forms[0].protocol, Some(Protocol::Mqtt));
    }
}
