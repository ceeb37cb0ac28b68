//! The Thing abstraction

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};

use super::form::Form;
use super::interaction::{Action, Event, Interaction, InteractionFormsMut, Property};
use super::security::SecurityScheme;
use super::{is_valid_safe_name, url_name};
use crate::error::{Error, Result};
use crate::protocols::Protocol;

/// TD context IRI used for Things built programmatically
pub const WOT_TD_CONTEXT: &str = "https://www.w3.org/2022/wot/td/v1.1";

fn default_context() -> Value {
    json!(WOT_TD_CONTEXT)
}

/// The `security` member may be a single scheme name or a list.
fn one_or_many_strings<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(name)) => vec![name],
        Some(OneOrMany::Many(names)) => names,
    })
}

/// An abstraction of a physical or virtual entity whose metadata and
/// interfaces are described by a WoT Thing Description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thing {
    #[serde(rename = "@context", default = "default_context")]
    pub context: Value,

    #[serde(rename = "@type", skip_serializing_if = "Option::is_none")]
    pub thing_type: Option<Value>,

    /// Thing identifier, unique within a servient
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Human-readable title; its slug is the URL-safe Thing name
    pub title: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Base URL that relative form hrefs resolve against
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,

    /// Active security scheme names, referring into `securityDefinitions`
    #[serde(default, deserialize_with = "one_or_many_strings")]
    pub security: Vec<String>,

    #[serde(rename = "securityDefinitions", default)]
    pub security_definitions: BTreeMap<String, SecurityScheme>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Property>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub actions: BTreeMap<String, Action>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub events: BTreeMap<String, Event>,

    /// Declared fields this runtime does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Thing {
    /// A minimal Thing with `nosec` security, suitable as a starting point
    /// for programmatic construction.
    pub fn new(title: impl Into<String>) -> Self {
        let mut security_definitions = BTreeMap::new();
        security_definitions.insert("nosec_sc".to_string(), SecurityScheme::Nosec);

        Self {
            context: default_context(),
            thing_type: None,
            id: None,
            title: title.into(),
            description: None,
            base: None,
            security: vec!["nosec_sc".to_string()],
            security_definitions,
            properties: BTreeMap::new(),
            actions: BTreeMap::new(),
            events: BTreeMap::new(),
            extra: Map::new(),
        }
    }

    /// URL-safe name of this Thing
    pub fn url_name(&self) -> String {
        url_name(&self.title)
    }

    /// Iterates over every interaction of the Thing
    pub fn interactions(&self) -> impl Iterator<Item = Interaction<'_>> {
        self.properties
            .iter()
            .map(|(name, p)| Interaction::Property(name.as_str(), p))
            .chain(
                self.actions
                    .iter()
                    .map(|(name, a)| Interaction::Action(name.as_str(), a)),
            )
            .chain(
                self.events
                    .iter()
                    .map(|(name, e)| Interaction::Event(name.as_str(), e)),
            )
    }

    /// Finds an interaction by name. The argument may be the declared name
    /// or its URL-safe version.
    pub fn find_interaction(&self, name: &str) -> Option<Interaction<'_>> {
        self.interactions()
            .find(|intrct| intrct.name() == name || intrct.url_name() == name)
    }

    /// All forms (declared and generated) of the named interaction
    pub fn get_forms(&self, name: &str) -> Vec<&Form> {
        self.find_interaction(name)
            .map(|intrct| intrct.forms())
            .unwrap_or_default()
    }

    pub fn get_property_forms(&self, name: &str) -> Vec<&Form> {
        self.resolve_key(&self.properties, name)
            .and_then(|key| self.properties.get(&key))
            .map(|p| p.td_forms.iter().chain(p.generated_forms.iter()).collect())
            .unwrap_or_default()
    }

    pub fn get_action_forms(&self, name: &str) -> Vec<&Form> {
        self.resolve_key(&self.actions, name)
            .and_then(|key| self.actions.get(&key))
            .map(|a| a.td_forms.iter().chain(a.generated_forms.iter()).collect())
            .unwrap_or_default()
    }

    pub fn get_event_forms(&self, name: &str) -> Vec<&Form> {
        self.resolve_key(&self.events, name)
            .and_then(|key| self.events.get(&key))
            .map(|e| e.td_forms.iter().chain(e.generated_forms.iter()).collect())
            .unwrap_or_default()
    }

    fn resolve_key<T>(&self, map: &BTreeMap<String, T>, name: &str) -> Option<String> {
        map.keys()
            .find(|key| key.as_str() == name || url_name(key) == name)
            .cloned()
    }

    fn assert_new_name(&self, name: &str) -> Result<()> {
        if !is_valid_safe_name(name) {
            return Err(Error::NotSupported(format!(
                "Invalid interaction name: {}",
                name
            )));
        }

        let slug = url_name(name);
        if self
            .interactions()
            .any(|intrct| intrct.name() == name || intrct.url_name() == slug)
        {
            return Err(Error::State(format!("Duplicate interaction: {}", name)));
        }

        Ok(())
    }

    /// Adds a Property, rejecting duplicate names and slugs
    pub fn add_property(&mut self, name: &str, property: Property) -> Result<()> {
        self.assert_new_name(name)?;
        self.properties.insert(name.to_string(), property);
        Ok(())
    }

    /// Adds an Action, rejecting duplicate names and slugs
    pub fn add_action(&mut self, name: &str, action: Action) -> Result<()> {
        self.assert_new_name(name)?;
        self.actions.insert(name.to_string(), action);
        Ok(())
    }

    /// Adds an Event, rejecting duplicate names and slugs
    pub fn add_event(&mut self, name: &str, event: Event) -> Result<()> {
        self.assert_new_name(name)?;
        self.events.insert(name.to_string(), event);
        Ok(())
    }

    /// Removes an interaction by declared or URL-safe name
    pub fn remove_interaction(&mut self, name: &str) {
        if let Some(key) = self.resolve_key(&self.properties, name) {
            self.properties.remove(&key);
        }
        if let Some(key) = self.resolve_key(&self.actions, name) {
            self.actions.remove(&key);
        }
        if let Some(key) = self.resolve_key(&self.events, name) {
            self.events.remove(&key);
        }
    }

    pub(crate) fn interaction_forms_mut(
        &mut self,
        name: &str,
    ) -> Option<InteractionFormsMut<'_>> {
        if let Some(key) = self.resolve_key(&self.properties, name) {
            return self
                .properties
                .get_mut(&key)
                .map(InteractionFormsMut::Property);
        }
        if let Some(key) = self.resolve_key(&self.actions, name) {
            return self.actions.get_mut(&key).map(InteractionFormsMut::Action);
        }
        if let Some(key) = self.resolve_key(&self.events, name) {
            return self.events.get_mut(&key).map(InteractionFormsMut::Event);
        }
        None
    }

    fn for_each_forms_mut(&mut self, mut f: impl FnMut(&mut InteractionFormsMut<'_>)) {
        for property in self.properties.values_mut() {
            f(&mut InteractionFormsMut::Property(property));
        }
        for action in self.actions.values_mut() {
            f(&mut InteractionFormsMut::Action(action));
        }
        for event in self.events.values_mut() {
            f(&mut InteractionFormsMut::Event(event));
        }
    }

    /// Removes every generated form from every interaction
    pub fn clean_generated_forms(&mut self) {
        self.for_each_forms_mut(|forms| forms.clean_generated_forms());
    }

    /// Removes the generated forms that belong to the given protocol
    pub fn remove_protocol_forms(&mut self, protocol: Protocol) {
        self.for_each_forms_mut(|forms| forms.remove_protocol_forms(protocol));
    }

    /// Adds a generated form to the named interaction. Duplicate forms
    /// (by stable identity) are rejected.
    pub fn add_generated_form(&mut self, name: &str, form: Form) -> Result<()> {
        let mut access = self
            .interaction_forms_mut(name)
            .ok_or_else(|| Error::NotFound(format!("Unknown interaction: {}", name)))?;

        if !access.add_generated_form(form) {
            return Err(Error::State(format!("Duplicate form on {}", name)));
        }

        Ok(())
    }

    /// Checks the structural invariants of this Thing: security names must
    /// resolve, interaction names must be valid and unique per slug.
    pub fn validate(&self) -> Result<()> {
        for scheme_name in &self.security {
            if !self.security_definitions.contains_key(scheme_name) {
                return Err(Error::NotSupported(format!(
                    "Security scheme not defined: {}",
                    scheme_name
                )));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for intrct in self.interactions() {
            if !is_valid_safe_name(intrct.name()) {
                return Err(Error::NotSupported(format!(
                    "Invalid interaction name: {}",
                    intrct.name()
                )));
            }
            if !seen.insert(intrct.url_name()) {
                return Err(Error::State(format!(
                    "Duplicate interaction: {}",
                    intrct.name()
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::InteractionVerb;
    use crate::td::DataSchema;

    #[test]
    fn test_new_thing_is_valid() {
        let thing = Thing::new("Coffee Machine");
        assert_eq!(thing.url_name(), "coffee-machine");
        thing.validate().unwrap();
    }

    #[test]
    fn test_duplicate_names_rejected_across_kinds() {
        let mut thing = Thing::new("t");
        thing
            .add_property("status", Property::new(DataSchema::default(), false))
            .unwrap();

        let err = thing.add_action("status", Action::default()).unwrap_err();
        assert!(matches!(err, Error::State(_)));
    }

    #[test]
    fn test_duplicate_slug_rejected() {
        let mut thing = Thing::new("t");
        thing
            .add_property("My_Prop", Property::new(DataSchema::default(), false))
            .unwrap();

        // Different declared name but the same slug
        let err = thing
            .add_property("my-prop", Property::new(DataSchema::default(), false))
            .unwrap_err();
        assert!(matches!(err, Error::State(_)));
    }

    #[test]
    fn test_invalid_name_rejected() {
        let mut thing = Thing::new("t");
        let err = thing
            .add_property("bad name", Property::new(DataSchema::default(), false))
            .unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn test_find_interaction_by_slug() {
        let mut thing = Thing::new("t");
        thing
            .add_action("makeDrink", Action::default())
            .unwrap();

        assert!(thing.find_interaction("makeDrink").is_some());
        assert!(thing.find_interaction("makedrink").is_some());
        assert!(thing.find_interaction("missing").is_none());
    }

    #[test]
    fn test_remove_interaction_by_slug() {
        let mut thing = Thing::new("t");
        thing.add_event("lowWater", Event::default()).unwrap();
        thing.remove_interaction("lowwater");
        assert!(thing.find_interaction("lowWater").is_none());
    }

    #[test]
    fn test_unresolved_security_fails_validation() {
        let mut thing = Thing::new("t");
        thing.security = vec!["missing_sc".to_string()];
        assert!(thing.validate().is_err());
    }

    #[test]
    fn test_generated_form_cleanup() {
        let mut thing = Thing::new("t");
        thing
            .add_property("temp", Property::new(DataSchema::default(), true))
            .unwrap();

        thing
            .add_generated_form(
                "temp",
                Form::generated(
                    Protocol::Http,
                    "http://host/t/property/temp",
                    vec![InteractionVerb::ReadProperty],
                ),
            )
            .unwrap();
        assert_eq!(thing.get_forms("temp").len(), 1);

        thing.clean_generated_forms();
        assert!(thing.get_forms("temp").is_empty());
    }
}
