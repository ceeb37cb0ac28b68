//! Thing Description codec
//!
//! Parsing validates the document and builds a [`Thing`]; emission returns
//! an equivalent JSON document carrying all declared fields plus the
//! current set of generated forms.

use std::time::Duration;

use serde_json::{Map, Value};

use super::thing::Thing;
use crate::error::{Error, Result};

/// Default timeout for retrieving a remote TD
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(20);

const REQUIRED_FIELDS: [&str; 4] = ["@context", "title", "security", "securityDefinitions"];

/// Codec between TD documents and the [`Thing`] model
pub struct ThingDescription;

impl ThingDescription {
    /// Checks the structural requirements of a TD document without
    /// building a Thing.
    pub fn validate(doc: &Value) -> Result<()> {
        let obj = doc
            .as_object()
            .ok_or_else(|| Error::Protocol("TD document is not a JSON object".into()))?;

        for field in REQUIRED_FIELDS {
            if !obj.contains_key(field) {
                return Err(Error::Protocol(format!(
                    "TD document is missing required field: {}",
                    field
                )));
            }
        }

        for section in ["properties", "actions", "events"] {
            let Some(interactions) = obj.get(section).and_then(Value::as_object) else {
                continue;
            };

            for (name, interaction) in interactions {
                let forms = interaction.get("forms").and_then(Value::as_array);
                for form in forms.into_iter().flatten() {
                    if form.get("href").and_then(Value::as_str).is_none() {
                        return Err(Error::Protocol(format!(
                            "Form without href on interaction: {}",
                            name
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Parses and validates a TD document
    pub fn parse(doc: &Value) -> Result<Thing> {
        Self::validate(doc)?;

        let thing: Thing = serde_json::from_value(doc.clone())
            .map_err(|e| Error::Protocol(format!("Invalid TD document: {}", e)))?;

        thing.validate()?;

        Ok(thing)
    }

    /// Parses a TD document from its string form
    pub fn parse_str(doc: &str) -> Result<Thing> {
        let value: Value = serde_json::from_str(doc)?;
        Self::parse(&value)
    }

    /// Emits the TD document of a Thing, merging generated forms into the
    /// declared ones.
    pub fn from_thing(thing: &Thing) -> Value {
        let mut doc = serde_json::to_value(thing).unwrap_or(Value::Null);

        let Some(obj) = doc.as_object_mut() else {
            return doc;
        };

        merge_generated_forms(obj, "properties", thing);
        merge_generated_forms(obj, "actions", thing);
        merge_generated_forms(obj, "events", thing);

        doc
    }
}

fn merge_generated_forms(doc: &mut Map<String, Value>, section: &str, thing: &Thing) {
    let Some(interactions) = doc.get_mut(section).and_then(Value::as_object_mut) else {
        return;
    };

    for (name, emitted) in interactions.iter_mut() {
        let combined: Vec<Value> = thing
            .get_forms(name)
            .into_iter()
            .map(|form| serde_json::to_value(form).unwrap_or(Value::Null))
            .collect();

        if let Some(emitted) = emitted.as_object_mut() {
            if combined.is_empty() {
                emitted.remove("forms");
            } else {
                emitted.insert("forms".to_string(), Value::Array(combined));
            }
        }
    }
}

/// Retrieves and parses a TD document from the given URL.
///
/// Extra headers carry authentication material when the remote catalogue
/// is protected.
pub async fn fetch_td(
    url: &str,
    headers: &[(String, String)],
    timeout: Option<Duration>,
) -> Result<Thing> {
    let client = reqwest::Client::new();

    let mut request = client
        .get(url)
        .timeout(timeout.unwrap_or(DEFAULT_FETCH_TIMEOUT));

    for (name, value) in headers {
        request = request.header(name, value);
    }

    let response = request.send().await?;

    if !response.status().is_success() {
        return Err(Error::Protocol(format!(
            "TD fetch from {} failed with status {}",
            url,
            response.status()
        )));
    }

    let doc: Value = response.json().await?;
    ThingDescription::parse(&doc)
}
