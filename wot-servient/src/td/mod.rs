//! Thing model and Thing Description codec
//!
//! The model follows the W3C WoT TD 1.1 vocabulary for the fields this
//! runtime uses. Interactions are modelled by composition: a [`Property`]
//! owns its [`DataSchema`] instead of pretending to be one.

mod description;
mod form;
mod interaction;
mod schema;
mod security;
mod thing;

pub use description::{fetch_td, ThingDescription, DEFAULT_FETCH_TIMEOUT};
pub use form::Form;
pub use interaction::{Action, Event, Interaction, InteractionKind, Property};
pub use schema::{DataSchema, DataType};
pub use security::SecurityScheme;
pub use thing::Thing;

/// Returns the URL-safe version of a name: lowercase ASCII with every run
/// of non-alphanumeric characters folded into a single dash.
pub fn url_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_dash = false;

    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }

    out
}

/// Interaction names are restricted to `[A-Za-z0-9_-]+`.
pub fn is_valid_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_name_lowercases_and_dashes() {
        assert_eq!(url_name("Coffee Machine"), "coffee-machine");
        assert_eq!(url_name("maintenanceNeeded"), "maintenanceneeded");
        assert_eq!(url_name("a--b__c"), "a-b-c");
    }

    #[test]
    fn test_url_name_trims_edges() {
        assert_eq!(url_name("  Spaced Out  "), "spaced-out");
        assert_eq!(url_name("!!bang!!"), "bang");
    }

    #[test]
    fn test_safe_name_validation() {
        assert!(is_valid_safe_name("makeDrink"));
        assert!(is_valid_safe_name("temp_2-sensor"));
        assert!(!is_valid_safe_name(""));
        assert!(!is_valid_safe_name("has space"));
        assert!(!is_valid_safe_name("slash/name"));
    }
}
