//! WoT entry point
//!
//! Returned by `Servient::start`; exposes the Scripting-API-shaped
//! operations for producing, consuming and discovering Things.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;

use crate::config::Config;
use crate::consumed::ConsumedThing;
use crate::error::Result;
use crate::exposed::ExposedThing;
use crate::servient::Servient;
use crate::td::{fetch_td, Thing, ThingDescription};

/// API entry point of a running servient
#[derive(Clone)]
pub struct Wot {
    servient: Servient,
}

impl Wot {
    pub(crate) fn new(servient: Servient) -> Self {
        Self { servient }
    }

    pub fn servient(&self) -> &Servient {
        &self.servient
    }

    /// Builds an ExposedThing from a Thing model and registers it with
    /// the servient. Things start disabled; call `expose` to serve them.
    pub async fn produce(&self, thing: Thing) -> Result<ExposedThing> {
        self.servient.add_exposed_thing(thing).await
    }

    /// Builds an ExposedThing from a TD document string
    pub async fn produce_from_td(&self, td: &str) -> Result<ExposedThing> {
        let thing = ThingDescription::parse_str(td)?;
        self.produce(thing).await
    }

    /// Fetches a TD from a URL and produces an ExposedThing from it
    pub async fn produce_from_url(
        &self,
        url: &str,
        timeout: Option<Duration>,
    ) -> Result<ExposedThing> {
        let thing = fetch_td(url, &[], timeout).await?;
        self.produce(thing).await
    }

    /// Wraps a parsed TD in a client-side facade
    pub fn consume(&self, thing: Thing) -> ConsumedThing {
        ConsumedThing::new(self.servient.clone(), thing)
    }

    /// Parses a TD document string and consumes it
    pub fn consume_from_td(&self, td: &str) -> Result<ConsumedThing> {
        Ok(self.consume(ThingDescription::parse_str(td)?))
    }

    /// Fetches a TD from a URL and consumes it. Credentials, when given,
    /// carry OIDC4VP holder material used to sign the fetch itself.
    pub async fn consume_from_url(
        &self,
        url: &str,
        credentials: Option<&Value>,
        timeout: Option<Duration>,
    ) -> Result<ConsumedThing> {
        let headers = match credentials {
            Some(creds) => {
                let holder_url = creds
                    .get("holder_url")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        crate::error::Error::NotSupported(
                            "Missing holder_url in fetch credentials".into(),
                        )
                    })?;
                let requester = creds
                    .get("requester")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        crate::error::Error::NotSupported(
                            "Missing requester in fetch credentials".into(),
                        )
                    })?;

                let token = crate::auth::holder_token_request(
                    holder_url, url, "GET", requester,
                )
                .await?;
                vec![(crate::auth::OIDC4VP_TOKEN_HEADER.to_string(), token)]
            }
            None => Vec::new(),
        };

        let thing = fetch_td(url, &headers, timeout).await?;
        Ok(self.consume(thing))
    }

    /// Consumes every remote Thing named in the configuration, keyed by
    /// its configured name.
    pub async fn consume_remote_things(
        &self,
        config: &Config,
    ) -> Result<HashMap<String, ConsumedThing>> {
        let mut consumed = HashMap::new();
        for remote in &config.remote_things {
            let thing = self.consume_from_url(&remote.url, None, None).await?;
            consumed.insert(remote.name.clone(), thing);
        }
        Ok(consumed)
    }

    /// Local discovery: the TDs of exposed Things whose documents contain
    /// every key/value pair of the given fragment.
    pub async fn discover(&self, fragment: &Value) -> Vec<Value> {
        let empty = serde_json::Map::new();
        let fragment = fragment.as_object().unwrap_or(&empty);

        let mut found = Vec::new();
        for exposed in self.servient.exposed_things().await {
            let doc = ThingDescription::from_thing(&exposed.thing().await);
            let matches = fragment.iter().all(|(key, value)| {
                doc.get(key).map(|actual| actual == value).unwrap_or(false)
            });
            if matches {
                found.push(doc);
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wot() -> Wot {
        Wot::new(Servient::builder().catalogue_port(None).build())
    }

    #[tokio::test]
    async fn test_produce_registers_thing() {
        let wot = wot();
        let exposed = wot.produce(Thing::new("produced")).await.unwrap();
        assert_eq!(exposed.title(), "produced");
        assert_eq!(wot.servient().exposed_things().await.len(), 1);
    }

    #[tokio::test]
    async fn test_produce_from_td_validates() {
        let wot = wot();
        assert!(wot.produce_from_td("{\"title\": \"incomplete\"}").await.is_err());

        let td = json!({
            "@context": "https://www.w3.org/2022/wot/td/v1.1",
            "title": "valid",
            "security": ["nosec_sc"],
            "securityDefinitions": {"nosec_sc": {"scheme": "nosec"}}
        });
        let exposed = wot.produce_from_td(&td.to_string()).await.unwrap();
        assert_eq!(exposed.title(), "valid");
    }

    #[tokio::test]
    async fn test_discover_matches_fragment() {
        let wot = wot();
        wot.produce(Thing::new("alpha")).await.unwrap();
        wot.produce(Thing::new("beta")).await.unwrap();

        let all = wot.discover(&json!({})).await;
        assert_eq!(all.len(), 2);

        let only_alpha = wot.discover(&json!({"title": "alpha"})).await;
        assert_eq!(only_alpha.len(), 1);
        assert_eq!(only_alpha[0]["title"], json!("alpha"));

        let none = wot.discover(&json!({"title": "gamma"})).await;
        assert!(none.is_empty());
    }
}
