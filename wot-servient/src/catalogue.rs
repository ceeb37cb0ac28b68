//! HTTP Thing Description catalogue
//!
//! `GET /` lists the enabled Things (or their expanded TDs with
//! `?expanded`); `GET /<thing-url-name>` returns one TD with its `base`
//! filled in from the selected server.

use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::{Map, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::error::{Error, Result};
use crate::exposed::ExposedThing;
use crate::servient::Servient;
use crate::td::ThingDescription;

/// Running catalogue server
pub(crate) struct CatalogueHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl CatalogueHandle {
    pub(crate) async fn stop(self) {
        self.token.cancel();
        let _ = self.task.await;
    }
}

async fn expanded_td(servient: &Servient, exposed: &ExposedThing) -> Value {
    let thing = exposed.thing().await;
    let mut doc = ThingDescription::from_thing(&thing);

    let base = servient.get_thing_base_url(exposed).await.ok().flatten();
    if let (Some(obj), Some(base)) = (doc.as_object_mut(), base) {
        obj.insert("base".to_string(), Value::String(base));
    }

    doc
}

/// `GET /`: catalogue index mapping Thing title to URL pointer, or the full TD
/// per Thing when `expanded` is requested.
async fn catalogue_index(
    State(servient): State<Servient>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let expanded = params.contains_key("expanded");
    let mut response = Map::new();

    for exposed in servient.enabled_exposed_things().await {
        let value = if expanded {
            expanded_td(&servient, &exposed).await
        } else {
            Value::String(format!("/{}", exposed.url_name()))
        };
        response.insert(exposed.title().to_string(), value);
    }

    Json(Value::Object(response))
}

/// `GET /<thing-url-name>`: one Thing's TD with `base`
async fn catalogue_thing(
    State(servient): State<Servient>,
    Path(thing_url_name): Path<String>,
) -> Result<Json<Value>> {
    let exposed = servient
        .get_exposed_thing(&thing_url_name)
        .await
        .map_err(|_| Error::NotFound(format!("Unknown Thing: {}", thing_url_name)))?;

    Ok(Json(expanded_td(&servient, &exposed).await))
}

/// Builds the catalogue router
pub(crate) fn router(servient: Servient) -> Router {
    Router::new()
        .route("/", get(catalogue_index))
        .route("/{thing_url_name}", get(catalogue_thing))
        .layer(TraceLayer::new_for_http())
        .with_state(servient)
}

/// Binds and serves the catalogue until the returned handle is stopped
pub(crate) async fn serve(servient: Servient, port: u16) -> Result<CatalogueHandle> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "TD catalogue listening");

    let token = CancellationToken::new();
    let shutdown = token.clone();
    let app = router(servient);

    let task = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(err) = result {
            tracing::error!("Catalogue server error: {}", err);
        }
    });

    Ok(CatalogueHandle { token, task })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::td::{DataSchema, Property, Thing};
    use serde_json::json;

    async fn servient_with_thing() -> Servient {
        let servient = Servient::builder()
            .hostname("testhost")
            .catalogue_port(None)
            .build();

        let mut thing = Thing::new("Coffee Machine");
        thing
            .add_property("waterLevel", Property::new(DataSchema::default(), true))
            .unwrap();
        servient.add_exposed_thing(thing).await.unwrap();
        servient
    }

    #[tokio::test]
    async fn test_index_lists_only_enabled_things() {
        let servient = servient_with_thing().await;

        // Disabled: no entry
        let response = catalogue_index(
            State(servient.clone()),
            Query(HashMap::new()),
        )
        .await
        .into_response();
        assert_eq!(response.status(), axum::http::StatusCode::OK);

        servient.enable_exposed_thing("Coffee Machine").await.unwrap();
        let exposed = servient.get_exposed_thing("coffee-machine").await.unwrap();
        assert_eq!(exposed.url_name(), "coffee-machine");

        let enabled = servient.enabled_exposed_things().await;
        assert_eq!(enabled.len(), 1);
    }

    #[tokio::test]
    async fn test_thing_endpoint_returns_td() {
        let servient = servient_with_thing().await;
        servient.enable_exposed_thing("Coffee Machine").await.unwrap();

        let Json(doc) = catalogue_thing(
            State(servient.clone()),
            Path("coffee-machine".to_string()),
        )
        .await
        .unwrap();

        assert_eq!(doc["title"], json!("Coffee Machine"));
        assert!(doc["properties"]["waterLevel"].is_object());
    }

    #[tokio::test]
    async fn test_unknown_thing_is_not_found() {
        let servient = servient_with_thing().await;

        let err = catalogue_thing(State(servient), Path("missing".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
