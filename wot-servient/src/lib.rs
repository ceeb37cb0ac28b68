//! # wot-servient
//!
//! Web of Things runtime in which a single process acts simultaneously as
//! a WoT server (exposing Things over HTTP, CoAP, MQTT and WebSocket) and
//! a WoT client (consuming remote Things through their Thing
//! Descriptions).
//!
//! ## Features
//!
//! - **Multi-protocol bindings**: HTTP (axum) + CoAP + MQTT (rumqttc) +
//!   WebSocket, all mapping the same interaction verbs onto their wire
//!   semantics
//! - **Servient lifecycle**: servers, clients, exposed Things and the TD
//!   catalogue under one controller; forms regenerate on topology changes
//! - **Event bus**: per-Thing multicast backing long-poll, broker and
//!   socket fan-out with a strict finalization contract
//! - **Security**: per-scheme inbound authenticators and outbound
//!   credentials, pluggable per binding
//!
//! ## Example
//!
//! ```rust,no_run
//! use wot_servient::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Load configuration
//!     let config = Config::load()?;
//!
//!     // Initialize tracing
//!     init_tracing(&config)?;
//!
//!     // Assemble the servient from configuration
//!     let servient = Servient::from_config(&config)?;
//!
//!     // Produce and expose a Thing
//!     let wot = servient.start().await?;
//!     let exposed = wot.produce(Thing::new("coffee-machine")).await?;
//!     exposed.expose().await?;
//!
//!     // ... serve until shutdown
//!     servient.shutdown().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod catalogue;
pub mod config;
pub mod consumed;
pub mod error;
pub mod events;
pub mod exposed;
pub mod observability;
pub mod persistence;
pub mod protocols;
pub mod servient;
pub mod td;
pub mod wot;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{
        BindingMode, Config, NorthboundConfig, RemoteThingConfig, SecurityConfig, ServientConfig,
        SouthboundConfig,
    };

    pub use crate::error::{Error, ErrorResponse, Result};

    pub use crate::observability::init_tracing;

    pub use crate::td::{
        Action, DataSchema, DataType, Event, Form, Interaction, InteractionKind, Property,
        SecurityScheme, Thing, ThingDescription,
    };

    pub use crate::events::{
        EmittedEvent, EventBus, EventKind, Observer, Subscription, TdChangeMethod, TdChangeType,
    };

    pub use crate::exposed::{
        ActionHandler, ExposedThing, ExposedThingSet, PropertyReadHandler, PropertyWriteHandler,
    };

    pub use crate::consumed::ConsumedThing;

    pub use crate::servient::{Servient, ServientBuilder};

    pub use crate::wot::Wot;

    pub use crate::protocols::{
        InteractionVerb, Protocol, ProtocolClient, ProtocolServer, SharedClient, SharedServer,
    };

    pub use crate::protocols::coap::{CoapClient, CoapServer};
    pub use crate::protocols::http::{HttpClient, HttpServer};
    pub use crate::protocols::mqtt::{MqttClient, MqttServer};
    pub use crate::protocols::ws::{WsClient, WsServer};

    pub use crate::auth::{Authenticator, Credential};

    pub use crate::persistence::{MemoryWriter, NopWriter, PersistenceWriter};

    // Re-export tracing macros and types
    pub use tracing::{debug, error, info, instrument, trace, warn};

    // Re-export tokio for async runtime
    pub use tokio;

    // Re-export async-trait for implementing the binding contracts
    pub use async_trait::async_trait;

    // Re-export serialization essentials
    pub use serde::{Deserialize, Serialize};
    pub use serde_json::{json, Value};

    // Re-export time utilities
    pub use chrono::{DateTime, Utc};

    // Re-export UUID
    pub use uuid::Uuid;

    // Re-export futures utilities
    pub use futures::{future, stream, Future, Stream, StreamExt};
}
