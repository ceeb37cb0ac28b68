//! WebSocket protocol binding
//!
//! One socket per client connection carries JSON-RPC 2.0 messages for all
//! verbs; subscriptions are server-held observers pushing notifications
//! until the client unsubscribes or the socket closes.

mod client;
mod messages;
mod server;

pub use client::WsClient;
pub use messages::{JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
pub use server::WsServer;
