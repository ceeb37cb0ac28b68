//! HTTP protocol binding
//!
//! The server exposes one route per verb class under each Thing's URL
//! name; observation is long-poll based. The client mirrors the routes
//! with GET/PUT/POST requests.

mod client;
mod server;

pub use client::HttpClient;
pub use server::{HttpServer, HttpServerBuilder};
