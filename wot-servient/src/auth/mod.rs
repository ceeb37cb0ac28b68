//! Authentication: inbound validators and outbound signers
//!
//! One variant per security scheme. The authenticator validates inbound
//! requests against server-side credentials; the credential signs outgoing
//! requests. The same variant set serves HTTP and CoAP; CoAP carries the
//! authorization material in a numeric option instead of a header.

mod authenticator;
mod credential;

pub use authenticator::Authenticator;
pub use credential::{holder_token_request, Credential};

/// Header attached by the OIDC4VP credential
pub const OIDC4VP_TOKEN_HEADER: &str = "X-Auth-Token";
