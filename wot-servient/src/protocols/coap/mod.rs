//! CoAP protocol binding
//!
//! One resource per verb class (`/property`, `/action`, `/event`), each
//! parameterized via `?thing=…&name=…`. GET reads or observes (with the
//! CoAP observe extension), PUT writes, POST invokes. Authentication
//! material travels in a numeric CoAP option in place of the HTTP
//! Authorization header.

mod client;
mod server;

pub use client::CoapClient;
pub use server::CoapServer;

use std::collections::HashMap;

use coap_lite::{CoapOption, Packet};

/// Custom option carrying the authorization material (`Basic …`,
/// `Bearer …`) of the configured security scheme.
pub(crate) const AUTH_OPTION: u16 = 65000;

/// Encodes an observe sequence number as a minimal big-endian byte string
pub(crate) fn encode_observe(value: u32) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

/// Decodes the observe option of a packet, when present
pub(crate) fn observe_value(packet: &Packet) -> Option<u32> {
    let values = packet.get_option(CoapOption::Observe)?;
    let bytes = values.front()?;

    let mut value: u32 = 0;
    for byte in bytes {
        value = (value << 8) | u32::from(*byte);
    }
    Some(value)
}

/// Parses the `Uri-Query` options of a packet into key/value pairs
pub(crate) fn query_params(packet: &Packet) -> HashMap<String, String> {
    let mut params = HashMap::new();

    if let Some(queries) = packet.get_option(CoapOption::UriQuery) {
        for query in queries {
            let query = String::from_utf8_lossy(query);
            if let Some((key, value)) = query.split_once('=') {
                params.insert(key.to_string(), value.to_string());
            }
        }
    }

    params
}

/// Reads the authorization material from the auth option, when present
pub(crate) fn auth_option(packet: &Packet) -> Option<String> {
    let values = packet.get_option(CoapOption::Unknown(AUTH_OPTION))?;
    values
        .front()
        .map(|bytes| String::from_utf8_lossy(bytes).to_string())
}
