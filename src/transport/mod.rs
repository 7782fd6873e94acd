//! WebSocket session transport between the coordinator and its agents.
//!
//! Events travel coordinator → agent as JSON text frames.  Agents send a
//! timestamp frame back every heartbeat interval so that either side notices
//! a dead peer.  Each side runs independent read and write pumps.

pub mod client;
pub mod server;

pub use client::{ConnectionState, NodeClient};
pub use server::{bind, serve};

/// Path agents connect to.
pub const WS_PATH: &str = "/ws";

/// Extracts and percent-decodes the `hostname` parameter from a request
/// query string.
pub(crate) fn hostname_from_query(query: Option<&str>) -> Option<String> {
    let raw = query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("hostname="))?;
    let plus_decoded = raw.replace('+', " ");
    let name = urlencoding::decode(&plus_decoded).ok()?;
    Some(name.trim().to_string()).filter(|name| !name.is_empty())
}
