//! Data structures shared by the coordinator and the agents.
//!
//! [`Event`] is the unit of work: it travels from the coordinator to every
//! agent as a JSON text frame and sits in the agent queue until a worker has
//! applied it.  [`Entry`] is what the registry stores.

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::address::{is_local_address, Origin};
use crate::error::DecodeError;

/// What an event asks the agent to do with an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Add,
    #[serde(alias = "del")]
    Delete,
    /// Any action string this build does not understand.
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::Add => "add",
            Action::Delete => "delete",
            Action::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// An allow-list change.
///
/// On the wire this is `{"action":"add","ip":"8.8.8.8","isLocalNet":false}`.
/// The local flag is always derived from the address when an event is built
/// or decoded, never taken from the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    action: Action,
    #[serde(rename = "ip")]
    address: String,
    #[serde(default)]
    is_local_net: bool,
}

impl Event {
    pub fn new(action: Action, address: impl Into<String>) -> Self {
        let address = address.into();
        let is_local_net = is_local_address(&address);
        Self {
            action,
            address,
            is_local_net,
        }
    }

    pub fn add(address: impl Into<String>) -> Self {
        Self::new(Action::Add, address)
    }

    pub fn delete(address: impl Into<String>) -> Self {
        Self::new(Action::Delete, address)
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_local_net(&self) -> bool {
        self.is_local_net
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes a text frame, rejecting empty addresses and re-deriving the
    /// local flag.
    pub fn from_frame(frame: &str) -> Result<Self, DecodeError> {
        let claimed: Event = serde_json::from_str(frame)?;
        let address = claimed.address.trim();
        if address.is_empty() {
            return Err(DecodeError::EmptyAddress);
        }
        let event = Event::new(claimed.action, address);
        if event.is_local_net != claimed.is_local_net {
            debug!(
                "Peer classified {} as isLocalNet={}, using {}",
                address, claimed.is_local_net, event.is_local_net
            );
        }
        Ok(event)
    }
}

/// One allowed destination held by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub address: String,
    pub is_local_net: bool,
    pub immutable: bool,
    pub created_at: DateTime<Utc>,
    pub origin: Origin,
}

impl Entry {
    /// Builds an entry stamped with the current time.  Local addresses are
    /// always immutable.
    pub fn new(address: impl Into<String>, origin: Origin, immutable: bool) -> Self {
        let address = address.into();
        let is_local_net = is_local_address(&address);
        Self {
            immutable: immutable || is_local_net,
            is_local_net,
            address,
            created_at: Utc::now(),
            origin,
        }
    }
}
