//! Distributed egress allow-list synchronization.
//!
//! A [`Coordinator`](coordinator::Coordinator) holds the allow-list and fans
//! changes out to every connected node; each node runs an
//! [`Agent`](agent::Agent) that reconciles its packet filter with the events
//! it receives.  The two talk over the WebSocket transport in [`transport`].

pub mod address;
pub mod agent;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod filter;
pub mod policy;
pub mod registry;
pub mod resolver;
pub mod transport;
pub mod types;
