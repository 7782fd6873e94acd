use async_trait::async_trait;

use crate::error::FilterError;

pub mod iptables;
pub mod memory;
pub use iptables::IptablesFilter;
pub use memory::{MemoryFilter, Primitive, Rule};

/// Local packet-filter primitives used by the agent.
///
/// Every mutation must be idempotent: installing a rule that is already
/// present or removing one that is absent succeeds without changing state.
#[async_trait]
pub trait Filter: Send + Sync {
    /// Whether the kernel forwards IPv4 traffic.
    async fn forwarding_enabled(&self) -> Result<bool, FilterError>;

    async fn install_accept_rule(&self, address: &str) -> Result<(), FilterError>;
    async fn remove_accept_rule(&self, address: &str) -> Result<(), FilterError>;

    async fn install_masquerade_rule(&self, address: &str) -> Result<(), FilterError>;
    async fn remove_masquerade_rule(&self, address: &str) -> Result<(), FilterError>;

    /// Accept forwarded traffic to and from `address`.
    async fn install_forward_rules(&self, address: &str) -> Result<(), FilterError>;
    async fn remove_forward_rules(&self, address: &str) -> Result<(), FilterError>;

    /// Append deny-all rules for direct ingress and egress.  Must run after
    /// every baseline accept rule is in place.
    async fn install_catch_all_deny(&self) -> Result<(), FilterError>;
    async fn ensure_forward_accept_policy(&self) -> Result<(), FilterError>;
    async fn install_reserved_range_allowlist(&self) -> Result<(), FilterError>;
}
