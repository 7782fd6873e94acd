use async_trait::async_trait;

use crate::error::RegistryError;
use crate::types::Entry;

pub mod memory;
pub use memory::MemoryRegistry;

/// Durable store of allow-list entries, keyed by address.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Stores `entry` unless its address is already present.  Returns
    /// whether a new entry was written.
    async fn add(&self, entry: Entry) -> Result<bool, RegistryError>;

    /// Removes the entry for `address`.  Fails for immutable entries;
    /// deleting a missing address is a no-op.
    async fn delete(&self, address: &str) -> Result<(), RegistryError>;

    async fn query(&self, address: &str) -> Result<bool, RegistryError>;

    async fn query_immutable(&self, address: &str) -> Result<bool, RegistryError>;

    async fn query_all(&self) -> Result<Vec<Entry>, RegistryError>;

    /// Distinct domain names behind mutable, domain-derived entries.
    async fn query_distinct_domain_names(&self) -> Result<Vec<String>, RegistryError>;
}
