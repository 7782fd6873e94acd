//! Domain resolution and the periodic domain refresh loop.
//!
//! Targets are classified once, here, into an address, a CIDR block, or a
//! set of domain-derived addresses.  The refresh loop re-resolves every
//! mutable domain in the registry and submits addresses it has not seen yet.
//! Addresses that disappear from DNS are kept.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use log::{debug, error, info, warn};
use tokio::time::sleep;

use crate::address::Target;
use crate::coordinator::Coordinator;
use crate::error::ResolveError;
use crate::types::Action;

/// Resolves a domain name to its IPv4 addresses.
#[async_trait]
pub trait Lookup: Send + Sync {
    async fn lookup_ipv4(&self, domain: &str) -> Result<Vec<Ipv4Addr>, ResolveError>;
}

pub struct DomainResolver {
    resolver: TokioAsyncResolver,
}

impl DomainResolver {
    /// Uses `dns_server` when given, otherwise the system configuration.
    pub fn new(dns_server: Option<SocketAddr>) -> Self {
        let resolver = match dns_server {
            Some(addr) => {
                info!("Resolving domains through {}", addr);
                let servers =
                    NameServerConfigGroup::from_ips_clear(&[addr.ip()], addr.port(), true);
                TokioAsyncResolver::tokio(
                    ResolverConfig::from_parts(None, vec![], servers),
                    ResolverOpts::default(),
                )
            }
            None => TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
                error!(
                    "Failed to load system resolv.conf: {}. Falling back to Google DNS.",
                    e
                );
                TokioAsyncResolver::tokio(ResolverConfig::google(), ResolverOpts::default())
            }),
        };
        Self { resolver }
    }
}

#[async_trait]
impl Lookup for DomainResolver {
    async fn lookup_ipv4(&self, domain: &str) -> Result<Vec<Ipv4Addr>, ResolveError> {
        let lookup = self
            .resolver
            .lookup_ip(domain)
            .await
            .map_err(|e| ResolveError::Lookup {
                domain: domain.to_string(),
                reason: e.to_string(),
            })?;
        Ok(lookup
            .iter()
            .filter_map(|ip| match ip {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .collect())
    }
}

/// Classifies `input` and, for domain names, resolves it to a
/// deduplicated, sorted address list.
pub async fn resolve_target(lookup: &dyn Lookup, input: &str) -> Result<Target, ResolveError> {
    if let Some(target) = Target::from_literal(input)? {
        return Ok(target);
    }
    let domain = input.trim().trim_end_matches('.').to_ascii_lowercase();
    let addresses: BTreeSet<Ipv4Addr> = lookup
        .lookup_ipv4(&domain)
        .await?
        .into_iter()
        .collect();
    if addresses.is_empty() {
        return Err(ResolveError::NoAddresses(domain));
    }
    Ok(Target::DomainDerived {
        domain,
        addresses: addresses.into_iter().collect(),
    })
}

/// One pass over every mutable domain in the registry.  Returns how many new
/// addresses were submitted.
pub async fn refresh_domains(coordinator: &Coordinator, lookup: &dyn Lookup) -> usize {
    let registry = coordinator.registry();
    let domains = match registry.query_distinct_domain_names().await {
        Ok(domains) => domains,
        Err(e) => {
            error!("Failed to query domain names: {}", e);
            return 0;
        }
    };
    debug!("Refreshing domains: {:?}", domains);

    let resolved = join_all(domains.iter().map(|domain| resolve_target(lookup, domain))).await;

    let mut added = 0;
    for (domain, result) in domains.iter().zip(resolved) {
        let addresses = match result {
            Ok(Target::DomainDerived { addresses, .. }) => addresses,
            Ok(other) => {
                warn!("Registry domain {} resolved to literal {}", domain, other);
                continue;
            }
            Err(e) => {
                error!("Failed to resolve domain {}: {}", domain, e);
                continue;
            }
        };

        let mut fresh = Vec::new();
        for address in addresses {
            match registry.query(&address.to_string()).await {
                Ok(true) => debug!("{} for {} already registered", address, domain),
                Ok(false) => fresh.push(address),
                Err(e) => error!("Failed to check {} for {}: {}", address, domain, e),
            }
        }
        if fresh.is_empty() {
            continue;
        }

        let target = Target::DomainDerived {
            domain: domain.clone(),
            addresses: fresh,
        };
        match coordinator.submit(Action::Add, &target, false).await {
            Ok(count) => {
                info!("Domain {} gained {} new addresses", domain, count);
                added += count;
            }
            Err(e) => error!("Failed to add new addresses for {}: {}", domain, e),
        }
    }
    added
}

/// Runs [`refresh_domains`] every `interval`, forever.
pub async fn run_domain_refresh(
    coordinator: Arc<Coordinator>,
    lookup: Arc<dyn Lookup>,
    interval: Duration,
) {
    loop {
        sleep(interval).await;
        refresh_domains(&coordinator, lookup.as_ref()).await;
    }
}
