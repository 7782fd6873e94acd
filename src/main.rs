//! egress-sync daemon entry point.

use std::sync::Arc;

use anyhow::Context;
use log::{error, info, warn};
use tokio::signal;

use egress_sync::agent::{Agent, AgentOptions};
use egress_sync::config::{AgentConfig, Config, CoordinatorConfig, Role};
use egress_sync::coordinator::{Coordinator, DeliveryPolicy};
use egress_sync::filter::{Filter, IptablesFilter, MemoryFilter};
use egress_sync::registry::{MemoryRegistry, Registry};
use egress_sync::resolver::{resolve_target, run_domain_refresh, DomainResolver, Lookup};
use egress_sync::transport::{self, serve, NodeClient};
use egress_sync::types::Action;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting egress-sync with config: {:?}", cfg);

    match cfg.role {
        Role::Coordinator => run_coordinator(cfg.coordinator).await,
        Role::Agent => run_agent(cfg.agent).await,
    }
}

async fn run_coordinator(cfg: CoordinatorConfig) -> anyhow::Result<()> {
    let registry: Arc<dyn Registry> = match &cfg.registry_path {
        Some(path) => Arc::new(
            MemoryRegistry::open(path)
                .await
                .context("Failed to open registry")?,
        ),
        None => {
            warn!("No registry_path configured, allow-list will not survive restarts");
            Arc::new(MemoryRegistry::new())
        }
    };
    let policy = DeliveryPolicy {
        attempts: cfg.delivery_attempts,
        interval: cfg.delivery_interval(),
    };
    let coordinator = Arc::new(Coordinator::new(registry, policy));
    let lookup: Arc<dyn Lookup> = Arc::new(DomainResolver::new(cfg.dns_server));

    // Seed targets are pinned
    for seed in &cfg.seed {
        match resolve_target(lookup.as_ref(), seed).await {
            Ok(target) => {
                if let Err(e) = coordinator.submit(Action::Add, &target, true).await {
                    error!("Failed to register seed {}: {}", seed, e);
                }
            }
            Err(e) => error!("Failed to resolve seed {}: {}", seed, e),
        }
    }

    // Agent sessions
    let listener = transport::bind(cfg.listen).await?;
    let capacity = cfg.outbound_capacity;
    let server_coordinator = Arc::clone(&coordinator);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = serve(listener, server_coordinator, capacity).await {
            error!("Coordinator server failed: {}", e);
        }
    });

    // Domain refresh
    let refresh_handle = tokio::spawn(run_domain_refresh(
        Arc::clone(&coordinator),
        lookup,
        cfg.refresh_interval(),
    ));

    wait_for_shutdown().await;
    server_handle.abort();
    refresh_handle.abort();

    info!("Shutdown complete.");
    Ok(())
}

async fn run_agent(cfg: AgentConfig) -> anyhow::Result<()> {
    let filter: Arc<dyn Filter> = if cfg.dry_run {
        warn!("Dry run: events are applied to an in-memory filter only");
        Arc::new(MemoryFilter::new())
    } else {
        Arc::new(IptablesFilter::new())
    };

    let agent = Agent::new(
        filter,
        AgentOptions {
            workers: cfg.workers,
            queue_capacity: cfg.queue_capacity,
            requeue_delay: cfg.requeue_delay(),
        },
    );

    // Nothing is reconciled until the baseline is in place
    agent
        .prepare()
        .await
        .context("Agent startup checks failed")?;

    let workers = agent.spawn_workers();

    let client = NodeClient::new(&cfg.server, &cfg.node_name(), agent.queue())
        .with_reconnect_delay(cfg.reconnect_delay())
        .with_heartbeat_interval(cfg.heartbeat_interval());
    let client_handle = tokio::spawn(client.run());

    wait_for_shutdown().await;
    client_handle.abort();
    for worker in workers {
        worker.abort();
    }

    info!("Shutdown complete.");
    Ok(())
}

async fn wait_for_shutdown() {
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }
}
