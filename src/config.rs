use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Coordinator,
    Agent,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub role: Role,
    pub coordinator: CoordinatorConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoordinatorConfig {
    pub listen: SocketAddr,
    /// Frames buffered per session before delivery starts retrying.
    pub outbound_capacity: usize,
    pub delivery_attempts: u32,
    pub delivery_interval_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_server: Option<SocketAddr>,
    pub refresh_interval_secs: u64,
    /// Targets registered as immutable at startup.
    pub seed: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    /// Coordinator address as `host:port`.
    pub server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub workers: usize,
    pub queue_capacity: usize,
    pub reconnect_delay_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub requeue_delay_ms: u64,
    /// Apply events to an in-memory filter instead of iptables.
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: Role::Coordinator,
            coordinator: CoordinatorConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            outbound_capacity: 1024,
            delivery_attempts: 5,
            delivery_interval_ms: 500,
            registry_path: None,
            dns_server: None,
            refresh_interval_secs: 60,
            seed: Vec::new(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:8080".into(),
            hostname: None,
            workers: 10,
            queue_capacity: 10_000,
            reconnect_delay_secs: 5,
            heartbeat_interval_secs: 1,
            requeue_delay_ms: 1000,
            dry_run: false,
        }
    }
}

impl CoordinatorConfig {
    pub fn delivery_interval(&self) -> Duration {
        Duration::from_millis(self.delivery_interval_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

impl AgentConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }

    /// Name this node reports to the coordinator.
    pub fn node_name(&self) -> String {
        self.hostname
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "unknown".into())
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("egress-sync.toml"))
                .merge(Json::file("egress-sync.json"))
                .merge(Env::prefixed("EGRESS_").split("__")),
        )
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        if config.agent.workers == 0 {
            anyhow::bail!("agent.workers must be at least 1");
        }
        if config.coordinator.delivery_attempts == 0 {
            anyhow::bail!("coordinator.delivery_attempts must be at least 1");
        }

        Ok(config)
    }
}
