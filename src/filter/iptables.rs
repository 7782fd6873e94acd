//! [`Filter`] backed by the `iptables` command.
//!
//! Rules are checked with `-C` before they are inserted or deleted so that
//! every primitive is safe to repeat.

use async_trait::async_trait;
use log::{debug, info};
use tokio::process::Command;

use super::Filter;
use crate::address::RESERVED_RANGES;
use crate::error::FilterError;

const FILTER: &str = "filter";
const NAT: &str = "nat";
const IP_FORWARD: &str = "/proc/sys/net/ipv4/ip_forward";

pub struct IptablesFilter {
    program: String,
}

impl IptablesFilter {
    pub fn new() -> Self {
        Self::with_program("iptables")
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output, FilterError> {
        Command::new(&self.program)
            .args(args)
            .output()
            .await
            .map_err(|source| FilterError::Spawn {
                program: self.program.clone(),
                source,
            })
    }

    async fn run_checked(&self, args: &[&str]) -> Result<(), FilterError> {
        let output = self.run(args).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(self.command_error(args, &output))
        }
    }

    fn command_error(&self, args: &[&str], output: &std::process::Output) -> FilterError {
        FilterError::Command {
            command: format!("{} {}", self.program, args.join(" ")),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }

    /// `iptables -C` exits with 1 when the rule is missing; anything else
    /// non-zero is a real failure.
    async fn exists(
        &self,
        table: &str,
        chain: &str,
        matcher: &[&str],
    ) -> Result<bool, FilterError> {
        let mut args = vec!["-t", table, "-C", chain];
        args.extend_from_slice(matcher);
        let output = self.run(&args).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(self.command_error(&args, &output)),
        }
    }

    async fn insert_unique(
        &self,
        table: &str,
        chain: &str,
        matcher: &[&str],
    ) -> Result<(), FilterError> {
        if self.exists(table, chain, matcher).await? {
            return Ok(());
        }
        let mut args = vec!["-t", table, "-I", chain, "1"];
        args.extend_from_slice(matcher);
        self.run_checked(&args).await
    }

    async fn append_unique(
        &self,
        table: &str,
        chain: &str,
        matcher: &[&str],
    ) -> Result<(), FilterError> {
        if self.exists(table, chain, matcher).await? {
            return Ok(());
        }
        let mut args = vec!["-t", table, "-A", chain];
        args.extend_from_slice(matcher);
        self.run_checked(&args).await
    }

    async fn delete_if_exists(
        &self,
        table: &str,
        chain: &str,
        matcher: &[&str],
    ) -> Result<(), FilterError> {
        if !self.exists(table, chain, matcher).await? {
            return Ok(());
        }
        let mut args = vec!["-t", table, "-D", chain];
        args.extend_from_slice(matcher);
        self.run_checked(&args).await
    }
}

impl Default for IptablesFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Filter for IptablesFilter {
    async fn forwarding_enabled(&self) -> Result<bool, FilterError> {
        let value = tokio::fs::read_to_string(IP_FORWARD)
            .await
            .map_err(|source| FilterError::Read {
                path: IP_FORWARD.to_string(),
                source,
            })?;
        debug!("{} = {}", IP_FORWARD, value.trim());
        Ok(value.trim() == "1")
    }

    async fn install_accept_rule(&self, address: &str) -> Result<(), FilterError> {
        self.insert_unique(FILTER, "INPUT", &["-s", address, "-j", "ACCEPT"])
            .await?;
        self.insert_unique(FILTER, "OUTPUT", &["-d", address, "-j", "ACCEPT"])
            .await
    }

    async fn remove_accept_rule(&self, address: &str) -> Result<(), FilterError> {
        self.delete_if_exists(FILTER, "INPUT", &["-s", address, "-j", "ACCEPT"])
            .await?;
        self.delete_if_exists(FILTER, "OUTPUT", &["-d", address, "-j", "ACCEPT"])
            .await
    }

    async fn install_masquerade_rule(&self, address: &str) -> Result<(), FilterError> {
        self.insert_unique(
            NAT,
            "POSTROUTING",
            &["-s", "0.0.0.0/0", "-d", address, "-j", "MASQUERADE"],
        )
        .await
    }

    async fn remove_masquerade_rule(&self, address: &str) -> Result<(), FilterError> {
        self.delete_if_exists(
            NAT,
            "POSTROUTING",
            &["-s", "0.0.0.0/0", "-d", address, "-j", "MASQUERADE"],
        )
        .await
    }

    async fn install_forward_rules(&self, address: &str) -> Result<(), FilterError> {
        self.insert_unique(FILTER, "FORWARD", &["-s", address, "-j", "ACCEPT"])
            .await?;
        self.insert_unique(FILTER, "FORWARD", &["-d", address, "-j", "ACCEPT"])
            .await
    }

    async fn remove_forward_rules(&self, address: &str) -> Result<(), FilterError> {
        self.delete_if_exists(FILTER, "FORWARD", &["-s", address, "-j", "ACCEPT"])
            .await?;
        self.delete_if_exists(FILTER, "FORWARD", &["-d", address, "-j", "ACCEPT"])
            .await
    }

    async fn install_catch_all_deny(&self) -> Result<(), FilterError> {
        self.append_unique(FILTER, "INPUT", &["-j", "DROP"]).await?;
        self.append_unique(FILTER, "OUTPUT", &["-j", "DROP"]).await
    }

    async fn ensure_forward_accept_policy(&self) -> Result<(), FilterError> {
        self.run_checked(&["-t", FILTER, "-P", "FORWARD", "ACCEPT"])
            .await
    }

    async fn install_reserved_range_allowlist(&self) -> Result<(), FilterError> {
        for range in RESERVED_RANGES {
            self.install_accept_rule(range).await?;
        }
        info!("Reserved ranges allowed: {}", RESERVED_RANGES.join(", "));
        Ok(())
    }
}
