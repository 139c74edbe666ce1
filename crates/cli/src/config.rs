//! Command-line configuration and node settings loading.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use serde::de::DeserializeOwned;
use tracing_subscriber::EnvFilter;

use corelib::{EnlistPolicy, GapPolicy, NodeSettings};

use crate::commands::Command;

#[derive(Debug, Parser)]
#[command(name = "txnet", version, about = "Run demonstration transactions over reliable node messaging")]
pub struct CliConfig {
    /// JSON file with node settings (`timing`, `enlist_policy`, `gap_policy`).
    /// Missing fields keep their defaults.
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    /// Retransmit envelopes pending for this long.
    #[arg(long, global = true)]
    pub expiration_ms: Option<u64>,

    /// Batch fresh envelopes for this long before sending; 0 sends at once.
    #[arg(long, global = true)]
    pub send_interval_ms: Option<u64>,

    #[arg(long, global = true)]
    pub acknowledgement_interval_ms: Option<u64>,

    #[arg(long, global = true)]
    pub retransmission_check_interval_ms: Option<u64>,

    /// `queue` or `reject`.
    #[arg(long, global = true, value_parser = parse_policy::<EnlistPolicy>)]
    pub enlist_policy: Option<EnlistPolicy>,

    /// `reject` or `buffer`.
    #[arg(long, global = true, value_parser = parse_policy::<GapPolicy>)]
    pub gap_policy: Option<GapPolicy>,

    /// Log filter such as `info` or `messaging=debug`. Defaults to `RUST_LOG`,
    /// then `warn`.
    #[arg(long, global = true)]
    pub log: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

impl CliConfig {
    pub fn run(self) -> anyhow::Result<()> {
        init_tracing(self.log.as_deref());
        let settings = self.node_settings()?;
        let result = self.command.execute(settings)?;
        println!("{result}");
        Ok(())
    }

    /// Settings file first, then flags on top.
    pub fn node_settings(&self) -> anyhow::Result<NodeSettings> {
        let mut settings = match &self.settings {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read settings file {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("failed to parse settings file {}", path.display()))?
            }
            None => NodeSettings::default(),
        };

        let timing = &mut settings.timing;
        if let Some(ms) = self.expiration_ms {
            timing.pending_expiration_ms = ms;
        }
        if let Some(ms) = self.send_interval_ms {
            timing.send_interval_ms = ms;
        }
        if let Some(ms) = self.acknowledgement_interval_ms {
            timing.acknowledgement_interval_ms = ms;
        }
        if let Some(ms) = self.retransmission_check_interval_ms {
            timing.retransmission_check_interval_ms = ms;
        }
        if let Some(policy) = self.enlist_policy {
            settings.enlist_policy = policy;
        }
        if let Some(policy) = self.gap_policy {
            settings.gap_policy = policy;
        }
        Ok(settings)
    }
}

fn parse_policy<T: DeserializeOwned>(value: &str) -> Result<T, String> {
    serde_json::from_value(serde_json::Value::String(value.to_string())).map_err(|e| e.to_string())
}

fn init_tracing(filter: Option<&str>) {
    let filter = match filter {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
