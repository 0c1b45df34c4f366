//! Runtime configuration for the sune-proxy run coordinator.
//!
//! Unlike the TOML-driven configuration surfaces of larger gateways, this
//! coordinator's externally tunable surface is small: a listen port, an
//! optional notification sink, and a handful of batching/timeout constants.
//! All of it is sourced from the environment via [`clap`]'s `env` derive,
//! which keeps the CLI (`--port`) and environment (`PORT`) in sync for free.

#![deny(missing_docs)]

use std::time::Duration;

use clap::Parser;

/// Coordinator configuration, parsed from CLI flags and/or environment variables.
#[derive(Debug, Clone, Parser)]
#[command(name = "sune-proxy", about = "Streaming LLM proxy with resumable runs")]
pub struct Config {
    /// Port the HTTP/WebSocket listener binds to.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// `ntfy`-style push notification endpoint. Notifications are silently
    /// dropped when unset.
    #[arg(long, env = "NTFY_URL")]
    pub ntfy_url: Option<String>,

    /// Size trigger for flushing a pending text buffer into a `Delta`, in
    /// code units (bytes) of the buffered text.
    #[arg(long, env = "BATCH_BYTES", default_value_t = 3400)]
    pub batch_bytes: usize,

    /// Time trigger for flushing a pending buffer, armed when the first byte
    /// lands in an empty buffer.
    #[arg(long, env = "BATCH_MS", default_value_t = 800)]
    pub batch_ms: u64,

    /// Hard wall-clock limit on a `running` Run before it is force-failed
    /// with a timeout error. Default nine minutes.
    #[arg(long, env = "MAX_RUN_MS", default_value_t = 9 * 60 * 1000)]
    pub max_run_ms: u64,

    /// TTL applied to every KV entry (Snapshot, Delta, prompt). Default
    /// twenty minutes.
    #[arg(long, env = "KV_TTL_SECS", default_value_t = 20 * 60)]
    pub kv_ttl_secs: u64,

    /// Interval of the background sweep that evicts idle terminal Runs and
    /// backstops the per-Run timeout.
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// `RUST_LOG`-style filter string for the logger.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,
}

impl Config {
    /// The batch time trigger as a [`Duration`].
    pub fn batch_duration(&self) -> Duration {
        Duration::from_millis(self.batch_ms)
    }

    /// The hard run timeout as a [`Duration`].
    pub fn max_run_duration(&self) -> Duration {
        Duration::from_millis(self.max_run_ms)
    }

    /// The background sweep interval as a [`Duration`].
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::parse_from(["sune-proxy"]);

        assert_eq!(config.port, 8080);
        assert!(config.ntfy_url.is_none());
        assert_eq!(config.batch_bytes, 3400);
        assert_eq!(config.batch_ms, 800);
        assert_eq!(config.max_run_ms, 540_000);
        assert_eq!(config.kv_ttl_secs, 1200);
        assert_eq!(config.sweep_interval_secs, 60);
    }
}
