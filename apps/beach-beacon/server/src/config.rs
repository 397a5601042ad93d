use std::{net::SocketAddr, time::Duration};

use anyhow::{ensure, Context};
use clap::Parser;

use crate::telemetry::{self, TelemetryConfig};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub heartbeat_interval: Duration,
    pub channel_depth: usize,
    pub shutdown_grace: Duration,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Parser)]
#[command(
    name = "beach-beacon-server",
    author,
    version,
    about = "Beach beacon: pushes refresh notifications over event streams with a poll fallback"
)]
pub struct Cli {
    /// Address to bind the HTTP listener to.
    #[arg(long, env = "BEACH_BEACON_LISTEN_ADDR", default_value = "127.0.0.1:9560")]
    pub listen_addr: String,

    /// Seconds between heartbeat comments on each event stream.
    #[arg(long, env = "BEACH_BEACON_HEARTBEAT_SECS", default_value_t = 30)]
    pub heartbeat_secs: u64,

    /// Frames buffered per event stream before the client counts as stalled.
    #[arg(long, env = "BEACH_BEACON_CHANNEL_DEPTH", default_value_t = 64)]
    pub channel_depth: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_BEACON_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    /// Log filter directives, used when `RUST_LOG` is unset.
    #[arg(long, env = "BEACH_BEACON_LOG", default_value = "info")]
    pub log_filter: String,

    /// Export tracing spans to stdout through OpenTelemetry.
    #[arg(long, env = "BEACH_BEACON_OTEL_STDOUT", default_value_t = false)]
    pub otel_stdout: bool,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        ensure!(cli.heartbeat_secs > 0, "heartbeat interval must be at least one second");
        ensure!(cli.channel_depth > 0, "channel depth must be greater than zero");
        telemetry::log_filter(&cli.log_filter)?;

        Ok(ServerConfig {
            listen_addr,
            heartbeat_interval: Duration::from_secs(cli.heartbeat_secs),
            channel_depth: cli.channel_depth,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            telemetry: TelemetryConfig {
                log_filter: cli.log_filter,
                otel_stdout: cli.otel_stdout,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::{CommandFactory, FromArgMatches};

    /// Parses flags only. Env fallbacks are stripped so `BEACH_BEACON_*`
    /// variables in the test environment cannot leak in as defaults.
    fn parse(args: &[&str]) -> anyhow::Result<ServerConfig> {
        let matches = Cli::command()
            .mut_args(|arg| arg.env(None::<&'static str>))
            .try_get_matches_from(std::iter::once("beach-beacon-server").chain(args.iter().copied()))?;
        let cli = Cli::from_arg_matches(&matches)?;
        ServerConfig::try_from(cli)
    }

    #[test_timeout::timeout]
    fn defaults_match_the_reference_heartbeat() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.channel_depth, 64);
        assert_eq!(config.listen_addr, "127.0.0.1:9560".parse().unwrap());
        assert_eq!(config.telemetry.log_filter, "info");
        assert!(!config.telemetry.otel_stdout);
    }

    #[test_timeout::timeout]
    fn rejects_invalid_values() {
        assert!(parse(&["--listen-addr", "not-an-addr"]).is_err());
        assert!(parse(&["--heartbeat-secs", "0"]).is_err());
        assert!(parse(&["--channel-depth", "0"]).is_err());
        assert!(parse(&["--log-filter", "beach_beacon_core=loud"]).is_err());
    }

    #[test_timeout::timeout]
    fn environment_does_not_leak_into_defaults() {
        std::env::set_var("BEACH_BEACON_HEARTBEAT_SECS", "7");
        let config = parse(&[]).unwrap();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
    }

    #[test_timeout::timeout]
    fn flags_override_defaults() {
        let config = parse(&[
            "--heartbeat-secs",
            "5",
            "--otel-stdout",
            "--log-filter",
            "debug,hyper=warn",
        ])
        .unwrap();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.telemetry.log_filter, "debug,hyper=warn");
        assert!(config.telemetry.otel_stdout);
    }
}
