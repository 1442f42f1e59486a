mod cron_cmd;
mod rpc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use cron_cmd::CronCommand;
use rpc::RpcClient;

#[derive(Parser)]
#[command(name = "relaybot", about = "Personal assistant chat gateway")]
struct Cli {
    /// Gateway RPC endpoint (defaults to the configured host and port)
    #[arg(long, global = true)]
    url: Option<String>,

    /// Bearer token (defaults to gateway.auth_token or RELAYBOT_TOKEN)
    #[arg(long, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Gateway {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Manage scheduled jobs on a running gateway
    Cron {
        #[command(subcommand)]
        command: CronCommand,
    },
    /// Check gateway health
    Health,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = relaybot_config::load_config().context("Failed to load config")?;

    let rt = tokio::runtime::Runtime::new()?;
    match cli.command {
        Commands::Gateway { port } => {
            rt.block_on(relaybot_gateway::start_gateway(config, port, Vec::new()))?;
        }
        Commands::Cron { command } => {
            let rpc = rpc_client(&config, cli.url, cli.token);
            rt.block_on(cron_cmd::run(&rpc, command))?;
        }
        Commands::Health => {
            let rpc = rpc_client(&config, cli.url, cli.token);
            let health = rt.block_on(rpc.call("health", serde_json::Value::Null))?;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
    }

    Ok(())
}

fn rpc_client(config: &relaybot_config::RelayBotConfig, url: Option<String>, token: Option<String>) -> RpcClient {
    let url = url.unwrap_or_else(|| RpcClient::default_url(&config.gateway.host, config.gateway.port));
    let token = token
        .or_else(|| std::env::var("RELAYBOT_TOKEN").ok())
        .or_else(|| config.gateway.auth_token.clone());
    RpcClient::new(url, token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_cron_add() {
        let cli = Cli::try_parse_from([
            "relaybot", "cron", "add", "--every", "10m", "--message", "check mail", "--deliver", "--to", "42",
        ])
        .unwrap();
        match cli.command {
            Commands::Cron {
                command: CronCommand::Add(args),
            } => {
                assert_eq!(args.schedule.every.as_deref(), Some("10m"));
                assert!(args.payload.deliver);
            }
            _ => panic!("expected cron add"),
        }
    }

    #[test]
    fn test_cli_rejects_conflicting_payloads() {
        let parsed = Cli::try_parse_from([
            "relaybot", "cron", "add", "--every", "10m", "--message", "a", "--system-event", "b",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_cli_tz_requires_cron() {
        assert!(Cli::try_parse_from(["relaybot", "cron", "add", "--tz", "UTC", "--system-event", "x"]).is_err());
    }

    #[test]
    fn test_global_url_flag() {
        let cli = Cli::try_parse_from(["relaybot", "cron", "runs", "--limit", "5", "--url", "http://h:1/rpc"]).unwrap();
        assert_eq!(cli.url.as_deref(), Some("http://h:1/rpc"));
    }
}
