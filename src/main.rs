//! rtunnel - reverse tunnel broker
//!
//! One binary, three roles: the public `relay`, the `agent` running next to
//! private services, and the `client` exposing a private target on a local
//! port.

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, Subcommand};
use rtunnel_agent::{Agent, AgentConfig, Allowlist, DEFAULT_ALLOW_PREFIX};
use rtunnel_client::{ClientConfig, ListenerConfig, TunnelListener};
use rtunnel_proto::TOKEN_ENV;
use rtunnel_relay::{Relay, RelayConfig};
use rtunnel_transport::TransportConfig;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

/// Reverse tunnel broker: reach services behind NAT through a public relay
#[derive(Parser, Debug)]
#[command(name = "rtunnel")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public relay
    #[command(long_about = r#"
Run the relay that agents and clients both connect to.

EXAMPLES:
  # TLS with a self-signed certificate generated on first start
  rtunnel relay --addr 0.0.0.0:8443 --token $TUNNEL_TOKEN

  # Plain ws:// behind a TLS-terminating proxy
  rtunnel relay --addr 127.0.0.1:8080 --plain
"#)]
    Relay {
        /// Listen address
        #[arg(long, default_value = "0.0.0.0:8443")]
        addr: SocketAddr,

        /// TLS certificate (PEM); generated if missing
        #[arg(long, default_value = "server.crt")]
        cert: PathBuf,

        /// TLS private key (PEM); generated if missing
        #[arg(long, default_value = "server.key")]
        key: PathBuf,

        /// Serve plain ws:// without TLS
        #[arg(long)]
        plain: bool,

        /// Shared secret for agents and clients
        #[arg(long, env = TOKEN_ENV, hide_env_values = true, value_parser = non_empty_token)]
        token: String,
    },

    /// Run an agent next to private services
    #[command(long_about = r#"
Connect to a relay, register under an id and dial allowed targets on request.

EXAMPLES:
  rtunnel agent --id office-db \
    --relay-url wss://relay.example.com:8443/ws/agent \
    --allow 127.0.0.1:5432

  # Settings from a YAML file, CLI flags override
  rtunnel agent --config agent.yaml
"#)]
    Agent {
        /// Agent ID (auto-generated if not specified)
        #[arg(long)]
        id: Option<String>,

        /// Relay URL including the path, e.g. wss://relay:8443/ws/agent
        #[arg(long)]
        relay_url: Option<String>,

        /// Shared secret
        #[arg(long, env = TOKEN_ENV, hide_env_values = true, value_parser = non_empty_token)]
        token: Option<String>,

        /// Target address prefix this agent may dial (repeatable)
        #[arg(long = "allow")]
        allow: Vec<String>,

        /// Skip TLS certificate verification (insecure, for development only)
        #[arg(long)]
        insecure: bool,

        /// Extra CA certificate (PEM) to trust for the relay
        #[arg(long)]
        ca_cert: Option<PathBuf>,

        /// Configuration file (YAML)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },

    /// Expose a target behind an agent on a local port
    #[command(long_about = r#"
Listen locally and forward every connection through the relay and an agent.

EXAMPLES:
  rtunnel client -L 127.0.0.1:5433 \
    --relay-url wss://relay.example.com:8443/ws/client \
    --agent office-db --target 127.0.0.1:5432
"#)]
    Client {
        /// Local listen address
        #[arg(short = 'L', long)]
        local: String,

        /// Relay URL including the path, e.g. wss://relay:8443/ws/client
        #[arg(long)]
        relay_url: String,

        /// Agent to route through
        #[arg(long)]
        agent: String,

        /// Target address the agent dials
        #[arg(long)]
        target: String,

        /// Shared secret
        #[arg(long, env = TOKEN_ENV, hide_env_values = true, value_parser = non_empty_token)]
        token: String,

        /// Skip TLS certificate verification (insecure, for development only)
        #[arg(long)]
        insecure: bool,

        /// Extra CA certificate (PEM) to trust for the relay
        #[arg(long)]
        ca_cert: Option<PathBuf>,
    },
}

fn non_empty_token(value: &str) -> Result<String, String> {
    if value.trim().is_empty() {
        Err("token must not be empty".to_string())
    } else {
        Ok(value.to_string())
    }
}

/// A required agent setting found neither in the flags nor the config file
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct MissingSetting(String);

/// Agent configuration file
#[derive(Debug, Default, Deserialize)]
struct AgentFile {
    relay_url: Option<String>,

    /// Direct token (prefer `token_env`)
    token: Option<String>,

    /// Environment variable holding the token
    token_env: Option<String>,

    id: Option<String>,

    #[serde(default)]
    allow: Vec<String>,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

fn load_agent_file(path: &Path) -> Result<AgentFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn transport_config(insecure: bool, ca_cert: Option<PathBuf>) -> TransportConfig {
    let mut transport = TransportConfig::default().with_insecure_skip_verify(insecure);
    if let Some(path) = ca_cert {
        transport = transport.with_ca_cert(path);
    }
    transport
}

/// Agent flags after merging with the optional config file
struct AgentArgs {
    id: Option<String>,
    relay_url: Option<String>,
    token: Option<String>,
    allow: Vec<String>,
    insecure: bool,
    ca_cert: Option<PathBuf>,
}

/// Merge CLI args with the config file, giving precedence to CLI args
fn build_agent_config(args: AgentArgs, file: AgentFile) -> Result<AgentConfig> {
    let file_token = match &file.token_env {
        Some(var) => Some(
            std::env::var(var).with_context(|| format!("Environment variable {} not set", var))?,
        ),
        None => file.token,
    };

    let relay_url = args
        .relay_url
        .or(file.relay_url)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| {
            MissingSetting("Relay URL is required (use --relay-url or config file)".to_string())
        })?;

    let token = args
        .token
        .or(file_token)
        .filter(|token| !token.trim().is_empty())
        .ok_or_else(|| {
            MissingSetting(format!(
                "Token is required (use --token, {}, or config file)",
                TOKEN_ENV
            ))
        })?;

    let agent_id = args.id.or(file.id).unwrap_or_else(|| {
        let id = format!("agent-{}", Uuid::new_v4());
        info!("Auto-generated agent ID: {}", id);
        id
    });

    let allow = if args.allow.is_empty() { file.allow } else { args.allow };
    let allowlist = if allow.is_empty() {
        info!(
            "No --allow given, only targets starting with {} are reachable",
            DEFAULT_ALLOW_PREFIX
        );
        Allowlist::default()
    } else {
        Allowlist::new(allow)
    };

    Ok(AgentConfig::new(agent_id, relay_url, token)
        .with_allowlist(allowlist)
        .with_transport(transport_config(args.insecure, args.ca_cert)))
}

async fn run_relay(config: RelayConfig) -> Result<()> {
    let relay = Arc::new(Relay::new(config));

    let serving = relay.clone();
    let mut relay_task = tokio::spawn(async move { serving.run().await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            relay.shutdown();
            relay_task.await.context("Relay task panicked")??;
        }
        result = &mut relay_task => {
            result.context("Relay task panicked")??;
        }
    }

    info!("Relay stopped");
    Ok(())
}

async fn run_agent(config: AgentConfig) -> Result<()> {
    info!("Agent ID: {}", config.agent_id);
    info!("Relay: {}", config.relay_url);
    info!("Allowed targets: {:?}", config.allowlist.entries());

    let agent = Arc::new(Agent::new(config).context("Failed to create agent")?);

    let running = agent.clone();
    let mut agent_task = tokio::spawn(async move { running.run().await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            agent.shutdown();
            agent_task.await.context("Agent task panicked")??;
        }
        result = &mut agent_task => {
            if let Ok(Err(e)) = &result {
                error!("Agent error: {}", e);
            }
            result.context("Agent task panicked")??;
        }
    }

    info!("Agent stopped");
    Ok(())
}

async fn run_client(config: ListenerConfig) -> Result<()> {
    let listener = Arc::new(
        TunnelListener::bind(config)
            .await
            .context("Failed to bind local listener")?,
    );

    let running = listener.clone();
    let mut listener_task = tokio::spawn(async move { running.run().await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            listener.shutdown();
            listener_task.await.context("Listener task panicked")??;
        }
        result = &mut listener_task => {
            result.context("Listener task panicked")??;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level)?;

    match cli.command {
        Commands::Relay {
            addr,
            cert,
            key,
            plain,
            token,
        } => {
            let mut config = RelayConfig::new(addr, token);
            if !plain {
                config = config.with_tls(cert, key);
            }
            run_relay(config).await
        }
        Commands::Agent {
            id,
            relay_url,
            token,
            allow,
            insecure,
            ca_cert,
            config,
        } => {
            let file = match &config {
                Some(path) => {
                    info!("Loading configuration from: {}", path.display());
                    load_agent_file(path)?
                }
                None => AgentFile::default(),
            };
            let args = AgentArgs {
                id,
                relay_url,
                token,
                allow,
                insecure,
                ca_cert,
            };
            let config = match build_agent_config(args, file) {
                Ok(config) => config,
                Err(e) => {
                    if let Some(missing) = e.downcast_ref::<MissingSetting>() {
                        Cli::command()
                            .error(ErrorKind::MissingRequiredArgument, missing)
                            .exit();
                    }
                    return Err(e.context("Failed to build agent configuration"));
                }
            };
            run_agent(config).await
        }
        Commands::Client {
            local,
            relay_url,
            agent,
            target,
            token,
            insecure,
            ca_cert,
        } => {
            let client = ClientConfig::new(relay_url, token)
                .with_transport(transport_config(insecure, ca_cert));
            run_client(ListenerConfig::new(local, agent, target, client)).await
        }
    }
}
