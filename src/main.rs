use agent_mcp::agent::{build_llm_client, InvocationOrchestrator, OrchestratorSettings};
use agent_mcp::auth::CredentialProvider;
use agent_mcp::config::Config;
use agent_mcp::mcp::{McpConnector, McpServer};
use agent_mcp::registry::ServerRegistry;
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
#[command(version)]
struct Cli {
    /// Configuration file path (defaults to $AGENT_MCP_CONFIG, then ./config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Also write DEBUG logs to ~/.agent-mcp/agent-mcp.log
    #[arg(long)]
    debug: bool,

    /// Clear cached OAuth tokens for the named servers and exit; lists cached entries when no name is given
    #[arg(long, num_args = 0.., value_name = "SERVER")]
    reauth: Option<Vec<String>>,

    /// Print the configured servers and exit
    #[arg(long)]
    list: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries JSON-RPC, so every log line goes to stderr
    init_logging(&cli)?;

    let config = Config::load(cli.config.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    if let Some(names) = &cli.reauth {
        return reauth(&config, names);
    }

    let registry = Arc::new(ServerRegistry::from_config(&config)?);
    if cli.list {
        print_registry(&registry);
        return Ok(());
    }

    let credentials = Arc::new(CredentialProvider::from_config(&config)?);
    let connector = Arc::new(McpConnector::new(config.client.clone()));
    let llm = build_llm_client(&config)?;
    let orchestrator = Arc::new(InvocationOrchestrator::new(
        Arc::clone(&registry),
        credentials,
        connector,
        llm,
        OrchestratorSettings::from_config(&config),
    ));

    info!(
        "{} {} started with {} server(s): {:?}",
        env!("CARGO_PKG_NAME"),
        agent_mcp::VERSION,
        registry.len(),
        registry.names()
    );
    Arc::new(McpServer::new(orchestrator)).serve_stdio().await?;
    Ok(())
}

fn init_logging(cli: &Cli) -> Result<()> {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let stderr_layer = match cli.log_format {
        LogFormat::Text => fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
    }
    .with_filter(env_filter);

    let file_layer = if cli.debug {
        let dir = dirs::home_dir()
            .context("Cannot determine the home directory for the debug log")?
            .join(".agent-mcp");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join("agent-mcp.log");
        let file = File::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        eprintln!("Debug logging to {}", path.display());
        Some(
            fmt::layer()
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .with_filter(LevelFilter::DEBUG),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Ok(())
}

fn reauth(config: &Config, names: &[String]) -> Result<()> {
    let credentials = CredentialProvider::from_config(config)?;

    if names.is_empty() {
        let cached = credentials.list_cached()?;
        if cached.is_empty() {
            println!("No cached OAuth tokens.");
        } else {
            println!("Cached OAuth tokens:");
            for name in cached {
                println!("  {}", name);
            }
        }
        return Ok(());
    }

    for (name, cleared) in credentials.clear(names)? {
        if cleared {
            println!("Cleared OAuth tokens for '{}'.", name);
        } else {
            println!("No cached tokens for '{}'.", name);
        }
    }
    Ok(())
}

fn print_registry(registry: &ServerRegistry) {
    if registry.is_empty() {
        println!("No servers configured.");
        return;
    }
    for descriptor in registry.descriptors() {
        println!(
            "{:<20} {:<6} auth={:<7} {}",
            descriptor.name,
            descriptor.transport.as_str(),
            descriptor.auth.as_str(),
            descriptor.description
        );
    }
}
