//! Monologue MCP Server — entry point.

use std::sync::Arc;

use clap::{Parser, Subcommand};

use monologue_mcp::config::load_config;
use monologue_mcp::http::{self, AppState};
use monologue_mcp::llm::{AnthropicClient, MessageClient};
use monologue_mcp::tools::ToolRegistry;
use monologue_mcp::types::{
    ServerCapabilities, LATEST_PROTOCOL_VERSION, SERVER_NAME, SERVER_VERSION,
};

#[derive(Parser)]
#[command(
    name = "monologue-mcp",
    about = "MCP server over SSE that generates Pragmatic vs Creative internal monologues",
    version
)]
struct Cli {
    /// Configuration file path.
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the MCP server over SSE (default).
    Serve {
        /// Listen address, overriding the configuration.
        #[arg(long)]
        addr: Option<String>,

        /// Configuration file path.
        #[arg(short, long)]
        config: Option<String>,

        /// Log level (trace, debug, info, warn, error).
        #[arg(long)]
        log_level: Option<String>,
    },

    /// Print server capabilities as JSON.
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let command = cli.command.unwrap_or(Commands::Serve {
        addr: None,
        config: None,
        log_level: None,
    });

    let log_level = match &command {
        Commands::Serve {
            log_level: Some(level),
            ..
        } => level.clone(),
        _ => cli.log_level.clone(),
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match command {
        Commands::Serve { addr, config, .. } => {
            let effective_config = config.or(cli.config);
            let mut config = load_config(effective_config.as_deref())?;
            if let Some(addr) = addr {
                config.addr = addr;
            }

            let client: Arc<dyn MessageClient> = Arc::new(AnthropicClient::from_env(
                &config.llm.api_key_env,
                Some(&config.llm.base_url),
            )?);
            let tools = Arc::new(ToolRegistry::new(client, config.llm.clone()));

            let state = AppState::new(config, tools);
            if state.auth_token.is_none() {
                tracing::warn!(
                    "{} is not set; HTTP routes accept unauthenticated requests",
                    state.config.auth.api_key_env
                );
            }
            http::serve(state).await?;
        }

        Commands::Info => {
            let tools = ToolRegistry::list_tools();
            let info = serde_json::json!({
                "server": { "name": SERVER_NAME, "version": SERVER_VERSION },
                "protocol_version": LATEST_PROTOCOL_VERSION,
                "capabilities": ServerCapabilities::tools_only(),
                "tools": tools.iter().map(|t| &t.name).collect::<Vec<_>>(),
                "tool_count": tools.len(),
            });
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
    }

    Ok(())
}
