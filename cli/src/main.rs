use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{apps, engine};
use qlik_mcp_runtime::{McpCommands, run as run_mcp};

#[derive(Parser)]
#[command(
    name = "qlik",
    version,
    about = "Qlik CLI — Cloud catalog and Engine API access from the terminal"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available apps
    Apps(apps::AppsArgs),
    /// Show one app's details and metadata
    App(apps::AppArgs),
    /// List spaces
    Spaces(apps::SpacesArgs),
    /// Engine API operations against one app
    Engine {
        #[command(subcommand)]
        command: engine::EngineCommands,
    },
    /// MCP server operations
    Mcp {
        #[command(subcommand)]
        command: McpCommands,
    },
}

pub(crate) fn exit_error(message: &str, docs_hint: Option<&str>) -> ! {
    let mut err = json!({
        "error": "cli_error",
        "message": message
    });
    if let Some(hint) = docs_hint {
        err["docs_hint"] = json!(hint);
    }
    eprintln!(
        "{}",
        serde_json::to_string_pretty(&err).unwrap_or_else(|_| message.to_string())
    );
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Apps(args) => apps::list_apps(args).await,
        Commands::App(args) => apps::app_details(args).await,
        Commands::Spaces(args) => apps::list_spaces(args).await,
        Commands::Engine { command } => engine::run(command).await,
        Commands::Mcp { command } => {
            let code = run_mcp(command).await;
            std::process::exit(code);
        }
    };

    if let Err(e) = result {
        exit_error(&e.to_string(), None);
    }
}
