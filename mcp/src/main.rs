use clap::Parser;
use tracing_subscriber::EnvFilter;

use qlik_mcp_runtime::{McpCommands, run as run_mcp};

#[derive(Parser)]
#[command(
    name = "qlik-mcp",
    version,
    about = "Qlik MCP server — dedicated MCP runtime over stdio"
)]
struct Cli {
    #[command(subcommand)]
    command: McpCommands,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    // Stdout carries the MCP frames; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let code = run_mcp(cli.command).await;
    std::process::exit(code);
}
