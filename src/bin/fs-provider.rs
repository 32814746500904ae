use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use agentwire::{init_tracing, FilesystemServer, LoggingConfig};

/// MCP filesystem provider speaking JSON-RPC on stdin/stdout.
#[derive(Debug, Parser)]
#[command(name = "fs-provider", version)]
struct Args {
    /// Root directory for file operations.
    #[arg(long, default_value = ".")]
    root_dir: PathBuf,

    /// Emit `filesystem/change` notifications for changes under the root.
    #[arg(long)]
    watch: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut logging = LoggingConfig::default();
    if let Ok(filter) = std::env::var("AGENTWIRE_LOG") {
        logging.filter = filter;
    }
    init_tracing(&logging)?;

    let server = Arc::new(FilesystemServer::new(&args.root_dir, args.watch)?);
    tracing::info!(root = %server.root().display(), watch = args.watch, "filesystem provider starting");
    server.start()?;

    let outcome = Arc::clone(&server)
        .serve(tokio::io::stdin(), tokio::io::stdout())
        .await;
    server.stop().await;
    outcome?;
    Ok(())
}
