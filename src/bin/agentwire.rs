use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use agentwire::{init_tracing, with_providers, Agent, AppConfig, OpenAIClient, ToolRegistry};

/// Chat with a model that can call tools from the configured providers.
#[derive(Debug, Parser)]
#[command(name = "agentwire", version)]
struct Args {
    /// TOML configuration file. Without it, defaults and environment
    /// variables are used.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Overrides the configured system prompt.
    #[arg(long)]
    system_prompt: Option<String>,

    /// Overrides the configured model identifier.
    #[arg(long)]
    model: Option<String>,
}

#[tokio::main]
async fn main() -> agentwire::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => AppConfig::from_env_or_file(path)?,
        None => AppConfig::from_env(),
    };
    if let Some(prompt) = args.system_prompt {
        cfg.agent.system_prompt = prompt;
    }
    if let Some(model) = args.model {
        cfg.model.model = model;
    }
    init_tracing(&cfg.logging)?;

    let client = Arc::new(OpenAIClient::from_config(&cfg.model)?);
    let agent_config = cfg.agent_config()?;

    with_providers(&cfg.providers, |pool| async move {
        let mut tools = ToolRegistry::new();
        let count = pool.register_tools(&mut tools).await?;
        tracing::info!(providers = pool.len(), tools = count, "tools ready");

        let mut agent = Agent::new(client, agent_config)?.with_tools(tools);
        prompt_loop(&mut agent).await
    })
    .await
}

async fn prompt_loop(agent: &mut Agent<OpenAIClient>) -> agentwire::Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        stdout
            .write_all(b"\nEnter your prompt (or 'quit' to exit): ")
            .await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }
        if matches!(prompt.to_lowercase().as_str(), "quit" | "exit" | "q") {
            break;
        }

        match agent.invoke_with_prompt(prompt).await {
            Ok(response) => {
                stdout
                    .write_all(format!("\nResponse: {response}\n").as_bytes())
                    .await?;
            }
            Err(err) => {
                tracing::error!(error = %err, "prompt failed");
                stdout
                    .write_all(format!("\nError occurred: {err}\n").as_bytes())
                    .await?;
            }
        }
    }
    Ok(())
}
