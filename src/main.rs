//! Thin CLI wiring over the opsrelay library: register providers, ask
//! questions, stream answers. The heavy lifting lives in the library.

use clap::{Parser, Subcommand, ValueEnum};
use opsrelay::{
    Agent, HeadlessSink, LlmManager, LlmProvider, ProviderKind, Storage, TimingSink,
    ToolProvider, ToolRegistry, Transport,
};
use std::error::Error;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "opsrelay", version, about = "MCP tool-using agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ask the active LLM provider a question, with all ready tools on offer.
    Ask {
        /// The question; joined from the remaining arguments.
        prompt: Vec<String>,
        /// Route through a specific LLM provider id.
        #[arg(long)]
        provider: Option<String>,
        /// Restrict tools to one tool-provider id.
        #[arg(long)]
        tools: Option<String>,
        /// Emit the answer as a character stream.
        #[arg(long)]
        stream: bool,
    },
    /// Manage MCP tool providers.
    Servers {
        #[command(subcommand)]
        command: ServerCommand,
    },
    /// Manage LLM providers.
    Providers {
        #[command(subcommand)]
        command: ProviderCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ServerCommand {
    Add {
        name: String,
        /// Command line for stdio transports, URL otherwise.
        launch_spec: String,
        #[arg(long, value_enum, default_value_t = TransportArg::Stdio)]
        transport: TransportArg,
    },
    List,
    Remove {
        id: String,
    },
}

#[derive(Subcommand, Debug)]
enum ProviderCommand {
    Add {
        name: String,
        #[arg(long, value_enum)]
        kind: KindArg,
        #[arg(long)]
        model: String,
        /// Name of the environment variable holding the API key.
        #[arg(long)]
        api_key_env: Option<String>,
        #[arg(long)]
        endpoint: Option<String>,
    },
    List,
    /// Make a provider the active one.
    Use {
        id: String,
    },
    Remove {
        id: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransportArg {
    Stdio,
    Sse,
    Http,
}

impl From<TransportArg> for Transport {
    fn from(value: TransportArg) -> Self {
        match value {
            TransportArg::Stdio => Transport::Stdio,
            TransportArg::Sse => Transport::Sse,
            TransportArg::Http => Transport::Http,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Openai,
    Anthropic,
    Local,
}

impl From<KindArg> for ProviderKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Openai => ProviderKind::OpenAi,
            KindArg::Anthropic => ProviderKind::Anthropic,
            KindArg::Local => ProviderKind::Local,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let storage = Storage::new(None)?;
    let registry = Arc::new(ToolRegistry::new(Some(storage.clone())));
    let llm = Arc::new(LlmManager::new(Some(storage)));

    let outcome = run(&cli.command, Arc::clone(&registry), Arc::clone(&llm)).await;
    llm.shutdown().await;
    registry.shutdown().await;
    outcome
}

async fn run(
    command: &Command,
    registry: Arc<ToolRegistry>,
    llm: Arc<LlmManager>,
) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Ask {
            prompt,
            provider,
            tools,
            stream,
        } => {
            let message = prompt.join(" ");
            if message.trim().is_empty() {
                return Err("prompt required".into());
            }
            let agent = Agent::new(registry, llm);
            let mut session = opsrelay::ConversationSession::new();
            session.llm_provider_id = provider.clone();
            session.tool_provider_id = tools.clone();

            let display: Arc<dyn opsrelay::DisplaySink> =
                Arc::new(TimingSink::new(Arc::new(HeadlessSink)));

            if *stream {
                let mut rx = agent
                    .process_conversation_streaming(&mut session, &message, Some(display))
                    .await;
                while let Some(chunk) = rx.recv().await {
                    if let Some(error) = chunk.error {
                        return Err(error.into());
                    }
                    print!("{}", chunk.content);
                    use std::io::Write;
                    std::io::stdout().flush()?;
                }
                println!();
            } else {
                let answer = agent
                    .process_conversation(&mut session, &message, Some(display))
                    .await?;
                println!("{answer}");
            }
        }
        Command::Servers { command } => match command {
            ServerCommand::Add {
                name,
                launch_spec,
                transport,
            } => {
                let added = registry
                    .add(ToolProvider::new(name, launch_spec, (*transport).into()))
                    .await?;
                info!(id = %added.id, status = added.status.as_str(), "tool provider registered");
                println!("{} {} ({})", added.id, added.name, added.status.as_str());
            }
            ServerCommand::List => {
                for server in registry.list().await {
                    println!(
                        "{} {} [{}] {} tools={}",
                        server.id,
                        server.name,
                        server.transport.as_str(),
                        server.status.as_str(),
                        server.tools.len()
                    );
                }
            }
            ServerCommand::Remove { id } => {
                registry.remove(id).await?;
                println!("removed {id}");
            }
        },
        Command::Providers { command } => match command {
            ProviderCommand::Add {
                name,
                kind,
                model,
                api_key_env,
                endpoint,
            } => {
                let mut provider = LlmProvider::new(name, (*kind).into(), model);
                if let Some(env_var) = api_key_env {
                    provider.api_key = resolve_api_key(name, env_var).unwrap_or_default();
                }
                if let Some(endpoint) = endpoint {
                    provider.endpoint = endpoint.clone();
                }
                let added = llm.add(provider).await?;
                println!("{} {}", added.id, added.name);
            }
            ProviderCommand::List => {
                for provider in llm.list().await {
                    let marker = if provider.is_active { "*" } else { " " };
                    println!(
                        "{marker} {} {} [{}] model={}",
                        provider.id,
                        provider.name,
                        provider.kind.as_str(),
                        provider.model
                    );
                }
            }
            ProviderCommand::Use { id } => {
                llm.set_active(id).await?;
                println!("active provider: {id}");
            }
            ProviderCommand::Remove { id } => {
                llm.remove(id).await?;
                println!("removed {id}");
            }
        },
    }
    Ok(())
}

fn resolve_api_key(provider: &str, env_var: &str) -> Option<String> {
    match std::env::var(env_var.trim()) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => {
            tracing::warn!(provider, env_var, "API key environment variable is not set");
            None
        }
    }
}

fn init_tracing() {
    let default = if std::env::var("DEBUG").is_ok() || std::env::var("VERBOSE").is_ok() {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .init();
    debug!("tracing initialised");
}
