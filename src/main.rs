//! # grounded
//!
//! Command-line front end: loads settings, installs telemetry, wires the
//! provider, tool executor and optional managed agent, and runs one exchange.

#![deny(unsafe_code)]

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use grounded_core::agent::AgentDefinition;
use grounded_core::config::{secret_from_env, ConfigProvider, Settings};
use grounded_core::messages::Message;
use grounded_engine::{
    create_default_registry, AgentCache, Citation, CitationNormalizer, ConversationOrchestrator,
    ExchangeReport, LocalToolExecutor, RemoteToolExecutor, StreamChunk, ToolExecutor,
};
use grounded_llm::{AssistantsClient, OpenAiChatProvider};
use grounded_telemetry::{init_telemetry, TelemetryConfig};

const API_KEY_ENV: &str = "GROUNDED_API_KEY";
const AGENT_API_KEY_ENV: &str = "GROUNDED_AGENT_API_KEY";
const SEARCH_PROXY_KEY_ENV: &str = "GROUNDED_SEARCH_PROXY_KEY";
const FUNCTION_KEY_ENV: &str = "GROUNDED_FUNCTION_KEY";

const AGENT_CACHE_CAPACITY: usize = 8;

/// Tool-augmented, citation-grounded chat from the command line.
#[derive(Parser, Debug)]
#[command(name = "grounded", about = "Tool-augmented chat with cited sources")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Human-readable logs instead of JSON lines.
    #[arg(long, global = true)]
    pretty_logs: bool,

    /// Verbose logging for the grounded crates.
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ask one question and print the answer with its sources.
    Ask(AskArgs),
}

#[derive(Args, Debug)]
struct AskArgs {
    prompt: String,

    /// System prompt (overrides the settings file).
    #[arg(long)]
    system: Option<String>,

    /// Stream the answer as it is generated.
    #[arg(long, overrides_with = "no_stream")]
    stream: bool,

    /// Wait for the full answer.
    #[arg(long, overrides_with = "stream")]
    no_stream: bool,

    /// Print the exchange report as JSON instead of plain text.
    #[arg(long)]
    json: bool,

    /// Path to a JSON settings file.
    #[arg(long)]
    settings: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut telemetry = TelemetryConfig {
        json: !cli.pretty_logs,
        ..TelemetryConfig::default()
    };
    if cli.verbose {
        for module in ["grounded_engine", "grounded_llm", "grounded_core"] {
            telemetry = telemetry.with_module_level(module, Level::DEBUG);
        }
    }
    init_telemetry(&telemetry).context("failed to initialize telemetry")?;

    match cli.command {
        Command::Ask(args) => ask(args).await,
    }
}

async fn ask(args: AskArgs) -> Result<()> {
    let settings = Settings::load(args.settings.as_deref()).context("failed to load settings")?;
    let orchestrator = build_orchestrator(Arc::new(settings), args.system)?;

    let streaming = if args.stream {
        true
    } else if args.no_stream {
        false
    } else {
        orchestrator.streaming_enabled()
    };

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling exchange");
            interrupt.cancel();
        }
    });

    let messages = vec![Message::user(args.prompt)];
    if args.json {
        let result = orchestrator.complete_blocking(messages, &cancel).await;
        let report = ExchangeReport::from_result(result);
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if streaming {
        let mut stream = orchestrator.complete_streaming(messages, &cancel);
        let mut stdout = std::io::stdout();
        while let Some(item) = stream.next().await {
            match item? {
                StreamChunk::Text(delta) => {
                    write!(stdout, "{delta}")?;
                    stdout.flush()?;
                }
                StreamChunk::Citations { citations, .. } => {
                    writeln!(stdout)?;
                    print_sources(&citations);
                }
                StreamChunk::MalformedCalls(calls) => {
                    for call in &calls {
                        warn!(tool_call_id = %call.id, reason = %call.reason, "tool call skipped");
                    }
                }
            }
        }
        writeln!(stdout)?;
    } else {
        let outcome = orchestrator.complete_blocking(messages, &cancel).await?;
        println!("{}", outcome.content);
        print_sources(&outcome.citations);
    }
    Ok(())
}

fn build_orchestrator(
    settings: Arc<Settings>,
    system: Option<String>,
) -> Result<ConversationOrchestrator> {
    let config: Arc<dyn ConfigProvider> = settings.clone();

    let provider = OpenAiChatProvider::new(
        settings.provider.base_url.clone(),
        settings.provider.model.clone(),
        secret_from_env(API_KEY_ENV),
    )
    .context("failed to create chat provider")?;

    let registry = Arc::new(create_default_registry(
        &settings,
        secret_from_env(SEARCH_PROXY_KEY_ENV),
    ));
    let executor: Arc<dyn ToolExecutor> = match &settings.tool_endpoint {
        Some(endpoint) => {
            info!(endpoint = %endpoint, "dispatching tool calls to remote endpoint");
            let mut remote =
                RemoteToolExecutor::new(endpoint.clone(), registry.definitions(), config.clone());
            if let Some(key) = secret_from_env(FUNCTION_KEY_ENV) {
                remote = remote.with_function_key(key);
            }
            Arc::new(remote)
        }
        None => Arc::new(LocalToolExecutor::new(registry, config.clone())),
    };
    let tools = executor.definitions();

    let mut orchestrator = ConversationOrchestrator::new(Arc::new(provider), executor, config)
        .with_sampling(settings.sampling.clone())
        .with_citations(CitationNormalizer::new(settings.internal_index.clone()));
    if let Some(prompt) = system.or_else(|| settings.system_prompt.clone()) {
        orchestrator = orchestrator.with_system_prompt(prompt);
    }

    if let Some(agent) = &settings.agent {
        let key = secret_from_env(AGENT_API_KEY_ENV).or_else(|| secret_from_env(API_KEY_ENV));
        let service = AssistantsClient::new(agent.base_url.clone(), key)
            .context("failed to create agent service client")?;
        let definition = AgentDefinition {
            key: agent.key.clone(),
            name: agent.name.clone(),
            model: agent.model.clone(),
            instructions: agent.instructions.clone(),
            tools,
            hosted_tools: Vec::new(),
        };
        let cache = Arc::new(AgentCache::new(
            Duration::from_secs(agent.cache_ttl_secs),
            AGENT_CACHE_CAPACITY,
        ));
        info!(agent = %agent.key, "exchanges routed through managed agent");
        orchestrator = orchestrator.with_agent(Arc::new(service), cache, definition);
    }

    Ok(orchestrator)
}

fn print_sources(citations: &[Citation]) {
    if citations.is_empty() {
        return;
    }
    println!("Sources:");
    for citation in citations {
        match &citation.url {
            Some(url) => println!("  [{}] {} <{}>", citation.source_label, citation.title, url),
            None => println!("  [{}] {}", citation.source_label, citation.title),
        }
    }
}
