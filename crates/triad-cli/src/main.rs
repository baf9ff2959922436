//! Triad CLI - plan, execute and verify TODO lists with tool servers
//!
//! Usage:
//!   triad init                        Write a default .triad/config.toml
//!   triad tools list                  List tools advertised by the configured servers
//!   triad tools status                Show server status
//!   triad tools call <tool> <json>    Call one tool
//!   triad ask <prompt>                One exchange with the agent runtime
//!   triad run <request>               Full orchestration, events as JSON lines

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use triad_agent::{AgentTransport, CircuitBreaker, LlmClient};
use triad_core::{ToolDispatcher, TriadConfig};
use triad_orchestrator::{
    LlmChatResponder, LlmModeSelector, LlmReplanner, LlmServerSelector, LlmTodoPlanner,
    LlmToolPlanner, Orchestrator, StageEvent, ToolExecutor,
};
use triad_tools::ToolManager;
use triad_verify::{AgentVisionAnalysis, CommandCapture, StuckDetector, VerificationGate};

#[derive(Parser)]
#[command(name = "triad")]
#[command(author, version, about = "Planner, executor and verifier agents over a TODO list")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding .triad/config.toml
    #[arg(long, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Tool server management
    Tools {
        #[command(subcommand)]
        action: ToolCommands,
    },

    /// Send one prompt to the agent runtime and print the reply
    Ask {
        prompt: String,
    },

    /// Plan, execute and verify a request
    Run {
        request: String,

        /// Session whose history the run joins
        #[arg(long, default_value = "cli")]
        session: String,
    },
}

#[derive(Subcommand)]
enum ToolCommands {
    /// List tools by server
    List,

    /// Show server readiness and pending calls
    Status,

    /// Call a tool
    Call {
        tool: String,

        /// Arguments as a JSON object
        #[arg(default_value = "{}")]
        arguments: String,

        /// Call a specific server instead of the first one providing the tool
        #[arg(long)]
        server: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins; --verbose only changes the fallback level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_log_level(cli.verbose)));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Init { force } => cmd_init(&cli.root, force),
        Commands::Tools { action } => {
            let config = load_config(&cli.root)?;
            cmd_tools(&config, action).await
        }
        Commands::Ask { prompt } => {
            let config = load_config(&cli.root)?;
            cmd_ask(&config, &prompt).await
        }
        Commands::Run { request, session } => {
            let config = load_config(&cli.root)?;
            cmd_run(&cli.root, &config, request, session).await
        }
    }
}

fn default_log_level(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "info"
    }
}

fn load_config(root: &Path) -> Result<TriadConfig> {
    TriadConfig::load_or_default(root)
        .with_context(|| format!("Failed to load config from {:?}", root.join(".triad")))
}

fn cmd_init(root: &Path, force: bool) -> Result<()> {
    let path = root.join(".triad/config.toml");
    if path.exists() && !force {
        println!("Config already exists at {:?} (use --force to overwrite)", path);
        return Ok(());
    }

    TriadConfig::write_default(root).context("Failed to write default config")?;
    println!("Initialized Triad in {:?}", root);
    println!("Created:");
    println!("  .triad/config.toml");
    println!("\nNext steps:");
    println!("  1. Add tool servers under [[tools.servers]]");
    println!("  2. Point [llm] and [agent] at your endpoints");
    println!("  3. Run 'triad run \"<request>\"'");
    Ok(())
}

async fn cmd_tools(config: &TriadConfig, action: ToolCommands) -> Result<()> {
    let manager = ToolManager::start(&config.tools)
        .await
        .context("Failed to start tool servers")?;

    let outcome = match action {
        ToolCommands::List => {
            let tools = manager.list_tools();
            if tools.is_empty() {
                println!("No tools available");
            }
            for (server, tool) in tools {
                match tool.description {
                    Some(description) => println!("{}/{}  {}", server, tool.name, description),
                    None => println!("{}/{}", server, tool.name),
                }
            }
            Ok(())
        }
        ToolCommands::Status => {
            println!("Tool Servers");
            println!("============");
            for status in manager.status() {
                println!(
                    "{:<20} {:<8} tools={:<4} pending={:<4} pid={}",
                    status.name,
                    if status.ready { "ready" } else { "down" },
                    status.tool_count,
                    status.pending,
                    status
                        .pid
                        .map(|pid| pid.to_string())
                        .unwrap_or_else(|| "-".to_string())
                );
            }
            Ok(())
        }
        ToolCommands::Call {
            tool,
            arguments,
            server,
        } => call_tool(&manager, &tool, &arguments, server.as_deref()).await,
    };

    manager.shutdown().await;
    outcome
}

async fn call_tool(
    manager: &ToolManager,
    tool: &str,
    arguments: &str,
    server: Option<&str>,
) -> Result<()> {
    let arguments: serde_json::Value =
        serde_json::from_str(arguments).context("Tool arguments must be valid JSON")?;

    let outcome = match server {
        Some(server) => manager.call_on(server, tool, arguments).await,
        None => manager.call(tool, arguments).await,
    }
    .with_context(|| format!("Tool call '{}' failed", tool))?;

    if outcome.is_error {
        anyhow::bail!("Tool '{}' reported an error: {}", tool, outcome.text());
    }
    println!("{}", outcome.text());
    Ok(())
}

async fn cmd_ask(config: &TriadConfig, prompt: &str) -> Result<()> {
    let transport = AgentTransport::new(config.agent.clone());
    info!("Asking agent at {}", transport.url());

    let reply = transport
        .exchange(prompt)
        .await
        .context("Agent exchange failed")?;
    match reply {
        Some(text) => println!("{}", text),
        None => println!("(no reply)"),
    }
    Ok(())
}

async fn cmd_run(
    root: &Path,
    config: &TriadConfig,
    request: String,
    session: String,
) -> Result<()> {
    let llm_breaker = Arc::new(CircuitBreaker::new("llm", config.breaker.clone()));
    let llm = Arc::new(
        LlmClient::new(config.llm.clone())
            .context("Failed to build LLM client")?
            .with_breaker(llm_breaker),
    );

    let tools = Arc::new(
        ToolManager::start(&config.tools)
            .await
            .context("Failed to start tool servers")?,
    );
    let dispatcher: Arc<dyn ToolDispatcher> = tools.clone();

    let transport = Arc::new(
        AgentTransport::new(config.agent.clone()).with_dispatcher(dispatcher.clone()),
    );
    let analysis = Arc::new(AgentVisionAnalysis::new(transport));
    let capture = Arc::new(CommandCapture::from_config(&config.verify, root));
    let gate = VerificationGate::new(capture, analysis.clone(), &config.verify)
        .with_stuck_detector(StuckDetector::new(config.verify.stuck_window, analysis));

    let mut executor = ToolExecutor::new(
        dispatcher,
        tools.list_tools(),
        Arc::new(LlmToolPlanner::new(llm.clone())),
    );
    if config.tools.select_servers {
        executor = executor.with_server_selector(Arc::new(LlmServerSelector::new(llm.clone())));
    }
    let mut orchestrator = Orchestrator::new(
        Arc::new(LlmTodoPlanner::new(llm.clone(), config.session.max_attempts)),
        Arc::new(executor),
        Arc::new(gate),
        Arc::new(LlmReplanner::new(llm.clone())),
        config,
    );
    if config.session.select_mode {
        orchestrator = orchestrator.with_mode_selection(
            Arc::new(LlmModeSelector::new(llm.clone())),
            Arc::new(LlmChatResponder::new(llm)),
        );
    }
    let orchestrator = Arc::new(orchestrator);

    info!("Running request in session {}", session);
    let events = orchestrator.orchestrate(request, session);
    futures::pin_mut!(events);

    let mut completed = false;
    while let Some(event) = events.next().await {
        completed = matches!(event, StageEvent::WorkflowComplete { .. });
        println!("{}", serde_json::to_string(&event)?);
    }

    tools.shutdown().await;
    if !completed {
        anyhow::bail!("Run did not complete");
    }
    Ok(())
}
