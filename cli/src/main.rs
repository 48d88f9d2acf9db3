//! Ember CLI - interactive terminal session for the coding agent.
//!
//! The binary wires together an [`ember_engine::Agent`], the built-in tool
//! registry, and a line-oriented prompt. While a turn is in flight the loop
//! multiplexes three sources: the turn future itself, approval requests from
//! the engine, and progress events. Logs go to a file so the transcript on
//! screen stays clean.

use std::path::PathBuf;
use std::pin::pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

use ember_context::ConversationCompactor;
use ember_engine::{
    Agent, AgentEvent, ApprovalDecision, ApprovalGate, Config, EngineError, HttpProvider,
    PendingApproval,
};
use ember_tools::{builtins::register_builtins, AgentContext, PathSandbox, ToolRegistry};
use ember_types::NonEmptyString;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let log_path = dirs::data_dir().map(|dir| dir.join("ember").join("ember.log"));
    if let Some(path) = log_path {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
        {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
            return;
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

struct CliArgs {
    config_path: Option<PathBuf>,
    /// One-shot prompt; when present the session ends after a single turn.
    prompt: Option<String>,
}

fn parse_args() -> Result<CliArgs> {
    let mut args = std::env::args().skip(1);
    let mut parsed = CliArgs {
        config_path: None,
        prompt: None,
    };
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let value = args.next().context("--config requires a path")?;
                parsed.config_path = Some(PathBuf::from(value));
            }
            "--help" | "-h" => {
                println!("usage: ember [--config <path>] [prompt]");
                std::process::exit(0);
            }
            _ if parsed.prompt.is_none() => parsed.prompt = Some(arg),
            other => anyhow::bail!("unexpected argument '{other}'"),
        }
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = parse_args()?;
    let config = Config::load(args.config_path.as_deref())?;

    if config.provider.api_key.is_none() {
        eprintln!(
            "warning: {} is not set, provider calls will fail",
            config.provider.provider.env_var()
        );
    }

    let cwd = std::env::current_dir().context("resolving working directory")?;
    let sandbox = PathSandbox::new(&cwd)
        .map_err(|e| anyhow::anyhow!("initializing workspace sandbox: {e}"))?;
    let ctx = AgentContext::new(sandbox);

    let mut registry = ToolRegistry::new();
    register_builtins(&mut registry)
        .map_err(|e| anyhow::anyhow!("registering tools: {e}"))?;

    let (gate, mut approvals) = ApprovalGate::channel();
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let (interrupt_tx, interrupt_rx) = watch::channel(false);

    let mut agent = Agent::new(
        Arc::new(HttpProvider::new(config.provider.clone())),
        registry,
        ctx,
        ConversationCompactor::new(config.compactor),
        gate,
        config.options.clone(),
    );
    agent.set_event_sink(event_tx);
    agent.set_interrupt(interrupt_rx);
    if let Some(prompt) = config
        .system_prompt
        .as_deref()
        .and_then(|p| NonEmptyString::new(p).ok())
    {
        agent.set_system_prompt(prompt);
    }

    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            tracing::info!("interrupt requested");
            if interrupt_tx.send(true).is_err() {
                return;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    if let Some(prompt) = args.prompt {
        let Ok(input) = NonEmptyString::new(prompt) else {
            anyhow::bail!("prompt must not be empty");
        };
        run_turn(&mut agent, input, &mut approvals, &mut events, &mut lines).await;
        return Ok(());
    }

    println!(
        "ember - {} ({}). /quit to exit.",
        config.provider.provider.display_name(),
        config.provider.model
    );
    loop {
        print_prompt();
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == "/quit" || trimmed == "/exit" {
            break;
        }
        let Ok(input) = NonEmptyString::new(trimmed) else {
            continue;
        };
        run_turn(&mut agent, input, &mut approvals, &mut events, &mut lines).await;
    }
    Ok(())
}

/// Drive one turn while answering approval prompts and printing progress.
async fn run_turn(
    agent: &mut Agent,
    input: NonEmptyString,
    approvals: &mut mpsc::Receiver<PendingApproval>,
    events: &mut mpsc::UnboundedReceiver<AgentEvent>,
    lines: &mut Lines<BufReader<Stdin>>,
) {
    let mut turn = pin!(agent.run_turn(input));
    loop {
        tokio::select! {
            result = &mut turn => {
                match result {
                    Ok(answer) => println!("\n{answer}\n"),
                    Err(EngineError::Interrupted) => println!("\n[interrupted]\n"),
                    Err(err) => eprintln!("\nerror: {err}\n"),
                }
                break;
            }
            Some(pending) = approvals.recv() => {
                let decision = prompt_for_decision(&pending, lines).await;
                pending.respond(decision);
            }
            Some(event) = events.recv() => print_event(&event),
        }
    }
    // Drain progress events the turn emitted after its last await.
    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }
}

async fn prompt_for_decision(
    pending: &PendingApproval,
    lines: &mut Lines<BufReader<Stdin>>,
) -> ApprovalDecision {
    println!("\n{}", pending.request.preview);
    println!("approve? [y]es / [a]ll / [n]o / [m]odify");
    loop {
        print_prompt();
        let Ok(Some(line)) = lines.next_line().await else {
            return ApprovalDecision::Rejected;
        };
        match line.trim().to_lowercase().as_str() {
            "y" | "yes" => return ApprovalDecision::Approved,
            "a" | "all" => return ApprovalDecision::ApproveAll,
            "n" | "no" => return ApprovalDecision::Rejected,
            "m" | "modify" => {
                println!("instructions for the model:");
                print_prompt();
                let Ok(Some(text)) = lines.next_line().await else {
                    return ApprovalDecision::Rejected;
                };
                return ApprovalDecision::Modify(text);
            }
            _ => println!("please answer y, a, n, or m"),
        }
    }
}

fn print_event(event: &AgentEvent) {
    match event {
        AgentEvent::Compacted {
            tokens_before,
            tokens_after,
        } => println!("[context compacted: ~{tokens_before} -> ~{tokens_after} tokens]"),
        AgentEvent::ToolStarted { tool_name, .. } => println!("[running {tool_name}]"),
        AgentEvent::ToolFinished {
            tool_name, success, ..
        } => {
            if !success {
                println!("[{tool_name} failed]");
            }
        }
        AgentEvent::AssistantReply { .. } => {}
    }
}

fn print_prompt() {
    use std::io::Write;
    print!("> ");
    let _ = std::io::stdout().flush();
}
