//! Command-line front end for baton-rs.
//!
//! Reads the API key from the `OPENROUTER_KEY` environment variable for `run`.
//!
//! # Examples
//!
//! ```sh
//! # Check a command line against the sandbox policy in baton.toml
//! baton --config baton.toml check "ls -la | grep TODO"
//!
//! # One-shot session with the sandboxed shell
//! baton --config baton.toml run --prompt "Count the TODOs under src/"
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use baton_rs::prelude::*;
use baton_rs::provider::openrouter::DEFAULT_MODEL;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

/// Orchestration engine for tool-using LLM sessions.
#[derive(Parser)]
#[command(name = "baton", version)]
struct Cli {
    /// TOML settings file. Missing tables use defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level for baton's own targets. `RUST_LOG` overrides it.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a shell command line against the sandbox policy.
    Check {
        /// The command line, quoted as one argument.
        command: String,
    },
    /// Run one session against OpenRouter with the sandboxed shell.
    Run {
        /// The initial user message.
        #[arg(long)]
        prompt: String,

        /// Model to use. Overrides `[orchestrator].model`.
        #[arg(long)]
        model: Option<String>,

        /// Save the conversation to this JSON file when the session ends.
        #[arg(long)]
        save: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let settings = match &cli.config {
        Some(path) => match Settings::load(path) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("Error: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => Settings::default(),
    };

    match cli.command {
        Command::Check { command } => check(&settings, &command),
        Command::Run {
            prompt,
            model,
            save,
        } => run(settings, prompt, model, save).await,
    }
}

fn check(settings: &Settings, command: &str) -> ExitCode {
    let sandbox = Sandbox::new(settings.sandbox.clone());
    match sandbox.validate(command) {
        Ok(verdict) => {
            println!("allowed: {:?}", verdict.allowed);
            println!("disallowed: {:?}", verdict.disallowed);
            println!("explicitly disallowed: {:?}", verdict.explicitly_disallowed);
            for (entry, reason) in &verdict.reasons {
                println!("  {entry}: {reason}");
            }
        }
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    }
    match sandbox.check(command) {
        Ok(names) => {
            println!("OK ({names})");
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("REJECTED: {e}");
            ExitCode::FAILURE
        }
    }
}

fn default_system_prompt(policy: &SandboxPolicy) -> String {
    format!(
        "You are an operator working in a sandboxed shell. Use the `bash` tool to run \
         commands. Only these commands are available:\n{}\n\nWhen the task is done, reply \
         with a short answer and no tool calls.",
        policy.describe_allowed()
    )
}

async fn run(
    mut settings: Settings,
    prompt: String,
    model: Option<String>,
    save: Option<PathBuf>,
) -> ExitCode {
    let provider = match OpenRouterProvider::from_env() {
        Ok(p) => p.with_model(model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string())),
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(model) = model {
        settings.orchestrator.model = Some(model);
    }
    if settings.orchestrator.system_prompt.is_none() {
        settings.orchestrator.system_prompt = Some(default_system_prompt(&settings.sandbox));
    }

    let orchestrator = match settings.build_orchestrator(Arc::new(provider)) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling session");
            on_signal.cancel();
        }
    });

    let scope = ConversationScope::root("baton");
    let result = orchestrator
        .run(&scope, vec![Turn::human(prompt)], cancel)
        .await;

    if let Some(path) = save {
        match scope.save(&path, true) {
            Ok(true) => info!("Conversation saved to {}", path.display()),
            Ok(false) => {}
            Err(e) => warn!("Failed to save conversation: {e}"),
        }
    }

    match result {
        Ok(outcome) => {
            if let Some(answer) = scope
                .own_turns()
                .iter()
                .rev()
                .find(|t| t.kind == TurnKind::Ai && t.tool_calls().is_empty())
            {
                println!("{}", answer.text());
            }
            info!("Session ended: {outcome:?}");
            match outcome {
                RunOutcome::Cancelled => ExitCode::from(130),
                _ => ExitCode::SUCCESS,
            }
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
