//! TaskPilot - agent task control core with a secured browser tool surface
//!
//! The binary exposes the security checks for inspection and can drive an
//! orchestrator through a scripted run.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use taskpilot::{
    agent::{AgentOrchestrator, PhaseDefinition, ToolCall, ToolOutcome, ToolResult},
    browser::{SecurityServices, SessionPersistence},
    config::TaskPilotConfig,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "taskpilot")]
#[command(version)]
#[command(about = "Agent task control core with a secured browser tool surface")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "TASKPILOT_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a URL through the network filter
    CheckUrl {
        url: String,
    },

    /// Check a domain against the content security policy
    CheckDomain {
        domain: String,
    },

    /// Print the Content-Security-Policy header for the configured policy
    Csp,

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },

    /// Inspect persisted browser sessions
    Sessions {
        #[command(subcommand)]
        action: SessionCommands,
    },

    /// Drive an orchestrator through a scripted run, printing events as JSON lines
    Simulate {
        /// Task prompt
        #[arg(short, long)]
        prompt: String,

        /// Phase titles, in order
        #[arg(long = "phase", required = true)]
        phases: Vec<String>,

        /// Failing tool results to inject before each phase succeeds
        #[arg(long, default_value = "0")]
        failures: u32,

        /// URL the simulated browser tool navigates to
        #[arg(long, default_value = "https://example.com")]
        url: String,

        /// Actually wait out retry backoff delays
        #[arg(long)]
        honor_backoff: bool,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// List active sessions for a user
    List {
        #[arg(short, long)]
        user: String,
    },

    /// Delete expired sessions
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so event output stays machine-readable
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("taskpilot={}", log_level).into());
    tracing_subscriber::registry()
        .with(filter)
        .with(
            cli.json_logs
                .then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)),
        )
        .with(
            (!cli.json_logs)
                .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)),
        )
        .init();

    let config = TaskPilotConfig::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::CheckUrl { url } => {
            let services = SecurityServices::from_config(&config)?;
            let result = services.network.validate_url(&url);
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::CheckDomain { domain } => {
            let services = SecurityServices::from_config(&config)?;
            let allowed = services.content_security.is_domain_allowed(&domain);
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "domain": domain,
                    "allowed": allowed,
                }))?
            );
        }
        Commands::Csp => {
            let services = SecurityServices::from_config(&config)?;
            println!("{}", services.content_security.to_header_string());
        }
        Commands::Config { default } => {
            show_config(if default { None } else { Some(&config) })?;
        }
        Commands::Sessions { action } => {
            run_sessions(&config, action).await?;
        }
        Commands::Simulate {
            prompt,
            phases,
            failures,
            url,
            honor_backoff,
        } => {
            run_simulation(config, prompt, phases, failures, url, honor_backoff).await?;
        }
    }

    Ok(())
}

fn show_config(config: Option<&TaskPilotConfig>) -> Result<()> {
    let config = config.cloned().unwrap_or_default();
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}

async fn run_sessions(config: &TaskPilotConfig, action: SessionCommands) -> Result<()> {
    let persistence = SessionPersistence::from_config(&config.persistence)
        .await
        .context("Failed to open session store")?;

    match action {
        SessionCommands::List { user } => {
            for session in persistence.list_sessions(&user).await {
                println!(
                    "{}",
                    serde_json::to_string(&serde_json::json!({
                        "sessionId": session.snapshot.session_id,
                        "taskId": session.snapshot.task_id,
                        "currentUrl": session.snapshot.current_url,
                        "updatedAt": session.updated_at,
                        "expiresAt": session.expires_at,
                    }))?
                );
            }
        }
        SessionCommands::Cleanup => {
            let removed = persistence.cleanup_expired().await;
            println!("Removed {} expired session(s)", removed);
        }
    }
    Ok(())
}

async fn run_simulation(
    config: TaskPilotConfig,
    prompt: String,
    phases: Vec<String>,
    failures: u32,
    url: String,
    honor_backoff: bool,
) -> Result<()> {
    let security = SecurityServices::from_config(&config)?;
    let sweeper = config.sweeper.enabled.then(|| {
        security
            .limiter
            .spawn_stale_sweeper(config.sweeper.interval(), config.sweeper.max_idle())
    });

    let mut orchestrator =
        AgentOrchestrator::with_generated_id(config.retry.clone(), security.clone());
    orchestrator.events().subscribe_all(|event| {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!("Failed to serialize event: {}", e),
        }
    });

    let session_id = format!("{}-browser", orchestrator.task_id());
    let limiter = Arc::clone(&security.limiter);
    if !limiter.init_session(&session_id) {
        anyhow::bail!("Browser session limit reached");
    }

    let definitions: Vec<PhaseDefinition> = phases
        .iter()
        .enumerate()
        .map(|(i, title)| PhaseDefinition::new(i as u32 + 1, title.clone()))
        .collect();

    orchestrator.start_task(prompt.clone())?;
    orchestrator.create_plan(prompt, definitions)?;

    for phase_id in 1..=phases.len() as u32 {
        if phase_id > 1 {
            orchestrator.advance_phase(phase_id)?;
        }

        let mut remaining_failures = failures;
        loop {
            let call = ToolCall::new("browser.navigate", serde_json::json!({ "url": url }));
            let call_id = call.id.clone();
            orchestrator.record_tool_call(call)?;

            let outcome = match security.check_navigation(&session_id, &url) {
                Err(denial) => orchestrator.record_security_denial(call_id, denial)?,
                Ok(()) => {
                    let result = match limiter.try_begin_action(&session_id) {
                        Err(check) => ToolResult::failure(
                            call_id,
                            check.reason.unwrap_or_else(|| "Action refused".to_string()),
                            0,
                        ),
                        Ok(_action) if remaining_failures > 0 => {
                            remaining_failures -= 1;
                            ToolResult::failure(call_id, "Simulated navigation timeout", 25)
                        }
                        Ok(_action) => ToolResult::success(call_id, format!("Loaded {}", url), 40),
                    };
                    orchestrator.record_tool_result(result)?
                }
            };

            match outcome {
                ToolOutcome::Continue => break,
                ToolOutcome::RetryAfter { delay, .. } => {
                    if honor_backoff {
                        tokio::time::sleep(delay).await;
                    }
                }
                ToolOutcome::AwaitingUser => {
                    let refused = security.check_navigation(&session_id, &url).is_err();
                    if remaining_failures == 0 && refused {
                        // Waiting cannot fail directly; resume, then fail from Executing
                        orchestrator.receive_user_input("Stop, the target is not reachable")?;
                        orchestrator.fail_task("Navigation target refused by security policy")?;
                        limiter.cleanup_session(&session_id);
                        if let Some(handle) = sweeper {
                            handle.abort();
                        }
                        return Ok(());
                    }
                    orchestrator.receive_user_input("Keep trying")?;
                }
            }
        }
    }

    orchestrator.complete_task(format!("Finished {} phase(s)", phases.len()))?;
    limiter.cleanup_session(&session_id);
    if let Some(handle) = sweeper {
        handle.abort();
    }
    Ok(())
}
