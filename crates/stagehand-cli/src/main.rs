mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{Context, EXIT_APPLY_FAILED, EXIT_FAILURE, EXIT_VALIDATION};
use stagehand_core::install_signal_handler;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "stagehand",
    version,
    about = "Staged, validated, crash-aware dependency updates for a live site"
)]
struct Cli {
    /// Path to the stagehand configuration file.
    #[arg(long, default_value = "stagehand.toml", global = true)]
    config: PathBuf,

    /// Name the stage is claimed under. Defaults to $USER.
    #[arg(long, global = true)]
    actor: Option<String>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show the current claim, the failure marker and status-check results.
    Status,
    /// Copy the active site into a new stage.
    Create,
    /// Require packages in a stage.
    Require {
        #[arg(long)]
        stage_id: String,
        /// Runtime packages as name:constraint.
        packages: Vec<String>,
        /// Development packages as name:constraint.
        #[arg(long, num_args = 1..)]
        dev: Vec<String>,
    },
    /// Commit a stage into the active site.
    Apply {
        #[arg(long)]
        stage_id: String,
    },
    /// Run deferred tasks for an applied stage.
    PostApply {
        #[arg(long)]
        stage_id: String,
        /// Continuation key issued by an unattended apply.
        #[arg(long)]
        key: Option<String>,
    },
    /// Destroy the current stage.
    Destroy {
        /// Only destroy if this is the current stage.
        #[arg(long)]
        stage_id: Option<String>,
        /// Destroy even if another actor owns the stage or it is mid-apply.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Run one scheduled unattended update.
    Cron,
    /// Remove the failure marker after the site has been restored.
    ClearFailure {
        /// Do not ask for confirmation.
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Run diagnostic checks on the configuration, prerequisites and site.
    Doctor,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn default_actor() -> String {
    std::env::var("USER")
        .ok()
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| "cli".to_owned())
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("STAGEHAND_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    install_signal_handler();

    let ctx = Context {
        config_path: cli.config,
        actor: cli.actor.unwrap_or_else(default_actor),
        json: cli.json,
    };

    let result = match cli.command {
        Commands::Status => commands::status::run(&ctx),
        Commands::Create => commands::create::run(&ctx),
        Commands::Require {
            stage_id,
            packages,
            dev,
        } => commands::require::run(&ctx, &stage_id, &packages, &dev),
        Commands::Apply { stage_id } => commands::apply::run(&ctx, &stage_id),
        Commands::PostApply { stage_id, key } => {
            commands::post_apply::run(&ctx, &stage_id, key.as_deref())
        }
        Commands::Destroy { stage_id, force } => {
            commands::destroy::run(&ctx, stage_id.as_deref(), force)
        }
        Commands::Cron => commands::cron::run(&ctx),
        Commands::ClearFailure { yes } => commands::clear_failure::run(&ctx, yes),
        Commands::Doctor => commands::doctor::run(&ctx),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("validation refused:") {
                EXIT_VALIDATION
            } else if msg.starts_with("apply failed:") {
                EXIT_APPLY_FAILED
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
