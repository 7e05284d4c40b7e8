pub mod apply;
pub mod clear_failure;
pub mod completions;
pub mod create;
pub mod cron;
pub mod destroy;
pub mod doctor;
pub mod post_apply;
pub mod require;
pub mod status;

use indicatif::{ProgressBar, ProgressStyle};
use stagehand_core::{shutdown_cancel, Stage, StageConfig, StageError, StageServices};
use stagehand_store::{StageId, StagePhase};
use stagehand_toolkit::FsBeginner;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_VALIDATION: u8 = 2;
pub const EXIT_APPLY_FAILED: u8 = 3;

/// Stage type for stages driven from the command line.
pub const ATTENDED_STAGE_TYPE: &str = "attended";

/// Global options shared by every command.
pub struct Context {
    pub config_path: PathBuf,
    pub actor: String,
    pub json: bool,
}

impl Context {
    pub fn config(&self) -> Result<StageConfig, String> {
        StageConfig::load(&self.config_path).map_err(|e| describe(&e))
    }

    pub fn services(&self, config: &StageConfig) -> Result<StageServices, String> {
        let services = config.services().map_err(|e| describe(&e))?;
        Ok(services.with_beginner(Arc::new(FsBeginner::new().with_cancel(shutdown_cancel()))))
    }

    pub fn stage(&self, services: StageServices) -> Stage {
        Stage::new(services, self.actor.clone(), ATTENDED_STAGE_TYPE)
    }

    /// Load the configuration and claim `stage_id` for this actor.
    pub fn claimed(&self, stage_id: &str) -> Result<Stage, String> {
        let config = self.config()?;
        let mut stage = self.stage(self.services(&config)?);
        stage
            .claim(&StageId::new(stage_id))
            .map_err(|e| describe(&e))?;
        Ok(stage)
    }
}

/// Render a stage error with the prefix `main` maps to an exit code.
pub fn describe(e: &StageError) -> String {
    if let Some(failure) = e.validation() {
        return format!("validation refused: {failure}");
    }
    if e.is_apply_failure() {
        return format!(
            "apply failed: {e}\nrestore the site from a backup, then run `stagehand clear-failure`"
        );
    }
    e.to_string()
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

/// Run `op` behind a spinner unless JSON output was requested.
pub fn with_spinner<T>(
    ctx: &Context,
    msg: &str,
    done: &str,
    op: impl FnOnce() -> Result<T, StageError>,
) -> Result<T, String> {
    if ctx.json {
        return op().map_err(|e| describe(&e));
    }
    let pb = spinner(msg);
    match op() {
        Ok(value) => {
            spin_ok(&pb, done);
            Ok(value)
        }
        Err(e) => {
            spin_fail(&pb, msg.trim_end_matches("..."));
            Err(describe(&e))
        }
    }
}

pub fn colorize_phase(phase: StagePhase) -> String {
    use console::Style;
    let text = phase.to_string();
    match phase {
        StagePhase::Created => Style::new().yellow().apply_to(text).to_string(),
        StagePhase::Required => Style::new().cyan().apply_to(text).to_string(),
        StagePhase::Applying => Style::new().red().bold().apply_to(text).to_string(),
        StagePhase::Applied => Style::new().green().apply_to(text).to_string(),
    }
}

/// Print warnings collected while the command ran.
pub fn print_warnings(stage: &Stage) {
    for warning in stage.warnings() {
        if let Some(summary) = warning.summary() {
            eprintln!("warning: {summary}");
        }
        for message in warning.messages() {
            eprintln!("warning: {message}");
        }
    }
}
