use super::{Context, EXIT_FAILURE, EXIT_SUCCESS};
use stagehand_core::StageConfig;
use stagehand_store::FailureMarker;

pub fn run(ctx: &Context) -> Result<u8, String> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    match ctx.config() {
        Ok(config) => {
            checks.push(Check::pass(
                "config",
                &format!("Configuration loaded from {}", ctx.config_path.display()),
            ));
            check_prereqs(&config, &mut checks, &mut all_pass);
            check_state(ctx, &config, &mut checks, &mut all_pass);
        }
        Err(e) => {
            all_pass = false;
            checks.push(Check::fail("config", &e));
        }
    }

    print_results(&checks, all_pass, ctx.json)
}

fn check_prereqs(config: &StageConfig, checks: &mut Vec<Check>, all_pass: &mut bool) {
    if config.package_manager.kind != "command" {
        checks.push(Check::info(
            "package_manager",
            &format!("Package manager backend is '{}'", config.package_manager.kind),
        ));
        return;
    }
    let missing = stagehand_toolkit::check_stager_prereqs(
        &config.package_manager.binary,
        &config.staging_root(),
    );
    if missing.is_empty() {
        checks.push(Check::pass(
            "package_manager",
            &format!("Package manager '{}' found", config.package_manager.binary),
        ));
    } else {
        *all_pass = false;
        checks.push(Check::fail(
            "package_manager",
            &format!(
                "Missing prerequisites: {}",
                stagehand_toolkit::format_missing(&missing)
            ),
        ));
    }
}

fn check_state(ctx: &Context, config: &StageConfig, checks: &mut Vec<Check>, all_pass: &mut bool) {
    let layout = config.layout();
    if layout.root().exists() {
        match layout.verify_version() {
            Ok(()) => checks.push(Check::pass("state_version", "State format version valid")),
            Err(e) => {
                *all_pass = false;
                checks.push(Check::fail(
                    "state_version",
                    &format!("State version check failed: {e}"),
                ));
            }
        }
    } else {
        checks.push(Check::info(
            "state_version",
            "State directory not initialized (will be created on first use)",
        ));
    }

    let Ok(locator) = config.locator() else {
        *all_pass = false;
        checks.push(Check::fail("active_dir", "Active directory path is invalid"));
        return;
    };
    match FailureMarker::new(&locator).read() {
        Ok(None) => checks.push(Check::pass("failure_marker", "No failed apply recorded")),
        Ok(Some(contents)) => {
            *all_pass = false;
            checks.push(Check::fail("failure_marker", &contents.message));
        }
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail("failure_marker", &e.to_string()));
        }
    }

    let services = match ctx.services(config) {
        Ok(services) => services,
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail("status_check", &e));
            return;
        }
    };
    match ctx.stage(services).check_status() {
        Ok(results) if results.is_empty() => {
            checks.push(Check::pass("status_check", "All validators passed"));
        }
        Ok(results) => {
            for result in results {
                let message = result.messages().join("; ");
                if result.is_error() {
                    *all_pass = false;
                    checks.push(Check::fail("status_check", &message));
                } else {
                    checks.push(Check::warn("status_check", &message));
                }
            }
        }
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail("status_check", &e.to_string()));
        }
    }
}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> Result<u8, String> {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&json).map_err(|e| e.to_string())?
        );
    } else {
        println!("Stagehand Doctor\n");
        for check in checks {
            let icon = match check.status {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

struct Check {
    name: &'static str,
    status: &'static str,
    message: String,
}

impl Check {
    fn new(name: &'static str, status: &'static str, message: &str) -> Self {
        Self {
            name,
            status,
            message: message.to_owned(),
        }
    }

    fn pass(name: &'static str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &'static str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn warn(name: &'static str, message: &str) -> Self {
        Self::new(name, "warn", message)
    }

    fn info(name: &'static str, message: &str) -> Self {
        Self::new(name, "info", message)
    }
}
