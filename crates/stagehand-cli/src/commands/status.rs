use super::{colorize_phase, describe, json_pretty, Context, EXIT_SUCCESS};
use stagehand_store::{FailureMarker, RunLedger};

pub fn run(ctx: &Context) -> Result<u8, String> {
    let config = ctx.config()?;
    let services = ctx.services(&config)?;
    let marker = FailureMarker::new(&services.locator).read();
    let ledger = RunLedger::new(&config.layout())
        .load()
        .map_err(|e| e.to_string())?;
    let mut stage = ctx.stage(services);
    let claim = stage.current_claim().map_err(|e| describe(&e))?;
    let results = stage.check_status().map_err(|e| describe(&e))?;

    if ctx.json {
        let (marker, marker_error) = match &marker {
            Ok(contents) => (contents.as_ref(), None),
            Err(e) => (None, Some(e.to_string())),
        };
        let payload = serde_json::json!({
            "active_dir": config.active_dir,
            "claim": claim,
            "failure_marker": marker,
            "failure_marker_error": marker_error,
            "results": results,
            "last_unattended_run": ledger,
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("active: {}", config.active_dir.display());
    match &claim {
        Some(record) => {
            println!(
                "stage:  {} ({}) owned by {} since {}",
                record.stage_id,
                colorize_phase(record.phase),
                record.owner,
                record.claimed_at.to_rfc3339()
            );
        }
        None => println!("stage:  none"),
    }
    match &marker {
        Ok(None) => {}
        Ok(Some(contents)) => println!(
            "{} {}",
            console::style("failure marker:").red().bold(),
            contents.message
        ),
        Err(e) => println!("{} {e}", console::style("failure marker:").red().bold()),
    }
    if let Some(last) = ledger.last_run {
        println!(
            "cron:   last run {} ({})",
            last.to_rfc3339(),
            ledger.last_outcome.as_deref().unwrap_or("unknown")
        );
    }
    if results.is_empty() {
        println!("checks: ok");
    }
    for result in &results {
        let label = if result.is_error() {
            console::style("error").red().to_string()
        } else {
            console::style("warning").yellow().to_string()
        };
        if let Some(summary) = result.summary() {
            println!("{label}: {summary}");
        }
        for message in result.messages() {
            println!("{label}: {message}");
        }
    }
    Ok(EXIT_SUCCESS)
}
