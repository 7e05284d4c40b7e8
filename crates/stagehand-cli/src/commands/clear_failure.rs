use super::{json_pretty, Context, EXIT_SUCCESS};
use dialoguer::Confirm;
use stagehand_store::FailureMarker;
use std::io::IsTerminal;

pub fn run(ctx: &Context, yes: bool) -> Result<u8, String> {
    let config = ctx.config()?;
    let marker = FailureMarker::new(&config.locator().map_err(|e| e.to_string())?);
    if !marker.exists() {
        if ctx.json {
            println!("{}", json_pretty(&serde_json::json!({ "cleared": false }))?);
        } else {
            println!("no failure marker present");
        }
        return Ok(EXIT_SUCCESS);
    }

    // A corrupt marker still gets cleared; the operator has seen the site.
    match marker.read() {
        Ok(Some(contents)) if !ctx.json => {
            println!("failure marker: {}", contents.message);
            if let Some(id) = &contents.stage_id {
                println!("stage: {id}");
            }
            if let Some(backtrace) = &contents.backtrace {
                println!("cause: {backtrace}");
            }
        }
        Err(e) if !ctx.json => println!("{e}"),
        _ => {}
    }

    if !yes {
        if !std::io::stdin().is_terminal() {
            return Err("refusing to clear the failure marker without --yes".to_owned());
        }
        let confirmed = Confirm::new()
            .with_prompt("has the site been restored from a backup?")
            .default(false)
            .interact()
            .map_err(|e| format!("prompt failed: {e}"))?;
        if !confirmed {
            return Err("failure marker left in place".to_owned());
        }
    }

    marker.clear().map_err(|e| e.to_string())?;
    tracing::warn!("failure marker cleared by {}", ctx.actor);
    if ctx.json {
        println!("{}", json_pretty(&serde_json::json!({ "cleared": true }))?);
    } else {
        println!("failure marker cleared");
    }
    Ok(EXIT_SUCCESS)
}
