use super::{describe, json_pretty, Context, EXIT_SUCCESS};
use stagehand_core::{select_trigger, UnattendedOutcome, UnattendedRunner};

pub fn run(ctx: &Context) -> Result<u8, String> {
    let config = ctx.config()?;
    let services = config.services().map_err(|e| describe(&e))?;
    let command_args = vec![
        "--config".to_owned(),
        ctx.config_path.display().to_string(),
    ];
    let trigger = select_trigger(&config, &services, command_args).map_err(|e| describe(&e))?;
    let runner = UnattendedRunner::from_config(&config, services, trigger);
    let outcome = runner.run().map_err(|e| describe(&e))?;

    if ctx.json {
        let payload = match &outcome {
            UnattendedOutcome::Updated { from, to } => serde_json::json!({
                "outcome": "updated",
                "from": from.to_string(),
                "to": to.to_string(),
            }),
            other => serde_json::json!({ "outcome": other.to_string() }),
        };
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("cron: {outcome}");
    }
    Ok(EXIT_SUCCESS)
}
