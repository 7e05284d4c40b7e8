use super::{describe, json_pretty, Context, EXIT_SUCCESS};

pub fn run(ctx: &Context, stage_id: Option<&str>, force: bool) -> Result<u8, String> {
    let config = ctx.config()?;
    let mut stage = ctx.stage(ctx.services(&config)?);
    let current = stage.current_claim().map_err(|e| describe(&e))?;

    let target = match (&current, stage_id) {
        (None, _) => None,
        (Some(record), Some(wanted)) if record.stage_id.as_str() != wanted => None,
        (Some(record), _) => Some(record.stage_id.clone()),
    };
    if let Some(id) = &target {
        stage.destroy(force).map_err(|e| describe(&e))?;
        tracing::info!("destroyed stage {id}");
    }

    if ctx.json {
        let payload = serde_json::json!({
            "destroyed": target,
            "force": force,
        });
        println!("{}", json_pretty(&payload)?);
    } else if let Some(id) = target {
        println!("destroyed {id}");
    } else {
        println!("no stage to destroy");
    }
    Ok(EXIT_SUCCESS)
}
