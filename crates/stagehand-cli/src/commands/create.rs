use super::{json_pretty, print_warnings, with_spinner, Context, EXIT_SUCCESS};

pub fn run(ctx: &Context) -> Result<u8, String> {
    let config = ctx.config()?;
    let mut stage = ctx.stage(ctx.services(&config)?);
    let stage_id = with_spinner(ctx, "creating stage...", "stage created", || stage.create())?;

    if ctx.json {
        let payload = serde_json::json!({
            "stage_id": stage_id,
            "stage_dir": stage.stage_directory().map_err(|e| e.to_string())?,
            "owner": ctx.actor,
            "warnings": stage.warnings(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        print_warnings(&stage);
        println!("stage_id: {stage_id}");
    }
    Ok(EXIT_SUCCESS)
}
