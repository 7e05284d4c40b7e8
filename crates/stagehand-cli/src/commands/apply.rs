use super::{json_pretty, print_warnings, with_spinner, Context, EXIT_SUCCESS};

pub fn run(ctx: &Context, stage_id: &str) -> Result<u8, String> {
    let mut stage = ctx.claimed(stage_id)?;
    with_spinner(ctx, "applying stage...", "stage applied", || stage.apply())?;

    if ctx.json {
        let payload = serde_json::json!({
            "stage_id": stage_id,
            "status": "applied",
            "warnings": stage.warnings(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        print_warnings(&stage);
        println!("next: stagehand post-apply --stage-id {stage_id}");
    }
    Ok(EXIT_SUCCESS)
}
