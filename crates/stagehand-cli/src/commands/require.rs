use super::{json_pretty, print_warnings, with_spinner, Context, EXIT_SUCCESS};

pub fn run(ctx: &Context, stage_id: &str, packages: &[String], dev: &[String]) -> Result<u8, String> {
    let mut stage = ctx.claimed(stage_id)?;
    with_spinner(ctx, "requiring packages...", "packages required", || {
        stage.require(packages, dev)
    })?;

    if ctx.json {
        let payload = serde_json::json!({
            "stage_id": stage_id,
            "require": packages,
            "require_dev": dev,
            "warnings": stage.warnings(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        print_warnings(&stage);
    }
    Ok(EXIT_SUCCESS)
}
