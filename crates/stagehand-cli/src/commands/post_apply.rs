use super::{describe, json_pretty, with_spinner, Context, EXIT_SUCCESS};
use stagehand_core::{handle_post_apply, Continuation};
use stagehand_store::StageId;

/// With a key this is the continuation of an unattended run: the stage is
/// claimed by key and destroyed afterwards. Without one it is the attended
/// follow-up to `apply` and the stage is left for the owner to destroy.
pub fn run(ctx: &Context, stage_id: &str, key: Option<&str>) -> Result<u8, String> {
    if let Some(key) = key {
        let config = ctx.config()?;
        let services = config.services().map_err(|e| describe(&e))?;
        let continuation = Continuation {
            stage_id: StageId::new(stage_id),
            key: key.to_owned(),
        };
        with_spinner(ctx, "running post-apply tasks...", "post-apply finished", || {
            handle_post_apply(&services, &continuation)
        })?;
    } else {
        let mut stage = ctx.claimed(stage_id)?;
        with_spinner(ctx, "running post-apply tasks...", "post-apply finished", || {
            stage.post_apply()
        })?;
    }

    if ctx.json {
        let payload = serde_json::json!({
            "stage_id": stage_id,
            "status": "post_apply_done",
        });
        println!("{}", json_pretty(&payload)?);
    }
    Ok(EXIT_SUCCESS)
}
