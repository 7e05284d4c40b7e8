use crate::StageError;
use stagehand_store::StagePhase;

/// The single table of legal phase changes for a claimed stage.
///
/// Creation (no record to `Created`) and destruction (any record to none)
/// are not phase changes and are checked by the stage itself.
pub fn validate_transition(from: StagePhase, to: StagePhase) -> Result<(), StageError> {
    let valid = matches!(
        (from, to),
        (StagePhase::Created | StagePhase::Required, StagePhase::Required)
            | (StagePhase::Required, StagePhase::Applying)
            | (StagePhase::Applying, StagePhase::Applied)
    );

    if valid {
        Ok(())
    } else {
        Err(StageError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
