//! Scheduled, unattended updates of a single tracked package.
//!
//! The runner decides whether a run should happen at all, picks one patch
//! release to move to, drives a [`Stage`] through create, require and apply,
//! then hands post-apply to a [`ContinuationTrigger`] so deferred tasks run
//! against the new code.

use crate::config::{StageConfig, TriggerKind};
use crate::stage::{Stage, StageServices};
use crate::trigger::{
    CommandTrigger, Continuation, ContinuationTrigger, HttpTrigger, InProcessTrigger,
};
use crate::StageError;
use semver::Version;
use serde::{Deserialize, Serialize};
use stagehand_store::{RunLedger, StagePhase};
use stagehand_toolkit::PackageInspector;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const UNATTENDED_STAGE_TYPE: &str = "unattended";
pub const UNATTENDED_ACTOR: &str = "cron";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnattendedMode {
    #[default]
    Disabled,
    #[serde(rename = "security")]
    SecurityOnly,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub version: Version,
    pub security: bool,
}

/// Where the installed version and the available releases come from.
pub trait ReleaseSource: Send + Sync {
    fn installed_version(&self) -> Result<Option<Version>, StageError>;

    fn releases(&self) -> Result<Vec<Release>, StageError>;
}

#[derive(Deserialize)]
struct FeedFile {
    releases: Vec<FeedEntry>,
}

#[derive(Deserialize)]
struct FeedEntry {
    version: String,
    #[serde(default)]
    security: bool,
}

fn parse_version(raw: &str) -> Result<Version, StageError> {
    Version::parse(raw.trim_start_matches('v'))
        .map_err(|e| StageError::Release(format!("invalid version '{raw}': {e}")))
}

/// Releases from a JSON file, installed version from the active directory.
pub struct JsonReleaseFeed {
    path: PathBuf,
    project: String,
    active_dir: PathBuf,
    inspector: Arc<dyn PackageInspector>,
}

impl JsonReleaseFeed {
    pub fn new(
        path: impl Into<PathBuf>,
        project: impl Into<String>,
        active_dir: impl Into<PathBuf>,
        inspector: Arc<dyn PackageInspector>,
    ) -> Self {
        Self {
            path: path.into(),
            project: project.into(),
            active_dir: active_dir.into(),
            inspector,
        }
    }
}

impl ReleaseSource for JsonReleaseFeed {
    fn installed_version(&self) -> Result<Option<Version>, StageError> {
        self.inspector
            .installed_package(&self.active_dir, &self.project)?
            .map(|p| parse_version(&p.version))
            .transpose()
    }

    fn releases(&self) -> Result<Vec<Release>, StageError> {
        let content = fs::read_to_string(&self.path).map_err(|e| {
            StageError::Release(format!("cannot read {}: {e}", self.path.display()))
        })?;
        let feed: FeedFile = serde_json::from_str(&content)?;
        feed.releases
            .into_iter()
            .map(|entry| {
                Ok(Release {
                    version: parse_version(&entry.version)?,
                    security: entry.security,
                })
            })
            .collect()
    }
}

fn same_minor(a: &Version, b: &Version) -> bool {
    a.major == b.major && a.minor == b.minor
}

/// True when a security release newer than `installed` exists in its minor.
fn is_insecure(installed: &Version, releases: &[Release]) -> bool {
    releases
        .iter()
        .filter(|r| r.version.pre.is_empty())
        .any(|r| r.security && r.version > *installed && same_minor(&r.version, installed))
}

/// The next release to move to: the lowest stable release above `installed`
/// in the same minor, security releases only in [`UnattendedMode::SecurityOnly`].
pub fn select_target(
    installed: &Version,
    releases: &[Release],
    mode: UnattendedMode,
) -> Option<Release> {
    if mode == UnattendedMode::Disabled {
        return None;
    }
    releases
        .iter()
        .filter(|r| r.version > *installed && same_minor(&r.version, installed))
        .filter(|r| r.version.pre.is_empty())
        .filter(|r| mode == UnattendedMode::All || r.security)
        .min_by(|a, b| a.version.cmp(&b.version))
        .cloned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnattendedOutcome {
    Disabled,
    NotDue,
    NoTarget,
    /// Another stage holds the slot; this run was skipped.
    StageInUse,
    Updated { from: Version, to: Version },
}

impl fmt::Display for UnattendedOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnattendedOutcome::Disabled => f.write_str("disabled"),
            UnattendedOutcome::NotDue => f.write_str("not due"),
            UnattendedOutcome::NoTarget => f.write_str("no update available"),
            UnattendedOutcome::StageInUse => f.write_str("stage in use"),
            UnattendedOutcome::Updated { from, to } => write!(f, "updated {from} -> {to}"),
        }
    }
}

/// Claim an applied unattended stage by key, run post-apply, then destroy
/// it. The stage is kept if the failure marker appeared meanwhile.
pub fn handle_post_apply(
    services: &StageServices,
    continuation: &Continuation,
) -> Result<(), StageError> {
    let mut stage = Stage::new(services.clone(), UNATTENDED_ACTOR, UNATTENDED_STAGE_TYPE);
    stage.claim_with_key(&continuation.stage_id, &continuation.key)?;
    let result = stage.post_apply();
    if services.marker.exists() {
        return result;
    }
    let destroyed = stage.destroy(false);
    result?;
    destroyed
}

/// Build the trigger configured for unattended runs. `command_args` are the
/// global arguments the re-invoked binary needs, e.g. `--config <path>`.
pub fn select_trigger(
    config: &StageConfig,
    services: &StageServices,
    command_args: Vec<String>,
) -> Result<Arc<dyn ContinuationTrigger>, StageError> {
    Ok(match config.unattended.trigger {
        TriggerKind::InProcess => {
            let services = services.clone();
            Arc::new(InProcessTrigger::new(move |c| handle_post_apply(&services, c)))
        }
        TriggerKind::Command => Arc::new(CommandTrigger::current_exe(command_args)?),
        TriggerKind::Http => Arc::new(HttpTrigger::new(config.unattended.trigger_url.clone())),
    })
}

pub struct UnattendedRunner {
    services: StageServices,
    mode: UnattendedMode,
    project: String,
    interval: chrono::Duration,
    source: Arc<dyn ReleaseSource>,
    trigger: Arc<dyn ContinuationTrigger>,
    ledger: RunLedger,
}

impl UnattendedRunner {
    pub fn new(
        services: StageServices,
        mode: UnattendedMode,
        project: impl Into<String>,
        source: Arc<dyn ReleaseSource>,
        trigger: Arc<dyn ContinuationTrigger>,
        ledger: RunLedger,
    ) -> Self {
        Self {
            services,
            mode,
            project: project.into(),
            interval: chrono::Duration::hours(3),
            source,
            trigger,
            ledger,
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: chrono::Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn from_config(
        config: &StageConfig,
        services: StageServices,
        trigger: Arc<dyn ContinuationTrigger>,
    ) -> Self {
        let source = JsonReleaseFeed::new(
            config.releases_path(),
            config.unattended.project.clone(),
            config.active_dir.clone(),
            config.inspector(),
        );
        Self::new(
            services,
            config.unattended.mode,
            config.unattended.project.clone(),
            Arc::new(source),
            trigger,
            RunLedger::new(&config.layout()),
        )
        .with_interval(config.unattended_interval())
    }

    /// One scheduled invocation. Every run that gets past the throttle is
    /// recorded in the run ledger, failed ones included.
    pub fn run(&self) -> Result<UnattendedOutcome, StageError> {
        if self.mode == UnattendedMode::Disabled {
            debug!("unattended updates are disabled");
            return Ok(UnattendedOutcome::Disabled);
        }
        let now = self.services.clock.now();
        if let Some(last) = self.ledger.load()?.last_run {
            if now - last < self.interval {
                debug!("unattended run not due; last run at {last}");
                return Ok(UnattendedOutcome::NotDue);
            }
        }

        let outcome = self.attempt();
        let label = match &outcome {
            Ok(outcome) => outcome.to_string(),
            Err(e) => format!("failed: {e}"),
        };
        self.ledger.record(now, &label)?;
        outcome
    }

    fn attempt(&self) -> Result<UnattendedOutcome, StageError> {
        self.services.marker.assert_not_exists()?;
        let installed = self.source.installed_version()?.ok_or_else(|| {
            StageError::Release(format!("{} is not installed", self.project))
        })?;
        let releases = self.source.releases()?;

        let mut stage = Stage::new(
            self.services.clone(),
            UNATTENDED_ACTOR,
            UNATTENDED_STAGE_TYPE,
        );
        if let Some(existing) = stage.current_claim()? {
            if is_insecure(&installed, &releases) && existing.phase != StagePhase::Applying {
                warn!(
                    "{} {installed} is insecure; destroying stage {} held by {}",
                    self.project, existing.stage_id, existing.owner
                );
                stage.destroy(true)?;
            } else {
                info!(
                    "stage {} is in use by {}; skipping this run",
                    existing.stage_id, existing.owner
                );
                return Ok(UnattendedOutcome::StageInUse);
            }
        }

        let Some(target) = select_target(&installed, &releases, self.mode) else {
            info!("no unattended update available for {} {installed}", self.project);
            return Ok(UnattendedOutcome::NoTarget);
        };
        info!("updating {} {installed} -> {}", self.project, target.version);

        match self.update(&mut stage, &target.version) {
            Ok(()) => Ok(UnattendedOutcome::Updated {
                from: installed,
                to: target.version,
            }),
            Err(e) => {
                self.clean_up(&mut stage, &e)?;
                Err(e)
            }
        }
    }

    fn update(&self, stage: &mut Stage, target: &Version) -> Result<(), StageError> {
        stage.create()?;
        stage.require(&[format!("{}:{target}", self.project)], &[])?;
        stage.apply()?;
        let stage_id = stage
            .stage_id()
            .cloned()
            .ok_or_else(|| StageError::InvalidState("applied stage lost its id".to_owned()))?;
        let key = stage.continuation_key()?.ok_or_else(|| {
            StageError::InvalidState("applied stage has no continuation key".to_owned())
        })?;
        debug!("triggering continuation via {}", self.trigger.name());
        self.trigger.trigger(&Continuation { stage_id, key })?;
        Ok(())
    }

    /// Destroy after a failed run. Nothing to do when create never claimed,
    /// and the stage is kept once a commit has started.
    fn clean_up(&self, stage: &mut Stage, cause: &StageError) -> Result<(), StageError> {
        if stage.stage_id().is_none() {
            return Ok(());
        }
        if self.services.marker.exists() {
            warn!("apply failed part way; keeping the stage for inspection");
            return Ok(());
        }
        if let Err(e) = stage.destroy(false) {
            warn!("unattended run failed ({cause}) and its stage could not be destroyed");
            return Err(e);
        }
        Ok(())
    }
}
