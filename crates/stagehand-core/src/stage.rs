use crate::clock::{Clock, SystemClock};
use crate::dispatch::EventDispatcher;
use crate::event::{EventKind, EventType, StageContext, StageEvent, ValidationResult};
use crate::lifecycle::validate_transition;
use crate::{StageError, SubscriberError, ValidationFailure};
use chrono::{DateTime, Utc};
use stagehand_store::{
    FailureMarker, OwnerToken, OwnershipRecord, OwnershipStore, PathLocator, StageId, StagePhase,
};
use stagehand_toolkit::{
    Beginner, Committer, ExcludedPaths, FsBeginner, FsCommitter, Stager, ToolkitError,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const APPLY_FAILURE_MESSAGE: &str = "Staged changes failed to apply, and the site is in an \
    indeterminate state. Restore the code and database from a backup before continuing.";

/// Work that may only run once the new code is live, e.g. database updates.
pub trait DeferredTask: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, context: &StageContext) -> Result<(), SubscriberError>;
}

#[derive(Debug, Clone)]
pub struct StageSettings {
    /// How long an apply may appear in progress before a plain destroy
    /// treats it as abandoned.
    pub staleness: chrono::Duration,
    pub claim_ttl: Option<chrono::Duration>,
    pub create_timeout: Option<Duration>,
    pub require_timeout: Option<Duration>,
    pub apply_timeout: Option<Duration>,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            staleness: chrono::Duration::hours(1),
            claim_ttl: Some(chrono::Duration::days(7)),
            create_timeout: Some(Duration::from_secs(300)),
            require_timeout: Some(Duration::from_secs(300)),
            apply_timeout: Some(Duration::from_secs(600)),
        }
    }
}

/// Everything a [`Stage`] depends on. Cheap to clone.
#[derive(Clone)]
pub struct StageServices {
    pub locator: PathLocator,
    pub store: Arc<dyn OwnershipStore>,
    pub dispatcher: Arc<EventDispatcher>,
    pub beginner: Arc<dyn Beginner>,
    pub stager: Arc<dyn Stager>,
    pub committer: Arc<dyn Committer>,
    pub clock: Arc<dyn Clock>,
    pub marker: FailureMarker,
    pub staging_root: PathBuf,
    pub settings: StageSettings,
    pub deferred: Vec<Arc<dyn DeferredTask>>,
}

impl StageServices {
    pub fn new(
        locator: PathLocator,
        store: Arc<dyn OwnershipStore>,
        stager: Arc<dyn Stager>,
        staging_root: impl Into<PathBuf>,
    ) -> Self {
        let marker = FailureMarker::new(&locator);
        Self {
            locator,
            store,
            dispatcher: Arc::new(EventDispatcher::new()),
            beginner: Arc::new(FsBeginner::new()),
            stager,
            committer: Arc::new(FsCommitter::new()),
            clock: Arc::new(SystemClock),
            marker,
            staging_root: staging_root.into(),
            settings: StageSettings::default(),
            deferred: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: EventDispatcher) -> Self {
        self.dispatcher = Arc::new(dispatcher);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_beginner(mut self, beginner: Arc<dyn Beginner>) -> Self {
        self.beginner = beginner;
        self
    }

    #[must_use]
    pub fn with_committer(mut self, committer: Arc<dyn Committer>) -> Self {
        self.committer = committer;
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: StageSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn with_deferred_task(mut self, task: Arc<dyn DeferredTask>) -> Self {
        self.deferred.push(task);
        self
    }
}

/// Error chain of `e`, outermost first.
fn error_chain(e: &dyn std::error::Error) -> String {
    let mut chain = e.to_string();
    let mut source = e.source();
    while let Some(inner) = source {
        chain.push_str(": ");
        chain.push_str(&inner.to_string());
        source = inner.source();
    }
    chain
}

/// A toolkit precondition means nothing was touched; report it like a veto.
fn toolkit_failure(event: EventType, e: ToolkitError) -> StageError {
    match e {
        ToolkitError::Precondition(message) => StageError::Validation(ValidationFailure {
            event,
            results: vec![ValidationResult::error(message)],
        }),
        other => StageError::Toolkit(other),
    }
}

fn continuation_key(stage_id: &StageId) -> String {
    let seed = format!("continuation:{stage_id}:{}", StageId::generate());
    blake3::hash(seed.as_bytes()).to_hex().to_string()
}

/// One staging-through-apply attempt, acting on behalf of a single actor.
///
/// A `Stage` value is a handle: the durable state lives in the ownership
/// store, so a second process can pick the same stage up with [`claim`].
///
/// [`claim`]: Stage::claim
pub struct Stage {
    services: StageServices,
    actor: OwnerToken,
    stage_type: String,
    stage_id: Option<StageId>,
    warnings: Vec<ValidationResult>,
}

impl Stage {
    pub fn new(services: StageServices, actor: impl Into<String>, stage_type: &str) -> Self {
        Self {
            services,
            actor: OwnerToken::new(actor),
            stage_type: stage_type.to_owned(),
            stage_id: None,
            warnings: Vec::new(),
        }
    }

    pub fn services(&self) -> &StageServices {
        &self.services
    }

    pub fn actor(&self) -> &OwnerToken {
        &self.actor
    }

    pub fn stage_type(&self) -> &str {
        &self.stage_type
    }

    /// The stage this handle created or claimed.
    pub fn stage_id(&self) -> Option<&StageId> {
        self.stage_id.as_ref()
    }

    /// Warning results collected by every event fired through this handle.
    pub fn warnings(&self) -> &[ValidationResult] {
        &self.warnings
    }

    fn now(&self) -> DateTime<Utc> {
        self.services.clock.now()
    }

    fn active_dir(&self) -> &Path {
        self.services.locator.project_root()
    }

    fn context(&self, stage_id: &StageId, phase: Option<StagePhase>) -> StageContext {
        StageContext {
            stage_id: Some(stage_id.clone()),
            stage_type: self.stage_type.clone(),
            active_dir: self.active_dir().to_path_buf(),
            stage_dir: Some(self.services.staging_root.join(stage_id.as_str())),
            phase,
        }
    }

    fn record_context(&self, record: &OwnershipRecord) -> StageContext {
        StageContext {
            stage_dir: Some(record.stage_dir()),
            ..self.context(&record.stage_id, Some(record.phase))
        }
    }

    /// Paths excluded no matter which validators are registered.
    fn base_excluded(&self) -> Result<ExcludedPaths, StageError> {
        let mut excluded = ExcludedPaths::new();
        let locator = &self.services.locator;
        if let Some(rel) = locator.relative_to_root(self.services.marker.path()) {
            excluded.add(rel)?;
        }
        if let Some(rel) = locator.relative_to_root(&self.services.staging_root) {
            excluded.add(rel)?;
        }
        Ok(excluded)
    }

    fn keep_warnings(&mut self, results: &[ValidationResult]) {
        self.warnings
            .extend(results.iter().filter(|r| !r.is_error()).cloned());
    }

    fn dispatch(
        &mut self,
        kind: EventKind,
        context: StageContext,
        excluded: ExcludedPaths,
    ) -> Result<StageEvent, StageError> {
        let event = StageEvent::new(kind, context).with_excluded(excluded);
        match self.services.dispatcher.dispatch(event) {
            Ok(event) => {
                self.keep_warnings(event.results());
                Ok(event)
            }
            Err(StageError::Validation(failure)) => {
                self.keep_warnings(&failure.results);
                Err(StageError::Validation(failure))
            }
            Err(e) => Err(e),
        }
    }

    fn not_found(&self, stage_id: &StageId) -> Result<StageError, StageError> {
        Ok(match self.services.store.destroyed_reason(stage_id)? {
            Some(reason) => StageError::Ownership(format!(
                "stage {stage_id} no longer exists: {reason}"
            )),
            None => StageError::Ownership(format!("stage {stage_id} does not exist")),
        })
    }

    /// The claim record, provided this handle's actor owns this handle's stage.
    fn owned_record(&self) -> Result<OwnershipRecord, StageError> {
        let stage_id = self.stage_id.as_ref().ok_or_else(|| {
            StageError::Ownership("the stage has not been created or claimed".to_owned())
        })?;
        let Some(record) = self.services.store.current(self.now())? else {
            return Err(self.not_found(stage_id)?);
        };
        if record.stage_id != *stage_id {
            return Err(StageError::Ownership(format!(
                "stage {stage_id} is no longer the claimed stage"
            )));
        }
        if record.owner != self.actor {
            return Err(StageError::Ownership(format!(
                "stage {stage_id} is owned by {}, not {}",
                record.owner, self.actor
            )));
        }
        Ok(record)
    }

    pub fn is_available(&self) -> Result<bool, StageError> {
        Ok(self.services.store.current(self.now())?.is_none())
    }

    pub fn is_owned_by_current_actor(&self) -> Result<bool, StageError> {
        Ok(self
            .services
            .store
            .owner(self.now())?
            .is_some_and(|owner| owner == self.actor))
    }

    /// The active claim, whoever holds it.
    pub fn current_claim(&self) -> Result<Option<OwnershipRecord>, StageError> {
        Ok(self.services.store.current(self.now())?)
    }

    /// Phase of this handle's stage, if it still holds the claim.
    pub fn phase(&self) -> Result<Option<StagePhase>, StageError> {
        let Some(stage_id) = &self.stage_id else {
            return Ok(None);
        };
        Ok(self
            .current_claim()?
            .filter(|r| r.stage_id == *stage_id)
            .map(|r| r.phase))
    }

    pub fn stage_directory(&self) -> Result<PathBuf, StageError> {
        let stage_id = self.stage_id.as_ref().ok_or_else(|| {
            StageError::InvalidState(
                "the stage directory is not available until the stage has been created or claimed"
                    .to_owned(),
            )
        })?;
        Ok(self.services.staging_root.join(stage_id.as_str()))
    }

    /// Copy the active directory into a new stage owned by this actor.
    pub fn create(&mut self) -> Result<StageId, StageError> {
        self.services.marker.assert_not_exists()?;
        if self.stage_id.is_some() {
            return Err(StageError::InvalidState(
                "this stage has already been created or claimed".to_owned(),
            ));
        }
        if !self.is_available()? {
            return Err(StageError::Conflict(
                "cannot create a new stage because one already exists".to_owned(),
            ));
        }

        let stage_id = StageId::generate();
        let context = self.context(&stage_id, None);
        let base = self.base_excluded()?;
        let (_, excluded) = self
            .dispatch(EventKind::PreCreate, context.clone(), base)?
            .into_parts();

        let now = self.now();
        let mut record = OwnershipRecord::new(
            stage_id.clone(),
            self.actor.clone(),
            &self.stage_type,
            self.services.staging_root.clone(),
            now,
        );
        if let Some(ttl) = self.services.settings.claim_ttl {
            record = record.expiring_at(now + ttl);
        }
        self.services.store.claim(record, now)?;
        self.stage_id = Some(stage_id.clone());
        info!("stage {stage_id} created by {}", self.actor);

        let stage_dir = self.services.staging_root.join(stage_id.as_str());
        debug!(
            "begin: {} -> {}",
            self.active_dir().display(),
            stage_dir.display()
        );
        let begun = self.services.beginner.begin(
            self.active_dir(),
            &stage_dir,
            &excluded,
            self.services.settings.create_timeout,
        );
        if let Err(e) = begun {
            warn!("begin failed for stage {stage_id}: {e}");
            if let Err(cleanup) = self.destroy(true) {
                warn!("cleanup of stage {stage_id} after failed begin also failed: {cleanup}");
            }
            return Err(toolkit_failure(EventType::PreCreate, e));
        }

        let context = StageContext {
            phase: Some(StagePhase::Created),
            ..context
        };
        self.dispatch(EventKind::PostCreate, context, ExcludedPaths::new())?;
        Ok(stage_id)
    }

    /// Re-attach to a stage this actor owns, e.g. in a later request.
    pub fn claim(&mut self, stage_id: &StageId) -> Result<(), StageError> {
        self.services.marker.assert_not_exists()?;
        let record = self.claimable(stage_id)?;
        if record.owner != self.actor {
            return Err(StageError::Ownership(format!(
                "cannot claim stage {stage_id}: it is owned by {}",
                record.owner
            )));
        }
        self.stage_id = Some(stage_id.clone());
        debug!("stage {stage_id} claimed by {}", self.actor);
        Ok(())
    }

    /// Re-attach using the continuation key issued at apply time. Ownership
    /// moves to this handle's actor.
    pub fn claim_with_key(&mut self, stage_id: &StageId, key: &str) -> Result<(), StageError> {
        self.services.marker.assert_not_exists()?;
        let mut record = self.claimable(stage_id)?;
        if record.continuation_key.as_deref() != Some(key) {
            return Err(StageError::Ownership(format!(
                "cannot claim stage {stage_id}: invalid continuation key"
            )));
        }
        if record.owner != self.actor {
            info!(
                "stage {stage_id} handed over from {} to {}",
                record.owner, self.actor
            );
            record.owner = self.actor.clone();
            self.services.store.update(&record)?;
        }
        self.stage_id = Some(stage_id.clone());
        Ok(())
    }

    fn claimable(&self, stage_id: &StageId) -> Result<OwnershipRecord, StageError> {
        if self.stage_id.as_ref().is_some_and(|id| id != stage_id) {
            return Err(StageError::InvalidState(
                "this stage has already been created or claimed".to_owned(),
            ));
        }
        let Some(record) = self.current_claim()? else {
            return Err(self.not_found(stage_id)?);
        };
        if record.stage_id != *stage_id {
            return Err(self.not_found(stage_id)?);
        }
        if record.stage_type != self.stage_type {
            return Err(StageError::Ownership(format!(
                "cannot claim stage {stage_id}: it was created as a {} stage",
                record.stage_type
            )));
        }
        Ok(record)
    }

    /// Ask the package manager to require packages in the staging copy.
    pub fn require(&mut self, runtime: &[String], dev: &[String]) -> Result<(), StageError> {
        self.services.marker.assert_not_exists()?;
        let mut record = self.owned_record()?;
        validate_transition(record.phase, StagePhase::Required)?;
        if runtime.is_empty() && dev.is_empty() {
            return Err(StageError::InvalidArgument(
                "no packages to require".to_owned(),
            ));
        }

        let context = self.record_context(&record);
        self.dispatch(
            EventKind::PreRequire {
                runtime: runtime.to_vec(),
                dev: dev.to_vec(),
            },
            context.clone(),
            ExcludedPaths::new(),
        )?;

        let stage_dir = record.stage_dir();
        if !runtime.is_empty() {
            self.run_stager(&["require"], runtime, &stage_dir)?;
        }
        if !dev.is_empty() {
            self.run_stager(&["require", "--dev"], dev, &stage_dir)?;
        }

        self.dispatch(
            EventKind::PostRequire {
                runtime: runtime.to_vec(),
                dev: dev.to_vec(),
            },
            context,
            ExcludedPaths::new(),
        )?;
        record.phase = StagePhase::Required;
        self.services.store.update(&record)?;
        info!("stage {} required {runtime:?} (dev {dev:?})", record.stage_id);
        Ok(())
    }

    fn run_stager(
        &self,
        prefix: &[&str],
        packages: &[String],
        stage_dir: &Path,
    ) -> Result<(), StageError> {
        let args: Vec<String> = prefix
            .iter()
            .map(|s| (*s).to_owned())
            .chain(packages.iter().cloned())
            .collect();
        debug!("{} stager: {}", self.services.stager.name(), args.join(" "));
        self.services
            .stager
            .stage(&args, stage_dir, self.services.settings.require_timeout)
            .map_err(|e| toolkit_failure(EventType::PreRequire, e))
    }

    /// Commit the staged changes into the active directory.
    ///
    /// The failure marker brackets the commit. If the commit fails or the
    /// process dies during it, the marker stays behind and every later
    /// operation except destroy refuses to run.
    pub fn apply(&mut self) -> Result<(), StageError> {
        self.services.marker.assert_not_exists()?;
        let mut record = self.owned_record()?;
        validate_transition(record.phase, StagePhase::Applying)?;

        let base = self.base_excluded()?;
        let context = self.record_context(&record);
        let (_, excluded) = self
            .dispatch(EventKind::PreApply, context, base)?
            .into_parts();

        let previous = record.clone();
        let stage_id = record.stage_id.clone();
        let stage_dir = record.stage_dir();
        record.phase = StagePhase::Applying;
        record.apply_started_at = Some(self.now());
        record.continuation_key = Some(continuation_key(&stage_id));
        self.services.store.update(&record)?;

        if let Err(e) = self
            .services
            .marker
            .write(&stage_id, APPLY_FAILURE_MESSAGE, None)
        {
            self.services.store.update(&previous)?;
            return Err(e.into());
        }

        info!("applying stage {stage_id}");
        let committed = self.services.committer.commit(
            &stage_dir,
            self.active_dir(),
            &excluded,
            self.services.settings.apply_timeout,
        );
        match committed {
            Ok(()) => {}
            Err(ToolkitError::Precondition(message)) => {
                // Refused before anything was written.
                self.services.marker.clear()?;
                self.services.store.update(&previous)?;
                return Err(toolkit_failure(
                    EventType::PreApply,
                    ToolkitError::Precondition(message),
                ));
            }
            Err(e) => {
                let chain = error_chain(&e);
                warn!("commit of stage {stage_id} failed: {chain}");
                if let Err(marker_error) =
                    self.services
                        .marker
                        .write(&stage_id, APPLY_FAILURE_MESSAGE, Some(&chain))
                {
                    warn!("could not record the commit failure in the marker: {marker_error}");
                }
                return Err(StageError::Toolkit(e));
            }
        }

        self.services.marker.clear()?;
        record.phase = StagePhase::Applied;
        record.apply_started_at = None;
        self.services.store.update(&record)?;
        info!("stage {stage_id} applied");

        let context = self.record_context(&record);
        self.dispatch(EventKind::PostApply, context, ExcludedPaths::new())?;
        Ok(())
    }

    /// The continuation key issued by the last apply of this handle's stage.
    pub fn continuation_key(&self) -> Result<Option<String>, StageError> {
        Ok(self.owned_record()?.continuation_key)
    }

    /// Run deferred tasks after the new code is live. A second call after
    /// success does nothing.
    pub fn post_apply(&mut self) -> Result<(), StageError> {
        self.services.marker.assert_not_exists()?;
        let mut record = self.owned_record()?;
        if record.phase != StagePhase::Applied {
            return Err(StageError::InvalidTransition {
                from: record.phase.to_string(),
                to: "post-apply".to_owned(),
            });
        }
        if record.post_apply_done {
            debug!("post-apply already ran for stage {}", record.stage_id);
            return Ok(());
        }

        let context = self.record_context(&record);
        for task in &self.services.deferred {
            debug!("running deferred task {}", task.name());
            task.run(&context)
                .map_err(|source| StageError::DeferredTask {
                    name: task.name().to_owned(),
                    source,
                })?;
        }
        record.post_apply_done = true;
        self.services.store.update(&record)?;
        info!("post-apply finished for stage {}", record.stage_id);
        Ok(())
    }

    /// Release the claim and delete the staging directory.
    ///
    /// Without `force` only the owner may destroy, and never while an apply
    /// is in progress unless it has been running longer than the staleness
    /// window. Destroying when nothing is claimed succeeds.
    pub fn destroy(&mut self, force: bool) -> Result<(), StageError> {
        let now = self.now();
        let Some(record) = self.services.store.current(now)? else {
            return self.destroy_expired();
        };
        if self
            .stage_id
            .as_ref()
            .is_some_and(|id| *id != record.stage_id)
        {
            debug!("stage already gone; the active claim belongs to {}", record.stage_id);
            self.stage_id = None;
            return Ok(());
        }

        if !force {
            if record.owner != self.actor {
                return Err(StageError::Ownership(format!(
                    "stage {} is owned by {} and cannot be destroyed by {}",
                    record.stage_id, record.owner, self.actor
                )));
            }
            if record.phase == StagePhase::Applying {
                let started = record.apply_started_at.unwrap_or(record.claimed_at);
                if now - started < self.services.settings.staleness {
                    return Err(StageError::Conflict(
                        "cannot destroy the stage while it is being applied".to_owned(),
                    ));
                }
                warn!(
                    "stage {} has been applying since {started}; destroying it as abandoned",
                    record.stage_id
                );
            }
        }

        let reason = if record.phase == StagePhase::Applied {
            "applied and cleaned up".to_owned()
        } else if record.owner == self.actor {
            "canceled".to_owned()
        } else {
            format!("canceled by {}", self.actor)
        };
        self.destroy_record(&record, &reason)
    }

    /// An expired claim no longer excludes anyone, but its directory and
    /// record are still on disk. Anyone may clean them up.
    fn destroy_expired(&mut self) -> Result<(), StageError> {
        let expired = self
            .services
            .store
            .recorded()?
            .filter(|r| !self.stage_id.as_ref().is_some_and(|id| *id != r.stage_id));
        match expired {
            Some(record) => {
                info!("claim on stage {} expired; cleaning up", record.stage_id);
                self.destroy_record(&record, "claim expired")
            }
            None => {
                debug!("nothing to destroy");
                self.stage_id = None;
                Ok(())
            }
        }
    }

    fn destroy_record(&mut self, record: &OwnershipRecord, reason: &str) -> Result<(), StageError> {
        let stage_id = record.stage_id.clone();
        let context = self.record_context(record);
        self.dispatch(EventKind::PreDestroy, context.clone(), ExcludedPaths::new())?;

        let stage_dir = record.stage_dir();
        if stage_dir.exists() {
            fs::remove_dir_all(&stage_dir)?;
            debug!("removed {}", stage_dir.display());
        }
        self.services.store.release(&stage_id)?;
        self.services.store.record_destroyed(&stage_id, reason)?;
        self.stage_id = None;
        info!("stage {stage_id} destroyed: {reason}");

        self.dispatch(EventKind::PostDestroy, context, ExcludedPaths::new())?;
        Ok(())
    }

    /// Run the status-check validators against the stage in flight, if any.
    /// Error results are returned, not raised.
    pub fn check_status(&mut self) -> Result<Vec<ValidationResult>, StageError> {
        let context = match self.current_claim()? {
            Some(record) => self.record_context(&record),
            None => StageContext {
                stage_id: None,
                stage_type: self.stage_type.clone(),
                active_dir: self.active_dir().to_path_buf(),
                stage_dir: None,
                phase: None,
            },
        };
        let base = self.base_excluded()?;
        let (results, _) = self
            .dispatch(EventKind::StatusCheck, context, base)?
            .into_parts();
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::dispatch::FnSubscriber;
    use stagehand_store::MemoryOwnershipStore;
    use stagehand_toolkit::{InstalledPackages, MockStager};

    struct Fixture {
        _dir: tempfile::TempDir,
        active: PathBuf,
        services: StageServices,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let active = dir.path().join("active");
        fs::create_dir_all(&active).unwrap();
        let stager = MockStager::new("vendor");
        stager
            .stage(&["require".to_owned(), "a:1.0".to_owned()], &active, None)
            .unwrap();
        let clock = Arc::new(ManualClock::default());
        let services = StageServices::new(
            PathLocator::new(&active, "vendor", "").unwrap(),
            Arc::new(MemoryOwnershipStore::new()),
            Arc::new(stager),
            dir.path().join("stages"),
        )
        .with_clock(Arc::clone(&clock) as Arc<dyn Clock>);
        Fixture {
            _dir: dir,
            active,
            services,
            clock,
        }
    }

    fn packages(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn full_lifecycle_updates_active_dir() {
        let f = fixture();
        let mut stage = Stage::new(f.services.clone(), "alice", "test");
        let id = stage.create().unwrap();
        assert!(id.is_well_formed());
        assert_eq!(stage.phase().unwrap(), Some(StagePhase::Created));

        stage.require(&packages(&["a:2.0"]), &[]).unwrap();
        assert_eq!(stage.phase().unwrap(), Some(StagePhase::Required));
        stage.apply().unwrap();
        assert_eq!(stage.phase().unwrap(), Some(StagePhase::Applied));

        let installed = InstalledPackages::read(&f.active.join("vendor")).unwrap();
        assert_eq!(installed.get("a").unwrap().version, "2.0");
        assert!(stage.stage_directory().unwrap().exists());
        assert!(!f.services.marker.exists());

        stage.destroy(false).unwrap();
        assert!(stage.is_available().unwrap());
    }

    #[test]
    fn stage_directory_needs_a_stage() {
        let f = fixture();
        let stage = Stage::new(f.services, "alice", "test");
        assert!(matches!(
            stage.stage_directory(),
            Err(StageError::InvalidState(_))
        ));
    }

    #[test]
    fn apply_requires_require_first() {
        let f = fixture();
        let mut stage = Stage::new(f.services, "alice", "test");
        stage.create().unwrap();
        assert!(matches!(
            stage.apply(),
            Err(StageError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn failed_pre_require_keeps_phase() {
        let f = fixture();
        let dispatcher = EventDispatcher::new().with(Arc::new(FnSubscriber::new(
            "veto",
            vec![(EventType::PreRequire, 0)],
            |e| {
                e.add_error("not today");
                Ok(())
            },
        )));
        let mut stage = Stage::new(f.services.with_dispatcher(dispatcher), "alice", "test");
        stage.create().unwrap();
        let err = stage.require(&packages(&["a:2.0"]), &[]).unwrap_err();
        assert_eq!(err.validation().unwrap().event, EventType::PreRequire);
        assert_eq!(stage.phase().unwrap(), Some(StagePhase::Created));
    }

    #[test]
    fn stager_failure_keeps_phase() {
        let f = fixture();
        let stager = Arc::new(MockStager::new("vendor"));
        stager.fail_on("broken");
        let services = StageServices {
            stager,
            ..f.services
        };
        let mut stage = Stage::new(services, "alice", "test");
        stage.create().unwrap();
        assert!(matches!(
            stage.require(&packages(&["broken:1.0"]), &[]),
            Err(StageError::Toolkit(ToolkitError::Failed { .. }))
        ));
        assert_eq!(stage.phase().unwrap(), Some(StagePhase::Created));
    }

    #[test]
    fn empty_require_is_rejected() {
        let f = fixture();
        let mut stage = Stage::new(f.services, "alice", "test");
        stage.create().unwrap();
        assert!(matches!(
            stage.require(&[], &[]),
            Err(StageError::InvalidArgument(_))
        ));
    }

    #[test]
    fn post_apply_runs_tasks_once() {
        struct Counter(std::sync::atomic::AtomicUsize);
        impl DeferredTask for Counter {
            fn name(&self) -> &'static str {
                "counter"
            }
            fn run(&self, _: &StageContext) -> Result<(), SubscriberError> {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
        }

        let f = fixture();
        let counter = Arc::new(Counter(std::sync::atomic::AtomicUsize::new(0)));
        let services = f
            .services
            .with_deferred_task(Arc::clone(&counter) as Arc<dyn DeferredTask>);
        let mut stage = Stage::new(services, "alice", "test");
        stage.create().unwrap();
        assert!(matches!(
            stage.post_apply(),
            Err(StageError::InvalidTransition { .. })
        ));
        stage.require(&packages(&["a:2.0"]), &[]).unwrap();
        stage.apply().unwrap();
        stage.post_apply().unwrap();
        stage.post_apply().unwrap();
        assert_eq!(counter.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn claim_with_key_transfers_ownership() {
        let f = fixture();
        let mut stage = Stage::new(f.services.clone(), "alice", "test");
        let id = stage.create().unwrap();
        stage.require(&packages(&["a:2.0"]), &[]).unwrap();
        stage.apply().unwrap();
        let key = stage.continuation_key().unwrap().unwrap();

        let mut other = Stage::new(f.services.clone(), "worker", "test");
        assert!(matches!(
            other.claim_with_key(&id, "wrong"),
            Err(StageError::Ownership(_))
        ));
        other.claim_with_key(&id, &key).unwrap();
        assert!(other.is_owned_by_current_actor().unwrap());
        assert!(!stage.is_owned_by_current_actor().unwrap());
    }

    #[test]
    fn claim_rejects_other_stage_type() {
        let f = fixture();
        let mut stage = Stage::new(f.services.clone(), "alice", "attended");
        let id = stage.create().unwrap();
        let mut other = Stage::new(f.services, "alice", "unattended");
        let err = other.claim(&id).unwrap_err();
        assert!(err.to_string().contains("attended stage"));
    }

    #[test]
    fn claiming_destroyed_stage_reports_reason() {
        let f = fixture();
        let mut stage = Stage::new(f.services.clone(), "alice", "test");
        let id = stage.create().unwrap();
        stage.destroy(false).unwrap();
        let mut again = Stage::new(f.services, "alice", "test");
        let err = again.claim(&id).unwrap_err();
        assert!(err.to_string().contains("canceled"), "{err}");
    }

    #[test]
    fn expired_claim_frees_the_slot() {
        let f = fixture();
        let mut stage = Stage::new(f.services.clone(), "alice", "test");
        stage.create().unwrap();
        f.clock.advance(chrono::Duration::days(8));
        assert!(stage.is_available().unwrap());
    }

    #[test]
    fn destroy_cleans_up_expired_claim() {
        let f = fixture();
        let mut stage = Stage::new(f.services.clone(), "alice", "test");
        let id = stage.create().unwrap();
        let stage_dir = stage.stage_directory().unwrap();
        f.clock.advance(chrono::Duration::days(8));

        stage.destroy(false).unwrap();
        assert!(!stage_dir.exists());
        assert!(f.services.store.recorded().unwrap().is_none());
        assert_eq!(
            f.services.store.destroyed_reason(&id).unwrap().as_deref(),
            Some("claim expired")
        );
    }

    #[test]
    fn create_over_expired_claim_removes_old_stage_dir() {
        let f = fixture();
        let mut old = Stage::new(f.services.clone(), "alice", "test");
        old.create().unwrap();
        let old_dir = old.stage_directory().unwrap();
        f.clock.advance(chrono::Duration::days(8));

        let mut new = Stage::new(f.services.clone(), "bob", "test");
        new.create().unwrap();
        assert!(!old_dir.exists());
        assert!(new.stage_directory().unwrap().exists());
    }

    #[test]
    fn base_excluded_covers_nested_staging_root() {
        let f = fixture();
        let services = StageServices {
            staging_root: f.active.join(".stages"),
            ..f.services
        };
        let stage = Stage::new(services, "alice", "test");
        let excluded = stage.base_excluded().unwrap();
        assert!(excluded.matches(Path::new(".stages/abc")));
        assert!(excluded.matches(Path::new(stagehand_store::FAILURE_MARKER_FILE)));
    }

    #[test]
    fn error_chain_joins_sources() {
        let e = StageError::Subscriber {
            name: "x".to_owned(),
            source: SubscriberError::Failed("inner".to_owned()),
        };
        assert_eq!(error_chain(&e), "subscriber 'x' failed: inner: inner");
    }
}
