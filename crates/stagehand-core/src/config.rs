use crate::stage::{StageServices, StageSettings};
use crate::unattended::UnattendedMode;
use crate::validators;
use crate::StageError;
use serde::{Deserialize, Serialize};
use stagehand_store::{normalize_relative, FileOwnershipStore, PathLocator, StateLayout};
use stagehand_toolkit::{select_stager, ExcludedPaths, ManifestInspector, PackageInspector};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Durations above this are clamped; nothing here legitimately runs for a century.
const MAX_SECS: u64 = 100 * 365 * 24 * 3600;

/// Configuration for one managed installation, read from TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub active_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_root: Option<PathBuf>,
    #[serde(default = "default_vendor_dir")]
    pub vendor_dir: PathBuf,
    #[serde(default)]
    pub web_root: PathBuf,
    #[serde(default)]
    pub excluded_paths: Vec<PathBuf>,
    #[serde(default = "default_min_free_space_mb")]
    pub min_free_space_mb: u64,
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: u64,
    #[serde(default = "default_claim_ttl_secs")]
    pub claim_ttl_secs: u64,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub package_manager: PackageManagerConfig,
    #[serde(default)]
    pub unattended: UnattendedConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutConfig {
    pub create_secs: u64,
    pub require_secs: u64,
    pub apply_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            create_secs: 300,
            require_secs: 300,
            apply_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackageManagerConfig {
    /// `command` or `mock`.
    pub kind: String,
    pub binary: String,
    pub extra_args: Vec<String>,
}

impl Default for PackageManagerConfig {
    fn default() -> Self {
        Self {
            kind: "command".to_owned(),
            binary: "composer".to_owned(),
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    #[default]
    InProcess,
    Command,
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UnattendedConfig {
    pub mode: UnattendedMode,
    pub interval_secs: u64,
    /// Package whose installed version drives release selection.
    pub project: String,
    /// Release feed, relative to the state directory unless absolute.
    pub releases_file: PathBuf,
    pub trigger: TriggerKind,
    pub trigger_url: String,
}

impl Default for UnattendedConfig {
    fn default() -> Self {
        Self {
            mode: UnattendedMode::Disabled,
            interval_secs: 3 * 3600,
            project: String::new(),
            releases_file: PathBuf::from("releases.json"),
            trigger: TriggerKind::InProcess,
            trigger_url: String::new(),
        }
    }
}

fn default_vendor_dir() -> PathBuf {
    PathBuf::from("vendor")
}

fn default_min_free_space_mb() -> u64 {
    1024
}

fn default_staleness_secs() -> u64 {
    3600
}

fn default_claim_ttl_secs() -> u64 {
    7 * 24 * 3600
}

fn chrono_secs(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs.min(MAX_SECS)).unwrap_or(0))
}

fn std_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs.min(MAX_SECS)))
}

impl StageConfig {
    /// Minimal configuration with every default applied.
    pub fn new(active_dir: impl Into<PathBuf>) -> Self {
        Self {
            active_dir: active_dir.into(),
            state_dir: None,
            staging_root: None,
            vendor_dir: default_vendor_dir(),
            web_root: PathBuf::new(),
            excluded_paths: Vec::new(),
            min_free_space_mb: default_min_free_space_mb(),
            staleness_secs: default_staleness_secs(),
            claim_ttl_secs: default_claim_ttl_secs(),
            timeouts: TimeoutConfig::default(),
            package_manager: PackageManagerConfig::default(),
            unattended: UnattendedConfig::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, StageError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StageError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, StageError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| StageError::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), StageError> {
        if !self.active_dir.is_absolute() {
            return Err(StageError::Config(format!(
                "active_dir must be absolute: {}",
                self.active_dir.display()
            )));
        }
        for (field, path) in [("vendor_dir", &self.vendor_dir), ("web_root", &self.web_root)] {
            normalize_relative(path).map_err(|e| StageError::Config(format!("{field}: {e}")))?;
        }
        for path in &self.excluded_paths {
            normalize_relative(path)
                .map_err(|e| StageError::Config(format!("excluded_paths: {e}")))?;
        }
        if !matches!(self.package_manager.kind.as_str(), "command" | "mock") {
            return Err(StageError::Config(format!(
                "package_manager.kind must be \"command\" or \"mock\", got \"{}\"",
                self.package_manager.kind
            )));
        }
        if self.unattended.mode != UnattendedMode::Disabled && self.unattended.project.is_empty() {
            return Err(StageError::Config(
                "unattended.project is required unless unattended.mode is \"disabled\"".to_owned(),
            ));
        }
        if self.unattended.trigger == TriggerKind::Http && self.unattended.trigger_url.is_empty() {
            return Err(StageError::Config(
                "unattended.trigger_url is required for the http trigger".to_owned(),
            ));
        }
        Ok(())
    }

    /// Explicit `state_dir`, or `.stagehand` next to the active directory.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            self.active_dir
                .parent()
                .map_or_else(|| self.active_dir.join(".stagehand"), |p| p.join(".stagehand"))
        })
    }

    pub fn staging_root(&self) -> PathBuf {
        self.staging_root
            .clone()
            .unwrap_or_else(|| self.state_dir().join("stages"))
    }

    pub fn layout(&self) -> StateLayout {
        StateLayout::new(self.state_dir()).with_staging_root(self.staging_root())
    }

    pub fn locator(&self) -> Result<PathLocator, StageError> {
        Ok(PathLocator::new(
            &self.active_dir,
            &self.vendor_dir,
            &self.web_root,
        )?)
    }

    pub fn excluded(&self) -> Result<ExcludedPaths, StageError> {
        let mut excluded = ExcludedPaths::new();
        excluded.extend(&self.excluded_paths)?;
        Ok(excluded)
    }

    pub fn releases_path(&self) -> PathBuf {
        if self.unattended.releases_file.is_absolute() {
            self.unattended.releases_file.clone()
        } else {
            self.state_dir().join(&self.unattended.releases_file)
        }
    }

    pub fn unattended_interval(&self) -> chrono::Duration {
        chrono_secs(self.unattended.interval_secs)
    }

    /// A zero timeout disables the deadline.
    pub fn settings(&self) -> StageSettings {
        StageSettings {
            staleness: chrono_secs(self.staleness_secs),
            claim_ttl: (self.claim_ttl_secs > 0).then(|| chrono_secs(self.claim_ttl_secs)),
            create_timeout: std_secs(self.timeouts.create_secs),
            require_timeout: std_secs(self.timeouts.require_secs),
            apply_timeout: std_secs(self.timeouts.apply_secs),
        }
    }

    pub fn inspector(&self) -> Arc<dyn PackageInspector> {
        Arc::new(ManifestInspector::new(&self.vendor_dir))
    }

    /// Wire up the file-backed store, the configured stager and the
    /// built-in validators.
    pub fn services(&self) -> Result<StageServices, StageError> {
        let layout = self.layout();
        layout.initialize()?;
        let stager = select_stager(
            &self.package_manager.kind,
            &self.package_manager.binary,
            &self.package_manager.extra_args,
            &self.vendor_dir,
        )?;
        let dispatcher = validators::default_dispatcher(self, self.inspector())?;
        Ok(StageServices::new(
            self.locator()?,
            Arc::new(FileOwnershipStore::new(layout)),
            Arc::from(stager),
            self.staging_root(),
        )
        .with_dispatcher(dispatcher)
        .with_settings(self.settings()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = StageConfig::from_toml_str(r#"active_dir = "/srv/site""#).unwrap();
        assert_eq!(config.vendor_dir, PathBuf::from("vendor"));
        assert_eq!(config.staleness_secs, 3600);
        assert_eq!(config.timeouts.apply_secs, 600);
        assert_eq!(config.package_manager.binary, "composer");
        assert_eq!(config.unattended.mode, UnattendedMode::Disabled);
        assert_eq!(config.state_dir(), PathBuf::from("/srv/.stagehand"));
        assert_eq!(config.staging_root(), PathBuf::from("/srv/.stagehand/stages"));
    }

    #[test]
    fn full_config_parses() {
        let config = StageConfig::from_toml_str(
            r#"
active_dir = "/srv/site"
state_dir = "/var/lib/stagehand"
excluded_paths = ["secrets.db", "sites/default/files"]
min_free_space_mb = 10

[timeouts]
apply_secs = 60

[package_manager]
kind = "mock"

[unattended]
mode = "security"
project = "drupal/core"
trigger = "http"
trigger_url = "http://localhost:8080/continue"
"#,
        )
        .unwrap();
        assert_eq!(config.timeouts.apply_secs, 60);
        assert_eq!(config.timeouts.create_secs, 300);
        assert_eq!(config.unattended.mode, UnattendedMode::SecurityOnly);
        assert_eq!(config.unattended.trigger, TriggerKind::Http);
        assert_eq!(
            config.releases_path(),
            PathBuf::from("/var/lib/stagehand/releases.json")
        );
        assert_eq!(config.excluded().unwrap().len(), 2);
    }

    #[test]
    fn relative_active_dir_rejected() {
        assert!(matches!(
            StageConfig::from_toml_str(r#"active_dir = "site""#),
            Err(StageError::Config(_))
        ));
    }

    #[test]
    fn escaping_excluded_path_rejected() {
        let err = StageConfig::from_toml_str(
            r#"
active_dir = "/srv/site"
excluded_paths = ["../etc/passwd"]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("excluded_paths"));
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(StageConfig::from_toml_str(
            r#"
active_dir = "/srv/site"
stalenes_secs = 5
"#
        )
        .is_err());
    }

    #[test]
    fn unattended_requires_project() {
        let err = StageConfig::from_toml_str(
            r#"
active_dir = "/srv/site"
[unattended]
mode = "all"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unattended.project"));
    }

    #[test]
    fn zero_timeout_disables_deadline() {
        let mut config = StageConfig::new("/srv/site");
        config.timeouts.create_secs = 0;
        let settings = config.settings();
        assert!(settings.create_timeout.is_none());
        assert_eq!(settings.apply_timeout, Some(Duration::from_secs(600)));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stagehand.toml");
        std::fs::write(&path, "active_dir = \"/srv/site\"\nmin_free_space_mb = 5\n").unwrap();
        assert_eq!(StageConfig::load(&path).unwrap().min_free_space_mb, 5);
        assert!(StageConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
