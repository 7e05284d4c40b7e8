use crate::backend::Stager;
use crate::manifest::{InstalledPackage, InstalledPackages, Manifest, LOCK_FILE};
use crate::ToolkitError;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// In-process stand-in for the package manager.
///
/// Understands `require [--dev] name:version...`. Each call rewrites the
/// manifest, the installed-package index under the vendor directory and the
/// lock file, so validators that inspect those files behave as they would
/// after a real install.
pub struct MockStager {
    vendor_dir: PathBuf,
    calls: Mutex<Vec<Vec<String>>>,
    failing: Mutex<BTreeSet<String>>,
}

impl MockStager {
    /// `vendor_dir` is relative to the working directory handed to `stage`.
    pub fn new(vendor_dir: impl Into<PathBuf>) -> Self {
        Self {
            vendor_dir: vendor_dir.into(),
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(BTreeSet::new()),
        }
    }

    /// Make every later request for `package` fail like an unresolvable dependency.
    pub fn fail_on(&self, package: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(package.to_owned());
        }
    }

    /// Arguments of every `stage` call so far, in order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn parse_spec(spec: &str) -> Result<(String, String), ToolkitError> {
        match spec.split_once(':') {
            Some((name, version)) if !name.is_empty() && !version.is_empty() => {
                Ok((name.to_owned(), version.to_owned()))
            }
            _ => Err(ToolkitError::Failed {
                command: format!("mock require {spec}"),
                status: "exit code 1".to_owned(),
                stderr: format!("invalid package specification '{spec}'"),
            }),
        }
    }
}

/// Rewrite the lock file from the manifest and the installed index.
pub(crate) fn write_lock(
    working_dir: &Path,
    manifest: &Manifest,
    installed: &InstalledPackages,
) -> Result<(), ToolkitError> {
    let manifest_json = serde_json::to_vec(manifest)?;
    let lock = serde_json::json!({
        "content-hash": blake3::hash(&manifest_json).to_hex().to_string(),
        "packages": installed.packages,
    });
    fs::write(
        working_dir.join(LOCK_FILE),
        serde_json::to_string_pretty(&lock)?,
    )?;
    Ok(())
}

impl Stager for MockStager {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn stage(
        &self,
        args: &[String],
        working_dir: &Path,
        _timeout: Option<Duration>,
    ) -> Result<(), ToolkitError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(args.to_vec());
        }

        let mut iter = args.iter().map(String::as_str).peekable();
        if iter.next() != Some("require") {
            return Err(ToolkitError::Failed {
                command: format!("mock {}", args.join(" ")),
                status: "exit code 1".to_owned(),
                stderr: "only 'require' is supported".to_owned(),
            });
        }
        let dev = iter.next_if_eq(&"--dev").is_some();

        let mut requested = Vec::new();
        for spec in iter {
            if spec.starts_with("--") {
                continue;
            }
            requested.push(Self::parse_spec(spec)?);
        }

        let failing = self
            .failing
            .lock()
            .map_err(|e| ToolkitError::Precondition(format!("mutex poisoned: {e}")))?
            .clone();
        if let Some((name, _)) = requested.iter().find(|(n, _)| failing.contains(n)) {
            return Err(ToolkitError::Failed {
                command: format!("mock {}", args.join(" ")),
                status: "exit code 2".to_owned(),
                stderr: format!("could not resolve {name}"),
            });
        }

        let vendor = working_dir.join(&self.vendor_dir);
        let mut manifest = Manifest::read(working_dir)?;
        let mut installed = InstalledPackages::read(&vendor)?;
        for (name, version) in requested {
            let package_dir = vendor.join(&name);
            fs::create_dir_all(&package_dir)?;
            fs::write(package_dir.join("VERSION"), &version)?;
            installed.upsert(InstalledPackage {
                name: name.clone(),
                version: version.clone(),
                path: Some(name.clone()),
            });
            if dev {
                manifest.require_dev.insert(name, version);
            } else {
                manifest.require.insert(name, version);
            }
        }
        manifest.write(working_dir)?;
        installed.write(&vendor)?;
        write_lock(working_dir, &manifest, &installed)
    }
}
