use crate::backend::{Beginner, Committer};
use crate::exclude::ExcludedPaths;
use crate::ToolkitError;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Polled between filesystem entries. Returning `true` aborts the operation.
pub type CancelFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// Begins a stage by copying the active directory into the staging directory.
#[derive(Default, Clone)]
pub struct FsBeginner {
    cancel: Option<CancelFn>,
}

impl FsBeginner {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelFn) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Commits a stage by making the active directory match the staging
/// directory, outside of the excluded paths.
#[derive(Default, Clone)]
pub struct FsCommitter {
    cancel: Option<CancelFn>,
}

impl FsCommitter {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelFn) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

struct Walk<'a> {
    operation: &'static str,
    excluded: &'a ExcludedPaths,
    deadline: Option<(Instant, Duration)>,
    cancel: Option<&'a CancelFn>,
    copied: usize,
    removed: usize,
}

impl<'a> Walk<'a> {
    fn new(
        operation: &'static str,
        excluded: &'a ExcludedPaths,
        timeout: Option<Duration>,
        cancel: Option<&'a CancelFn>,
    ) -> Self {
        Self {
            operation,
            excluded,
            deadline: timeout.map(|t| (Instant::now() + t, t)),
            cancel,
            copied: 0,
            removed: 0,
        }
    }

    fn tick(&self) -> Result<(), ToolkitError> {
        if let Some(cancel) = self.cancel {
            if (**cancel)() {
                return Err(ToolkitError::Cancelled(self.operation.to_owned()));
            }
        }
        if let Some((deadline, limit)) = self.deadline {
            if Instant::now() >= deadline {
                return Err(ToolkitError::Timeout {
                    operation: self.operation.to_owned(),
                    seconds: limit.as_secs(),
                });
            }
        }
        Ok(())
    }

    /// Copy `src_root/rel` over `dst_root/rel`, recursively.
    fn copy_tree(&mut self, src_root: &Path, dst_root: &Path, rel: &Path) -> Result<(), ToolkitError> {
        for name in sorted_names(&src_root.join(rel))? {
            self.tick()?;
            let rel_child = rel.join(&name);
            if self.excluded.matches(&rel_child) {
                continue;
            }
            let src = src_root.join(&rel_child);
            let dst = dst_root.join(&rel_child);
            let file_type = src.symlink_metadata()?.file_type();

            if file_type.is_symlink() {
                remove_any(&dst)?;
                copy_symlink(&src, &dst)?;
                self.copied += 1;
            } else if file_type.is_dir() {
                if dst.symlink_metadata().is_ok_and(|m| !m.is_dir()) {
                    remove_any(&dst)?;
                }
                fs::create_dir_all(&dst)?;
                self.copy_tree(src_root, dst_root, &rel_child)?;
            } else if file_type.is_file() {
                if dst
                    .symlink_metadata()
                    .is_ok_and(|m| m.is_dir() || m.file_type().is_symlink())
                {
                    remove_any(&dst)?;
                }
                fs::copy(&src, &dst)?;
                self.copied += 1;
            } else {
                warn!("skipping unsupported file type: {}", rel_child.display());
            }
        }
        Ok(())
    }

    /// Remove entries under `dst_root/rel` that no longer exist under `src_root/rel`.
    fn prune(&mut self, src_root: &Path, dst_root: &Path, rel: &Path) -> Result<(), ToolkitError> {
        for name in sorted_names(&dst_root.join(rel))? {
            self.tick()?;
            let rel_child = rel.join(&name);
            if self.excluded.matches(&rel_child) {
                continue;
            }
            let dst = dst_root.join(&rel_child);
            match src_root.join(&rel_child).symlink_metadata() {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    remove_any(&dst)?;
                    self.removed += 1;
                }
                Err(e) => return Err(e.into()),
                Ok(src_meta) => {
                    let dst_meta = dst.symlink_metadata()?;
                    if src_meta.is_dir() && dst_meta.is_dir() {
                        self.prune(src_root, dst_root, &rel_child)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn sorted_names(dir: &Path) -> Result<Vec<std::ffi::OsString>, ToolkitError> {
    let mut names = fs::read_dir(dir)?
        .map(|e| e.map(|e| e.file_name()))
        .collect::<Result<Vec<_>, _>>()?;
    names.sort();
    Ok(names)
}

fn remove_any(path: &Path) -> Result<(), ToolkitError> {
    match path.symlink_metadata() {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
        Ok(m) if m.is_dir() => Ok(fs::remove_dir_all(path)?),
        Ok(_) => Ok(fs::remove_file(path)?),
    }
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<(), ToolkitError> {
    let target = fs::read_link(src)?;
    std::os::unix::fs::symlink(target, dst)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, _dst: &Path) -> Result<(), ToolkitError> {
    warn!("skipping symlink on this platform: {}", src.display());
    Ok(())
}

fn is_empty_dir(dir: &Path) -> Result<bool, ToolkitError> {
    Ok(fs::read_dir(dir)?.next().is_none())
}

impl Beginner for FsBeginner {
    fn begin(
        &self,
        active_dir: &Path,
        stage_dir: &Path,
        excluded: &ExcludedPaths,
        timeout: Option<Duration>,
    ) -> Result<(), ToolkitError> {
        if !active_dir.is_dir() {
            return Err(ToolkitError::Precondition(format!(
                "active directory {} does not exist",
                active_dir.display()
            )));
        }
        if active_dir == stage_dir {
            return Err(ToolkitError::Precondition(
                "active and staging directories must differ".to_owned(),
            ));
        }
        if stage_dir.exists() && !is_empty_dir(stage_dir)? {
            return Err(ToolkitError::Precondition(format!(
                "staging directory {} is not empty",
                stage_dir.display()
            )));
        }
        fs::create_dir_all(stage_dir)?;

        let mut walk = Walk::new("begin", excluded, timeout, self.cancel.as_ref());
        walk.copy_tree(active_dir, stage_dir, Path::new(""))?;
        debug!(
            "begin: copied {} entries from {} to {}",
            walk.copied,
            active_dir.display(),
            stage_dir.display()
        );
        Ok(())
    }
}

impl Committer for FsCommitter {
    fn commit(
        &self,
        stage_dir: &Path,
        active_dir: &Path,
        excluded: &ExcludedPaths,
        timeout: Option<Duration>,
    ) -> Result<(), ToolkitError> {
        if !stage_dir.is_dir() {
            return Err(ToolkitError::Precondition(format!(
                "staging directory {} does not exist",
                stage_dir.display()
            )));
        }
        if !active_dir.is_dir() {
            return Err(ToolkitError::Precondition(format!(
                "active directory {} does not exist",
                active_dir.display()
            )));
        }

        let mut walk = Walk::new("commit", excluded, timeout, self.cancel.as_ref());
        walk.prune(stage_dir, active_dir, Path::new(""))?;
        walk.copy_tree(stage_dir, active_dir, Path::new(""))?;
        debug!(
            "commit: copied {} entries, removed {} from {}",
            walk.copied,
            walk.removed,
            active_dir.display()
        );
        Ok(())
    }
}
