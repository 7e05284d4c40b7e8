use crate::dispatch::Subscriber;
use crate::event::{EventType, Severity, StageEvent, ValidationResult};
use crate::SubscriberError;
use stagehand_toolkit::ExcludedPaths;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Refuses symlinks that resolve outside the tree they live in. Copying or
/// committing such a link would make the stage depend on files it does
/// not own.
pub struct SymlinkValidator;

/// Resolve `.` and `..` without touching the filesystem.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

fn scan(
    root: &Path,
    rel: &Path,
    excluded: &ExcludedPaths,
    found: &mut Vec<String>,
) -> Result<(), SubscriberError> {
    let mut entries = fs::read_dir(root.join(rel))?
        .map(|e| e.map(|e| e.file_name()))
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort();

    for name in entries {
        let rel_child = rel.join(&name);
        if excluded.matches(&rel_child) || rel_child == Path::new(".git") {
            continue;
        }
        let full = root.join(&rel_child);
        let file_type = full.symlink_metadata()?.file_type();
        if file_type.is_symlink() {
            let target = fs::read_link(&full)?;
            let resolved = if target.is_absolute() {
                lexical_normalize(&target)
            } else {
                lexical_normalize(&full.parent().unwrap_or(root).join(&target))
            };
            if !resolved.starts_with(root) {
                found.push(format!(
                    "{} links to {}, which is outside {}.",
                    rel_child.display(),
                    target.display(),
                    root.display()
                ));
            }
        } else if file_type.is_dir() {
            scan(root, &rel_child, excluded, found)?;
        }
    }
    Ok(())
}

impl Subscriber for SymlinkValidator {
    fn name(&self) -> &'static str {
        "symlinks"
    }

    fn subscriptions(&self) -> Vec<(EventType, i32)> {
        vec![
            (EventType::PreCreate, 0),
            (EventType::PreApply, 0),
            (EventType::StatusCheck, 0),
        ]
    }

    fn handle(&self, event: &mut StageEvent) -> Result<(), SubscriberError> {
        let context = event.context().clone();
        let mut found = Vec::new();
        let active = lexical_normalize(&context.active_dir);
        if active.is_dir() {
            scan(&active, Path::new(""), event.excluded_paths(), &mut found)?;
        }
        if event.event_type() == EventType::PreApply {
            if let Some(stage_dir) = &context.stage_dir {
                let stage_dir = lexical_normalize(stage_dir);
                if stage_dir.is_dir() {
                    scan(&stage_dir, Path::new(""), event.excluded_paths(), &mut found)?;
                }
            }
        }
        let summary = (found.len() > 1)
            .then(|| "Symlinks pointing outside the project were found.".to_owned());
        if let Some(result) = ValidationResult::new(Severity::Error, found, summary) {
            event.add_result(result);
        }
        Ok(())
    }
}
