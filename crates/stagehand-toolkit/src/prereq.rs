use std::fmt;
use std::fs;
use std::path::Path;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: String,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn on_path(binary: &str) -> bool {
    let candidate = Path::new(binary);
    if candidate.components().count() > 1 {
        return candidate.is_file();
    }
    std::env::var_os("PATH")
        .is_some_and(|path| std::env::split_paths(&path).any(|dir| dir.join(binary).is_file()))
}

/// Nearest existing ancestor of `dir`, which is where it would be created.
fn writable_ancestor(dir: &Path) -> bool {
    dir.ancestors()
        .find(|a| a.exists())
        .and_then(|a| fs::metadata(a).ok())
        .is_some_and(|m| m.is_dir() && !m.permissions().readonly())
}

/// Prerequisites for staging with `binary` under `staging_root`.
/// An empty list means everything is in place.
pub fn check_stager_prereqs(binary: &str, staging_root: &Path) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();
    if !on_path(binary) {
        missing.push(MissingPrereq {
            name: binary.to_owned(),
            purpose: "resolving and installing packages in the staging directory",
            install_hint: "see https://getcomposer.org/download/ or set package_manager.binary",
        });
    }
    if !writable_ancestor(staging_root) {
        missing.push(MissingPrereq {
            name: staging_root.display().to_string(),
            purpose: "holding staged copies of the site",
            install_hint: "make the directory writable or set staging_root",
        });
    }
    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nStagehand needs these tools to stage package changes.");
    msg
}
