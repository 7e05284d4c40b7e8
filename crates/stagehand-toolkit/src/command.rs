use crate::backend::Stager;
use crate::ToolkitError;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs the real package-manager binary:
/// `<binary> <args> [extra_args] --working-dir <dir> --no-interaction`.
pub struct CommandStager {
    binary: String,
    extra_args: Vec<String>,
}

impl CommandStager {
    pub fn new(binary: impl Into<String>, extra_args: Vec<String>) -> Self {
        Self {
            binary: binary.into(),
            extra_args,
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn build_command(&self, args: &[String], working_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .args(&self.extra_args)
            .arg("--working-dir")
            .arg(working_dir)
            .arg("--no-interaction")
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut out = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut out);
        }
        out
    })
}

fn wait_with_deadline(
    child: &mut Child,
    timeout: Option<Duration>,
) -> Result<Option<std::process::ExitStatus>, ToolkitError> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

impl Stager for CommandStager {
    fn name(&self) -> &'static str {
        "command"
    }

    fn stage(
        &self,
        args: &[String],
        working_dir: &Path,
        timeout: Option<Duration>,
    ) -> Result<(), ToolkitError> {
        let invocation = format!("{} {}", self.binary, args.join(" "));
        debug!("running {invocation} in {}", working_dir.display());

        let mut child = self
            .build_command(args, working_dir)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ToolkitError::NotFound(self.binary.clone()),
                _ => ToolkitError::Io(e),
            })?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = wait_with_deadline(&mut child, timeout)?;
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        let Some(status) = status else {
            warn!("{invocation} killed after exceeding its timeout");
            return Err(ToolkitError::Timeout {
                operation: invocation,
                seconds: timeout.map_or(0, |t| t.as_secs()),
            });
        };
        if !status.success() {
            return Err(ToolkitError::Failed {
                command: invocation,
                status: status
                    .code()
                    .map_or_else(|| "killed by signal".to_owned(), |c| format!("exit code {c}")),
                stderr: stderr.trim().to_owned(),
            });
        }
        if !stdout.trim().is_empty() {
            debug!("{invocation}: {}", stdout.trim());
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn script(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-pm");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[test]
    fn passes_working_dir_and_no_interaction() {
        let dir = tempfile::tempdir().unwrap();
        let bin = script(dir.path(), "echo \"$@\" > args.txt");
        let stager = CommandStager::new(bin, vec!["--no-progress".to_owned()]);
        stager
            .stage(&["require".to_owned(), "a:2.0".to_owned()], dir.path(), None)
            .unwrap();
        let args = std::fs::read_to_string(dir.path().join("args.txt")).unwrap();
        assert!(args.starts_with("require a:2.0 --no-progress --working-dir"));
        assert!(args.trim_end().ends_with("--no-interaction"));
    }

    #[test]
    fn nonzero_exit_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let bin = script(dir.path(), "echo 'could not resolve' >&2; exit 2");
        let err = CommandStager::new(bin, Vec::new())
            .stage(&["require".to_owned()], dir.path(), None)
            .unwrap_err();
        match err {
            ToolkitError::Failed { status, stderr, .. } => {
                assert_eq!(status, "exit code 2");
                assert_eq!(stderr, "could not resolve");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn slow_command_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let bin = script(dir.path(), "exec sleep 5");
        let err = CommandStager::new(bin, Vec::new())
            .stage(&[], dir.path(), Some(Duration::from_millis(100)))
            .unwrap_err();
        assert!(matches!(err, ToolkitError::Timeout { .. }));
    }

    #[test]
    fn missing_binary_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = CommandStager::new("/no/such/package-manager", Vec::new())
            .stage(&[], dir.path(), None)
            .unwrap_err();
        assert!(matches!(err, ToolkitError::NotFound(_)));
    }
}
