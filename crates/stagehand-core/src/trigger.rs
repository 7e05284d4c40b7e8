//! Hand-off of post-apply work to a fresh execution context.
//!
//! After a commit the running process still has the old code loaded, so
//! deferred tasks run somewhere else: a new process, a web request, or (in
//! tests and single-binary deployments) a plain function call.

use crate::{StageError, TriggerError};
use serde::{Deserialize, Serialize};
use stagehand_store::StageId;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, info};

/// What the continuation needs to re-claim the applied stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Continuation {
    pub stage_id: StageId,
    pub key: String,
}

pub trait ContinuationTrigger: Send + Sync {
    fn name(&self) -> &'static str;

    fn trigger(&self, continuation: &Continuation) -> Result<(), TriggerError>;
}

type Handler = dyn Fn(&Continuation) -> Result<(), StageError> + Send + Sync;

/// Runs the continuation in the calling process.
pub struct InProcessTrigger {
    handler: Arc<Handler>,
}

impl InProcessTrigger {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&Continuation) -> Result<(), StageError> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
        }
    }
}

impl ContinuationTrigger for InProcessTrigger {
    fn name(&self) -> &'static str {
        "in_process"
    }

    fn trigger(&self, continuation: &Continuation) -> Result<(), TriggerError> {
        (self.handler)(continuation).map_err(|e| TriggerError::Handler(e.to_string()))
    }
}

/// Spawns `program [args] post-apply --stage-id <id> --key <key>` and waits.
pub struct CommandTrigger {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandTrigger {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-invoke the current executable.
    pub fn current_exe(args: Vec<String>) -> Result<Self, TriggerError> {
        Ok(Self::new(std::env::current_exe()?, args))
    }
}

impl ContinuationTrigger for CommandTrigger {
    fn name(&self) -> &'static str {
        "command"
    }

    fn trigger(&self, continuation: &Continuation) -> Result<(), TriggerError> {
        debug!(
            "continuation command: {} {:?} post-apply --stage-id {}",
            self.program.display(),
            self.args,
            continuation.stage_id
        );
        let output = Command::new(&self.program)
            .args(&self.args)
            .args(["post-apply", "--stage-id", continuation.stage_id.as_str()])
            .args(["--key", continuation.key.as_str()])
            .output()?;
        if !output.status.success() {
            return Err(TriggerError::Command {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        info!("continuation process finished for stage {}", continuation.stage_id);
        Ok(())
    }
}

/// POSTs the continuation as JSON to a web endpoint that runs post-apply.
pub struct HttpTrigger {
    url: String,
    agent: ureq::Agent,
}

impl HttpTrigger {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            agent: ureq::Agent::new_with_defaults(),
        }
    }
}

impl ContinuationTrigger for HttpTrigger {
    fn name(&self) -> &'static str {
        "http"
    }

    fn trigger(&self, continuation: &Continuation) -> Result<(), TriggerError> {
        let body = serde_json::to_vec(continuation)?;
        self.agent
            .post(&self.url)
            .header("Content-Type", "application/json")
            .send(&body[..])
            .map_err(|e| TriggerError::Http(e.to_string()))?;
        info!("continuation posted to {} for stage {}", self.url, continuation.stage_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::Mutex;

    fn continuation() -> Continuation {
        Continuation {
            stage_id: StageId::new("0123abcd"),
            key: "k3y".to_owned(),
        }
    }

    #[test]
    fn in_process_passes_continuation() {
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let trigger = InProcessTrigger::new(move |c| {
            *sink.lock().unwrap() = Some(c.clone());
            Ok(())
        });
        trigger.trigger(&continuation()).unwrap();
        assert_eq!(seen.lock().unwrap().as_ref(), Some(&continuation()));
    }

    #[test]
    fn in_process_error_becomes_handler_error() {
        let trigger =
            InProcessTrigger::new(|_| Err(StageError::InvalidState("boom".to_owned())));
        let err = trigger.trigger(&continuation()).unwrap_err();
        assert!(matches!(err, TriggerError::Handler(ref m) if m == "boom"));
    }

    #[cfg(unix)]
    #[test]
    fn command_receives_stage_and_key() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("args");
        let trigger = CommandTrigger::new(
            "sh",
            vec![
                "-c".to_owned(),
                format!("echo \"$@\" > {}", out.display()),
                "sh".to_owned(),
            ],
        );
        trigger.trigger(&continuation()).unwrap();
        let args = std::fs::read_to_string(&out).unwrap();
        assert_eq!(args.trim(), "post-apply --stage-id 0123abcd --key k3y");
    }

    #[cfg(unix)]
    #[test]
    fn command_failure_reports_stderr() {
        let trigger = CommandTrigger::new(
            "sh",
            vec!["-c".to_owned(), "echo nope >&2; exit 3".to_owned(), "sh".to_owned()],
        );
        let err = trigger.trigger(&continuation()).unwrap_err();
        assert!(matches!(err, TriggerError::Command { ref stderr, .. } if stderr == "nope"));
    }

    #[test]
    fn http_posts_json_body() {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let url = format!("http://{}/continue", server.server_addr().to_ip().unwrap());
        let handle = std::thread::spawn(move || {
            let mut request = server.recv().unwrap();
            let mut body = String::new();
            request.as_reader().read_to_string(&mut body).unwrap();
            let method = request.method().to_string();
            request
                .respond(tiny_http::Response::from_string("ok"))
                .unwrap();
            (method, body)
        });

        HttpTrigger::new(url).trigger(&continuation()).unwrap();
        let (method, body) = handle.join().unwrap();
        assert_eq!(method, "POST");
        let sent: Continuation = serde_json::from_str(&body).unwrap();
        assert_eq!(sent, continuation());
    }

    #[test]
    fn http_connection_refused_is_error() {
        let err = HttpTrigger::new("http://127.0.0.1:1/continue")
            .trigger(&continuation())
            .unwrap_err();
        assert!(matches!(err, TriggerError::Http(_)));
    }
}
