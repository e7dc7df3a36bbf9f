use crate::job::JobDescriptor;
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Why a job execution produced no result.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorFailure {
    Timeout(Duration),
    /// The executor could not be started or died without reporting
    Crashed(String),
    InvalidOutput(String),
    /// The executor ran and reported a job-level error (target missing, blocked, ...)
    Reported(String),
    /// The coordinator refused a heartbeat; the result would be rejected anyway
    LeaseLost(String),
}

impl fmt::Display for ExecutorFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorFailure::Timeout(limit) => write!(f, "timeout after {:?}", limit),
            ExecutorFailure::Crashed(e) => write!(f, "executor crashed: {}", e),
            ExecutorFailure::InvalidOutput(e) => write!(f, "invalid executor output: {}", e),
            ExecutorFailure::Reported(e) => write!(f, "{}", e),
            ExecutorFailure::LeaseLost(e) => write!(f, "lease lost: {}", e),
        }
    }
}

impl std::error::Error for ExecutorFailure {}

/// Per-job extraction logic. Implementations must not hold state between jobs
/// that would change the result of a retry.
pub trait Executor: Send + Sync {
    fn execute(&self, job: &JobDescriptor) -> impl Future<Output = Result<Map<String, Value>, ExecutorFailure>> + Send;
}

/// Runs an external program once per job.
///
/// The job descriptor is written to the child's stdin as JSON. On exit status 0 the
/// child's stdout must hold one JSON object: the result fields. Any other exit is a
/// reported failure carrying the last line of stderr.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    async fn run(&self, job: &JobDescriptor) -> Result<Map<String, Value>, ExecutorFailure> {
        let input = serde_json::to_vec(job).map_err(|e| ExecutorFailure::Crashed(e.to_string()))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("CRAWL_JOB_ID", &job.job_id)
            .env("CRAWL_ENTITY_KEY", &job.entity_key)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorFailure::Crashed(format!("failed to spawn {}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A child that never reads its input closes the pipe early
            match stdin.write_all(&input).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(ExecutorFailure::Crashed(e.to_string())),
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ExecutorFailure::Crashed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
            return Err(match output.status.code() {
                Some(_) if !message.is_empty() => ExecutorFailure::Reported(message.to_string()),
                Some(code) => ExecutorFailure::Reported(format!("exit status {}", code)),
                None => ExecutorFailure::Crashed(format!("terminated by signal: {}", message)),
            });
        }

        parse_output(&output.stdout)
    }
}

fn parse_output(stdout: &[u8]) -> Result<Map<String, Value>, ExecutorFailure> {
    match serde_json::from_slice::<Value>(stdout) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(other) => Err(ExecutorFailure::InvalidOutput(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
        Err(e) => Err(ExecutorFailure::InvalidOutput(e.to_string())),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl Executor for CommandExecutor {
    async fn execute(&self, job: &JobDescriptor) -> Result<Map<String, Value>, ExecutorFailure> {
        self.run(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor() -> JobDescriptor {
        JobDescriptor {
            job_id: "acme::widgets".to_string(),
            entity_key: "acme".to_string(),
            keyword: Some("widgets".to_string()),
            descriptor: Map::new(),
        }
    }

    fn sh(script: &str) -> CommandExecutor {
        CommandExecutor::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn test_parse_output_requires_object() {
        assert_eq!(parse_output(br#"{"name": "Acme"}"#).unwrap()["name"], json!("Acme"));
        assert!(matches!(parse_output(b"[1, 2]"), Err(ExecutorFailure::InvalidOutput(_))));
        assert!(matches!(parse_output(b"not json"), Err(ExecutorFailure::InvalidOutput(_))));
    }

    #[tokio::test]
    async fn test_command_executor_reads_stdin_and_returns_object() {
        let executor = sh(r#"cat > /dev/null; printf '{"entity": "%s"}' "$CRAWL_ENTITY_KEY""#);
        let fields = executor.execute(&descriptor()).await.unwrap();
        assert_eq!(fields["entity"], json!("acme"));
    }

    #[tokio::test]
    async fn test_command_executor_nonzero_exit_is_reported() {
        let executor = sh("echo 'profile not found' >&2; exit 3");
        let failure = executor.execute(&descriptor()).await.unwrap_err();
        assert_eq!(failure, ExecutorFailure::Reported("profile not found".to_string()));
    }

    #[tokio::test]
    async fn test_command_executor_missing_program() {
        let executor = CommandExecutor::new("/nonexistent/crawl-executor", vec![]);
        assert!(matches!(
            executor.execute(&descriptor()).await,
            Err(ExecutorFailure::Crashed(_))
        ));
    }
}
