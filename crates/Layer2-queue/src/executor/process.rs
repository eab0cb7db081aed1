//! Process executor - runs the agent CLI as a child process
//!
//! The task and every option are turned into command-line arguments:
//! `<agent command> <task text | --file path> --<option-key> <value> ...`.
//! Stdout is inherited so agent progress stays visible; stderr is streamed
//! through and its tail is kept for the failure message.

use crate::command::{OptionValue, ResultRefs, TaskSource};
use crate::executor::{ExecutionOutcome, ExecutionRequest, Executor};
use agentq_foundation::{Error, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tracing::{debug, info, warn};

/// Stderr lines kept for the failure message
const STDERR_TAIL_LINES: usize = 20;

const STDERR_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Options whose values name output files, and the result ref each becomes
const RESULT_OPTIONS: [(&str, &str); 2] = [("trajectory_file", "trajectory"), ("patch_path", "patch")];

/// Executor that launches an external agent program
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: String,
    args: Vec<String>,
}

impl ProcessExecutor {
    /// `command` is the program followed by its leading arguments
    pub fn new<I, S>(command: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut parts = command.into_iter().map(Into::into);
        let program = parts
            .next()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| Error::Config("agentCommand must name a program".to_string()))?;

        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    /// Build the child command without spawning it
    pub fn build_command(&self, request: &ExecutionRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        match &request.task {
            TaskSource::Text(text) => {
                cmd.arg(text);
            }
            TaskSource::File(path) => {
                cmd.arg("--file").arg(path);
            }
        }

        for (key, value) in request.options.iter() {
            let flag = format!("--{}", key.replace('_', "-"));
            match value {
                OptionValue::Bool(true) => {
                    cmd.arg(flag);
                }
                OptionValue::Bool(false) => {}
                other => {
                    cmd.arg(flag).arg(other.to_string());
                }
            }
        }

        cmd.current_dir(&request.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn result_refs(request: &ExecutionRequest) -> ResultRefs {
        RESULT_OPTIONS
            .iter()
            .filter_map(|(option, name)| {
                let value = request.options.get_str(option)?;
                if value.is_empty() {
                    return None;
                }
                let path = Path::new(value);
                let location = if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    request.working_directory.join(path)
                };
                Some((name.to_string(), location.display().to_string()))
            })
            .collect()
    }
}

/// Echo the child's stderr and keep its last lines.
///
/// Reads until EOF whatever the bytes are, so the pipe stays open for the
/// child's whole lifetime.
async fn drain_stderr(stderr: ChildStderr) -> VecDeque<String> {
    let mut reader = BufReader::new(stderr);
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                eprintln!("{}", line);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // keep reading: dropping the pipe would kill the child on its next write
                warn!("Error reading agent stderr: {}", e);
                tokio::time::sleep(STDERR_RETRY_DELAY).await;
            }
        }
    }
    tail
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome> {
        if !request.working_directory.is_dir() {
            return Err(Error::Execution(format!(
                "working directory {} does not exist",
                request.working_directory.display()
            )));
        }
        if let TaskSource::File(path) = &request.task {
            if !path.is_file() {
                return Err(Error::Execution(format!(
                    "task file {} no longer exists",
                    path.display()
                )));
            }
        }

        let mut cmd = self.build_command(request);
        debug!(
            "Launching {} in {}",
            self.program,
            request.working_directory.display()
        );

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Execution(format!("failed to spawn {}: {}", self.program, e)))?;

        let tail = match child.stderr.take() {
            Some(stderr) => drain_stderr(stderr).await,
            None => VecDeque::new(),
        };

        let status = child
            .wait()
            .await
            .map_err(|e| Error::Execution(format!("failed to wait for {}: {}", self.program, e)))?;

        if status.success() {
            info!("{} finished successfully", self.program);
            return Ok(ExecutionOutcome {
                result_refs: Self::result_refs(request),
            });
        }

        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        warn!("{} exited with {}", self.program, code);

        let mut message = format!("{} exited with status {}", self.program, code);
        if !tail.is_empty() {
            message.push_str(": ");
            message.push_str(&Vec::from(tail).join("\n"));
        }
        Err(Error::Execution(message))
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOptions;
    use std::ffi::OsStr;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a: &OsStr| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(matches!(
            ProcessExecutor::new(Vec::<String>::new()),
            Err(Error::Config(_))
        ));
        assert!(ProcessExecutor::new([" "]).is_err());
    }

    #[test]
    fn test_build_command_arguments() {
        let executor = ProcessExecutor::new(["trae-cli", "run"]).unwrap();
        let request = ExecutionRequest::direct(
            TaskSource::Text("fix the bug".into()),
            PathBuf::from("/work"),
            CommandOptions::new()
                .with("model", "gpt-4o")
                .with("max_steps", 20u32)
                .with("must_patch", true)
                .with("verbose", false),
        );

        let cmd = executor.build_command(&request);
        assert_eq!(cmd.as_std().get_program(), "trae-cli");
        assert_eq!(
            args_of(&cmd),
            vec![
                "run",
                "fix the bug",
                "--max-steps",
                "20",
                "--model",
                "gpt-4o",
                "--must-patch",
            ]
        );
        assert_eq!(cmd.as_std().get_current_dir(), Some(Path::new("/work")));
    }

    #[test]
    fn test_build_command_task_file() {
        let executor = ProcessExecutor::new(["agent"]).unwrap();
        let request = ExecutionRequest::direct(
            TaskSource::File(PathBuf::from("/work/task.md")),
            PathBuf::from("/work"),
            CommandOptions::new(),
        );

        assert_eq!(
            args_of(&executor.build_command(&request)),
            vec!["--file", "/work/task.md"]
        );
    }

    #[test]
    fn test_result_refs_resolved_against_working_directory() {
        let request = ExecutionRequest::direct(
            TaskSource::Text("t".into()),
            PathBuf::from("/work"),
            CommandOptions::new()
                .with("trajectory_file", "traj.json")
                .with("patch_path", "/tmp/out.patch"),
        );

        let refs = ProcessExecutor::result_refs(&request);
        assert_eq!(refs.get("trajectory").map(String::as_str), Some("/work/traj.json"));
        assert_eq!(refs.get("patch").map(String::as_str), Some("/tmp/out.patch"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_success_and_failure() {
        let temp = TempDir::new().unwrap();
        // $0 is "agent", $1 is the task text
        let executor =
            ProcessExecutor::new(["sh", "-c", "echo working >&2; test \"$1\" = ok", "agent"])
                .unwrap();

        let ok = ExecutionRequest::direct(
            TaskSource::Text("ok".into()),
            temp.path().to_path_buf(),
            CommandOptions::new(),
        );
        assert!(executor.execute(&ok).await.is_ok());

        let bad = ExecutionRequest::direct(
            TaskSource::Text("nope".into()),
            temp.path().to_path_buf(),
            CommandOptions::new(),
        );
        match executor.execute(&bad).await {
            Err(Error::Execution(msg)) => {
                assert!(msg.contains("status 1"));
                assert!(msg.contains("working"));
            }
            other => panic!("expected execution error, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_survives_non_utf8_stderr() {
        let temp = TempDir::new().unwrap();
        let executor = ProcessExecutor::new([
            "sh",
            "-c",
            "printf '\\377\\n' >&2; sleep 0.3; echo still-working >&2; exit 0",
            "agent",
        ])
        .unwrap();

        let request = ExecutionRequest::direct(
            TaskSource::Text("t".into()),
            temp.path().to_path_buf(),
            CommandOptions::new(),
        );
        assert!(executor.execute(&request).await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failure_tail_is_lossy_utf8() {
        let temp = TempDir::new().unwrap();
        let executor = ProcessExecutor::new([
            "sh",
            "-c",
            "printf 'bad \\377 byte\\n' >&2; echo last-line >&2; exit 3",
            "agent",
        ])
        .unwrap();

        let request = ExecutionRequest::direct(
            TaskSource::Text("t".into()),
            temp.path().to_path_buf(),
            CommandOptions::new(),
        );
        match executor.execute(&request).await {
            Err(Error::Execution(msg)) => {
                assert!(msg.contains("status 3"));
                assert!(msg.contains("bad \u{FFFD} byte"));
                assert!(msg.contains("last-line"));
            }
            other => panic!("expected execution error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_execute_missing_working_directory() {
        let executor = ProcessExecutor::new(["agent"]).unwrap();
        let request = ExecutionRequest::direct(
            TaskSource::Text("t".into()),
            PathBuf::from("/definitely/not/here"),
            CommandOptions::new(),
        );

        assert!(matches!(
            executor.execute(&request).await,
            Err(Error::Execution(_))
        ));
    }

    #[tokio::test]
    async fn test_execute_spawn_failure() {
        let temp = TempDir::new().unwrap();
        let executor = ProcessExecutor::new(["agentq-no-such-program"]).unwrap();
        let request = ExecutionRequest::direct(
            TaskSource::Text("t".into()),
            temp.path().to_path_buf(),
            CommandOptions::new(),
        );

        match executor.execute(&request).await {
            Err(Error::Execution(msg)) => assert!(msg.contains("failed to spawn")),
            other => panic!("expected spawn failure, got {:?}", other),
        }
    }
}
