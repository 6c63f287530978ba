//! External process invocation.
//!
//! Dump and restore tools are reached only through [`ProcessRunner`], so the
//! orchestration logic can be exercised with a scripted runner in tests.

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

/// A fully built command line.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Extra environment for the child (e.g. `PGPASSWORD`); never logged.
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Program and arguments for log lines. Connection URLs passed here are
    /// already stripped of their password.
    pub fn display(&self) -> String {
        std::iter::once(self.program.to_string_lossy().to_string())
            .chain(self.args.iter().map(|a| a.to_string_lossy().to_string()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// `None` when the child was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ProcessError {
    #[error("executable not found: {0}")]
    NotFound(String),

    #[error("timed out after {} seconds", .0.as_secs())]
    Timeout(Duration),

    #[error("failed to run process: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, command: &CommandSpec, timeout: Duration) -> Result<ProcessOutput, ProcessError>;
}

/// Runs commands as real child processes on the tokio runtime.
#[derive(Debug, Default, Clone)]
pub struct SystemProcessRunner;

#[async_trait]
impl ProcessRunner for SystemProcessRunner {
    async fn run(&self, command: &CommandSpec, timeout: Duration) -> Result<ProcessOutput, ProcessError> {
        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ProcessError::NotFound(command.program.display().to_string()),
            _ => ProcessError::Io(e),
        })?;

        // On timeout the child handle is dropped and kill_on_drop terminates it.
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                Ok(ProcessOutput {
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
            Err(_) => {
                tracing::warn!(program = %command.program.display(), timeout_secs = timeout.as_secs(), "Process timed out, killing it");
                Err(ProcessError::Timeout(timeout))
            }
        }
    }
}

/// Cut `message` to at most `max_chars` characters.
pub fn truncate_message(message: &str, max_chars: usize) -> String {
    let trimmed = message.trim();
    match trimmed.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted runner for orchestration tests.

    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub enum Script {
        /// Exit with `code`; on success write `bytes` to the `--file=` target.
        Exit { code: i32, stderr: String, bytes: usize },
        Missing,
        Timeout,
    }

    pub struct FakeRunner {
        script: Mutex<Script>,
        pub calls: Mutex<Vec<CommandSpec>>,
    }

    impl FakeRunner {
        pub fn new(script: Script) -> Self {
            Self {
                script: Mutex::new(script),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn succeeding() -> Self {
            Self::new(Script::Exit { code: 0, stderr: String::new(), bytes: 128 })
        }

        pub fn failing(code: i32, stderr: &str) -> Self {
            Self::new(Script::Exit { code, stderr: stderr.into(), bytes: 0 })
        }

        pub fn set_script(&self, script: Script) {
            *self.script.lock().unwrap() = script;
        }

        pub fn calls(&self) -> Vec<CommandSpec> {
            self.calls.lock().unwrap().clone()
        }

        pub fn args_of(&self, n: usize) -> Vec<String> {
            self.calls()[n].args.iter().map(|a| a.to_string_lossy().to_string()).collect()
        }
    }

    #[async_trait]
    impl ProcessRunner for FakeRunner {
        async fn run(&self, command: &CommandSpec, timeout: Duration) -> Result<ProcessOutput, ProcessError> {
            self.calls.lock().unwrap().push(command.clone());
            let script = self.script.lock().unwrap().clone();
            match script {
                Script::Missing => Err(ProcessError::NotFound(command.program.display().to_string())),
                Script::Timeout => Err(ProcessError::Timeout(timeout)),
                Script::Exit { code, stderr, bytes } => {
                    let target = command
                        .args
                        .iter()
                        .filter_map(|a| a.to_str())
                        .find_map(|a| a.strip_prefix("--file="));
                    if let Some(path) = target {
                        std::fs::write(path, vec![b'x'; bytes])?;
                    }
                    Ok(ProcessOutput {
                        exit_code: Some(code),
                        stdout: if code == 0 { "pg_dump (PostgreSQL) 16.2\n".into() } else { String::new() },
                        stderr,
                    })
                }
            }
        }
    }
}
