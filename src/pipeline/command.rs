/// External program invocation
///
/// Wraps the subprocess calls made for spectral fitting and plugin steps,
/// capturing arguments and output for the processing log.

use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExternalToolError {
    #[error("Cannot start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} failed (exit {code:?}): {stderr}")]
    NonZeroExit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("Expected output {0} is missing")]
    MissingOutput(PathBuf),
    #[error("Cannot parse {what}: {message}")]
    Parse { what: String, message: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result of executing an external command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub command_string: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandResult {
    /// Turn a failed run into [`ExternalToolError::NonZeroExit`]
    pub fn check(self, program: &str) -> Result<Self, ExternalToolError> {
        if self.success {
            Ok(self)
        } else {
            Err(ExternalToolError::NonZeroExit {
                program: program.to_string(),
                code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Builder for external commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub description: String,
}

impl ExternalCommand {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            working_dir: None,
            description: String::new(),
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn args<S: AsRef<str>>(mut self, args: &[S]) -> Self {
        self.args.extend(args.iter().map(|s| s.as_ref().to_string()));
        self
    }

    pub fn working_dir(mut self, dir: &Path) -> Self {
        self.working_dir = Some(dir.to_path_buf());
        self
    }

    pub fn describe(mut self, desc: &str) -> Self {
        self.description = desc.to_string();
        self
    }

    /// Build the command string for logging/display
    pub fn to_command_string(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.clone());
        parts.join(" ")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Execute the command without input
    pub fn execute(&self) -> Result<CommandResult, ExternalToolError> {
        self.execute_piped(None)
    }

    /// Execute with `stdin_data` fed to the child's standard input.
    ///
    /// Input is written from a separate thread so a child that produces
    /// output before draining its input cannot deadlock us.
    pub fn execute_piped(&self, stdin_data: Option<&[u8]>) -> Result<CommandResult, ExternalToolError> {
        let mut cmd = self.command();
        cmd.stdin(if stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        log::info!("Executing: {}", self.to_command_string());
        let mut child = cmd.spawn().map_err(|source| ExternalToolError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let stdin = child.stdin.take();
        let output = std::thread::scope(|scope| {
            if let (Some(data), Some(mut stdin)) = (stdin_data, stdin) {
                scope.spawn(move || {
                    // a child that exits early closes the pipe; its exit status tells the story
                    if let Err(e) = stdin.write_all(data) {
                        log::debug!("stdin closed early: {}", e);
                    }
                });
            }
            child.wait_with_output()
        })?;

        let result = CommandResult {
            success: output.status.success(),
            command_string: self.to_command_string(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        };

        if !result.success {
            log::warn!(
                "Command failed (exit {}): {}\nstderr: {}",
                result.exit_code.unwrap_or(-1),
                result.command_string,
                result.stderr
            );
        }
        Ok(result)
    }
}

/// Check if a program can be found on PATH
pub fn check_tool_available(tool: &str) -> bool {
    let path = Path::new(tool);
    if path.components().count() > 1 {
        return path.is_file();
    }
    Command::new("which")
        .arg(tool)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_piped_round_trip() {
        let result = ExternalCommand::new("cat")
            .execute_piped(Some(b"hello"))
            .unwrap();
        assert!(result.success);
        assert_eq!(result.stdout, "hello");
    }

    #[test]
    fn test_non_zero_exit() {
        let result = ExternalCommand::new("sh").args(&["-c", "echo oops >&2; exit 3"]).execute().unwrap();
        let err = result.check("sh").unwrap_err();
        assert!(matches!(err, ExternalToolError::NonZeroExit { code: Some(3), .. }));
    }

    #[test]
    fn test_missing_program() {
        assert!(matches!(
            ExternalCommand::new("/nonexistent/tool").execute(),
            Err(ExternalToolError::Spawn { .. })
        ));
    }
}
