//! Game runner seam.
//!
//! The core never launches the game itself; the embedder supplies a
//! [`GameRunner`] at construction. [`CommandRunner`] is the default
//! process-spawning adapter.

use std::path::PathBuf;
use std::process::{Child, Command};

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::protocol::RunStatus;

/// Parameters of a start-application request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunParameters {
    /// Engine-specific configuration blob, passed through untouched.
    pub game_config: String,
    pub profile_name: String,
    /// Command-line arguments, whitespace separated.
    pub arguments: String,
}

impl RunParameters {
    pub fn new(
        game_config: impl Into<String>,
        profile_name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            game_config: game_config.into(),
            profile_name: profile_name.into(),
            arguments: arguments.into(),
        }
    }
}

/// Start, stop, kill and poll the game process.
pub trait GameRunner: Send {
    fn run(&mut self, params: &RunParameters) -> Result<()>;
    /// Ask the application to close.
    fn stop(&mut self);
    /// Terminate the application process.
    fn kill(&mut self);
    fn poll(&mut self) -> RunStatus;
}

/// Runner that launches nothing; it only tracks the requested state.
#[derive(Debug, Default)]
pub struct NullRunner {
    running: bool,
}

impl NullRunner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GameRunner for NullRunner {
    fn run(&mut self, params: &RunParameters) -> Result<()> {
        info!(profile = %params.profile_name, "null runner start");
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn kill(&mut self) {
        self.running = false;
    }

    fn poll(&mut self) -> RunStatus {
        if self.running {
            RunStatus::Running
        } else {
            RunStatus::Stopped
        }
    }
}

/// Runner that spawns a configured executable with the request's
/// arguments. A close request falls back to terminating the process.
#[derive(Debug)]
pub struct CommandRunner {
    program: PathBuf,
    child: Option<Child>,
}

impl CommandRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            child: None,
        }
    }
}

impl GameRunner for CommandRunner {
    fn run(&mut self, params: &RunParameters) -> Result<()> {
        if self.poll() == RunStatus::Running {
            return Err(Error::Config("application already running".into()));
        }
        let mut command = Command::new(&self.program);
        if !params.arguments.is_empty() {
            command.args(params.arguments.split_whitespace());
        }
        let child = command.spawn()?;
        info!(
            program = %self.program.display(),
            profile = %params.profile_name,
            pid = child.id(),
            "application started"
        );
        self.child = Some(child);
        Ok(())
    }

    fn stop(&mut self) {
        self.kill();
    }

    fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                warn!(error = %e, "failed to kill application");
            }
            let _ = child.wait();
        }
    }

    fn poll(&mut self) -> RunStatus {
        let Some(child) = self.child.as_mut() else {
            return RunStatus::Stopped;
        };
        match child.try_wait() {
            Ok(None) => RunStatus::Running,
            Ok(Some(status)) => {
                info!(%status, "application exited");
                self.child = None;
                RunStatus::Stopped
            }
            Err(e) => {
                warn!(error = %e, "failed to poll application");
                self.child = None;
                RunStatus::Stopped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_runner_lifecycle() {
        let mut runner = NullRunner::new();
        assert_eq!(runner.poll(), RunStatus::Stopped);

        runner.run(&RunParameters::new("", "default", "")).unwrap();
        assert_eq!(runner.poll(), RunStatus::Running);

        runner.stop();
        assert_eq!(runner.poll(), RunStatus::Stopped);
    }

    #[cfg(unix)]
    #[test]
    fn test_command_runner_spawn_and_kill() {
        let mut runner = CommandRunner::new("/bin/sleep");
        runner.run(&RunParameters::new("", "default", "30")).unwrap();
        assert_eq!(runner.poll(), RunStatus::Running);

        assert!(runner.run(&RunParameters::new("", "default", "30")).is_err());

        runner.kill();
        assert_eq!(runner.poll(), RunStatus::Stopped);
    }
}
