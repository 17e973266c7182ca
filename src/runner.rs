//! Launching the external VASP binary.
//!
//! A job never waits on the simulation blindly: it launches a
//! [`SimulationProcess`], polls it, and may kill it when a monitoring handler
//! fires. [`Launcher`] is the seam that lets tests substitute a scripted
//! process for the real binary.

use crate::naming;
use log::{debug, info};
use std::fs;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use thiserror::Error;

/// Errors raised while launching or supervising the simulation.
#[derive(Error, Debug)]
pub enum RunnerError {
    /// Process could not be spawned, polled or killed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid launch configuration
    #[error("Launch error: {0}")]
    Launch(String),
}

type Result<T> = std::result::Result<T, RunnerError>;

/// A running simulation.
pub trait SimulationProcess {
    /// Returns `Some(success)` once the process has exited, `None` while running.
    fn try_wait(&mut self) -> Result<Option<bool>>;

    /// Terminates the process and reaps it.
    fn kill(&mut self) -> Result<()>;
}

/// Starts simulations in a run directory.
pub trait Launcher {
    /// Starts one simulation in `dir`, with stdout redirected to `output_file`.
    fn launch(&self, dir: &Path, output_file: &str) -> Result<Box<dyn SimulationProcess>>;
}

/// Launches a command line such as `mpirun -np 16 vasp_std`.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    command: Vec<String>,
}

impl CommandLauncher {
    /// Creates a launcher from a whitespace-separated command line.
    pub fn new(command: &str) -> Result<Self> {
        let command: Vec<String> = command.split_whitespace().map(str::to_string).collect();
        if command.is_empty() {
            return Err(RunnerError::Launch("empty VASP command".into()));
        }
        Ok(Self { command })
    }

    /// Creates a launcher from already split arguments.
    pub fn from_args(command: Vec<String>) -> Result<Self> {
        if command.is_empty() {
            return Err(RunnerError::Launch("empty VASP command".into()));
        }
        Ok(Self { command })
    }

    /// The command line being launched.
    pub fn command(&self) -> &[String] {
        &self.command
    }
}

impl Launcher for CommandLauncher {
    fn launch(&self, dir: &Path, output_file: &str) -> Result<Box<dyn SimulationProcess>> {
        let stdout = fs::File::create(dir.join(output_file))?;
        let stderr = fs::File::create(dir.join(naming::STDERR_FILE))?;

        info!("Running {} in {}", self.command.join(" "), dir.display());
        let child = Command::new(&self.command[0])
            .args(&self.command[1..])
            .current_dir(dir)
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()?;
        debug!("Started process {}", child.id());
        Ok(Box::new(ChildProcess { child }))
    }
}

/// [`SimulationProcess`] backed by an OS child process.
struct ChildProcess {
    child: Child,
}

impl SimulationProcess for ChildProcess {
    fn try_wait(&mut self) -> Result<Option<bool>> {
        Ok(self.child.try_wait()?.map(|status| status.success()))
    }

    fn kill(&mut self) -> Result<()> {
        // The process may already have exited between polls.
        if self.child.try_wait()?.is_none() {
            self.child.kill()?;
        }
        self.child.wait()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_command_rejected() {
        assert!(CommandLauncher::new("   ").is_err());
        assert!(CommandLauncher::from_args(Vec::new()).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_launch_redirects_stdout() {
        let tmp = TempDir::new().unwrap();
        let launcher = CommandLauncher::new("echo hello").unwrap();
        let mut process = launcher.launch(tmp.path(), "vasp.out").unwrap();
        let success = loop {
            if let Some(ok) = process.try_wait().unwrap() {
                break ok;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        };
        assert!(success);
        let out = fs::read_to_string(tmp.path().join("vasp.out")).unwrap();
        assert_eq!(out.trim(), "hello");
    }
}
