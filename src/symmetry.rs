//! Space-group determination.
//!
//! Symmetry analysis is delegated to an external collaborator behind the
//! [`SymmetryAnalyzer`] trait. The production implementation pipes the
//! structure as POSCAR text into a helper program that prints the space-group
//! number:
//!
//! ```text
//! $ sgnum --symprec 0.01 --angle-tolerance 5 < POSCAR
//! 225
//! ```

use crate::structure::Structure;
use log::debug;
use std::io::Write;
use std::process::{Command, Stdio};
use thiserror::Error;

/// Errors raised while determining a space group.
#[derive(Error, Debug)]
pub enum SymmetryError {
    /// The helper program could not be started or fed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The helper failed or printed no space-group number
    #[error("Symmetry analysis failed: {0}")]
    Analysis(String),
}

type Result<T> = std::result::Result<T, SymmetryError>;

/// Maps a structure to its space-group number (1..=230).
pub trait SymmetryAnalyzer {
    /// Returns the space-group number of `structure`.
    ///
    /// `symprec` is the distance tolerance in Å and `angle_tolerance` the
    /// angle tolerance in degrees.
    fn space_group(&self, structure: &Structure, symprec: f64, angle_tolerance: f64)
        -> Result<u32>;
}

/// Runs an external program to find the space group.
#[derive(Debug, Clone)]
pub struct CommandSymmetryAnalyzer {
    command: String,
}

impl CommandSymmetryAnalyzer {
    /// Creates an analyzer that invokes `command` (may include arguments).
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
        }
    }
}

impl SymmetryAnalyzer for CommandSymmetryAnalyzer {
    fn space_group(
        &self,
        structure: &Structure,
        symprec: f64,
        angle_tolerance: f64,
    ) -> Result<u32> {
        let mut parts = self.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| SymmetryError::Analysis("empty symmetry command".into()))?;

        let mut child = Command::new(program)
            .args(parts)
            .arg("--symprec")
            .arg(symprec.to_string())
            .arg("--angle-tolerance")
            .arg(angle_tolerance.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(structure.to_poscar_string().as_bytes())?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(SymmetryError::Analysis(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let number = parse_space_group(&stdout)?;
        debug!("Space group {} (symprec={}, angle_tolerance={})", number, symprec, angle_tolerance);
        Ok(number)
    }
}

/// Extracts the last integer token in 1..=230 from helper output.
fn parse_space_group(output: &str) -> Result<u32> {
    output
        .split(|c: char| !c.is_ascii_digit())
        .filter_map(|tok| tok.parse::<u32>().ok())
        .filter(|n| (1..=230).contains(n))
        .last()
        .ok_or_else(|| {
            SymmetryError::Analysis(format!("no space-group number in output: {}", output.trim()))
        })
}
