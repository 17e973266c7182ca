//! Corrective actions and their application to a run directory.
//!
//! Handlers describe corrections as a list of [`Action`]s. Input mutations
//! (INCAR tags, KPOINTS mesh, POSCAR structure) are applied to an in-memory
//! [`VaspInput`] and written back once, only for files that changed; file
//! operations act directly on the directory in list order.
//!
//! Before a correction cycle touches anything, [`backup`] copies the current
//! inputs and outputs into a fresh `error.<n>/` directory, and every cycle is
//! appended to `corrections.json` by [`append_history`].

use crate::incar::{Incar, IncarValue};
use crate::io::{ParseError, VaspInput};
use crate::kpoints::Kpoints;
use crate::naming;
use crate::structure::Structure;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

type Result<T> = std::result::Result<T, ParseError>;

/// One corrective step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Set an INCAR tag
    SetIncar {
        /// Tag name
        tag: String,
        /// New value
        value: IncarValue,
    },
    /// Replace the KPOINTS file
    SetKpoints {
        /// New mesh
        kpoints: Kpoints,
    },
    /// Replace the POSCAR structure
    SetStructure {
        /// New structure
        structure: Structure,
    },
    /// Delete a file if present
    DeleteFile {
        /// File name relative to the run directory
        file: String,
    },
    /// Copy a file if present
    CopyFile {
        /// Source file name
        from: String,
        /// Destination file name
        to: String,
    },
}

impl Action {
    /// Shorthand for [`Action::SetIncar`].
    pub fn set_incar(tag: &str, value: impl Into<IncarValue>) -> Self {
        Action::SetIncar {
            tag: tag.to_string(),
            value: value.into(),
        }
    }

    /// Shorthand for [`Action::DeleteFile`].
    pub fn delete(file: &str) -> Self {
        Action::DeleteFile {
            file: file.to_string(),
        }
    }

    /// Shorthand for [`Action::CopyFile`].
    pub fn copy(from: &str, to: &str) -> Self {
        Action::CopyFile {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Applies the action to `input`; file actions operate on `dir`.
    pub fn apply(&self, input: &mut VaspInput, dir: &Path) -> Result<()> {
        match self {
            Action::SetIncar { tag, value } => input.incar.set(tag, value.clone()),
            Action::SetKpoints { kpoints } => input.kpoints = kpoints.clone(),
            Action::SetStructure { structure } => input.poscar = structure.clone(),
            Action::DeleteFile { file } => {
                let path = dir.join(file);
                if path.exists() {
                    fs::remove_file(&path)?;
                    debug!("Deleted {}", path.display());
                }
            }
            Action::CopyFile { from, to } => {
                let src = dir.join(from);
                if src.exists() {
                    fs::copy(&src, dir.join(to))?;
                    debug!("Copied {} -> {}", from, to);
                    // Keep the in-memory input in step with the copied file.
                    match to.as_str() {
                        naming::POSCAR => input.poscar = Structure::from_file(&dir.join(to))?,
                        naming::INCAR => input.incar = Incar::from_file(&dir.join(to))?,
                        naming::KPOINTS => input.kpoints = Kpoints::from_file(&dir.join(to))?,
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::SetIncar { tag, value } => write!(f, "INCAR: {} = {}", tag, value),
            Action::SetKpoints { kpoints } => write!(
                f,
                "KPOINTS: {:?} {}x{}x{}",
                kpoints.style, kpoints.mesh[0], kpoints.mesh[1], kpoints.mesh[2]
            ),
            Action::SetStructure { structure } => {
                write!(f, "POSCAR: new structure ({} sites)", structure.num_sites())
            }
            Action::DeleteFile { file } => write!(f, "delete {}", file),
            Action::CopyFile { from, to } => write!(f, "copy {} -> {}", from, to),
        }
    }
}

/// Applies `actions` in order and rewrites the changed input files of `dir`.
///
/// Returns the input-set after all actions.
pub fn apply_actions(dir: &Path, actions: &[Action]) -> Result<VaspInput> {
    let original = VaspInput::from_directory(dir)?;
    let mut input = original.clone();
    let mut on_disk = original;
    for action in actions {
        action.apply(&mut input, dir)?;
        if let Action::CopyFile { .. } = action {
            // A copy already wrote its destination; later diffs start from there.
            on_disk = VaspInput::from_directory(dir)?;
        }
    }
    let written = input.write_changed(&on_disk, dir)?;
    if !written.is_empty() {
        info!("Rewrote {}", written.join(", "));
    }
    Ok(input)
}

/// Copies the present files of `files` into the next free `error.<n>/` directory.
///
/// Returns the backup directory.
pub fn backup(dir: &Path, files: &[String]) -> Result<PathBuf> {
    let mut n = 1;
    let target = loop {
        let candidate = dir.join(naming::error_dir(n));
        if !candidate.exists() {
            break candidate;
        }
        n += 1;
    };
    fs::create_dir_all(&target)?;
    for file in files {
        let src = dir.join(file);
        if src.is_file() {
            fs::copy(&src, target.join(file))?;
        }
    }
    info!("Backed up run files to {}", target.display());
    Ok(target)
}

/// One correction cycle as recorded in `corrections.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionRecord {
    /// Attempt after which the correction was made
    pub attempt: usize,
    /// Handler that produced it
    pub handler: String,
    /// Detected error names
    pub errors: Vec<String>,
    /// Applied actions; `None` when the error was unrecoverable
    pub actions: Option<Vec<Action>>,
}

/// Appends `record` to the `corrections.json` history of `dir`.
pub fn append_history(dir: &Path, record: CorrectionRecord) -> Result<()> {
    let path = dir.join(naming::CORRECTIONS_JSON);
    let mut history = load_history(dir)?;
    history.push(record);
    let json = serde_json::to_string_pretty(&history)
        .map_err(|e| ParseError::Invalid(format!("cannot serialize corrections: {}", e)))?;
    fs::write(path, json)?;
    Ok(())
}

/// Reads the correction history of `dir`; empty when none was written.
pub fn load_history(dir: &Path) -> Result<Vec<CorrectionRecord>> {
    let path = dir.join(naming::CORRECTIONS_JSON);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(&path)?;
    serde_json::from_str(&content)
        .map_err(|e| ParseError::Invalid(format!("{}: {}", path.display(), e)))
}
