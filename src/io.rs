//! Reading and writing the VASP input file set of a run directory.
//!
//! [`VaspInput`] bundles INCAR, KPOINTS and POSCAR so that corrective actions
//! can mutate them together and write back only what changed. POTCAR is
//! treated as an opaque file and never parsed.

use crate::incar::Incar;
use crate::kpoints::Kpoints;
use crate::naming;
use crate::structure::Structure;
use std::path::Path;
use thiserror::Error;

/// Error type for file parsing.
#[derive(Error, Debug)]
pub enum ParseError {
    /// File could not be read or written
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// File content is malformed or unsupported
    #[error("Parse error: {0}")]
    Invalid(String),
    /// A required field is absent from an output file
    #[error("Missing field: {0}")]
    Missing(String),
}

type Result<T> = std::result::Result<T, ParseError>;

/// The three parsed input files of a run directory.
#[derive(Debug, Clone, PartialEq)]
pub struct VaspInput {
    /// Run configuration
    pub incar: Incar,
    /// k-point mesh
    pub kpoints: Kpoints,
    /// Input structure
    pub poscar: Structure,
}

impl VaspInput {
    /// Loads INCAR, KPOINTS and POSCAR from `dir`.
    pub fn from_directory(dir: &Path) -> Result<Self> {
        Ok(Self {
            incar: Incar::from_file(&dir.join(naming::INCAR))?,
            kpoints: Kpoints::from_file(&dir.join(naming::KPOINTS))?,
            poscar: Structure::from_file(&dir.join(naming::POSCAR))?,
        })
    }

    /// Writes INCAR, KPOINTS and POSCAR into `dir`.
    pub fn write_input(&self, dir: &Path) -> Result<()> {
        self.incar.write_file(&dir.join(naming::INCAR))?;
        self.kpoints.write_file(&dir.join(naming::KPOINTS))?;
        self.poscar.write_file(&dir.join(naming::POSCAR))?;
        Ok(())
    }

    /// Writes only the files that differ from `original`.
    ///
    /// Returns the names of the rewritten files.
    pub fn write_changed(&self, original: &VaspInput, dir: &Path) -> Result<Vec<&'static str>> {
        let mut written = Vec::new();
        if self.incar != original.incar {
            self.incar.write_file(&dir.join(naming::INCAR))?;
            written.push(naming::INCAR);
        }
        if self.kpoints != original.kpoints {
            self.kpoints.write_file(&dir.join(naming::KPOINTS))?;
            written.push(naming::KPOINTS);
        }
        if self.poscar != original.poscar {
            self.poscar.write_file(&dir.join(naming::POSCAR))?;
            written.push(naming::POSCAR);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_inputs(dir: &Path) {
        fs::write(dir.join("INCAR"), "ISMEAR = -5\nNSW = 50\n").unwrap();
        fs::write(dir.join("KPOINTS"), "mesh\n0\nMonkhorst\n4 4 4\n0 0 0\n").unwrap();
        fs::write(
            dir.join("POSCAR"),
            "H\n1.0\n3 0 0\n0 3 0\n0 0 3\nH\n1\nDirect\n0 0 0\n",
        )
        .unwrap();
    }

    #[test]
    fn test_from_directory() {
        let tmp = TempDir::new().unwrap();
        write_inputs(tmp.path());
        let vi = VaspInput::from_directory(tmp.path()).unwrap();
        assert_eq!(vi.incar.get_i64("NSW", 0), 50);
        assert_eq!(vi.kpoints.mesh, [4, 4, 4]);
        assert_eq!(vi.poscar.num_sites(), 1);
    }

    #[test]
    fn test_write_changed_only_touches_modified_files() {
        let tmp = TempDir::new().unwrap();
        write_inputs(tmp.path());
        let original = VaspInput::from_directory(tmp.path()).unwrap();
        let mut modified = original.clone();
        modified.incar.set("ISMEAR", 0);

        let written = modified.write_changed(&original, tmp.path()).unwrap();
        assert_eq!(written, vec!["INCAR"]);
        let kpoints = fs::read_to_string(tmp.path().join("KPOINTS")).unwrap();
        assert!(kpoints.starts_with("mesh"));
        let incar = Incar::from_file(&tmp.path().join("INCAR")).unwrap();
        assert_eq!(incar.get_i64("ISMEAR", -5), 0);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let tmp = TempDir::new().unwrap();
        let err = VaspInput::from_directory(tmp.path()).unwrap_err();
        assert!(matches!(err, ParseError::Io(_)));
    }
}
