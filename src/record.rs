//! Record of one finished structure optimization.
//!
//! A [`RunRecord`] is built once a relaxation has converged and its outputs
//! have been tagged `.finish`. It is written to `structure_opt.json` in the run
//! directory and never modified afterwards; the k-point loop links records
//! through `prev_record_id`.

use crate::config::InputSetRecord;
use crate::io::ParseError;
use crate::kpoints::Kpoints;
use crate::naming::{self, FileNaming};
use crate::parser::Oszicar;
use crate::structure::Structure;
use crate::symmetry::{SymmetryAnalyzer, SymmetryError};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while building or persisting a [`RunRecord`].
#[derive(Error, Debug)]
pub enum RecordError {
    /// File access failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// An input or output file could not be parsed
    #[error("{0}")]
    Parse(#[from] ParseError),
    /// Space-group determination failed
    #[error("{0}")]
    Symmetry(#[from] SymmetryError),
    /// `structure_opt.json` could not be (de)serialized
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// OSZICAR holds no ionic step
    #[error("No final energy in {0}")]
    MissingEnergy(String),
}

type Result<T> = std::result::Result<T, RecordError>;

/// Immutable summary of one converged relaxation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Identity of this record
    pub id: Uuid,
    /// Record this run started from, if any
    pub prev_record_id: Option<Uuid>,
    /// Final energy divided by the number of atoms, in eV
    pub energy_per_atom: f64,
    /// k-point mesh used
    pub kpt_mesh: [u32; 3],
    /// k-point density the mesh was generated from
    pub kpt_density: Option<f64>,
    /// Relaxed structure
    pub final_structure: Structure,
    /// Space group of the relaxed structure
    pub final_sg: u32,
    /// Structure the run started from
    pub initial_structure: Option<Structure>,
    /// Space group of the starting structure
    pub initial_sg: Option<u32>,
}

impl RunRecord {
    /// Whether the relaxation changed the space group.
    ///
    /// An unknown initial space group counts as unchanged.
    pub fn is_symmetry_changed(&self) -> bool {
        self.initial_sg.map_or(false, |sg| sg != self.final_sg)
    }

    /// Directory name the run is archived under, e.g. `kpt7x7x7_pre-sg225_pos-sg225`.
    pub fn dirname(&self) -> String {
        naming::kpt_dirname(self.kpt_mesh, self.initial_sg, self.final_sg)
    }

    /// Builds the record of the finished run in `dir`.
    ///
    /// Reads `KPOINTS`, `CONTCAR.finish`, the last `E0` of `OSZICAR` and
    /// `vise.json`. With a previous record the initial structure and space
    /// group are taken over from it; otherwise `POSCAR.orig` is analyzed.
    pub fn from_dir(
        dir: &Path,
        naming: &FileNaming,
        analyzer: &dyn SymmetryAnalyzer,
        symprec: f64,
        angle_tolerance: f64,
        prev: Option<&RunRecord>,
    ) -> Result<Self> {
        let kpoints = Kpoints::from_file(&dir.join(naming::KPOINTS))?;

        let kpt_density = match InputSetRecord::load(dir) {
            Ok(record) => Some(record.kpt_density),
            Err(e) => {
                warn!("Cannot read {} in {}: {}", naming::VISE_JSON, dir.display(), e);
                None
            }
        };

        let final_structure = Structure::from_file(&dir.join(naming.finish(naming::CONTCAR)))?;
        let final_sg = analyzer.space_group(&final_structure, symprec, angle_tolerance)?;

        let oszicar = Oszicar::from_file(&dir.join(naming::OSZICAR))?;
        let energy = oszicar
            .final_energy()
            .ok_or_else(|| RecordError::MissingEnergy(dir.display().to_string()))?;
        let energy_per_atom = energy / final_structure.num_sites().max(1) as f64;

        let (initial_structure, initial_sg, prev_record_id) = match prev {
            Some(prev) => (
                Some(prev.final_structure.clone()),
                Some(prev.final_sg),
                Some(prev.id),
            ),
            None => {
                let initial = Structure::from_file(&dir.join(naming.orig(naming::POSCAR)))?;
                let sg = analyzer.space_group(&initial, symprec, angle_tolerance)?;
                (Some(initial), Some(sg), None)
            }
        };

        Ok(Self {
            id: Uuid::new_v4(),
            prev_record_id,
            energy_per_atom,
            kpt_mesh: kpoints.mesh,
            kpt_density,
            final_structure,
            final_sg,
            initial_structure,
            initial_sg,
        })
    }

    /// Writes the record to `structure_opt.json` in `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(dir.join(naming::STRUCTURE_OPT_JSON), json)?;
        info!("Saved run record {} to {}", self.id, dir.display());
        Ok(())
    }

    /// Reads the record saved in `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        Self::load_file(&dir.join(naming::STRUCTURE_OPT_JSON))
    }

    /// Reads a record from a JSON file.
    pub fn load_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl fmt::Display for RunRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sg = |sg: Option<u32>| sg.map_or_else(|| "-".to_string(), |n| n.to_string());
        writeln!(f, "Run record {}", self.id)?;
        writeln!(f, "  Formula:          {}", self.final_structure.formula())?;
        writeln!(
            f,
            "  k-point mesh:     {}x{}x{}",
            self.kpt_mesh[0], self.kpt_mesh[1], self.kpt_mesh[2]
        )?;
        if let Some(density) = self.kpt_density {
            writeln!(f, "  k-point density:  {:.3}", density)?;
        }
        writeln!(f, "  Energy per atom:  {:.6} eV", self.energy_per_atom)?;
        write!(f, "  Space group:      {} -> {}", sg(self.initial_sg), self.final_sg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symmetry::SymmetryError;
    use nalgebra::Matrix3;
    use tempfile::TempDir;

    struct FixedSg(u32);

    impl SymmetryAnalyzer for FixedSg {
        fn space_group(
            &self,
            _structure: &Structure,
            _symprec: f64,
            _angle_tolerance: f64,
        ) -> std::result::Result<u32, SymmetryError> {
            Ok(self.0)
        }
    }

    fn record(initial_sg: Option<u32>, final_sg: u32) -> RunRecord {
        let structure = Structure::new(
            Matrix3::identity() * 4.2,
            vec!["Mg".to_string(), "O".to_string()],
            vec![[0.0, 0.0, 0.0], [0.5, 0.5, 0.5]],
        );
        RunRecord {
            id: Uuid::new_v4(),
            prev_record_id: None,
            energy_per_atom: -5.9558474,
            kpt_mesh: [7, 7, 7],
            kpt_density: Some(2.5),
            final_structure: structure.clone(),
            final_sg,
            initial_structure: Some(structure),
            initial_sg,
        }
    }

    #[test]
    fn test_symmetry_changed() {
        assert!(!record(Some(225), 225).is_symmetry_changed());
        assert!(record(Some(225), 227).is_symmetry_changed());
        assert!(!record(None, 227).is_symmetry_changed());
    }

    #[test]
    fn test_dirname() {
        assert_eq!(record(Some(225), 221).dirname(), "kpt7x7x7_pre-sg225_pos-sg221");
    }

    #[test]
    fn test_save_load() {
        let tmp = TempDir::new().unwrap();
        let mut r = record(Some(225), 225);
        r.prev_record_id = Some(Uuid::new_v4());
        r.final_structure.lattice[(0, 1)] = 0.123456789012345;
        r.save(tmp.path()).unwrap();
        assert_eq!(RunRecord::load(tmp.path()).unwrap(), r);
    }

    #[test]
    fn test_from_dir() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        let poscar = "MgO\n1.0\n4.2 0 0\n0 4.2 0\n0 0 4.2\nMg O\n1 1\nDirect\n0 0 0\n0.5 0.5 0.5\n";
        fs::write(dir.join("POSCAR.orig"), poscar).unwrap();
        fs::write(dir.join("CONTCAR.finish"), poscar).unwrap();
        fs::write(dir.join("KPOINTS"), "mesh\n0\nGamma\n7 7 7\n0 0 0\n").unwrap();
        fs::write(
            dir.join("OSZICAR"),
            "DAV:   1    -0.1E+02   0.1\n   1 F= -.1191E+02 E0= -.1191E+02  d E =-.1E+02\n",
        )
        .unwrap();
        let naming = FileNaming::new("vasp.out");

        let first = RunRecord::from_dir(dir, &naming, &FixedSg(225), 0.01, 5.0, None).unwrap();
        assert_eq!(first.kpt_mesh, [7, 7, 7]);
        assert_eq!(first.kpt_density, None);
        assert_eq!(first.initial_sg, Some(225));
        assert!((first.energy_per_atom + 5.955).abs() < 1e-9);

        InputSetRecord {
            kpt_density: 2.5,
            symprec: 0.01,
            angle_tolerance: 5.0,
            standardized: true,
        }
        .write(dir)
        .unwrap();
        let second =
            RunRecord::from_dir(dir, &naming, &FixedSg(221), 0.01, 5.0, Some(&first)).unwrap();
        assert_eq!(second.prev_record_id, Some(first.id));
        assert_eq!(second.initial_sg, Some(225));
        assert_eq!(second.kpt_density, Some(2.5));
        assert!(second.is_symmetry_changed());
    }
}
