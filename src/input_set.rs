//! Generation of VASP inputs for one k-point set.
//!
//! The k-point loop asks an [`InputGenerator`] for a complete input set at a
//! given k-point density. [`TemplateInputGenerator`] keeps the INCAR and
//! POTCAR found in the working directory when the loop starts and combines
//! them with a new structure and mesh; richer generators (functional presets,
//! MAGMOM handling) can be plugged in behind the same trait.

use crate::config::InputSetRecord;
use crate::incar::Incar;
use crate::io::ParseError;
use crate::kpoints::Kpoints;
use crate::naming;
use crate::structure::Structure;
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};

type Result<T> = std::result::Result<T, ParseError>;

/// What to generate.
#[derive(Debug, Clone)]
pub struct InputRequest {
    /// Structure written to POSCAR
    pub structure: Structure,
    /// k-point density the mesh is derived from
    pub kpt_density: f64,
    /// Standardize the structure before writing it
    pub standardize: bool,
    /// Finished run whose INCAR is carried over
    pub prev_dir: Option<PathBuf>,
}

/// Writes complete VASP input sets.
pub trait InputGenerator {
    /// Writes INCAR, KPOINTS, POSCAR, POTCAR and `vise.json` into `dir`.
    ///
    /// Returns the generated mesh.
    fn generate(&self, request: &InputRequest, dir: &Path) -> Result<Kpoints>;
}

/// Reuses the starting INCAR and POTCAR for every k-point set.
#[derive(Debug, Clone)]
pub struct TemplateInputGenerator {
    incar: Incar,
    potcar: Option<Vec<u8>>,
    symprec: f64,
    angle_tolerance: f64,
}

impl TemplateInputGenerator {
    /// Creates a generator from explicit templates.
    pub fn new(incar: Incar, potcar: Option<Vec<u8>>, symprec: f64, angle_tolerance: f64) -> Self {
        Self {
            incar,
            potcar,
            symprec,
            angle_tolerance,
        }
    }

    /// Captures INCAR and POTCAR from `dir`. POTCAR is optional.
    pub fn from_directory(dir: &Path, symprec: f64, angle_tolerance: f64) -> Result<Self> {
        let incar = Incar::from_file(&dir.join(naming::INCAR))?;
        let potcar_path = dir.join(naming::POTCAR);
        let potcar = if potcar_path.exists() {
            Some(fs::read(&potcar_path)?)
        } else {
            None
        };
        debug!("Captured input templates from {}", dir.display());
        Ok(Self::new(incar, potcar, symprec, angle_tolerance))
    }
}

impl InputGenerator for TemplateInputGenerator {
    fn generate(&self, request: &InputRequest, dir: &Path) -> Result<Kpoints> {
        let structure = if request.standardize {
            request.structure.wrapped()
        } else {
            request.structure.clone()
        };

        let recip = structure
            .reciprocal_lengths()
            .ok_or_else(|| ParseError::Invalid("singular lattice".to_string()))?;
        let kpoints = Kpoints::from_density(recip, request.kpt_density);

        let incar = match &request.prev_dir {
            Some(prev) if prev.join(naming::INCAR).exists() => {
                Incar::from_file(&prev.join(naming::INCAR))?
            }
            _ => self.incar.clone(),
        };

        incar.write_file(&dir.join(naming::INCAR))?;
        kpoints.write_file(&dir.join(naming::KPOINTS))?;
        structure.write_file(&dir.join(naming::POSCAR))?;
        if let Some(potcar) = &self.potcar {
            fs::write(dir.join(naming::POTCAR), potcar)?;
        }
        InputSetRecord {
            kpt_density: request.kpt_density,
            symprec: self.symprec,
            angle_tolerance: self.angle_tolerance,
            standardized: request.standardize,
        }
        .write(dir)?;

        info!(
            "Wrote inputs with k-point density {:.3}: mesh {}x{}x{}",
            request.kpt_density, kpoints.mesh[0], kpoints.mesh[1], kpoints.mesh[2]
        );
        Ok(kpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix3;
    use tempfile::TempDir;

    fn structure() -> Structure {
        Structure::new(
            Matrix3::identity() * 4.0,
            vec!["Mg".to_string()],
            vec![[1.25, -0.25, 0.5]],
        )
    }


    #[test]
    fn test_generate() {
        let tmp = TempDir::new().unwrap();
        let generator = TemplateInputGenerator::new(
            Incar::parse("ISMEAR = 0\n"),
            Some(b"PAW Mg".to_vec()),
            0.01,
            5.0,
        );
        let request = InputRequest {
            structure: structure(),
            kpt_density: 2.5,
            standardize: true,
            prev_dir: None,
        };
        let kpoints = generator.generate(&request, tmp.path()).unwrap();
        let poscar = Structure::from_file(&tmp.path().join("POSCAR")).unwrap();
        assert!((poscar.frac_coords[0][0] - 0.25).abs() < 1e-8);
        assert!((poscar.frac_coords[0][1] - 0.75).abs() < 1e-8);
        // 2.5 * 2π / 4 = 3.93
        assert_eq!(kpoints.mesh, [4, 4, 4]);
        assert!(tmp.path().join("POTCAR").exists());
        let record = InputSetRecord::load(tmp.path()).unwrap();
        assert_eq!(record.kpt_density, 2.5);
        assert!(record.standardized);
        let incar = Incar::from_file(&tmp.path().join("INCAR")).unwrap();
        assert_eq!(incar.get_i64("ISMEAR", 1), 0);
    }

    #[test]
    fn test_generate_takes_previous_incar() {
        let tmp = TempDir::new().unwrap();
        let prev = tmp.path().join("prev");
        fs::create_dir(&prev).unwrap();
        fs::write(prev.join("INCAR"), "ALGO = Exact\n").unwrap();
        let generator = TemplateInputGenerator::new(Incar::parse("ALGO = Fast\n"), None, 0.01, 5.0);
        let request = InputRequest {
            structure: structure(),
            kpt_density: 3.0,
            standardize: false,
            prev_dir: Some(prev),
        };
        generator.generate(&request, tmp.path()).unwrap();
        let incar = Incar::from_file(&tmp.path().join("INCAR")).unwrap();
        assert_eq!(incar.get_str("ALGO", ""), "Exact");
    }
}
