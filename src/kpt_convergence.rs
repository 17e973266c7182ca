//! The k-point convergence loop.
//!
//! Each iteration writes a fresh input set, relaxes it with [`VaspJob`] and
//! moves the finished run into its own subdirectory named after the mesh and
//! the space groups, e.g. `kpt7x7x7_pre-sg225_pos-sg225`. Finished
//! subdirectories are picked up again on restart, so an interrupted campaign
//! resumes where it stopped.
//!
//! # Density schedule
//!
//! - first iteration, or when the previous relaxation changed the space
//!   group: the initial density on the (re)standardized structure
//! - otherwise: the previous density multiplied by the growth factor until
//!   the mesh is larger along every direction; the previous WAVECAR is moved
//!   in as the starting wavefunction
//!
//! On convergence the inputs and `.finish` outputs of the converged run are
//! symlinked into the top-level directory.

use crate::cleanup::{CleanupConfig, CleanupManager};
use crate::config::KptConvSettings;
use crate::convergence::{ConvergenceError, ConvergenceSequence};
use crate::input_set::{InputGenerator, InputRequest};
use crate::io::ParseError;
use crate::job::VaspJob;
use crate::kpoints::Kpoints;
use crate::naming;
use crate::record::RunRecord;
use crate::structure::Structure;
use log::{debug, info, warn};
use std::fs;
use std::path::Path;

type Result<T> = std::result::Result<T, ConvergenceError>;

/// Growth steps tried before giving up on enlarging the mesh.
const MAX_REFINEMENT_STEPS: usize = 100;

/// Repeats structure optimizations with growing k-point density until the
/// energy per atom and the lattice stop changing.
pub struct ConvergenceLoop {
    job: VaspJob,
    generator: Box<dyn InputGenerator>,
    settings: KptConvSettings,
    cleanup: CleanupManager,
}

impl ConvergenceLoop {
    /// Wraps `job`, which runs in the directory holding the k-point subdirectories.
    ///
    /// WAVECAR removal configured on the job is deferred until the loop ends,
    /// so that each iteration can start from the previous wavefunction.
    pub fn new(mut job: VaspJob, generator: Box<dyn InputGenerator>, settings: KptConvSettings) -> Self {
        let config = job.cleanup().config().clone();
        let cleanup = CleanupManager::new(config.clone(), job.naming().clone());
        job.set_cleanup_config(CleanupConfig {
            remove_wavecar: false,
            ..config
        });
        Self {
            job,
            generator,
            settings,
            cleanup,
        }
    }

    /// The wrapped job.
    pub fn job(&self) -> &VaspJob {
        &self.job
    }

    /// Runs the loop with the density schedule and cap of the settings.
    pub fn run_from_settings(&mut self) -> Result<ConvergenceSequence> {
        let initial = self.settings.initial_kpt_density;
        let factor = self.settings.kpt_factor;
        let max = self.settings.max_kpt_num;
        self.run(initial, factor, max)
    }

    /// Runs k-point sets until convergence or until the sequence holds
    /// `max_iterations` records, resumed ones included.
    pub fn run(
        &mut self,
        initial_density: f64,
        growth_factor: f64,
        max_iterations: usize,
    ) -> Result<ConvergenceSequence> {
        let dir = self.job.dir().to_path_buf();
        let mut sequence = ConvergenceSequence::from_dirs(&dir, &self.settings)?;

        while !sequence.is_converged() && sequence.len() < max_iterations {
            let prev = sequence.last().cloned();
            let request = self.next_request(&dir, prev.as_ref(), initial_density, growth_factor)?;
            info!(
                "k-point set {}: density {:.4}{}",
                sequence.len() + 1,
                request.kpt_density,
                if request.standardize { " (standardized)" } else { "" }
            );
            self.generator.generate(&request, &dir)?;

            let record = self.job.structure_optimization_run(prev.as_ref())?;
            let dirname = record.dirname();
            sequence.append(record)?;
            self.job.cleanup().move_run_into(&dir, &dirname)?;
        }

        self.cleanup.remove_wavecars_in_subdirs(&dir)?;

        match sequence.converged_record() {
            Some(converged) => {
                let dirname = converged.dirname();
                info!("k-point convergence reached at {}", dirname);
                self.cleanup.link_converged(&dir, &dirname)?;
                Ok(sequence)
            }
            None => {
                warn!("k-point convergence not reached within {} sets", sequence.len());
                Err(ConvergenceError::NotConverged {
                    iterations: sequence.len(),
                })
            }
        }
    }

    /// Structure, density and standardization of the next k-point set.
    fn next_request(
        &self,
        dir: &Path,
        prev: Option<&RunRecord>,
        initial_density: f64,
        growth_factor: f64,
    ) -> Result<InputRequest> {
        let prev = match prev {
            None => {
                let structure = Structure::from_file(&dir.join(naming::POSCAR))?;
                return Ok(InputRequest {
                    structure,
                    kpt_density: initial_density,
                    standardize: true,
                    prev_dir: None,
                });
            }
            Some(prev) => prev,
        };

        let prev_dir = dir.join(prev.dirname());
        if prev.is_symmetry_changed() {
            info!(
                "Space group changed from {:?} to {}; restarting from the initial density",
                prev.initial_sg, prev.final_sg
            );
            return Ok(InputRequest {
                structure: prev.final_structure.clone(),
                kpt_density: initial_density,
                standardize: true,
                prev_dir: Some(prev_dir),
            });
        }

        let start = prev.kpt_density.unwrap_or(initial_density);
        let density = refine_density(&prev.final_structure, prev.kpt_mesh, start, growth_factor)?;
        transfer_wavecar(&prev_dir, dir)?;
        Ok(InputRequest {
            structure: prev.final_structure.clone(),
            kpt_density: density,
            standardize: false,
            prev_dir: Some(prev_dir),
        })
    }
}

/// Multiplies `density` by `factor` until the mesh of `structure` exceeds
/// `prev_mesh` along every direction.
pub fn refine_density(
    structure: &Structure,
    prev_mesh: [u32; 3],
    density: f64,
    factor: f64,
) -> Result<f64> {
    let recip = structure.reciprocal_lengths().ok_or_else(|| {
        ConvergenceError::Input(ParseError::Invalid("singular lattice".to_string()))
    })?;
    let mut density = density;
    for _ in 0..MAX_REFINEMENT_STEPS {
        density *= factor;
        let mesh = Kpoints::from_density(recip, density).mesh;
        debug!("Density {:.4} gives mesh {:?}", density, mesh);
        if mesh.iter().zip(prev_mesh).all(|(&new, old)| new > old) {
            return Ok(density);
        }
    }
    Err(ConvergenceError::MeshNotRefined {
        mesh: prev_mesh,
        density,
    })
}

/// Moves the WAVECAR of a finished run, archived or not, into `dir`.
fn transfer_wavecar(prev_dir: &Path, dir: &Path) -> std::io::Result<()> {
    let candidates = [
        prev_dir.join(naming::WAVECAR),
        prev_dir.join(naming::ARCHIVE_DIR).join(naming::WAVECAR),
    ];
    match candidates.iter().find(|p| p.is_file()) {
        Some(wavecar) => {
            fs::rename(wavecar, dir.join(naming::WAVECAR))?;
            debug!("Moved {} for the next k-point set", wavecar.display());
        }
        None => debug!("No WAVECAR to reuse in {}", prev_dir.display()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix3;
    use tempfile::TempDir;

    fn cubic(a: f64) -> Structure {
        Structure::new(
            Matrix3::identity() * a,
            vec!["Cu".to_string()],
            vec![[0.0, 0.0, 0.0]],
        )
    }

    #[test]
    fn test_refine_density_enlarges_every_direction() {
        let s = cubic(4.0);
        // 2.5 * 2π / 4 → 4x4x4
        let density = refine_density(&s, [4, 4, 4], 2.5, 1.2).unwrap();
        let mesh = Kpoints::from_density(s.reciprocal_lengths().unwrap(), density).mesh;
        assert!(mesh.iter().all(|&n| n > 4));
        assert!(density > 2.5);
    }

    #[test]
    fn test_refine_density_skips_unchanged_meshes() {
        let s = cubic(4.0);
        // A tiny factor needs several steps before the mesh grows.
        let density = refine_density(&s, [4, 4, 4], 2.5, 1.01).unwrap();
        assert!(density > 2.5 * 1.01);
    }

    #[test]
    fn test_refine_density_gives_up() {
        let s = cubic(4.0);
        let err = refine_density(&s, [4, 4, 4], 2.5, 1.0).unwrap_err();
        assert!(matches!(err, ConvergenceError::MeshNotRefined { .. }));
    }

    #[test]
    fn test_transfer_wavecar_from_archive() {
        let tmp = TempDir::new().unwrap();
        let prev = tmp.path().join("kpt4x4x4_pre-sg225_pos-sg225");
        fs::create_dir_all(prev.join("files")).unwrap();
        fs::write(prev.join("files").join("WAVECAR"), "wf").unwrap();
        transfer_wavecar(&prev, tmp.path()).unwrap();
        assert!(tmp.path().join("WAVECAR").is_file());
        assert!(!prev.join("files").join("WAVECAR").exists());
    }
}
