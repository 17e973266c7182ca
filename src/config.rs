//! Run-time configuration of jobs, error handlers and k-point convergence.
//!
//! This module defines the configuration structures the job machinery is
//! driven by:
//!
//! - [`HandlerSettings`]: which error handlers run and their thresholds
//! - [`JobSettings`]: how a structure optimization is launched and supervised
//! - [`KptConvSettings`]: the k-point convergence loop and its criterion
//! - [`InputSetRecord`]: the `vise.json` record written next to generated inputs
//!
//! Defaults come from the constants below; the INI settings file
//! (see [`settings`](crate::settings)) and command-line flags override them.

use crate::diagnostics::DiagnosticKind;
use crate::naming;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Initial k-point density in Å (points per reciprocal Å⁻¹, 2π included)
pub const KPT_INIT_DENSITY: f64 = 2.5;
/// Factor the k-point density is multiplied by between iterations
pub const KPT_FACTOR: f64 = 1.2;
/// Distance tolerance in Å for symmetry analysis and lattice comparison
pub const SYMMETRY_TOLERANCE: f64 = 0.01;
/// Angle tolerance in degrees for symmetry analysis
pub const ANGLE_TOL: f64 = 5.0;
/// Convergence criterion of the energy per atom in eV
pub const CONVERGENCE_CRITERION: f64 = 0.003;
/// Number of later k-point sets the candidate is compared against
pub const NUM_KPT_CHECK: usize = 2;
/// Atom count from which a cell counts as large for real-space projection fixes
pub const NATOMS_LARGE_CELL: usize = 50;
/// Fraction of physical memory in use that aborts a run
pub const MEMORY_USAGE_LIMIT: f64 = 0.85;
/// Seconds since the INCAR was written after which a run is aborted (36 h)
pub const TIMEOUT: u64 = 129_600;
/// Trailing ionic steps that must all hit `NELM` to count as non-converging
pub const NIONIC_STEPS: usize = 10;

/// Error handler selection and thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerSettings {
    /// Handler set name: `default`, `dielectric`, `no_handler` or `always_fail`
    pub handler_name: String,
    /// Stdout log scanned for error signatures
    pub output_file: String,
    /// Kinds the VASP error handler looks for
    pub enabled_kinds: Vec<DiagnosticKind>,
    /// Large-cell threshold for real-space projection corrections
    pub natoms_large_cell: usize,
    /// Memory usage ratio that aborts the run
    pub memory_usage_limit: f64,
    /// Wall-time limit in seconds, measured from the INCAR modification time
    pub timeout: u64,
    /// Window of ionic steps for the non-converging check
    pub nionic_steps: usize,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            handler_name: "default".to_string(),
            output_file: "vasp.out".to_string(),
            enabled_kinds: DiagnosticKind::default_enabled(),
            natoms_large_cell: NATOMS_LARGE_CELL,
            memory_usage_limit: MEMORY_USAGE_LIMIT,
            timeout: TIMEOUT,
            nionic_steps: NIONIC_STEPS,
        }
    }
}

/// Settings of one structure optimization job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSettings {
    /// VASP command line, e.g. `["mpirun", "vasp_std"]`
    pub vasp_cmd: Vec<String>,
    /// Stdout log of every attempt
    pub output_file: String,
    /// Maximum number of relaxation attempts
    pub max_relax_num: usize,
    /// Remove WAVECAR once the job has finished
    pub remove_wavecar: bool,
    /// Move files not in the keep list into `files/` at the end
    pub move_unimportant_files: bool,
    /// Extra file names left in the run directory besides the standard set
    pub left_files: Vec<String>,
    /// Distance tolerance of the symmetry analysis in Å
    pub symprec: f64,
    /// Angle tolerance of the symmetry analysis in degrees
    pub angle_tolerance: f64,
    /// Time between polls of the running process in seconds
    pub poll_interval: f64,
    /// Polls between two rounds of monitor checks
    pub monitor_freq: u32,
    /// Error handler configuration
    pub handlers: HandlerSettings,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            vasp_cmd: Vec::new(),
            output_file: "vasp.out".to_string(),
            max_relax_num: 10,
            remove_wavecar: false,
            move_unimportant_files: true,
            left_files: Vec::new(),
            symprec: SYMMETRY_TOLERANCE,
            angle_tolerance: ANGLE_TOL,
            poll_interval: 10.0,
            monitor_freq: 30,
            handlers: HandlerSettings::default(),
        }
    }
}

impl JobSettings {
    /// Poll interval as a [`Duration`].
    pub fn poll_duration(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval.max(0.0))
    }
}

/// Settings of the k-point convergence loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KptConvSettings {
    /// Density of the first iteration and after symmetry changes
    pub initial_kpt_density: f64,
    /// Growth factor of the density between iterations (> 1)
    pub kpt_factor: f64,
    /// Maximum number of k-point sets, resumed ones included
    pub max_kpt_num: usize,
    /// Energy criterion in eV per atom
    pub convergence_criterion: f64,
    /// Number of later sets the candidate is compared against
    pub num_kpt_check: usize,
    /// Absolute lattice tolerance in Å
    pub symprec: f64,
}

impl Default for KptConvSettings {
    fn default() -> Self {
        Self {
            initial_kpt_density: KPT_INIT_DENSITY,
            kpt_factor: KPT_FACTOR,
            max_kpt_num: 10,
            convergence_criterion: CONVERGENCE_CRITERION,
            num_kpt_check: NUM_KPT_CHECK,
            symprec: SYMMETRY_TOLERANCE,
        }
    }
}

/// Input-set parameters stored in `vise.json` beside the generated inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSetRecord {
    /// k-point density the mesh was generated from
    pub kpt_density: f64,
    /// Symmetry distance tolerance used for standardization
    pub symprec: f64,
    /// Symmetry angle tolerance used for standardization
    pub angle_tolerance: f64,
    /// Whether the structure was standardized
    pub standardized: bool,
}

impl InputSetRecord {
    /// Writes `vise.json` into `dir`.
    pub fn write(&self, dir: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(dir.join(naming::VISE_JSON), json)
    }

    /// Reads `vise.json` from `dir`.
    pub fn load(dir: &Path) -> std::io::Result<Self> {
        let content = fs::read_to_string(dir.join(naming::VISE_JSON))?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let job = JobSettings::default();
        assert_eq!(job.max_relax_num, 10);
        assert_eq!(job.handlers.timeout, 129_600);
        assert!(!job
            .handlers
            .enabled_kinds
            .contains(&DiagnosticKind::Brmix));
        let kc = KptConvSettings::default();
        assert_eq!(kc.num_kpt_check, 2);
        assert!(kc.kpt_factor > 1.0);
    }

    #[test]
    fn test_input_set_record_file() {
        let tmp = TempDir::new().unwrap();
        let record = InputSetRecord {
            kpt_density: 3.0,
            symprec: 0.01,
            angle_tolerance: 5.0,
            standardized: true,
        };
        record.write(tmp.path()).unwrap();
        assert_eq!(InputSetRecord::load(tmp.path()).unwrap(), record);
    }
}
