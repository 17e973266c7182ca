//! Validation of job and convergence settings before anything is launched.
//!
//! Bad settings would otherwise surface hours into a campaign, e.g. a growth
//! factor of 1 that never changes the mesh or an empty VASP command that fails
//! only at launch. Every check returns a [`ValidationError`] with a suggestion.

use crate::config::{JobSettings, KptConvSettings};
use crate::naming;
use crate::structure::Structure;
use crate::symmetry::SymmetryAnalyzer;
use log::{info, warn};
use std::path::Path;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error with user guidance.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Error category for programmatic handling
    pub category: ErrorCategory,
    /// Human-readable error message
    pub message: String,
    /// Optional suggestion for fixing the issue
    pub suggestion: Option<String>,
}

/// Categories of validation errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorCategory {
    /// A numeric parameter is out of range
    InvalidConfiguration,
    /// A required input file or program is missing
    MissingDependencies,
    /// A handler set or option is not known
    UnsupportedFeature,
}

impl ValidationError {
    fn invalid(message: String, suggestion: &str) -> Self {
        Self {
            category: ErrorCategory::InvalidConfiguration,
            message,
            suggestion: Some(suggestion.to_string()),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, "\n\nSuggestion: {}", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// Handler set names accepted by [`handler_set`](crate::handlers::handler_set).
pub const HANDLER_SETS: [&str; 4] = ["default", "dielectric", "no_handler", "always_fail"];

/// Validates the settings of a structure optimization job.
pub fn validate_job_settings(job: &JobSettings) -> ValidationResult<()> {
    if job.vasp_cmd.is_empty() {
        return Err(ValidationError {
            category: ErrorCategory::MissingDependencies,
            message: "No VASP command given".to_string(),
            suggestion: Some(
                "Pass -v \"mpirun -np 16 vasp_std\" or set vasp_cmd in the [job] section of vise_config.cfg"
                    .to_string(),
            ),
        });
    }
    if job.max_relax_num < 1 {
        return Err(ValidationError::invalid(
            format!("max_relax_num must be at least 1, got {}", job.max_relax_num),
            "Use the default of 10 relaxation attempts",
        ));
    }
    if !(job.symprec > 0.0) {
        return Err(ValidationError::invalid(
            format!("symprec must be positive, got {}", job.symprec),
            "A distance tolerance of 0.01 Å is usually appropriate",
        ));
    }
    if !(job.angle_tolerance > 0.0) {
        return Err(ValidationError::invalid(
            format!("angle_tolerance must be positive, got {}", job.angle_tolerance),
            "An angle tolerance of 5 degrees is usually appropriate",
        ));
    }
    if !(job.poll_interval > 0.0) || job.monitor_freq == 0 {
        return Err(ValidationError::invalid(
            format!(
                "poll_interval and monitor_freq must be positive, got {} and {}",
                job.poll_interval, job.monitor_freq
            ),
            "Use poll_interval = 10 and monitor_freq = 30",
        ));
    }

    let handlers = &job.handlers;
    if !HANDLER_SETS.contains(&handlers.handler_name.as_str()) {
        return Err(ValidationError {
            category: ErrorCategory::UnsupportedFeature,
            message: format!("Unknown handler set: {}", handlers.handler_name),
            suggestion: Some(format!("Choose one of: {}", HANDLER_SETS.join(", "))),
        });
    }
    if !(handlers.memory_usage_limit > 0.0 && handlers.memory_usage_limit <= 1.0) {
        return Err(ValidationError::invalid(
            format!(
                "memory_usage_limit must lie in (0, 1], got {}",
                handlers.memory_usage_limit
            ),
            "Use a fraction of physical memory such as 0.85",
        ));
    }
    if handlers.nionic_steps < 1 {
        return Err(ValidationError::invalid(
            "nionic_steps must be at least 1".to_string(),
            "Use the default window of 10 ionic steps",
        ));
    }
    Ok(())
}

/// Validates the settings of the k-point convergence loop.
pub fn validate_kpt_conv_settings(kc: &KptConvSettings) -> ValidationResult<()> {
    if !(kc.convergence_criterion > 0.0) {
        return Err(ValidationError::invalid(
            format!("Convergence criterion must be positive, got {}", kc.convergence_criterion),
            "Use an energy criterion in eV/atom such as 0.003",
        ));
    }
    if kc.num_kpt_check < 1 {
        return Err(ValidationError::invalid(
            "num_kpt_check must be at least 1".to_string(),
            "Compare each candidate with the 2 following k-point sets",
        ));
    }
    if !(kc.symprec > 0.0) {
        return Err(ValidationError::invalid(
            format!("symprec must be positive, got {}", kc.symprec),
            "A distance tolerance of 0.01 Å is usually appropriate",
        ));
    }
    if !(kc.kpt_factor > 1.0) {
        return Err(ValidationError::invalid(
            format!("kpt_factor must exceed 1, got {}", kc.kpt_factor),
            "Grow the density by 20 % per set with kpt_factor = 1.2",
        ));
    }
    if !(kc.initial_kpt_density > 0.0) {
        return Err(ValidationError::invalid(
            format!("initial_kpt_density must be positive, got {}", kc.initial_kpt_density),
            "Start from a density of 2.5",
        ));
    }
    if kc.max_kpt_num < 1 {
        return Err(ValidationError::invalid(
            "max_kpt_num must be at least 1".to_string(),
            "Allow at least num_kpt_check + 1 k-point sets",
        ));
    }
    if kc.max_kpt_num <= kc.num_kpt_check {
        warn!(
            "max_kpt_num ({}) leaves no room to satisfy num_kpt_check ({}); convergence cannot be reached",
            kc.max_kpt_num, kc.num_kpt_check
        );
    }
    Ok(())
}

/// Checks that the inputs needed to start a run exist in `dir`.
///
/// INCAR, POSCAR and POTCAR are required; KPOINTS is generated by the k-point
/// loop and only required for a single relaxation.
pub fn validate_input_files(dir: &Path, kpoints_required: bool) -> ValidationResult<()> {
    let mut required = vec![naming::INCAR, naming::POSCAR, naming::POTCAR];
    if kpoints_required {
        required.push(naming::KPOINTS);
    }
    let missing: Vec<&str> = required
        .into_iter()
        .filter(|f| !dir.join(f).exists())
        .collect();
    if !missing.is_empty() {
        return Err(ValidationError {
            category: ErrorCategory::MissingDependencies,
            message: format!("Missing input file(s) in {}: {}", dir.display(), missing.join(", ")),
            suggestion: Some("Prepare the VASP inputs before calling vasp_run".to_string()),
        });
    }
    info!("Found VASP inputs in {}", dir.display());
    Ok(())
}

/// Runs the space-group analyzer once on the POSCAR in `dir`.
///
/// The analyzer is otherwise first needed after the relaxation has finished,
/// so a missing helper program is caught here instead of after the VASP run.
pub fn validate_symmetry_analyzer(
    analyzer: &dyn SymmetryAnalyzer,
    dir: &Path,
    symprec: f64,
    angle_tolerance: f64,
) -> ValidationResult<u32> {
    let poscar = dir.join(naming::POSCAR);
    let structure = Structure::from_file(&poscar).map_err(|e| ValidationError {
        category: ErrorCategory::MissingDependencies,
        message: format!("Cannot read {}: {}", poscar.display(), e),
        suggestion: Some("Provide a POSCAR in VASP 5 format".to_string()),
    })?;
    let sg = analyzer
        .space_group(&structure, symprec, angle_tolerance)
        .map_err(|e| ValidationError {
            category: ErrorCategory::MissingDependencies,
            message: format!("Space-group analysis of {} failed: {}", poscar.display(), e),
            suggestion: Some(
                "Install the helper program or set command in the [symmetry] section of vise_config.cfg"
                    .to_string(),
            ),
        })?;
    info!("Initial structure has space group {}", sg);
    Ok(sg)
}
