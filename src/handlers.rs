//! Error handlers: detection of failed or failing VASP runs and their corrections.
//!
//! Every handler implements [`ErrorHandler`]. Monitor handlers
//! ([`ErrorHandler::is_monitor`]) are polled while VASP is still running.
//! Once the process has ended, every handler that inspects outputs
//! ([`ErrorHandler::is_post_run`]) is checked; the resource probes are not.
//!
//! # Handlers
//!
//! | Handler | Monitor | Post-run | Detects | Recoverable |
//! |---|---|---|---|---|
//! | [`VaspErrorHandler`] | yes | yes | error signatures in the stdout log | mostly |
//! | [`UnconvergedErrorHandler`] | no | yes | electronic or ionic non-convergence | until mixing is exhausted |
//! | [`DielectricMaxIterationHandler`] | yes | yes | DFPT loop hitting `NELM` | no |
//! | [`AlwaysFailHandler`] | yes | yes | always | no |
//! | [`MemorySwapHandler`] | yes | no | memory usage above the limit | no |
//! | [`TooLongTimeHandler`] | yes | no | wall time since the INCAR was written | no |
//! | [`NonConvergingHandler`] | yes | yes | SCF stuck at `NELM` over many ionic steps | no |
//! | [`DivergingEnergyHandler`] | no | yes | electronic energies above 10⁶ eV | no |
//!
//! A [`Correction`] without actions marks the run as fatally failed.

use crate::actions::{self, Action};
use crate::config::HandlerSettings;
use crate::diagnostics::{self, DiagnosticKind, DiagnosticSet};
use crate::incar::{Incar, IncarValue};
use crate::io::{ParseError, VaspInput};
use crate::kpoints::{KpointStyle, Kpoints};
use crate::naming;
use crate::parser::{self, Oszicar, Outcar, RunSummary, DEFAULT_NELM};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::SystemTime;
use thiserror::Error;

/// Errors raised while checking or correcting a run.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// File access failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// An input or output file could not be parsed
    #[error("{0}")]
    Parse(#[from] ParseError),
    /// A resource probe could not be evaluated
    #[error("Probe error: {0}")]
    Probe(String),
    /// Unknown handler set name
    #[error("Unknown handler set: {0}")]
    UnknownHandlerSet(String),
}

type Result<T> = std::result::Result<T, HandlerError>;

/// Energy above which the electronic minimisation is considered diverging, in eV
pub const DIVERGING_ENERGY: f64 = 1e6;

/// Outcome of [`ErrorHandler::correct`].
#[derive(Debug, Clone, PartialEq)]
pub struct Correction {
    /// Names of the detected errors
    pub errors: Vec<String>,
    /// Actions applied to the run directory; `None` if nothing can be done
    pub actions: Option<Vec<Action>>,
}

impl Correction {
    /// A correction that cannot recover the run.
    pub fn unrecoverable(error: &str) -> Self {
        Self {
            errors: vec![error.to_string()],
            actions: None,
        }
    }

    /// Whether the run may be retried after this correction.
    pub fn is_recoverable(&self) -> bool {
        matches!(&self.actions, Some(actions) if !actions.is_empty())
    }
}

/// A check on a run directory with an optional correction.
pub trait ErrorHandler {
    /// Short name used in logs and `corrections.json`.
    fn name(&self) -> &str;

    /// Whether the handler is also polled while VASP is running.
    fn is_monitor(&self) -> bool {
        false
    }

    /// Whether the handler checks the outputs after VASP has exited.
    ///
    /// Resource probes only make sense on a running process.
    fn is_post_run(&self) -> bool {
        true
    }

    /// Returns `true` when the handler detects a problem in `dir`.
    fn check(&mut self, dir: &Path) -> Result<bool>;

    /// Fixes the problem found by the last [`check`](Self::check), in place.
    fn correct(&mut self, dir: &Path) -> Result<Correction>;
}

/// What the corrective action engine knows about the run besides its inputs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunState {
    /// Ionic steps completed so far (0 when OSZICAR is unreadable)
    pub ionic_steps: usize,
    /// `NBANDS` reported in OUTCAR
    pub outcar_nbands: Option<i64>,
}

impl RunState {
    /// Reads the run state from OSZICAR and OUTCAR in `dir`, tolerating missing files.
    pub fn from_dir(dir: &Path) -> Self {
        let ionic_steps = Oszicar::from_file(&dir.join(naming::OSZICAR))
            .map(|o| o.num_ionic_steps())
            .unwrap_or(0);
        let outcar_nbands = Outcar::from_file(&dir.join(naming::OUTCAR))
            .ok()
            .and_then(|o| o.nbands);
        Self {
            ionic_steps,
            outcar_nbands,
        }
    }
}

/// Detects error signatures in the stdout log and maps them to corrections.
///
/// This is the corrective action engine: detected kinds are corrected in the
/// fixed priority order of [`DiagnosticKind`], and kinds with escalating
/// strategies select their strategy from a per-kind counter. Counters start at
/// zero for every kind and live as long as the handler.
pub struct VaspErrorHandler {
    output_file: String,
    enabled: Vec<DiagnosticKind>,
    natoms_large_cell: usize,
    errors: DiagnosticSet,
    error_count: BTreeMap<DiagnosticKind, u32>,
}

impl VaspErrorHandler {
    /// Creates the handler with all counters at zero.
    pub fn new(output_file: &str, enabled: Vec<DiagnosticKind>, natoms_large_cell: usize) -> Self {
        Self {
            output_file: output_file.to_string(),
            enabled,
            natoms_large_cell,
            errors: DiagnosticSet::new(),
            error_count: DiagnosticKind::ALL.iter().map(|k| (*k, 0)).collect(),
        }
    }

    /// Kinds found by the last check.
    pub fn errors(&self) -> &DiagnosticSet {
        &self.errors
    }

    /// How often the correction branch keyed by `kind` has executed.
    pub fn error_count(&self, kind: DiagnosticKind) -> u32 {
        self.error_count.get(&kind).copied().unwrap_or(0)
    }

    fn bump(&mut self, kind: DiagnosticKind) -> u32 {
        let count = self.error_count.entry(kind).or_insert(0);
        let previous = *count;
        *count += 1;
        previous
    }

    /// Computes the actions for `detected` without touching the disk.
    ///
    /// Each correction branch runs at most once per call, in priority order,
    /// and increments its counter. Branches that lack a required value log a
    /// warning and contribute nothing.
    pub fn plan(&mut self, detected: &DiagnosticSet, input: &VaspInput, run: &RunState) -> Vec<Action> {
        use DiagnosticKind::*;

        let has = |kinds: &[DiagnosticKind]| kinds.iter().any(|k| detected.contains(k));
        let incar = &input.incar;
        let mut actions = Vec::new();

        if has(&[Tet, Dentet]) {
            self.bump(Tet);
            actions.push(Action::set_incar("ISMEAR", 0));
        }

        if has(&[InvRotMat]) {
            self.bump(InvRotMat);
            actions.push(Action::set_incar("SYMPREC", 1e-8));
        }

        if has(&[PlaneWaveCoeff]) {
            self.bump(PlaneWaveCoeff);
            actions.push(Action::delete(naming::WAVECAR));
            actions.push(Action::delete(naming::CHGCAR));
        }

        if has(&[Zpotrf]) {
            self.bump(Zpotrf);
            // Short bonds: a step that was too big if the run already moved,
            // otherwise symmetry (static) or a too small volume.
            if run.ionic_steps >= 1 {
                let potim = incar.get_f64("POTIM", 0.5) / 2.0;
                actions.push(Action::set_incar("ISYM", 0));
                actions.push(Action::set_incar("POTIM", potim));
            } else if incar.get_i64("NSW", 0) == 0 || (0..3).contains(&incar.get_i64("ISIF", 0)) {
                actions.push(Action::set_incar("ISYM", 0));
            } else {
                let mut structure = input.poscar.clone();
                structure.apply_strain(0.2);
                actions.push(Action::SetStructure { structure });
            }
            if incar.get_i64("ICHARG", 0) < 10 {
                actions.push(Action::delete(naming::CHGCAR));
                actions.push(Action::delete(naming::WAVECAR));
            }
        }

        if has(&[Subspacematrix]) {
            if self.bump(Subspacematrix) == 0 {
                actions.push(Action::set_incar("LREAL", false));
            } else {
                actions.push(Action::set_incar("PREC", "Accurate"));
            }
        }

        if has(&[Rspher, RealOptlay, NichtKonv]) {
            let count = self.bump(RealOptlay);
            if input.poscar.num_sites() < self.natoms_large_cell {
                actions.push(Action::set_incar("LREAL", false));
            } else if count == 0 {
                // Large cells first try projectors optimised by VASP itself.
                actions.push(Action::set_incar("LREAL", true));
            } else {
                actions.push(Action::set_incar("LREAL", false));
            }
        }

        if has(&[Tetirr, IncorrectShift]) {
            self.bump(Tetirr);
            if let Some(kpoints) = unshifted_gamma(&input.kpoints) {
                actions.push(Action::SetKpoints { kpoints });
            }
        }

        if has(&[RotMatrix]) {
            self.bump(RotMatrix);
            match unshifted_gamma(&input.kpoints) {
                Some(kpoints) => actions.push(Action::SetKpoints { kpoints }),
                None => actions.push(Action::set_incar("ISYM", 0)),
            }
        }

        if has(&[Amin]) {
            self.bump(Amin);
            actions.push(Action::set_incar("AMIN", 0.01));
        }

        if has(&[TripleProduct]) {
            self.bump(TripleProduct);
            match input.poscar.make_supercell(&[[1, 0, 0], [0, 0, 1], [0, 1, 0]]) {
                Ok(structure) => actions.push(Action::SetStructure { structure }),
                Err(e) => warn!("Cannot swap lattice vectors for triple_product: {}", e),
            }
        }

        if has(&[Pricel]) {
            self.bump(Pricel);
            actions.push(Action::set_incar("SYMPREC", 1e-8));
            actions.push(Action::set_incar("ISYM", 0));
        }

        if has(&[Brions]) {
            self.bump(Brions);
            let potim = incar.get_f64("POTIM", 0.5) + 0.1;
            actions.push(Action::set_incar("POTIM", potim));
        }

        if has(&[Zbrent]) {
            self.bump(Zbrent);
            actions.push(Action::set_incar("ADDGRID", true));
            actions.push(Action::copy(naming::CONTCAR, naming::POSCAR));
        }

        if has(&[TooFewBands]) {
            self.bump(TooFewBands);
            let nbands = incar
                .get("NBANDS")
                .and_then(IncarValue::as_i64)
                .or(run.outcar_nbands);
            match nbands {
                Some(nbands) => {
                    actions.push(Action::set_incar("NBANDS", (1.1 * nbands as f64) as i64))
                }
                None => warn!("NBANDS found neither in INCAR nor OUTCAR; skipping too_few_bands"),
            }
        }

        if has(&[Pssyevx]) {
            self.bump(Pssyevx);
            actions.push(Action::set_incar("ALGO", "Normal"));
        }

        if has(&[Eddrmm]) {
            self.bump(Eddrmm);
            // RMM-DIIS is unstable for this system.
            let algo = incar.get_str("ALGO", "Normal");
            if algo == "Fast" || algo == "VeryFast" {
                actions.push(Action::set_incar("ALGO", "Normal"));
            } else {
                let potim = incar.get_f64("POTIM", 0.5) / 2.0;
                actions.push(Action::set_incar("POTIM", potim));
            }
            if incar.get_i64("ICHARG", 0) < 10 {
                actions.push(Action::delete(naming::CHGCAR));
                actions.push(Action::delete(naming::WAVECAR));
            }
        }

        if has(&[Edddav]) {
            self.bump(Edddav);
            if incar.get_i64("ICHARG", 0) < 10 {
                actions.push(Action::delete(naming::CHGCAR));
            }
            actions.push(Action::set_incar("ALGO", "All"));
        }

        if has(&[GradNotOrth]) {
            self.bump(GradNotOrth);
            if incar.get_i64("ISMEAR", 1) < 0 {
                actions.push(Action::set_incar("ISMEAR", 0));
            }
        }

        if has(&[Zheev]) {
            self.bump(Zheev);
            if !incar.get_str("ALGO", "Fast").eq_ignore_ascii_case("exact") {
                actions.push(Action::set_incar("ALGO", "Exact"));
            }
        }

        if has(&[ElfKpar]) {
            self.bump(ElfKpar);
            actions.push(Action::set_incar("KPAR", 1));
        }

        if has(&[Rhosyg]) {
            self.bump(Rhosyg);
            if incar.get_f64("SYMPREC", 1e-4) == 1e-4 {
                actions.push(Action::set_incar("ISYM", 0));
            }
            actions.push(Action::set_incar("SYMPREC", 1e-4));
        }

        if has(&[Posmap]) {
            self.bump(Posmap);
            actions.push(Action::set_incar("SYMPREC", 1e-6));
        }

        if has(&[PointGroup]) {
            self.bump(PointGroup);
            actions.push(Action::set_incar("ISYM", 0));
        }

        actions
    }
}

/// Gamma-centred, unshifted copy of a Monkhorst-Pack or shifted mesh.
fn unshifted_gamma(kpoints: &Kpoints) -> Option<Kpoints> {
    if kpoints.style == KpointStyle::Monkhorst || kpoints.is_shifted() {
        let mut gamma = Kpoints::gamma(kpoints.mesh);
        gamma.comment = kpoints.comment.clone();
        Some(gamma)
    } else {
        None
    }
}

impl ErrorHandler for VaspErrorHandler {
    fn name(&self) -> &str {
        "vasp"
    }

    fn is_monitor(&self) -> bool {
        true
    }

    fn check(&mut self, dir: &Path) -> Result<bool> {
        let log = dir.join(&self.output_file);
        if !log.exists() {
            self.errors.clear();
            return Ok(false);
        }
        let incar = Incar::from_file(&dir.join(naming::INCAR))?;
        self.errors = diagnostics::scan_file(&log, &self.enabled, &incar)?;
        if !self.errors.is_empty() {
            let names: Vec<&str> = self.errors.iter().map(|k| k.name()).collect();
            info!("Detected VASP errors: {}", names.join(", "));
        }
        Ok(!self.errors.is_empty())
    }

    fn correct(&mut self, dir: &Path) -> Result<Correction> {
        let naming = naming::FileNaming::new(&self.output_file);
        actions::backup(dir, &naming.backup_files())?;

        let input = VaspInput::from_directory(dir)?;
        let run = RunState::from_dir(dir);
        let detected = self.errors.clone();
        let planned = self.plan(&detected, &input, &run);
        let errors = detected.iter().map(|k| k.name().to_string()).collect();

        if planned.is_empty() {
            warn!("No correction available for the detected errors");
            return Ok(Correction {
                errors,
                actions: None,
            });
        }
        actions::apply_actions(dir, &planned)?;
        Ok(Correction {
            errors,
            actions: Some(planned),
        })
    }
}

/// Whether the INCAR already holds `value` for `tag`.
fn incar_has(incar: &Incar, tag: &str, value: &IncarValue) -> bool {
    match (incar.get(tag), value.as_f64()) {
        (Some(current), Some(wanted)) => current.as_f64() == Some(wanted),
        (Some(current), None) => current.to_string().eq_ignore_ascii_case(&value.to_string()),
        (None, _) => false,
    }
}

/// Handles runs that finished without electronic or ionic convergence.
pub struct UnconvergedErrorHandler;

impl UnconvergedErrorHandler {
    /// Creates the handler.
    pub fn new() -> Self {
        Self
    }
}

impl Default for UnconvergedErrorHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorHandler for UnconvergedErrorHandler {
    fn name(&self) -> &str {
        "unconverged"
    }

    fn check(&mut self, dir: &Path) -> Result<bool> {
        let incar = match Incar::from_file(&dir.join(naming::INCAR)) {
            Ok(incar) => incar,
            Err(_) => return Ok(false),
        };
        // Unreadable outputs are left to the other handlers.
        Ok(RunSummary::from_dir(dir, &incar).map_or(false, |s| !s.converged()))
    }

    fn correct(&mut self, dir: &Path) -> Result<Correction> {
        let files: Vec<String> = naming::VASP_BACKUP_FILES.iter().map(|s| s.to_string()).collect();
        actions::backup(dir, &files)?;

        let incar = Incar::from_file(&dir.join(naming::INCAR))?;
        let summary = RunSummary::from_dir(dir, &incar)?;
        let mut planned = vec![Action::copy(naming::CONTCAR, naming::POSCAR)];

        if !summary.converged_electronic {
            let settings: Vec<(&str, IncarValue)> =
                if incar.get_str("METAGGA", "").to_uppercase().contains("SCAN") {
                    vec![("ALGO", "All".into())]
                } else {
                    vec![
                        ("ISTART", 1.into()),
                        ("ALGO", "Normal".into()),
                        ("NELMDL", (-6).into()),
                        ("BMIX", 0.001.into()),
                        ("AMIX_MAG", 0.8.into()),
                        ("BMIX_MAG", 0.001.into()),
                    ]
                };
            if settings.iter().all(|(tag, value)| incar_has(&incar, tag, value)) {
                warn!("Electronic convergence failed with all mixing fallbacks in place");
                return Ok(Correction::unrecoverable("Unconverged"));
            }
            for (tag, value) in settings {
                planned.push(Action::set_incar(tag, value));
            }
        }

        // Tighten EDIFF instead of switching IBRION, which keeps a constant EDIFF default.
        if !summary.converged_ionic {
            let ediff = incar.get_f64("EDIFF", 1e-4);
            planned.push(Action::set_incar("EDIFF", ediff * 0.5));
            planned.push(Action::set_incar("ADDGRID", true));
        }

        actions::apply_actions(dir, &planned)?;
        Ok(Correction {
            errors: vec!["Unconverged".to_string()],
            actions: Some(planned),
        })
    }
}

/// Aborts dielectric (DFPT) runs whose electronic loop hits `NELM`.
pub struct DielectricMaxIterationHandler;

impl DielectricMaxIterationHandler {
    /// Creates the handler.
    pub fn new() -> Self {
        Self
    }
}

impl Default for DielectricMaxIterationHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorHandler for DielectricMaxIterationHandler {
    fn name(&self) -> &str {
        "dielectric_max_iteration"
    }

    fn is_monitor(&self) -> bool {
        true
    }

    fn check(&mut self, dir: &Path) -> Result<bool> {
        let oszicar = dir.join(naming::OSZICAR);
        if !oszicar.exists() {
            return Ok(false);
        }
        let incar = Incar::from_file(&dir.join(naming::INCAR))?;
        let nelm = incar.get_i64("NELM", DEFAULT_NELM);
        let unconverged_line = format!(":{:4}", nelm);
        let content = fs::read_to_string(oszicar)?;
        Ok(content.lines().any(|line| line.contains(&unconverged_line)))
    }

    fn correct(&mut self, _dir: &Path) -> Result<Correction> {
        Ok(Correction::unrecoverable("No_DFPT_convergence"))
    }
}

/// Always reports an unrecoverable error; used to test the error path.
pub struct AlwaysFailHandler;

impl ErrorHandler for AlwaysFailHandler {
    fn name(&self) -> &str {
        "always_fail"
    }

    fn is_monitor(&self) -> bool {
        true
    }

    fn check(&mut self, _dir: &Path) -> Result<bool> {
        Ok(true)
    }

    fn correct(&mut self, _dir: &Path) -> Result<Correction> {
        Ok(Correction::unrecoverable("Always return Error with this."))
    }
}

/// Source of the current memory usage ratio.
pub trait MemoryProbe {
    /// Used over total physical memory, in `[0, 1]`.
    fn usage_ratio(&self) -> Result<f64>;
}

/// Reads memory usage from `/proc/meminfo`.
#[derive(Debug, Clone, Default)]
pub struct ProcMeminfo;

impl MemoryProbe for ProcMeminfo {
    fn usage_ratio(&self) -> Result<f64> {
        let content = fs::read_to_string("/proc/meminfo")?;
        meminfo_usage(&content)
    }
}

/// Computes `(MemTotal - MemAvailable) / MemTotal` from meminfo text.
fn meminfo_usage(content: &str) -> Result<f64> {
    let field = |name: &str| -> Option<f64> {
        content
            .lines()
            .find(|l| l.starts_with(name))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse().ok())
    };
    let total = field("MemTotal:").ok_or_else(|| HandlerError::Probe("MemTotal missing".into()))?;
    let available = field("MemAvailable:")
        .or_else(|| field("MemFree:"))
        .ok_or_else(|| HandlerError::Probe("MemAvailable missing".into()))?;
    if total <= 0.0 {
        return Err(HandlerError::Probe("MemTotal is zero".into()));
    }
    Ok((total - available) / total)
}

/// Aborts the run when memory usage exceeds a limit.
pub struct MemorySwapHandler {
    memory_usage_limit: f64,
    probe: Box<dyn MemoryProbe>,
}

impl MemorySwapHandler {
    /// Creates the handler reading `/proc/meminfo`.
    pub fn new(memory_usage_limit: f64) -> Self {
        Self::with_probe(memory_usage_limit, Box::new(ProcMeminfo))
    }

    /// Creates the handler with a custom probe.
    pub fn with_probe(memory_usage_limit: f64, probe: Box<dyn MemoryProbe>) -> Self {
        Self {
            memory_usage_limit,
            probe,
        }
    }
}

impl ErrorHandler for MemorySwapHandler {
    fn name(&self) -> &str {
        "memory_swap"
    }

    fn is_monitor(&self) -> bool {
        true
    }

    fn is_post_run(&self) -> bool {
        false
    }

    fn check(&mut self, _dir: &Path) -> Result<bool> {
        let usage = self.probe.usage_ratio()?;
        debug!("Memory usage {:.3} (limit {:.3})", usage, self.memory_usage_limit);
        Ok(usage > self.memory_usage_limit)
    }

    fn correct(&mut self, _dir: &Path) -> Result<Correction> {
        Ok(Correction::unrecoverable("Too_much_memory_usage"))
    }
}

/// Aborts the run when the INCAR is older than the timeout.
pub struct TooLongTimeHandler {
    timeout: u64,
}

impl TooLongTimeHandler {
    /// Creates the handler; `timeout` is in seconds.
    pub fn new(timeout: u64) -> Self {
        Self { timeout }
    }
}

impl ErrorHandler for TooLongTimeHandler {
    fn name(&self) -> &str {
        "too_long_time"
    }

    fn is_monitor(&self) -> bool {
        true
    }

    fn is_post_run(&self) -> bool {
        false
    }

    fn check(&mut self, dir: &Path) -> Result<bool> {
        let incar = dir.join(naming::INCAR);
        if !incar.exists() {
            return Ok(false);
        }
        let modified = fs::metadata(incar)?.modified()?;
        let age = SystemTime::now()
            .duration_since(modified)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Ok(age > self.timeout)
    }

    fn correct(&mut self, _dir: &Path) -> Result<Correction> {
        Ok(Correction::unrecoverable("Too_long_calc"))
    }
}

/// Aborts runs whose SCF loop keeps hitting `NELM` ionic step after ionic step.
pub struct NonConvergingHandler {
    nionic_steps: usize,
}

impl NonConvergingHandler {
    /// Creates the handler with the given window of ionic steps.
    pub fn new(nionic_steps: usize) -> Self {
        Self {
            nionic_steps: nionic_steps.max(1),
        }
    }
}

impl ErrorHandler for NonConvergingHandler {
    fn name(&self) -> &str {
        "non_converging"
    }

    fn is_monitor(&self) -> bool {
        true
    }

    fn check(&mut self, dir: &Path) -> Result<bool> {
        let incar = match Incar::from_file(&dir.join(naming::INCAR)) {
            Ok(incar) => incar,
            Err(_) => return Ok(false),
        };
        let nelm = parser::max_scf_steps(&incar);
        let oszicar = match Oszicar::from_file(&dir.join(naming::OSZICAR)) {
            Ok(oszicar) => oszicar,
            Err(_) => return Ok(false),
        };
        let esteps = &oszicar.electronic_steps;
        if esteps.len() <= self.nionic_steps {
            return Ok(false);
        }
        // The last group may still be running.
        let window = &esteps[esteps.len() - self.nionic_steps - 1..esteps.len() - 1];
        Ok(window.iter().all(|e| e.len() == nelm))
    }

    fn correct(&mut self, _dir: &Path) -> Result<Correction> {
        Ok(Correction::unrecoverable("Non_converging_job"))
    }
}

/// Detects electronic energies blowing up in the last ionic step.
pub struct DivergingEnergyHandler;

impl DivergingEnergyHandler {
    /// Creates the handler.
    pub fn new() -> Self {
        Self
    }
}

impl Default for DivergingEnergyHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorHandler for DivergingEnergyHandler {
    fn name(&self) -> &str {
        "diverging_energy"
    }

    fn check(&mut self, dir: &Path) -> Result<bool> {
        let oszicar = match Oszicar::from_file(&dir.join(naming::OSZICAR)) {
            Ok(oszicar) => oszicar,
            Err(_) => return Ok(false),
        };
        let max_energy = oszicar
            .last_electronic_steps()
            .iter()
            .map(|s| s.e)
            .fold(f64::NEG_INFINITY, f64::max);
        Ok(max_energy > DIVERGING_ENERGY)
    }

    fn correct(&mut self, _dir: &Path) -> Result<Correction> {
        Ok(Correction::unrecoverable("Energy_diverging"))
    }
}

/// Builds the handler set selected by `settings.handler_name`.
pub fn handler_set(settings: &HandlerSettings) -> Result<Vec<Box<dyn ErrorHandler>>> {
    let vasp = || -> Box<dyn ErrorHandler> {
        Box::new(VaspErrorHandler::new(
            &settings.output_file,
            settings.enabled_kinds.clone(),
            settings.natoms_large_cell,
        ))
    };
    let handlers: Vec<Box<dyn ErrorHandler>> = match settings.handler_name.as_str() {
        "default" => vec![
            vasp(),
            Box::new(UnconvergedErrorHandler::new()),
            Box::new(NonConvergingHandler::new(settings.nionic_steps)),
            Box::new(DivergingEnergyHandler::new()),
            Box::new(TooLongTimeHandler::new(settings.timeout)),
            Box::new(MemorySwapHandler::new(settings.memory_usage_limit)),
        ],
        "dielectric" => vec![
            vasp(),
            Box::new(DielectricMaxIterationHandler::new()),
            Box::new(DivergingEnergyHandler::new()),
            Box::new(TooLongTimeHandler::new(settings.timeout)),
            Box::new(MemorySwapHandler::new(settings.memory_usage_limit)),
        ],
        "no_handler" => Vec::new(),
        "always_fail" => vec![Box::new(AlwaysFailHandler)],
        other => return Err(HandlerError::UnknownHandlerSet(other.to_string())),
    };
    Ok(handlers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::Structure;
    use nalgebra::Matrix3;
    use tempfile::TempDir;

    fn input(incar: &str, natoms: usize, style: KpointStyle) -> VaspInput {
        let mut kpoints = Kpoints::gamma([4, 4, 4]);
        kpoints.style = style;
        VaspInput {
            incar: Incar::parse(incar),
            kpoints,
            poscar: Structure::new(
                Matrix3::identity() * 5.0,
                vec!["Si".to_string(); natoms],
                (0..natoms).map(|i| [i as f64 / natoms as f64, 0.0, 0.0]).collect(),
            ),
        }
    }

    fn set(kinds: &[DiagnosticKind]) -> DiagnosticSet {
        kinds.iter().copied().collect()
    }

    #[test]
    fn test_subspacematrix_escalates() {
        let mut handler = VaspErrorHandler::new("vasp.out", DiagnosticKind::default_enabled(), 50);
        let vi = input("", 2, KpointStyle::Gamma);
        let detected = set(&[DiagnosticKind::Subspacematrix]);

        let first = handler.plan(&detected, &vi, &RunState::default());
        assert_eq!(first, vec![Action::set_incar("LREAL", false)]);
        let second = handler.plan(&detected, &vi, &RunState::default());
        assert_eq!(second, vec![Action::set_incar("PREC", "Accurate")]);
        assert_eq!(handler.error_count(DiagnosticKind::Subspacematrix), 2);
    }

    #[test]
    fn test_real_space_large_cell() {
        let mut handler = VaspErrorHandler::new("vasp.out", DiagnosticKind::default_enabled(), 4);
        let vi = input("", 4, KpointStyle::Gamma);
        let detected = set(&[DiagnosticKind::Rspher, DiagnosticKind::NichtKonv]);
        assert_eq!(
            handler.plan(&detected, &vi, &RunState::default()),
            vec![Action::set_incar("LREAL", true)]
        );
        assert_eq!(
            handler.plan(&detected, &vi, &RunState::default()),
            vec![Action::set_incar("LREAL", false)]
        );
        assert_eq!(handler.error_count(DiagnosticKind::RealOptlay), 2);
    }

    #[test]
    fn test_real_space_small_cell() {
        let mut handler = VaspErrorHandler::new("vasp.out", DiagnosticKind::default_enabled(), 50);
        let vi = input("", 2, KpointStyle::Gamma);
        let detected = set(&[DiagnosticKind::RealOptlay]);
        for _ in 0..2 {
            assert_eq!(
                handler.plan(&detected, &vi, &RunState::default()),
                vec![Action::set_incar("LREAL", false)]
            );
        }
    }

    #[test]
    fn test_zpotrf_branches() {
        let mut handler = VaspErrorHandler::new("vasp.out", DiagnosticKind::default_enabled(), 50);
        let detected = set(&[DiagnosticKind::Zpotrf]);

        let vi = input("POTIM = 0.4\nNSW = 50\nISIF = 3\n", 2, KpointStyle::Gamma);
        let moved = RunState {
            ionic_steps: 3,
            outcar_nbands: None,
        };
        let actions = handler.plan(&detected, &vi, &moved);
        assert_eq!(actions[0], Action::set_incar("ISYM", 0));
        assert_eq!(actions[1], Action::set_incar("POTIM", 0.2));
        assert!(actions.contains(&Action::delete("CHGCAR")));

        let static_run = input("NSW = 0\n", 2, KpointStyle::Gamma);
        let actions = handler.plan(&detected, &static_run, &RunState::default());
        assert_eq!(actions[0], Action::set_incar("ISYM", 0));

        let relax = input("NSW = 50\nISIF = 3\nICHARG = 11\n", 2, KpointStyle::Gamma);
        let actions = handler.plan(&detected, &relax, &RunState::default());
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            Action::SetStructure { structure } => {
                assert!((structure.lattice[(0, 0)] - 6.0).abs() < 1e-12)
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_rot_matrix() {
        let mut handler = VaspErrorHandler::new("vasp.out", DiagnosticKind::default_enabled(), 50);
        let detected = set(&[DiagnosticKind::RotMatrix]);
        let monkhorst = input("", 1, KpointStyle::Monkhorst);
        match &handler.plan(&detected, &monkhorst, &RunState::default())[0] {
            Action::SetKpoints { kpoints } => {
                assert_eq!(kpoints.style, KpointStyle::Gamma);
                assert_eq!(kpoints.mesh, [4, 4, 4]);
            }
            other => panic!("unexpected action {:?}", other),
        }
        let gamma = input("", 1, KpointStyle::Gamma);
        assert_eq!(
            handler.plan(&detected, &gamma, &RunState::default()),
            vec![Action::set_incar("ISYM", 0)]
        );
    }

    #[test]
    fn test_priority_order_is_fixed() {
        let mut handler = VaspErrorHandler::new("vasp.out", DiagnosticKind::default_enabled(), 50);
        let vi = input("", 1, KpointStyle::Gamma);
        let detected = set(&[DiagnosticKind::PointGroup, DiagnosticKind::Tet, DiagnosticKind::Amin]);
        assert_eq!(
            handler.plan(&detected, &vi, &RunState::default()),
            vec![
                Action::set_incar("ISMEAR", 0),
                Action::set_incar("AMIN", 0.01),
                Action::set_incar("ISYM", 0),
            ]
        );
    }

    #[test]
    fn test_too_few_bands() {
        let mut handler = VaspErrorHandler::new("vasp.out", DiagnosticKind::default_enabled(), 50);
        let detected = set(&[DiagnosticKind::TooFewBands, DiagnosticKind::Pssyevx]);
        let vi = input("", 1, KpointStyle::Gamma);
        let run = RunState {
            ionic_steps: 0,
            outcar_nbands: Some(24),
        };
        assert_eq!(
            handler.plan(&detected, &vi, &run),
            vec![Action::set_incar("NBANDS", 26), Action::set_incar("ALGO", "Normal")]
        );
        // Unknown band count skips only this kind.
        assert_eq!(
            handler.plan(&detected, &vi, &RunState::default()),
            vec![Action::set_incar("ALGO", "Normal")]
        );
    }

    #[test]
    fn test_rhosyg() {
        let mut handler = VaspErrorHandler::new("vasp.out", DiagnosticKind::default_enabled(), 50);
        let detected = set(&[DiagnosticKind::Rhosyg]);
        let vi = input("", 1, KpointStyle::Gamma);
        assert_eq!(
            handler.plan(&detected, &vi, &RunState::default()),
            vec![Action::set_incar("ISYM", 0), Action::set_incar("SYMPREC", 1e-4)]
        );
        let vi = input("SYMPREC = 1e-5\n", 1, KpointStyle::Gamma);
        assert_eq!(
            handler.plan(&detected, &vi, &RunState::default()),
            vec![Action::set_incar("SYMPREC", 1e-4)]
        );
    }

    #[test]
    fn test_uncorrectable_kinds_plan_nothing() {
        let mut handler = VaspErrorHandler::new("vasp.out", DiagnosticKind::ALL.to_vec(), 50);
        let vi = input("", 1, KpointStyle::Gamma);
        let detected = set(&[DiagnosticKind::ElfNcl, DiagnosticKind::Brmix]);
        assert!(handler.plan(&detected, &vi, &RunState::default()).is_empty());
    }

    #[test]
    fn test_check_and_correct_on_disk() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        fs::write(dir.join("INCAR"), "ALGO = Fast\n").unwrap();
        fs::write(dir.join("KPOINTS"), "mesh\n0\nGamma\n2 2 2\n0 0 0\n").unwrap();
        fs::write(
            dir.join("POSCAR"),
            "Si\n1.0\n5 0 0\n0 5 0\n0 0 5\nSi\n1\nDirect\n0 0 0\n",
        )
        .unwrap();
        fs::write(dir.join("vasp.out"), " ERROR EDDIAG: Call to routine ZHEEV failed!\n").unwrap();

        let mut handler = VaspErrorHandler::new("vasp.out", DiagnosticKind::default_enabled(), 50);
        assert!(handler.check(dir).unwrap());
        let correction = handler.correct(dir).unwrap();
        assert!(correction.is_recoverable());
        assert_eq!(correction.errors, vec!["zheev".to_string()]);
        let incar = Incar::from_file(&dir.join("INCAR")).unwrap();
        assert_eq!(incar.get_str("ALGO", ""), "Exact");
        assert!(dir.join("error.1").join("INCAR").exists());
    }

    #[test]
    fn test_meminfo_usage() {
        let text = "MemTotal:       1000 kB\nMemFree:         100 kB\nMemAvailable:    250 kB\n";
        assert!((meminfo_usage(text).unwrap() - 0.75).abs() < 1e-12);
    }

    struct FixedProbe(f64);

    impl MemoryProbe for FixedProbe {
        fn usage_ratio(&self) -> Result<f64> {
            Ok(self.0)
        }
    }

    #[test]
    fn test_memory_handler() {
        let tmp = TempDir::new().unwrap();
        let mut high = MemorySwapHandler::with_probe(0.85, Box::new(FixedProbe(0.9)));
        let mut low = MemorySwapHandler::with_probe(0.85, Box::new(FixedProbe(0.5)));
        assert!(high.check(tmp.path()).unwrap());
        assert!(!low.check(tmp.path()).unwrap());
        assert!(!high.correct(tmp.path()).unwrap().is_recoverable());
    }

    #[test]
    fn test_non_converging_window() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("INCAR"), "NELM = 2\n").unwrap();
        let mut text = String::new();
        for step in 1..=3 {
            text.push_str("DAV:   1    -0.1E+02   0.1   0.1  10   0.1\n");
            text.push_str("DAV:   2    -0.1E+02   0.1   0.1  10   0.1\n");
            text.push_str(&format!("   {} F= -.1E+02 E0= -.1E+02  d E =-.1E+02\n", step));
        }
        text.push_str("DAV:   1    -0.1E+02   0.1   0.1  10   0.1\n");
        fs::write(tmp.path().join("OSZICAR"), &text).unwrap();

        assert!(NonConvergingHandler::new(3).check(tmp.path()).unwrap());
        assert!(!NonConvergingHandler::new(4).check(tmp.path()).unwrap());
    }

    #[test]
    fn test_diverging_energy() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join("OSZICAR"),
            "DAV:   1     0.5E+07   0.1   0.1  10   0.1\n",
        )
        .unwrap();
        let mut handler = DivergingEnergyHandler::new();
        assert!(handler.check(tmp.path()).unwrap());
        assert_eq!(
            handler.correct(tmp.path()).unwrap(),
            Correction::unrecoverable("Energy_diverging")
        );
    }

    #[test]
    fn test_dielectric_nelm_line() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("INCAR"), "NELM = 100\n").unwrap();
        fs::write(tmp.path().join("OSZICAR"), "DAV: 100    -0.1E+02   0.1\n").unwrap();
        assert!(DielectricMaxIterationHandler::new().check(tmp.path()).unwrap());
    }

    #[test]
    fn test_unconverged_electronic_then_exhausted() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        fs::write(dir.join("INCAR"), "NELM = 2\nNSW = 10\n").unwrap();
        fs::write(dir.join("KPOINTS"), "mesh\n0\nGamma\n2 2 2\n0 0 0\n").unwrap();
        let poscar = "Si\n1.0\n5 0 0\n0 5 0\n0 0 5\nSi\n1\nDirect\n0 0 0\n";
        fs::write(dir.join("POSCAR"), poscar).unwrap();
        fs::write(dir.join("CONTCAR"), poscar).unwrap();
        fs::write(
            dir.join("OSZICAR"),
            "DAV:   1    -0.1E+02   0.1\nDAV:   2    -0.1E+02   0.1\n   1 F= -.1E+02 E0= -.1E+02  d E =-.1E+02\n",
        )
        .unwrap();

        let mut handler = UnconvergedErrorHandler::new();
        assert!(handler.check(dir).unwrap());
        let correction = handler.correct(dir).unwrap();
        assert!(correction.is_recoverable());
        let incar = Incar::from_file(&dir.join("INCAR")).unwrap();
        assert_eq!(incar.get_str("ALGO", ""), "Normal");
        assert_eq!(incar.get_i64("NELMDL", 0), -6);

        let again = handler.correct(dir).unwrap();
        assert!(!again.is_recoverable());
    }

    #[test]
    fn test_resource_probes_are_monitor_only() {
        let memory = MemorySwapHandler::with_probe(0.85, Box::new(FixedProbe(0.9)));
        let time = TooLongTimeHandler::new(10);
        for handler in [&memory as &dyn ErrorHandler, &time] {
            assert!(handler.is_monitor());
            assert!(!handler.is_post_run());
        }
        assert!(VaspErrorHandler::new("vasp.out", DiagnosticKind::default_enabled(), 50).is_post_run());
        assert!(NonConvergingHandler::new(10).is_post_run());
        assert!(AlwaysFailHandler.is_post_run());
    }

    #[test]
    fn test_handler_sets() {
        let mut settings = HandlerSettings::default();
        assert_eq!(handler_set(&settings).unwrap().len(), 6);
        settings.handler_name = "no_handler".into();
        assert!(handler_set(&settings).unwrap().is_empty());
        settings.handler_name = "always_fail".into();
        assert_eq!(handler_set(&settings).unwrap()[0].name(), "always_fail");
        settings.handler_name = "bogus".into();
        assert!(handler_set(&settings).is_err());
    }
}
