//! Parsing of VASP output files.
//!
//! Only the fields the job controller and its error handlers consume are
//! extracted:
//!
//! - **OSZICAR**: electronic step records (`N`, `E`) grouped by ionic step and
//!   the ionic step summaries (`F`, `E0`)
//! - **OUTCAR**: the `NBANDS` value and whether the ionic relaxation reached the
//!   required accuracy
//!
//! [`RunSummary`] combines both with the INCAR caps (`NELM`, `NSW`) into the
//! convergence flags of a finished run.
//!
//! # OSZICAR Format
//!
//! ```text
//!        N       E                     dE             d eps       ncg     rms          rms(c)
//! DAV:   1    -0.103927350000E+02   -0.10393E+02   -0.18562E+03   320   0.352E+02
//! RMM:   2    -0.107817090000E+02   -0.38898E+00   -0.26145E+01   350   0.234E+01
//!    1 F= -.10784089E+02 E0= -.10783817E+02  d E =-.107841E+02
//! ```

use crate::incar::Incar;
use crate::io::ParseError;
use crate::naming;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

type Result<T> = std::result::Result<T, ParseError>;

/// VASP default for `NELM`
pub const DEFAULT_NELM: i64 = 60;

/// Maximum number of electronic steps per ionic step set by `NELM`.
///
/// A missing or non-positive `NELM` means the VASP default.
pub fn max_scf_steps(incar: &Incar) -> usize {
    usize::try_from(incar.get_i64("NELM", DEFAULT_NELM))
        .ok()
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_NELM as usize)
}

// Handles 1.23, -.107E+02, 0.394493589841E+03 and Fortran D exponents
const FLOAT_RE: &str = r"[-+]?(?:\d+\.?\d*|\.\d+)(?:[eEdD][-+]?\d+)?";

lazy_static! {
    // Electronic step line: "DAV:   1    -0.103927350000E+02 ..."
    static ref ELECTRONIC_RE: Regex = Regex::new(&format!(
        r"^\s*\w+:\s*(\d+)\s+({0})",
        FLOAT_RE
    )).unwrap();

    // Ionic step line: "   1 F= -.10784089E+02 E0= -.10783817E+02  d E =..."
    static ref IONIC_RE: Regex = Regex::new(&format!(
        r"^\s*(\d+)\s+F=\s*({0})\s+E0=\s*({0})",
        FLOAT_RE
    )).unwrap();

    static ref NBANDS_RE: Regex = Regex::new(r"NBANDS\s*=\s*(\d+)").unwrap();
}

fn parse_float(raw: &str) -> Result<f64> {
    raw.replace(['d', 'D'], "e")
        .parse()
        .map_err(|_| ParseError::Invalid(format!("invalid number in OSZICAR: {}", raw)))
}

/// One electronic (SCF) iteration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElectronicStep {
    /// Iteration index within the ionic step
    pub n: u32,
    /// Total free energy after the iteration
    pub e: f64,
}

/// Summary line of one ionic step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IonicStep {
    /// Free energy `F`
    pub f: f64,
    /// Energy extrapolated to sigma -> 0
    pub e0: f64,
}

/// Parsed OSZICAR.
///
/// `electronic_steps` holds one group per ionic step. A run still in progress
/// has one more group than ionic summaries: the steps of the current ionic
/// step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Oszicar {
    /// Electronic iterations grouped by ionic step
    pub electronic_steps: Vec<Vec<ElectronicStep>>,
    /// Ionic step summaries
    pub ionic_steps: Vec<IonicStep>,
}

impl Oszicar {
    /// Reads an OSZICAR file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses OSZICAR text.
    pub fn parse(content: &str) -> Result<Self> {
        let mut oszicar = Oszicar::default();
        let mut current = Vec::new();

        for line in content.lines() {
            if let Some(caps) = IONIC_RE.captures(line) {
                oszicar.ionic_steps.push(IonicStep {
                    f: parse_float(&caps[2])?,
                    e0: parse_float(&caps[3])?,
                });
                oszicar.electronic_steps.push(std::mem::take(&mut current));
            } else if let Some(caps) = ELECTRONIC_RE.captures(line) {
                let n = caps[1]
                    .parse()
                    .map_err(|_| ParseError::Invalid(format!("invalid step index: {}", &caps[1])))?;
                current.push(ElectronicStep {
                    n,
                    e: parse_float(&caps[2])?,
                });
            }
        }
        if !current.is_empty() {
            oszicar.electronic_steps.push(current);
        }
        Ok(oszicar)
    }

    /// Energy `E0` of the last ionic step.
    pub fn final_energy(&self) -> Option<f64> {
        self.ionic_steps.last().map(|s| s.e0)
    }

    /// Number of completed ionic steps.
    pub fn num_ionic_steps(&self) -> usize {
        self.ionic_steps.len()
    }

    /// Electronic iterations of the most recent (possibly unfinished) ionic step.
    pub fn last_electronic_steps(&self) -> &[ElectronicStep] {
        self.electronic_steps.last().map(Vec::as_slice).unwrap_or(&[])
    }
}

/// The few OUTCAR fields used by the error handlers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcar {
    /// Number of bands actually used
    pub nbands: Option<i64>,
    /// Whether "reached required accuracy" was printed
    pub reached_required_accuracy: bool,
}

impl Outcar {
    /// Reads an OUTCAR file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    /// Parses OUTCAR text.
    pub fn parse(content: &str) -> Self {
        let mut outcar = Outcar::default();
        for line in content.lines() {
            if outcar.nbands.is_none() {
                if let Some(caps) = NBANDS_RE.captures(line) {
                    outcar.nbands = caps[1].parse().ok();
                }
            }
            if line.contains("reached required accuracy") {
                outcar.reached_required_accuracy = true;
            }
        }
        outcar
    }
}

/// Outcome of a finished run as read from its output files.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// `E0` of the last ionic step
    pub final_energy: Option<f64>,
    /// Number of ionic steps taken
    pub num_ionic_steps: usize,
    /// Electronic iterations of the last ionic step
    pub last_scf_steps: usize,
    /// Whether the last SCF cycle finished below `NELM`
    pub converged_electronic: bool,
    /// Whether the relaxation ended before exhausting `NSW`
    pub converged_ionic: bool,
}

impl RunSummary {
    /// Builds the summary from OSZICAR (and OUTCAR when present) in `dir`.
    pub fn from_dir(dir: &Path, incar: &Incar) -> Result<Self> {
        let oszicar = Oszicar::from_file(&dir.join(naming::OSZICAR))?;
        let outcar_path = dir.join(naming::OUTCAR);
        let outcar = if outcar_path.exists() {
            Some(Outcar::from_file(&outcar_path)?)
        } else {
            None
        };
        Ok(Self::from_outputs(&oszicar, outcar.as_ref(), incar))
    }

    /// Combines already parsed outputs.
    pub fn from_outputs(oszicar: &Oszicar, outcar: Option<&Outcar>, incar: &Incar) -> Self {
        let nelm = max_scf_steps(incar);
        let nsw = incar.get_i64("NSW", 0);
        let num_ionic_steps = oszicar.num_ionic_steps();
        let last_scf_steps = oszicar.last_electronic_steps().len();
        let reached = outcar.map_or(false, |o| o.reached_required_accuracy);

        Self {
            final_energy: oszicar.final_energy(),
            num_ionic_steps,
            last_scf_steps,
            converged_electronic: num_ionic_steps > 0 && last_scf_steps < nelm,
            converged_ionic: nsw <= 1 || reached || (num_ionic_steps as i64) < nsw,
        }
    }

    /// Both electronic and ionic convergence.
    pub fn converged(&self) -> bool {
        self.converged_electronic && self.converged_ionic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OSZICAR: &str = "\
       N       E                     dE             d eps       ncg     rms          rms(c)
DAV:   1     0.394493589841E+03    0.39449E+03   -0.23296E+04  1632   0.120E+03
DAV:   2     0.120130140300E+02   -0.38248E+03   -0.36583E+03  2024   0.278E+02
RMM:   3    -0.107817090000E+02   -0.22794E+02   -0.26145E+01  1700   0.234E+01    0.318E+00
   1 F= -.10784089E+02 E0= -.10783817E+02  d E =-.107841E+02
DAV:   1    -0.107900000000E+02   -0.82910E-02   -0.11264E-01  1616   0.269E+00
RMM:   2    -0.107910000000E+02   -0.10000E-02   -0.71244E-03  1661   0.642E-01
   2 F= -.10791234E+02 E0= -.10790999E+02  d E =-.714500E-02
";

    #[test]
    fn test_parse_oszicar() {
        let osz = Oszicar::parse(OSZICAR).unwrap();
        assert_eq!(osz.num_ionic_steps(), 2);
        assert_eq!(osz.electronic_steps.len(), 2);
        assert_eq!(osz.electronic_steps[0].len(), 3);
        assert!((osz.final_energy().unwrap() + 10.790999).abs() < 1e-9);
        assert_eq!(osz.last_electronic_steps()[1].n, 2);
    }

    #[test]
    fn test_in_progress_group() {
        let text = format!("{}DAV:   1    -0.1E+02   0.1   0.1  10   0.1\n", OSZICAR);
        let osz = Oszicar::parse(&text).unwrap();
        assert_eq!(osz.num_ionic_steps(), 2);
        assert_eq!(osz.electronic_steps.len(), 3);
        assert_eq!(osz.last_electronic_steps().len(), 1);
    }

    #[test]
    fn test_parse_outcar() {
        let out = Outcar::parse(
            "   k-points           NKPTS =      1   k-points in BZ     NKDIM =      1   number of bands    NBANDS=     12\n reached required accuracy - stopping structural energy minimisation\n",
        );
        assert_eq!(out.nbands, Some(12));
        assert!(out.reached_required_accuracy);
    }

    #[test]
    fn test_summary_flags() {
        let osz = Oszicar::parse(OSZICAR).unwrap();
        let incar = Incar::parse("NSW = 2\nNELM = 2\n");
        let summary = RunSummary::from_outputs(&osz, None, &incar);
        assert!(!summary.converged_electronic);
        assert!(!summary.converged_ionic);

        let incar = Incar::parse("NSW = 50\n");
        let summary = RunSummary::from_outputs(&osz, None, &incar);
        assert!(summary.converged());
        assert_eq!(summary.num_ionic_steps, 2);
    }

    #[test]
    fn test_max_scf_steps() {
        assert_eq!(max_scf_steps(&Incar::new()), 60);
        assert_eq!(max_scf_steps(&Incar::parse("NELM = 100\n")), 100);
        assert_eq!(max_scf_steps(&Incar::parse("NELM = -5\n")), 60);
        assert_eq!(max_scf_steps(&Incar::parse("NELM = 0\n")), 60);
    }
}
