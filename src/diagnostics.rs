//! Detection of known VASP error signatures in the stdout log.
//!
//! Every [`DiagnosticKind`] owns a list of literal substrings. A log line
//! matches a kind when any of its substrings occurs in the trimmed line. The
//! enum is declared in correction priority order, so a [`DiagnosticSet`]
//! (a `BTreeSet`) iterates kinds in the order their corrections are applied.

use crate::incar::Incar;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;

/// Kinds detected in one scan, ordered by correction priority.
pub type DiagnosticSet = BTreeSet<DiagnosticKind>;

/// Known VASP failure signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// Tetrahedron method cannot be used with the k-point mesh
    Tet,
    /// Tetrahedron density of states failure
    Dentet,
    /// Inverse rotation matrix not found
    InvRotMat,
    /// WAVECAR incompatible with the current basis
    PlaneWaveCoeff,
    /// Cholesky decomposition failure, usually short bonds
    Zpotrf,
    /// Non-hermitian sub-space matrix in Davidson
    Subspacematrix,
    /// Real-space projection failure
    Rspher,
    /// Real-space projector optimisation failure
    RealOptlay,
    /// Spherical Bessel iteration not converging
    NichtKonv,
    /// Irreducible tetrahedra need special k-points
    Tetirr,
    /// k-point shift cannot be reproduced
    IncorrectShift,
    /// Non-integer rotation matrix element
    RotMatrix,
    /// Very long lattice vector without AMIN
    Amin,
    /// Left-handed basis vectors
    TripleProduct,
    /// Primitive cell search failure
    Pricel,
    /// Ionic step too small
    Brions,
    /// Line minimisation bracketing failure
    Zbrent,
    /// Not enough bands for the electrons
    TooFewBands,
    /// Sub-space rotation failure
    Pssyevx,
    /// RMM-DIIS diagonalisation failure
    Eddrmm,
    /// Davidson diagonalisation failure
    Edddav,
    /// Non-orthogonal wavefunction gradient
    GradNotOrth,
    /// Exact diagonalisation failure
    Zheev,
    /// ELF requested with KPAR > 1
    ElfKpar,
    /// ELF requested in a non-collinear run
    ElfNcl,
    /// Charge-density symmetrisation failure
    Rhosyg,
    /// Symmetry equivalent atom not found
    Posmap,
    /// Missing point group operation
    PointGroup,
    /// Charge-density mixing trouble; matched but never corrected
    Brmix,
}

impl DiagnosticKind {
    /// All kinds in priority order.
    pub const ALL: [DiagnosticKind; 29] = [
        DiagnosticKind::Tet,
        DiagnosticKind::Dentet,
        DiagnosticKind::InvRotMat,
        DiagnosticKind::PlaneWaveCoeff,
        DiagnosticKind::Zpotrf,
        DiagnosticKind::Subspacematrix,
        DiagnosticKind::Rspher,
        DiagnosticKind::RealOptlay,
        DiagnosticKind::NichtKonv,
        DiagnosticKind::Tetirr,
        DiagnosticKind::IncorrectShift,
        DiagnosticKind::RotMatrix,
        DiagnosticKind::Amin,
        DiagnosticKind::TripleProduct,
        DiagnosticKind::Pricel,
        DiagnosticKind::Brions,
        DiagnosticKind::Zbrent,
        DiagnosticKind::TooFewBands,
        DiagnosticKind::Pssyevx,
        DiagnosticKind::Eddrmm,
        DiagnosticKind::Edddav,
        DiagnosticKind::GradNotOrth,
        DiagnosticKind::Zheev,
        DiagnosticKind::ElfKpar,
        DiagnosticKind::ElfNcl,
        DiagnosticKind::Rhosyg,
        DiagnosticKind::Posmap,
        DiagnosticKind::PointGroup,
        DiagnosticKind::Brmix,
    ];

    /// Short name used in logs, settings and `corrections.json`.
    pub fn name(self) -> &'static str {
        match self {
            DiagnosticKind::Tet => "tet",
            DiagnosticKind::Dentet => "dentet",
            DiagnosticKind::InvRotMat => "inv_rot_mat",
            DiagnosticKind::PlaneWaveCoeff => "plane_wave_coeff",
            DiagnosticKind::Zpotrf => "zpotrf",
            DiagnosticKind::Subspacematrix => "subspacematrix",
            DiagnosticKind::Rspher => "rspher",
            DiagnosticKind::RealOptlay => "real_optlay",
            DiagnosticKind::NichtKonv => "nicht_konv",
            DiagnosticKind::Tetirr => "tetirr",
            DiagnosticKind::IncorrectShift => "incorrect_shift",
            DiagnosticKind::RotMatrix => "rot_matrix",
            DiagnosticKind::Amin => "amin",
            DiagnosticKind::TripleProduct => "triple_product",
            DiagnosticKind::Pricel => "pricel",
            DiagnosticKind::Brions => "brions",
            DiagnosticKind::Zbrent => "zbrent",
            DiagnosticKind::TooFewBands => "too_few_bands",
            DiagnosticKind::Pssyevx => "pssyevx",
            DiagnosticKind::Eddrmm => "eddrmm",
            DiagnosticKind::Edddav => "edddav",
            DiagnosticKind::GradNotOrth => "grad_not_orth",
            DiagnosticKind::Zheev => "zheev",
            DiagnosticKind::ElfKpar => "elf_kpar",
            DiagnosticKind::ElfNcl => "elf_ncl",
            DiagnosticKind::Rhosyg => "rhosyg",
            DiagnosticKind::Posmap => "posmap",
            DiagnosticKind::PointGroup => "point_group",
            DiagnosticKind::Brmix => "brmix",
        }
    }

    /// Looks a kind up by its short name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.name() == name.trim())
    }

    /// Log substrings that identify this kind.
    pub fn messages(self) -> &'static [&'static str] {
        match self {
            DiagnosticKind::Tet => &[
                "Tetrahedron method fails for NKPT<4",
                "Fatal error detecting k-mesh",
                "Fatal error: unable to match k-point",
                "Routine TETIRR needs special values",
            ],
            DiagnosticKind::Dentet => &["DENTET"],
            DiagnosticKind::InvRotMat => {
                &["inverse of rotation matrix was not found (increase SYMPREC)"]
            }
            DiagnosticKind::PlaneWaveCoeff => {
                &["ERROR: while reading WAVECAR, plane wave coefficients changed"]
            }
            DiagnosticKind::Zpotrf => &["LAPACK: Routine ZPOTRF failed"],
            DiagnosticKind::Subspacematrix => &["WARNING: Sub-Space-Matrix is not hermitian in DAV"],
            DiagnosticKind::Rspher => &["ERROR RSPHER"],
            DiagnosticKind::RealOptlay => &["REAL_OPTLAY: internal error", "REAL_OPT: internal ERROR"],
            DiagnosticKind::NichtKonv => &["ERROR: SBESSELITER : nicht konvergent"],
            DiagnosticKind::Tetirr => &["Routine TETIRR needs special values"],
            DiagnosticKind::IncorrectShift => &["Could not get correct shifts"],
            DiagnosticKind::RotMatrix => &["Found some non-integer element in rotation matrix"],
            DiagnosticKind::Amin => {
                &["One of the lattice vectors is very long (>50 A), but AMIN"]
            }
            DiagnosticKind::TripleProduct => &["ERROR: the triple product of the basis vectors"],
            DiagnosticKind::Pricel => &["internal error in subroutine PRICEL"],
            DiagnosticKind::Brions => &["BRIONS problems: POTIM should be increased"],
            DiagnosticKind::Zbrent => &[
                "ZBRENT: fatal internal in",
                "ZBRENT: fatal error in bracketing",
            ],
            DiagnosticKind::TooFewBands => &["TOO FEW BANDS"],
            DiagnosticKind::Pssyevx => &["ERROR in subspace rotation PSSYEVX"],
            DiagnosticKind::Eddrmm => &["WARNING in EDDRMM: call to ZHEGV failed"],
            DiagnosticKind::Edddav => &["Error EDDDAV: Call to ZHEGV failed"],
            DiagnosticKind::GradNotOrth => {
                &["EDWAV: internal error, the gradient is not orthogonal"]
            }
            DiagnosticKind::Zheev => &["ERROR EDDIAG: Call to routine ZHEEV failed!"],
            DiagnosticKind::ElfKpar => &["ELF: KPAR>1 not implemented"],
            DiagnosticKind::ElfNcl => &["WARNING: ELF not implemented for non collinear case"],
            DiagnosticKind::Rhosyg => &["RHOSYG internal error"],
            DiagnosticKind::Posmap => {
                &["POSMAP internal error: symmetry equivalent atom not found"]
            }
            DiagnosticKind::PointGroup => &["Error: point group operation missing"],
            DiagnosticKind::Brmix => &["BRMIX: very serious problems"],
        }
    }

    /// Kinds scanned for when no subset is configured: everything except `brmix`.
    pub fn default_enabled() -> Vec<DiagnosticKind> {
        Self::ALL
            .iter()
            .copied()
            .filter(|k| *k != DiagnosticKind::Brmix)
            .collect()
    }

    /// Whether `line` contains one of this kind's signatures.
    pub fn matches(self, line: &str) -> bool {
        let line = line.trim();
        self.messages().iter().any(|msg| line.contains(msg))
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Scans log lines for the `enabled` kinds.
///
/// `brmix` is dropped whenever the INCAR sets `NELECT`: charged (defect)
/// calculations legitimately show the density jump that triggers it.
pub fn scan<I, S>(lines: I, enabled: &[DiagnosticKind], incar: &Incar) -> DiagnosticSet
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let fixed_electron_count = incar.contains("NELECT");
    let mut found = DiagnosticSet::new();
    for line in lines {
        let line = line.as_ref();
        for kind in enabled {
            if *kind == DiagnosticKind::Brmix && fixed_electron_count {
                continue;
            }
            if kind.matches(line) {
                found.insert(*kind);
            }
        }
    }
    found
}

/// Scans the log file at `path`. Invalid UTF-8 is replaced, not rejected.
pub fn scan_file(
    path: &Path,
    enabled: &[DiagnosticKind],
    incar: &Incar,
) -> std::io::Result<DiagnosticSet> {
    let bytes = fs::read(path)?;
    let text = String::from_utf8_lossy(&bytes);
    Ok(scan(text.lines(), enabled, incar))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for kind in DiagnosticKind::ALL {
            assert_eq!(DiagnosticKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(DiagnosticKind::from_name("unknown"), None);
    }

    #[test]
    fn test_all_is_in_priority_order() {
        let mut sorted = DiagnosticKind::ALL;
        sorted.sort();
        assert_eq!(sorted, DiagnosticKind::ALL);
    }

    #[test]
    fn test_shared_signature_hits_both_kinds() {
        let found = scan(
            [" Routine TETIRR needs special values "],
            &DiagnosticKind::default_enabled(),
            &Incar::new(),
        );
        assert!(found.contains(&DiagnosticKind::Tet));
        assert!(found.contains(&DiagnosticKind::Tetirr));
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_brmix_not_enabled_by_default() {
        let found = scan(
            ["BRMIX: very serious problems"],
            &DiagnosticKind::default_enabled(),
            &Incar::new(),
        );
        assert!(found.is_empty());
    }

    #[test]
    fn test_disabled_kind_is_never_reported() {
        let line = " ERROR EDDIAG: Call to routine ZHEEV failed!";
        let found = scan([line], &DiagnosticKind::default_enabled(), &Incar::new());
        assert!(found.contains(&DiagnosticKind::Zheev));

        let enabled: Vec<DiagnosticKind> = DiagnosticKind::default_enabled()
            .into_iter()
            .filter(|k| *k != DiagnosticKind::Zheev)
            .collect();
        assert!(scan([line], &enabled, &Incar::new()).is_empty());
    }

    #[test]
    fn test_brmix_suppressed_by_nelect() {
        let enabled = [DiagnosticKind::Brmix];
        let line = " BRMIX: very serious problems";
        let found = scan([line], &enabled, &Incar::new());
        assert_eq!(found.len(), 1);
        assert!(found.contains(&DiagnosticKind::Brmix));

        let charged = Incar::parse("NELECT = 10\n");
        assert!(scan([line], &enabled, &charged).is_empty());
    }

    #[test]
    fn test_clean_log_gives_empty_set() {
        let found = scan(
            ["running on 16 total cores", "DAV:   1    -0.1E+02"],
            &DiagnosticKind::ALL,
            &Incar::new(),
        );
        assert!(found.is_empty());
    }
}
