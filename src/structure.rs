//! Crystal structure representation and POSCAR input/output.
//!
//! This module provides the periodic structure type used throughout the job
//! controller:
//!
//! - [`Structure`]: lattice, species and fractional coordinates of every site
//!
//! Lattice vectors are stored as the *rows* of a `Matrix3<f64>` in Angstrom,
//! which is the same convention VASP uses in POSCAR and CONTCAR files.
//!
//! # Transformations
//!
//! Two transformations are needed by the corrective actions:
//!
//! - [`Structure::apply_strain`]: uniform strain of every lattice vector
//! - [`Structure::make_supercell`]: integer transformation of the basis
//!   (including pure permutations such as swapping the b and c axes)

use crate::io::ParseError;
use nalgebra::{Matrix3, RowVector3, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

type Result<T> = std::result::Result<T, ParseError>;

/// Tolerance used when wrapping fractional coordinates back into the cell.
const FRAC_TOL: f64 = 1e-8;

/// Periodic crystal structure.
///
/// # Examples
///
/// ```
/// use visejob::structure::Structure;
/// use nalgebra::Matrix3;
///
/// let lattice = Matrix3::new(4.0, 0.0, 0.0, 0.0, 4.0, 0.0, 0.0, 0.0, 4.0);
/// let s = Structure::new(
///     lattice,
///     vec!["Na".to_string(), "Cl".to_string()],
///     vec![[0.0, 0.0, 0.0], [0.5, 0.5, 0.5]],
/// );
/// assert_eq!(s.num_sites(), 2);
/// assert!((s.volume() - 64.0).abs() < 1e-10);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "SerializableStructure", into = "SerializableStructure")]
pub struct Structure {
    /// Free-text comment written on the first POSCAR line
    pub comment: String,
    /// Lattice vectors as matrix rows, in Angstrom
    pub lattice: Matrix3<f64>,
    /// Element symbol of each site
    pub species: Vec<String>,
    /// Fractional coordinates of each site
    pub frac_coords: Vec<[f64; 3]>,
}

/// Serializable wrapper for [`Structure`].
///
/// `Matrix3` is flattened into nested arrays so that `structure_opt.json`
/// stays readable and independent of the nalgebra serialization format.
#[derive(Serialize, Deserialize)]
pub struct SerializableStructure {
    comment: String,
    lattice: [[f64; 3]; 3],
    species: Vec<String>,
    frac_coords: Vec<[f64; 3]>,
}

impl From<Structure> for SerializableStructure {
    fn from(s: Structure) -> Self {
        let mut lattice = [[0.0; 3]; 3];
        for (i, row) in lattice.iter_mut().enumerate() {
            for (j, value) in row.iter_mut().enumerate() {
                *value = s.lattice[(i, j)];
            }
        }
        Self {
            comment: s.comment,
            lattice,
            species: s.species,
            frac_coords: s.frac_coords,
        }
    }
}

impl From<SerializableStructure> for Structure {
    fn from(s: SerializableStructure) -> Self {
        let l = s.lattice;
        Self {
            comment: s.comment,
            lattice: Matrix3::new(
                l[0][0], l[0][1], l[0][2], l[1][0], l[1][1], l[1][2], l[2][0], l[2][1], l[2][2],
            ),
            species: s.species,
            frac_coords: s.frac_coords,
        }
    }
}

impl Structure {
    /// Creates a structure from a lattice, per-site species and fractional coordinates.
    ///
    /// # Panics
    ///
    /// Panics if `species` and `frac_coords` have different lengths.
    pub fn new(lattice: Matrix3<f64>, species: Vec<String>, frac_coords: Vec<[f64; 3]>) -> Self {
        assert_eq!(species.len(), frac_coords.len());
        Self {
            comment: String::new(),
            lattice,
            species,
            frac_coords,
        }
    }

    /// Number of sites in the cell.
    pub fn num_sites(&self) -> usize {
        self.species.len()
    }

    /// Cell volume in cubic Angstrom.
    pub fn volume(&self) -> f64 {
        self.lattice.determinant().abs()
    }

    /// Lengths of the reciprocal lattice vectors including the 2π factor (1/Angstrom).
    ///
    /// Returns `None` for a singular lattice.
    pub fn reciprocal_lengths(&self) -> Option<[f64; 3]> {
        let inv = self.lattice.try_inverse()?;
        // Reciprocal vectors are the columns of the inverse, scaled by 2π.
        let two_pi = 2.0 * std::f64::consts::PI;
        Some([
            two_pi * inv.column(0).norm(),
            two_pi * inv.column(1).norm(),
            two_pi * inv.column(2).norm(),
        ])
    }

    /// Applies a uniform strain to every lattice vector.
    ///
    /// Fractional coordinates are kept, so every site is displaced with the
    /// cell. A strain of `0.2` enlarges each vector by 20 %.
    pub fn apply_strain(&mut self, strain: f64) {
        self.lattice *= 1.0 + strain;
    }

    /// Copy with every fractional coordinate wrapped into `[0, 1)`.
    pub fn wrapped(&self) -> Structure {
        let mut wrapped = self.clone();
        for site in wrapped.frac_coords.iter_mut() {
            for x in site.iter_mut() {
                *x = wrap_frac(*x);
            }
        }
        wrapped
    }

    /// Returns a new structure whose lattice is `matrix · lattice`.
    ///
    /// The matrix must be integer valued and non-singular. For unimodular
    /// matrices (determinant ±1, e.g. axis permutations) the number of sites
    /// is unchanged; otherwise the cell is filled with every image of the
    /// original sites that falls inside the new cell.
    pub fn make_supercell(&self, matrix: &[[i32; 3]; 3]) -> Result<Structure> {
        let m = Matrix3::from_fn(|i, j| f64::from(matrix[i][j]));
        let det = m.determinant().round();
        if det == 0.0 {
            return Err(ParseError::Invalid(
                "supercell matrix is singular".to_string(),
            ));
        }
        let m_inv = m
            .try_inverse()
            .ok_or_else(|| ParseError::Invalid("supercell matrix is singular".to_string()))?;
        let new_lattice = m * self.lattice;

        // Integer translations spanning the new cell expressed in old fractional units.
        let mut lo = [0i32; 3];
        let mut hi = [0i32; 3];
        for corner in 0..8 {
            let c = Vector3::new(
                f64::from(corner & 1),
                f64::from((corner >> 1) & 1),
                f64::from((corner >> 2) & 1),
            );
            let p = m.transpose() * c;
            for k in 0..3 {
                lo[k] = lo[k].min(p[k].floor() as i32);
                hi[k] = hi[k].max(p[k].ceil() as i32);
            }
        }

        let mut species = Vec::new();
        let mut frac_coords = Vec::new();
        for (sp, f) in self.species.iter().zip(&self.frac_coords) {
            for ta in lo[0]..=hi[0] {
                for tb in lo[1]..=hi[1] {
                    for tc in lo[2]..=hi[2] {
                        let old = RowVector3::new(
                            f[0] + f64::from(ta),
                            f[1] + f64::from(tb),
                            f[2] + f64::from(tc),
                        );
                        let new = old * m_inv;
                        if new.iter().all(|&x| x > -FRAC_TOL && x < 1.0 - FRAC_TOL) {
                            species.push(sp.clone());
                            frac_coords.push([
                                wrap_frac(new[0]),
                                wrap_frac(new[1]),
                                wrap_frac(new[2]),
                            ]);
                        }
                    }
                }
            }
        }

        let expected = self.num_sites() * det.abs() as usize;
        if species.len() != expected {
            return Err(ParseError::Invalid(format!(
                "supercell produced {} sites, expected {}",
                species.len(),
                expected
            )));
        }

        Ok(Structure {
            comment: self.comment.clone(),
            lattice: new_lattice,
            species,
            frac_coords,
        })
    }

    /// Reads a POSCAR/CONTCAR file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_poscar_str(&content)
    }

    /// Parses POSCAR text (VASP 5 format with species line).
    ///
    /// Both `Direct` and `Cartesian` coordinates are accepted, and an optional
    /// `Selective dynamics` line is skipped.
    pub fn from_poscar_str(content: &str) -> Result<Self> {
        let mut lines = content.lines();
        let comment = lines.next().unwrap_or("").trim().to_string();

        let scale: f64 = next_line(&mut lines, "scale factor")?
            .split_whitespace()
            .next()
            .ok_or_else(|| ParseError::Invalid("empty scale line".to_string()))?
            .parse()
            .map_err(|_| ParseError::Invalid("invalid scale factor".to_string()))?;

        let mut rows = [[0.0; 3]; 3];
        for row in rows.iter_mut() {
            *row = parse_triple(next_line(&mut lines, "lattice vector")?)?;
        }
        let mut lattice = Matrix3::new(
            rows[0][0], rows[0][1], rows[0][2], rows[1][0], rows[1][1], rows[1][2], rows[2][0],
            rows[2][1], rows[2][2],
        );
        // Negative scale is the target volume.
        let factor = if scale < 0.0 {
            (scale.abs() / lattice.determinant().abs()).cbrt()
        } else {
            scale
        };
        lattice *= factor;

        let symbols: Vec<String> = next_line(&mut lines, "species")?
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if symbols.iter().any(|s| s.parse::<usize>().is_ok()) {
            return Err(ParseError::Invalid(
                "POSCAR without species line is not supported".to_string(),
            ));
        }
        let counts: Vec<usize> = next_line(&mut lines, "species counts")?
            .split_whitespace()
            .map(|c| {
                c.parse()
                    .map_err(|_| ParseError::Invalid(format!("invalid species count: {}", c)))
            })
            .collect::<Result<_>>()?;
        if counts.len() != symbols.len() {
            return Err(ParseError::Invalid(
                "species and counts lines differ in length".to_string(),
            ));
        }

        let mut mode = next_line(&mut lines, "coordinate mode")?.trim().to_string();
        if mode.to_lowercase().starts_with('s') {
            mode = next_line(&mut lines, "coordinate mode")?.trim().to_string();
        }
        let cartesian = matches!(mode.chars().next(), Some('C' | 'c' | 'K' | 'k'));

        let inv = lattice
            .try_inverse()
            .ok_or_else(|| ParseError::Invalid("singular lattice".to_string()))?;
        let mut species = Vec::new();
        let mut frac_coords = Vec::new();
        for (symbol, &count) in symbols.iter().zip(&counts) {
            for _ in 0..count {
                let xyz = parse_triple(next_line(&mut lines, "site coordinates")?)?;
                let frac = if cartesian {
                    let cart = RowVector3::new(xyz[0], xyz[1], xyz[2]) * factor;
                    let f = cart * inv;
                    [f[0], f[1], f[2]]
                } else {
                    xyz
                };
                species.push(symbol.clone());
                frac_coords.push(frac);
            }
        }

        Ok(Self {
            comment,
            lattice,
            species,
            frac_coords,
        })
    }

    /// Formats the structure as POSCAR text in `Direct` coordinates.
    pub fn to_poscar_string(&self) -> String {
        let mut out = String::new();
        let comment = if self.comment.is_empty() {
            self.formula()
        } else {
            self.comment.clone()
        };
        let _ = writeln!(out, "{}", comment);
        let _ = writeln!(out, "1.0");
        for i in 0..3 {
            let _ = writeln!(
                out,
                "  {:>20.12}  {:>20.12}  {:>20.12}",
                self.lattice[(i, 0)],
                self.lattice[(i, 1)],
                self.lattice[(i, 2)]
            );
        }
        let groups = self.species_groups();
        let names: Vec<&str> = groups.iter().map(|(s, _)| s.as_str()).collect();
        let counts: Vec<String> = groups.iter().map(|(_, n)| n.to_string()).collect();
        let _ = writeln!(out, "{}", names.join(" "));
        let _ = writeln!(out, "{}", counts.join(" "));
        let _ = writeln!(out, "Direct");
        for f in &self.frac_coords {
            let _ = writeln!(out, "  {:.12}  {:.12}  {:.12}", f[0], f[1], f[2]);
        }
        out
    }

    /// Writes the structure to `path` in POSCAR format.
    pub fn write_file(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_poscar_string())?;
        Ok(())
    }

    /// Reduced-order formula such as `Mg1O1` built from consecutive species runs.
    pub fn formula(&self) -> String {
        self.species_groups()
            .iter()
            .map(|(s, n)| format!("{}{}", s, n))
            .collect()
    }

    /// Consecutive runs of identical species, as POSCAR requires.
    fn species_groups(&self) -> Vec<(String, usize)> {
        let mut groups: Vec<(String, usize)> = Vec::new();
        for sp in &self.species {
            match groups.last_mut() {
                Some((last, n)) if last == sp => *n += 1,
                _ => groups.push((sp.clone(), 1)),
            }
        }
        groups
    }
}

fn next_line<'a>(lines: &mut std::str::Lines<'a>, what: &str) -> Result<&'a str> {
    lines
        .next()
        .ok_or_else(|| ParseError::Invalid(format!("POSCAR ended before {}", what)))
}

fn parse_triple(line: &str) -> Result<[f64; 3]> {
    let values: Vec<f64> = line
        .split_whitespace()
        .take(3)
        .map(|v| {
            v.parse()
                .map_err(|_| ParseError::Invalid(format!("invalid number: {}", v)))
        })
        .collect::<Result<_>>()?;
    if values.len() != 3 {
        return Err(ParseError::Invalid(format!(
            "expected three numbers in line: {}",
            line
        )));
    }
    Ok([values[0], values[1], values[2]])
}

fn wrap_frac(x: f64) -> f64 {
    let w = x - x.floor();
    if (1.0 - w).abs() < FRAC_TOL {
        0.0
    } else {
        w
    }
}
