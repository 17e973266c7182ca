//! Automatic k-point mesh files.
//!
//! Only the fully automatic mesh format is handled:
//!
//! ```text
//! Automatic mesh
//! 0
//! Gamma
//!   4 4 4
//!   0 0 0
//! ```

use crate::io::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

type Result<T> = std::result::Result<T, ParseError>;

/// Mesh generation style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KpointStyle {
    /// Gamma-centred mesh
    Gamma,
    /// Monkhorst-Pack mesh
    Monkhorst,
}

/// Automatic k-point mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kpoints {
    /// First line of the file
    pub comment: String,
    /// Generation style
    pub style: KpointStyle,
    /// Subdivisions along the three reciprocal vectors
    pub mesh: [u32; 3],
    /// Optional user shift
    pub shift: [f64; 3],
}

impl Kpoints {
    /// Gamma-centred, unshifted mesh.
    pub fn gamma(mesh: [u32; 3]) -> Self {
        Self {
            comment: "Automatic mesh".to_string(),
            style: KpointStyle::Gamma,
            mesh,
            shift: [0.0; 3],
        }
    }

    /// Mesh with `ceil(density * |b_i|)` subdivisions, at least one per direction.
    ///
    /// `reciprocal_lengths` include the 2π factor, see
    /// [`Structure::reciprocal_lengths`](crate::structure::Structure::reciprocal_lengths).
    pub fn from_density(reciprocal_lengths: [f64; 3], density: f64) -> Self {
        let mut mesh = [1u32; 3];
        for (n, b) in mesh.iter_mut().zip(reciprocal_lengths) {
            *n = ((density * b).ceil() as u32).max(1);
        }
        Self::gamma(mesh)
    }

    /// Whether the mesh carries a non-zero user shift.
    pub fn is_shifted(&self) -> bool {
        self.shift.iter().any(|&s| s != 0.0)
    }

    /// Reads a KPOINTS file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses automatic-mesh KPOINTS text.
    pub fn parse(content: &str) -> Result<Self> {
        let lines: Vec<&str> = content.lines().collect();
        if lines.len() < 4 {
            return Err(ParseError::Invalid("KPOINTS file is too short".to_string()));
        }
        let comment = lines[0].trim().to_string();
        if lines[1].trim() != "0" {
            return Err(ParseError::Invalid(
                "only automatic KPOINTS meshes are supported".to_string(),
            ));
        }
        let style = match lines[2].trim().chars().next() {
            Some('G' | 'g') => KpointStyle::Gamma,
            Some('M' | 'm') => KpointStyle::Monkhorst,
            _ => {
                return Err(ParseError::Invalid(format!(
                    "unsupported KPOINTS style: {}",
                    lines[2].trim()
                )))
            }
        };
        let mesh_values: Vec<u32> = lines[3]
            .split_whitespace()
            .map(|v| {
                v.parse()
                    .map_err(|_| ParseError::Invalid(format!("invalid mesh value: {}", v)))
            })
            .collect::<Result<_>>()?;
        if mesh_values.len() != 3 || mesh_values.contains(&0) {
            return Err(ParseError::Invalid(format!(
                "mesh must be three positive integers: {}",
                lines[3].trim()
            )));
        }
        let mut shift = [0.0; 3];
        if let Some(line) = lines.get(4) {
            let values: Vec<f64> = line
                .split_whitespace()
                .filter_map(|v| v.parse().ok())
                .collect();
            if values.len() == 3 {
                shift = [values[0], values[1], values[2]];
            }
        }
        Ok(Self {
            comment,
            style,
            mesh: [mesh_values[0], mesh_values[1], mesh_values[2]],
            shift,
        })
    }

    /// Writes the KPOINTS file.
    pub fn write_file(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_string())?;
        Ok(())
    }
}

impl fmt::Display for Kpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.comment)?;
        writeln!(f, "0")?;
        match self.style {
            KpointStyle::Gamma => writeln!(f, "Gamma")?,
            KpointStyle::Monkhorst => writeln!(f, "Monkhorst-Pack")?,
        }
        writeln!(f, "  {} {} {}", self.mesh[0], self.mesh[1], self.mesh[2])?;
        writeln!(f, "  {} {} {}", self.shift[0], self.shift[1], self.shift[2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_monkhorst() {
        let k = Kpoints::parse("mesh\n0\nMonkhorst-Pack\n 4 4 2\n 0.5 0.5 0\n").unwrap();
        assert_eq!(k.style, KpointStyle::Monkhorst);
        assert_eq!(k.mesh, [4, 4, 2]);
        assert!(k.is_shifted());
    }

    #[test]
    fn test_parse_gamma_without_shift_line() {
        let k = Kpoints::parse("mesh\n0\nGamma\n 7 7 7\n").unwrap();
        assert_eq!(k.style, KpointStyle::Gamma);
        assert!(!k.is_shifted());
    }

    #[test]
    fn test_rejects_explicit_list() {
        assert!(Kpoints::parse("list\n2\nReciprocal\n0 0 0 1\n0.5 0 0 1\n").is_err());
    }

    #[test]
    fn test_from_density() {
        let k = Kpoints::from_density([1.0, 2.0, 0.1], 2.5);
        assert_eq!(k.mesh, [3, 5, 1]);
        assert_eq!(k.style, KpointStyle::Gamma);
    }

    #[test]
    fn test_display_parses_back() {
        let k = Kpoints::gamma([3, 4, 5]);
        assert_eq!(Kpoints::parse(&k.to_string()).unwrap(), k);
    }
}
