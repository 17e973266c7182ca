//! INCAR tag/value model.
//!
//! The INCAR is the run configuration that corrective actions mutate. Tags are
//! stored upper-cased in file order so that writing the file back keeps the
//! user's layout as far as possible.

use crate::io::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

type Result<T> = std::result::Result<T, ParseError>;

/// A single INCAR value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IncarValue {
    /// `.TRUE.` / `.FALSE.`
    Bool(bool),
    /// Integer value, e.g. `ISMEAR = 0`
    Int(i64),
    /// Floating point value, e.g. `EDIFF = 1e-5`
    Float(f64),
    /// Anything else, e.g. `ALGO = Normal` or `MAGMOM = 4*0.6`
    Text(String),
}

impl IncarValue {
    /// Interprets a raw INCAR value string.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.to_uppercase().trim_matches('.') {
            "TRUE" | "T" => return IncarValue::Bool(true),
            "FALSE" | "F" => return IncarValue::Bool(false),
            _ => {}
        }
        if let Ok(i) = raw.parse::<i64>() {
            return IncarValue::Int(i);
        }
        // Fortran style exponents such as 1.0D-05 also appear in the wild.
        if let Ok(f) = raw.replace(['d', 'D'], "e").parse::<f64>() {
            return IncarValue::Float(f);
        }
        IncarValue::Text(raw.to_string())
    }

    /// Numeric view of the value.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            IncarValue::Int(i) => Some(*i as f64),
            IncarValue::Float(f) => Some(*f),
            IncarValue::Text(s) => s.parse().ok(),
            IncarValue::Bool(_) => None,
        }
    }

    /// Integer view of the value; floats are accepted when integral.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            IncarValue::Int(i) => Some(*i),
            IncarValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            IncarValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for IncarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IncarValue::Bool(true) => write!(f, ".TRUE."),
            IncarValue::Bool(false) => write!(f, ".FALSE."),
            IncarValue::Int(i) => write!(f, "{}", i),
            IncarValue::Float(x) => write!(f, "{:?}", x),
            IncarValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for IncarValue {
    fn from(v: bool) -> Self {
        IncarValue::Bool(v)
    }
}

impl From<i64> for IncarValue {
    fn from(v: i64) -> Self {
        IncarValue::Int(v)
    }
}

impl From<i32> for IncarValue {
    fn from(v: i32) -> Self {
        IncarValue::Int(i64::from(v))
    }
}

impl From<f64> for IncarValue {
    fn from(v: f64) -> Self {
        IncarValue::Float(v)
    }
}

impl From<&str> for IncarValue {
    fn from(v: &str) -> Self {
        IncarValue::Text(v.to_string())
    }
}

/// Ordered INCAR tag map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Incar {
    params: Vec<(String, IncarValue)>,
}

impl Incar {
    /// Creates an empty INCAR.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads an INCAR file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    /// Parses INCAR text.
    ///
    /// Comments start with `#` or `!`; several `TAG = value` pairs may share a
    /// line when separated by `;`. Lines without `=` are ignored.
    pub fn parse(content: &str) -> Self {
        let mut incar = Incar::new();
        for line in content.lines() {
            let line = match line.find(['#', '!']) {
                Some(i) => &line[..i],
                None => line,
            };
            for pair in line.split(';') {
                if let Some((tag, value)) = pair.split_once('=') {
                    let tag = tag.trim();
                    if tag.is_empty() {
                        continue;
                    }
                    incar.set(tag, IncarValue::parse(value));
                }
            }
        }
        incar
    }

    /// Returns the value of `tag` (case insensitive).
    pub fn get(&self, tag: &str) -> Option<&IncarValue> {
        let tag = tag.to_uppercase();
        self.params.iter().find(|(t, _)| *t == tag).map(|(_, v)| v)
    }

    /// Numeric value of `tag`, or `default` when absent or not numeric.
    pub fn get_f64(&self, tag: &str, default: f64) -> f64 {
        self.get(tag).and_then(IncarValue::as_f64).unwrap_or(default)
    }

    /// Integer value of `tag`, or `default` when absent or not integral.
    pub fn get_i64(&self, tag: &str, default: i64) -> i64 {
        self.get(tag).and_then(IncarValue::as_i64).unwrap_or(default)
    }

    /// Text value of `tag` as written, or `default`.
    pub fn get_str(&self, tag: &str, default: &str) -> String {
        self.get(tag)
            .map(|v| v.to_string())
            .unwrap_or_else(|| default.to_string())
    }

    /// Whether `tag` is present.
    pub fn contains(&self, tag: &str) -> bool {
        self.get(tag).is_some()
    }

    /// Sets `tag`, replacing an existing value in place.
    pub fn set(&mut self, tag: &str, value: impl Into<IncarValue>) {
        let tag = tag.to_uppercase();
        let value = value.into();
        match self.params.iter_mut().find(|(t, _)| *t == tag) {
            Some((_, v)) => *v = value,
            None => self.params.push((tag, value)),
        }
    }

    /// Removes `tag`; returns the old value if it was set.
    pub fn unset(&mut self, tag: &str) -> Option<IncarValue> {
        let tag = tag.to_uppercase();
        let idx = self.params.iter().position(|(t, _)| *t == tag)?;
        Some(self.params.remove(idx).1)
    }

    /// Iterates over `(tag, value)` pairs in file order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &IncarValue)> {
        self.params.iter().map(|(t, v)| (t.as_str(), v))
    }

    /// Writes the INCAR with aligned `=` signs.
    pub fn write_file(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_string())?;
        Ok(())
    }
}

impl fmt::Display for Incar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self.params.iter().map(|(t, _)| t.len()).max().unwrap_or(0);
        for (tag, value) in &self.params {
            writeln!(f, "{:width$} = {}", tag, value, width = width)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_values() {
        let incar = Incar::parse(
            "ISMEAR = -5 # tetrahedron\nEDIFF=1e-5\nLREAL = .FALSE.\nALGO = Fast ; NELM = 100\n! comment\nPOTIM = 0.5\n",
        );
        assert_eq!(incar.get("ismear"), Some(&IncarValue::Int(-5)));
        assert_eq!(incar.get("EDIFF"), Some(&IncarValue::Float(1e-5)));
        assert_eq!(incar.get("LREAL"), Some(&IncarValue::Bool(false)));
        assert_eq!(incar.get_str("ALGO", ""), "Fast");
        assert_eq!(incar.get_i64("NELM", 60), 100);
        assert_eq!(incar.get_f64("POTIM", 0.0), 0.5);
    }

    #[test]
    fn test_set_and_unset() {
        let mut incar = Incar::parse("ISYM = 2\n");
        incar.set("isym", 0);
        incar.set("PREC", "Accurate");
        assert_eq!(incar.get_i64("ISYM", 2), 0);
        assert_eq!(incar.iter().count(), 2);
        assert_eq!(incar.unset("PREC"), Some(IncarValue::Text("Accurate".into())));
        assert!(!incar.contains("PREC"));
    }

    #[test]
    fn test_written_text_parses_back() {
        let mut incar = Incar::new();
        incar.set("SYMPREC", 1e-8);
        incar.set("POTIM", 2.0);
        incar.set("ADDGRID", true);
        incar.set("NBANDS", 24);
        let again = Incar::parse(&incar.to_string());
        assert_eq!(again, incar);
    }
}
