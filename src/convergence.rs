//! Provenance-ordered chain of run records and the k-point convergence test.
//!
//! Each record of a [`ConvergenceSequence`] names its predecessor through
//! `prev_record_id`; the sequence owns all records and only ever grows.
//!
//! # Convergence predicate
//!
//! With a window of `W` k-point sets the sequence needs at least `W + 1`
//! records. The *target* is the `(W + 1)`-th record from the end. It is the
//! converged result when
//!
//! 1. the space group is one value from the target's predecessor (or the first
//!    record's initial space group) to the last record,
//! 2. each of the `W` later records differs from the target in energy per atom
//!    by no more than the criterion, and
//! 3. each of their lattice matrices matches the target's component-wise
//!    within the symmetry tolerance.

use crate::cleanup::CleanupError;
use crate::config::KptConvSettings;
use crate::io::ParseError;
use crate::job::JobError;
use crate::record::{RecordError, RunRecord};
use log::{debug, info};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

/// Errors of the convergence sequence and the k-point loop.
#[derive(Error, Debug)]
pub enum ConvergenceError {
    /// File access failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A run record could not be read or built
    #[error("{0}")]
    Record(#[from] RecordError),
    /// `prev_record_id` links do not form one linear chain
    #[error("Broken record chain: {0}")]
    ChainIntegrity(String),
    /// A structure optimization of the loop failed
    #[error("{0}")]
    Job(#[from] JobError),
    /// Inputs for the next k-point set could not be written
    #[error("{0}")]
    Input(#[from] ParseError),
    /// Run directories could not be organised
    #[error("{0}")]
    Cleanup(#[from] CleanupError),
    /// Growing the density did not enlarge the mesh along every direction
    #[error("k-point mesh {mesh:?} could not be refined from density {density}")]
    MeshNotRefined {
        /// Mesh of the previous k-point set
        mesh: [u32; 3],
        /// Density the search stopped at
        density: f64,
    },
    /// The iteration cap was reached before convergence
    #[error("k-point convergence not reached after {iterations} k-point sets")]
    NotConverged {
        /// Number of k-point sets in the sequence when the loop stopped
        iterations: usize,
    },
}

type Result<T> = std::result::Result<T, ConvergenceError>;

/// Ordered chain of [`RunRecord`]s with the convergence criteria.
#[derive(Debug, Clone)]
pub struct ConvergenceSequence {
    records: Vec<RunRecord>,
    convergence_criterion: f64,
    window_size: usize,
    symmetry_tolerance: f64,
}

impl ConvergenceSequence {
    /// Creates an empty sequence.
    ///
    /// `convergence_criterion` is in eV per atom; `window_size` is clamped to at
    /// least one.
    pub fn new(convergence_criterion: f64, window_size: usize, symmetry_tolerance: f64) -> Self {
        Self {
            records: Vec::new(),
            convergence_criterion,
            window_size: window_size.max(1),
            symmetry_tolerance,
        }
    }

    /// Creates an empty sequence from the loop settings.
    pub fn from_settings(settings: &KptConvSettings) -> Self {
        Self::new(
            settings.convergence_criterion,
            settings.num_kpt_check,
            settings.symprec,
        )
    }

    /// Orders `records` along their `prev_record_id` links.
    ///
    /// Fails unless the records form exactly one linear chain with a single
    /// root.
    pub fn from_records(
        records: Vec<RunRecord>,
        convergence_criterion: f64,
        window_size: usize,
        symmetry_tolerance: f64,
    ) -> Result<Self> {
        let mut sequence = Self::new(convergence_criterion, window_size, symmetry_tolerance);
        if records.is_empty() {
            return Ok(sequence);
        }

        let ids: BTreeSet<Uuid> = records.iter().map(|r| r.id).collect();
        if ids.len() != records.len() {
            return Err(ConvergenceError::ChainIntegrity("duplicate record id".into()));
        }

        let mut roots = Vec::new();
        let mut children: HashMap<Uuid, RunRecord> = HashMap::new();
        for record in records {
            match record.prev_record_id {
                None => roots.push(record),
                Some(prev) => {
                    if !ids.contains(&prev) {
                        return Err(ConvergenceError::ChainIntegrity(format!(
                            "record {} points to unknown record {}",
                            record.id, prev
                        )));
                    }
                    if children.insert(prev, record).is_some() {
                        return Err(ConvergenceError::ChainIntegrity(format!(
                            "record {} has more than one successor",
                            prev
                        )));
                    }
                }
            }
        }
        if roots.len() != 1 {
            return Err(ConvergenceError::ChainIntegrity(format!(
                "expected one root record, found {}",
                roots.len()
            )));
        }

        let mut next = roots.pop();
        while let Some(record) = next {
            next = children.remove(&record.id);
            sequence.records.push(record);
        }
        if !children.is_empty() {
            return Err(ConvergenceError::ChainIntegrity(format!(
                "{} record(s) not reachable from the root",
                children.len()
            )));
        }
        Ok(sequence)
    }

    /// Loads `structure_opt.json` from every `*kpt*` subdirectory of `dir`.
    pub fn from_dirs(dir: &Path, settings: &KptConvSettings) -> Result<Self> {
        let mut records = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let is_kpt_dir = path.is_dir()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| n.contains("kpt"));
            if is_kpt_dir {
                debug!("Loading run record from {}", path.display());
                records.push(RunRecord::load(&path)?);
            }
        }
        if !records.is_empty() {
            info!("Resuming from {} finished k-point set(s)", records.len());
        }
        Self::from_records(
            records,
            settings.convergence_criterion,
            settings.num_kpt_check,
            settings.symprec,
        )
    }

    /// Appends a record whose predecessor must be the current last record.
    pub fn append(&mut self, record: RunRecord) -> Result<()> {
        let expected = self.records.last().map(|r| r.id);
        if record.prev_record_id != expected {
            return Err(ConvergenceError::ChainIntegrity(format!(
                "record {} follows {:?}, but the sequence ends with {:?}",
                record.id, record.prev_record_id, expected
            )));
        }
        self.records.push(record);
        Ok(())
    }

    /// Records in chain order.
    pub fn records(&self) -> &[RunRecord] {
        &self.records
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the sequence holds no record.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Most recent record.
    pub fn last(&self) -> Option<&RunRecord> {
        self.records.last()
    }

    /// Initial space group of the first record followed by every final space group.
    pub fn space_groups(&self) -> Vec<Option<u32>> {
        let mut groups = Vec::with_capacity(self.records.len() + 1);
        if let Some(first) = self.records.first() {
            groups.push(first.initial_sg);
        }
        groups.extend(self.records.iter().map(|r| Some(r.final_sg)));
        groups
    }

    /// Whether any space group along the chain differs from the others.
    pub fn is_symmetry_changed(&self) -> bool {
        self.space_groups()
            .into_iter()
            .flatten()
            .collect::<BTreeSet<_>>()
            .len()
            > 1
    }

    /// The converged record, or `None` while the criteria are not met.
    pub fn converged_record(&self) -> Option<&RunRecord> {
        let w = self.window_size;
        let n = self.records.len();
        if n < w + 1 {
            return None;
        }
        let target_idx = n - (w + 1);
        let target = &self.records[target_idx];

        // space_groups() is offset by one: index i + 1 is record i's final group.
        let groups: BTreeSet<u32> = self.space_groups()[target_idx..]
            .iter()
            .flatten()
            .copied()
            .collect();
        if groups.len() > 1 {
            debug!("Space group changed within the window: {:?}", groups);
            return None;
        }

        for compared in &self.records[target_idx + 1..] {
            let diff = (target.energy_per_atom - compared.energy_per_atom).abs();
            if diff > self.convergence_criterion {
                info!("Energy is not converged yet ({:.4} eV/atom)", diff);
                return None;
            }
            let lattice_diff =
                (target.final_structure.lattice - compared.final_structure.lattice).amax();
            if lattice_diff > self.symmetry_tolerance {
                info!("Lattice is not converged yet ({:.4} Å)", lattice_diff);
                return None;
            }
        }
        Some(target)
    }

    /// Whether [`converged_record`](Self::converged_record) finds a record.
    pub fn is_converged(&self) -> bool {
        self.converged_record().is_some()
    }
}

impl fmt::Display for ConvergenceSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>10} {:>14} {:>6}", "kpt", "energy/atom", "sg")?;
        for r in &self.records {
            let mesh = format!("{}x{}x{}", r.kpt_mesh[0], r.kpt_mesh[1], r.kpt_mesh[2]);
            writeln!(f, "{:>10} {:>14.4} {:>6}", mesh, r.energy_per_atom, r.final_sg)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::Structure;
    use nalgebra::Matrix3;

    fn chain(energies: &[f64], sgs: &[u32]) -> Vec<RunRecord> {
        let structure = Structure::new(
            Matrix3::identity() * 4.0,
            vec!["Mg".to_string()],
            vec![[0.0, 0.0, 0.0]],
        );
        let mut records: Vec<RunRecord> = Vec::new();
        for (i, (&e, &sg)) in energies.iter().zip(sgs).enumerate() {
            records.push(RunRecord {
                id: Uuid::new_v4(),
                prev_record_id: records.last().map(|r| r.id),
                energy_per_atom: e,
                kpt_mesh: [i as u32 + 2; 3],
                kpt_density: Some(2.5),
                final_structure: structure.clone(),
                final_sg: sg,
                initial_structure: None,
                initial_sg: Some(if i == 0 { sg } else { sgs[i - 1] }),
            });
        }
        records
    }

    fn sequence(records: Vec<RunRecord>) -> ConvergenceSequence {
        let mut seq = ConvergenceSequence::new(0.003, 2, 0.01);
        for r in records {
            seq.append(r).unwrap();
        }
        seq
    }

    #[test]
    fn test_converged() {
        let seq = sequence(chain(&[-5.0, -5.001, -5.0005, -5.0008], &[225; 4]));
        let target = seq.converged_record().unwrap();
        assert_eq!(target.id, seq.records()[1].id);
    }

    #[test]
    fn test_trailing_sg_change() {
        let seq = sequence(chain(&[-5.0, -5.001, -5.0005, -5.0008], &[225, 225, 225, 221]));
        assert!(!seq.is_converged());
        assert!(seq.is_symmetry_changed());
    }

    #[test]
    fn test_energy_outside_criterion() {
        let seq = sequence(chain(&[-5.0, -5.001, -5.0005, -5.01], &[225; 4]));
        assert!(!seq.is_converged());
    }

    #[test]
    fn test_lattice_outside_tolerance() {
        let mut records = chain(&[-5.0, -5.0, -5.0], &[225; 3]);
        records[2].final_structure.lattice[(2, 2)] += 0.05;
        assert!(!sequence(records).is_converged());
    }

    #[test]
    fn test_too_short() {
        let seq = sequence(chain(&[-5.0, -5.0], &[225; 2]));
        assert!(!seq.is_converged());
    }

    #[test]
    fn test_append_rejects_broken_chain() {
        let mut records = chain(&[-5.0, -5.0], &[225; 2]);
        records[1].prev_record_id = Some(Uuid::new_v4());
        let mut seq = ConvergenceSequence::new(0.003, 2, 0.01);
        seq.append(records[0].clone()).unwrap();
        assert!(matches!(
            seq.append(records[1].clone()),
            Err(ConvergenceError::ChainIntegrity(_))
        ));
        assert_eq!(seq.len(), 1);
    }

    #[test]
    fn test_from_records_sorts_by_provenance() {
        let mut records = chain(&[-5.0, -5.1, -5.2], &[225; 3]);
        let expected: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        records.reverse();
        let seq = ConvergenceSequence::from_records(records, 0.003, 2, 0.01).unwrap();
        let ids: Vec<Uuid> = seq.records().iter().map(|r| r.id).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_from_records_rejects_two_roots() {
        let mut records = chain(&[-5.0, -5.1], &[225; 2]);
        records[1].prev_record_id = None;
        assert!(ConvergenceSequence::from_records(records, 0.003, 2, 0.01).is_err());
    }
}
