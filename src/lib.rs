#![deny(missing_docs)]

//! visejob - VASP job control with automatic error recovery
//!
//! visejob drives VASP structure optimizations unattended. It watches every
//! attempt for known failure signatures, rewrites the inputs to work around
//! them, and relaunches until the structure is relaxed. On top of that it can
//! converge the k-point mesh: relaxations are repeated with growing k-point
//! density until the energy per atom and the lattice stop changing.
//!
//! # Overview
//!
//! A structure optimization is a sequence of *attempts*. Each attempt launches
//! VASP, polls it, and lets a set of *handlers* inspect the run:
//!
//! - monitors (log scanning, memory, wall time) may kill a running attempt
//! - post-run checks (unconverged SCF, stagnating ionic steps, diverging energy)
//!   run after VASP has exited
//!
//! A triggered handler proposes corrective actions (INCAR edits, file
//! deletions, structure transformations) that are applied before the next
//! attempt. An attempt that needed a single ionic step means the structure is
//! relaxed.
//!
//! The k-point loop records every finished optimization as a [`record::RunRecord`]
//! linked to its predecessor. The chain forms a
//! [`convergence::ConvergenceSequence`] whose convergence predicate compares
//! a candidate with the following k-point sets.
//!
//! # Quick Start
//!
//! ```no_run
//! use visejob::job::VaspJob;
//! use visejob::runner::CommandLauncher;
//! use visejob::settings::SettingsManager;
//! use visejob::symmetry::CommandSymmetryAnalyzer;
//! use std::path::Path;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = SettingsManager::load()?;
//!     let settings = manager.settings().job_settings();
//!     let launcher = CommandLauncher::new("mpirun -np 16 vasp_std")?;
//!     let analyzer = CommandSymmetryAnalyzer::new("sgnum");
//!     let mut job = VaspJob::new(Path::new("."), settings, Box::new(launcher), Box::new(analyzer))?;
//!     let record = job.structure_optimization_run(None)?;
//!     println!("{}", record);
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`structure`], [`incar`], [`kpoints`], [`io`] - VASP input files
//! - [`parser`] - OSZICAR and OUTCAR readers
//! - [`diagnostics`] - error signatures in the VASP log
//! - [`actions`] - corrective actions and the correction history
//! - [`handlers`] - error handlers and handler sets
//! - [`runner`] - launching and supervising VASP
//! - [`job`] - the relaxation retry loop
//! - [`symmetry`] - space-group analysis
//! - [`record`], [`convergence`] - run records and the convergence predicate
//! - [`input_set`], [`kpt_convergence`] - the k-point convergence loop
//! - [`naming`], [`cleanup`] - file naming and the run-directory lifecycle
//! - [`config`], [`settings`], [`validation`] - configuration
//! - [`help`] - built-in help

pub mod actions;
pub mod cleanup;
pub mod config;
pub mod convergence;
pub mod diagnostics;
pub mod handlers;
pub mod help;
pub mod incar;
pub mod input_set;
pub mod io;
pub mod job;
pub mod kpoints;
pub mod kpt_convergence;
pub mod naming;
pub mod parser;
pub mod record;
pub mod runner;
pub mod settings;
pub mod structure;
pub mod symmetry;
pub mod validation;
