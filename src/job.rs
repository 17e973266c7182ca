//! Structure optimization jobs: launching, supervising and retrying VASP.
//!
//! A [`VaspJob`] owns one run directory. Each call of
//! [`run_relaxation_attempt`](VaspJob::run_relaxation_attempt) launches VASP
//! once, polls it, lets the monitor handlers abort it, and finally checks the
//! outputs with every handler. The outcome tells the caller whether to stop,
//! retry, or give up.
//!
//! [`structure_optimization_run`](VaspJob::structure_optimization_run) repeats
//! attempts, feeding each attempt's CONTCAR forward as the next POSCAR, until
//! VASP reports a single ionic step: the structure no longer moves. Attempts
//! are drawn one at a time from an [`AttemptSchedule`], which stops as soon as
//! an outcome is final.
//!
//! # Files of one relaxation
//!
//! | File | Written |
//! |---|---|
//! | `INCAR.orig`, `POSCAR.orig`, ... | before the first attempt |
//! | `CONTCAR.<n>`, `vasprun.xml.<n>`, ... | after attempt `n` |
//! | `error.<k>/` | before correction cycle `k` |
//! | `corrections.json` | after every correction cycle |
//! | `CONTCAR.finish`, ... | after the converged attempt |
//! | `structure_opt.json` | after the converged attempt |

use crate::actions::{self, CorrectionRecord};
use crate::cleanup::{CleanupConfig, CleanupError, CleanupManager};
use crate::config::JobSettings;
use crate::handlers::{self, Correction, ErrorHandler, HandlerError};
use crate::io::ParseError;
use crate::naming::{self, FileNaming};
use crate::parser::Oszicar;
use crate::record::{RecordError, RunRecord};
use crate::runner::{Launcher, RunnerError, SimulationProcess};
use crate::symmetry::SymmetryAnalyzer;
use log::{debug, error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use thiserror::Error;

/// Errors of a structure optimization job.
#[derive(Error, Debug)]
pub enum JobError {
    /// A handler detected an error it cannot correct
    #[error("Fatal error(s) {errors:?} after {attempts} attempt(s)")]
    Fatal {
        /// Names of the uncorrectable errors
        errors: Vec<String>,
        /// Attempts launched, the failing one included
        attempts: usize,
    },
    /// The attempt budget ran out before a single-ionic-step run
    #[error("Structure optimization not converged after {attempts} attempt(s)")]
    RelaxationNotConverged {
        /// Attempts launched
        attempts: usize,
    },
    /// File access failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// An input or output file could not be parsed
    #[error("{0}")]
    Parse(#[from] ParseError),
    /// A handler failed while checking or correcting
    #[error("{0}")]
    Handler(#[from] HandlerError),
    /// VASP could not be launched or supervised
    #[error("{0}")]
    Runner(#[from] RunnerError),
    /// The run record could not be built or saved
    #[error("{0}")]
    Record(#[from] RecordError),
    /// Finished files could not be organised
    #[error("{0}")]
    Cleanup(#[from] CleanupError),
}

type Result<T> = std::result::Result<T, JobError>;

/// Outcome of one relaxation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Clean run with exactly one ionic step
    Converged,
    /// Clean run that still moved the structure, or a corrected error
    NeedsRetry,
    /// Uncorrectable error
    Fatal {
        /// Names of the detected errors
        errors: Vec<String>,
    },
}

impl RunOutcome {
    /// Whether no further attempt should follow.
    pub fn is_final(&self) -> bool {
        !matches!(self, RunOutcome::NeedsRetry)
    }
}

/// Pull-style source of attempt numbers `1..=max_attempts`.
///
/// The caller takes the next attempt, runs it and reports the outcome; a final
/// outcome ends the schedule.
#[derive(Debug, Clone)]
pub struct AttemptSchedule {
    max_attempts: usize,
    launched: usize,
    finished: bool,
}

impl AttemptSchedule {
    /// Creates a schedule of at most `max_attempts` attempts.
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            launched: 0,
            finished: false,
        }
    }

    /// Reports the outcome of the last attempt taken.
    pub fn report(&mut self, outcome: &RunOutcome) {
        if outcome.is_final() {
            self.finished = true;
        }
    }

    /// Attempts handed out so far.
    pub fn launched(&self) -> usize {
        self.launched
    }

    /// Whether every attempt was used without a final outcome.
    pub fn is_exhausted(&self) -> bool {
        !self.finished && self.launched >= self.max_attempts
    }
}

impl Iterator for AttemptSchedule {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.finished || self.launched >= self.max_attempts {
            return None;
        }
        self.launched += 1;
        Some(self.launched)
    }
}

/// When handlers are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// While VASP runs: monitors only
    Running,
    /// After VASP exited: every handler that inspects outputs
    PostRun,
}

/// One VASP structure optimization in a run directory.
pub struct VaspJob {
    dir: PathBuf,
    settings: JobSettings,
    naming: FileNaming,
    launcher: Box<dyn Launcher>,
    analyzer: Box<dyn SymmetryAnalyzer>,
    handlers: Vec<Box<dyn ErrorHandler>>,
    cleanup: CleanupManager,
}

impl VaspJob {
    /// Creates a job with the handler set named in `settings.handlers`.
    pub fn new(
        dir: &Path,
        settings: JobSettings,
        launcher: Box<dyn Launcher>,
        analyzer: Box<dyn SymmetryAnalyzer>,
    ) -> Result<Self> {
        let handlers = handlers::handler_set(&settings.handlers)?;
        Ok(Self::with_handlers(dir, settings, launcher, analyzer, handlers))
    }

    /// Creates a job with an explicit handler list.
    pub fn with_handlers(
        dir: &Path,
        settings: JobSettings,
        launcher: Box<dyn Launcher>,
        analyzer: Box<dyn SymmetryAnalyzer>,
        handlers: Vec<Box<dyn ErrorHandler>>,
    ) -> Self {
        let naming = FileNaming::new(&settings.output_file);
        let cleanup = CleanupManager::new(
            CleanupConfig {
                move_unimportant_files: settings.move_unimportant_files,
                remove_wavecar: settings.remove_wavecar,
                left_files: settings.left_files.clone(),
                ..CleanupConfig::default()
            },
            naming.clone(),
        );
        Self {
            dir: dir.to_path_buf(),
            settings,
            naming,
            launcher,
            analyzer,
            handlers,
            cleanup,
        }
    }

    /// Replaces the cleanup configuration, e.g. to honour the `[cleanup]` verbosity.
    pub fn set_cleanup_config(&mut self, config: CleanupConfig) {
        self.cleanup = CleanupManager::new(config, self.naming.clone());
    }

    /// Run directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Job settings.
    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    /// File naming rules.
    pub fn naming(&self) -> &FileNaming {
        &self.naming
    }

    /// Cleanup manager.
    pub fn cleanup(&self) -> &CleanupManager {
        &self.cleanup
    }

    /// Symmetry analyzer.
    pub fn analyzer(&self) -> &dyn SymmetryAnalyzer {
        self.analyzer.as_ref()
    }

    /// Runs VASP once as attempt `n` (1-based).
    pub fn run_relaxation_attempt(&mut self, n: usize) -> Result<RunOutcome> {
        if n == 1 {
            self.backup_inputs()?;
        }
        info!("Relaxation attempt {} in {}", n, self.dir.display());

        let mut process = self.launcher.launch(&self.dir, &self.settings.output_file)?;
        if let Some(outcome) = self.supervise(process.as_mut(), n)? {
            return Ok(outcome);
        }

        self.postprocess(n)?;

        let triggered = self.triggered_handlers(Phase::PostRun)?;
        if !triggered.is_empty() {
            return self.correct(&triggered, n);
        }

        let oszicar = Oszicar::from_file(&self.dir.join(naming::OSZICAR))?;
        let ionic_steps = oszicar.num_ionic_steps();
        if ionic_steps == 0 {
            return Err(ParseError::Missing(format!(
                "no ionic step in {}",
                self.dir.join(naming::OSZICAR).display()
            ))
            .into());
        }
        // The relaxed structure is the input of the next attempt.
        let contcar = self.dir.join(naming::CONTCAR);
        if contcar.exists() {
            fs::copy(&contcar, self.dir.join(naming::POSCAR))?;
        }
        if ionic_steps == 1 {
            info!("Attempt {} finished in a single ionic step", n);
            Ok(RunOutcome::Converged)
        } else {
            info!("Attempt {} took {} ionic steps; relaxing again", n, ionic_steps);
            Ok(RunOutcome::NeedsRetry)
        }
    }

    /// Relaxes until a single-ionic-step run, then finalises the directory.
    ///
    /// `prev` is the record of the previous k-point set, if any; it provides
    /// the initial structure and space group of the new record.
    pub fn structure_optimization_run(&mut self, prev: Option<&RunRecord>) -> Result<RunRecord> {
        let mut schedule = AttemptSchedule::new(self.settings.max_relax_num);
        while let Some(n) = schedule.next() {
            let outcome = self.run_relaxation_attempt(n)?;
            schedule.report(&outcome);
            match outcome {
                RunOutcome::Converged => return self.finish(n, prev),
                RunOutcome::NeedsRetry => continue,
                RunOutcome::Fatal { errors } => {
                    error!("Unrecoverable error(s) in attempt {}: {}", n, errors.join(", "));
                    return Err(JobError::Fatal {
                        errors,
                        attempts: n,
                    });
                }
            }
        }
        warn!(
            "Structure optimization did not converge within {} attempts",
            schedule.launched()
        );
        Err(JobError::RelaxationNotConverged {
            attempts: schedule.launched(),
        })
    }

    /// Copies the user's inputs to `<file>.orig`.
    fn backup_inputs(&self) -> Result<()> {
        for file in naming::VASP_INPUT_FILES {
            let src = self.dir.join(file);
            if src.exists() {
                fs::copy(&src, self.dir.join(self.naming.orig(file)))?;
            }
        }
        Ok(())
    }

    /// Polls the process until it exits, running the monitors every
    /// `monitor_freq` polls.
    ///
    /// Returns an outcome when a monitor killed the run.
    fn supervise(&mut self, process: &mut dyn SimulationProcess, n: usize) -> Result<Option<RunOutcome>> {
        let mut polls: u32 = 0;
        loop {
            if let Some(success) = process.try_wait()? {
                if !success {
                    warn!("VASP exited with a failure status in attempt {}", n);
                }
                return Ok(None);
            }
            thread::sleep(self.settings.poll_duration());
            polls += 1;
            if polls % self.settings.monitor_freq.max(1) != 0 {
                continue;
            }
            debug!("Running monitors after {} polls", polls);
            let triggered = self.triggered_handlers(Phase::Running)?;
            if !triggered.is_empty() {
                warn!("Monitor triggered; terminating VASP");
                process.kill()?;
                return self.correct(&triggered, n).map(Some);
            }
        }
    }

    /// Copies the outputs of attempt `n` aside and drops the continuation marker.
    fn postprocess(&self, n: usize) -> Result<()> {
        for file in self.naming.saved_files() {
            let src = self.dir.join(&file);
            if src.exists() {
                fs::copy(&src, self.dir.join(self.naming.attempt(&file, n)))?;
            }
        }
        let marker = self.dir.join(naming::CONTINUE_JSON);
        if marker.exists() {
            fs::remove_file(marker)?;
        }
        Ok(())
    }

    /// Indices of the handlers taking part in `phase` whose check fires.
    fn triggered_handlers(&mut self, phase: Phase) -> Result<Vec<usize>> {
        let mut triggered = Vec::new();
        for (i, handler) in self.handlers.iter_mut().enumerate() {
            let active = match phase {
                Phase::Running => handler.is_monitor(),
                Phase::PostRun => handler.is_post_run(),
            };
            if !active {
                continue;
            }
            match handler.check(&self.dir) {
                Ok(true) => triggered.push(i),
                Ok(false) => {}
                Err(e) if phase == Phase::Running => {
                    warn!("Monitor {} could not check the run: {}", handler.name(), e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(triggered)
    }

    /// Lets every triggered handler correct the run and records the cycle.
    fn correct(&mut self, triggered: &[usize], n: usize) -> Result<RunOutcome> {
        let mut fatal = Vec::new();
        for &i in triggered {
            let handler = &mut self.handlers[i];
            let correction: Correction = handler.correct(&self.dir)?;
            let name = handler.name().to_string();
            if correction.is_recoverable() {
                info!("{} corrected {}", name, correction.errors.join(", "));
            } else {
                fatal.extend(correction.errors.iter().cloned());
            }
            actions::append_history(
                &self.dir,
                CorrectionRecord {
                    attempt: n,
                    handler: name,
                    errors: correction.errors,
                    actions: correction.actions,
                },
            )?;
        }
        if fatal.is_empty() {
            Ok(RunOutcome::NeedsRetry)
        } else {
            Ok(RunOutcome::Fatal { errors: fatal })
        }
    }

    /// Tags the outputs of attempt `n` as final, builds and saves the run
    /// record, and tidies the directory.
    fn finish(&self, n: usize, prev: Option<&RunRecord>) -> Result<RunRecord> {
        self.cleanup.tag_finished(&self.dir, n)?;
        self.cleanup.remove_wavecar(&self.dir)?;

        let record = RunRecord::from_dir(
            &self.dir,
            &self.naming,
            self.analyzer.as_ref(),
            self.settings.symprec,
            self.settings.angle_tolerance,
            prev,
        )?;
        record.save(&self.dir)?;
        info!(
            "Structure optimization finished: {:.6} eV/atom, space group {}",
            record.energy_per_atom, record.final_sg
        );

        self.cleanup.remove_empty_files(&self.dir)?;
        self.cleanup.archive_unimportant_files(&self.dir)?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_stops_on_final_outcome() {
        let mut schedule = AttemptSchedule::new(5);
        assert_eq!(schedule.next(), Some(1));
        schedule.report(&RunOutcome::NeedsRetry);
        assert_eq!(schedule.next(), Some(2));
        schedule.report(&RunOutcome::Converged);
        assert_eq!(schedule.next(), None);
        assert_eq!(schedule.launched(), 2);
        assert!(!schedule.is_exhausted());
    }

    #[test]
    fn test_schedule_exhausts() {
        let mut schedule = AttemptSchedule::new(2);
        while let Some(_) = schedule.next() {
            schedule.report(&RunOutcome::NeedsRetry);
        }
        assert_eq!(schedule.launched(), 2);
        assert!(schedule.is_exhausted());
    }

    #[test]
    fn test_fatal_outcome_is_final() {
        assert!(RunOutcome::Fatal { errors: vec![] }.is_final());
        assert!(!RunOutcome::NeedsRetry.is_final());
    }
}
