//! Shared fixtures: a scripted VASP stand-in and a fixed space-group analyzer.

#![allow(dead_code)]

use nalgebra::Matrix3;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::rc::Rc;
use visejob::config::JobSettings;
use visejob::handlers::{HandlerError, MemoryProbe};
use visejob::kpoints::Kpoints;
use visejob::runner::{Launcher, RunnerError, SimulationProcess};
use visejob::structure::Structure;
use visejob::symmetry::{SymmetryAnalyzer, SymmetryError};

/// Counters shared between a test and its launcher.
#[derive(Debug, Default)]
pub struct MockState {
    /// Number of launches so far
    pub launches: Cell<usize>,
    /// Launches that found a WAVECAR to start from
    pub wavecar_reused: Cell<usize>,
    /// Processes killed by the job
    pub kills: Cell<usize>,
}

/// Pretends to be VASP: every launch writes OSZICAR, CONTCAR, WAVECAR and the
/// stdout log according to a script.
pub struct MockVasp {
    /// Ionic steps of each launch; the last entry repeats
    pub ionic_steps: Vec<usize>,
    /// Extra log line of each launch; missing entries mean a clean log
    pub log_lines: Vec<&'static str>,
    /// Polls each process reports as still running before it exits
    pub running_polls: usize,
    /// Shared counters
    pub state: Rc<MockState>,
}

impl MockVasp {
    pub fn new(ionic_steps: Vec<usize>) -> (Self, Rc<MockState>) {
        let state = Rc::new(MockState::default());
        (
            Self {
                ionic_steps,
                log_lines: Vec::new(),
                running_polls: 0,
                state: Rc::clone(&state),
            },
            state,
        )
    }

    pub fn with_log_lines(mut self, lines: Vec<&'static str>) -> Self {
        self.log_lines = lines;
        self
    }

    pub fn with_running_polls(mut self, polls: usize) -> Self {
        self.running_polls = polls;
        self
    }
}

/// Energy per atom that converges with the mesh: `-4 - 0.1 / n²`.
pub fn energy_for_mesh(n: u32) -> f64 {
    -4.0 - 0.1 / f64::from(n * n)
}

fn oszicar(ionic_steps: usize, energy: f64) -> String {
    let mut content = String::from("       N       E                     dE             d eps       ncg     rms\n");
    for step in 1..=ionic_steps {
        for scf in 1..=3 {
            content.push_str(&format!("DAV: {:3}    {:.10E}   -0.1E-03   -0.1E-04  1632   0.1E-01\n", scf, energy));
        }
        content.push_str(&format!("{:4} F= {:.10E} E0= {:.10E}  d E =-0.1E-04\n", step, energy, energy));
    }
    content
}

impl Launcher for MockVasp {
    fn launch(&self, dir: &Path, output_file: &str) -> Result<Box<dyn SimulationProcess>, RunnerError> {
        let n = self.state.launches.get();
        self.state.launches.set(n + 1);

        let steps = self
            .ionic_steps
            .get(n)
            .or_else(|| self.ionic_steps.last())
            .copied()
            .unwrap_or(1);

        let structure = Structure::from_file(&dir.join("POSCAR"))
            .map_err(|e| RunnerError::Launch(e.to_string()))?;
        let mesh = Kpoints::from_file(&dir.join("KPOINTS"))
            .map_err(|e| RunnerError::Launch(e.to_string()))?
            .mesh;
        let energy = energy_for_mesh(mesh[0]) * structure.num_sites() as f64;

        if dir.join("WAVECAR").exists() {
            self.state.wavecar_reused.set(self.state.wavecar_reused.get() + 1);
        }

        let mut log = String::from(" running on    1 total cores\n");
        if let Some(line) = self.log_lines.get(n).filter(|l| !l.is_empty()) {
            log.push_str(line);
            log.push('\n');
        }
        fs::write(dir.join(output_file), log)?;
        fs::write(dir.join("OSZICAR"), oszicar(steps, energy))?;
        fs::copy(dir.join("POSCAR"), dir.join("CONTCAR"))?;
        fs::write(dir.join("OUTCAR"), " NBANDS=      8\n reached required accuracy\n")?;
        fs::write(dir.join("vasprun.xml"), "<modeling/>\n")?;
        fs::write(dir.join("WAVECAR"), "wavefunction")?;
        fs::write(dir.join("CHG"), "")?;

        Ok(Box::new(ScriptedProcess {
            polls_left: self.running_polls,
            killed: false,
            state: Rc::clone(&self.state),
        }))
    }
}

/// A process that reports itself running for a number of polls, then exits
/// successfully. Its outputs are already on disk when it starts.
pub struct ScriptedProcess {
    polls_left: usize,
    killed: bool,
    state: Rc<MockState>,
}

impl SimulationProcess for ScriptedProcess {
    fn try_wait(&mut self) -> Result<Option<bool>, RunnerError> {
        if self.killed {
            return Ok(Some(false));
        }
        if self.polls_left == 0 {
            return Ok(Some(true));
        }
        self.polls_left -= 1;
        Ok(None)
    }

    fn kill(&mut self) -> Result<(), RunnerError> {
        self.killed = true;
        self.state.kills.set(self.state.kills.get() + 1);
        Ok(())
    }
}

/// Reports a fixed memory usage, or fails like a host without `/proc/meminfo`.
pub struct FixedMemory(pub Option<f64>);

impl MemoryProbe for FixedMemory {
    fn usage_ratio(&self) -> Result<f64, HandlerError> {
        self.0
            .ok_or_else(|| HandlerError::Probe("meminfo unavailable".to_string()))
    }
}

/// Returns scripted space groups in call order; the last one repeats.
pub struct ScriptedSg {
    groups: RefCell<VecDeque<u32>>,
    last: Cell<u32>,
}

impl ScriptedSg {
    pub fn new(groups: &[u32]) -> Self {
        Self {
            groups: RefCell::new(groups.iter().copied().collect()),
            last: Cell::new(groups.last().copied().unwrap_or(1)),
        }
    }

    pub fn fixed(sg: u32) -> Self {
        Self::new(&[sg])
    }
}

impl SymmetryAnalyzer for ScriptedSg {
    fn space_group(&self, _: &Structure, _: f64, _: f64) -> Result<u32, SymmetryError> {
        let sg = self.groups.borrow_mut().pop_front().unwrap_or(self.last.get());
        self.last.set(sg);
        Ok(sg)
    }
}

/// Simple cubic copper with a 4 Å lattice.
pub fn cubic_cu() -> Structure {
    Structure::new(
        Matrix3::identity() * 4.0,
        vec!["Cu".to_string()],
        vec![[0.0, 0.0, 0.0]],
    )
}

/// Writes INCAR, POSCAR, POTCAR and a 4x4x4 KPOINTS into `dir`.
pub fn write_inputs(dir: &Path) {
    fs::write(dir.join("INCAR"), "ISMEAR = -5\nIBRION = 2\nNSW = 50\nISIF = 3\n").unwrap();
    cubic_cu().write_file(&dir.join("POSCAR")).unwrap();
    fs::write(dir.join("POTCAR"), "PAW_PBE Cu 22Jun2005\n").unwrap();
    Kpoints::gamma([4, 4, 4]).write_file(&dir.join("KPOINTS")).unwrap();
}

/// Job settings that poll without sleeping.
pub fn fast_settings(max_relax_num: usize) -> JobSettings {
    JobSettings {
        vasp_cmd: vec!["vasp_std".to_string()],
        max_relax_num,
        poll_interval: 0.0,
        monitor_freq: 1,
        ..JobSettings::default()
    }
}
