//! File and directory naming used across a relaxation campaign.
//!
//! VASP always reads and writes fixed file names, so every attempt copies its
//! results aside under a suffixed name to avoid overwriting:
//!
//! ```
//! use visejob::naming::FileNaming;
//!
//! let naming = FileNaming::new("vasp.out");
//! assert_eq!(naming.attempt("CONTCAR", 3), "CONTCAR.3");
//! assert_eq!(naming.finish("vasprun.xml"), "vasprun.xml.finish");
//! assert_eq!(naming.orig("POSCAR"), "POSCAR.orig");
//! ```

/// VASP run configuration
pub const INCAR: &str = "INCAR";
/// k-point mesh
pub const KPOINTS: &str = "KPOINTS";
/// Input structure
pub const POSCAR: &str = "POSCAR";
/// Pseudopotentials
pub const POTCAR: &str = "POTCAR";
/// Output structure
pub const CONTCAR: &str = "CONTCAR";
/// Detailed output
pub const OUTCAR: &str = "OUTCAR";
/// Step-by-step energies
pub const OSZICAR: &str = "OSZICAR";
/// XML output
pub const VASPRUN: &str = "vasprun.xml";
/// Wavefunctions
pub const WAVECAR: &str = "WAVECAR";
/// Charge density
pub const CHGCAR: &str = "CHGCAR";
/// Continuation marker left by an interrupted job
pub const CONTINUE_JSON: &str = "continue.json";
/// Standard error of the simulation process
pub const STDERR_FILE: &str = "std_err.txt";
/// Input-set record read back when building a run record
pub const VISE_JSON: &str = "vise.json";
/// Serialized run record
pub const STRUCTURE_OPT_JSON: &str = "structure_opt.json";
/// History of applied corrections
pub const CORRECTIONS_JSON: &str = "corrections.json";
/// Archive subdirectory for non-essential outputs
pub const ARCHIVE_DIR: &str = "files";
/// Batch script that launched the job
pub const RUNSHELL: &str = "runshell.sh";

/// Files that make up a complete VASP input.
pub const VASP_INPUT_FILES: [&str; 4] = [INCAR, POSCAR, POTCAR, KPOINTS];

/// Outputs copied aside after every attempt (the stdout log is added by [`FileNaming`]).
pub const VASP_SAVED_FILES: [&str; 4] = [INCAR, VASPRUN, CONTCAR, OUTCAR];

/// Files backed up before corrective actions modify the directory.
pub const VASP_BACKUP_FILES: [&str; 8] = [
    INCAR,
    KPOINTS,
    POSCAR,
    OUTCAR,
    CONTCAR,
    OSZICAR,
    VASPRUN,
    STDERR_FILE,
];

/// Naming rules of one job, parameterised by the stdout log name.
#[derive(Debug, Clone)]
pub struct FileNaming {
    output_file: String,
}

impl FileNaming {
    /// Creates naming rules for a job whose stdout goes to `output_file`.
    pub fn new(output_file: &str) -> Self {
        Self {
            output_file: output_file.to_string(),
        }
    }

    /// Name of the stdout log, e.g. `vasp.out`
    pub fn output_file(&self) -> &str {
        &self.output_file
    }

    /// Copy of `name` kept for attempt `n`
    pub fn attempt(&self, name: &str, n: usize) -> String {
        format!("{}.{}", name, n)
    }

    /// Final copy of `name` after a converged relaxation
    pub fn finish(&self, name: &str) -> String {
        format!("{}.finish", name)
    }

    /// Backup of the user's original input `name`
    pub fn orig(&self, name: &str) -> String {
        format!("{}.orig", name)
    }

    /// Saved outputs plus the stdout log.
    pub fn saved_files(&self) -> Vec<String> {
        let mut files: Vec<String> = VASP_SAVED_FILES.iter().map(|s| s.to_string()).collect();
        files.push(self.output_file.clone());
        files
    }

    /// Backup set plus the stdout log.
    pub fn backup_files(&self) -> Vec<String> {
        let mut files: Vec<String> = VASP_BACKUP_FILES.iter().map(|s| s.to_string()).collect();
        if !files.contains(&self.output_file) {
            files.push(self.output_file.clone());
        }
        files
    }

    /// `.finish` names of the saved outputs and the stdout log.
    pub fn finished_files(&self) -> Vec<String> {
        self.saved_files().iter().map(|f| self.finish(f)).collect()
    }
}

/// Directory holding the backup taken before correction cycle `n`
pub fn error_dir(n: usize) -> String {
    format!("error.{}", n)
}

/// Directory name of one k-point iteration, e.g. `kpt7x7x7_pre-sg225_pos-sg225`.
///
/// An unknown initial space group is written as `None`.
pub fn kpt_dirname(mesh: [u32; 3], initial_sg: Option<u32>, final_sg: u32) -> String {
    let initial = initial_sg.map_or_else(|| "None".to_string(), |sg| sg.to_string());
    format!(
        "kpt{}x{}x{}_pre-sg{}_pos-sg{}",
        mesh[0], mesh[1], mesh[2], initial, final_sg
    )
}
