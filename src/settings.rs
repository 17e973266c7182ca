//! Configuration management for visejob.
//!
//! Program behaviour can be customised through INI-format configuration files
//! without touching the command line of every job. The system supports
//! hierarchical configuration with the following precedence:
//!
//! 1. Local configuration (`./vise_config.cfg`)
//! 2. User configuration (`~/.config/vise/vise_config.cfg`)
//! 3. System configuration (`/etc/vise/vise_config.cfg`)
//! 4. Built-in defaults
//!
//! A file only overrides the keys it sets; command-line flags override all files.
//!
//! # Configuration File Format
//!
//! ```ini
//! [job]
//! vasp_cmd = mpirun -np 16 vasp_std
//! max_relax_num = 10
//!
//! [convergence]
//! initial_kpt_density = 2.5
//! criterion = 0.003
//!
//! [symmetry]
//! command = sgnum
//! symprec = 0.01
//!
//! [monitor]
//! handler_name = default
//! timeout = 129600
//!
//! [logging]
//! level = info
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use visejob::settings::SettingsManager;
//!
//! let manager = SettingsManager::load().unwrap();
//! let job = manager.settings().job_settings();
//! println!("Loaded from {}: {} attempts", manager.config_source(), job.max_relax_num);
//! ```

use crate::config::{self, HandlerSettings, JobSettings, KptConvSettings};
use crate::diagnostics::DiagnosticKind;
use configparser::ini::Ini;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Name of the configuration file at every level of the hierarchy
pub const CONFIG_FILE_NAME: &str = "vise_config.cfg";

/// Errors that can occur during configuration loading and processing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// I/O error when reading configuration files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// INI parsing error
    #[error("INI parsing error: {0}")]
    IniParse(String),
    /// Invalid configuration value
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

type Section = HashMap<String, Option<String>>;

/// Main configuration structure containing all program settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    /// Job launch settings
    pub job: JobSection,
    /// k-point convergence settings
    pub convergence: ConvergenceSection,
    /// Symmetry analysis settings
    pub symmetry: SymmetrySection,
    /// Error handler and monitoring settings
    pub monitor: MonitorSection,
    /// Cleanup configuration
    pub cleanup: CleanupSettings,
    /// Logging configuration
    pub logging: LoggingSettings,
}

/// `[job]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSection {
    /// VASP command line (default: empty, must be given somewhere)
    pub vasp_cmd: String,
    /// Stdout log name (default: "vasp.out")
    pub output_file: String,
    /// Maximum relaxation attempts per k-point set (default: 10)
    pub max_relax_num: usize,
}

impl Default for JobSection {
    fn default() -> Self {
        let job = JobSettings::default();
        Self {
            vasp_cmd: String::new(),
            output_file: job.output_file,
            max_relax_num: job.max_relax_num,
        }
    }
}

/// `[convergence]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConvergenceSection {
    /// k-point density of the first set (default: 2.5)
    pub initial_kpt_density: f64,
    /// Density growth factor (default: 1.2)
    pub kpt_factor: f64,
    /// Maximum number of k-point sets (default: 10)
    pub max_kpt_num: usize,
    /// Energy criterion in eV/atom (default: 0.003)
    pub criterion: f64,
    /// Window of later sets compared with the candidate (default: 2)
    pub num_kpt_check: usize,
}

impl Default for ConvergenceSection {
    fn default() -> Self {
        let kc = KptConvSettings::default();
        Self {
            initial_kpt_density: kc.initial_kpt_density,
            kpt_factor: kc.kpt_factor,
            max_kpt_num: kc.max_kpt_num,
            criterion: kc.convergence_criterion,
            num_kpt_check: kc.num_kpt_check,
        }
    }
}

/// `[symmetry]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SymmetrySection {
    /// Helper program printing the space-group number (default: "sgnum")
    pub command: String,
    /// Distance tolerance in Å (default: 0.01)
    pub symprec: f64,
    /// Angle tolerance in degrees (default: 5)
    pub angle_tolerance: f64,
}

impl Default for SymmetrySection {
    fn default() -> Self {
        Self {
            command: "sgnum".to_string(),
            symprec: config::SYMMETRY_TOLERANCE,
            angle_tolerance: config::ANGLE_TOL,
        }
    }
}

/// `[monitor]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorSection {
    /// Handler set (default: "default")
    pub handler_name: String,
    /// Error kinds the VASP handler looks for; empty means the default set
    pub enabled_errors: Vec<DiagnosticKind>,
    /// Wall-time limit in seconds (default: 129600)
    pub timeout: u64,
    /// Memory usage ratio that aborts a run (default: 0.85)
    pub memory_usage_limit: f64,
    /// Ionic-step window of the non-converging check (default: 10)
    pub nionic_steps: usize,
    /// Atom count from which a cell is large (default: 50)
    pub natoms_large_cell: usize,
    /// Seconds between polls of the running process (default: 10)
    pub poll_interval: f64,
    /// Polls between monitor checks (default: 30)
    pub monitor_freq: u32,
}

impl Default for MonitorSection {
    fn default() -> Self {
        let job = JobSettings::default();
        Self {
            handler_name: job.handlers.handler_name,
            enabled_errors: Vec::new(),
            timeout: job.handlers.timeout,
            memory_usage_limit: job.handlers.memory_usage_limit,
            nionic_steps: job.handlers.nionic_steps,
            natoms_large_cell: job.handlers.natoms_large_cell,
            poll_interval: job.poll_interval,
            monitor_freq: job.monitor_freq,
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSettings {
    /// Log level: debug, info, warn, error (default: "info")
    pub level: String,
    /// Print level for file operations: 0 = quiet, 1 = normal, 2 = verbose (default: 1)
    pub print_level: u32,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            print_level: 1,
        }
    }
}

/// `[cleanup]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CleanupSettings {
    /// Move non-essential files into `files/` (default: true)
    pub move_unimportant_files: bool,
    /// Remove WAVECAR after runs (default: false)
    pub remove_wavecar: bool,
    /// Extra files kept at the top level (comma-separated)
    pub left_files: Vec<String>,
    /// Verbosity of cleanup logging (default: 1)
    pub verbose: u32,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            move_unimportant_files: true,
            remove_wavecar: false,
            left_files: Vec::new(),
            verbose: 1,
        }
    }
}

impl Settings {
    /// Job settings derived from the `[job]`, `[symmetry]`, `[monitor]` and `[cleanup]` sections.
    pub fn job_settings(&self) -> JobSettings {
        let enabled_kinds = if self.monitor.enabled_errors.is_empty() {
            DiagnosticKind::default_enabled()
        } else {
            self.monitor.enabled_errors.clone()
        };
        JobSettings {
            vasp_cmd: self.job.vasp_cmd.split_whitespace().map(str::to_string).collect(),
            output_file: self.job.output_file.clone(),
            max_relax_num: self.job.max_relax_num,
            remove_wavecar: self.cleanup.remove_wavecar,
            move_unimportant_files: self.cleanup.move_unimportant_files,
            left_files: self.cleanup.left_files.clone(),
            symprec: self.symmetry.symprec,
            angle_tolerance: self.symmetry.angle_tolerance,
            poll_interval: self.monitor.poll_interval,
            monitor_freq: self.monitor.monitor_freq,
            handlers: HandlerSettings {
                handler_name: self.monitor.handler_name.clone(),
                output_file: self.job.output_file.clone(),
                enabled_kinds,
                natoms_large_cell: self.monitor.natoms_large_cell,
                memory_usage_limit: self.monitor.memory_usage_limit,
                timeout: self.monitor.timeout,
                nionic_steps: self.monitor.nionic_steps,
            },
        }
    }

    /// k-point loop settings derived from the `[convergence]` and `[symmetry]` sections.
    pub fn kpt_conv_settings(&self) -> KptConvSettings {
        KptConvSettings {
            initial_kpt_density: self.convergence.initial_kpt_density,
            kpt_factor: self.convergence.kpt_factor,
            max_kpt_num: self.convergence.max_kpt_num,
            convergence_criterion: self.convergence.criterion,
            num_kpt_check: self.convergence.num_kpt_check,
            symprec: self.symmetry.symprec,
        }
    }

    /// Overrides the values present in `ini`.
    fn apply_ini(&mut self, ini: &Ini) -> Result<(), ConfigError> {
        let map = ini.get_map_ref();

        if let Some(section) = map.get("job") {
            set_string(section, "vasp_cmd", &mut self.job.vasp_cmd);
            set_string(section, "output_file", &mut self.job.output_file);
            set_parsed(section, "max_relax_num", &mut self.job.max_relax_num)?;
        }

        if let Some(section) = map.get("convergence") {
            let c = &mut self.convergence;
            set_parsed(section, "initial_kpt_density", &mut c.initial_kpt_density)?;
            set_parsed(section, "kpt_factor", &mut c.kpt_factor)?;
            set_parsed(section, "max_kpt_num", &mut c.max_kpt_num)?;
            set_parsed(section, "criterion", &mut c.criterion)?;
            set_parsed(section, "num_kpt_check", &mut c.num_kpt_check)?;
        }

        if let Some(section) = map.get("symmetry") {
            set_string(section, "command", &mut self.symmetry.command);
            set_parsed(section, "symprec", &mut self.symmetry.symprec)?;
            set_parsed(section, "angle_tolerance", &mut self.symmetry.angle_tolerance)?;
        }

        if let Some(section) = map.get("monitor") {
            let m = &mut self.monitor;
            set_string(section, "handler_name", &mut m.handler_name);
            if let Some(Some(list)) = section.get("enabled_errors") {
                m.enabled_errors = parse_kinds(list)?;
            }
            set_parsed(section, "timeout", &mut m.timeout)?;
            set_parsed(section, "memory_usage_limit", &mut m.memory_usage_limit)?;
            set_parsed(section, "nionic_steps", &mut m.nionic_steps)?;
            set_parsed(section, "natoms_large_cell", &mut m.natoms_large_cell)?;
            set_parsed(section, "poll_interval", &mut m.poll_interval)?;
            set_parsed(section, "monitor_freq", &mut m.monitor_freq)?;
        }

        if let Some(section) = map.get("cleanup") {
            let c = &mut self.cleanup;
            set_parsed(section, "move_unimportant_files", &mut c.move_unimportant_files)?;
            set_parsed(section, "remove_wavecar", &mut c.remove_wavecar)?;
            if let Some(Some(list)) = section.get("left_files") {
                c.left_files = split_list(list);
            }
            set_parsed(section, "verbose", &mut c.verbose)?;
        }

        if let Some(section) = map.get("logging") {
            set_string(section, "level", &mut self.logging.level);
            set_parsed(section, "print_level", &mut self.logging.print_level)?;
        }

        Ok(())
    }
}

fn set_string(section: &Section, key: &str, target: &mut String) {
    if let Some(Some(value)) = section.get(key) {
        *target = value.trim().to_string();
    }
}

fn set_parsed<T: FromStr>(section: &Section, key: &str, target: &mut T) -> Result<(), ConfigError> {
    if let Some(Some(value)) = section.get(key) {
        *target = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("Invalid {}: {}", key, value)))?;
    }
    Ok(())
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_kinds(list: &str) -> Result<Vec<DiagnosticKind>, ConfigError> {
    split_list(list)
        .iter()
        .map(|name| {
            DiagnosticKind::from_name(name)
                .ok_or_else(|| ConfigError::InvalidValue(format!("Unknown error kind: {}", name)))
        })
        .collect()
}

/// Configuration manager that handles loading and accessing program settings.
pub struct SettingsManager {
    settings: Settings,
    config_source: String,
}

impl SettingsManager {
    /// Loads configuration from the available configuration files.
    ///
    /// Files are applied from the lowest to the highest precedence: system,
    /// user, then `./vise_config.cfg`. Unreadable files are skipped with a
    /// warning.
    pub fn load() -> Result<Self, ConfigError> {
        let (settings, source) = Self::load_from_files()?;
        info!("Configuration loaded from: {}", source);
        Ok(Self {
            settings,
            config_source: source,
        })
    }

    /// Loads a single configuration file on top of the built-in defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut settings = Settings::default();
        Self::load_config(path, &mut settings)?;
        Ok(Self {
            settings,
            config_source: path.display().to_string(),
        })
    }

    /// Wraps already built settings.
    pub fn with_settings(settings: Settings) -> Self {
        Self {
            settings,
            config_source: "built-in defaults".to_string(),
        }
    }

    /// Returns the source of the loaded configuration.
    pub fn config_source(&self) -> &str {
        &self.config_source
    }

    /// Gets a reference to the settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Gets a mutable reference to the settings, e.g. for command-line overrides.
    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    fn load_from_files() -> Result<(Settings, String), ConfigError> {
        let mut settings = Settings::default();
        let mut config_source = "built-in defaults".to_string();

        let candidates = [
            ("system", Self::get_system_config_path()),
            ("user", Self::get_user_config_path()),
            ("local", Some(PathBuf::from(CONFIG_FILE_NAME))),
        ];
        for (level, path) in candidates {
            let path = match path {
                Some(path) if path.exists() => path,
                _ => continue,
            };
            // Apply onto a scratch copy so a broken file leaves no partial overrides.
            let mut layered = settings.clone();
            match Self::load_config(&path, &mut layered) {
                Ok(()) => {
                    settings = layered;
                    config_source = format!("{} config ({})", level, path.display());
                    debug!("Loaded {} configuration from: {}", level, path.display());
                }
                Err(e) => {
                    warn!("Failed to load {} config from {}: {}", level, path.display(), e);
                }
            }
        }

        Ok((settings, config_source))
    }

    fn load_config(path: &Path, settings: &mut Settings) -> Result<(), ConfigError> {
        let content = fs::read_to_string(path)?;
        let mut ini = Ini::new();
        ini.read(content)
            .map_err(|e| ConfigError::IniParse(format!("Failed to parse INI: {}", e)))?;
        settings.apply_ini(&ini)
    }

    fn get_system_config_path() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            Some(PathBuf::from("/etc/vise").join(CONFIG_FILE_NAME))
        }
        #[cfg(windows)]
        {
            std::env::var("PROGRAMDATA")
                .ok()
                .map(|pd| PathBuf::from(pd).join("vise").join(CONFIG_FILE_NAME))
        }
    }

    fn get_user_config_path() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            std::env::var("HOME").ok().map(|home| {
                PathBuf::from(home)
                    .join(".config")
                    .join("vise")
                    .join(CONFIG_FILE_NAME)
            })
        }
        #[cfg(windows)]
        {
            std::env::var("APPDATA")
                .ok()
                .map(|appdata| PathBuf::from(appdata).join("vise").join(CONFIG_FILE_NAME))
        }
    }
}

impl SettingsManager {
    /// Creates a `vise_config.cfg` template listing every option with its default.
    pub fn create_template(path: &Path) -> Result<(), ConfigError> {
        fs::write(path, Self::generate_template_content())?;
        info!("Created settings template at: {}", path.display());
        Ok(())
    }

    fn generate_template_content() -> String {
        let d = Settings::default();
        let errors: Vec<&str> = DiagnosticKind::default_enabled()
            .iter()
            .map(|k| k.name())
            .collect();
        format!(
            r#"# visejob configuration file
#
# Files are loaded in hierarchical order with local settings taking precedence:
#
# 1. Current working directory (./vise_config.cfg) - highest priority
# 2. User config directory (~/.config/vise/vise_config.cfg)
# 3. System config directory (/etc/vise/vise_config.cfg)
# 4. Built-in defaults (fallback)
#
# Missing sections or values use the built-in defaults shown below.

[job]
# VASP command line, e.g. mpirun -np 16 vasp_std
vasp_cmd = {}

# Stdout log of every run (default: vasp.out)
output_file = {}

# Maximum relaxation attempts per k-point set (default: 10)
max_relax_num = {}

[convergence]
# k-point density of the first set and after symmetry changes (default: 2.5)
initial_kpt_density = {}

# Density growth factor between sets, must exceed 1 (default: 1.2)
kpt_factor = {}

# Maximum number of k-point sets including resumed ones (default: 10)
max_kpt_num = {}

# Energy convergence criterion in eV/atom (default: 0.003)
criterion = {}

# Number of later sets compared with the candidate (default: 2)
num_kpt_check = {}

[symmetry]
# Program reading a POSCAR on stdin and printing the space-group number
command = {}

# Distance tolerance in Angstrom (default: 0.01)
symprec = {}

# Angle tolerance in degrees (default: 5)
angle_tolerance = {}

[monitor]
# Handler set: default, dielectric, no_handler, always_fail
handler_name = {}

# Error kinds looked for in the log (comma-separated; empty = default set)
# Default set: {}
enabled_errors =

# Wall-time limit in seconds (default: 129600)
timeout = {}

# Memory usage ratio that aborts a run (default: 0.85)
memory_usage_limit = {}

# Ionic steps that must all hit NELM to abort a run (default: 10)
nionic_steps = {}

# Atom count from which a cell counts as large (default: 50)
natoms_large_cell = {}

# Seconds between polls of the running process (default: 10)
poll_interval = {}

# Polls between monitor checks (default: 30)
monitor_freq = {}

[cleanup]
# Move non-essential outputs into files/ (default: true)
move_unimportant_files = {}

# Remove WAVECAR after runs (default: false)
remove_wavecar = {}

# Additional files kept at the top level (comma-separated)
left_files = {}

# 0 = quiet, 1 = normal, 2 = verbose (default: 1)
verbose = {}

[logging]
# Log level: debug, info, warn, error (default: info)
level = {}

# 0 = quiet, 1 = normal, 2 = verbose file operations (default: 1)
print_level = {}
"#,
            d.job.vasp_cmd,
            d.job.output_file,
            d.job.max_relax_num,
            d.convergence.initial_kpt_density,
            d.convergence.kpt_factor,
            d.convergence.max_kpt_num,
            d.convergence.criterion,
            d.convergence.num_kpt_check,
            d.symmetry.command,
            d.symmetry.symprec,
            d.symmetry.angle_tolerance,
            d.monitor.handler_name,
            errors.join(","),
            d.monitor.timeout,
            d.monitor.memory_usage_limit,
            d.monitor.nionic_steps,
            d.monitor.natoms_large_cell,
            d.monitor.poll_interval,
            d.monitor.monitor_freq,
            d.cleanup.move_unimportant_files,
            d.cleanup.remove_wavecar,
            d.cleanup.left_files.join(","),
            d.cleanup.verbose,
            d.logging.level,
            d.logging.print_level,
        )
    }
}
