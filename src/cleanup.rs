//! File lifecycle of relaxation and k-point convergence runs.
//!
//! VASP writes every output under a fixed name into the working directory, so
//! a campaign of many runs needs explicit bookkeeping to keep results apart:
//!
//! - the outputs of the converged attempt are tagged `<file>.finish`
//! - zero-byte files are removed
//! - anything not worth keeping at the top level is moved into `files/`
//! - WAVECAR is removed on request (it is usually the largest file)
//! - each finished k-point set is moved into its own `kpt...` directory
//! - the converged set's inputs and `.finish` files are symlinked back
//!
//! # Configuration
//!
//! ```ini
//! [cleanup]
//! # Move non-essential outputs into files/ (default: true)
//! move_unimportant_files = true
//!
//! # Remove WAVECAR after each run (default: false)
//! remove_wavecar = false
//!
//! # Additional files left at the top level (comma-separated)
//! # left_files = CHGCAR,LOCPOT
//!
//! # 0 = quiet, 1 = normal, 2 = verbose
//! verbose = 1
//! ```

use crate::naming::{self, FileNaming};
use crate::settings::CONFIG_FILE_NAME;
use log::{debug, error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Files that belong to the whole campaign rather than to one run: the
/// local settings and the batch script.
const JOB_FILES: [&str; 2] = [CONFIG_FILE_NAME, naming::RUNSHELL];

/// Errors that can occur during cleanup operations.
#[derive(Error, Debug)]
pub enum CleanupError {
    /// I/O error during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid path error
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

/// Result type for cleanup operations
pub type Result<T> = std::result::Result<T, CleanupError>;

/// Configuration for cleanup operations.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Move files that are not kept into `files/`
    pub move_unimportant_files: bool,

    /// Remove WAVECAR when a run has finished
    pub remove_wavecar: bool,

    /// Extra file names kept at the top level
    pub left_files: Vec<String>,

    /// Verbosity level for cleanup logging
    pub verbose: u32,

    /// Global print level from general settings (0=quiet, 1=normal, 2=verbose)
    pub print_level: u32,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            move_unimportant_files: true,
            remove_wavecar: false,
            left_files: Vec::new(),
            verbose: 1,
            print_level: 1,
        }
    }
}

impl CleanupConfig {
    /// Creates a cleanup configuration from the settings manager.
    pub fn from_settings_manager(settings_manager: &crate::settings::SettingsManager) -> Self {
        let settings = settings_manager.settings();
        CleanupConfig {
            move_unimportant_files: settings.cleanup.move_unimportant_files,
            remove_wavecar: settings.cleanup.remove_wavecar,
            left_files: settings.cleanup.left_files.clone(),
            verbose: settings.cleanup.verbose,
            print_level: settings.logging.print_level,
        }
    }

    /// Checks if logging should occur based on print_level and verbose settings.
    ///
    /// A print level of 0 silences cleanup messages, 2 shows all of them, and 1
    /// defers to the cleanup-specific `verbose` level.
    pub fn should_log(&self, min_verbose_level: u32) -> bool {
        if self.print_level == 0 {
            return false;
        }
        if self.print_level >= 2 {
            return true;
        }
        self.verbose >= min_verbose_level
    }
}

/// Applies the file lifecycle rules to run directories.
pub struct CleanupManager {
    config: CleanupConfig,
    naming: FileNaming,
}

impl CleanupManager {
    /// Creates a new cleanup manager for jobs logging to `naming.output_file()`.
    pub fn new(config: CleanupConfig, naming: FileNaming) -> Self {
        Self { config, naming }
    }

    /// The configuration in use.
    pub fn config(&self) -> &CleanupConfig {
        &self.config
    }

    /// Files that stay at the top level of a finished run directory.
    ///
    /// Inputs, `vise.json`, `structure_opt.json`, the `.finish` outputs, the
    /// job files and the configured extra files.
    pub fn kept_files(&self) -> Vec<String> {
        let mut files: Vec<String> = naming::VASP_INPUT_FILES.iter().map(|s| s.to_string()).collect();
        files.extend(JOB_FILES.iter().map(|s| s.to_string()));
        files.push(naming::VISE_JSON.to_string());
        files.push(naming::STRUCTURE_OPT_JSON.to_string());
        files.extend(self.naming.finished_files());
        files.push(self.naming.finish(self.naming.output_file()));
        for extra in &self.config.left_files {
            if !files.contains(extra) {
                files.push(extra.clone());
            }
        }
        files
    }

    /// Renames the saved copies of `attempt` to `<file>.finish`.
    pub fn tag_finished(&self, directory: &Path, attempt: usize) -> Result<()> {
        for file in self.naming.saved_files() {
            let src = directory.join(self.naming.attempt(&file, attempt));
            if src.exists() {
                let dst = directory.join(self.naming.finish(&file));
                fs::rename(&src, &dst)?;
                if self.config.should_log(2) {
                    debug!("Renamed {} -> {}", src.display(), dst.display());
                }
            }
        }
        Ok(())
    }

    /// Removes zero-byte files directly under `directory`.
    pub fn remove_empty_files(&self, directory: &Path) -> Result<usize> {
        let mut removed = 0;
        for path in regular_files(directory)? {
            if fs::metadata(&path)?.len() == 0 {
                fs::remove_file(&path)?;
                removed += 1;
                if self.config.should_log(2) {
                    debug!("Removed empty file {}", path.display());
                }
            }
        }
        Ok(removed)
    }

    /// Removes WAVECAR from `directory` when configured to.
    pub fn remove_wavecar(&self, directory: &Path) -> Result<()> {
        if !self.config.remove_wavecar {
            return Ok(());
        }
        let wavecar = directory.join(naming::WAVECAR);
        if wavecar.exists() {
            fs::remove_file(&wavecar)?;
            if self.config.should_log(1) {
                info!("Removed {}", wavecar.display());
            }
        }
        Ok(())
    }

    /// Removes WAVECAR from every subdirectory of `directory`, archives
    /// included, when configured to.
    pub fn remove_wavecars_in_subdirs(&self, directory: &Path) -> Result<()> {
        if !self.config.remove_wavecar {
            return Ok(());
        }
        for entry in fs::read_dir(directory)? {
            let path = entry?.path();
            if path.is_dir() && !path.symlink_metadata()?.file_type().is_symlink() {
                self.remove_wavecar(&path)?;
                self.remove_wavecars_in_subdirs(&path)?;
            }
        }
        Ok(())
    }

    /// Moves every file of `directory` that is not in [`kept_files`](Self::kept_files)
    /// into `files/`.
    ///
    /// Returns the number of files moved. Does nothing when
    /// `move_unimportant_files` is off.
    pub fn archive_unimportant_files(&self, directory: &Path) -> Result<usize> {
        if !self.config.move_unimportant_files {
            return Ok(0);
        }
        let kept = self.kept_files();
        let archive = directory.join(naming::ARCHIVE_DIR);
        fs::create_dir_all(&archive)?;

        let mut moved = 0;
        let mut errors = 0;
        for path in regular_files(directory)? {
            let name = file_name(&path)?;
            if kept.iter().any(|k| *k == name) {
                continue;
            }
            match fs::rename(&path, archive.join(&name)) {
                Ok(()) => moved += 1,
                Err(e) => {
                    warn!("Failed to move {}: {}", path.display(), e);
                    errors += 1;
                }
            }
        }
        if self.config.should_log(1) {
            info!("Moved {} file(s) into {}", moved, archive.display());
        }
        if errors > 0 {
            error!("Archiving completed with {} errors", errors);
        }
        Ok(moved)
    }

    /// Moves the files of `directory` and its `files/` archive into `directory/dirname`.
    ///
    /// The job files and other subdirectories (earlier k-point sets) stay
    /// where they are.
    pub fn move_run_into(&self, directory: &Path, dirname: &str) -> Result<PathBuf> {
        let target = directory.join(dirname);
        if target.exists() {
            return Err(CleanupError::InvalidPath(format!(
                "Run directory already exists: {}",
                target.display()
            )));
        }
        fs::create_dir_all(&target)?;
        for path in regular_files(directory)? {
            let name = file_name(&path)?;
            if JOB_FILES.contains(&name.as_str()) {
                continue;
            }
            fs::rename(&path, target.join(name))?;
        }
        let archive = directory.join(naming::ARCHIVE_DIR);
        if archive.is_dir() {
            fs::rename(&archive, target.join(naming::ARCHIVE_DIR))?;
        }
        if self.config.should_log(1) {
            info!("Moved finished run into {}", target.display());
        }
        Ok(target)
    }

    /// Symlinks the inputs and `.finish` outputs of `directory/dirname` into `directory`.
    ///
    /// Existing links or files of the same name are replaced.
    pub fn link_converged(&self, directory: &Path, dirname: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = naming::VASP_INPUT_FILES.iter().map(|s| s.to_string()).collect();
        names.extend(self.naming.finished_files());

        let mut linked = Vec::new();
        for name in names {
            let source = directory.join(dirname).join(&name);
            if !source.exists() {
                continue;
            }
            let link = directory.join(&name);
            if link.symlink_metadata().is_ok() {
                fs::remove_file(&link)?;
            }
            symlink(&Path::new(dirname).join(&name), &link)?;
            linked.push(name);
        }
        if self.config.should_log(1) {
            info!("Linked converged files from {}: {}", dirname, linked.join(", "));
        }
        Ok(linked)
    }
}

/// Non-hidden regular files directly under `directory`.
fn regular_files(directory: &Path) -> Result<Vec<PathBuf>> {
    if !directory.is_dir() {
        return Err(CleanupError::InvalidPath(format!(
            "Path is not a directory: {}",
            directory.display()
        )));
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        let hidden = path
            .file_name()
            .and_then(|s| s.to_str())
            .map_or(true, |s| s.starts_with('.'));
        if !hidden && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .ok_or_else(|| CleanupError::InvalidPath(path.display().to_string()))
}

#[cfg(unix)]
fn symlink(original: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(original, link)
}

#[cfg(not(unix))]
fn symlink(original: &Path, link: &Path) -> std::io::Result<()> {
    // Without symlinks, fall back to a copy relative to the link's directory.
    let parent = link.parent().unwrap_or_else(|| Path::new("."));
    fs::copy(parent.join(original), link).map(|_| ())
}
