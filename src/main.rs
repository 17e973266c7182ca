//! visejob Command-Line Interface
//!
//! Entry point of the `visejob` binary: argument parsing, help system
//! integration, and dispatch to a single structure optimization or the
//! k-point convergence loop.
//!
//! # Usage
//!
//! 1. **Configuration template** (`visejob ci vise_config.cfg`)
//! 2. **Structure optimization** (`visejob vasp_run [OPTIONS]`, alias `vr`)
//! 3. **k-point convergence** (`visejob vasp_run -kc [OPTIONS]`)
//!
//! # Examples
//!
//! ```bash
//! visejob vr -v "mpirun -np 16 vasp_std"
//! visejob vr -kc -v "mpirun -np 16 vasp_std" -criteria 0.001
//! visejob vr --print
//! ```

use log::{error, info, LevelFilter};
use std::env;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process;
use std::str::FromStr;
use visejob::cleanup::CleanupConfig;
use visejob::convergence::ConvergenceSequence;
use visejob::input_set::TemplateInputGenerator;
use visejob::job::VaspJob;
use visejob::kpt_convergence::ConvergenceLoop;
use visejob::naming;
use visejob::record::RunRecord;
use visejob::runner::CommandLauncher;
use visejob::settings::{Settings, SettingsManager, CONFIG_FILE_NAME};
use visejob::symmetry::CommandSymmetryAnalyzer;
use visejob::validation;

/// Flags of `vasp_run` that select what to do rather than how.
#[derive(Debug, Default)]
struct VaspRunArgs {
    kpoint_conv: bool,
    print: bool,
    json_file: Option<PathBuf>,
}

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage(&args[0]);
        process::exit(1);
    }

    check_help_flags(&args);

    match args[1].as_str() {
        "ci" => {
            let target = args.get(2).map(String::as_str).unwrap_or(CONFIG_FILE_NAME);
            if target != CONFIG_FILE_NAME {
                eprintln!("Error: only '{}' can be created", CONFIG_FILE_NAME);
                process::exit(1);
            }
            match run_create_settings_template() {
                Ok(()) => {
                    println!("✓ Settings template created successfully!");
                    println!("  Output file: {}", CONFIG_FILE_NAME);
                    println!("\nNext steps:");
                    println!("  1. Set vasp_cmd in the [job] section");
                    println!("  2. Adjust the convergence and monitor parameters as needed");
                    println!("  3. Run: {} vasp_run", args[0]);
                }
                Err(e) => {
                    eprintln!("Error creating settings template: {}", e);
                    process::exit(1);
                }
            }
        }
        "vasp_run" | "vr" => {
            let mut manager = match SettingsManager::load() {
                Ok(manager) => manager,
                Err(e) => {
                    eprintln!("Error loading configuration: {}", e);
                    process::exit(1);
                }
            };
            init_logger(&manager.settings().logging.level);
            info!("Configuration loaded from {}", manager.config_source());

            let run_args = match parse_vasp_run_args(&args[2..], manager.settings_mut()) {
                Ok(run_args) => run_args,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    eprintln!("Run '{} --help options' for the list of options", args[0]);
                    process::exit(1);
                }
            };

            let result = if run_args.print || run_args.json_file.is_some() {
                print_records(&manager, &run_args)
            } else {
                run_vasp(&manager, &run_args)
            };
            if let Err(e) = result {
                error!("{}", e);
                eprintln!("Error: {}", e);
                process::exit(1);
            }
        }
        command => {
            eprintln!("Error: Unknown command: {}", command);
            print_usage(&args[0]);
            process::exit(1);
        }
    }
}

/// Console logger at the level of the `[logging]` section.
fn init_logger(level: &str) {
    let level = LevelFilter::from_str(level).unwrap_or(LevelFilter::Info);
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .target(env_logger::Target::Stdout)
        .format_timestamp_millis()
        .init();
}

/// Check for help flags and print appropriate help
fn check_help_flags(args: &[String]) {
    use visejob::help::*;

    let is_help = |a: &str| a == "--help" || a == "-h";

    if args.len() >= 3 && is_help(&args[1]) {
        match args[2].as_str() {
            "options" => print_option_help(),
            "handlers" => print_handler_help(),
            "errors" => print_error_help(),
            "examples" => print_examples(),
            _ => print_global_help(),
        }
        process::exit(0);
    }

    if args.len() == 2 && is_help(&args[1]) {
        print_global_help();
        process::exit(0);
    }

    if args.len() >= 3 && args[1] == "ci" && is_help(&args[2]) {
        print_ci_help();
        process::exit(0);
    }

    if args.len() >= 3 && (args[1] == "vasp_run" || args[1] == "vr") && args[2..].iter().any(|a| is_help(a)) {
        print_option_help();
        process::exit(0);
    }
}

/// Prints usage information to stderr.
fn print_usage(program_name: &str) {
    eprintln!("visejob - VASP job control with error recovery and k-point convergence");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  {} vasp_run [OPTIONS]", program_name);
    eprintln!("                    Relax the structure in the current directory");
    eprintln!();
    eprintln!("  {} vasp_run -kc [OPTIONS]", program_name);
    eprintln!("                    Converge the k-point mesh");
    eprintln!();
    eprintln!("  {} ci {}", program_name, CONFIG_FILE_NAME);
    eprintln!("                    Create a settings template file for configuration");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  {} vr -v \"mpirun -np 16 vasp_std\"", program_name);
    eprintln!("  {} vr -kc -criteria 0.001", program_name);
    eprintln!("  {} --help options", program_name);
}

/// Creates `vise_config.cfg` in the working directory unless it already exists.
fn run_create_settings_template() -> Result<(), Box<dyn Error>> {
    let settings_path = Path::new(CONFIG_FILE_NAME);
    if settings_path.exists() {
        return Err(format!(
            "{} already exists. Please remove it first or choose a different location.",
            CONFIG_FILE_NAME
        )
        .into());
    }
    SettingsManager::create_template(settings_path)?;
    Ok(())
}

/// Applies the `vasp_run` options onto `settings`.
fn parse_vasp_run_args(args: &[String], settings: &mut Settings) -> Result<VaspRunArgs, String> {
    let mut run_args = VaspRunArgs::default();
    let mut iter = args.iter();
    while let Some(flag) = iter.next() {
        match flag.as_str() {
            "-v" | "--vasp_cmd" => settings.job.vasp_cmd = value(flag, &mut iter)?,
            "--max_relax_num" => settings.job.max_relax_num = value(flag, &mut iter)?,
            "--remove_wavecar" => settings.cleanup.remove_wavecar = true,
            "--left_files" => {
                let list: String = value(flag, &mut iter)?;
                settings.cleanup.left_files = list
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "-kc" | "--kpoint_conv" => run_args.kpoint_conv = true,
            "-ikd" | "--initial_kpt_density" => {
                settings.convergence.initial_kpt_density = value(flag, &mut iter)?
            }
            "--kpt_factor" => settings.convergence.kpt_factor = value(flag, &mut iter)?,
            "--max_kpt_num" => settings.convergence.max_kpt_num = value(flag, &mut iter)?,
            "-criteria" | "--criteria" => settings.convergence.criterion = value(flag, &mut iter)?,
            "--num_kpt_check" => settings.convergence.num_kpt_check = value(flag, &mut iter)?,
            "-handler_name" | "--handler_name" => {
                settings.monitor.handler_name = value(flag, &mut iter)?
            }
            "-timeout" | "--timeout" => settings.monitor.timeout = value(flag, &mut iter)?,
            "--symprec" => settings.symmetry.symprec = value(flag, &mut iter)?,
            "--angle_tolerance" => settings.symmetry.angle_tolerance = value(flag, &mut iter)?,
            "--print" => run_args.print = true,
            "--json_file" => run_args.json_file = Some(value(flag, &mut iter)?),
            other => return Err(format!("Unknown option: {}", other)),
        }
    }
    Ok(run_args)
}

/// Parses the argument following `flag`.
fn value<'a, T, I>(flag: &str, iter: &mut I) -> Result<T, String>
where
    T: FromStr,
    I: Iterator<Item = &'a String>,
{
    let raw = iter
        .next()
        .ok_or_else(|| format!("{} requires a value", flag))?;
    raw.parse()
        .map_err(|_| format!("Invalid value for {}: {}", flag, raw))
}

/// Runs a single structure optimization or the k-point loop in the working directory.
fn run_vasp(manager: &SettingsManager, run_args: &VaspRunArgs) -> Result<(), Box<dyn Error>> {
    let settings = manager.settings();
    let job_settings = settings.job_settings();
    validation::validate_job_settings(&job_settings)?;

    let dir = env::current_dir()?;
    let launcher = CommandLauncher::from_args(job_settings.vasp_cmd.clone())?;
    let analyzer = CommandSymmetryAnalyzer::new(&settings.symmetry.command);
    info!("VASP command: {}", launcher.command().join(" "));

    if !run_args.kpoint_conv {
        validation::validate_input_files(&dir, true)?;
        validation::validate_symmetry_analyzer(
            &analyzer,
            &dir,
            job_settings.symprec,
            job_settings.angle_tolerance,
        )?;
        let mut job = VaspJob::new(&dir, job_settings, Box::new(launcher), Box::new(analyzer))?;
        job.set_cleanup_config(CleanupConfig::from_settings_manager(manager));
        let record = job.structure_optimization_run(None)?;
        println!("{}", record);
        println!("\n****Structure optimization finished****");
        return Ok(());
    }

    let kpt_settings = settings.kpt_conv_settings();
    validation::validate_kpt_conv_settings(&kpt_settings)?;

    // After an interruption between two k-point sets the inputs only exist in
    // the last finished subdirectory.
    let resumed = ConvergenceSequence::from_dirs(&dir, &kpt_settings)?;
    let template_dir = match resumed.last() {
        Some(last) if !dir.join(naming::INCAR).exists() => dir.join(last.dirname()),
        _ => dir.clone(),
    };
    validation::validate_input_files(&template_dir, false)?;
    validation::validate_symmetry_analyzer(
        &analyzer,
        &template_dir,
        job_settings.symprec,
        job_settings.angle_tolerance,
    )?;
    let generator = TemplateInputGenerator::from_directory(
        &template_dir,
        job_settings.symprec,
        job_settings.angle_tolerance,
    )?;

    let mut job = VaspJob::new(&dir, job_settings, Box::new(launcher), Box::new(analyzer))?;
    job.set_cleanup_config(CleanupConfig::from_settings_manager(manager));
    let mut convergence = ConvergenceLoop::new(job, Box::new(generator), kpt_settings);
    let sequence = convergence.run_from_settings()?;
    println!("{}", sequence);
    println!("\n****k-point convergence reached****");
    Ok(())
}

/// Prints stored run records without launching anything.
fn print_records(manager: &SettingsManager, run_args: &VaspRunArgs) -> Result<(), Box<dyn Error>> {
    if let Some(path) = &run_args.json_file {
        println!("{}", RunRecord::load_file(path)?);
        return Ok(());
    }

    let dir = env::current_dir()?;
    if dir.join(naming::STRUCTURE_OPT_JSON).exists() {
        println!("{}", RunRecord::load(&dir)?);
    }
    let sequence = ConvergenceSequence::from_dirs(&dir, &manager.settings().kpt_conv_settings())?;
    if !sequence.is_empty() {
        println!("{}", sequence);
    } else if !dir.join(naming::STRUCTURE_OPT_JSON).exists() {
        return Err(format!("No run records found in {}", dir.display()).into());
    }
    Ok(())
}
