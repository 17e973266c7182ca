//! Built-in help for the command-line interface
//!
//! Documents every `vasp_run` option, the handler sets and the error kinds the
//! corrective handler recognises.

use crate::diagnostics::DiagnosticKind;
use std::collections::BTreeMap;

/// Category for organizing options in the help system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OptionCategory {
    /// Options controlling the VASP launch and retry loop.
    Job,
    /// Options of the k-point convergence loop.
    Convergence,
    /// Options of the runtime error handlers.
    Handlers,
    /// Symmetry analysis tolerances.
    Symmetry,
    /// Inspection of finished runs.
    Output,
}

/// Documentation entry for a single command-line option.
#[derive(Debug, Clone)]
pub struct CliOption {
    /// Long form of the flag (e.g. "--vasp_cmd").
    pub flag: &'static str,
    /// Short alias, if any.
    pub alias: Option<&'static str>,
    /// The category to which this option belongs.
    pub category: OptionCategory,
    /// What the option does.
    pub description: &'static str,
    /// Default value, if applicable.
    pub default_value: Option<&'static str>,
    /// Example usage.
    pub example: Option<&'static str>,
}

/// Handler set documentation
#[derive(Debug, Clone)]
pub struct HandlerSetInfo {
    /// Name accepted by `-handler_name`.
    pub name: &'static str,
    /// What the set is meant for.
    pub description: &'static str,
    /// Handlers in the order they are checked.
    pub handlers: &'static [&'static str],
}

/// All option documentation
pub const OPTIONS: &[CliOption] = &[
    CliOption {
        flag: "--vasp_cmd",
        alias: Some("-v"),
        category: OptionCategory::Job,
        description: "VASP command line, split on whitespace",
        default_value: Some("vasp_cmd in [job] of vise_config.cfg"),
        example: Some("-v \"mpirun -np 16 vasp_std\""),
    },
    CliOption {
        flag: "--max_relax_num",
        alias: None,
        category: OptionCategory::Job,
        description: "Maximum number of relaxation attempts per structure optimization",
        default_value: Some("10"),
        example: Some("--max_relax_num 5"),
    },
    CliOption {
        flag: "--remove_wavecar",
        alias: None,
        category: OptionCategory::Job,
        description: "Remove WAVECAR after the optimization (after the whole loop with -kc)",
        default_value: Some("off"),
        example: None,
    },
    CliOption {
        flag: "--left_files",
        alias: None,
        category: OptionCategory::Job,
        description: "Comma-separated extra files left beside the .finish outputs",
        default_value: None,
        example: Some("--left_files CHGCAR,WAVECAR"),
    },
    CliOption {
        flag: "--kpoint_conv",
        alias: Some("-kc"),
        category: OptionCategory::Convergence,
        description: "Run the k-point convergence loop instead of a single optimization",
        default_value: Some("off"),
        example: None,
    },
    CliOption {
        flag: "--initial_kpt_density",
        alias: Some("-ikd"),
        category: OptionCategory::Convergence,
        description: "k-point density of the first set and after space-group changes",
        default_value: Some("2.5"),
        example: Some("-ikd 3.0"),
    },
    CliOption {
        flag: "--kpt_factor",
        alias: None,
        category: OptionCategory::Convergence,
        description: "Growth factor of the density between k-point sets",
        default_value: Some("1.2"),
        example: Some("--kpt_factor 1.3"),
    },
    CliOption {
        flag: "--max_kpt_num",
        alias: None,
        category: OptionCategory::Convergence,
        description: "Maximum number of k-point sets, resumed ones included",
        default_value: Some("10"),
        example: None,
    },
    CliOption {
        flag: "-criteria",
        alias: None,
        category: OptionCategory::Convergence,
        description: "Energy convergence criterion in eV/atom",
        default_value: Some("0.003"),
        example: Some("-criteria 0.001"),
    },
    CliOption {
        flag: "--num_kpt_check",
        alias: None,
        category: OptionCategory::Convergence,
        description: "Number of later k-point sets the candidate is compared against",
        default_value: Some("2"),
        example: None,
    },
    CliOption {
        flag: "-handler_name",
        alias: None,
        category: OptionCategory::Handlers,
        description: "Handler set: default, dielectric, no_handler or always_fail",
        default_value: Some("default"),
        example: Some("-handler_name dielectric"),
    },
    CliOption {
        flag: "-timeout",
        alias: None,
        category: OptionCategory::Handlers,
        description: "Wall-clock limit in seconds, measured from INCAR modification",
        default_value: Some("129600"),
        example: Some("-timeout 86400"),
    },
    CliOption {
        flag: "--symprec",
        alias: None,
        category: OptionCategory::Symmetry,
        description: "Distance tolerance of the space-group analysis in Å",
        default_value: Some("0.01"),
        example: None,
    },
    CliOption {
        flag: "--angle_tolerance",
        alias: None,
        category: OptionCategory::Symmetry,
        description: "Angle tolerance of the space-group analysis in degrees",
        default_value: Some("5"),
        example: None,
    },
    CliOption {
        flag: "--print",
        alias: None,
        category: OptionCategory::Output,
        description: "Print the run record(s) of the working directory and exit",
        default_value: None,
        example: None,
    },
    CliOption {
        flag: "--json_file",
        alias: None,
        category: OptionCategory::Output,
        description: "Print the run record stored in the given structure_opt.json and exit",
        default_value: None,
        example: Some("--json_file kpt7x7x7_pre-sg225_pos-sg225/structure_opt.json"),
    },
];

/// Handler sets selectable with `-handler_name`
pub const HANDLER_SETS: &[HandlerSetInfo] = &[
    HandlerSetInfo {
        name: "default",
        description: "Structure optimizations and ordinary self-consistent runs",
        handlers: &[
            "VaspErrorHandler",
            "UnconvergedErrorHandler",
            "NonConvergingHandler",
            "DivergingEnergyHandler",
            "TooLongTimeHandler",
            "MemorySwapHandler",
        ],
    },
    HandlerSetInfo {
        name: "dielectric",
        description: "Linear-response dielectric runs; NELM exhaustion is fatal",
        handlers: &[
            "VaspErrorHandler",
            "DielectricMaxIterationHandler",
            "DivergingEnergyHandler",
            "TooLongTimeHandler",
            "MemorySwapHandler",
        ],
    },
    HandlerSetInfo {
        name: "no_handler",
        description: "Run VASP without any error detection",
        handlers: &[],
    },
    HandlerSetInfo {
        name: "always_fail",
        description: "Fail after the first attempt; for testing pipelines",
        handlers: &["AlwaysFailHandler"],
    },
];

/// Print global help
pub fn print_global_help() {
    println!("visejob - VASP job control with error recovery and k-point convergence");
    println!();
    println!("USAGE:");
    println!("    visejob <COMMAND> [OPTIONS]");
    println!();
    println!("COMMANDS:");
    println!("    vasp_run, vr [OPTIONS]");
    println!("                        Relax the structure in the current directory,");
    println!("                        correcting VASP errors between attempts");
    println!();
    println!("    vasp_run -kc [OPTIONS]");
    println!("                        Repeat relaxations with growing k-point density");
    println!("                        until energy and lattice converge");
    println!();
    println!("    ci vise_config.cfg");
    println!("                        Create a configuration template file");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help [topic]   Show help. Topics: options, handlers, errors, examples");
    println!();
    println!("CONFIGURATION FILE:");
    println!("    visejob reads 'vise_config.cfg' from, in increasing priority:");
    println!("      - /etc/vise/vise_config.cfg (system)");
    println!("      - ~/.config/vise/vise_config.cfg (user)");
    println!("      - ./vise_config.cfg (local)");
    println!("    Command-line options override the file.");
    println!();
    println!("LOGGING:");
    println!("    Set RUST_LOG=debug for detailed output.");
    println!();
}

/// Print help for 'ci' command
pub fn print_ci_help() {
    println!("Create Configuration Template (ci) Command");
    println!("═════════════════════════════════════════════");
    println!();
    println!("USAGE:");
    println!("    visejob ci vise_config.cfg");
    println!();
    println!("DESCRIPTION:");
    println!("    Writes every configuration section with its default value:");
    println!("    [job], [convergence], [symmetry], [monitor], [cleanup], [logging].");
    println!("    An existing file is never overwritten.");
    println!();
}

/// Print option reference
pub fn print_option_help() {
    println!("OPTION REFERENCE");
    println!("═══════════════════════════════════════════════════════════════════════");
    println!();

    let mut categories: BTreeMap<OptionCategory, Vec<&CliOption>> = BTreeMap::new();
    for option in OPTIONS {
        categories.entry(option.category).or_default().push(option);
    }

    for (category, options) in categories {
        print_category_header(category);
        println!();
        for option in options {
            print_option(option);
            println!();
        }
    }
}

/// Print the handler sets
pub fn print_handler_help() {
    println!("HANDLER SETS");
    println!("═══════════════════════════════════════════════════════════════════════");
    println!();
    for set in HANDLER_SETS {
        println!("{}", set.name);
        println!("    {}", set.description);
        if set.handlers.is_empty() {
            println!("    Handlers: none");
        } else {
            println!("    Handlers: {}", set.handlers.join(", "));
        }
        println!();
    }
}

/// Print the error kinds recognised in the VASP log
pub fn print_error_help() {
    println!("RECOGNISED VASP ERRORS");
    println!("═══════════════════════════════════════════════════════════════════════");
    println!();
    let enabled = DiagnosticKind::default_enabled();
    for kind in DiagnosticKind::ALL {
        let marker = if enabled.contains(&kind) { "" } else { " [opt-in]" };
        println!("{}{}", kind.name(), marker);
        for message in kind.messages() {
            println!("    \"{}\"", message);
        }
    }
    println!();
    println!("Enable or exclude kinds with enabled_errors in the [monitor] section.");
    println!();
}

/// Print usage examples
pub fn print_examples() {
    println!("EXAMPLES");
    println!("═══════════════════════════════════════════════════════════════════════");
    println!();
    println!("Single structure optimization:");
    println!("    visejob vr -v \"mpirun -np 32 vasp_std\"");
    println!();
    println!("k-point convergence with a tighter criterion:");
    println!("    visejob vr -kc -v \"mpirun -np 32 vasp_std\" -criteria 0.001");
    println!();
    println!("Resume an interrupted convergence run:");
    println!("    visejob vr -kc        # finished kpt* directories are reused");
    println!();
    println!("Inspect the records:");
    println!("    visejob vr --print");
    println!("    visejob vr --json_file kpt5x5x5_pre-sg225_pos-sg225/structure_opt.json");
    println!();
}

/// Print category header
fn print_category_header(category: OptionCategory) {
    let title = match category {
        OptionCategory::Job => "JOB CONTROL",
        OptionCategory::Convergence => "K-POINT CONVERGENCE",
        OptionCategory::Handlers => "ERROR HANDLERS",
        OptionCategory::Symmetry => "SYMMETRY",
        OptionCategory::Output => "OUTPUT",
    };
    println!("{}", title);
    println!("{}", "─".repeat(76));
}

/// Print single option
fn print_option(option: &CliOption) {
    match option.alias {
        Some(alias) => println!("{}, {}", alias, option.flag),
        None => println!("{}", option.flag),
    }
    println!("    {}", option.description);
    if let Some(default) = option.default_value {
        println!("    Default: {}", default);
    }
    if let Some(example) = option.example {
        println!("    Example: {}", example);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_handler_set_documented() {
        let documented: Vec<&str> = HANDLER_SETS.iter().map(|s| s.name).collect();
        assert_eq!(documented, crate::validation::HANDLER_SETS.to_vec());
    }

    #[test]
    fn test_flags_unique() {
        let mut flags: Vec<&str> = OPTIONS.iter().map(|o| o.flag).collect();
        flags.extend(OPTIONS.iter().filter_map(|o| o.alias));
        let total = flags.len();
        flags.sort();
        flags.dedup();
        assert_eq!(flags.len(), total);
    }
}
