//! CLI argument parsing using clap derive API
//!
//! Purely declarative: no side effects or I/O.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use platval_core::OsType;

/// platval -- hardware platform validation suite.
///
/// Use `platval <COMMAND> --help` for subcommand details.
#[derive(Parser, Debug)]
#[command(name = "platval", version, about, long_about = None)]
pub struct Cli {
    /// Path to the platval.toml configuration file.
    #[arg(short, long, default_value = "platval.toml")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Output format.
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Supported output formats.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    Text,
    /// Machine-readable JSON.
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the registered test cases.
    List(ListArgs),

    /// Run one test case against the configured SUT.
    Run(RunArgs),

    /// Manage configuration.
    Config(ConfigArgs),
}

// ---- list ----

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only cases carrying this tag.
    #[arg(long)]
    pub tag: Option<String>,

    /// Also show each case's arguments.
    #[arg(short, long)]
    pub verbose: bool,
}

// ---- run ----

/// Run a test case. Everything after the case id is handed to the case,
/// e.g. `platval run capsule-update --capsule-path a.cap --expected-ver 0091`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Test case id (see `platval list`).
    pub case: String,

    /// Log the commands instead of executing them.
    #[arg(long)]
    pub dry_run: bool,

    /// SUT operating system to assume for a dry run.
    #[arg(long, requires = "dry_run")]
    pub os: Option<OsType>,

    /// Arguments of the test case.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

impl RunArgs {
    /// Case arguments with a trailing `--dry-run` taken out. The flag is
    /// accepted after the case arguments too.
    pub fn split_dry_run(&self) -> (Vec<String>, bool) {
        let mut dry_run = self.dry_run;
        let args = self
            .args
            .iter()
            .filter(|a| {
                let is_flag = *a == "--dry-run";
                dry_run |= is_flag;
                !is_flag
            })
            .cloned()
            .collect();
        (args, dry_run)
    }
}

// ---- config ----

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Validate the configuration file and report errors.
    Validate,
    /// Show the effective configuration (file + env overrides + defaults).
    Show {
        /// Show only one section (general, sut, sut2, host, bmc, timeouts,
        /// drivers, network, stress, vm, bios, seamless).
        #[arg(long)]
        section: Option<String>,
    },
}
