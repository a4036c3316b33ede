use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "modhost")]
#[command(version)]
#[command(about = "Host process for pluggable modules and their daemons", long_about = None)]
pub(crate) struct Cli {
    /// Modules directory. Can also be set via MODHOST_MODULES_DIR env var.
    #[arg(long, global = true)]
    pub modules_dir: Option<PathBuf>,

    /// Start modules whose name matches the glob
    #[arg(long = "module", value_name = "GLOB")]
    pub modules: Vec<String>,

    /// Start modules providing the service id or an alias matching the glob
    #[arg(long = "service", value_name = "ID|GLOB")]
    pub services: Vec<String>,

    /// Run a daemon: instance name followed by its options, as one string
    /// (e.g. --run "echo.1 --port 9")
    #[arg(long = "run", value_name = "ARGV", allow_hyphen_values = true)]
    pub run: Vec<String>,

    /// Run N daemons: count, instance name and options, as one string
    /// (e.g. --run-n "3 echo.n --port 9")
    #[arg(long = "run-n", value_name = "ARGV", allow_hyphen_values = true)]
    pub run_n: Vec<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Splits one `--run`/`--run-n` value into argv tokens.
pub(crate) fn split_argv(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Print the manifest of a module binary
    Genmanifest {
        /// Path to the module binary
        binary: PathBuf,

        /// Write the manifest to a file instead of stdout
        #[arg(long)]
        outfile: Option<PathBuf>,
    },
}
