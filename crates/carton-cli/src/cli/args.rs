//! Command-line arguments.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "carton",
    version,
    about = "Packages a script application into a single self-executing bundle"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build the bundle from the working directory and its configuration
    Compile(CompileArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CompileArgs {
    /// Configuration file (default: box.json, then box.json.dist)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Ignore any configuration file
    #[arg(long, conflicts_with = "config")]
    pub no_config: bool,

    /// Directory to build in (default: current directory)
    #[arg(long, value_name = "PATH")]
    pub working_dir: Option<PathBuf>,

    /// Dev mode: per-entry compression is skipped
    #[arg(long)]
    pub dev: bool,

    /// Accepted for compatibility; the build is always sequential
    #[arg(long)]
    pub no_parallel: bool,

    /// Hand the finished bundle to the external Docker file emitter
    #[arg(long)]
    pub with_docker: bool,

    /// Dump the resolved configuration and file list under .box_dump/
    #[arg(long)]
    pub debug: bool,

    /// Verbosity forwarded to the dependency manager (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
