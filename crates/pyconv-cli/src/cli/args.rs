use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "pyconv",
    version,
    about = "Convert between .pyc containers and bare marshal payloads"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Path to a YAML config file
    #[arg(long, global = true, env = "PYCONV_CONFIG")]
    pub config: Option<PathBuf>,

    /// Host interpreter used to decode and re-frame (default: python3)
    #[arg(long, global = true, env = "PYCONV_INTERPRETER")]
    pub interpreter: Option<String>,

    /// Sandbox timeout in seconds
    #[arg(long, global = true, env = "PYCONV_TIMEOUT")]
    pub timeout: Option<u64>,

    /// Use this MAJOR.MINOR instead of asking the interpreter
    #[arg(long, global = true, env = "PYCONV_HOST_VERSION")]
    pub host_version: Option<String>,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Convert each file in whichever direction it needs
    Convert(ConvertArgs),
    /// Report whether each file is a container or a payload
    Detect(DetectArgs),
    /// Show the version magic table
    Magic(MagicArgs),
    /// Show the host interpreter, its magic, and active limits
    Info(InfoArgs),
    Version,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ConvertArgs {
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Write outputs here instead of next to each input
    #[arg(long, short)]
    pub out_dir: Option<PathBuf>,

    /// Conversions in flight at once
    #[arg(long, short, default_value_t = 4)]
    pub jobs: usize,
}

#[derive(clap::Args, Debug, Clone)]
pub struct DetectArgs {
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(clap::Args, Debug, Clone)]
pub struct MagicArgs {
    /// Resolve a single version label (unknown labels show the fallback)
    #[arg(long)]
    pub version: Option<String>,

    #[arg(long, value_enum, default_value_t)]
    pub format: OutputFormat,
}

#[derive(clap::Args, Debug, Clone)]
pub struct InfoArgs {
    #[arg(long, value_enum, default_value_t)]
    pub format: OutputFormat,
}
