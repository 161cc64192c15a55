use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::LabConfig;
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "arena",
    about = "Bootstrap a lab and sync its files and terminal",
    author,
    version = concat!(env!("CARGO_PKG_VERSION"), "-", env!("ARENA_BUILD_TIMESTAMP"))
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "ARENA_CONFIG",
        value_name = "PATH",
        help = "TOML config file applied before environment overrides"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_name = "URL",
        help = "Base URL of the provisioning API"
    )]
    pub api_base: Option<String>,

    #[arg(
        long,
        global = true,
        value_name = "TEMPLATE",
        help = "Control channel URL template ({lab_id}, {language})"
    )]
    pub control_url: Option<String>,

    #[arg(
        long,
        global = true,
        value_name = "TEMPLATE",
        help = "Execution channel URL template ({lab_id}, {language})"
    )]
    pub exec_url: Option<String>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Flags win over the file and the environment.
    pub fn apply_overrides(&self, config: &mut LabConfig) {
        if let Some(base) = &self.api_base {
            config.api_base = base.clone();
        }
        if let Some(url) = &self.control_url {
            config.control_url = url.clone();
        }
        if let Some(url) = &self.exec_url {
            config.exec_url = url.clone();
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "ARENA_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "ARENA_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct LabArgs {
    #[arg(long, env = "ARENA_LAB_ID", help = "Lab identifier")]
    pub lab: String,

    #[arg(
        long,
        env = "ARENA_LANGUAGE",
        default_value = "react",
        help = "Lab language or stack"
    )]
    pub language: String,

    #[arg(long, help = "Do not wait for the terminal channel before reporting ready")]
    pub no_pty: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Bootstrap the lab, print progress, then the file tree
    Up(LabArgs),
    /// Print the content of one file
    Cat(CatArgs),
    /// Print the lab file tree
    Tree(LabArgs),
    /// Run a checkpoint test and print the result
    Test(TestArgs),
    /// Run the project and stream terminal output
    Run(RunArgs),
}

#[derive(Args, Debug)]
pub struct CatArgs {
    #[command(flatten)]
    pub lab: LabArgs,

    #[arg(value_name = "PATH")]
    pub path: String,
}

#[derive(Args, Debug)]
pub struct TestArgs {
    #[command(flatten)]
    pub lab: LabArgs,

    #[arg(value_name = "CHECKPOINT")]
    pub checkpoint: String,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub lab: LabArgs,

    #[arg(
        long = "init",
        value_name = "CMD",
        help = "Setup command run before the main command (repeatable)"
    )]
    pub init: Vec<String>,

    #[arg(long, value_name = "CMD", help = "Main command to run")]
    pub command: String,

    #[arg(
        long,
        value_name = "SECS",
        help = "Stop streaming after this many seconds"
    )]
    pub duration: Option<u64>,
}
