//! Command-line interface built on clap.
//!
//! Defines [`Cli`] with the [`Command`] subcommands (backup, restore,
//! exclusions) and the global flags (--config, --max-attempts, --json,
//! --verbose).

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::state_machine::{Compression, Firmware};

/// Supervises whole-volume backup and restore through an imaging engine.
#[derive(Debug, Parser)]
#[command(name = "imagewarden", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (defaults to ./imagewarden.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Attempts per skipped file during the retry pass (at least 1).
    #[arg(long, global = true, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_attempts: Option<u32>,

    /// Print the final report as JSON on stdout instead of the summary.
    #[arg(long, global = true, default_value_t = false)]
    pub json: bool,

    /// Enables debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Compression accepted on the command line, mapped to [`Compression`].
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CompressArg {
    None,
    Fast,
    Maximum,
}

impl From<CompressArg> for Compression {
    fn from(arg: CompressArg) -> Self {
        match arg {
            CompressArg::None => Compression::None,
            CompressArg::Fast => Compression::Fast,
            CompressArg::Maximum => Compression::Maximum,
        }
    }
}

/// Firmware accepted on the command line, mapped to [`Firmware`].
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum FirmwareArg {
    Uefi,
    Bios,
    All,
}

impl From<FirmwareArg> for Firmware {
    fn from(arg: FirmwareArg) -> Self {
        match arg {
            FirmwareArg::Uefi => Firmware::Uefi,
            FirmwareArg::Bios => Firmware::Bios,
            FirmwareArg::All => Firmware::All,
        }
    }
}

#[derive(Debug, Args)]
pub struct BackupArgs {
    /// Volume or directory to capture, e.g. C:
    #[arg(long)]
    pub source: String,

    /// Image file to write.
    #[arg(long)]
    pub dest: PathBuf,

    /// Image name stored in the archive.
    #[arg(long, default_value = "Backup")]
    pub name: String,

    /// Free-text description stored in the archive.
    #[arg(long, default_value = "")]
    pub description: String,

    #[arg(long, value_enum)]
    pub compress: Option<CompressArg>,

    /// Engine worker threads; 0 uses every logical CPU.
    #[arg(long)]
    pub threads: Option<u32>,

    /// Skip files the engine cannot read and retry them afterwards.
    #[arg(long, default_value_t = false)]
    pub tolerate_errors: bool,

    /// Extra exclusion pattern; may be repeated.
    #[arg(long = "exclude")]
    pub exclusions: Vec<String>,

    /// Do not query the volume dirty bit before capturing.
    #[arg(long, default_value_t = false)]
    pub skip_dirty_check: bool,
}

#[derive(Debug, Args)]
pub struct RestoreArgs {
    /// Image file to apply.
    #[arg(long)]
    pub image: PathBuf,

    /// Drive letter to restore onto, e.g. D:
    #[arg(long)]
    pub target: String,

    /// Image index inside the archive.
    #[arg(long)]
    pub index: Option<u32>,

    #[arg(long, value_enum)]
    pub firmware: Option<FirmwareArg>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Captures a volume into an image file.
    Backup(BackupArgs),

    /// Applies an image to a volume and makes it bootable.
    Restore(RestoreArgs),

    /// Prints the exclusion list a backup would use.
    Exclusions {
        /// Extra exclusion pattern; may be repeated.
        #[arg(long = "exclude")]
        exclusions: Vec<String>,
    },
}
