use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use utils::version;

use crate::config::kubernetes::KubernetesArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "PODGRID_LOG_DIR",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory for daily rolling log files (stderr only when unset)"
    )]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Discover configuration, remove leftover pods and clean up again on exit
    Serve(Box<KubernetesArgs>),
    /// Delete every leftover browser pod once
    Sweep(Box<KubernetesArgs>),
    /// Copy artifacts of a browser pod into a local directory
    Copy(Box<CopyArgs>),
    /// Show readiness and termination of a browser pod
    Status(Box<StatusArgs>),
}

#[derive(Args, Clone, Debug)]
pub struct CopyArgs {
    #[command(flatten)]
    pub kubernetes: KubernetesArgs,

    #[arg(long, help = "Name of the browser pod")]
    pub container: String,

    #[arg(
        long,
        default_value = "/var/log/cont",
        help = "Folder inside the pod to copy, e.g. /videos"
    )]
    pub folder: String,

    #[arg(
        long,
        value_hint = clap::ValueHint::DirPath,
        help = "Local directory receiving the artifacts"
    )]
    pub output: PathBuf,
}

#[derive(Args, Clone, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub kubernetes: KubernetesArgs,

    #[arg(long, help = "Name of the browser pod")]
    pub container: String,
}
