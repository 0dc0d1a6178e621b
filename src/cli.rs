use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "autovm", about = "Unattended VM provisioning via the VirtualBox CLI")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "autovm.env")]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Write a starter config file
    Init {
        /// Accept all defaults without prompting
        #[arg(long)]
        defaults: bool,
    },

    /// Run the environment checks and report, without provisioning
    Preflight,

    /// Provision the VM end-to-end: preflight, download, install, configure
    Up {
        /// Remove the existing disk and answer file to force a fresh install
        #[arg(long)]
        reset: bool,

        /// Open an SSH session once provisioning completes
        #[arg(long)]
        connect: bool,

        /// Answer-file template to use instead of the embedded one
        #[arg(long)]
        answer_template: Option<PathBuf>,
    },

    /// Show whether the VM exists and its SSH port answers
    Status,

    /// Power the VM off
    Down,

    /// Destroy the VM and remove its work-directory artifacts
    Destroy,

    /// Open an interactive SSH session to the guest
    Ssh,
}
