use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// ksstorage - run kickstart storage commands against a device tree
#[derive(Parser)]
#[command(name = "ksstorage")]
#[command(about = "Validate kickstart storage specs and plan the storage actions they produce")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a storage spec file
    Validate {
        /// Path to the storage spec (JSON)
        spec: PathBuf,
    },
    /// Run a storage spec against an inventory and print the resulting plan
    Plan {
        /// Path to the storage spec (JSON)
        #[arg(short, long)]
        spec: PathBuf,
        /// Path to the device inventory (JSON)
        #[arg(short, long)]
        inventory: PathBuf,
        /// Print the plan as JSON instead of text
        #[arg(long)]
        json: bool,
        /// Never fetch escrow certificates over the network
        #[arg(long)]
        offline: bool,
    },
    /// List the fixed run stages in order
    Stages,
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
