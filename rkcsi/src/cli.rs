use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rkcsi", version, about = "RK8s distributed-filesystem CSI node plugin")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the node plugin with config file
    Start {
        #[arg(short, long)]
        config: PathBuf,
        /// Overrides `node_id` from the config file
        #[arg(long)]
        node_id: Option<String>,
        /// Overrides `addr` from the config file
        #[arg(long)]
        addr: Option<SocketAddr>,
    },
}
