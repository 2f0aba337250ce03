//! CLI command definitions using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Quay - transactional store-and-forward queuing
#[derive(Parser, Debug)]
#[command(name = "quay")]
#[command(version)]
#[command(about = "Run a queue node, send a message, or inspect a message store")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a queue manager until Ctrl+C
    Serve {
        /// Queue manager TOML file
        #[arg(short, long)]
        config: PathBuf,

        /// Receive and log messages arriving on this queue
        #[arg(short, long)]
        queue: Option<String>,
    },

    /// Send one message and wait for it to be delivered
    Send {
        /// Queue manager TOML file
        #[arg(short, long)]
        config: PathBuf,

        /// Destination, e.g. quay://127.0.0.1:2200/orders
        destination: String,

        /// Message body
        #[arg(short, long)]
        data: String,

        /// Header as key=value, repeatable
        #[arg(long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// Seconds to wait for the acknowledgement
        #[arg(long, default_value_t = 30)]
        wait_secs: u64,
    },

    /// Print queue depths and outgoing state of a message store as JSON
    Inspect {
        /// Storage directory
        #[arg(short, long)]
        storage: PathBuf,
    },
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}
