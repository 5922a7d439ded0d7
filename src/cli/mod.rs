//! CLI module for tuneworker

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

pub mod commands;
mod transport;

#[derive(Parser, Debug)]
#[command(name = "tuneworker", about = "Background task workers for a music player")]
#[command(version, author)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Worker config file (defaults to ~/.config/tuneworker/config.json)
    #[arg(long, global = true, env = "TUNEWORKER_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a worker over JSON lines: requests on stdin, events on stdout
    Serve {
        /// Which worker to run
        #[arg(value_enum)]
        worker: WorkerKind,
    },

    /// Scan audio files and print one track record per line
    Scan {
        /// Files or directories (walked recursively)
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Number of files scanned in parallel
        #[arg(short, long, default_value = "4")]
        parallel: usize,
    },

    /// Work with sandboxed plugins
    Plugin {
        #[command(subcommand)]
        command: PluginCommands,
    },

    /// Show the effective worker config
    Config {
        /// Write the defaults to the config file if none exists
        #[arg(long)]
        init: bool,
    },

    /// Generate shell completions
    Completion {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum PluginCommands {
    /// Load a plugin module and call one of its methods
    Run {
        /// Plugin module (.wat or .wasm)
        module: PathBuf,

        /// Exported method to call
        method: String,

        /// Arguments as JSON
        args: Option<String>,

        /// Key-value store file (defaults to ~/.config/tuneworker/plugin-store.json)
        #[arg(long)]
        store: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Cache,
    Download,
    Cover,
    Plugin,
}
