//! tuneworker - Background task workers for a desktop music player
//!
//! Every worker is an instance of one pattern: a FIFO queue drained by a
//! single consumer, reporting back to its owner over a message channel.
//! See [`queue`] for the shared core.

pub mod cli;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod media;
pub mod plugin;
pub mod queue;
pub mod scanner;
pub mod track;
pub mod utils;
pub mod workers;

pub use config::WorkerConfig;
pub use error::{Result, WorkerError};
