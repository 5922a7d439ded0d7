//! Utility functions

pub mod cover_art;
pub mod extension;
mod sanitize;

pub use extension::resolve_extension;
pub use sanitize::{sanitize_filename, sanitize_or};
