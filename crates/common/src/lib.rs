//! Lumen Common Library
//!
//! Shared types, errors and SQLite persistence for the Lumen accessibility runner.

pub mod db;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use db::{Database, TargetReview};
pub use error::{Error, FieldError, Result, Validator};
pub use types::*;

/// Lumen version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".lumen")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("state.db")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
