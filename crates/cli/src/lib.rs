//! Lumen CLI
//!
//! Command-line interface for managing environments, catalogs, test runs
//! and reviewer decisions.

pub mod commands;
pub mod output;
