//! Command-line interface
//!
//! Argument parsing for the `ledger-forge` binary.

pub mod commands;

pub use commands::{Command, Opt};
