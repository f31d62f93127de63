//! CLI Module
//!
//! Exit codes and result mapping for the `harpcom` binary.

pub mod exit_codes;

pub use exit_codes::{exit_code_description, CliResult, ExitCodes};

use serde::{Deserialize, Serialize};

/// Output format for command results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human readable text
    #[default]
    Text,
    /// JSON, one document per result
    Json,
}
