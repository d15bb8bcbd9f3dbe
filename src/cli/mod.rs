//! Command-line interface for cloudjob.
//!
//! Runs an external program as a cloud job and inspects instance metadata.

mod commands;
mod work;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
pub use work::CommandWork;
