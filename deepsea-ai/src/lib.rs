pub mod aws;
pub mod cli;
pub mod load_config;

pub use cli::{execute, run, Cli, Commands, RunOutcome};
