pub mod commands;
pub mod handlers;
pub mod output;

pub use commands::{CliArgs, Commands, ResetArgs, RunArgs, StatusArgs};
pub use output::{OutputFormat, StatusReport};
