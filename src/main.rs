use tilepipe::cli::commands::{CliArgs, Commands};
use tilepipe::cli::handlers::{handle_reset, handle_run, handle_status};
use tilepipe::util::{init_logging, LoggingConfig};
use tilepipe::VERSION;

use clap::Parser;
use tracing::debug;

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    init_logging(LoggingConfig::resolve(
        args.log_level.as_deref(),
        args.verbose,
        args.quiet,
    ));

    debug!("tilepipe v{} starting", VERSION);
    debug!("Arguments: {:?}", args);

    let config_file = args.config.as_deref();
    let exit_code = match &args.command {
        Commands::Run(run_args) => handle_run(run_args, config_file).await,
        Commands::Status(status_args) => handle_status(status_args, config_file),
        Commands::ResetCheckpoints(reset_args) => handle_reset(reset_args, config_file),
    };

    std::process::exit(exit_code);
}
