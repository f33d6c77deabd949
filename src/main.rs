//! molprop - Main Entry Point

use std::process::ExitCode;

use clap::Parser;
use molprop::cli::{cmd_info, cmd_predict, cmd_train, report_error, Cli, Commands};

fn main() -> ExitCode {
    // Logs go to stderr so they don't interleave with the step output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "molprop=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Train(args) => cmd_train(args),
        Commands::Predict(args) => cmd_predict(args),
        Commands::Info { data } => cmd_info(data),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_error(&err);
            ExitCode::FAILURE
        }
    }
}
