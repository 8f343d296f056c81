use std::process::ExitCode;

use clap::Parser;
use tweety::cli::{self, Cli};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    tweety::logging::init_logging(cli.log_dir.as_deref());

    match cli::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            eprintln!("tweety-bridge: {err}");
            ExitCode::FAILURE
        }
    }
}
