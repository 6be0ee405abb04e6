use std::io::IsTerminal;
use std::process::ExitCode;

use clap::{CommandFactory, Parser};
use icyconfig::Config;
use icyserver::{init_logging, LoggingOptions};
use icystream::PipelineContext;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod app;
mod cli;

use cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("icycat: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    cli.apply(&mut config);

    init_logging(LoggingOptions {
        verbosity: cli.verbose,
        quiet: config.quiet,
        ansi: std::io::stderr().is_terminal(),
    });

    let Some(source) = cli.source.as_deref() else {
        error!("Missing stream address");
        let _ = Cli::command().print_help();
        return ExitCode::FAILURE;
    };

    let cancel = CancellationToken::new();
    app::spawn_interrupt_handler(cancel.clone());

    match app::run(&config, source, PipelineContext::with_token(cancel)).await {
        Ok(exit) => {
            info!(?exit, "Relay finished");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
