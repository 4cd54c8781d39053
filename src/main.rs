//! usage-reconciler CLI entry point.

use clap::Parser;
use tracing::warn;

use usage_reconciler::cli::{commands, handle_error, Cli, Commands};
use usage_reconciler::infrastructure::config::ConfigLoader;
use usage_reconciler::infrastructure::logging::LoggerImpl;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match ConfigLoader::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            handle_error(&err, cli.json);
            std::process::exit(2);
        }
    };

    let logger = match LoggerImpl::init(&config.logging) {
        Ok(logger) => logger,
        Err(err) => {
            handle_error(&err, cli.json);
            std::process::exit(2);
        }
    };

    for warning in ConfigLoader::warnings(&config) {
        warn!("{warning}");
    }

    let result = match cli.command {
        Commands::Init(args) => commands::init::execute(args, &config, cli.json).await.map(|()| 0),
        Commands::Reconcile(args) => commands::reconcile::execute(args, &config, cli.json).await,
        Commands::Run(args) => commands::run::execute(args, &config, cli.json).await.map(|()| 0),
        Commands::Show(args) => commands::show::execute(args, &config, cli.json).await.map(|()| 0),
        Commands::Reset(args) => commands::reset::execute(args, &config, cli.json).await.map(|()| 0),
    };

    let code = result.unwrap_or_else(|err| {
        handle_error(&err, cli.json);
        2
    });

    // Flush the non-blocking file writer before exiting.
    drop(logger);
    std::process::exit(code);
}
