//! ssh-audit-proxy - intercepting SSH proxy with audit events

use clap::Parser;

use ssh_audit_proxy::cli::{Cli, Commands, ExitCode, commands};
use ssh_audit_proxy::logging;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => commands::run::execute(args, cli.config, cli.verbose, cli.quiet).await,
        Commands::Config(args) => {
            let _guard = logging::init(cli.verbose, cli.quiet);
            commands::config::execute(args, cli.config).await
        }
        Commands::Version => commands::version::execute(cli.verbose).await,
    };

    match result {
        Ok(()) => ExitCode::Success.into(),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from_error(&e).into()
        }
    }
}
