mod cli;
mod commands;
mod error;
mod hardware;
mod output;
mod server;
mod simulate;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command, GlobalOpts, LogFormat};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Setup tracing based on verbosity and the configured line format
    init_tracing(cli.global.verbose, log_format(&cli.global));

    // Dispatch and handle errors with proper exit codes
    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

/// `--log-format` wins; otherwise `[log] format` from the config file.
fn log_format(global: &GlobalOpts) -> LogFormat {
    if let Some(format) = global.log_format {
        return format;
    }
    match commands::load_config(global) {
        Ok(cfg) if cfg.log.format == "json" => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

fn init_tracing(verbosity: u8, format: LogFormat) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        // Config commands never touch a radio
        Command::Config(args) => commands::config_cmd::handle(&args, &cli.global),

        // Shell completions generation
        Command::Completions(args) => {
            use clap::CommandFactory;
            use clap_complete::generate;

            let mut cmd = Cli::command();
            generate(args.shell, &mut cmd, "pedalwire", &mut std::io::stdout());
            Ok(())
        }

        Command::Serve(args) => {
            let cfg = commands::load_config(&cli.global)?;
            tracing::debug!(?args, "dispatching serve");
            commands::serve::handle(args, cfg, &cli.global).await
        }

        Command::Scan(args) => {
            let cfg = commands::load_config(&cli.global)?;
            tracing::debug!(?args, "dispatching scan");
            commands::scan::handle(args, cfg, &cli.global).await
        }
    }
}
