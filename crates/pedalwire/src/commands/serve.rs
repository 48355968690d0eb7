//! `pedalwire serve`: radios, aggregator, fanout, and the WebSocket
//! listener, until Ctrl-C.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use pedalwire_config::Config;
use pedalwire_core::Fanout;

use crate::cli::{GlobalOpts, ServeArgs};
use crate::error::CliError;
use crate::hardware::Rig;
use crate::output;
use crate::server;

pub async fn handle(args: ServeArgs, cfg: Config, global: &GlobalOpts) -> Result<(), CliError> {
    let bind = resolve_bind(args.bind.as_deref(), &cfg)?;
    let listener = TcpListener::bind(bind).await.map_err(|source| CliError::Bind {
        addr: bind.to_string(),
        source,
    })?;
    let local = listener.local_addr()?;

    let rig = Rig::build(&cfg, args.simulate).await;
    let fanout = Fanout::new(rig.aggregator.clone(), cfg.server.client_buffer);
    fanout.start().await;

    let cancel = CancellationToken::new();
    let listener_task = tokio::spawn(server::run(listener, fanout.clone(), cancel.clone()));
    info!(addr = %local, simulate = args.simulate, "serving");
    output::note(
        output::should_color(global.color),
        global.quiet,
        "listening",
        &format!("ws://{local}  (Ctrl-C to stop)"),
    );

    let signal = tokio::signal::ctrl_c().await;

    info!("shutting down");
    cancel.cancel();
    let _ = listener_task.await;
    rig.shutdown().await;
    fanout.shutdown().await;

    signal.map_err(CliError::from)
}

fn resolve_bind(flag: Option<&str>, cfg: &Config) -> Result<SocketAddr, CliError> {
    match flag {
        Some(raw) => raw.parse().map_err(|_| CliError::Validation {
            field: "--bind".into(),
            reason: format!("'{raw}' is not a socket address"),
        }),
        None => cfg.bind_addr().map_err(|e| CliError::Other {
            message: e.to_string(),
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn bind_flag_wins_over_config() {
        let cfg = Config::default();
        let addr = resolve_bind(Some("0.0.0.0:9000"), &cfg).unwrap();
        assert_eq!(addr.port(), 9000);
        assert_eq!(resolve_bind(None, &cfg).unwrap().port(), 8787);
    }

    #[test]
    fn bad_bind_flag_is_a_usage_error() {
        let err = resolve_bind(Some("localhost"), &Config::default()).unwrap_err();
        assert_eq!(err.exit_code(), crate::error::exit_code::USAGE);
    }
}
