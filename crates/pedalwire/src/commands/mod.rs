//! Command handlers, one module per top-level subcommand.

pub mod config_cmd;
pub mod scan;
pub mod serve;

use std::path::PathBuf;

use pedalwire_config::Config;

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// The config file this invocation reads and writes.
pub fn config_file(global: &GlobalOpts) -> PathBuf {
    global
        .config
        .clone()
        .unwrap_or_else(pedalwire_config::config_path)
}

/// Load file + environment configuration, failing on invalid values.
pub fn load_config(global: &GlobalOpts) -> Result<Config, CliError> {
    let path = config_file(global);
    pedalwire_config::load_config_from(&path).map_err(|e| CliError::from_config(e, &path))
}
