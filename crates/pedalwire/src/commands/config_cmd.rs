//! `pedalwire config`: init, show, path.

use pedalwire_config::Config;

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::commands::{config_file, load_config};
use crate::error::CliError;
use crate::output;

pub fn handle(args: &ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let path = config_file(global);

    match args.command {
        // ── Init: write defaults ────────────────────────────────────
        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                return Err(CliError::ConfigExists {
                    path: path.display().to_string(),
                });
            }
            pedalwire_config::save_config_to(&Config::default(), &path)
                .map_err(|e| CliError::from_config(e, &path))?;
            output::print_output(&format!("Wrote {}", path.display()), global.quiet);
            Ok(())
        }

        // ── Show: effective config ──────────────────────────────────
        ConfigCommand::Show => {
            let cfg = load_config(global)?;
            let out = output::render_single(
                global.output,
                &cfg,
                |c| {
                    toml::to_string_pretty(c).map_err(|e| CliError::Render {
                        message: e.to_string(),
                    })
                },
                |_| path.display().to_string(),
            )?;
            output::print_output(&out, global.quiet);
            Ok(())
        }

        // ── Path ────────────────────────────────────────────────────
        ConfigCommand::Path => {
            output::print_output(&path.display().to_string(), global.quiet);
            Ok(())
        }
    }
}
