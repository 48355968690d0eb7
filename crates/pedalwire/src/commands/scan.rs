//! `pedalwire scan`: one discovery window, then a device listing.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use pedalwire_config::Config;
use pedalwire_core::{Device, DeviceId, ScanReport};

use crate::cli::{GlobalOpts, OutputFormat, ScanArgs};
use crate::error::CliError;
use crate::hardware::Rig;
use crate::output;

pub async fn handle(args: ScanArgs, cfg: Config, global: &GlobalOpts) -> Result<(), CliError> {
    let rig = Rig::build(&cfg, args.simulate).await;
    let result = discover(&rig, &args, global).await;
    rig.shutdown().await;
    let devices = result?;

    let out = output::render_list(global.output, &devices, output::device_row, |d| {
        d.id.to_string()
    })?;
    output::print_output(&out, global.quiet);
    Ok(())
}

async fn discover(rig: &Rig, args: &ScanArgs, global: &GlobalOpts) -> Result<Vec<Device>, CliError> {
    let color = output::should_color(global.color);
    // Progress lines only make sense next to a human-readable table.
    let chatty = global.output == OutputFormat::Table && !global.quiet;

    let report = rig.aggregator.start_scanning().await?;
    report_transports(&report, color, chatty);

    let mut discovered = rig.aggregator.discovered();
    let mut seen = HashSet::new();
    announce(discovered.current(), &mut seen, color, chatty);
    let deadline = tokio::time::sleep(Duration::from_secs(args.seconds));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = &mut deadline => break,
            changed = discovered.changed() => {
                let Some(snapshot) = changed else { break };
                announce(&snapshot, &mut seen, color, chatty);
            }
        }
    }

    rig.aggregator.stop_scanning().await;
    let mut devices: Vec<Device> = rig
        .aggregator
        .discovered_snapshot()
        .iter()
        .map(|d| (**d).clone())
        .collect();
    devices.sort_by(|a, b| {
        b.relevance_score
            .cmp(&a.relevance_score)
            .then_with(|| a.name.cmp(&b.name))
    });
    debug!(count = devices.len(), "scan finished");
    Ok(devices)
}

/// Print a line for every device not announced yet.
fn announce(snapshot: &[Arc<Device>], seen: &mut HashSet<DeviceId>, color: bool, chatty: bool) {
    for device in snapshot.iter().filter(|d| seen.insert(d.id.clone())) {
        output::note(
            color,
            !chatty,
            "found",
            &format!("{} ({}, {})", device.name, device.kind, device.transport.label()),
        );
    }
}

fn report_transports(report: &ScanReport, color: bool, chatty: bool) {
    for t in &report.transports {
        let message = match (t.available, t.reason) {
            (Some(true), _) => format!("{} scanning", t.transport.label()),
            (_, Some(reason)) => format!("{} unavailable: {reason}", t.transport.label()),
            _ => format!("{} unavailable", t.transport.label()),
        };
        output::note(color, !chatty, "radio", &message);
    }
}
