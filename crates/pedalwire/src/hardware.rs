// ── Radio wiring ──
//
// Builds the adapter set a command runs against: either the simulated
// fleet on loopback radios, or the host radio stacks. Builds without the
// `native-radios` feature get detached backends instead.

use std::sync::Arc;

use tracing::{debug, info};

use pedalwire_config::Config;
use pedalwire_core::{Aggregator, MemoryStore};
use pedalwire_radio::hal::{AntStick, BleCentral};
use pedalwire_radio::loopback::StaticProbe;
use pedalwire_radio::{AntAdapter, BleAdapter, RadioAdapter, SysfsProbe};

use crate::simulate::Simulation;

pub struct Rig {
    pub aggregator: Aggregator,
    simulation: Option<Simulation>,
}

impl Rig {
    pub async fn build(cfg: &Config, simulate: bool) -> Self {
        let simulation = if simulate {
            Some(Simulation::start().await)
        } else {
            None
        };

        let mut adapters: Vec<Arc<dyn RadioAdapter>> = Vec::new();
        if cfg.radio.ble_enabled {
            let adapter = match &simulation {
                Some(sim) => BleAdapter::new(sim.central(), Arc::new(StaticProbe::ready()), cfg.ble_config()),
                None => BleAdapter::new(
                    host_central(),
                    Arc::new(SysfsProbe::default()),
                    cfg.ble_config(),
                ),
            };
            adapters.push(Arc::new(adapter));
        }
        if cfg.radio.ant_enabled {
            let adapter = match &simulation {
                Some(sim) => AntAdapter::new(sim.stick(), cfg.ant_config()),
                None => AntAdapter::new(host_stick(), cfg.ant_config()),
            };
            adapters.push(Arc::new(adapter));
        }
        debug!(adapters = adapters.len(), simulate, "radio adapters built");

        let aggregator = Aggregator::new(
            cfg.aggregator_config(),
            adapters,
            Arc::new(MemoryStore::new()),
        );
        aggregator.start().await;
        Self {
            aggregator,
            simulation,
        }
    }

    /// Stop the aggregator (scan, devices, adapters) and then the
    /// simulated sensors.
    pub async fn shutdown(&self) {
        self.aggregator.shutdown().await;
        if let Some(sim) = &self.simulation {
            sim.shutdown().await;
        }
        info!("radios released");
    }
}

#[cfg(feature = "native-radios")]
fn host_central() -> Arc<dyn BleCentral> {
    Arc::new(pedalwire_radio::host::HostCentral::new())
}

#[cfg(not(feature = "native-radios"))]
fn host_central() -> Arc<dyn BleCentral> {
    debug!("built without native radios, BLE detached");
    Arc::new(pedalwire_radio::detached::DetachedCentral::new())
}

#[cfg(feature = "native-radios")]
fn host_stick() -> Arc<dyn AntStick> {
    Arc::new(pedalwire_radio::host::UsbStick::new())
}

#[cfg(not(feature = "native-radios"))]
fn host_stick() -> Arc<dyn AntStick> {
    debug!("built without native radios, ANT+ detached");
    Arc::new(pedalwire_radio::detached::DetachedStick)
}
