// Licensed under the Apache-2.0 license

use crate::diagnostic::{Diagnostic, DiagnosticGate, GateOutcome};
use crate::fetch::ImageSource;
use crate::link::NetworkLink;
use crate::orchestrator::{Exit, UpdateOrchestrator};
use crate::partition::PartitionDirectory;
use crate::system::{RestartReason, SystemControl};
use crate::timer::Delay;
use log::{error, info};
use ota_config::{DiagnosticOrdering, UpdateConfig};
use std::thread;

/// Application side of the update engine: the diagnostic gate followed by
/// (or alongside) the update task.
pub struct OtaService<'a, S: ImageSource> {
    directory: &'a PartitionDirectory<'a>,
    link: &'a dyn NetworkLink,
    diagnostic: &'a dyn Diagnostic,
    system: &'a dyn SystemControl,
    delay: &'a dyn Delay,
    source: S,
    config: UpdateConfig,
}

impl<'a, S: ImageSource> OtaService<'a, S> {
    pub fn new(
        directory: &'a PartitionDirectory<'a>,
        link: &'a dyn NetworkLink,
        diagnostic: &'a dyn Diagnostic,
        system: &'a dyn SystemControl,
        delay: &'a dyn Delay,
        source: S,
        config: UpdateConfig,
    ) -> Self {
        OtaService {
            directory,
            link,
            diagnostic,
            system,
            delay,
            source,
            config,
        }
    }

    pub fn run(self) -> Exit {
        let gate = DiagnosticGate::new(
            self.directory,
            self.diagnostic,
            self.system,
            self.config.diagnostic_timeout(),
        );
        match self.config.diagnostic_ordering {
            DiagnosticOrdering::BeforeUpdates => match gate.run() {
                Ok(GateOutcome::RolledBack { .. }) => Exit::Restart(RestartReason::Rollback),
                Ok(outcome) => {
                    info!("Diagnostic gate: {:?}", outcome);
                    self.start_updates()
                }
                Err(err) => {
                    error!("Diagnostic gate failed: {}", err);
                    Exit::Halted(err)
                }
            },
            DiagnosticOrdering::Concurrent => thread::scope(|scope| {
                let diagnostics = scope.spawn(|| gate.run());
                let exit = self.start_updates();
                match diagnostics.join() {
                    Ok(Ok(outcome)) => info!("Diagnostic gate: {:?}", outcome),
                    Ok(Err(err)) => error!("Diagnostic gate failed: {}", err),
                    Err(_) => error!("Diagnostic task panicked"),
                }
                exit
            }),
        }
    }

    fn start_updates(self) -> Exit {
        info!("Waiting for the network link");
        if let Err(err) = self.link.wait_connected(self.config.link_timeout()) {
            error!("Network link unavailable: {}", err);
            return Exit::Halted(err.into());
        }
        let mut orchestrator = UpdateOrchestrator::new(
            self.source,
            self.directory,
            self.system,
            self.delay,
            self.config,
        );
        orchestrator.run()
    }
}
