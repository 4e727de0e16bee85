// Licensed under the Apache-2.0 license

//! First-boot verification of a freshly activated image.

use crate::error::OtaError;
use crate::partition::PartitionDirectory;
use crate::system::{RestartReason, SystemControl};
use crate::timer::Delay;
use log::{error, info, warn};
use ota_config::boot::{PartitionId, RollbackState};
use std::time::{Duration, Instant};

/// Self-test run while the image is pending verification.
pub trait Diagnostic: Sync {
    /// Returns true when the device is healthy. `budget` is the time the
    /// gate allows; running past it counts as a failure.
    fn run(&self, budget: Duration) -> bool;
}

/// Diagnostic that lets the system settle for a while and then passes.
///
/// The settle time is capped at half the budget so a passing run always
/// returns before the gate's deadline.
pub struct SettleDiagnostic<'a> {
    delay: &'a dyn Delay,
    settle: Duration,
}

impl<'a> SettleDiagnostic<'a> {
    pub fn new(delay: &'a dyn Delay, settle: Duration) -> Self {
        SettleDiagnostic { delay, settle }
    }
}

impl Diagnostic for SettleDiagnostic<'_> {
    fn run(&self, budget: Duration) -> bool {
        self.delay.delay(self.settle.min(budget / 2));
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// The running image was not pending verification.
    Skipped(RollbackState),
    /// Diagnostics passed and the image is now valid.
    Confirmed,
    /// Diagnostics failed; `fallback` boots after the requested restart.
    RolledBack { fallback: PartitionId },
}

pub struct DiagnosticGate<'a> {
    directory: &'a PartitionDirectory<'a>,
    diagnostic: &'a dyn Diagnostic,
    system: &'a dyn SystemControl,
    timeout: Duration,
}

impl<'a> DiagnosticGate<'a> {
    pub fn new(
        directory: &'a PartitionDirectory<'a>,
        diagnostic: &'a dyn Diagnostic,
        system: &'a dyn SystemControl,
        timeout: Duration,
    ) -> Self {
        DiagnosticGate {
            directory,
            diagnostic,
            system,
            timeout,
        }
    }

    pub fn run(&self) -> Result<GateOutcome, OtaError> {
        self.log_digests();

        let running = self.directory.running();
        let state = self.directory.rollback_state(running)?;
        if state != RollbackState::PendingVerify {
            return Ok(GateOutcome::Skipped(state));
        }

        info!("Diagnostics (can take a while)...");
        let start = Instant::now();
        let passed = self.diagnostic.run(self.timeout);
        let elapsed = start.elapsed();
        let passed = if passed && elapsed > self.timeout {
            warn!(
                "Diagnostics took {:?}, longer than the allowed {:?}",
                elapsed, self.timeout
            );
            false
        } else {
            passed
        };

        if passed {
            info!("Diagnostics completed successfully! Continuing execution ...");
            self.directory.mark_running_valid()?;
            return Ok(GateOutcome::Confirmed);
        }

        error!("Diagnostics failed! Start rollback to the previous version ...");
        let fallback = self.directory.reject_running()?;
        self.system.restart(RestartReason::Rollback);
        Ok(GateOutcome::RolledBack { fallback })
    }

    fn log_digests(&self) {
        match self.directory.boot_data_digest() {
            Ok(digest) => info!("SHA-256 for the partition table: {}", hex::encode(digest)),
            Err(err) => warn!("Unable to hash the partition table: {:?}", err),
        }
        match self.directory.running_digest() {
            Ok(digest) => info!("SHA-256 for current firmware: {}", hex::encode(digest)),
            Err(err) => warn!("Unable to hash the running partition: {:?}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::StdDelay;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorded(Mutex<Vec<Duration>>);

    impl Delay for Recorded {
        fn delay(&self, duration: Duration) {
            self.0.lock().unwrap().push(duration);
        }
    }

    #[test]
    fn settle_is_capped_by_budget() {
        let delay = Recorded::default();
        let diag = SettleDiagnostic::new(&delay, Duration::from_secs(5));
        assert!(diag.run(Duration::from_secs(1)));
        assert!(diag.run(Duration::from_secs(10)));
        assert_eq!(
            *delay.0.lock().unwrap(),
            vec![Duration::from_millis(500), Duration::from_secs(5)]
        );
    }

    #[test]
    fn long_settle_returns_within_budget() {
        let diag = SettleDiagnostic::new(&StdDelay, Duration::from_secs(1));
        let budget = Duration::from_millis(200);
        let start = Instant::now();
        assert!(diag.run(budget));
        assert!(start.elapsed() <= budget);
    }
}
