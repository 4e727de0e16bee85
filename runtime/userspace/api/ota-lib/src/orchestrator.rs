// Licensed under the Apache-2.0 license

//! The update task: one attempt at a time, retried until an image is
//! activated or a failure is fatal.

use crate::error::{FailureCategory, OtaError, TransferError};
use crate::fetch::{Chunk, Connection, FetchError, FetchSession, ImageSource, StreamError};
use crate::partition::{PartitionDirectory, PartitionRoles};
use crate::system::{RestartReason, SystemControl};
use crate::timer::Delay;
use crate::version_guard::{VersionDecision, VersionGuard};
use crate::write_session::{WriteError, WriteSession};
use log::{debug, error, info, warn};
use ota_config::boot::{PartitionId, RollbackState};
use ota_config::UpdateConfig;
use ota_image::{parse_header, FirmwareVersion, MIN_HEADER_LEN};
use std::time::Duration;

/// A successfully written and activated image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activation {
    pub partition: PartitionId,
    pub version: FirmwareVersion,
    pub bytes_written: usize,
}

#[derive(Debug)]
pub enum Exit {
    /// A restart was requested. On hardware the task never gets here.
    Restart(RestartReason),
    /// A fatal failure ended the update task.
    Halted(OtaError),
}

#[derive(Debug)]
pub enum Step {
    Retry { delay: Duration, error: OtaError },
    Exit(Exit),
}

pub struct UpdateOrchestrator<'a, S: ImageSource> {
    source: S,
    directory: &'a PartitionDirectory<'a>,
    system: &'a dyn SystemControl,
    delay: &'a dyn Delay,
    config: UpdateConfig,
    guard: VersionGuard,
    attempts: u32,
    activation: Option<Activation>,
}

impl<'a, S: ImageSource> UpdateOrchestrator<'a, S> {
    pub fn new(
        source: S,
        directory: &'a PartitionDirectory<'a>,
        system: &'a dyn SystemControl,
        delay: &'a dyn Delay,
        config: UpdateConfig,
    ) -> Self {
        let guard = VersionGuard::new(config.version_check_enabled);
        UpdateOrchestrator {
            source,
            directory,
            system,
            delay,
            config,
            guard,
            attempts: 0,
            activation: None,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn activation(&self) -> Option<&Activation> {
        self.activation.as_ref()
    }

    /// Runs attempts until a restart is requested or a failure is fatal.
    pub fn run(&mut self) -> Exit {
        loop {
            match self.step() {
                Step::Retry { delay, .. } => {
                    info!("Next update attempt in {:?}", delay);
                    self.delay.delay(delay);
                }
                Step::Exit(exit) => return exit,
            }
        }
    }

    /// Runs a single attempt and decides what follows it.
    pub fn step(&mut self) -> Step {
        if let Some(reason) = self.system.pending_restart() {
            info!("Restart already pending ({:?}), no update attempt", reason);
            return Step::Exit(Exit::Restart(reason));
        }

        self.attempts += 1;
        info!(
            "Starting update attempt {} from {}",
            self.attempts,
            self.source.location()
        );

        match self.run_attempt() {
            Ok(activation) => {
                info!(
                    "Image {} activated in {:?} after {} bytes. Prepare to restart system!",
                    activation.version, activation.partition, activation.bytes_written
                );
                self.activation = Some(activation);
                self.system.restart(RestartReason::UpdateActivated);
                Step::Exit(Exit::Restart(RestartReason::UpdateActivated))
            }
            Err(err) if self.is_fatal(&err) => {
                error!("Update task stopped: {}", err);
                Step::Exit(Exit::Halted(err))
            }
            Err(err) => {
                match err.category() {
                    FailureCategory::UpToDate | FailureCategory::KnownBadVersion => {
                        info!("No update applied: {}", err)
                    }
                    FailureCategory::Validation => error!("Image validation failed: {}", err),
                    _ => warn!("Update attempt failed: {}", err),
                }
                Step::Retry {
                    delay: self.retry_delay(&err),
                    error: err,
                }
            }
        }
    }

    fn is_fatal(&self, err: &OtaError) -> bool {
        let policy = &self.config.failure_policy;
        match err.category() {
            FailureCategory::Connectivity | FailureCategory::Layout => true,
            FailureCategory::UpToDate
            | FailureCategory::KnownBadVersion
            | FailureCategory::AwaitingVerification => false,
            FailureCategory::Fetch => policy.fatal_on_fetch_error,
            FailureCategory::MalformedTransfer => policy.fatal_on_bad_transfer,
            FailureCategory::Write | FailureCategory::Storage => policy.fatal_on_write_error,
            FailureCategory::Validation => policy.fatal_on_validation_error,
            FailureCategory::Activation => policy.fatal_on_activation_error,
        }
    }

    fn retry_delay(&self, err: &OtaError) -> Duration {
        match err.category() {
            FailureCategory::UpToDate | FailureCategory::KnownBadVersion => {
                self.config.policy_retry_delay()
            }
            _ => self.config.retry_delay(),
        }
    }

    fn run_attempt(&mut self) -> Result<Activation, OtaError> {
        let roles = self.directory.resolve()?;
        info!(
            "Running partition {} at offset {:#x}",
            roles.running.name, roles.running.address
        );
        info!(
            "Writing to partition {} at offset {:#x}",
            roles.update_target.name, roles.update_target.address
        );
        // The update target is the fallback of an unconfirmed or rejected image.
        let running_state = self.directory.rollback_state(roles.running.id)?;
        if matches!(
            running_state,
            RollbackState::PendingVerify | RollbackState::Invalid
        ) {
            return Err(OtaError::AwaitingVerification(roles.running.id));
        }

        let mut session = FetchSession::open(&self.source)?;
        let mut buf = vec![0u8; self.config.chunk_size];
        let mut writer: Option<WriteSession<'a>> = None;
        let max_idle_polls = self.config.recv_timeout_ms / self.config.poll_interval_ms.max(1);
        let mut idle_polls = 0;

        loop {
            match session.read(&mut buf) {
                Ok(Chunk::Data(len)) => {
                    idle_polls = 0;
                    let data = &buf[..len];
                    if writer.is_none() {
                        let version = self.check_header(data, &roles)?;
                        debug!("Image {} accepted, opening write session", version);
                        let target = self.directory.open(&roles.update_target).map_err(|error| {
                            WriteError::BeginFailed {
                                partition: roles.update_target.name,
                                error,
                            }
                        })?;
                        writer = Some(WriteSession::begin(roles.update_target.id, target)?);
                    }
                    if let Some(writer) = writer.as_mut() {
                        writer.append(data)?;
                        debug!("Written image length {}", writer.bytes_written());
                    }
                }
                Ok(Chunk::Pending) => {
                    idle_polls += 1;
                    if idle_polls > max_idle_polls {
                        error!(
                            "No data for {:?}, giving up on the transfer",
                            self.config.recv_timeout()
                        );
                        return Err(truncated(&session).into());
                    }
                    self.delay.delay(self.config.poll_interval());
                }
                Ok(Chunk::EndOfStream) => break,
                Err(StreamError::Overrun { declared }) => {
                    return Err(TransferError::Overrun(declared).into())
                }
                // Any failure while body bytes are still owed is a cut transfer.
                Err(err) if !session.is_complete() => {
                    error!("Image data read error: {}", err);
                    return Err(truncated(&session).into());
                }
                Err(err) => return Err(FetchError::Stream(err).into()),
            }
        }

        if !session.is_complete() {
            return Err(truncated(&session).into());
        }
        info!("Connection closed, all data received");
        let Some(mut writer) = writer.take() else {
            return Err(TransferError::Empty.into());
        };
        info!("Total write binary data length : {}", writer.bytes_written());

        let committed = writer.commit()?;
        let activation = Activation {
            partition: committed.partition(),
            version: committed.info().version,
            bytes_written: writer.bytes_written(),
        };
        self.directory.commit_boot(committed)?;
        session.close();
        Ok(activation)
    }

    /// Gate applied to the first chunk before anything is written.
    fn check_header(
        &self,
        first: &[u8],
        roles: &PartitionRoles,
    ) -> Result<FirmwareVersion, OtaError> {
        if first.len() < MIN_HEADER_LEN {
            error!("Received package is not fit len");
            return Err(TransferError::ShortFirstChunk {
                len: first.len(),
                min: MIN_HEADER_LEN,
            }
            .into());
        }
        let new = parse_header(first).map_err(TransferError::Header)?;
        info!("New firmware version: {}", new);

        let running = self.directory.describe(&roles.running);
        if let Some(running) = &running {
            info!("Running firmware version: {}", running);
        }
        if let Some(invalid) = &roles.rejected_version {
            info!("Last invalid firmware version: {}", invalid);
        }

        match self
            .guard
            .decide(&new, running.as_ref(), roles.rejected_version.as_ref())
        {
            VersionDecision::Proceed => Ok(new),
            VersionDecision::RejectKnownBad => {
                warn!("New version is the same as invalid version.");
                warn!(
                    "Previously, there was an attempt to launch the firmware with {} version, but it failed.",
                    new
                );
                warn!("The firmware has been rolled back to the previous version.");
                Err(OtaError::KnownBadVersion(new))
            }
            VersionDecision::SkipUpToDate => {
                warn!("Current running version is the same as a new. We will not continue the update.");
                Err(OtaError::UpToDate(new))
            }
        }
    }
}

fn truncated<C: Connection>(session: &FetchSession<C>) -> TransferError {
    TransferError::Truncated {
        received: session.received(),
        expected: session.declared_len(),
    }
}
