// Licensed under the Apache-2.0 license

//! Transactional writer for the update partition.

use crate::config::READBACK_CHUNK_SIZE;
use crate::flash::{FlashDrvError, FlashPartition};
use log::{debug, info, warn};
use ota_config::boot::PartitionId;
use ota_image::{ImageError, ImageInfo, ImageVerifier};
use smlang::statemachine;
use thiserror::Error;

statemachine! {
    derive_states: [Debug, Clone, Copy, Eq],
    derive_events: [Clone, Debug],
    transitions: {
        *Closed + Begin / on_begin = Open,
        Open + Append(Vec<u8>) / on_append = Open,
        Open + Flush / on_flush = Flushing,
        Flushing + Validate / on_validate = Committed,
        Open + Abort / on_abort = Aborted,
        Flushing + Abort / on_abort = Aborted,
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    #[error("preparing partition {partition} failed: {error:?}")]
    BeginFailed {
        partition: &'static str,
        error: FlashDrvError,
    },
    #[error("write at offset {offset:#x} failed: {error:?}")]
    WriteFailed { offset: usize, error: FlashDrvError },
    #[error("image does not fit the {capacity} byte partition")]
    OutOfSpace { capacity: usize },
    #[error("reading back the written image failed: {0:?}")]
    ReadbackFailed(FlashDrvError),
    #[error(transparent)]
    ValidationFailed(ImageError),
    #[error("operation not allowed while the session is {0:?}")]
    InvalidState(States),
}

pub struct SessionContext<'a> {
    target: PartitionId,
    partition: FlashPartition<'a>,
    bytes_written: usize,
    error: Option<WriteError>,
    image: Option<ImageInfo>,
}

impl StateMachineContext for SessionContext<'_> {
    fn on_begin(&mut self) -> Result<(), ()> {
        let partition = self.partition;
        partition.erase(0, partition.len()).map_err(|error| {
            self.error = Some(WriteError::BeginFailed {
                partition: partition.name(),
                error,
            });
        })
    }

    fn on_append(&mut self, data: Vec<u8>) -> Result<(), ()> {
        let end = self.bytes_written + data.len();
        if end > self.partition.len() {
            self.error = Some(WriteError::OutOfSpace {
                capacity: self.partition.len(),
            });
            return Err(());
        }
        let offset = self.bytes_written;
        if let Err(error) = self.partition.write(offset, &data) {
            self.error = Some(WriteError::WriteFailed { offset, error });
            return Err(());
        }
        self.bytes_written = end;
        Ok(())
    }

    fn on_flush(&mut self) -> Result<(), ()> {
        if self.bytes_written == 0 {
            self.error = Some(WriteError::ValidationFailed(ImageError::Truncated(0)));
            return Err(());
        }
        Ok(())
    }

    fn on_validate(&mut self) -> Result<(), ()> {
        let mut verifier = ImageVerifier::new();
        let mut buf = [0u8; READBACK_CHUNK_SIZE];
        let mut offset = 0;
        while offset < self.bytes_written {
            let n = (self.bytes_written - offset).min(buf.len());
            if let Err(error) = self.partition.read(offset, &mut buf[..n]) {
                self.error = Some(WriteError::ReadbackFailed(error));
                return Err(());
            }
            if let Err(error) = verifier.update(&buf[..n]) {
                self.error = Some(WriteError::ValidationFailed(error));
                return Err(());
            }
            offset += n;
        }
        match verifier.finish() {
            Ok(info) => {
                self.image = Some(info);
                Ok(())
            }
            Err(error) => {
                self.error = Some(WriteError::ValidationFailed(error));
                Err(())
            }
        }
    }

    fn on_abort(&mut self) -> Result<(), ()> {
        debug!(
            "Discarding {} bytes written to {}",
            self.bytes_written,
            self.partition.name()
        );
        Ok(())
    }
}

/// Proof that an image was completely written and passed validation.
///
/// Only [`WriteSession::commit`] creates one, and activating a partition
/// requires one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedImage {
    partition: PartitionId,
    info: ImageInfo,
}

impl CommittedImage {
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn info(&self) -> &ImageInfo {
        &self.info
    }
}

/// Write session over the update partition: `begin`, any number of
/// `append`s, then `commit` or `abort`.
///
/// A failed `append` or `commit` aborts the session. Dropping an open session
/// aborts it. The running partition is never handed to a session.
pub struct WriteSession<'a> {
    sm: StateMachine<SessionContext<'a>>,
}

impl<'a> WriteSession<'a> {
    /// Erases `partition` and opens a session on it.
    pub fn begin(target: PartitionId, partition: FlashPartition<'a>) -> Result<Self, WriteError> {
        let mut sm = StateMachine::new(SessionContext {
            target,
            partition,
            bytes_written: 0,
            error: None,
            image: None,
        });
        if sm.process_event(Events::Begin).is_err() {
            return Err(Self::failure(&sm));
        }
        info!(
            "Write session opened on {} ({} bytes)",
            partition.name(),
            partition.len()
        );
        Ok(WriteSession { sm })
    }

    pub fn append(&mut self, data: &[u8]) -> Result<(), WriteError> {
        self.expect_state(States::Open)?;
        if self.sm.process_event(Events::Append(data.to_vec())).is_err() {
            let err = Self::failure(&self.sm);
            self.abort();
            return Err(err);
        }
        Ok(())
    }

    /// Finishes writing and validates the image read back from flash.
    pub fn commit(&mut self) -> Result<CommittedImage, WriteError> {
        self.expect_state(States::Open)?;
        if self.sm.process_event(Events::Flush).is_err()
            || self.sm.process_event(Events::Validate).is_err()
        {
            let err = Self::failure(&self.sm);
            self.abort();
            return Err(err);
        }
        let ctx = self.sm.context();
        let info = ctx
            .image
            .clone()
            .ok_or(WriteError::InvalidState(States::Committed))?;
        info!(
            "Write session on {} committed, {} bytes",
            ctx.partition.name(),
            ctx.bytes_written
        );
        Ok(CommittedImage {
            partition: ctx.target,
            info,
        })
    }

    /// Releases an open session. Does nothing once closed, committed or aborted.
    pub fn abort(&mut self) {
        if matches!(self.state(), States::Open | States::Flushing)
            && self.sm.process_event(Events::Abort).is_ok()
        {
            warn!(
                "Write session on {} aborted",
                self.sm.context().partition.name()
            );
        }
    }

    pub fn state(&self) -> States {
        *self.sm.state()
    }

    pub fn bytes_written(&self) -> usize {
        self.sm.context().bytes_written
    }

    fn expect_state(&self, expected: States) -> Result<(), WriteError> {
        let state = self.state();
        if state != expected {
            return Err(WriteError::InvalidState(state));
        }
        Ok(())
    }

    fn failure(sm: &StateMachine<SessionContext<'a>>) -> WriteError {
        sm.context()
            .error
            .clone()
            .unwrap_or(WriteError::InvalidState(*sm.state()))
    }
}

impl Drop for WriteSession<'_> {
    fn drop(&mut self) {
        self.abort();
    }
}
