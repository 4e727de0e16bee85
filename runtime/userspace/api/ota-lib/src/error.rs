// Licensed under the Apache-2.0 license

use crate::fetch::FetchError;
use crate::link::ConnectivityError;
use crate::write_session::WriteError;
use ota_config::boot::{BootConfigError, PartitionId};
use ota_image::{FirmwareVersion, HeaderError, ImageError};
use thiserror::Error;

/// The byte stream did not carry one complete image.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("first chunk has {len} bytes but the image header needs {min}")]
    ShortFirstChunk { len: usize, min: usize },
    #[error("image header is unreadable: {0}")]
    Header(HeaderError),
    #[error("stream ended after {received} bytes, expected {expected:?}")]
    Truncated {
        received: u64,
        expected: Option<u64>,
    },
    #[error("stream ended before any data arrived")]
    Empty,
    #[error("source sent more than the declared {0} bytes")]
    Overrun(u64),
}

/// Coarse classification used by the failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    Connectivity,
    Fetch,
    MalformedTransfer,
    UpToDate,
    KnownBadVersion,
    Write,
    Validation,
    Activation,
    Storage,
    Layout,
    AwaitingVerification,
}

#[derive(Error, Debug)]
pub enum OtaError {
    #[error("network link unavailable: {0}")]
    Connectivity(#[from] ConnectivityError),
    #[error("image fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("malformed transfer: {0}")]
    MalformedTransfer(#[from] TransferError),
    #[error("image version {0} was rejected on an earlier boot")]
    KnownBadVersion(FirmwareVersion),
    #[error("running image is already version {0}")]
    UpToDate(FirmwareVersion),
    #[error("writing the update partition failed: {0}")]
    Write(WriteError),
    #[error("written image failed validation: {0}")]
    Validation(ImageError),
    #[error("activating the update partition failed: {0:?}")]
    Activation(BootConfigError),
    #[error("boot record access failed: {0:?}")]
    Storage(BootConfigError),
    #[error("inconsistent partition layout: {0}")]
    InconsistentLayout(&'static str),
    #[error("running image in {0:?} is not confirmed")]
    AwaitingVerification(PartitionId),
}

impl From<WriteError> for OtaError {
    fn from(err: WriteError) -> Self {
        match err {
            WriteError::ValidationFailed(err) => OtaError::Validation(err),
            other => OtaError::Write(other),
        }
    }
}

impl OtaError {
    pub fn category(&self) -> FailureCategory {
        match self {
            OtaError::Connectivity(_) => FailureCategory::Connectivity,
            OtaError::Fetch(_) => FailureCategory::Fetch,
            OtaError::MalformedTransfer(_) => FailureCategory::MalformedTransfer,
            OtaError::KnownBadVersion(_) => FailureCategory::KnownBadVersion,
            OtaError::UpToDate(_) => FailureCategory::UpToDate,
            OtaError::Write(_) => FailureCategory::Write,
            OtaError::Validation(_) => FailureCategory::Validation,
            OtaError::Activation(_) => FailureCategory::Activation,
            OtaError::Storage(_) => FailureCategory::Storage,
            OtaError::InconsistentLayout(_) => FailureCategory::Layout,
            OtaError::AwaitingVerification(_) => FailureCategory::AwaitingVerification,
        }
    }
}
