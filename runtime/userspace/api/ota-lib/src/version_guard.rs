// Licensed under the Apache-2.0 license

use ota_image::FirmwareVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionDecision {
    Proceed,
    SkipUpToDate,
    RejectKnownBad,
}

/// Gate applied to the version of an incoming image before anything is written.
#[derive(Debug, Clone, Copy)]
pub struct VersionGuard {
    version_check_enabled: bool,
}

impl VersionGuard {
    pub fn new(version_check_enabled: bool) -> Self {
        VersionGuard {
            version_check_enabled,
        }
    }

    /// A version that was rolled back is refused even when the up-to-date
    /// check is disabled.
    pub fn decide(
        &self,
        new: &FirmwareVersion,
        running: Option<&FirmwareVersion>,
        last_invalid: Option<&FirmwareVersion>,
    ) -> VersionDecision {
        if last_invalid == Some(new) {
            return VersionDecision::RejectKnownBad;
        }
        if self.version_check_enabled && running == Some(new) {
            return VersionDecision::SkipUpToDate;
        }
        VersionDecision::Proceed
    }
}
