// Licensed under the Apache-2.0 license

use log::info;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// A new image was activated and should boot.
    UpdateActivated,
    /// The running image failed its diagnostics.
    Rollback,
}

pub trait SystemControl: Sync {
    /// Requests a device restart. On hardware this does not return.
    fn restart(&self, reason: RestartReason);

    /// A restart already requested by another task, if the platform lets the
    /// caller keep running after [`SystemControl::restart`].
    fn pending_restart(&self) -> Option<RestartReason> {
        None
    }
}

/// Records restart requests instead of resetting, so a host boot loop can
/// decide what happens next.
#[derive(Debug, Default)]
pub struct RestartLatch {
    requests: Mutex<Vec<RestartReason>>,
}

impl RestartLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<RestartReason> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl SystemControl for RestartLatch {
    fn restart(&self, reason: RestartReason) {
        info!("Restart requested: {:?}", reason);
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(reason);
    }

    fn pending_restart(&self) -> Option<RestartReason> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .first()
            .copied()
    }
}
