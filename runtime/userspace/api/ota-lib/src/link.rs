// Licensed under the Apache-2.0 license

use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityError {
    #[error("link failed: {0}")]
    LinkFailed(String),
    #[error("no link after {0:?}")]
    Timeout(Duration),
    #[error("link provider went away")]
    ProviderGone,
}

/// Network availability as seen by the update engine.
pub trait NetworkLink: Sync {
    /// Blocks until the link is up or has failed for good.
    fn wait_connected(&self, timeout: Duration) -> Result<(), ConnectivityError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Failed(String),
}

/// Handle given to the link provider to report the outcome of bring-up.
#[derive(Clone)]
pub struct LinkNotifier {
    events: Sender<LinkEvent>,
}

impl LinkNotifier {
    pub fn connected(&self) {
        let _ = self.events.send(LinkEvent::Connected);
    }

    pub fn failed(&self, reason: &str) {
        let _ = self.events.send(LinkEvent::Failed(reason.to_string()));
    }
}

/// A [`NetworkLink`] resolved through a channel by the link provider.
pub struct ChannelLink {
    events: Mutex<Receiver<LinkEvent>>,
    connected: AtomicBool,
}

pub fn channel_link() -> (LinkNotifier, ChannelLink) {
    let (tx, rx) = mpsc::channel();
    (
        LinkNotifier { events: tx },
        ChannelLink {
            events: Mutex::new(rx),
            connected: AtomicBool::new(false),
        },
    )
}

impl NetworkLink for ChannelLink {
    fn wait_connected(&self, timeout: Duration) -> Result<(), ConnectivityError> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let events = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match events.recv_timeout(timeout) {
            Ok(LinkEvent::Connected) => {
                info!("Network link is up");
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
            Ok(LinkEvent::Failed(reason)) => {
                warn!("Network link failed: {}", reason);
                Err(ConnectivityError::LinkFailed(reason))
            }
            Err(RecvTimeoutError::Timeout) => Err(ConnectivityError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(ConnectivityError::ProviderGone),
        }
    }
}

/// Link for hosts whose network is managed elsewhere.
pub struct AlwaysConnected;

impl NetworkLink for AlwaysConnected {
    fn wait_connected(&self, _timeout: Duration) -> Result<(), ConnectivityError> {
        Ok(())
    }
}
