// Licensed under the Apache-2.0 license

pub mod boot_cfg;
pub mod bootloader;
pub mod config;
pub mod diagnostic;
pub mod error;
pub mod fetch;
pub mod flash;
pub mod link;
pub mod orchestrator;
pub mod partition;
pub mod service;
pub mod system;
pub mod timer;
pub mod version_guard;
pub mod write_session;

pub use error::{FailureCategory, OtaError, TransferError};
pub use orchestrator::{Activation, Exit, Step, UpdateOrchestrator};
pub use service::OtaService;
