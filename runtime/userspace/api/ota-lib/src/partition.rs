// Licensed under the Apache-2.0 license

use crate::boot_cfg::FlashBootConfig;
use crate::error::OtaError;
use crate::flash::{FlashDrvError, FlashPartition, FlashStorage};
use crate::write_session::CommittedImage;
use log::{info, warn};
use ota_config::boot::{BootConfig, PartitionId, RollbackState, VERSION_DESCRIPTOR_LEN};
use ota_config_emulator::flash::{FlashLayout, PartitionInfo, PartitionKind};
use ota_image::{parse_header, FirmwareVersion, MIN_HEADER_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionRole {
    Running,
    Boot,
    UpdateTarget,
    LastInvalid,
}

/// A flash region seen through the role it plays in the current attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub role: PartitionRole,
    pub id: PartitionId,
    pub name: &'static str,
    pub address: usize,
    pub size: usize,
    pub kind: PartitionKind,
}

impl Partition {
    fn new(role: PartitionRole, info: &PartitionInfo) -> Self {
        Partition {
            role,
            id: info.id,
            name: info.name,
            address: info.offset,
            size: info.size,
            kind: info.kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRoles {
    pub running: Partition,
    pub boot: Partition,
    pub update_target: Partition,
    pub last_invalid: Option<Partition>,
    /// Version recorded when `last_invalid` was rejected.
    pub rejected_version: Option<FirmwareVersion>,
}

impl PartitionRoles {
    pub fn get(&self, role: PartitionRole) -> Option<&Partition> {
        match role {
            PartitionRole::Running => Some(&self.running),
            PartitionRole::Boot => Some(&self.boot),
            PartitionRole::UpdateTarget => Some(&self.update_target),
            PartitionRole::LastInvalid => self.last_invalid.as_ref(),
        }
    }
}

/// Maps roles to flash regions and owns every change to the boot record made
/// while the application runs.
pub struct PartitionDirectory<'a> {
    flash: &'a dyn FlashStorage,
    layout: &'a FlashLayout,
    boot_cfg: FlashBootConfig<'a>,
    running: PartitionId,
}

impl<'a> PartitionDirectory<'a> {
    pub fn new(
        flash: &'a dyn FlashStorage,
        layout: &'a FlashLayout,
        running: PartitionId,
    ) -> Result<Self, OtaError> {
        if layout.app(running).is_none() {
            return Err(OtaError::InconsistentLayout(
                "running partition is not an application slot",
            ));
        }
        let boot_cfg = FlashBootConfig::new(flash, layout)
            .map_err(|_| OtaError::InconsistentLayout("no usable boot data partition"))?;
        Ok(PartitionDirectory {
            flash,
            layout,
            boot_cfg,
            running,
        })
    }

    pub fn running(&self) -> PartitionId {
        self.running
    }

    /// Resolves every role from the layout and the persisted boot record.
    pub fn resolve(&self) -> Result<PartitionRoles, OtaError> {
        let running_info = self.layout.app(self.running).ok_or(OtaError::InconsistentLayout(
            "running partition is not an application slot",
        ))?;
        let running = Partition::new(PartitionRole::Running, running_info);

        let boot_id = self.boot_cfg.get_boot_partition().map_err(OtaError::Storage)?;
        let boot_info = self.layout.app(boot_id).ok_or(OtaError::InconsistentLayout(
            "boot record names no application slot",
        ))?;
        let boot = Partition::new(PartitionRole::Boot, boot_info);
        if boot.id != running.id {
            warn!(
                "Configured boot partition {} at {:#x}, but running from {} at {:#x}",
                boot.name, boot.address, running.name, running.address
            );
            warn!("(This can happen if either the boot data or the preferred boot image become corrupted somehow.)");
        }

        let boot_data = self.layout.boot_data();
        let update_target = self
            .layout
            .apps()
            .find(|p| {
                p.id != PartitionId::None
                    && p.id != running_info.id
                    && p.size > 0
                    && !p.overlaps(running_info)
                    && boot_data.map_or(true, |data| !data.overlaps(p))
            })
            .map(|info| Partition::new(PartitionRole::UpdateTarget, info))
            .ok_or(OtaError::InconsistentLayout(
                "no update partition distinct from the running one",
            ))?;

        let invalid = self.boot_cfg.get_last_invalid().map_err(OtaError::Storage)?;
        let last_invalid = invalid
            .and_then(|image| self.layout.app(image.partition))
            .map(|info| Partition::new(PartitionRole::LastInvalid, info));
        let rejected_version = invalid
            .filter(|_| last_invalid.is_some())
            .map(|image| FirmwareVersion::from_bytes(image.version));

        Ok(PartitionRoles {
            running,
            boot,
            update_target,
            last_invalid,
            rejected_version,
        })
    }

    /// Version of the image held by `partition`, if it holds one.
    pub fn describe(&self, partition: &Partition) -> Option<FirmwareVersion> {
        let mut header = [0u8; MIN_HEADER_LEN];
        self.open(partition).ok()?.read(0, &mut header).ok()?;
        parse_header(&header).ok()
    }

    pub fn open(&self, partition: &Partition) -> Result<FlashPartition<'a>, FlashDrvError> {
        FlashPartition::new(self.flash, partition.name, partition.address, partition.size)
    }

    /// Makes a committed image the next boot partition, with the running
    /// partition as its fallback. The caller restarts the device afterwards.
    pub fn commit_boot(&self, image: CommittedImage) -> Result<(), OtaError> {
        if image.partition() == self.running {
            return Err(OtaError::InconsistentLayout(
                "refusing to activate the running partition",
            ));
        }
        self.boot_cfg
            .activate_partition(image.partition(), self.running)
            .map_err(OtaError::Activation)?;
        info!(
            "Next boot partition is {:?} with version {}",
            image.partition(),
            image.info().version
        );
        Ok(())
    }

    pub fn rollback_state(&self, partition: PartitionId) -> Result<RollbackState, OtaError> {
        self.boot_cfg
            .get_partition_state(partition)
            .map_err(OtaError::Storage)
    }

    /// Confirms the running image; later boots skip the diagnostics.
    pub fn mark_running_valid(&self) -> Result<(), OtaError> {
        self.boot_cfg
            .set_partition_state(self.running, RollbackState::Valid)
            .map_err(OtaError::Storage)
    }

    /// Marks the running image invalid and points the boot record at the
    /// fallback. Returns the partition that boots next.
    pub fn reject_running(&self) -> Result<PartitionId, OtaError> {
        let running = self
            .layout
            .app(self.running)
            .map(|info| Partition::new(PartitionRole::Running, info))
            .ok_or(OtaError::InconsistentLayout(
                "running partition is not an application slot",
            ))?;
        let version = self
            .describe(&running)
            .map(|v| *v.as_bytes())
            .unwrap_or([0; VERSION_DESCRIPTOR_LEN]);
        self.boot_cfg
            .reject_partition(self.running, &version)
            .map_err(OtaError::Storage)
    }

    /// SHA-256 of the boot data partition.
    pub fn boot_data_digest(&self) -> Result<[u8; 32], FlashDrvError> {
        let info = self.layout.boot_data().ok_or(FlashDrvError::NODEVICE)?;
        FlashPartition::from_info(self.flash, info)?.sha256(info.size)
    }

    /// SHA-256 of the whole running partition.
    pub fn running_digest(&self) -> Result<[u8; 32], FlashDrvError> {
        let info = self.layout.app(self.running).ok_or(FlashDrvError::NODEVICE)?;
        FlashPartition::from_info(self.flash, info)?.sha256(info.size)
    }
}
