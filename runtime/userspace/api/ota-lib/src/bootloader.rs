// Licensed under the Apache-2.0 license

//! Boot slot selection performed at every power-on, before the application
//! (and with it the diagnostic gate) starts.

use crate::boot_cfg::FlashBootConfig;
use crate::flash::{FlashPartition, FlashStorage};
use log::{info, warn};
use ota_config::boot::{
    BootConfig, BootConfigError, PartitionId, RollbackState, VERSION_DESCRIPTOR_LEN,
};
use ota_config_emulator::flash::FlashLayout;
use ota_image::{parse_header, MIN_HEADER_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootSelection {
    pub partition: PartitionId,
    pub state: RollbackState,
    /// The boot record pointed elsewhere and was abandoned.
    pub reverted: bool,
}

/// Picks the partition to start and advances its rollback state.
///
/// A freshly activated image moves to `PendingVerify` (or straight to `Valid`
/// when rollback is disabled). An image still pending from the previous boot
/// never passed its diagnostics, so it is marked invalid and the fallback
/// partition starts instead.
pub fn select_boot_partition(
    flash: &dyn FlashStorage,
    layout: &FlashLayout,
) -> Result<BootSelection, BootConfigError> {
    let boot_cfg = FlashBootConfig::new(flash, layout)?;
    let boot = boot_cfg.get_boot_partition()?;
    if layout.app(boot).is_none() {
        return Err(BootConfigError::InvalidPartition);
    }

    match boot_cfg.get_partition_state(boot)? {
        RollbackState::Fresh => {
            let state = if boot_cfg.is_rollback_enabled()? {
                RollbackState::PendingVerify
            } else {
                RollbackState::Valid
            };
            boot_cfg.set_partition_state(boot, state)?;
            info!("First boot of the image in {:?}, now {:?}", boot, state);
            Ok(BootSelection {
                partition: boot,
                state,
                reverted: false,
            })
        }
        RollbackState::PendingVerify => {
            warn!(
                "Image in {:?} was not confirmed during its first boot, rolling back",
                boot
            );
            let version = read_version(flash, layout, boot).unwrap_or([0; VERSION_DESCRIPTOR_LEN]);
            let fallback = boot_cfg.reject_partition(boot, &version)?;
            revert_to(&boot_cfg, fallback)
        }
        RollbackState::Invalid => {
            warn!("Boot record points at invalid image in {:?}", boot);
            let fallback = boot_cfg.get_fallback_partition()?;
            if fallback == PartitionId::None || fallback == boot {
                return Err(BootConfigError::NoFallback);
            }
            revert_to(&boot_cfg, fallback)
        }
        state => Ok(BootSelection {
            partition: boot,
            state,
            reverted: false,
        }),
    }
}

fn revert_to(
    boot_cfg: &FlashBootConfig<'_>,
    fallback: PartitionId,
) -> Result<BootSelection, BootConfigError> {
    let state = boot_cfg.get_partition_state(fallback)?;
    info!("Booting fallback partition {:?} ({:?})", fallback, state);
    Ok(BootSelection {
        partition: fallback,
        state,
        reverted: true,
    })
}

fn read_version(
    flash: &dyn FlashStorage,
    layout: &FlashLayout,
    partition: PartitionId,
) -> Option<[u8; VERSION_DESCRIPTOR_LEN]> {
    let info = layout.app(partition)?;
    let partition = FlashPartition::from_info(flash, info).ok()?;
    let mut header = [0u8; MIN_HEADER_LEN];
    partition.read(0, &mut header).ok()?;
    parse_header(&header).ok().map(|version| *version.as_bytes())
}
