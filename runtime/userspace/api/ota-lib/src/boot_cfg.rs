// Licensed under the Apache-2.0 license

use crate::flash::{FlashPartition, FlashStorage};
use log::debug;
use ota_config::boot::{
    BootConfig, BootConfigError, InvalidImage, PartitionId, RollbackEnable, RollbackState,
    VERSION_DESCRIPTOR_LEN,
};
use ota_config_emulator::flash::{
    FlashLayout, PartitionTable, StandAloneChecksumCalculator, PARTITION_TABLE_COPIES,
    PARTITION_TABLE_LEN, SECTOR_SIZE,
};
use std::sync::Mutex;
use zerocopy::{FromBytes, IntoBytes};

/// [`BootConfig`] kept in the boot data partition of a flash device.
///
/// Each sector of the partition holds one copy of the [`PartitionTable`]. An
/// update rewrites the copy that is not current, so an interrupted write
/// leaves the previous record readable.
pub struct FlashBootConfig<'a> {
    partition: FlashPartition<'a>,
    update: Mutex<()>,
}

impl<'a> FlashBootConfig<'a> {
    pub fn new(flash: &'a dyn FlashStorage, layout: &FlashLayout) -> Result<Self, BootConfigError> {
        let info = layout
            .boot_data()
            .ok_or(BootConfigError::InvalidPartition)?;
        if info.size < SECTOR_SIZE * PARTITION_TABLE_COPIES {
            return Err(BootConfigError::InvalidPartition);
        }
        let partition =
            FlashPartition::from_info(flash, info).map_err(|_| BootConfigError::StorageError)?;
        Ok(FlashBootConfig {
            partition,
            update: Mutex::new(()),
        })
    }

    /// Current boot record. Blank or corrupt storage reads as the factory record.
    pub fn read_table(&self) -> Result<PartitionTable, BootConfigError> {
        self.load().map(|(table, _)| table)
    }

    /// Erases every copy and writes `table` as the only record.
    pub fn format(&self, table: PartitionTable) -> Result<(), BootConfigError> {
        let _guard = self.lock();
        self.partition
            .erase(0, SECTOR_SIZE * PARTITION_TABLE_COPIES)
            .map_err(|_| BootConfigError::WriteFailed)?;
        self.store(table, None)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.update
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load(&self) -> Result<(PartitionTable, Option<usize>), BootConfigError> {
        let calculator = StandAloneChecksumCalculator;
        let mut current: Option<(PartitionTable, usize)> = None;
        for copy in 0..PARTITION_TABLE_COPIES {
            let mut buf = [0u8; PARTITION_TABLE_LEN];
            self.partition
                .read(copy * SECTOR_SIZE, &mut buf)
                .map_err(|_| BootConfigError::ReadFailed)?;
            let Ok(table) = PartitionTable::read_from_bytes(&buf[..]) else {
                continue;
            };
            if !table.verify_checksum(&calculator) {
                debug!("Partition table copy {} is blank or corrupt", copy);
                continue;
            }
            let newer = match &current {
                Some((best, _)) => table.sequence() > best.sequence(),
                None => true,
            };
            if newer {
                current = Some((table, copy));
            }
        }
        Ok(match current {
            Some((table, copy)) => (table, Some(copy)),
            None => (PartitionTable::default(), None),
        })
    }

    fn store(&self, mut table: PartitionTable, current: Option<usize>) -> Result<(), BootConfigError> {
        let copy = current.map_or(0, |c| (c + 1) % PARTITION_TABLE_COPIES);
        table.set_sequence(table.sequence().wrapping_add(1));
        table.populate_checksum(&StandAloneChecksumCalculator);
        self.partition
            .erase(copy * SECTOR_SIZE, SECTOR_SIZE)
            .map_err(|_| BootConfigError::WriteFailed)?;
        self.partition
            .write(copy * SECTOR_SIZE, table.as_bytes())
            .map_err(|_| BootConfigError::WriteFailed)?;
        debug!(
            "Partition table sequence {} written to copy {}",
            table.sequence(),
            copy
        );
        Ok(())
    }

    fn modify<R>(
        &self,
        f: impl FnOnce(&mut PartitionTable) -> Result<R, BootConfigError>,
    ) -> Result<R, BootConfigError> {
        let _guard = self.lock();
        let (mut table, copy) = self.load()?;
        let result = f(&mut table)?;
        self.store(table, copy)?;
        Ok(result)
    }
}

fn require_slot(partition: PartitionId) -> Result<PartitionId, BootConfigError> {
    match partition {
        PartitionId::None => Err(BootConfigError::InvalidPartition),
        slot => Ok(slot),
    }
}

impl BootConfig for FlashBootConfig<'_> {
    fn get_boot_partition(&self) -> Result<PartitionId, BootConfigError> {
        Ok(self.read_table()?.get_boot_partition())
    }

    fn get_fallback_partition(&self) -> Result<PartitionId, BootConfigError> {
        Ok(self.read_table()?.get_fallback_partition())
    }

    fn get_partition_state(
        &self,
        partition: PartitionId,
    ) -> Result<RollbackState, BootConfigError> {
        let partition = require_slot(partition)?;
        Ok(self.read_table()?.get_partition_state(partition))
    }

    fn set_partition_state(
        &self,
        partition: PartitionId,
        state: RollbackState,
    ) -> Result<(), BootConfigError> {
        let partition = require_slot(partition)?;
        self.modify(|table| {
            table.set_partition_state(partition, state);
            Ok(())
        })
    }

    fn activate_partition(
        &self,
        partition: PartitionId,
        fallback: PartitionId,
    ) -> Result<(), BootConfigError> {
        let partition = require_slot(partition)?;
        if partition == fallback {
            return Err(BootConfigError::InvalidPartition);
        }
        self.modify(|table| {
            table.set_partition_state(partition, RollbackState::Fresh);
            table.set_fallback_partition(fallback);
            table.set_boot_partition(partition);
            Ok(())
        })
    }

    fn reject_partition(
        &self,
        partition: PartitionId,
        version: &[u8; VERSION_DESCRIPTOR_LEN],
    ) -> Result<PartitionId, BootConfigError> {
        let partition = require_slot(partition)?;
        self.modify(|table| {
            if table.get_boot_partition() == partition {
                let fallback = table.get_fallback_partition();
                if fallback == PartitionId::None || fallback == partition {
                    return Err(BootConfigError::NoFallback);
                }
                table.set_boot_partition(fallback);
            }
            table.set_partition_state(partition, RollbackState::Invalid);
            table.set_invalid_image(partition, version);
            Ok(table.get_boot_partition())
        })
    }

    fn get_last_invalid(&self) -> Result<Option<InvalidImage>, BootConfigError> {
        Ok(self.read_table()?.get_invalid_image())
    }

    fn is_rollback_enabled(&self) -> Result<bool, BootConfigError> {
        Ok(self.read_table()?.is_rollback_enabled())
    }

    fn set_rollback_enable(&self, enable: bool) -> Result<(), BootConfigError> {
        let enable = if enable {
            RollbackEnable::Enabled
        } else {
            RollbackEnable::Disabled
        };
        self.modify(|table| {
            table.set_rollback_enable(enable);
            Ok(())
        })
    }
}
