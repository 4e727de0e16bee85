// Licensed under the Apache-2.0 license

/// Length in bytes of the version descriptor recorded for a rejected image.
pub const VERSION_DESCRIPTOR_LEN: usize = 32;

/// Trait for accessing and modifying the persistent boot record.
///
/// The boot record decides which application slot runs after the next restart,
/// which slot the device falls back to when a new image is rejected, and the
/// rollback state of every slot. Every mutating method must be applied to
/// persistent storage as a single atomic update: after a power cut the record
/// reads either entirely as before the call or entirely as after it.
pub trait BootConfig {
    /// Returns the partition the boot selector will start next.
    fn get_boot_partition(&self) -> Result<PartitionId, BootConfigError>;

    /// Returns the partition booted when the current boot partition is rejected.
    fn get_fallback_partition(&self) -> Result<PartitionId, BootConfigError>;

    /// Retrieves the rollback state of a specified partition.
    fn get_partition_state(&self, partition: PartitionId)
        -> Result<RollbackState, BootConfigError>;

    /// Updates the rollback state of a specified partition.
    fn set_partition_state(
        &self,
        partition: PartitionId,
        state: RollbackState,
    ) -> Result<(), BootConfigError>;

    /// Publishes `partition` as the next boot partition.
    ///
    /// The partition is marked [`RollbackState::Fresh`] and `fallback` is
    /// recorded as the partition to return to if the new image is rejected.
    ///
    /// # Arguments
    /// * `partition` - A partition holding a completely written and validated image.
    /// * `fallback` - The partition currently running.
    fn activate_partition(
        &self,
        partition: PartitionId,
        fallback: PartitionId,
    ) -> Result<(), BootConfigError>;

    /// Marks `partition` invalid, records the version it carried and, if it is
    /// the boot partition, points the boot record back at the fallback.
    ///
    /// # Returns
    /// * `PartitionId` - The partition that will boot next.
    fn reject_partition(
        &self,
        partition: PartitionId,
        version: &[u8; VERSION_DESCRIPTOR_LEN],
    ) -> Result<PartitionId, BootConfigError>;

    /// Returns the most recently rejected image, if its partition is still
    /// marked invalid.
    fn get_last_invalid(&self) -> Result<Option<InvalidImage>, BootConfigError>;

    /// Checks if rollback functionality is enabled.
    fn is_rollback_enabled(&self) -> Result<bool, BootConfigError>;

    /// Enables or disables rollback functionality.
    fn set_rollback_enable(&self, enable: bool) -> Result<(), BootConfigError>;
}

/// A partition whose image failed verification on its first boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidImage {
    pub partition: PartitionId,
    pub version: [u8; VERSION_DESCRIPTOR_LEN],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionId {
    None = 0x0000_0000,
    A = 0x0000_0001,
    B = 0x0000_0002,
}

impl core::convert::TryFrom<u32> for PartitionId {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x0000_0000 => Ok(PartitionId::None),
            0x0000_0001 => Ok(PartitionId::A),
            0x0000_0002 => Ok(PartitionId::B),
            _ => Err(()),
        }
    }
}

/// Lifecycle of the image held by one application slot.
///
/// `Fresh` is set on activation, the boot selector promotes it to
/// `PendingVerify` on the first boot, and the diagnostic gate resolves that to
/// `Valid` or `Invalid`. `Undefined` is a slot without any record, such as the
/// factory image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackState {
    Undefined = 0x0000,
    Fresh = 0x0001,
    PendingVerify = 0x0002,
    Valid = 0x0003,
    Invalid = 0x0004,
}

impl core::convert::TryFrom<u16> for RollbackState {
    type Error = ();

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0000 => Ok(RollbackState::Undefined),
            0x0001 => Ok(RollbackState::Fresh),
            0x0002 => Ok(RollbackState::PendingVerify),
            0x0003 => Ok(RollbackState::Valid),
            0x0004 => Ok(RollbackState::Invalid),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackEnable {
    Disabled = 0x0000_0000,
    Enabled = 0x0001_0000,
}

// Define BootConfigError for error handling in BootConfig trait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootConfigError {
    InvalidPartition,
    InvalidState,
    NoFallback,
    StorageError,
    ReadFailed,
    WriteFailed,
}
