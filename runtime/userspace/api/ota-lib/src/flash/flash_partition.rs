// Licensed under the Apache-2.0 license

use crate::config::DIGEST_CHUNK_SIZE;
use crate::flash::hil::{FlashDrvError, FlashStorage};
use ota_config_emulator::PartitionInfo;
use sha2::{Digest, Sha256};

/// Represents a partition within the flash memory.
///
/// A `FlashPartition` provides a view into a contiguous region of the underlying
/// flash, allowing for read, write, and erase operations within the
/// specified bounds. All offsets are relative to the start of the partition.
///
/// # Fields
/// - `driver`: Reference to the flash storage driver.
/// - `name`: Name of the partition (for debugging or identification).
/// - `base_offset`: The starting offset of the partition within the flash.
/// - `length`: The size of the partition in bytes.
#[derive(Clone, Copy)]
pub struct FlashPartition<'a> {
    driver: &'a dyn FlashStorage,
    name: &'static str,
    base_offset: usize,
    length: usize,
}

impl<'a> FlashPartition<'a> {
    /// Creates a new `FlashPartition` instance.
    ///
    /// Returns `Err(FlashDrvError::SIZE)` if the partition exceeds the flash capacity.
    pub fn new(
        driver: &'a dyn FlashStorage,
        name: &'static str,
        base_offset: usize,
        length: usize,
    ) -> Result<Self, FlashDrvError> {
        if base_offset + length > driver.capacity() {
            return Err(FlashDrvError::SIZE);
        }
        Ok(FlashPartition {
            driver,
            name,
            base_offset,
            length,
        })
    }

    pub fn from_info(
        driver: &'a dyn FlashStorage,
        info: &PartitionInfo,
    ) -> Result<Self, FlashDrvError> {
        Self::new(driver, info.name, info.offset, info.size)
    }

    /// Reads data from the flash partition into the provided buffer, starting at the specified offset.
    ///
    /// Returns `Err(FlashDrvError::SIZE)` if the requested range exceeds the partition size.
    pub fn read(&self, partition_offset: usize, buf: &mut [u8]) -> Result<(), FlashDrvError> {
        self.check_range(partition_offset, buf.len())?;
        self.driver.read(buf, self.base_offset + partition_offset)
    }

    /// Writes data to the flash partition, starting at the specified offset.
    ///
    /// Returns `Err(FlashDrvError::SIZE)` if the write would exceed the partition size.
    pub fn write(&self, partition_offset: usize, buf: &[u8]) -> Result<(), FlashDrvError> {
        self.check_range(partition_offset, buf.len())?;
        self.driver.write(buf, self.base_offset + partition_offset)
    }

    /// Erases a region of the flash partition, starting at the specified offset.
    ///
    /// Returns `Err(FlashDrvError::SIZE)` if the erase range exceeds the partition size.
    pub fn erase(&self, partition_offset: usize, len: usize) -> Result<(), FlashDrvError> {
        self.check_range(partition_offset, len)?;
        self.driver.erase(self.base_offset + partition_offset, len)
    }

    /// SHA-256 over the first `len` bytes of the partition.
    pub fn sha256(&self, len: usize) -> Result<[u8; 32], FlashDrvError> {
        self.check_range(0, len)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; DIGEST_CHUNK_SIZE];
        let mut offset = 0;
        while offset < len {
            let n = (len - offset).min(buf.len());
            self.read(offset, &mut buf[..n])?;
            hasher.update(&buf[..n]);
            offset += n;
        }
        Ok(hasher.finalize().into())
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<(), FlashDrvError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.length => Ok(()),
            _ => Err(FlashDrvError::SIZE),
        }
    }
}
