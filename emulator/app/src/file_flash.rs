/*++

Licensed under the Apache-2.0 license.

File Name:

    file_flash.rs

Abstract:

    File backed NOR flash device used by the OTA emulator.

--*/

use log::error;
use ota_config_emulator::flash::SECTOR_SIZE;
use ota_lib::flash::{FlashDrvError, FlashStorage};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub struct FileFlash {
    file: Mutex<File>,
    capacity: usize,
}

impl FileFlash {
    fn initialize_flash_storage(file: &mut File, size: usize) -> std::io::Result<()> {
        file.seek(SeekFrom::Start(0))?;
        let mut remaining = size;
        let chunk = vec![0xff; 64 * 1024];
        while remaining > 0 {
            let write_size = std::cmp::min(remaining, chunk.len());
            file.write_all(&chunk[..write_size])?;
            remaining -= write_size;
        }
        file.set_len(size as u64)?;
        Ok(())
    }

    /// Opens the backing file, creating an erased device when it is missing
    /// or smaller than `capacity`.
    pub fn open(path: &Path, capacity: usize) -> std::io::Result<Self> {
        let mut file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() < capacity as u64 {
            Self::initialize_flash_storage(&mut file, capacity)?;
        }
        Ok(FileFlash {
            file: Mutex::new(file),
            capacity,
        })
    }

    /// Erases the whole device.
    pub fn format(&self) -> std::io::Result<()> {
        Self::initialize_flash_storage(&mut self.lock(), self.capacity)
    }

    fn lock(&self) -> MutexGuard<'_, File> {
        self.file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_range(&self, address: usize, len: usize) -> Result<(), FlashDrvError> {
        match address.checked_add(len) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(FlashDrvError::SIZE),
        }
    }
}

impl FlashStorage for FileFlash {
    fn read(&self, buffer: &mut [u8], address: usize) -> Result<(), FlashDrvError> {
        self.check_range(address, buffer.len())?;
        let mut file = self.lock();
        file.seek(SeekFrom::Start(address as u64))
            .and_then(|_| file.read_exact(buffer))
            .map_err(|err| {
                error!("Flash read at {:#x} failed: {}", address, err);
                FlashDrvError::FAIL
            })
    }

    fn write(&self, buffer: &[u8], address: usize) -> Result<(), FlashDrvError> {
        self.check_range(address, buffer.len())?;
        let mut file = self.lock();
        let mut current = vec![0u8; buffer.len()];
        file.seek(SeekFrom::Start(address as u64))
            .and_then(|_| file.read_exact(&mut current))
            .map_err(|_| FlashDrvError::FAIL)?;
        // Programming can only clear bits.
        for (cell, byte) in current.iter_mut().zip(buffer) {
            *cell &= *byte;
        }
        file.seek(SeekFrom::Start(address as u64))
            .and_then(|_| file.write_all(&current))
            .map_err(|err| {
                error!("Flash write at {:#x} failed: {}", address, err);
                FlashDrvError::FAIL
            })
    }

    fn erase(&self, address: usize, length: usize) -> Result<(), FlashDrvError> {
        if address % SECTOR_SIZE != 0 || length % SECTOR_SIZE != 0 {
            return Err(FlashDrvError::INVAL);
        }
        self.check_range(address, length)?;
        let mut file = self.lock();
        file.seek(SeekFrom::Start(address as u64))
            .and_then(|_| file.write_all(&vec![0xFF; length]))
            .map_err(|err| {
                error!("Flash erase at {:#x} failed: {}", address, err);
                FlashDrvError::FAIL
            })
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_device_reads_erased() {
        let dir = tempfile::tempdir().unwrap();
        let flash = FileFlash::open(&dir.path().join("flash.bin"), 2 * SECTOR_SIZE).unwrap();
        let mut buf = [0u8; 16];
        flash.read(&mut buf, SECTOR_SIZE).unwrap();
        assert_eq!(buf, [0xFF; 16]);
        assert_eq!(flash.read(&mut buf, 2 * SECTOR_SIZE), Err(FlashDrvError::SIZE));
    }

    #[test]
    fn contents_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flash.bin");
        {
            let flash = FileFlash::open(&path, SECTOR_SIZE).unwrap();
            flash.write(&[0x12, 0x34], 8).unwrap();
        }
        let flash = FileFlash::open(&path, SECTOR_SIZE).unwrap();
        let mut buf = [0u8; 2];
        flash.read(&mut buf, 8).unwrap();
        assert_eq!(buf, [0x12, 0x34]);
    }

    #[test]
    fn write_clears_bits_and_erase_sets_them() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let flash = FileFlash::open(file.path(), SECTOR_SIZE).unwrap();
        flash.write(&[0xF0], 0).unwrap();
        flash.write(&[0x3C], 0).unwrap();
        let mut buf = [0u8; 1];
        flash.read(&mut buf, 0).unwrap();
        assert_eq!(buf, [0x30]);

        assert_eq!(flash.erase(1, SECTOR_SIZE), Err(FlashDrvError::INVAL));
        flash.erase(0, SECTOR_SIZE).unwrap();
        flash.read(&mut buf, 0).unwrap();
        assert_eq!(buf, [0xFF]);
    }
}
