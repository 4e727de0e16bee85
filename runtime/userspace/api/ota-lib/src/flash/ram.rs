// Licensed under the Apache-2.0 license

//! RAM backed flash device with NOR write semantics and fault injection.

use crate::flash::hil::{FlashDrvError, FlashStorage};
use core::ops::Range;
use ota_config_emulator::flash::SECTOR_SIZE;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Faults {
    write: Vec<Range<usize>>,
    erase: Vec<Range<usize>>,
}

pub struct RamFlash {
    memory: Mutex<Vec<u8>>,
    faults: Mutex<Faults>,
}

impl RamFlash {
    /// Creates an erased device of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        RamFlash {
            memory: Mutex::new(vec![0xFF; capacity]),
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Fails every write touching `range`.
    pub fn fail_writes_in(&self, range: Range<usize>) {
        lock(&self.faults).write.push(range);
    }

    /// Fails every erase touching `range`.
    pub fn fail_erases_in(&self, range: Range<usize>) {
        lock(&self.faults).erase.push(range);
    }

    pub fn clear_faults(&self) {
        let mut faults = lock(&self.faults);
        faults.write.clear();
        faults.erase.clear();
    }

    /// Copy of the device contents.
    pub fn snapshot(&self) -> Vec<u8> {
        lock(&self.memory).clone()
    }

    /// Overwrites `data` at `address`, bypassing erase rules.
    pub fn poke(&self, address: usize, data: &[u8]) {
        lock(&self.memory)[address..address + data.len()].copy_from_slice(data);
    }

    fn injected(ranges: &[Range<usize>], address: usize, len: usize) -> bool {
        ranges
            .iter()
            .any(|r| address < r.end && r.start < address + len)
    }
}

impl FlashStorage for RamFlash {
    fn read(&self, buffer: &mut [u8], address: usize) -> Result<(), FlashDrvError> {
        let memory = lock(&self.memory);
        let src = memory
            .get(address..address + buffer.len())
            .ok_or(FlashDrvError::SIZE)?;
        buffer.copy_from_slice(src);
        Ok(())
    }

    fn write(&self, buffer: &[u8], address: usize) -> Result<(), FlashDrvError> {
        if Self::injected(&lock(&self.faults).write, address, buffer.len()) {
            return Err(FlashDrvError::FAIL);
        }
        let mut memory = lock(&self.memory);
        let dst = memory
            .get_mut(address..address + buffer.len())
            .ok_or(FlashDrvError::SIZE)?;
        for (d, s) in dst.iter_mut().zip(buffer) {
            *d &= *s;
        }
        Ok(())
    }

    fn erase(&self, address: usize, length: usize) -> Result<(), FlashDrvError> {
        if address % SECTOR_SIZE != 0 || length % SECTOR_SIZE != 0 {
            return Err(FlashDrvError::INVAL);
        }
        if Self::injected(&lock(&self.faults).erase, address, length) {
            return Err(FlashDrvError::FAIL);
        }
        let mut memory = lock(&self.memory);
        memory
            .get_mut(address..address + length)
            .ok_or(FlashDrvError::SIZE)?
            .fill(0xFF);
        Ok(())
    }

    fn capacity(&self) -> usize {
        lock(&self.memory).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
