// Licensed under the Apache-2.0 license

//! Generic interface for flash storage access.

/// Simple interface for reading, writing and erasing arbitrary lengths of data on flash storage.
///
/// Writes follow NOR semantics: a write can only clear bits, so a region has to be erased
/// before it is written again. Drivers are shared between the diagnostic gate and the update
/// loop, which may run on different threads.
pub trait FlashStorage: Sync {
    /// Read from the flash storage, filling the provided buffer with data
    fn read(&self, buffer: &mut [u8], address: usize) -> Result<(), FlashDrvError>;

    /// Write to the flash storage with the full contents of the buffer, starting at the specified address
    fn write(&self, buffer: &[u8], address: usize) -> Result<(), FlashDrvError>;

    /// Erase `length` bytes starting at address `address`. Both must be aligned
    /// to the erase sector size.
    fn erase(&self, address: usize, length: usize) -> Result<(), FlashDrvError>;

    /// Returns the size of the flash storage in bytes.
    fn capacity(&self) -> usize;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum FlashDrvError {
    /// Generic failure condition
    FAIL = 1,
    /// Underlying system is busy; retry
    BUSY = 2,
    /// An invalid parameter was passed
    INVAL = 6,
    /// Parameter passed was too large
    SIZE = 7,
    /// Memory required not available
    NOMEM = 9,
    /// Device is not available
    NODEVICE = 11,
}
