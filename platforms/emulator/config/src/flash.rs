// Licensed under the Apache-2.0 license
use core::mem::{offset_of, size_of};
use ota_config::boot::{
    InvalidImage, PartitionId, RollbackEnable, RollbackState, VERSION_DESCRIPTOR_LEN,
};
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const SECTOR_SIZE: usize = 4 * 1024; // Erase granularity of the flash device

pub const PARTITION_TABLE_COPIES: usize = 2; // One sector per copy

pub const BOOT_DATA_PARTITION: PartitionInfo = PartitionInfo {
    name: "otadata",
    id: PartitionId::None,
    kind: PartitionKind::BootData,
    offset: 0x0000_0000,
    size: SECTOR_SIZE * PARTITION_TABLE_COPIES,
};

pub const IMAGE_A_PARTITION: PartitionInfo = PartitionInfo {
    name: "ota_0",
    id: PartitionId::A,
    kind: PartitionKind::App,
    offset: 0x0001_0000,
    size: 0x0010_0000,
};

pub const IMAGE_B_PARTITION: PartitionInfo = PartitionInfo {
    name: "ota_1",
    id: PartitionId::B,
    kind: PartitionKind::App,
    offset: 0x0011_0000,
    size: 0x0010_0000,
};

pub const FLASH_SIZE: usize = IMAGE_B_PARTITION.offset + IMAGE_B_PARTITION.size;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    BootData, // holds the partition table copies
    App,      // holds an application image
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub name: &'static str, // name of the partition
    pub id: PartitionId,    // slot identifier, None for data partitions
    pub kind: PartitionKind,
    pub offset: usize, // flash partition offset in bytes
    pub size: usize,   // size in bytes
}

impl PartitionInfo {
    pub fn end(&self) -> usize {
        self.offset + self.size
    }

    pub fn overlaps(&self, other: &PartitionInfo) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// Partitions present on one flash device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashLayout {
    pub partitions: Vec<PartitionInfo>,
}

impl Default for FlashLayout {
    fn default() -> Self {
        FlashLayout {
            partitions: vec![BOOT_DATA_PARTITION, IMAGE_A_PARTITION, IMAGE_B_PARTITION],
        }
    }
}

impl FlashLayout {
    pub fn new(partitions: Vec<PartitionInfo>) -> Self {
        FlashLayout { partitions }
    }

    pub fn boot_data(&self) -> Option<&PartitionInfo> {
        self.partitions
            .iter()
            .find(|p| p.kind == PartitionKind::BootData)
    }

    pub fn app(&self, id: PartitionId) -> Option<&PartitionInfo> {
        self.apps().find(|p| p.id == id)
    }

    pub fn apps(&self) -> impl Iterator<Item = &PartitionInfo> {
        self.partitions.iter().filter(|p| p.kind == PartitionKind::App)
    }

    /// Smallest device capacity holding every partition.
    pub fn flash_size(&self) -> usize {
        self.partitions.iter().map(|p| p.end()).max().unwrap_or(0)
    }
}

pub const PARTITION_TABLE_LEN: usize = size_of::<PartitionTable>();

/// Boot record stored in each sector of the boot data partition.
///
/// The copy with a valid checksum and the highest sequence number is current.
#[repr(C)]
#[derive(Debug, Clone, FromBytes, IntoBytes, Immutable, KnownLayout, PartialEq)]
pub struct PartitionTable {
    pub sequence: U32<LittleEndian>,           // Incremented on every write
    pub boot_partition: U32<LittleEndian>,     // Valid values defined in PartitionId
    pub fallback_partition: U32<LittleEndian>, // Booted when the boot partition is rejected
    pub partition_a_state: U16<LittleEndian>,  // Valid values defined in RollbackState
    pub partition_b_state: U16<LittleEndian>,  // Valid values defined in RollbackState
    pub rollback_enable: U32<LittleEndian>,    // Valid values defined in RollbackEnable
    pub invalid_partition: U32<LittleEndian>,  // Last partition marked invalid
    pub invalid_version: [u8; VERSION_DESCRIPTOR_LEN],
    pub reserved: U32<LittleEndian>,
    pub checksum: U32<LittleEndian>,
}

impl Default for PartitionTable {
    fn default() -> Self {
        Self::new(PartitionId::A, RollbackEnable::Enabled)
    }
}

impl PartitionTable {
    pub fn new(boot_partition: PartitionId, rollback_enable: RollbackEnable) -> Self {
        PartitionTable {
            sequence: U32::new(0),
            boot_partition: U32::new(boot_partition as u32),
            fallback_partition: U32::new(PartitionId::None as u32),
            partition_a_state: U16::new(RollbackState::Undefined as u16),
            partition_b_state: U16::new(RollbackState::Undefined as u16),
            rollback_enable: U32::new(rollback_enable as u32),
            invalid_partition: U32::new(PartitionId::None as u32),
            invalid_version: [0; VERSION_DESCRIPTOR_LEN],
            reserved: U32::new(0),
            checksum: U32::new(0), // Populated before the table is written
        }
    }

    pub fn sequence(&self) -> u32 {
        self.sequence.get()
    }

    pub fn set_sequence(&mut self, sequence: u32) {
        self.sequence.set(sequence);
    }

    pub fn get_boot_partition(&self) -> PartitionId {
        PartitionId::try_from(self.boot_partition.get()).unwrap_or(PartitionId::None)
    }

    pub fn set_boot_partition(&mut self, partition: PartitionId) {
        self.boot_partition.set(partition as u32);
    }

    pub fn get_fallback_partition(&self) -> PartitionId {
        PartitionId::try_from(self.fallback_partition.get()).unwrap_or(PartitionId::None)
    }

    pub fn set_fallback_partition(&mut self, partition: PartitionId) {
        self.fallback_partition.set(partition as u32);
    }

    pub fn get_partition_state(&self, partition: PartitionId) -> RollbackState {
        // Unknown encodings are treated as rejected images.
        match partition {
            PartitionId::A => RollbackState::try_from(self.partition_a_state.get())
                .unwrap_or(RollbackState::Invalid),
            PartitionId::B => RollbackState::try_from(self.partition_b_state.get())
                .unwrap_or(RollbackState::Invalid),
            PartitionId::None => RollbackState::Invalid,
        }
    }

    pub fn set_partition_state(&mut self, partition: PartitionId, state: RollbackState) {
        match partition {
            PartitionId::A => self.partition_a_state.set(state as u16),
            PartitionId::B => self.partition_b_state.set(state as u16),
            PartitionId::None => {}
        }
    }

    pub fn is_rollback_enabled(&self) -> bool {
        self.rollback_enable.get() == RollbackEnable::Enabled as u32
    }

    pub fn set_rollback_enable(&mut self, enable: RollbackEnable) {
        self.rollback_enable.set(enable as u32);
    }

    /// The last rejected image, while its partition is still marked invalid.
    pub fn get_invalid_image(&self) -> Option<InvalidImage> {
        let partition = PartitionId::try_from(self.invalid_partition.get()).ok()?;
        if partition == PartitionId::None
            || self.get_partition_state(partition) != RollbackState::Invalid
        {
            return None;
        }
        Some(InvalidImage {
            partition,
            version: self.invalid_version,
        })
    }

    pub fn set_invalid_image(
        &mut self,
        partition: PartitionId,
        version: &[u8; VERSION_DESCRIPTOR_LEN],
    ) {
        self.invalid_partition.set(partition as u32);
        self.invalid_version = *version;
    }

    pub fn populate_checksum<C: ChecksumCalculator>(&mut self, calculator: &C) {
        let checksum = calculator.calc_checksum(&self.as_bytes()[0..offset_of!(Self, checksum)]);
        self.checksum.set(checksum);
    }

    pub fn verify_checksum<C: ChecksumCalculator>(&self, calculator: &C) -> bool {
        calculator.verify_checksum(
            self.checksum.get(),
            &self.as_bytes()[0..offset_of!(Self, checksum)],
        )
    }
}

pub trait ChecksumCalculator {
    fn calc_checksum(&self, data: &[u8]) -> u32 {
        let mut checksum = 0u32;
        for d in data {
            checksum = checksum.wrapping_add(*d as u32);
        }
        0u32.wrapping_sub(checksum)
    }
    fn verify_checksum(&self, checksum: u32, data: &[u8]) -> bool {
        self.calc_checksum(data) == checksum
    }
}

#[derive(Default)]
pub struct StandAloneChecksumCalculator;

impl ChecksumCalculator for StandAloneChecksumCalculator {}
