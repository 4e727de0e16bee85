// Licensed under the Apache-2.0 license

use crate::{
    AppDescriptor, FirmwareVersion, ImageHeader, SegmentHeader, APP_DESC_MAGIC, CHECKSUM_SEED,
    IMAGE_MAGIC,
};
use sha2::{Digest, Sha256};
use zerocopy::byteorder::{U16, U32};
use zerocopy::{FromZeros, IntoBytes};

const DROM_LOAD_ADDR: u32 = 0x3F40_0020;
const DEFAULT_ENTRY_ADDR: u32 = 0x4008_0000;

/// Assembles well-formed application images.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    version: FirmwareVersion,
    project_name: String,
    secure_version: u32,
    entry_addr: u32,
    payload: Vec<u8>,
    segments: Vec<(u32, Vec<u8>)>,
    hash_appended: bool,
}

impl ImageBuilder {
    pub fn new(version: &str) -> Self {
        ImageBuilder {
            version: FirmwareVersion::new(version),
            project_name: String::from("ota-app"),
            secure_version: 0,
            entry_addr: DEFAULT_ENTRY_ADDR,
            payload: Vec::new(),
            segments: Vec::new(),
            hash_appended: true,
        }
    }

    pub fn project_name(mut self, name: &str) -> Self {
        self.project_name = name.to_string();
        self
    }

    pub fn secure_version(mut self, secure_version: u32) -> Self {
        self.secure_version = secure_version;
        self
    }

    pub fn entry_addr(mut self, entry_addr: u32) -> Self {
        self.entry_addr = entry_addr;
        self
    }

    /// Data placed after the application descriptor in the first segment.
    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Appends another segment loaded at `load_addr`.
    pub fn segment(mut self, load_addr: u32, data: Vec<u8>) -> Self {
        self.segments.push((load_addr, data));
        self
    }

    pub fn hash_appended(mut self, hash_appended: bool) -> Self {
        self.hash_appended = hash_appended;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut first = self.descriptor().as_bytes().to_vec();
        first.extend_from_slice(&self.payload);

        let segments: Vec<(u32, &[u8])> = core::iter::once((DROM_LOAD_ADDR, first.as_slice()))
            .chain(self.segments.iter().map(|(addr, data)| (*addr, data.as_slice())))
            .collect();

        let mut header = ImageHeader::new_zeroed();
        header.magic = IMAGE_MAGIC;
        header.segment_count = segments.len() as u8;
        header.spi_mode = 2;
        header.spi_speed_size = 0x20;
        header.entry_addr = U32::new(self.entry_addr);
        header.wp_pin = 0xEE;
        header.max_chip_rev_full = U16::new(0xFFFF);
        header.hash_appended = self.hash_appended as u8;

        let mut image = header.as_bytes().to_vec();
        let mut checksum = CHECKSUM_SEED;
        for (load_addr, data) in segments {
            let mut data = data.to_vec();
            data.resize(data.len().next_multiple_of(4), 0);
            let segment = SegmentHeader {
                load_addr: U32::new(load_addr),
                data_len: U32::new(data.len() as u32),
            };
            image.extend_from_slice(segment.as_bytes());
            checksum = data.iter().fold(checksum, |acc, b| acc ^ b);
            image.extend_from_slice(&data);
        }
        while image.len() % 16 != 15 {
            image.push(0);
        }
        image.push(checksum);

        if self.hash_appended {
            let digest = Sha256::digest(&image);
            image.extend_from_slice(&digest);
        }
        image
    }

    fn descriptor(&self) -> AppDescriptor {
        let mut descriptor = AppDescriptor::new_zeroed();
        descriptor.magic_word = U32::new(APP_DESC_MAGIC);
        descriptor.secure_version = U32::new(self.secure_version);
        descriptor.version = *self.version.as_bytes();
        let name = self.project_name.as_bytes();
        let len = name.len().min(descriptor.project_name.len() - 1);
        descriptor.project_name[..len].copy_from_slice(&name[..len]);
        let sdk = concat!("ota-image ", env!("CARGO_PKG_VERSION")).as_bytes();
        descriptor.sdk_version[..sdk.len()].copy_from_slice(sdk);
        descriptor.mmu_page_size = 16;
        descriptor
    }
}
