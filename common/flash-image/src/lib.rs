// Licensed under the Apache-2.0 license

//! Layout of the application image written to an update slot, and the
//! parsers that read it.
//!
//! An image is an [`ImageHeader`], followed by `segment_count` segments each
//! introduced by a [`SegmentHeader`]. The first segment starts with the
//! [`AppDescriptor`] carrying the firmware version. After the last segment the
//! image is zero padded so that a one byte XOR checksum ends on a 16 byte
//! boundary, optionally followed by the SHA-256 of everything before it.

mod builder;
mod verify;

pub use builder::ImageBuilder;
pub use verify::{ImageError, ImageInfo, ImageVerifier};

use core::fmt;
use core::mem::size_of;
use thiserror::Error;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const IMAGE_MAGIC: u8 = 0xE9;
pub const APP_DESC_MAGIC: u32 = 0xABCD_5432;
pub const APP_VERSION_LEN: usize = 32;
pub const MAX_SEGMENTS: u8 = 16;
pub const CHECKSUM_SEED: u8 = 0xEF;
pub const DIGEST_LEN: usize = 32;

pub const IMAGE_HEADER_LEN: usize = size_of::<ImageHeader>();
pub const SEGMENT_HEADER_LEN: usize = size_of::<SegmentHeader>();
pub const APP_DESC_LEN: usize = size_of::<AppDescriptor>();

/// Leading bytes needed before the version descriptor can be read.
pub const MIN_HEADER_LEN: usize = IMAGE_HEADER_LEN + SEGMENT_HEADER_LEN + APP_DESC_LEN;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ImageHeader {
    pub magic: u8,
    pub segment_count: u8,
    pub spi_mode: u8,
    pub spi_speed_size: u8,
    pub entry_addr: U32<LittleEndian>,
    pub wp_pin: u8,
    pub spi_pin_drv: [u8; 3],
    pub chip_id: U16<LittleEndian>,
    pub min_chip_rev: u8,
    pub min_chip_rev_full: U16<LittleEndian>,
    pub max_chip_rev_full: U16<LittleEndian>,
    pub reserved: [u8; 4],
    pub hash_appended: u8,
}

impl ImageHeader {
    pub fn verify(&self) -> bool {
        self.magic == IMAGE_MAGIC && self.segment_count > 0 && self.segment_count <= MAX_SEGMENTS
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SegmentHeader {
    pub load_addr: U32<LittleEndian>,
    pub data_len: U32<LittleEndian>,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct AppDescriptor {
    pub magic_word: U32<LittleEndian>,
    pub secure_version: U32<LittleEndian>,
    pub reserv1: [u8; 8],
    pub version: [u8; APP_VERSION_LEN],
    pub project_name: [u8; 32],
    pub time: [u8; 16],
    pub date: [u8; 16],
    pub sdk_version: [u8; 32],
    pub app_elf_sha256: [u8; 32],
    pub min_efuse_blk_rev_full: U16<LittleEndian>,
    pub max_efuse_blk_rev_full: U16<LittleEndian>,
    pub mmu_page_size: u8,
    pub reserv3: [u8; 3],
    pub reserv2: [u8; 72],
}

impl AppDescriptor {
    pub fn verify(&self) -> bool {
        self.magic_word.get() == APP_DESC_MAGIC
    }

    pub fn firmware_version(&self) -> FirmwareVersion {
        FirmwareVersion::from_bytes(self.version)
    }

    pub fn project_name(&self) -> String {
        c_str(&self.project_name)
    }
}

const _: () = assert!(IMAGE_HEADER_LEN == 24);
const _: () = assert!(SEGMENT_HEADER_LEN == 8);
const _: () = assert!(APP_DESC_LEN == 256);

/// Opaque version identifier embedded in every image.
///
/// Two versions are equal only when all 32 bytes are equal; there is no
/// ordering.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FirmwareVersion([u8; APP_VERSION_LEN]);

impl FirmwareVersion {
    pub const fn from_bytes(bytes: [u8; APP_VERSION_LEN]) -> Self {
        FirmwareVersion(bytes)
    }

    /// Builds a NUL padded descriptor, truncating `version` so the last byte
    /// stays NUL.
    pub fn new(version: &str) -> Self {
        let mut bytes = [0u8; APP_VERSION_LEN];
        let len = version.len().min(APP_VERSION_LEN - 1);
        bytes[..len].copy_from_slice(&version.as_bytes()[..len]);
        FirmwareVersion(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; APP_VERSION_LEN] {
        &self.0
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&c_str(&self.0))
    }
}

impl fmt::Debug for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FirmwareVersion")
            .field(&self.to_string())
            .finish()
    }
}

fn c_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("need {min} bytes to read the image header, got {len}")]
    TooShort { len: usize, min: usize },
    #[error("image header is corrupt")]
    BadImageHeader,
    #[error("application descriptor magic {0:#010x} is wrong")]
    BadDescriptorMagic(u32),
}

/// Reads the application descriptor from the leading bytes of an image.
pub fn parse_app_descriptor(buffer: &[u8]) -> Result<AppDescriptor, HeaderError> {
    if buffer.len() < MIN_HEADER_LEN {
        return Err(HeaderError::TooShort {
            len: buffer.len(),
            min: MIN_HEADER_LEN,
        });
    }
    let (header, rest) =
        ImageHeader::read_from_prefix(buffer).map_err(|_| HeaderError::BadImageHeader)?;
    header
        .verify()
        .then_some(())
        .ok_or(HeaderError::BadImageHeader)?;
    let (_segment, rest) =
        SegmentHeader::read_from_prefix(rest).map_err(|_| HeaderError::BadImageHeader)?;
    let (descriptor, _) =
        AppDescriptor::read_from_prefix(rest).map_err(|_| HeaderError::BadImageHeader)?;
    if !descriptor.verify() {
        return Err(HeaderError::BadDescriptorMagic(descriptor.magic_word.get()));
    }
    Ok(descriptor)
}

/// Extracts the firmware version from the leading bytes of an image.
pub fn parse_header(buffer: &[u8]) -> Result<FirmwareVersion, HeaderError> {
    parse_app_descriptor(buffer).map(|descriptor| descriptor.firmware_version())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_version_from_image_prefix() {
        let image = ImageBuilder::new("2.0.0").project_name("sensor").build();
        let descriptor = parse_app_descriptor(&image[..MIN_HEADER_LEN]).unwrap();
        assert_eq!(descriptor.firmware_version(), FirmwareVersion::new("2.0.0"));
        assert_eq!(descriptor.project_name(), "sensor");
        assert_eq!(parse_header(&image).unwrap().to_string(), "2.0.0");
    }

    #[test]
    fn short_buffer_is_rejected() {
        let image = ImageBuilder::new("2.0.0").build();
        assert_eq!(
            parse_header(&image[..MIN_HEADER_LEN - 1]),
            Err(HeaderError::TooShort {
                len: MIN_HEADER_LEN - 1,
                min: MIN_HEADER_LEN
            })
        );
    }

    #[test]
    fn corrupt_magic_is_rejected() {
        let mut image = ImageBuilder::new("2.0.0").build();
        image[0] = 0xFF;
        assert_eq!(parse_header(&image), Err(HeaderError::BadImageHeader));

        let mut image = ImageBuilder::new("2.0.0").build();
        image[IMAGE_HEADER_LEN + SEGMENT_HEADER_LEN] ^= 0x01;
        assert!(matches!(
            parse_header(&image),
            Err(HeaderError::BadDescriptorMagic(_))
        ));
    }

    #[test]
    fn erased_flash_has_no_version() {
        assert!(parse_header(&[0xFF; MIN_HEADER_LEN]).is_err());
    }

    #[test]
    fn version_equality_is_bytewise() {
        let a = FirmwareVersion::new("1.0.0");
        let mut raw = *a.as_bytes();
        assert_eq!(a, FirmwareVersion::from_bytes(raw));
        raw[31] = 1;
        let b = FirmwareVersion::from_bytes(raw);
        assert_ne!(a, b);
        assert_eq!(a.to_string(), b.to_string());
    }

    #[test]
    fn long_version_is_truncated() {
        let version = FirmwareVersion::new(&"9".repeat(40));
        assert_eq!(version.to_string().len(), APP_VERSION_LEN - 1);
    }
}
