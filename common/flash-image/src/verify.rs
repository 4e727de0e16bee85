// Licensed under the Apache-2.0 license

use crate::{
    AppDescriptor, FirmwareVersion, HeaderError, ImageHeader, SegmentHeader, APP_DESC_LEN,
    CHECKSUM_SEED, DIGEST_LEN, IMAGE_HEADER_LEN, SEGMENT_HEADER_LEN,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zerocopy::FromBytes;

/// Upper bound on a single segment, matching the largest mappable flash window.
const MAX_SEGMENT_LEN: u32 = 16 * 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error("segment {index} has invalid length {len:#x}")]
    SegmentLength { index: u8, len: u32 },
    #[error("checksum mismatch: stored {stored:#04x}, computed {computed:#04x}")]
    Checksum { stored: u8, computed: u8 },
    #[error("appended SHA-256 does not match the image")]
    Digest,
    #[error("image ends after {0} bytes")]
    Truncated(u64),
    #[error("{0} bytes follow the end of the image")]
    TrailingData(usize),
}

/// Result of a successful integrity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub version: FirmwareVersion,
    pub secure_version: u32,
    pub segments: u8,
    /// Total length including checksum and appended digest.
    pub size: u64,
    /// SHA-256 over the image up to and including the checksum byte.
    pub digest: [u8; DIGEST_LEN],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    ImageHeader,
    SegmentHeader,
    SegmentData,
    Padding,
    Checksum,
    Digest,
    Done,
}

/// Incremental integrity check of an image.
///
/// Bytes may be fed in arbitrary pieces; [`ImageVerifier::finish`] reports
/// whether they formed exactly one well-formed image.
pub struct ImageVerifier {
    stage: Stage,
    needed: usize,
    scratch: Vec<u8>,
    hasher: Sha256,
    checksum: u8,
    position: u64,
    hash_appended: bool,
    segment_count: u8,
    segment_index: u8,
    descriptor: Option<AppDescriptor>,
}

impl Default for ImageVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageVerifier {
    pub fn new() -> Self {
        ImageVerifier {
            stage: Stage::ImageHeader,
            needed: IMAGE_HEADER_LEN,
            scratch: Vec::with_capacity(APP_DESC_LEN),
            hasher: Sha256::new(),
            checksum: CHECKSUM_SEED,
            position: 0,
            hash_appended: false,
            segment_count: 0,
            segment_index: 0,
            descriptor: None,
        }
    }

    pub fn update(&mut self, mut data: &[u8]) -> Result<(), ImageError> {
        while !data.is_empty() {
            if self.stage == Stage::Done {
                return Err(ImageError::TrailingData(data.len()));
            }
            let take = data.len().min(self.needed);
            let (span, rest) = data.split_at(take);
            if self.stage != Stage::Digest {
                self.hasher.update(span);
            }
            self.consume(span);
            self.position += take as u64;
            self.needed -= take;
            data = rest;
            if self.needed == 0 {
                self.advance()?;
            }
        }
        Ok(())
    }

    pub fn finish(self) -> Result<ImageInfo, ImageError> {
        if self.stage != Stage::Done {
            return Err(ImageError::Truncated(self.position));
        }
        let digest: [u8; DIGEST_LEN] = self.hasher.finalize().into();
        if self.hash_appended && self.scratch[..] != digest[..] {
            return Err(ImageError::Digest);
        }
        let descriptor = self.descriptor.ok_or(ImageError::Truncated(self.position))?;
        Ok(ImageInfo {
            version: descriptor.firmware_version(),
            secure_version: descriptor.secure_version.get(),
            segments: self.segment_count,
            size: self.position,
            digest,
        })
    }

    fn consume(&mut self, span: &[u8]) {
        match self.stage {
            Stage::ImageHeader | Stage::SegmentHeader | Stage::Checksum | Stage::Digest => {
                self.scratch.extend_from_slice(span)
            }
            Stage::SegmentData => {
                self.checksum = span.iter().fold(self.checksum, |acc, b| acc ^ b);
                if self.segment_index == 0 && self.scratch.len() < APP_DESC_LEN {
                    let want = (APP_DESC_LEN - self.scratch.len()).min(span.len());
                    self.scratch.extend_from_slice(&span[..want]);
                }
            }
            Stage::Padding | Stage::Done => {}
        }
    }

    fn enter(&mut self, stage: Stage, needed: usize) {
        self.scratch.clear();
        self.stage = stage;
        self.needed = needed;
    }

    fn advance(&mut self) -> Result<(), ImageError> {
        match self.stage {
            Stage::ImageHeader => {
                let header = ImageHeader::read_from_bytes(&self.scratch)
                    .map_err(|_| HeaderError::BadImageHeader)?;
                if !header.verify() {
                    return Err(HeaderError::BadImageHeader.into());
                }
                self.segment_count = header.segment_count;
                self.hash_appended = header.hash_appended == 1;
                self.enter(Stage::SegmentHeader, SEGMENT_HEADER_LEN);
            }
            Stage::SegmentHeader => {
                let segment = SegmentHeader::read_from_bytes(&self.scratch)
                    .map_err(|_| HeaderError::BadImageHeader)?;
                let len = segment.data_len.get();
                let too_small = self.segment_index == 0 && (len as usize) < APP_DESC_LEN;
                if len == 0 || len % 4 != 0 || len > MAX_SEGMENT_LEN || too_small {
                    return Err(ImageError::SegmentLength {
                        index: self.segment_index,
                        len,
                    });
                }
                self.enter(Stage::SegmentData, len as usize);
            }
            Stage::SegmentData => {
                if self.segment_index == 0 {
                    let descriptor = AppDescriptor::read_from_bytes(&self.scratch)
                        .map_err(|_| HeaderError::BadImageHeader)?;
                    if !descriptor.verify() {
                        return Err(
                            HeaderError::BadDescriptorMagic(descriptor.magic_word.get()).into()
                        );
                    }
                    self.descriptor = Some(descriptor);
                }
                self.segment_index += 1;
                if self.segment_index < self.segment_count {
                    self.enter(Stage::SegmentHeader, SEGMENT_HEADER_LEN);
                } else {
                    // The checksum byte sits at the last offset of a 16 byte block.
                    let padding = 15 - (self.position % 16) as usize;
                    if padding > 0 {
                        self.enter(Stage::Padding, padding);
                    } else {
                        self.enter(Stage::Checksum, 1);
                    }
                }
            }
            Stage::Padding => self.enter(Stage::Checksum, 1),
            Stage::Checksum => {
                let stored = self.scratch[0];
                if stored != self.checksum {
                    return Err(ImageError::Checksum {
                        stored,
                        computed: self.checksum,
                    });
                }
                if self.hash_appended {
                    self.enter(Stage::Digest, DIGEST_LEN);
                } else {
                    self.enter(Stage::Done, 0);
                }
            }
            Stage::Digest => {
                // Keep the collected digest in scratch for finish().
                self.stage = Stage::Done;
            }
            Stage::Done => {}
        }
        Ok(())
    }
}
