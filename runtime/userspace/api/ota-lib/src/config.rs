// Licensed under the Apache-2.0 license

pub const DIGEST_CHUNK_SIZE: usize = 1024; // Read size when hashing a partition.
pub const READBACK_CHUNK_SIZE: usize = 1024; // Read size when validating a written image.
pub const DIAGNOSTIC_SETTLE_TIME_MS: u64 = 5000; // Default self-test duration on first boot.
